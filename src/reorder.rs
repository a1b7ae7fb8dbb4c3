//! Node ordering algorithms for sparse matrices.
//!
//! Orderings are computed from the block sparsity pattern of the local
//! matrix and applied before numbering nodes. All algorithms here are
//! deterministic: ties are broken by vertex index, never by hash or
//! scheduling order, so repeated runs on the same pattern yield the same
//! permutation on every rank.
use core::fmt;
use serde::{Deserialize, Serialize};
use sleipnir_sparse::SparsityPattern;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeSet, VecDeque};
use std::error::Error;

/// A representation of an index permutation.
///
/// Given `n` objects stored contiguously, the permutation internally stores
/// an array `perm` such that for *target index* `i` in `0 .. n`, the
/// corresponding *source index* is given by
///
/// ```ignore
/// target[i] = source[perm[i]]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permutation {
    perm: Vec<usize>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InvalidPermutation;

impl fmt::Display for InvalidPermutation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid permutation")
    }
}

impl Error for InvalidPermutation {}

impl Permutation {
    pub fn from_vec(perm: Vec<usize>) -> Result<Self, InvalidPermutation> {
        let mut visited = vec![false; perm.len()];
        for &index in &perm {
            if index >= perm.len() || visited[index] {
                return Err(InvalidPermutation);
            }
            visited[index] = true;
        }
        Ok(Self { perm })
    }

    pub fn identity(len: usize) -> Self {
        Self {
            perm: (0..len).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    pub fn perm(&self) -> &[usize] {
        &self.perm
    }

    pub fn reverse(&mut self) {
        self.perm.reverse()
    }

    pub fn source_index(&self, target_index: usize) -> usize {
        self.perm[target_index]
    }

    pub fn inverse(&self) -> Permutation {
        let mut inverse_perm = vec![usize::MAX; self.len()];
        for (target_idx, &source_idx) in self.perm().iter().enumerate() {
            inverse_perm[source_idx] = target_idx;
        }
        Self::from_vec(inverse_perm).expect("Internal error: Constructed permutation is invalid")
    }

    pub fn apply_to_slice<T: Clone>(&self, slice: &[T]) -> Vec<T> {
        assert_eq!(slice.len(), self.len(), "Slice and permutation must have the same size.");
        self.perm()
            .iter()
            .map(|source_idx| slice[*source_idx].clone())
            .collect()
    }
}

/// The node ordering policies accepted by the assembler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOrdering {
    /// Keep nodes in their given order.
    Natural,
    /// Reverse Cuthill-McKee, reducing matrix bandwidth.
    ReverseCuthillMcKee,
    /// Greedy minimum-degree elimination ordering, reducing factorization
    /// fill.
    MinimumDegree,
    /// Recursive separator-based ordering; separators are numbered last.
    NestedDissection,
    /// Greedy coloring with nodes grouped by color, so that nodes within a
    /// group share no matrix entries.
    Multicolor,
}

impl Default for NodeOrdering {
    fn default() -> Self {
        NodeOrdering::Natural
    }
}

impl NodeOrdering {
    /// Computes the permutation realizing this policy for a symmetric
    /// sparsity pattern.
    pub fn compute_permutation(&self, pattern: &SparsityPattern) -> Permutation {
        match self {
            NodeOrdering::Natural => Permutation::identity(pattern.major_dim()),
            NodeOrdering::ReverseCuthillMcKee => reverse_cuthill_mckee(pattern),
            NodeOrdering::MinimumDegree => minimum_degree(pattern),
            NodeOrdering::NestedDissection => nested_dissection(pattern),
            NodeOrdering::Multicolor => multicolor(pattern),
        }
    }
}

fn assert_square(pattern: &SparsityPattern) {
    assert_eq!(pattern.major_dim(), pattern.minor_dim(), "Matrix must be square.");
}

/// Create a vertex permutation for a sparse symmetric matrix using the
/// Cuthill-McKee algorithm.
pub fn cuthill_mckee(sparsity_pattern: &SparsityPattern) -> Permutation {
    assert_square(sparsity_pattern);
    let n = sparsity_pattern.major_dim();
    let adjacent_vertices = |vertex_idx: usize| sparsity_pattern.lane(vertex_idx);
    let vertex_degree = |vertex_idx: usize| adjacent_vertices(vertex_idx).len();

    let mut queue = VecDeque::new();
    let mut permutation = Vec::with_capacity(n);
    let mut visited = vec![false; n];
    let mut adjacency_workspace = Vec::new();

    // Patterns with zero rows or block-diagonal structure are disconnected,
    // so a single breadth-first sweep does not reach every vertex. We restart
    // from the unvisited vertex of least degree until all are numbered.
    while permutation.len() < n {
        let start_vertex = (0..n)
            .filter(|&vertex_idx| !visited[vertex_idx])
            .min_by_key(|&vertex_idx| (vertex_degree(vertex_idx), vertex_idx));

        if let Some(start_vertex) = start_vertex {
            queue.push_back(start_vertex);
            visited[start_vertex] = true;

            // Cuthill-McKee is a breadth-first search in which neighbors are
            // visited from lowest to highest vertex degree, ties by index.
            while let Some(vertex) = queue.pop_front() {
                adjacency_workspace.clear();
                adjacency_workspace.extend_from_slice(adjacent_vertices(vertex));
                adjacency_workspace.sort_unstable_by_key(|&idx| (vertex_degree(idx), idx));

                permutation.push(vertex);

                for &adjacent_vertex in &adjacency_workspace {
                    if !visited[adjacent_vertex] {
                        visited[adjacent_vertex] = true;
                        queue.push_back(adjacent_vertex);
                    }
                }
            }
        }
    }

    Permutation::from_vec(permutation).expect("Internal error: Constructed permutation is invalid")
}

/// Create a vertex permutation for a sparse symmetric matrix using the
/// Reverse Cuthill-McKee (RCM) algorithm.
pub fn reverse_cuthill_mckee(sparsity_pattern: &SparsityPattern) -> Permutation {
    let mut perm = cuthill_mckee(sparsity_pattern);
    perm.reverse();
    perm
}

/// Create a fill-reducing permutation by greedy minimum-degree elimination.
///
/// At every step the vertex of least remaining degree is eliminated and its
/// neighbors joined into a clique. Degrees are exact, not approximated, and
/// ties are broken by vertex index.
pub fn minimum_degree(sparsity_pattern: &SparsityPattern) -> Permutation {
    assert_square(sparsity_pattern);
    let n = sparsity_pattern.major_dim();

    let mut adjacency: Vec<BTreeSet<usize>> = (0..n)
        .map(|vertex| {
            sparsity_pattern
                .lane(vertex)
                .iter()
                .copied()
                .filter(|&other| other != vertex)
                .collect()
        })
        .collect();

    // Lazily updated heap: every degree change pushes a fresh entry, and
    // entries whose degree no longer matches are skipped on pop.
    let mut heap = BinaryHeap::with_capacity(n);
    for vertex in 0..n {
        heap.push(Reverse((adjacency[vertex].len(), vertex)));
    }

    let mut eliminated = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut neighbors = Vec::new();

    while let Some(Reverse((degree, vertex))) = heap.pop() {
        if eliminated[vertex] || degree != adjacency[vertex].len() {
            continue;
        }
        eliminated[vertex] = true;
        order.push(vertex);

        neighbors.clear();
        neighbors.extend(adjacency[vertex].iter().copied());
        for (i, &a) in neighbors.iter().enumerate() {
            adjacency[a].remove(&vertex);
            for &b in &neighbors[i + 1..] {
                if adjacency[a].insert(b) {
                    adjacency[b].insert(a);
                }
            }
        }
        for &a in &neighbors {
            heap.push(Reverse((adjacency[a].len(), a)));
        }
    }

    Permutation::from_vec(order).expect("Internal error: Constructed permutation is invalid")
}

/// Subgraphs smaller than this are ordered by minimum degree directly.
const DISSECTION_BASE_SIZE: usize = 32;

/// Create a fill-reducing permutation by recursive nested dissection.
///
/// Each level splits the graph along a breadth-first level-set separator
/// found from a pseudo-peripheral vertex; the halves are ordered recursively
/// and the separator vertices are numbered last.
pub fn nested_dissection(sparsity_pattern: &SparsityPattern) -> Permutation {
    assert_square(sparsity_pattern);
    let n = sparsity_pattern.major_dim();
    if n <= DISSECTION_BASE_SIZE {
        return minimum_degree(sparsity_pattern);
    }

    let components = connected_components(sparsity_pattern);
    let mut order = Vec::with_capacity(n);
    if components.len() > 1 {
        for component in &components {
            let sub = induced_subpattern(sparsity_pattern, component);
            let sub_perm = nested_dissection(&sub);
            order.extend(sub_perm.perm().iter().map(|&local| component[local]));
        }
        return Permutation::from_vec(order).expect("Internal error: Constructed permutation is invalid");
    }

    // Level sets from a pseudo-peripheral vertex; the middle level separates
    // the graph since breadth-first neighbors differ by at most one level.
    let start = pseudo_peripheral_vertex(sparsity_pattern);
    let levels = bfs_levels(sparsity_pattern, start);
    let max_level = levels.iter().copied().max().unwrap_or(0);
    let mid = max_level / 2;

    let mut lower = Vec::new();
    let mut upper = Vec::new();
    let mut separator = Vec::new();
    for vertex in 0..n {
        match levels[vertex].cmp(&mid) {
            std::cmp::Ordering::Less => lower.push(vertex),
            std::cmp::Ordering::Greater => upper.push(vertex),
            std::cmp::Ordering::Equal => separator.push(vertex),
        }
    }

    for half in [&lower, &upper] {
        if half.is_empty() {
            continue;
        }
        let sub = induced_subpattern(sparsity_pattern, half);
        let sub_perm = nested_dissection(&sub);
        order.extend(sub_perm.perm().iter().map(|&local| half[local]));
    }
    order.extend(&separator);

    Permutation::from_vec(order).expect("Internal error: Constructed permutation is invalid")
}

/// Create a permutation grouping vertices by greedy coloring.
///
/// Vertices are colored in index order with the smallest color unused by any
/// neighbor, then numbered color by color. Vertices sharing a color are
/// structurally independent, which permits updating them concurrently.
pub fn multicolor(sparsity_pattern: &SparsityPattern) -> Permutation {
    assert_square(sparsity_pattern);
    let n = sparsity_pattern.major_dim();
    let mut color = vec![usize::MAX; n];
    let mut stamp: Vec<usize> = Vec::new();

    for vertex in 0..n {
        for &other in sparsity_pattern.lane(vertex) {
            if other != vertex && color[other] != usize::MAX {
                let used = color[other];
                if used >= stamp.len() {
                    stamp.resize(used + 1, usize::MAX);
                }
                stamp[used] = vertex;
            }
        }
        let mut candidate = 0;
        while candidate < stamp.len() && stamp[candidate] == vertex {
            candidate += 1;
        }
        color[vertex] = candidate;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&vertex| (color[vertex], vertex));
    Permutation::from_vec(order).expect("Internal error: Constructed permutation is invalid")
}

/// Breadth-first levels from `start`; unreachable vertices keep `usize::MAX`.
fn bfs_levels(pattern: &SparsityPattern, start: usize) -> Vec<usize> {
    let mut levels = vec![usize::MAX; pattern.major_dim()];
    let mut queue = VecDeque::new();
    levels[start] = 0;
    queue.push_back(start);
    while let Some(vertex) = queue.pop_front() {
        for &other in pattern.lane(vertex) {
            if levels[other] == usize::MAX {
                levels[other] = levels[vertex] + 1;
                queue.push_back(other);
            }
        }
    }
    levels
}

/// A vertex approximately maximizing graph eccentricity, found by two
/// breadth-first sweeps from the vertex of least degree.
fn pseudo_peripheral_vertex(pattern: &SparsityPattern) -> usize {
    let n = pattern.major_dim();
    let first = (0..n)
        .min_by_key(|&vertex| (pattern.lane(vertex).len(), vertex))
        .expect("Internal error: Pattern cannot be empty here.");
    let levels = bfs_levels(pattern, first);
    (0..n)
        .filter(|&vertex| levels[vertex] != usize::MAX)
        .max_by_key(|&vertex| (levels[vertex], Reverse(vertex)))
        .expect("Internal error: Breadth-first search must reach the start vertex.")
}

/// Connected components in order of discovery; each component's vertices are
/// ascending.
fn connected_components(pattern: &SparsityPattern) -> Vec<Vec<usize>> {
    let n = pattern.major_dim();
    let mut component_of = vec![usize::MAX; n];
    let mut components = Vec::new();
    let mut queue = VecDeque::new();
    for root in 0..n {
        if component_of[root] != usize::MAX {
            continue;
        }
        let id = components.len();
        let mut members = vec![root];
        component_of[root] = id;
        queue.push_back(root);
        while let Some(vertex) = queue.pop_front() {
            for &other in pattern.lane(vertex) {
                if component_of[other] == usize::MAX {
                    component_of[other] = id;
                    members.push(other);
                    queue.push_back(other);
                }
            }
        }
        members.sort_unstable();
        components.push(members);
    }
    components
}

/// The sparsity pattern induced by `subset` (sorted ascending), with vertices
/// renumbered to `0 .. subset.len()`.
fn induced_subpattern(pattern: &SparsityPattern, subset: &[usize]) -> SparsityPattern {
    let mut local_of = vec![usize::MAX; pattern.major_dim()];
    for (local, &global) in subset.iter().enumerate() {
        local_of[global] = local;
    }
    let mut offsets = Vec::with_capacity(subset.len() + 1);
    let mut indices = Vec::new();
    offsets.push(0);
    for &global in subset {
        for &other in pattern.lane(global) {
            if local_of[other] != usize::MAX {
                indices.push(local_of[other]);
            }
        }
        offsets.push(indices.len());
    }
    SparsityPattern::try_from_offsets_and_indices(subset.len(), subset.len(), offsets, indices)
        .expect("Internal error: Induced pattern must be valid.")
}

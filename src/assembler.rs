//! The distributed assembler: mesh topology, node numbering and element
//! loops.
//!
//! An `Assembler` owns the rank-local portion of the mesh: the element
//! connectivity in the mesh's original node numbering, the element models,
//! dependent-node constraints and boundary conditions. Its collective
//! [`initialize`](Assembler::initialize) classifies every referenced node as
//! interior or coupling, assigns ownership, renumbers the owned nodes with
//! the configured fill-reducing ordering (coupling nodes last) and freezes
//! the topology. After that the assembler acts as a factory for vectors and
//! matrices sharing one layout, and drives the element loops that fill them.
//!
//! Lifecycle: `Created` (no topology) → `ConnectivitySet` (connectivity and
//! elements assigned, constraints and boundary conditions may still be
//! added) → `Initialized` (layout frozen; only coordinates and state values
//! may change). Topology mutations after `initialize` fail with a
//! configuration error, which is what guarantees that every vector and
//! matrix created from one assembler can be combined freely.
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::Arc;

use eyre::WrapErr;
use log::{debug, warn};
use nalgebra::{DMatrix, Point3, Vector3};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use thread_local::ThreadLocal;

use crate::comm::Communicator;
use crate::distribute::{SetOp, VecIndices, VectorDistributor};
use crate::element::ElementModel;
use crate::error::Error;
use crate::node_map::NodeMap;
use crate::reorder::NodeOrdering;
use crate::schur::{NodeSlot, SchurLayout, SchurMatrix};
use crate::vector::DistVector;
use crate::Real;
use sleipnir_sparse::SparsityPattern;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Stage {
    Created,
    ConnectivitySet,
    Initialized,
}

/// A connectivity entry after dependent-node resolution: either a position
/// in the sorted referenced-node list, or an entry of the dependent table.
#[derive(Debug, Copy, Clone)]
enum ElemNodeRef {
    Independent(usize),
    Dependent(usize),
}

struct BoundaryCondition<T> {
    node: usize,
    dofs: Vec<usize>,
    values: Vec<T>,
}

/// Everything derived by `initialize`.
struct Initialized<T>
where
    T: Real + Send,
{
    map: Arc<NodeMap>,
    layout: Arc<SchurLayout<T>>,
    vec_external: Arc<VecIndices>,
    vec_dist: Arc<VectorDistributor<T>>,
    /// Owned plus external nodes.
    num_local: usize,
    /// Sorted original ids of the independent nodes local elements touch.
    referenced: Vec<usize>,
    new_global_of_ref: Vec<usize>,
    /// Position of each referenced node in the local vector buffer.
    vec_slot_of_ref: Vec<usize>,
    mat_slot_of_ref: Vec<NodeSlot>,
    conn_refs: Vec<ElemNodeRef>,
    /// Masters of each dependent as (referenced position, weight).
    dependent_masters: Vec<Vec<(usize, T)>>,
    bc_interior_mask: Vec<u32>,
    bc_coupling_mask: Vec<u32>,
    /// Prescribed values of owned constrained dofs, by flat owned index.
    bc_values: Vec<(usize, T)>,
    coordinates: Vec<Point3<T>>,
    coordinates_set: bool,
    u: Vec<T>,
    u_dot: Vec<T>,
    u_ddot: Vec<T>,
    scratch: ThreadLocal<RefCell<Scratch<T>>>,
}

struct Scratch<T: nalgebra::Scalar> {
    coords: Vec<Point3<T>>,
    u: Vec<T>,
    u_dot: Vec<T>,
    u_ddot: Vec<T>,
}

struct ElementContribution<T> {
    residual: Vec<T>,
    jacobian: DMatrix<T>,
}

/// Local input that must be validated before the first collective call.
struct LocalSetup<T> {
    dep_index: FxHashMap<usize, usize>,
    referenced: Vec<usize>,
    used_dependents: Vec<bool>,
    dependent_ids: Vec<usize>,
    bc_masks: FxHashMap<usize, u32>,
    bc_value_of: FxHashMap<(usize, usize), T>,
    bc_flat: Vec<usize>,
}

pub struct Assembler<T>
where
    T: Real + Send,
{
    comm: Arc<dyn Communicator<T>>,
    dofs_per_node: usize,
    ordering: NodeOrdering,
    pool: Option<rayon::ThreadPool>,
    conn_ptr: Vec<usize>,
    conn_nodes: Vec<usize>,
    models: Vec<ElementModel<T>>,
    element_models: Vec<usize>,
    dependents: Vec<(usize, Vec<(usize, T)>)>,
    bcs: Vec<BoundaryCondition<T>>,
    stage: Stage,
    init: Option<Initialized<T>>,
}

impl<T> Assembler<T>
where
    T: Real + Send + Sync,
{
    pub fn new(comm: Arc<dyn Communicator<T>>, dofs_per_node: usize) -> Self {
        assert!(dofs_per_node > 0, "Degrees of freedom per node must be positive.");
        Self {
            comm,
            dofs_per_node,
            ordering: NodeOrdering::Natural,
            pool: None,
            conn_ptr: vec![0],
            conn_nodes: Vec::new(),
            models: Vec::new(),
            element_models: Vec::new(),
            dependents: Vec::new(),
            bcs: Vec::new(),
            stage: Stage::Created,
            init: None,
        }
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator<T>> {
        &self.comm
    }

    pub fn dofs_per_node(&self) -> usize {
        self.dofs_per_node
    }

    pub fn num_elements(&self) -> usize {
        self.conn_ptr.len() - 1
    }

    /// Sets the rank-local element connectivity in the mesh's original node
    /// numbering, as offsets into a flat node index array. The element sets
    /// of the ranks must be disjoint.
    pub fn set_element_connectivity(&mut self, offsets: Vec<usize>, nodes: Vec<usize>) -> Result<(), Error> {
        match self.stage {
            Stage::Initialized => {
                return Err(Error::configuration("element connectivity cannot change after initialize"))
            }
            Stage::ConnectivitySet => return Err(Error::configuration("element connectivity is already set")),
            Stage::Created => {}
        }
        if offsets.first() != Some(&0) || offsets.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(Error::configuration(
                "connectivity offsets must start at zero and be non-decreasing",
            ));
        }
        let total = *offsets.last().expect("Internal error: offsets checked non-empty.");
        if total != nodes.len() {
            return Err(Error::dimension_mismatch(format!(
                "connectivity offsets end at {}, but {} node indices were given",
                total,
                nodes.len()
            )));
        }
        self.conn_ptr = offsets;
        self.conn_nodes = nodes;
        self.stage = Stage::ConnectivitySet;
        Ok(())
    }

    /// Assigns an element model to every element: `models` lists the
    /// distinct models, `element_models[e]` picks the model of element `e`.
    pub fn set_elements(&mut self, models: Vec<ElementModel<T>>, element_models: Vec<usize>) -> Result<(), Error> {
        match self.stage {
            Stage::Initialized => return Err(Error::configuration("elements cannot change after initialize")),
            Stage::Created => {
                return Err(Error::configuration("element connectivity must be set before elements"))
            }
            Stage::ConnectivitySet => {}
        }
        if element_models.len() != self.num_elements() {
            return Err(Error::dimension_mismatch(format!(
                "{} model assignments for {} elements",
                element_models.len(),
                self.num_elements()
            )));
        }
        for (element, &model_idx) in element_models.iter().enumerate() {
            let model = models.get(model_idx).ok_or_else(|| {
                Error::configuration(format!(
                    "element {} references model {}, but only {} models were given",
                    element,
                    model_idx,
                    models.len()
                ))
            })?;
            if model.dofs_per_node() != self.dofs_per_node {
                return Err(Error::configuration(format!(
                    "model {} has {} degrees of freedom per node, the assembler was created with {}",
                    model_idx,
                    model.dofs_per_node(),
                    self.dofs_per_node
                )));
            }
            let num_nodes = self.conn_ptr[element + 1] - self.conn_ptr[element];
            if num_nodes != model.num_nodes() {
                return Err(Error::dimension_mismatch(format!(
                    "element {} has {} nodes, its model expects {}",
                    element,
                    num_nodes,
                    model.num_nodes()
                )));
            }
        }
        self.models = models;
        self.element_models = element_models;
        Ok(())
    }

    /// Declares dependent nodes: each entry `(node, masters)` defines the
    /// node as the weighted combination of its master nodes. Dependent nodes
    /// never become unknowns; their contributions are folded onto the
    /// masters during assembly. Replaces any earlier declaration.
    pub fn set_dependent_nodes(&mut self, dependents: Vec<(usize, Vec<(usize, T)>)>) -> Result<(), Error> {
        self.check_topology_mutable()?;
        self.dependents = dependents;
        Ok(())
    }

    /// Adds Dirichlet conditions for the given degrees of freedom of a node,
    /// with one prescribed value per dof.
    ///
    /// Every rank whose elements reference the node must add the same
    /// conditions; `initialize` verifies this and fails otherwise.
    pub fn add_boundary_conditions(&mut self, node: usize, dofs: &[usize], values: &[T]) -> Result<(), Error> {
        self.check_topology_mutable()?;
        if dofs.len() != values.len() {
            return Err(Error::dimension_mismatch(format!(
                "{} prescribed values for {} constrained dofs",
                values.len(),
                dofs.len()
            )));
        }
        if self.dofs_per_node > 32 {
            return Err(Error::configuration(
                "boundary conditions support at most 32 degrees of freedom per node",
            ));
        }
        for &dof in dofs {
            if dof >= self.dofs_per_node {
                return Err(Error::IndexOutOfRange {
                    index: dof,
                    bound: self.dofs_per_node,
                });
            }
        }
        self.bcs.push(BoundaryCondition {
            node,
            dofs: dofs.to_vec(),
            values: values.to_vec(),
        });
        Ok(())
    }

    /// Selects the node ordering applied to the interior and owned coupling
    /// node sets during `initialize`.
    pub fn set_ordering(&mut self, ordering: NodeOrdering) -> Result<(), Error> {
        self.check_topology_mutable()?;
        self.ordering = ordering;
        Ok(())
    }

    /// Sets the number of threads used for element computation. With one
    /// thread the element loop runs on the calling thread; results are
    /// independent of the thread count either way.
    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<(), Error> {
        if num_threads <= 1 {
            self.pool = None;
            return Ok(());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|err| Error::configuration(format!("failed to build the assembly thread pool: {}", err)))?;
        self.pool = Some(pool);
        Ok(())
    }

    fn check_topology_mutable(&self) -> Result<(), Error> {
        if self.stage == Stage::Initialized {
            return Err(Error::configuration("topology is frozen after initialize"));
        }
        Ok(())
    }

    fn initialized(&self) -> Result<&Initialized<T>, Error> {
        self.init
            .as_ref()
            .ok_or_else(|| Error::configuration("assembler is not initialized"))
    }

    /// Classifies and renumbers nodes, freezes the topology and builds the
    /// shared layout of all vectors and matrices of this assembler.
    ///
    /// Collective; every rank of the communicator group must call it at the
    /// same point. Invalid local input is exchanged as a failure flag first,
    /// so a configuration error on one rank surfaces as an error on every
    /// rank instead of a hang.
    pub fn initialize(&mut self) -> Result<(), Error> {
        match self.stage {
            Stage::Initialized => return Err(Error::configuration("assembler is already initialized")),
            Stage::Created => {
                return Err(Error::configuration("element connectivity must be set before initialize"))
            }
            Stage::ConnectivitySet => {}
        }
        let rank = self.comm.rank();
        let size = self.comm.size();
        let bs = self.dofs_per_node;
        let num_elements = self.num_elements();

        let local = self.prepare_local();
        self.exchange_error_flag(local.as_ref().err().cloned())?;
        let LocalSetup {
            dep_index,
            referenced,
            used_dependents,
            dependent_ids,
            bc_masks,
            bc_value_of,
            bc_flat,
        } = local?;

        // Cross-rank classification: a node referenced by two or more ranks
        // is a coupling node; its owner is the lowest referencing rank.
        let gathered = self.comm.all_gather_indices(&referenced);
        let mut info: FxHashMap<usize, (usize, usize)> = FxHashMap::default();
        for (peer, list) in gathered.iter().enumerate() {
            for &node in list {
                // Lists arrive in rank order, so the first insert wins the
                // ownership of coupling nodes.
                let entry = info.entry(node).or_insert((0, peer));
                entry.0 += 1;
            }
        }
        let gathered_deps = self.comm.all_gather_indices(&dependent_ids);
        let gathered_bcs = self.comm.all_gather_indices(&bc_flat);
        let check = check_gathered_consistency(rank, &referenced, &bc_masks, &info, &gathered_deps, &gathered_bcs);
        self.exchange_error_flag(check.err())?;

        let mut num_interior_of = vec![0usize; size];
        let mut num_coupling_of = vec![0usize; size];
        for &(refs, owner) in info.values() {
            if refs > 1 {
                num_coupling_of[owner] += 1;
            } else {
                num_interior_of[owner] += 1;
            }
        }
        let counts: Vec<usize> = (0..size).map(|r| num_interior_of[r] + num_coupling_of[r]).collect();
        let map = Arc::new(NodeMap::from_counts(&counts));
        let own_range = map.ownership_range(rank);
        let num_owned = own_range.len();
        let ni = num_interior_of[rank];

        let mut interior_orig = Vec::with_capacity(ni);
        let mut coupling_orig = Vec::with_capacity(num_owned - ni);
        for &node in &referenced {
            let (refs, owner) = info[&node];
            if owner == rank {
                if refs > 1 {
                    coupling_orig.push(node);
                } else {
                    interior_orig.push(node);
                }
            }
        }

        // Renumber the two owned subsets independently; coupling nodes take
        // the tail of the owned range so the interface block is contiguous.
        let interior_perm = self.ordering.compute_permutation(&self.subset_adjacency(&interior_orig, &dep_index));
        let coupling_perm = self.ordering.compute_permutation(&self.subset_adjacency(&coupling_orig, &dep_index));
        let mut new_of_orig: FxHashMap<usize, usize> = FxHashMap::default();
        for target in 0..interior_orig.len() {
            new_of_orig.insert(interior_orig[interior_perm.source_index(target)], own_range.start + target);
        }
        for target in 0..coupling_orig.len() {
            new_of_orig.insert(
                coupling_orig[coupling_perm.source_index(target)],
                own_range.start + ni + target,
            );
        }

        // Every rank publishes the new ids of its owned coupling nodes; the
        // replicated pairs resolve all cross-rank references.
        let mut pairs = Vec::with_capacity(coupling_orig.len() * 2);
        for &node in &coupling_orig {
            pairs.push(node);
            pairs.push(new_of_orig[&node]);
        }
        let gathered_pairs = self.comm.all_gather_indices(&pairs);
        let mut coupling_new_of: FxHashMap<usize, usize> = FxHashMap::default();
        for list in &gathered_pairs {
            for pair in list.chunks_exact(2) {
                coupling_new_of.insert(pair[0], pair[1]);
            }
        }

        // All coupling new ids sit in known tail ranges, ascending with
        // rank, so the replicated interface list needs no communication.
        let mut coupling_global_ids = Vec::new();
        for r in 0..size {
            let range = map.ownership_range(r);
            coupling_global_ids.extend(range.start + num_interior_of[r]..range.end);
        }
        let coupling_global = VecIndices::new(coupling_global_ids);

        let mut external_ids = Vec::new();
        let mut local_coupling_ids: Vec<usize> = (own_range.start + ni..own_range.end).collect();
        for &node in &referenced {
            let (_, owner) = info[&node];
            if owner != rank {
                let new = *coupling_new_of
                    .get(&node)
                    .expect("Internal error: external coupling node has no published new id.");
                external_ids.push(new);
                local_coupling_ids.push(new);
            }
        }
        let vec_external = Arc::new(VecIndices::new(external_ids));
        let local_coupling = VecIndices::new(local_coupling_ids);

        // Per-node translation tables for the assembly loops.
        let mut new_global_of_ref = Vec::with_capacity(referenced.len());
        let mut vec_slot_of_ref = Vec::with_capacity(referenced.len());
        let mut mat_slot_of_ref = Vec::with_capacity(referenced.len());
        for &node in &referenced {
            let (_, owner) = info[&node];
            let new = if owner == rank {
                new_of_orig[&node]
            } else {
                coupling_new_of[&node]
            };
            new_global_of_ref.push(new);
            let coupling_slot = || {
                local_coupling
                    .position_of(new)
                    .expect("Internal error: coupling node missing from the local coupling set.")
            };
            if owner == rank {
                let local = new - own_range.start;
                vec_slot_of_ref.push(local);
                if local < ni {
                    mat_slot_of_ref.push(NodeSlot::Interior(local));
                } else {
                    mat_slot_of_ref.push(NodeSlot::Coupling(coupling_slot()));
                }
            } else {
                let ext = vec_external
                    .position_of(new)
                    .expect("Internal error: external node missing from the external set.");
                vec_slot_of_ref.push(num_owned + ext);
                mat_slot_of_ref.push(NodeSlot::Coupling(coupling_slot()));
            }
        }

        let ref_position = |node: usize| {
            referenced
                .binary_search(&node)
                .expect("Internal error: node missing from the referenced list.")
        };
        let mut conn_refs = Vec::with_capacity(self.conn_nodes.len());
        for &node in &self.conn_nodes {
            match dep_index.get(&node) {
                Some(&dep) => conn_refs.push(ElemNodeRef::Dependent(dep)),
                None => conn_refs.push(ElemNodeRef::Independent(ref_position(node))),
            }
        }
        let mut dependent_masters = Vec::with_capacity(self.dependents.len());
        for (dep, (_, masters)) in self.dependents.iter().enumerate() {
            if used_dependents[dep] {
                dependent_masters.push(masters.iter().map(|&(master, weight)| (ref_position(master), weight)).collect());
            } else {
                dependent_masters.push(Vec::new());
            }
        }

        // Block sparsity from all expanded node pairs of each element.
        let ncl = local_coupling.len();
        let mut b_rows = vec![BTreeSet::new(); ni];
        let mut e_rows = vec![BTreeSet::new(); ni];
        let mut f_rows = vec![BTreeSet::new(); ncl];
        let mut c_rows = vec![BTreeSet::new(); ncl];
        let mut expanded = Vec::new();
        let mut slots = Vec::new();
        for element in 0..num_elements {
            self.expand_element(element, &dep_index, &mut expanded);
            slots.clear();
            slots.extend(expanded.iter().map(|&node| mat_slot_of_ref[ref_position(node)]));
            for &row in &slots {
                for &col in &slots {
                    match (row, col) {
                        (NodeSlot::Interior(i), NodeSlot::Interior(j)) => b_rows[i].insert(j),
                        (NodeSlot::Interior(i), NodeSlot::Coupling(j)) => e_rows[i].insert(j),
                        (NodeSlot::Coupling(i), NodeSlot::Interior(j)) => f_rows[i].insert(j),
                        (NodeSlot::Coupling(i), NodeSlot::Coupling(j)) => c_rows[i].insert(j),
                    };
                }
            }
        }
        let b_pattern = Arc::new(pattern_from_rows(&b_rows, ni));
        let e_pattern = Arc::new(pattern_from_rows(&e_rows, ncl));
        let f_pattern = Arc::new(pattern_from_rows(&f_rows, ni));
        let c_pattern = Arc::new(pattern_from_rows(&c_rows, ncl));

        let vec_dist = Arc::new(VectorDistributor::new(Arc::clone(&self.comm), &map, &vec_external)?);
        let layout = Arc::new(SchurLayout::new(
            Arc::clone(&self.comm),
            Arc::clone(&map),
            bs,
            ni,
            coupling_global,
            local_coupling,
            b_pattern,
            e_pattern,
            f_pattern,
            c_pattern,
        )?);

        let mut bc_interior_mask = vec![0u32; ni];
        let mut bc_coupling_mask = vec![0u32; ncl];
        let mut bc_values = Vec::new();
        for (pos, &node) in referenced.iter().enumerate() {
            let Some(&mask) = bc_masks.get(&node) else {
                continue;
            };
            match mat_slot_of_ref[pos] {
                NodeSlot::Interior(i) => bc_interior_mask[i] = mask,
                NodeSlot::Coupling(c) => bc_coupling_mask[c] = mask,
            }
            let (_, owner) = info[&node];
            if owner == rank {
                let local = new_global_of_ref[pos] - own_range.start;
                for dof in 0..bs {
                    if mask & (1 << dof) != 0 {
                        let value = bc_value_of.get(&(node, dof)).copied().unwrap_or_else(T::zero);
                        bc_values.push((local * bs + dof, value));
                    }
                }
            }
        }
        bc_values.sort_unstable_by_key(|&(flat, _)| flat);

        let num_local = num_owned + vec_external.len();
        debug!(
            "Initialized assembler on rank {}: {} elements, {} owned nodes ({} interior, {} coupling), {} external coupling",
            rank,
            num_elements,
            num_owned,
            ni,
            num_owned - ni,
            vec_external.len()
        );
        self.init = Some(Initialized {
            map,
            layout,
            vec_external,
            vec_dist,
            num_local,
            referenced,
            new_global_of_ref,
            vec_slot_of_ref,
            mat_slot_of_ref,
            conn_refs,
            dependent_masters,
            bc_interior_mask,
            bc_coupling_mask,
            bc_values,
            coordinates: vec![Point3::origin(); num_local],
            coordinates_set: false,
            u: vec![T::zero(); num_local * bs],
            u_dot: vec![T::zero(); num_local * bs],
            u_ddot: vec![T::zero(); num_local * bs],
            scratch: ThreadLocal::new(),
        });
        self.stage = Stage::Initialized;
        Ok(())
    }

    /// Validates the rank-local inputs and derives the referenced-node list.
    fn prepare_local(&self) -> Result<LocalSetup<T>, Error> {
        let mut dep_index = FxHashMap::default();
        for (dep, (node, masters)) in self.dependents.iter().enumerate() {
            if dep_index.insert(*node, dep).is_some() {
                return Err(Error::configuration(format!("dependent node {} is declared twice", node)));
            }
            if masters.is_empty() {
                return Err(Error::configuration(format!("dependent node {} has no master nodes", node)));
            }
        }
        for (node, masters) in &self.dependents {
            for &(master, _) in masters {
                if dep_index.contains_key(&master) {
                    return Err(Error::configuration(format!(
                        "master node {} of dependent node {} is itself dependent",
                        master, node
                    )));
                }
            }
        }
        if self.element_models.len() != self.num_elements() {
            return Err(Error::configuration("element models must be assigned before initialize"));
        }

        let mut referenced = Vec::new();
        let mut used_dependents = vec![false; self.dependents.len()];
        for &node in &self.conn_nodes {
            match dep_index.get(&node) {
                Some(&dep) => {
                    used_dependents[dep] = true;
                    referenced.extend(self.dependents[dep].1.iter().map(|&(master, _)| master));
                }
                None => referenced.push(node),
            }
        }
        referenced.sort_unstable();
        referenced.dedup();

        let mut dependent_ids: Vec<usize> = self.dependents.iter().map(|&(node, _)| node).collect();
        dependent_ids.sort_unstable();

        let mut bc_masks: FxHashMap<usize, u32> = FxHashMap::default();
        let mut bc_value_of: FxHashMap<(usize, usize), T> = FxHashMap::default();
        for bc in &self.bcs {
            let mask = bc_masks.entry(bc.node).or_insert(0);
            for (&dof, &value) in bc.dofs.iter().zip(&bc.values) {
                *mask |= 1 << dof;
                bc_value_of.insert((bc.node, dof), value);
            }
        }
        let mut bc_nodes: Vec<(usize, u32)> = bc_masks.iter().map(|(&node, &mask)| (node, mask)).collect();
        bc_nodes.sort_unstable();
        let mut bc_flat = Vec::with_capacity(bc_nodes.len() * 2);
        for &(node, mask) in &bc_nodes {
            bc_flat.push(node);
            bc_flat.push(mask as usize);
        }

        Ok(LocalSetup {
            dep_index,
            referenced,
            used_dependents,
            dependent_ids,
            bc_masks,
            bc_value_of,
            bc_flat,
        })
    }

    /// Exchanges a local failure flag so that an error on any rank turns
    /// into an error on every rank before the next collective step.
    fn exchange_error_flag(&self, error: Option<Error>) -> Result<(), Error> {
        let flagged = self.comm.all_gather_counts(error.is_some() as usize);
        match error {
            Some(error) => Err(error),
            None if flagged.iter().any(|&flag| flag > 0) => Err(Error::configuration(
                "another rank reported an invalid assembler configuration",
            )),
            None => Ok(()),
        }
    }

    /// The original node ids of one element expanded through the dependent
    /// table, sorted and deduplicated.
    fn expand_element(&self, element: usize, dep_index: &FxHashMap<usize, usize>, out: &mut Vec<usize>) {
        out.clear();
        for &node in &self.conn_nodes[self.conn_ptr[element]..self.conn_ptr[element + 1]] {
            match dep_index.get(&node) {
                Some(&dep) => out.extend(self.dependents[dep].1.iter().map(|&(master, _)| master)),
                None => out.push(node),
            }
        }
        out.sort_unstable();
        out.dedup();
    }

    /// The element adjacency graph restricted to a sorted node subset,
    /// without self loops. Vertex order follows the subset, so ordering
    /// tie-breaks resolve by ascending original id.
    fn subset_adjacency(&self, subset: &[usize], dep_index: &FxHashMap<usize, usize>) -> SparsityPattern {
        let mut rows = vec![BTreeSet::new(); subset.len()];
        let mut expanded = Vec::new();
        for element in 0..self.num_elements() {
            self.expand_element(element, dep_index, &mut expanded);
            for &a in &expanded {
                let Ok(pa) = subset.binary_search(&a) else {
                    continue;
                };
                for &b in &expanded {
                    if a != b {
                        if let Ok(pb) = subset.binary_search(&b) {
                            rows[pa].insert(pb);
                        }
                    }
                }
            }
        }
        pattern_from_rows(&rows, subset.len())
    }

    pub fn node_map(&self) -> Result<&Arc<NodeMap>, Error> {
        Ok(&self.initialized()?.map)
    }

    pub fn schur_layout(&self) -> Result<&Arc<SchurLayout<T>>, Error> {
        Ok(&self.initialized()?.layout)
    }

    pub fn num_owned_nodes(&self) -> Result<usize, Error> {
        Ok(self.initialized()?.map.num_owned_nodes(self.comm.rank()))
    }

    /// The sorted original ids of the independent nodes local elements
    /// reference. Coordinates passed to [`set_nodes`](Self::set_nodes) must
    /// align with this list.
    pub fn local_nodes(&self) -> Result<&[usize], Error> {
        Ok(&self.initialized()?.referenced)
    }

    /// The node's index in the renumbered global system, or `None` when no
    /// local element references it.
    pub fn global_node_index(&self, original_node: usize) -> Result<Option<usize>, Error> {
        let init = self.initialized()?;
        Ok(init
            .referenced
            .binary_search(&original_node)
            .ok()
            .map(|pos| init.new_global_of_ref[pos]))
    }

    /// Stores the coordinates of the referenced nodes, in the order of
    /// [`local_nodes`](Self::local_nodes).
    pub fn set_nodes(&mut self, coordinates: &[Point3<T>]) -> Result<(), Error> {
        let init = self
            .init
            .as_mut()
            .ok_or_else(|| Error::configuration("assembler is not initialized"))?;
        if coordinates.len() != init.referenced.len() {
            return Err(Error::dimension_mismatch(format!(
                "{} coordinates for {} referenced nodes",
                coordinates.len(),
                init.referenced.len()
            )));
        }
        for (pos, point) in coordinates.iter().enumerate() {
            init.coordinates[init.vec_slot_of_ref[pos]] = *point;
        }
        init.coordinates_set = true;
        Ok(())
    }

    /// Pulls the state vectors into the assembler, refreshing external slots
    /// from their owners first. Collective. `None` leaves the corresponding
    /// state unchanged (initially zero).
    pub fn set_variables(
        &mut self,
        u: Option<&mut DistVector<T>>,
        u_dot: Option<&mut DistVector<T>>,
        u_ddot: Option<&mut DistVector<T>>,
    ) -> Result<(), Error> {
        self.initialized()?;
        for vector in [u.as_deref(), u_dot.as_deref(), u_ddot.as_deref()].into_iter().flatten() {
            self.check_assembly_vector(vector)?;
        }
        let mut vectors = [u, u_dot, u_ddot];
        for vector in vectors.iter_mut().flatten() {
            vector.begin_distribute()?;
        }
        for vector in vectors.iter_mut().flatten() {
            vector.end_distribute()?;
        }
        let init = self
            .init
            .as_mut()
            .expect("Internal error: initialization checked above.");
        let [u, u_dot, u_ddot] = vectors;
        if let Some(vector) = u {
            init.u.copy_from_slice(vector.local_values());
        }
        if let Some(vector) = u_dot {
            init.u_dot.copy_from_slice(vector.local_values());
        }
        if let Some(vector) = u_ddot {
            init.u_ddot.copy_from_slice(vector.local_values());
        }
        Ok(())
    }

    /// Creates a zero vector with this assembler's layout, external slots
    /// included. Collective.
    pub fn create_vector(&self) -> Result<DistVector<T>, Error> {
        let init = self.initialized()?;
        DistVector::with_external(
            Arc::clone(&self.comm),
            Arc::clone(&init.map),
            self.dofs_per_node,
            Arc::clone(&init.vec_external),
            Arc::clone(&init.vec_dist),
        )
    }

    /// Creates a zero matrix over this assembler's layout. Collective.
    pub fn create_matrix(&self) -> Result<SchurMatrix<T>, Error> {
        let init = self.initialized()?;
        Ok(SchurMatrix::new(Arc::clone(&init.layout)))
    }

    /// Overwrites the entries of constrained degrees of freedom with their
    /// prescribed values. Only owned entries are written.
    pub fn apply_boundary_conditions(&self, vector: &mut DistVector<T>) -> Result<(), Error> {
        let init = self.initialized()?;
        if vector.block_size() != self.dofs_per_node || !Arc::ptr_eq(vector.node_map(), &init.map) {
            return Err(Error::configuration("vector was not created by this assembler"));
        }
        let owned = vector.owned_values_mut();
        for &(flat, value) in &init.bc_values {
            owned[flat] = value;
        }
        Ok(())
    }

    /// Assembles the residual `R(u, u', u'')` of the current states into
    /// `residual`, completes the cross-rank accumulation and applies the
    /// boundary conditions. Collective.
    pub fn assemble_residual(&self, residual: &mut DistVector<T>) -> eyre::Result<()> {
        let init = self.initialized()?;
        self.check_assembly_vector(residual)?;
        if !init.coordinates_set {
            return Err(Error::configuration("node coordinates must be set before assembly").into());
        }
        residual.set_zero();
        let contributions = self.compute_contributions(None, true)?;
        let mut expansion = Vec::new();
        let mut offsets = Vec::new();
        {
            let values = residual.local_values_mut();
            for (element, contribution) in contributions.iter().enumerate() {
                self.scatter_element(
                    element,
                    contribution,
                    &mut expansion,
                    &mut offsets,
                    &mut [],
                    None,
                    Some(&mut *values),
                );
            }
        }
        residual.begin_set_values(SetOp::Add)?;
        residual.end_set_values()?;
        self.apply_boundary_conditions(residual)?;
        Ok(())
    }

    /// Assembles `alpha dR/du + beta dR/du' + gamma dR/du''` into `matrix`
    /// and, when given, the residual into `residual` in the same element
    /// pass. Ends by applying boundary conditions: constrained rows and
    /// columns are zeroed with a unit diagonal on the owner, and residual
    /// entries take the prescribed values. Collective.
    pub fn assemble_jacobian(
        &self,
        alpha: T,
        beta: T,
        gamma: T,
        mut residual: Option<&mut DistVector<T>>,
        matrix: &mut SchurMatrix<T>,
    ) -> eyre::Result<()> {
        let init = self.initialized()?;
        if !Arc::ptr_eq(matrix.layout(), &init.layout) {
            return Err(Error::configuration("matrix was not created by this assembler").into());
        }
        if let Some(res) = residual.as_deref() {
            self.check_assembly_vector(res)?;
        }
        if !init.coordinates_set {
            return Err(Error::configuration("node coordinates must be set before assembly").into());
        }

        matrix.set_zero();
        if let Some(res) = residual.as_deref_mut() {
            res.set_zero();
        }
        let contributions = self.compute_contributions(Some((alpha, beta, gamma)), residual.is_some())?;

        let bs = self.dofs_per_node;
        let mut expansion = Vec::new();
        let mut offsets = Vec::new();
        let mut block = vec![T::zero(); bs * bs];
        {
            let mut res_values = residual.as_deref_mut().map(|res| res.local_values_mut());
            for (element, contribution) in contributions.iter().enumerate() {
                self.scatter_element(
                    element,
                    contribution,
                    &mut expansion,
                    &mut offsets,
                    &mut block,
                    Some(&mut *matrix),
                    res_values.as_deref_mut(),
                );
            }
        }

        if let Some(res) = residual.as_deref_mut() {
            res.begin_set_values(SetOp::Add)?;
            res.end_set_values()?;
        }
        matrix.apply_dirichlet(&init.bc_interior_mask, &init.bc_coupling_mask)?;
        if let Some(res) = residual {
            self.apply_boundary_conditions(res)?;
        }
        Ok(())
    }

    fn check_assembly_vector(&self, vector: &DistVector<T>) -> Result<(), Error> {
        let init = self.initialized()?;
        if vector.block_size() != self.dofs_per_node || !Arc::ptr_eq(vector.node_map(), &init.map) {
            return Err(Error::configuration("vector was not created by this assembler"));
        }
        if vector.local_values().len() != init.num_local * self.dofs_per_node {
            return Err(Error::configuration(
                "vector is missing the assembler's external slots",
            ));
        }
        Ok(())
    }

    /// Runs the element computations, on the configured thread pool when one
    /// is set. Scattering stays on the calling thread, so results do not
    /// depend on the thread count.
    fn compute_contributions(
        &self,
        jacobian_weights: Option<(T, T, T)>,
        want_residual: bool,
    ) -> eyre::Result<Vec<ElementContribution<T>>> {
        let num_elements = self.num_elements();
        match &self.pool {
            Some(pool) => pool.install(|| {
                (0..num_elements)
                    .into_par_iter()
                    .map(|element| self.compute_element(element, jacobian_weights, want_residual))
                    .collect()
            }),
            None => (0..num_elements)
                .map(|element| self.compute_element(element, jacobian_weights, want_residual))
                .collect(),
        }
    }

    fn compute_element(
        &self,
        element: usize,
        jacobian_weights: Option<(T, T, T)>,
        want_residual: bool,
    ) -> eyre::Result<ElementContribution<T>> {
        let init = self
            .init
            .as_ref()
            .expect("Internal error: element computation on an uninitialized assembler.");
        let bs = self.dofs_per_node;
        let model = &self.models[self.element_models[element]];
        let refs = &init.conn_refs[self.conn_ptr[element]..self.conn_ptr[element + 1]];
        let num_dofs = model.num_dofs();

        let mut scratch = init
            .scratch
            .get_or(|| {
                RefCell::new(Scratch {
                    coords: Vec::new(),
                    u: Vec::new(),
                    u_dot: Vec::new(),
                    u_ddot: Vec::new(),
                })
            })
            .borrow_mut();
        let Scratch { coords, u, u_dot, u_ddot } = &mut *scratch;
        coords.clear();
        u.clear();
        u.resize(num_dofs, T::zero());
        u_dot.clear();
        u_dot.resize(num_dofs, T::zero());
        u_ddot.clear();
        u_ddot.resize(num_dofs, T::zero());

        for (a, node_ref) in refs.iter().enumerate() {
            match *node_ref {
                ElemNodeRef::Independent(pos) => {
                    let slot = init.vec_slot_of_ref[pos];
                    coords.push(init.coordinates[slot]);
                    u[a * bs..(a + 1) * bs].copy_from_slice(&init.u[slot * bs..(slot + 1) * bs]);
                    u_dot[a * bs..(a + 1) * bs].copy_from_slice(&init.u_dot[slot * bs..(slot + 1) * bs]);
                    u_ddot[a * bs..(a + 1) * bs].copy_from_slice(&init.u_ddot[slot * bs..(slot + 1) * bs]);
                }
                ElemNodeRef::Dependent(dep) => {
                    // Dependent values are the weighted combinations of
                    // their masters, for coordinates and states alike.
                    let mut point = Vector3::zeros();
                    for &(pos, weight) in &init.dependent_masters[dep] {
                        let slot = init.vec_slot_of_ref[pos];
                        point += init.coordinates[slot].coords * weight;
                        for d in 0..bs {
                            u[a * bs + d] += init.u[slot * bs + d] * weight;
                            u_dot[a * bs + d] += init.u_dot[slot * bs + d] * weight;
                            u_ddot[a * bs + d] += init.u_ddot[slot * bs + d] * weight;
                        }
                    }
                    coords.push(Point3::from(point));
                }
            }
        }

        let mut contribution = ElementContribution {
            residual: Vec::new(),
            jacobian: DMatrix::zeros(0, 0),
        };
        if want_residual {
            contribution.residual = vec![T::zero(); num_dofs];
            model
                .add_residual(coords, u, u_dot, u_ddot, &mut contribution.residual)
                .wrap_err_with(|| format!("Failed to evaluate the residual of element {}", element))?;
        }
        if let Some((alpha, beta, gamma)) = jacobian_weights {
            contribution.jacobian = DMatrix::zeros(num_dofs, num_dofs);
            model
                .add_jacobian(coords, alpha, beta, gamma, (&mut contribution.jacobian).into())
                .wrap_err_with(|| format!("Failed to evaluate the Jacobian of element {}", element))?;
        }
        Ok(contribution)
    }

    /// Scatters one element's contribution, expanding dependent nodes onto
    /// their masters with `w_i w_j`-scaled blocks.
    #[allow(clippy::too_many_arguments)]
    fn scatter_element(
        &self,
        element: usize,
        contribution: &ElementContribution<T>,
        expansion: &mut Vec<(usize, T)>,
        offsets: &mut Vec<usize>,
        block: &mut [T],
        matrix: Option<&mut SchurMatrix<T>>,
        residual: Option<&mut [T]>,
    ) {
        let init = self
            .init
            .as_ref()
            .expect("Internal error: scatter on an uninitialized assembler.");
        let bs = self.dofs_per_node;
        let refs = &init.conn_refs[self.conn_ptr[element]..self.conn_ptr[element + 1]];

        expansion.clear();
        offsets.clear();
        offsets.push(0);
        for node_ref in refs {
            match *node_ref {
                ElemNodeRef::Independent(pos) => expansion.push((pos, T::one())),
                ElemNodeRef::Dependent(dep) => expansion.extend_from_slice(&init.dependent_masters[dep]),
            }
            offsets.push(expansion.len());
        }

        if let Some(values) = residual {
            for a in 0..refs.len() {
                let row = &contribution.residual[a * bs..(a + 1) * bs];
                for &(pos, weight) in &expansion[offsets[a]..offsets[a + 1]] {
                    let slot = init.vec_slot_of_ref[pos];
                    for d in 0..bs {
                        values[slot * bs + d] += weight * row[d];
                    }
                }
            }
        }

        if let Some(matrix) = matrix {
            for a in 0..refs.len() {
                for b in 0..refs.len() {
                    for &(pa, wa) in &expansion[offsets[a]..offsets[a + 1]] {
                        for &(pb, wb) in &expansion[offsets[b]..offsets[b + 1]] {
                            let scale = wa * wb;
                            for bi in 0..bs {
                                for bj in 0..bs {
                                    block[bi * bs + bj] = scale * contribution.jacobian[(a * bs + bi, b * bs + bj)];
                                }
                            }
                            if !matrix.add_block(init.mat_slot_of_ref[pa], init.mat_slot_of_ref[pb], block) {
                                warn!(
                                    "Element {} writes outside the sparsity pattern; contribution dropped",
                                    element
                                );
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Validates the gathered classification data against the rank-local input.
/// The caller exchanges the verdict, so a failure here fails every rank.
fn check_gathered_consistency(
    rank: usize,
    referenced: &[usize],
    bc_masks: &FxHashMap<usize, u32>,
    info: &FxHashMap<usize, (usize, usize)>,
    gathered_deps: &[Vec<usize>],
    gathered_bcs: &[Vec<usize>],
) -> Result<(), Error> {
    for list in gathered_deps {
        for &node in list {
            if info.contains_key(&node) {
                return Err(Error::configuration(format!(
                    "node {} is a dependent node on one rank but an unknown on another",
                    node
                )));
            }
        }
    }
    for (peer, list) in gathered_bcs.iter().enumerate() {
        for pair in list.chunks_exact(2) {
            let (node, mask) = (pair[0], pair[1] as u32);
            if gathered_deps.iter().any(|deps| deps.binary_search(&node).is_ok()) {
                return Err(Error::configuration(format!(
                    "boundary condition on dependent node {}",
                    node
                )));
            }
            if referenced.binary_search(&node).is_ok() {
                if bc_masks.get(&node).copied().unwrap_or(0) != mask {
                    return Err(Error::configuration(format!(
                        "boundary conditions for node {} differ between rank {} and rank {}",
                        node, rank, peer
                    )));
                }
            } else if rank == 0 && !info.contains_key(&node) {
                warn!("Boundary condition on node {} which no element references", node);
            }
        }
    }
    Ok(())
}

fn pattern_from_rows(rows: &[BTreeSet<usize>], minor_dim: usize) -> SparsityPattern {
    let mut offsets = Vec::with_capacity(rows.len() + 1);
    offsets.push(0);
    let mut indices = Vec::new();
    for row in rows {
        indices.extend(row.iter().copied());
        offsets.push(indices.len());
    }
    SparsityPattern::try_from_offsets_and_indices(rows.len(), minor_dim, offsets, indices)
        .expect("Internal error: constructed sparsity pattern is invalid.")
}

//! The distributed Schur-complement matrix and its block layout.
//!
//! Each rank splits its owned nodes into *interior* nodes, referenced only by
//! its own elements, and *coupling* nodes shared with neighboring ranks.
//! Coupling nodes are numbered last in every owned range, so the rank-local
//! matrix takes the 2x2 block form
//!
//! ```text
//! [ B  E ]   interior rows
//! [ F  C ]   coupling rows
//! ```
//!
//! where the coupling index space covers every coupling node the rank's
//! elements touch, owned or not. Contributions to another rank's coupling
//! rows are accumulated locally in `F` and `C`, which keeps element assembly
//! free of communication; the blocks only become globally consistent when a
//! solver sums the interface contributions of all ranks.
use std::cell::RefCell;
use std::ops::Range;
use std::sync::Arc;

use log::{debug, warn};

use crate::comm::Communicator;
use crate::distribute::{ExchangeContext, SetOp, VecIndices, VectorDistributor};
use crate::error::Error;
use crate::node_map::NodeMap;
use crate::vector::DistVector;
use crate::Real;
use sleipnir_sparse::{spmv_bcsr, BcsrMatrix, SparsityPattern};

/// The position of a node in the rank-local block structure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeSlot {
    /// Index into the owned interior rows.
    Interior(usize),
    /// Index into the local coupling rows (owned and external coupling
    /// nodes, sorted by global index).
    Coupling(usize),
}

/// The block structure shared by every [`SchurMatrix`] of one assembler:
/// interior/coupling classification, the replicated interface numbering and
/// the sparsity patterns of the four blocks.
pub struct SchurLayout<T> {
    comm: Arc<dyn Communicator<T>>,
    map: Arc<NodeMap>,
    block_size: usize,
    num_interior: usize,
    /// Global ids of all coupling nodes, replicated on every rank.
    coupling_global: Arc<VecIndices>,
    /// Global ids of the coupling nodes this rank's elements touch.
    local_coupling: Arc<VecIndices>,
    /// Positions of the owned coupling nodes inside `local_coupling`. Owned
    /// ids are contiguous in the sorted list, so this is a single run.
    owned_run: Range<usize>,
    /// Interface slot of each local coupling position.
    interface_of_local: Vec<usize>,
    /// Ownership of the interface numbering itself.
    interface_map: Arc<NodeMap>,
    dist: Arc<VectorDistributor<T>>,
    b_pattern: Arc<SparsityPattern>,
    e_pattern: Arc<SparsityPattern>,
    f_pattern: Arc<SparsityPattern>,
    c_pattern: Arc<SparsityPattern>,
}

impl<T> SchurLayout<T>
where
    T: Real + Send,
{
    /// Builds the layout. This is a collective call: every rank must pass
    /// the same node map and the same replicated coupling list.
    ///
    /// `num_interior` is the number of owned nodes that precede the owned
    /// coupling nodes; the remainder of the owned range must appear in
    /// `coupling_global`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        comm: Arc<dyn Communicator<T>>,
        map: Arc<NodeMap>,
        block_size: usize,
        num_interior: usize,
        coupling_global: VecIndices,
        local_coupling: VecIndices,
        b_pattern: Arc<SparsityPattern>,
        e_pattern: Arc<SparsityPattern>,
        f_pattern: Arc<SparsityPattern>,
        c_pattern: Arc<SparsityPattern>,
    ) -> Result<Self, Error> {
        if block_size == 0 {
            return Err(Error::configuration("block size must be positive"));
        }
        let rank = comm.rank();
        let own_range = map.ownership_range(rank);
        let num_owned = own_range.len();
        if num_interior > num_owned {
            return Err(Error::dimension_mismatch(format!(
                "{} interior nodes exceed the {} owned nodes",
                num_interior, num_owned
            )));
        }

        // The owned coupling nodes must be exactly the tail of the owned
        // range, and they must all be registered in both coupling lists.
        let num_owned_coupling = num_owned - num_interior;
        for k in 0..num_owned_coupling {
            let global = own_range.start + num_interior + k;
            if coupling_global.position_of(global).is_none() || local_coupling.position_of(global).is_none() {
                return Err(Error::configuration(format!(
                    "owned node {} lies past the interior range but is not a registered coupling node",
                    global
                )));
            }
        }

        let own_begin = local_coupling
            .as_slice()
            .partition_point(|&id| id < own_range.start + num_interior);
        let owned_run = own_begin..own_begin + num_owned_coupling;

        let mut interface_of_local = Vec::with_capacity(local_coupling.len());
        for &global in local_coupling.as_slice() {
            let slot = coupling_global.position_of(global).ok_or_else(|| {
                Error::configuration(format!(
                    "local coupling node {} is missing from the replicated interface list",
                    global
                ))
            })?;
            interface_of_local.push(slot);
        }

        // Since the replicated list is sorted by global id and ownership
        // ranges ascend with rank, each rank owns a contiguous run of
        // interface slots; the interface numbering is itself a node map.
        let ids = coupling_global.as_slice();
        let counts: Vec<_> = (0..map.num_ranks())
            .map(|p| {
                let range = map.ownership_range(p);
                ids.partition_point(|&id| id < range.end) - ids.partition_point(|&id| id < range.start)
            })
            .collect();
        let interface_map = Arc::new(NodeMap::from_counts(&counts));
        if interface_map.num_global_nodes() != coupling_global.len() {
            return Err(Error::configuration(
                "interface list contains ids outside the node map",
            ));
        }

        let external_interface = VecIndices::new(
            (0..local_coupling.len())
                .filter(|p| !owned_run.contains(p))
                .map(|p| interface_of_local[p])
                .collect(),
        );
        let dist = Arc::new(VectorDistributor::new(
            comm.clone(),
            &interface_map,
            &external_interface,
        )?);

        check_pattern_dims(&b_pattern, num_interior, num_interior, "B")?;
        check_pattern_dims(&e_pattern, num_interior, local_coupling.len(), "E")?;
        check_pattern_dims(&f_pattern, local_coupling.len(), num_interior, "F")?;
        check_pattern_dims(&c_pattern, local_coupling.len(), local_coupling.len(), "C")?;

        debug!(
            "Schur layout on rank {}: {} interior, {} owned coupling, {} local coupling, {} global interface nodes",
            rank,
            num_interior,
            num_owned_coupling,
            local_coupling.len(),
            coupling_global.len()
        );

        Ok(Self {
            comm,
            map,
            block_size,
            num_interior,
            coupling_global: Arc::new(coupling_global),
            local_coupling: Arc::new(local_coupling),
            owned_run,
            interface_of_local,
            interface_map,
            dist,
            b_pattern,
            e_pattern,
            f_pattern,
            c_pattern,
        })
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator<T>> {
        &self.comm
    }

    pub fn node_map(&self) -> &Arc<NodeMap> {
        &self.map
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_interior(&self) -> usize {
        self.num_interior
    }

    pub fn num_local_coupling(&self) -> usize {
        self.local_coupling.len()
    }

    pub fn num_owned_coupling(&self) -> usize {
        self.owned_run.len()
    }

    pub fn num_global_coupling(&self) -> usize {
        self.coupling_global.len()
    }

    /// Positions of the owned coupling nodes within the local coupling
    /// index space.
    pub fn owned_coupling_run(&self) -> Range<usize> {
        self.owned_run.clone()
    }

    /// The interface slot of each local coupling position, ascending.
    pub fn interface_of_local(&self) -> &[usize] {
        &self.interface_of_local
    }

    /// Ownership of the replicated interface numbering.
    pub fn interface_map(&self) -> &Arc<NodeMap> {
        &self.interface_map
    }

    pub fn distributor(&self) -> &Arc<VectorDistributor<T>> {
        &self.dist
    }

    /// Classifies a global node id into this rank's block structure, or
    /// `None` when no local element touches the node.
    pub fn slot_of_global(&self, global_node: usize) -> Option<NodeSlot> {
        let own_range = self.map.ownership_range(self.comm.rank());
        if own_range.contains(&global_node) {
            let local = global_node - own_range.start;
            if local < self.num_interior {
                return Some(NodeSlot::Interior(local));
            }
        }
        self.local_coupling.position_of(global_node).map(NodeSlot::Coupling)
    }

    /// The position within the local coupling space of the `ext_slot`-th
    /// external coupling node. Externals sit on both sides of the owned run.
    fn local_position_of_external(&self, ext_slot: usize) -> usize {
        if ext_slot < self.owned_run.start {
            ext_slot
        } else {
            ext_slot + self.owned_run.len()
        }
    }

    fn num_external_coupling(&self) -> usize {
        self.local_coupling.len() - self.owned_run.len()
    }

    pub(crate) fn check_vector_compatible(&self, v: &DistVector<T>) -> Result<(), Error> {
        if v.block_size() != self.block_size {
            return Err(Error::dimension_mismatch(format!(
                "vector block size {} does not match matrix block size {}",
                v.block_size(),
                self.block_size
            )));
        }
        if !Arc::ptr_eq(v.node_map(), &self.map) {
            return Err(Error::configuration(
                "vector does not share the matrix' node map; it was created from a different assembler",
            ));
        }
        Ok(())
    }
}

fn check_pattern_dims(
    pattern: &SparsityPattern,
    rows: usize,
    cols: usize,
    name: &str,
) -> Result<(), Error> {
    if pattern.major_dim() != rows || pattern.minor_dim() != cols {
        return Err(Error::dimension_mismatch(format!(
            "{} block pattern is {} x {}, expected {} x {}",
            name,
            pattern.major_dim(),
            pattern.minor_dim(),
            rows,
            cols
        )));
    }
    Ok(())
}

struct MultBuffers<T> {
    ctx: ExchangeContext,
    external: Vec<T>,
    xc: Vec<T>,
    yc: Vec<T>,
}

/// A distributed block matrix stored as the four blocks of the
/// interior/coupling splitting described in the [module docs](self).
///
/// The matrix is rank-local: rows for external coupling nodes hold this
/// rank's contributions to equations owned elsewhere. [`mult`](Self::mult)
/// completes those contributions with a scatter-add exchange, preconditioners
/// complete them with an interface reduction.
pub struct SchurMatrix<T>
where
    T: Real + Send,
{
    layout: Arc<SchurLayout<T>>,
    b: BcsrMatrix<T>,
    e: BcsrMatrix<T>,
    f: BcsrMatrix<T>,
    c: BcsrMatrix<T>,
    buffers: RefCell<MultBuffers<T>>,
}

impl<T> SchurMatrix<T>
where
    T: Real + Send,
{
    /// Creates a zero matrix over the given layout.
    ///
    /// This is a collective call: it allocates a message channel for the
    /// matrix' own exchanges.
    pub fn new(layout: Arc<SchurLayout<T>>) -> Self {
        let bs = layout.block_size;
        let buffers = MultBuffers {
            ctx: layout.dist.create_context(),
            external: vec![T::zero(); layout.num_external_coupling() * bs],
            xc: vec![T::zero(); layout.num_local_coupling() * bs],
            yc: vec![T::zero(); layout.num_local_coupling() * bs],
        };
        Self {
            b: BcsrMatrix::from_pattern(layout.b_pattern.clone(), bs),
            e: BcsrMatrix::from_pattern(layout.e_pattern.clone(), bs),
            f: BcsrMatrix::from_pattern(layout.f_pattern.clone(), bs),
            c: BcsrMatrix::from_pattern(layout.c_pattern.clone(), bs),
            buffers: RefCell::new(buffers),
            layout,
        }
    }

    pub fn layout(&self) -> &Arc<SchurLayout<T>> {
        &self.layout
    }

    pub fn block_size(&self) -> usize {
        self.layout.block_size
    }

    /// The interior-interior block.
    pub fn b(&self) -> &BcsrMatrix<T> {
        &self.b
    }

    /// The interior-coupling block.
    pub fn e(&self) -> &BcsrMatrix<T> {
        &self.e
    }

    /// The coupling-interior block.
    pub fn f(&self) -> &BcsrMatrix<T> {
        &self.f
    }

    /// The coupling-coupling block. Rows and columns for external coupling
    /// nodes hold local contributions only.
    pub fn c(&self) -> &BcsrMatrix<T> {
        &self.c
    }

    pub fn set_zero(&mut self) {
        self.b.set_zero();
        self.e.set_zero();
        self.f.set_zero();
        self.c.set_zero();
    }

    /// Accumulates a dense `block_size x block_size` block, routed to the
    /// block owning the (row, col) classification. Returns `false` if the
    /// target position is not part of the sparsity pattern.
    #[must_use]
    pub fn add_block(&mut self, row: NodeSlot, col: NodeSlot, block: &[T]) -> bool {
        match (row, col) {
            (NodeSlot::Interior(i), NodeSlot::Interior(j)) => self.b.add_to_block(i, j, block),
            (NodeSlot::Interior(i), NodeSlot::Coupling(j)) => self.e.add_to_block(i, j, block),
            (NodeSlot::Coupling(i), NodeSlot::Interior(j)) => self.f.add_to_block(i, j, block),
            (NodeSlot::Coupling(i), NodeSlot::Coupling(j)) => self.c.add_to_block(i, j, block),
        }
    }

    /// Applies Dirichlet elimination for the constrained degrees of freedom
    /// given as per-node bitmasks (bit `d` set means dof `d` of the node is
    /// constrained; block sizes up to 32 are supported).
    ///
    /// Rows and columns of constrained dofs are zeroed in all four blocks.
    /// The diagonal entry is set to exactly one, but only where this rank
    /// owns the node: for shared coupling nodes the owner writes the unit
    /// entry, other ranks just zero their contributions, so the globally
    /// summed interface row is an exact identity row.
    pub fn apply_dirichlet(&mut self, interior: &[u32], coupling: &[u32]) -> Result<(), Error> {
        if interior.len() != self.layout.num_interior || coupling.len() != self.layout.num_local_coupling() {
            return Err(Error::dimension_mismatch(format!(
                "Dirichlet masks cover {} interior / {} coupling nodes, expected {} / {}",
                interior.len(),
                coupling.len(),
                self.layout.num_interior,
                self.layout.num_local_coupling()
            )));
        }
        zero_rows_and_cols(&mut self.b, interior, interior);
        zero_rows_and_cols(&mut self.e, interior, coupling);
        zero_rows_and_cols(&mut self.f, coupling, interior);
        zero_rows_and_cols(&mut self.c, coupling, coupling);
        set_unit_diagonal(&mut self.b, interior, |_| true);
        let owned = self.layout.owned_run.clone();
        set_unit_diagonal(&mut self.c, coupling, |i| owned.contains(&i));
        Ok(())
    }

    /// Distributed mat-vec `y = A x` on the owned segments.
    ///
    /// Collective: gathers external coupling values of `x` from their
    /// owners, applies the four blocks locally, then scatter-adds the
    /// contributions to externally owned coupling rows back to their owners.
    /// External slots of `y` are left stale.
    pub fn mult(&self, x: &DistVector<T>, y: &mut DistVector<T>) -> Result<(), Error> {
        self.layout.check_vector_compatible(x)?;
        self.layout.check_vector_compatible(y)?;
        let bs = self.layout.block_size;
        let ni = self.layout.num_interior * bs;
        let own = self.layout.owned_run.clone();

        let mut buffers = self.buffers.borrow_mut();
        let MultBuffers { ctx, external, xc, yc } = &mut *buffers;

        let x_owned = x.owned_values();
        self.layout.dist.begin_forward(ctx, &x_owned[ni..], bs)?;
        self.layout.dist.end_forward(ctx, external, bs)?;

        // Local coupling input: the owned tail of x plus the gathered
        // external values.
        xc[own.start * bs..own.end * bs].copy_from_slice(&x_owned[ni..]);
        for ext_slot in 0..self.layout.num_external_coupling() {
            let pos = self.layout.local_position_of_external(ext_slot);
            xc[pos * bs..(pos + 1) * bs].copy_from_slice(&external[ext_slot * bs..(ext_slot + 1) * bs]);
        }

        let y_owned = y.owned_values_mut();
        spmv_bcsr(T::zero(), &mut y_owned[..ni], T::one(), &self.b, &x_owned[..ni]);
        spmv_bcsr(T::one(), &mut y_owned[..ni], T::one(), &self.e, xc);
        spmv_bcsr(T::zero(), yc, T::one(), &self.f, &x_owned[..ni]);
        spmv_bcsr(T::one(), yc, T::one(), &self.c, xc);

        y_owned[ni..].copy_from_slice(&yc[own.start * bs..own.end * bs]);
        for ext_slot in 0..self.layout.num_external_coupling() {
            let pos = self.layout.local_position_of_external(ext_slot);
            external[ext_slot * bs..(ext_slot + 1) * bs].copy_from_slice(&yc[pos * bs..(pos + 1) * bs]);
        }
        self.layout.dist.begin_reverse(ctx, external, SetOp::Add, bs)?;
        self.layout.dist.end_reverse(ctx, &mut y_owned[ni..], bs)?;
        Ok(())
    }
}

fn zero_rows_and_cols<T: Real>(matrix: &mut BcsrMatrix<T>, row_mask: &[u32], col_mask: &[u32]) {
    let bs = matrix.block_size();
    let pattern = matrix.pattern_arc();
    let values = matrix.values_mut();
    for i in 0..pattern.major_dim() {
        let begin = pattern.major_offsets()[i];
        let end = pattern.major_offsets()[i + 1];
        for (idx, &j) in (begin..end).zip(&pattern.minor_indices()[begin..end]) {
            let rm = row_mask[i];
            let cm = col_mask[j];
            if rm == 0 && cm == 0 {
                continue;
            }
            let block = &mut values[idx * bs * bs..(idx + 1) * bs * bs];
            for r in 0..bs {
                for c in 0..bs {
                    if rm & (1 << r) != 0 || cm & (1 << c) != 0 {
                        block[r * bs + c] = T::zero();
                    }
                }
            }
        }
    }
}

fn set_unit_diagonal<T: Real>(
    matrix: &mut BcsrMatrix<T>,
    mask: &[u32],
    writes_diagonal: impl Fn(usize) -> bool,
) {
    let bs = matrix.block_size();
    for i in 0..mask.len() {
        if mask[i] == 0 || !writes_diagonal(i) {
            continue;
        }
        match matrix.block_mut(i, i) {
            Some(block) => {
                for d in 0..bs {
                    if mask[i] & (1 << d) != 0 {
                        block[d * bs + d] = T::one();
                    }
                }
            }
            None => warn!(
                "Diagonal block {} is outside the sparsity pattern; constrained row left without unit diagonal",
                i
            ),
        }
    }
}

//! Interpolation between vectors on different node maps.
use std::cell::RefCell;
use std::sync::Arc;

use log::debug;

use crate::comm::Communicator;
use crate::distribute::{ExchangeContext, SetOp, VecIndices, VectorDistributor};
use crate::error::Error;
use crate::node_map::NodeMap;
use crate::vector::DistVector;
use crate::Real;

/// A sparse interpolation operator `P` mapping vectors on a source node map
/// onto vectors on a target node map, typically between two meshes of the
/// same domain.
///
/// Every owned target node is a weighted sum of source nodes, with the same
/// weights applied to each of the `block_size` components. Rows are
/// registered with [`set_row`](Self::set_row) and frozen by a collective
/// [`initialize`](Self::initialize), which splits the referenced source
/// nodes into on-process and external ones and builds the exchange schedule
/// for the latter. After that, [`apply`](Self::apply) computes `y = P x` and
/// [`apply_transpose`](Self::apply_transpose) computes `y = Pᵀ x`, and both
/// may be called any number of times.
pub struct VectorInterp<T>
where
    T: Real + Send,
{
    comm: Arc<dyn Communicator<T>>,
    source_map: Arc<NodeMap>,
    target_map: Arc<NodeMap>,
    block_size: usize,
    /// Pending rows by local target node; drained by `initialize`.
    rows: Vec<Option<Vec<(usize, T)>>>,
    ready: Option<Ready<T>>,
}

struct Ready<T> {
    /// Offsets into `columns`/`weights`, one row per owned target node.
    row_offsets: Vec<usize>,
    /// Local source column of each entry: values below the number of owned
    /// source nodes index the owned segment, the rest are offset external
    /// slots in the order of the external index set.
    columns: Vec<usize>,
    weights: Vec<T>,
    dist: VectorDistributor<T>,
    buffers: RefCell<ApplyBuffers<T>>,
}

struct ApplyBuffers<T> {
    ctx: ExchangeContext,
    external: Vec<T>,
}

impl<T> VectorInterp<T>
where
    T: Real + Send,
{
    /// Creates an empty interpolation between the two node maps. Local.
    pub fn new(
        comm: Arc<dyn Communicator<T>>,
        source_map: Arc<NodeMap>,
        target_map: Arc<NodeMap>,
        block_size: usize,
    ) -> Self {
        assert!(block_size > 0, "Block size must be positive.");
        let num_owned_target = target_map.num_owned_nodes(comm.rank());
        Self {
            comm,
            source_map,
            target_map,
            block_size,
            rows: vec![None; num_owned_target],
            ready: None,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn source_map(&self) -> &Arc<NodeMap> {
        &self.source_map
    }

    pub fn target_map(&self) -> &Arc<NodeMap> {
        &self.target_map
    }

    /// Defines the row of an owned target node as a weighted sum of source
    /// nodes, identified by global index.
    ///
    /// Each row may be set at most once, and only before
    /// [`initialize`](Self::initialize); target nodes whose row is never set
    /// interpolate to zero.
    pub fn set_row(&mut self, target_node: usize, weights: &[(usize, T)]) -> Result<(), Error> {
        if self.ready.is_some() {
            return Err(Error::configuration(
                "interpolation rows cannot change after initialize",
            ));
        }
        let rank = self.comm.rank();
        if !self.target_map.is_owned_by(rank, target_node) {
            return Err(Error::configuration(format!(
                "target node {} is not owned by rank {}",
                target_node, rank
            )));
        }
        for &(source_node, _) in weights {
            if source_node >= self.source_map.num_global_nodes() {
                return Err(Error::IndexOutOfRange {
                    index: source_node,
                    bound: self.source_map.num_global_nodes(),
                });
            }
        }
        let local = target_node - self.target_map.ownership_range(rank).start;
        if self.rows[local].is_some() {
            return Err(Error::configuration(format!(
                "the interpolation row of target node {} was already set",
                target_node
            )));
        }
        self.rows[local] = Some(weights.to_vec());
        Ok(())
    }

    /// Freezes the row structure and builds the exchange schedule for the
    /// external source nodes. Collective.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.ready.is_some() {
            return Err(Error::configuration("interpolation is already initialized"));
        }
        let rank = self.comm.rank();
        let source_owned = self.source_map.ownership_range(rank);

        let mut external_ids = Vec::new();
        for row in self.rows.iter().flatten() {
            for &(source_node, _) in row {
                if !source_owned.contains(&source_node) {
                    external_ids.push(source_node);
                }
            }
        }
        let external = VecIndices::new(external_ids);

        let mut row_offsets = Vec::with_capacity(self.rows.len() + 1);
        row_offsets.push(0);
        let mut columns = Vec::new();
        let mut weights = Vec::new();
        for row in &self.rows {
            for &(source_node, weight) in row.iter().flatten() {
                let column = if source_owned.contains(&source_node) {
                    source_node - source_owned.start
                } else {
                    let slot = external
                        .position_of(source_node)
                        .expect("Internal error: external source node missing from its index set.");
                    source_owned.len() + slot
                };
                columns.push(column);
                weights.push(weight);
            }
            row_offsets.push(columns.len());
        }
        debug!(
            "Initialized interpolation on rank {}: {} target rows, {} entries, {} external source nodes",
            rank,
            self.rows.len(),
            columns.len(),
            external.len()
        );

        let dist = VectorDistributor::new(Arc::clone(&self.comm), &self.source_map, &external)?;
        let ctx = dist.create_context();
        self.ready = Some(Ready {
            row_offsets,
            columns,
            weights,
            dist,
            buffers: RefCell::new(ApplyBuffers {
                ctx,
                external: vec![T::zero(); external.len() * self.block_size],
            }),
        });
        self.rows = Vec::new();
        Ok(())
    }

    /// Computes `y = P x`, overwriting the owned entries of `y`. Collective.
    pub fn apply(&self, x: &DistVector<T>, y: &mut DistVector<T>) -> Result<(), Error> {
        let ready = self.ready()?;
        self.check_vector(x, &self.source_map, "source")?;
        self.check_vector(y, &self.target_map, "target")?;

        let bs = self.block_size;
        let mut buffers = ready.buffers.borrow_mut();
        let ApplyBuffers { ctx, external } = &mut *buffers;
        ready.dist.begin_forward(ctx, x.owned_values(), bs)?;
        ready.dist.end_forward(ctx, external, bs)?;

        let num_owned_source = x.num_owned_nodes();
        let x_owned = x.owned_values();
        let y_owned = y.owned_values_mut();
        y_owned.fill(T::zero());
        for (row, offsets) in ready.row_offsets.windows(2).enumerate() {
            for entry in offsets[0]..offsets[1] {
                let column = ready.columns[entry];
                let weight = ready.weights[entry];
                let source = if column < num_owned_source {
                    &x_owned[column * bs..(column + 1) * bs]
                } else {
                    let slot = column - num_owned_source;
                    &external[slot * bs..(slot + 1) * bs]
                };
                for (out, value) in y_owned[row * bs..(row + 1) * bs].iter_mut().zip(source) {
                    *out += weight * *value;
                }
            }
        }
        Ok(())
    }

    /// Computes `y = Pᵀ x`, scatter-adding each weighted target value onto
    /// the ranks owning the referenced source nodes. Overwrites the owned
    /// entries of `y`. Collective.
    pub fn apply_transpose(&self, x: &DistVector<T>, y: &mut DistVector<T>) -> Result<(), Error> {
        let ready = self.ready()?;
        self.check_vector(x, &self.target_map, "target")?;
        self.check_vector(y, &self.source_map, "source")?;

        let bs = self.block_size;
        let mut buffers = ready.buffers.borrow_mut();
        let ApplyBuffers { ctx, external } = &mut *buffers;
        external.fill(T::zero());

        let num_owned_source = y.num_owned_nodes();
        let x_owned = x.owned_values();
        let y_owned = y.owned_values_mut();
        y_owned.fill(T::zero());
        for (row, offsets) in ready.row_offsets.windows(2).enumerate() {
            for entry in offsets[0]..offsets[1] {
                let column = ready.columns[entry];
                let weight = ready.weights[entry];
                let target = if column < num_owned_source {
                    &mut y_owned[column * bs..(column + 1) * bs]
                } else {
                    let slot = column - num_owned_source;
                    &mut external[slot * bs..(slot + 1) * bs]
                };
                for (out, value) in target.iter_mut().zip(&x_owned[row * bs..(row + 1) * bs]) {
                    *out += weight * *value;
                }
            }
        }
        ready.dist.begin_reverse(ctx, external, SetOp::Add, bs)?;
        ready.dist.end_reverse(ctx, y_owned, bs)?;
        Ok(())
    }

    fn ready(&self) -> Result<&Ready<T>, Error> {
        self.ready
            .as_ref()
            .ok_or_else(|| Error::configuration("interpolation must be initialized before use"))
    }

    fn check_vector(&self, v: &DistVector<T>, map: &Arc<NodeMap>, role: &str) -> Result<(), Error> {
        if v.block_size() != self.block_size {
            return Err(Error::dimension_mismatch(format!(
                "vector block size {} does not match interpolation block size {}",
                v.block_size(),
                self.block_size
            )));
        }
        if !Arc::ptr_eq(v.node_map(), map) {
            return Err(Error::configuration(format!(
                "vector does not live on the interpolation's {} node map",
                role
            )));
        }
        Ok(())
    }
}

//! Distributed block vectors.
use crate::comm::Communicator;
use crate::distribute::{ExchangeContext, SetOp, VecIndices, VectorDistributor};
use crate::error::Error;
use crate::node_map::NodeMap;
use nalgebra::RealField;
use std::sync::Arc;

/// A vector partitioned across the ranks of a communicator group.
///
/// Each rank stores the entries of its owned nodes followed by one slot per
/// external node it references. The owned segments together form the global
/// vector; external slots are scratch space whose contents are only
/// meaningful between a completed [`end_distribute`](DistVector::end_distribute)
/// and the next modification of the vector.
///
/// Arithmetic operations act on the owned segment only, and reductions such
/// as [`dot`](DistVector::dot) and [`norm`](DistVector::norm) are collective
/// with results that are bitwise identical on every rank.
pub struct DistVector<T> {
    comm: Arc<dyn Communicator<T>>,
    map: Arc<NodeMap>,
    block_size: usize,
    owned_nodes: usize,
    values: Vec<T>,
    exchange: Option<VectorExchange<T>>,
}

struct VectorExchange<T> {
    external: Arc<VecIndices>,
    dist: Arc<VectorDistributor<T>>,
    ctx: ExchangeContext,
}

impl<T> DistVector<T>
where
    T: RealField + Copy + Send,
{
    /// Creates a zero vector without external slots.
    pub fn new(comm: Arc<dyn Communicator<T>>, map: Arc<NodeMap>, block_size: usize) -> Self {
        assert!(block_size > 0, "Block size must be positive.");
        let owned_nodes = map.num_owned_nodes(comm.rank());
        Self {
            comm,
            map,
            block_size,
            owned_nodes,
            values: vec![T::zero(); owned_nodes * block_size],
            exchange: None,
        }
    }

    /// Creates a zero vector with external slots and an exchange schedule.
    ///
    /// Collective: an exchange context is allocated for the vector, so every
    /// rank of the group must call this at the same point in its program.
    pub fn with_external(
        comm: Arc<dyn Communicator<T>>,
        map: Arc<NodeMap>,
        block_size: usize,
        external: Arc<VecIndices>,
        dist: Arc<VectorDistributor<T>>,
    ) -> Result<Self, Error> {
        assert!(block_size > 0, "Block size must be positive.");
        let owned_nodes = map.num_owned_nodes(comm.rank());
        if dist.num_owned() != owned_nodes || dist.num_external() != external.len() {
            return Err(Error::dimension_mismatch(format!(
                "distributor covers {} owned and {} external nodes, vector has {} and {}",
                dist.num_owned(),
                dist.num_external(),
                owned_nodes,
                external.len()
            )));
        }
        let ctx = dist.create_context();
        Ok(Self {
            comm,
            map,
            block_size,
            owned_nodes,
            values: vec![T::zero(); (owned_nodes + external.len()) * block_size],
            exchange: Some(VectorExchange { external, dist, ctx }),
        })
    }

    /// Creates a zero vector with the same layout as this one.
    ///
    /// Collective when the vector has external slots, local otherwise.
    pub fn new_like(&self) -> Self {
        Self {
            comm: Arc::clone(&self.comm),
            map: Arc::clone(&self.map),
            block_size: self.block_size,
            owned_nodes: self.owned_nodes,
            values: vec![T::zero(); self.values.len()],
            exchange: self.exchange.as_ref().map(|exchange| VectorExchange {
                external: Arc::clone(&exchange.external),
                dist: Arc::clone(&exchange.dist),
                ctx: exchange.dist.create_context(),
            }),
        }
    }

    /// Creates a zero vector with the same communicator, node map and block
    /// size, but without external slots.
    ///
    /// Never collective; solvers use this for workspace vectors that only
    /// ever hold owned data.
    pub fn new_compatible(&self) -> Self {
        Self::new(Arc::clone(&self.comm), Arc::clone(&self.map), self.block_size)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn node_map(&self) -> &Arc<NodeMap> {
        &self.map
    }

    pub fn num_owned_nodes(&self) -> usize {
        self.owned_nodes
    }

    fn owned_len(&self) -> usize {
        self.owned_nodes * self.block_size
    }

    /// The entries of the owned nodes.
    pub fn owned_values(&self) -> &[T] {
        &self.values[..self.owned_len()]
    }

    pub fn owned_values_mut(&mut self) -> &mut [T] {
        let owned_len = self.owned_len();
        &mut self.values[..owned_len]
    }

    /// The entries of the external slots, in the order of the external index
    /// set. Only meaningful after a completed distribute.
    pub fn external_values(&self) -> &[T] {
        &self.values[self.owned_len()..]
    }

    /// The full local buffer: owned entries followed by external slots.
    pub fn local_values(&self) -> &[T] {
        &self.values
    }

    pub fn local_values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    pub fn set_zero(&mut self) {
        self.values.fill(T::zero());
    }

    /// Sets or accumulates entries by global node index.
    ///
    /// `values` holds one block of entries per node. Owned nodes are updated
    /// in place; nodes in the external set are staged in their external slots
    /// until the next completed set-values exchange. A node that is neither
    /// owned nor external cannot be addressed from this rank.
    pub fn set_entries(&mut self, nodes: &[usize], values: &[T], op: SetOp) -> Result<(), Error> {
        let bs = self.block_size;
        if values.len() != nodes.len() * bs {
            return Err(Error::dimension_mismatch(format!(
                "{} values provided for {} nodes with block size {}",
                values.len(),
                nodes.len(),
                bs
            )));
        }
        let own_range = self.map.ownership_range(self.comm.rank());
        let num_global = self.map.num_global_nodes();
        for (&node, chunk) in nodes.iter().zip(values.chunks_exact(bs)) {
            let slot = if own_range.contains(&node) {
                node - own_range.start
            } else if node >= num_global {
                return Err(Error::IndexOutOfRange {
                    index: node,
                    bound: num_global,
                });
            } else {
                let position = self
                    .exchange
                    .as_ref()
                    .and_then(|exchange| exchange.external.position_of(node));
                match position {
                    Some(position) => self.owned_nodes + position,
                    None => {
                        return Err(Error::configuration(format!(
                            "node {} is neither owned nor in the external set of rank {}",
                            node,
                            self.comm.rank()
                        )))
                    }
                }
            };
            let target = &mut self.values[slot * bs..(slot + 1) * bs];
            match op {
                SetOp::Add => {
                    for (entry, term) in target.iter_mut().zip(chunk) {
                        *entry += *term;
                    }
                }
                SetOp::Insert => target.copy_from_slice(chunk),
            }
        }
        Ok(())
    }

    /// Starts flushing staged external contributions to their owners.
    ///
    /// With [`SetOp::Insert`], *every* external slot is written to its owner,
    /// including slots this rank never staged a value into.
    pub fn begin_set_values(&mut self, op: SetOp) -> Result<(), Error> {
        let owned_len = self.owned_len();
        if let Some(exchange) = &mut self.exchange {
            let (_, external) = self.values.split_at(owned_len);
            exchange
                .dist
                .begin_reverse(&mut exchange.ctx, external, op, self.block_size)?;
        }
        Ok(())
    }

    /// Completes the set-values exchange begun by
    /// [`begin_set_values`](DistVector::begin_set_values). External slots are
    /// zeroed afterwards, ready for the next round of contributions.
    pub fn end_set_values(&mut self) -> Result<(), Error> {
        let owned_len = self.owned_len();
        if let Some(exchange) = &mut self.exchange {
            let (owned, external) = self.values.split_at_mut(owned_len);
            exchange.dist.end_reverse(&mut exchange.ctx, owned, self.block_size)?;
            external.fill(T::zero());
        }
        Ok(())
    }

    /// Starts refreshing external slots with the current owner values.
    pub fn begin_distribute(&mut self) -> Result<(), Error> {
        let owned_len = self.owned_len();
        if let Some(exchange) = &mut self.exchange {
            let (owned, _) = self.values.split_at(owned_len);
            exchange.dist.begin_forward(&mut exchange.ctx, owned, self.block_size)?;
        }
        Ok(())
    }

    /// Completes the distribute begun by
    /// [`begin_distribute`](DistVector::begin_distribute); afterwards the
    /// external slots mirror the values of their owners.
    pub fn end_distribute(&mut self) -> Result<(), Error> {
        let owned_len = self.owned_len();
        if let Some(exchange) = &mut self.exchange {
            let (_, external) = self.values.split_at_mut(owned_len);
            exchange.dist.end_forward(&mut exchange.ctx, external, self.block_size)?;
        }
        Ok(())
    }

    fn check_arithmetic_compatible(&self, other: &Self) -> Result<(), Error> {
        if self.block_size != other.block_size || self.owned_nodes != other.owned_nodes {
            return Err(Error::dimension_mismatch(format!(
                "vectors have {} and {} owned nodes (block sizes {} and {})",
                self.owned_nodes, other.owned_nodes, self.block_size, other.block_size
            )));
        }
        Ok(())
    }

    /// The global inner product. Collective; the result is identical on all
    /// ranks.
    pub fn dot(&self, other: &Self) -> Result<T, Error> {
        self.check_arithmetic_compatible(other)?;
        let mut partial = T::zero();
        for (a, b) in self.owned_values().iter().zip(other.owned_values()) {
            partial += *a * *b;
        }
        let mut buffer = [partial];
        self.comm.all_reduce_sum(&mut buffer);
        Ok(buffer[0])
    }

    /// The global Euclidean norm. Collective.
    pub fn norm(&self) -> Result<T, Error> {
        Ok(self.dot(self)?.sqrt())
    }

    /// `self += alpha * x` on the owned segment.
    pub fn axpy(&mut self, alpha: T, x: &Self) -> Result<(), Error> {
        self.check_arithmetic_compatible(x)?;
        let owned_len = self.owned_len();
        for (entry, term) in self.values[..owned_len].iter_mut().zip(x.owned_values()) {
            *entry += alpha * *term;
        }
        Ok(())
    }

    /// `self = alpha * x + beta * self` on the owned segment.
    pub fn axpby(&mut self, alpha: T, x: &Self, beta: T) -> Result<(), Error> {
        self.check_arithmetic_compatible(x)?;
        let owned_len = self.owned_len();
        for (entry, term) in self.values[..owned_len].iter_mut().zip(x.owned_values()) {
            *entry = alpha * *term + beta * *entry;
        }
        Ok(())
    }

    /// Scales the owned segment by `alpha`.
    pub fn scale(&mut self, alpha: T) {
        let owned_len = self.owned_len();
        for entry in &mut self.values[..owned_len] {
            *entry *= alpha;
        }
    }

    /// Copies the owned segment of `x` into this vector.
    pub fn copy_owned_from(&mut self, x: &Self) -> Result<(), Error> {
        self.check_arithmetic_compatible(x)?;
        let owned_len = self.owned_len();
        self.values[..owned_len].copy_from_slice(x.owned_values());
        Ok(())
    }
}

impl<T> Clone for DistVector<T>
where
    T: RealField + Copy + Send,
{
    /// Clones the vector with a fresh exchange context.
    ///
    /// Collective when the vector has external slots, like
    /// [`new_like`](DistVector::new_like).
    fn clone(&self) -> Self {
        let mut clone = self.new_like();
        clone.values.copy_from_slice(&self.values);
        clone
    }
}

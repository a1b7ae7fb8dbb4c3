//! Communication schedules for moving vector entries between ranks.
//!
//! A [`VectorDistributor`] is built once from a [`NodeMap`] and the set of
//! external nodes a rank refers to, and afterwards moves values without any
//! index traffic. Exchanges are split into a begin phase that posts sends and
//! an end phase that completes receives, so that unrelated work can overlap
//! communication. Protocol state is tracked per [`ExchangeContext`], and
//! misuse (overlapping exchanges on one context, or completing an exchange
//! that was never begun) is reported as
//! [`Error::CommunicationDeadlock`](crate::error::Error::CommunicationDeadlock).
use crate::comm::{Communicator, MsgTag};
use crate::error::Error;
use crate::node_map::NodeMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::Arc;

/// A sorted, duplicate-free set of global node indices referenced by a rank
/// but owned elsewhere.
///
/// The position of an index in this set is the slot of the corresponding
/// node in the external segment of a distributed vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VecIndices {
    indices: Vec<usize>,
}

impl VecIndices {
    pub fn new(mut indices: Vec<usize>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        Self { indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.indices
    }

    /// The external slot of the given global index, if present.
    pub fn position_of(&self, global_node: usize) -> Option<usize> {
        self.indices.binary_search(&global_node).ok()
    }
}

/// How incoming values are combined with existing entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SetOp {
    /// Overwrite the target entry. When several ranks write the same entry,
    /// the contribution of the highest rank wins.
    Insert,
    /// Accumulate onto the target entry, in ascending rank order.
    Add,
}

#[derive(Debug, Copy, Clone)]
enum Pending {
    Forward { block_size: usize },
    Reverse { block_size: usize, op: SetOp },
}

/// Protocol state for exchanges on one distributed vector.
///
/// Contexts are created collectively (each context is assigned a message
/// channel that all ranks must agree on) and track the begin/end pairing of
/// the exchange currently in flight, if any.
pub struct ExchangeContext {
    channel: u32,
    pending: Option<Pending>,
}

/// A precomputed schedule for exchanging vector values between owners and
/// the ranks that reference their nodes.
///
/// Forward exchanges copy owned values out to the ranks referencing them;
/// reverse exchanges send external contributions back to the owners, where
/// they are combined according to a [`SetOp`]. The schedule itself is fixed
/// at construction; only values move afterwards.
pub struct VectorDistributor<T> {
    comm: Arc<dyn Communicator<T>>,
    num_owned: usize,
    num_external: usize,
    // Owner ranks we request externals from, with `ext_ptr` delimiting the
    // run of external slots belonging to each peer. Externals are sorted by
    // global index and ownership ranges are contiguous, so the runs are too.
    ext_peers: Vec<usize>,
    ext_ptr: Vec<usize>,
    // Ranks requesting our owned values, with the owned node offsets to
    // gather for each of them. Peers are in ascending rank order, which
    // makes reverse combination deterministic.
    req_peers: Vec<usize>,
    req_ptr: Vec<usize>,
    req_local: Vec<usize>,
}

impl<T> VectorDistributor<T>
where
    T: Copy + Send + AddAssign,
{
    /// Builds the exchange schedule collectively.
    ///
    /// Every rank must pass the same node map. External indices must be
    /// owned by other ranks; an index owned by the calling rank is a
    /// configuration error.
    pub fn new(
        comm: Arc<dyn Communicator<T>>,
        map: &NodeMap,
        external: &VecIndices,
    ) -> Result<Self, Error> {
        let rank = comm.rank();
        let size = comm.size();
        assert_eq!(map.num_ranks(), size, "Node map and communicator must agree on the number of ranks.");
        let own_range = map.ownership_range(rank);

        let ids = external.as_slice();
        let mut counts_by_owner = vec![0usize; size];
        let mut ext_peers = Vec::new();
        let mut ext_ptr = Vec::new();
        for (position, &global) in ids.iter().enumerate() {
            let owner = map.owner_of(global)?;
            if owner == rank {
                return Err(Error::configuration(format!(
                    "external index {} is owned by the calling rank",
                    global
                )));
            }
            counts_by_owner[owner] += 1;
            if ext_peers.last() != Some(&owner) {
                ext_peers.push(owner);
                ext_ptr.push(position);
            }
        }
        ext_ptr.push(ids.len());

        // Each rank learns from the gathered counts which ranks will request
        // from it, so the receive loop below never blocks on a silent peer.
        let gathered_counts = comm.all_gather_indices(&counts_by_owner);
        for (i, &peer) in ext_peers.iter().enumerate() {
            comm.send_indices(peer, MsgTag::Setup, &ids[ext_ptr[i]..ext_ptr[i + 1]]);
        }

        let mut req_peers = Vec::new();
        let mut req_ptr = vec![0];
        let mut req_local = Vec::new();
        for requester in 0..size {
            if requester == rank || gathered_counts[requester][rank] == 0 {
                continue;
            }
            let request = comm.recv_indices(requester, MsgTag::Setup);
            assert_eq!(
                request.len(),
                gathered_counts[requester][rank],
                "Internal error: request list length does not match gathered count."
            );
            for global in request {
                if !own_range.contains(&global) {
                    return Err(Error::configuration(format!(
                        "rank {} requested node {} outside the owned range {:?}; \
                         the ranks disagree on the node map",
                        requester, global, own_range
                    )));
                }
                req_local.push(global - own_range.start);
            }
            req_peers.push(requester);
            req_ptr.push(req_local.len());
        }

        debug!(
            "Built distributor on rank {}: {} externals from {} owners, serving {} requesters",
            rank,
            ids.len(),
            ext_peers.len(),
            req_peers.len()
        );

        Ok(Self {
            comm,
            num_owned: own_range.len(),
            num_external: ids.len(),
            ext_peers,
            ext_ptr,
            req_peers,
            req_ptr,
            req_local,
        })
    }

    pub fn num_owned(&self) -> usize {
        self.num_owned
    }

    pub fn num_external(&self) -> usize {
        self.num_external
    }

    /// Creates a context for exchanges on one vector. Collective.
    pub fn create_context(&self) -> ExchangeContext {
        ExchangeContext {
            channel: self.comm.create_channel(),
            pending: None,
        }
    }

    /// Posts the sends of a forward (owner to requester) exchange.
    pub fn begin_forward(
        &self,
        ctx: &mut ExchangeContext,
        owned: &[T],
        block_size: usize,
    ) -> Result<(), Error> {
        if ctx.pending.is_some() {
            return Err(Error::deadlock(
                "cannot begin an exchange while another is in progress on the same context",
            ));
        }
        self.check_owned_len(owned.len(), block_size)?;
        let mut message = Vec::new();
        for (i, &peer) in self.req_peers.iter().enumerate() {
            message.clear();
            for &local in &self.req_local[self.req_ptr[i]..self.req_ptr[i + 1]] {
                message.extend_from_slice(&owned[local * block_size..(local + 1) * block_size]);
            }
            self.comm.send_values(peer, MsgTag::Forward(ctx.channel), &message);
        }
        ctx.pending = Some(Pending::Forward { block_size });
        Ok(())
    }

    /// Completes a forward exchange, filling the external segment.
    pub fn end_forward(
        &self,
        ctx: &mut ExchangeContext,
        external: &mut [T],
        block_size: usize,
    ) -> Result<(), Error> {
        match ctx.pending {
            Some(Pending::Forward { block_size: begun }) if begun == block_size => {}
            Some(Pending::Forward { block_size: begun }) => {
                return Err(Error::dimension_mismatch(format!(
                    "forward exchange begun with block size {} but ended with {}",
                    begun, block_size
                )))
            }
            Some(Pending::Reverse { .. }) => {
                return Err(Error::deadlock(
                    "cannot end a forward exchange while a reverse exchange is in progress",
                ))
            }
            None => {
                return Err(Error::deadlock("no forward exchange in progress on this context"));
            }
        }
        self.check_external_len(external.len(), block_size)?;
        for (i, &peer) in self.ext_peers.iter().enumerate() {
            let received = self.comm.recv_values(peer, MsgTag::Forward(ctx.channel));
            let target = &mut external[self.ext_ptr[i] * block_size..self.ext_ptr[i + 1] * block_size];
            assert_eq!(received.len(), target.len(), "Internal error: forward payload length mismatch.");
            target.copy_from_slice(&received);
        }
        ctx.pending = None;
        Ok(())
    }

    /// Posts the sends of a reverse (requester to owner) exchange.
    pub fn begin_reverse(
        &self,
        ctx: &mut ExchangeContext,
        external: &[T],
        op: SetOp,
        block_size: usize,
    ) -> Result<(), Error> {
        if ctx.pending.is_some() {
            return Err(Error::deadlock(
                "cannot begin an exchange while another is in progress on the same context",
            ));
        }
        self.check_external_len(external.len(), block_size)?;
        for (i, &peer) in self.ext_peers.iter().enumerate() {
            let message = &external[self.ext_ptr[i] * block_size..self.ext_ptr[i + 1] * block_size];
            self.comm.send_values(peer, MsgTag::Reverse(ctx.channel), message);
        }
        ctx.pending = Some(Pending::Reverse { block_size, op });
        Ok(())
    }

    /// Completes a reverse exchange, combining received contributions into
    /// the owned segment with the operation given to [`begin_reverse`].
    ///
    /// Contributions are combined in ascending rank order, so the result does
    /// not depend on message arrival order.
    ///
    /// [`begin_reverse`]: VectorDistributor::begin_reverse
    pub fn end_reverse(
        &self,
        ctx: &mut ExchangeContext,
        owned: &mut [T],
        block_size: usize,
    ) -> Result<(), Error> {
        let op = match ctx.pending {
            Some(Pending::Reverse { block_size: begun, op }) if begun == block_size => op,
            Some(Pending::Reverse { block_size: begun, .. }) => {
                return Err(Error::dimension_mismatch(format!(
                    "reverse exchange begun with block size {} but ended with {}",
                    begun, block_size
                )))
            }
            Some(Pending::Forward { .. }) => {
                return Err(Error::deadlock(
                    "cannot end a reverse exchange while a forward exchange is in progress",
                ))
            }
            None => {
                return Err(Error::deadlock("no reverse exchange in progress on this context"));
            }
        };
        self.check_owned_len(owned.len(), block_size)?;
        for (i, &peer) in self.req_peers.iter().enumerate() {
            let received = self.comm.recv_values(peer, MsgTag::Reverse(ctx.channel));
            let locals = &self.req_local[self.req_ptr[i]..self.req_ptr[i + 1]];
            assert_eq!(
                received.len(),
                locals.len() * block_size,
                "Internal error: reverse payload length mismatch."
            );
            for (chunk, &local) in received.chunks_exact(block_size).zip(locals) {
                let target = &mut owned[local * block_size..(local + 1) * block_size];
                match op {
                    SetOp::Add => {
                        for (entry, term) in target.iter_mut().zip(chunk) {
                            *entry += *term;
                        }
                    }
                    SetOp::Insert => target.copy_from_slice(chunk),
                }
            }
        }
        ctx.pending = None;
        Ok(())
    }

    fn check_owned_len(&self, len: usize, block_size: usize) -> Result<(), Error> {
        if len != self.num_owned * block_size {
            return Err(Error::dimension_mismatch(format!(
                "owned segment has {} entries, expected {} nodes with block size {}",
                len, self.num_owned, block_size
            )));
        }
        Ok(())
    }

    fn check_external_len(&self, len: usize, block_size: usize) -> Result<(), Error> {
        if len != self.num_external * block_size {
            return Err(Error::dimension_mismatch(format!(
                "external segment has {} entries, expected {} nodes with block size {}",
                len, self.num_external, block_size
            )));
        }
        Ok(())
    }
}

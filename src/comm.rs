//! Communication layer for distributed vectors, matrices and assemblers.
//!
//! All distributed objects in this crate talk to each other exclusively
//! through the [`Communicator`] trait, which provides tagged point-to-point
//! messages and a small set of deterministic collectives. Two implementations
//! are provided: [`SelfComm`] for single-process use and [`ThreadComm`] for
//! groups of ranks backed by threads in the same process.
//!
//! Collective operations (and the creation of distributed objects, which is
//! itself collective) must be issued in the same order on every rank of a
//! group. Reductions are rooted at rank 0 and combine contributions in
//! ascending rank order, so their results are bitwise identical on all ranks.
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

/// Message tags used to match point-to-point traffic.
///
/// Messages between a pair of ranks are matched by `(source, tag)` in FIFO
/// order. Exchange payloads additionally carry the channel id of the vector
/// exchange they belong to, so that exchanges on different vectors may be
/// in flight simultaneously without their messages crossing over.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MsgTag {
    /// Construction traffic: request lists, pattern and ordering exchanges.
    Setup,
    /// Payloads of a forward (owner to requester) exchange.
    Forward(u32),
    /// Payloads of a reverse (requester to owner) exchange.
    Reverse(u32),
    /// Contributions and results of a rooted reduction.
    Reduce,
    /// Contributions and results of an all-gather.
    Gather,
}

/// Tagged point-to-point messaging and deterministic collectives for a group
/// of ranks.
///
/// Sends never block; receives block until a matching message arrives.
/// Receiving a message that can never arrive (for example from a rank that
/// is not sending) is a protocol violation and aborts the process, analogous
/// to a communicator abort in message-passing runtimes.
pub trait Communicator<T>: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send_indices(&self, dest: usize, tag: MsgTag, indices: &[usize]);

    fn recv_indices(&self, source: usize, tag: MsgTag) -> Vec<usize>;

    fn send_values(&self, dest: usize, tag: MsgTag, values: &[T]);

    fn recv_values(&self, source: usize, tag: MsgTag) -> Vec<T>;

    fn barrier(&self);

    /// Sums `values` elementwise across all ranks, leaving the identical
    /// result on every rank. Contributions are combined in ascending rank
    /// order so that the result does not depend on thread scheduling.
    fn all_reduce_sum(&self, values: &mut [T]);

    /// Gathers one index list per rank, returned in rank order on all ranks.
    fn all_gather_indices(&self, local: &[usize]) -> Vec<Vec<usize>>;

    /// Allocates a fresh exchange channel id. Must be called collectively so
    /// that all ranks agree on the id of each distributed object.
    fn create_channel(&self) -> u32;

    fn all_gather_counts(&self, count: usize) -> Vec<usize> {
        self.all_gather_indices(&[count])
            .into_iter()
            .map(|list| list[0])
            .collect()
    }
}

/// The trivial communicator for a single rank.
///
/// Self-sends are queued and can be received again, which lets communication
/// schedules treat the single-rank case uniformly.
pub struct SelfComm<T> {
    queues: Mutex<FxHashMap<MsgTag, VecDeque<Payload<T>>>>,
    channel_counter: AtomicU32,
}

impl<T> SelfComm<T> {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(FxHashMap::default()),
            channel_counter: AtomicU32::new(0),
        }
    }
}

impl<T> Default for SelfComm<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Communicator<T> for SelfComm<T>
where
    T: Copy + Send + AddAssign,
{
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send_indices(&self, dest: usize, tag: MsgTag, indices: &[usize]) {
        assert_eq!(dest, 0, "Invalid destination rank {} for single-rank communicator.", dest);
        self.queues
            .lock()
            .entry(tag)
            .or_default()
            .push_back(Payload::Indices(indices.to_vec()));
    }

    fn recv_indices(&self, source: usize, tag: MsgTag) -> Vec<usize> {
        assert_eq!(source, 0, "Invalid source rank {} for single-rank communicator.", source);
        match self.queues.lock().get_mut(&tag).and_then(VecDeque::pop_front) {
            Some(Payload::Indices(indices)) => indices,
            Some(Payload::Values(_)) => panic!("Internal error: index receive matched a value message."),
            None => panic!("Deadlock: receive on single-rank communicator with no matching send (tag {:?}).", tag),
        }
    }

    fn send_values(&self, dest: usize, tag: MsgTag, values: &[T]) {
        assert_eq!(dest, 0, "Invalid destination rank {} for single-rank communicator.", dest);
        self.queues
            .lock()
            .entry(tag)
            .or_default()
            .push_back(Payload::Values(values.to_vec()));
    }

    fn recv_values(&self, source: usize, tag: MsgTag) -> Vec<T> {
        assert_eq!(source, 0, "Invalid source rank {} for single-rank communicator.", source);
        match self.queues.lock().get_mut(&tag).and_then(VecDeque::pop_front) {
            Some(Payload::Values(values)) => values,
            Some(Payload::Indices(_)) => panic!("Internal error: value receive matched an index message."),
            None => panic!("Deadlock: receive on single-rank communicator with no matching send (tag {:?}).", tag),
        }
    }

    fn barrier(&self) {}

    fn all_reduce_sum(&self, _values: &mut [T]) {}

    fn all_gather_indices(&self, local: &[usize]) -> Vec<Vec<usize>> {
        vec![local.to_vec()]
    }

    fn create_channel(&self) -> u32 {
        self.channel_counter.fetch_add(1, Ordering::Relaxed)
    }
}

enum Payload<T> {
    Indices(Vec<usize>),
    Values(Vec<T>),
}

struct Packet<T> {
    source: usize,
    tag: MsgTag,
    payload: Payload<T>,
}

/// A communicator connecting a fixed-size group of ranks within one process,
/// one rank per thread.
///
/// Each rank owns an inbox; unmatched messages are parked in a pending map
/// keyed by `(source, tag)` until a receive asks for them. The group is
/// created up front with [`ThreadComm::create`] and the members handed to
/// worker threads, typically via [`run_threaded`].
pub struct ThreadComm<T> {
    rank: usize,
    size: usize,
    senders: Vec<Sender<Packet<T>>>,
    inbox: Receiver<Packet<T>>,
    pending: Mutex<FxHashMap<(usize, MsgTag), VecDeque<Payload<T>>>>,
    barrier: Arc<Barrier>,
    // Per-rank counter: since channels are allocated collectively, counting
    // locally yields the same sequence of ids on every rank.
    channel_counter: AtomicU32,
}

/// How long a blocked receive waits before declaring the group deadlocked.
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

impl<T> ThreadComm<T> {
    /// Creates a communicator group of the given size, one member per rank.
    pub fn create(size: usize) -> Vec<ThreadComm<T>> {
        assert!(size > 0, "Communicator group must have at least one rank.");
        let mut senders = Vec::with_capacity(size);
        let mut inboxes = Vec::with_capacity(size);
        for _ in 0..size {
            let (sender, receiver) = unbounded();
            senders.push(sender);
            inboxes.push(receiver);
        }
        let barrier = Arc::new(Barrier::new(size));
        debug!("Created thread communicator group with {} ranks", size);
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ThreadComm {
                rank,
                size,
                senders: senders.clone(),
                inbox,
                pending: Mutex::new(FxHashMap::default()),
                barrier: Arc::clone(&barrier),
                channel_counter: AtomicU32::new(0),
            })
            .collect()
    }

    fn send_payload(&self, dest: usize, tag: MsgTag, payload: Payload<T>) {
        assert!(dest < self.size, "Invalid destination rank {} (group size {}).", dest, self.size);
        let packet = Packet {
            source: self.rank,
            tag,
            payload,
        };
        self.senders[dest]
            .send(packet)
            .expect("Internal error: communicator inbox disconnected.");
    }

    fn recv_payload(&self, source: usize, tag: MsgTag) -> Payload<T> {
        assert!(source < self.size, "Invalid source rank {} (group size {}).", source, self.size);
        let key = (source, tag);
        loop {
            if let Some(payload) = self
                .pending
                .lock()
                .get_mut(&key)
                .and_then(VecDeque::pop_front)
            {
                return payload;
            }
            match self.inbox.recv_timeout(RECV_TIMEOUT) {
                Ok(packet) => {
                    self.pending
                        .lock()
                        .entry((packet.source, packet.tag))
                        .or_default()
                        .push_back(packet.payload);
                }
                Err(_) => panic!(
                    "Deadlock: rank {} waited {:?} for a message from rank {} (tag {:?}).",
                    self.rank, RECV_TIMEOUT, source, tag
                ),
            }
        }
    }
}

impl<T> Communicator<T> for ThreadComm<T>
where
    T: Copy + Send + AddAssign,
{
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_indices(&self, dest: usize, tag: MsgTag, indices: &[usize]) {
        self.send_payload(dest, tag, Payload::Indices(indices.to_vec()));
    }

    fn recv_indices(&self, source: usize, tag: MsgTag) -> Vec<usize> {
        match self.recv_payload(source, tag) {
            Payload::Indices(indices) => indices,
            Payload::Values(_) => panic!("Internal error: index receive matched a value message."),
        }
    }

    fn send_values(&self, dest: usize, tag: MsgTag, values: &[T]) {
        self.send_payload(dest, tag, Payload::Values(values.to_vec()));
    }

    fn recv_values(&self, source: usize, tag: MsgTag) -> Vec<T> {
        match self.recv_payload(source, tag) {
            Payload::Values(values) => values,
            Payload::Indices(_) => panic!("Internal error: value receive matched an index message."),
        }
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn all_reduce_sum(&self, values: &mut [T]) {
        if self.size == 1 {
            return;
        }
        if self.rank == 0 {
            for source in 1..self.size {
                let contribution = self.recv_values(source, MsgTag::Reduce);
                assert_eq!(
                    contribution.len(),
                    values.len(),
                    "Reduction contributions must have equal lengths on all ranks."
                );
                for (value, term) in values.iter_mut().zip(&contribution) {
                    *value += *term;
                }
            }
            for dest in 1..self.size {
                self.send_values(dest, MsgTag::Reduce, values);
            }
        } else {
            self.send_values(0, MsgTag::Reduce, values);
            let result = self.recv_values(0, MsgTag::Reduce);
            values.copy_from_slice(&result);
        }
    }

    fn all_gather_indices(&self, local: &[usize]) -> Vec<Vec<usize>> {
        if self.size == 1 {
            return vec![local.to_vec()];
        }
        if self.rank == 0 {
            let mut lists = Vec::with_capacity(self.size);
            lists.push(local.to_vec());
            for source in 1..self.size {
                lists.push(self.recv_indices(source, MsgTag::Gather));
            }
            for dest in 1..self.size {
                for list in &lists {
                    self.send_indices(dest, MsgTag::Gather, list);
                }
            }
            lists
        } else {
            self.send_indices(0, MsgTag::Gather, local);
            (0..self.size)
                .map(|_| self.recv_indices(0, MsgTag::Gather))
                .collect()
        }
    }

    fn create_channel(&self) -> u32 {
        self.channel_counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Runs `f` once per rank on its own thread with the members of a fresh
/// communicator group, and returns the per-rank results in rank order.
/// A panic on any rank propagates to the caller.
pub fn run_threaded<T, R, F>(num_ranks: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(ThreadComm<T>) -> R + Send + Sync,
{
    let comms = ThreadComm::create(num_ranks);
    std::thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| scope.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic_payload) => std::panic::resume_unwind(panic_payload),
            })
            .collect()
    })
}

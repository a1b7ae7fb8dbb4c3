//! Ownership map for globally numbered nodes.
use crate::comm::Communicator;
use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Maps each global node index to the rank that owns it.
///
/// Ownership is contiguous: rank `r` owns the half-open range
/// `ranges[r] .. ranges[r + 1]` of global indices. Ranks may own empty
/// ranges. The map is cheap to clone and identical on every rank of the
/// group it was built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMap {
    // Length is number of ranks + 1; first entry is 0, last is the global
    // node count.
    ranges: Vec<usize>,
}

impl NodeMap {
    /// Builds a map from the number of nodes owned by each rank.
    pub fn from_counts(counts: &[usize]) -> Self {
        assert!(!counts.is_empty(), "Node map must cover at least one rank.");
        let mut ranges = Vec::with_capacity(counts.len() + 1);
        let mut sum = 0;
        ranges.push(0);
        for count in counts {
            sum += count;
            ranges.push(sum);
        }
        Self { ranges }
    }

    /// Builds the map collectively by gathering each rank's local node count.
    pub fn gathered<T>(comm: &dyn Communicator<T>, num_local_nodes: usize) -> Self {
        let counts = comm.all_gather_counts(num_local_nodes);
        Self::from_counts(&counts)
    }

    pub fn num_ranks(&self) -> usize {
        self.ranges.len() - 1
    }

    pub fn num_global_nodes(&self) -> usize {
        *self
            .ranges
            .last()
            .expect("Internal error: node map ranges cannot be empty.")
    }

    /// The half-open range of global node indices owned by `rank`.
    pub fn ownership_range(&self, rank: usize) -> std::ops::Range<usize> {
        self.ranges[rank]..self.ranges[rank + 1]
    }

    pub fn num_owned_nodes(&self, rank: usize) -> usize {
        self.ranges[rank + 1] - self.ranges[rank]
    }

    pub fn is_owned_by(&self, rank: usize, global_node: usize) -> bool {
        self.ownership_range(rank).contains(&global_node)
    }

    /// The rank owning the given global node.
    ///
    /// Runs in logarithmic time; empty ownership ranges are skipped.
    pub fn owner_of(&self, global_node: usize) -> Result<usize, Error> {
        if global_node >= self.num_global_nodes() {
            return Err(Error::IndexOutOfRange {
                index: global_node,
                bound: self.num_global_nodes(),
            });
        }
        // The last range start not exceeding the node belongs to the owner;
        // earlier ranks with identical starts own empty ranges.
        let partition = self.ranges.partition_point(|&start| start <= global_node);
        Ok(partition - 1)
    }
}

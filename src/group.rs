//! Tensor-parallel group handles.
//!
//! A [`ParallelGroup`] is an explicit, cloneable handle over a communicator.
//! Groups are always passed as parameters; nothing in this crate reads
//! process-wide group state, so tests can construct synthetic groups of any
//! size without a real multi-process runtime.

use crate::comm::{CollectiveCommunicator, LocalCommunicator};
use crate::utils::error::{Result, ShardError};
use candle_core::Tensor;
use std::sync::Arc;
use tracing::debug;

/// Handle to a tensor-parallel process group.
///
/// Read-only from this crate's point of view: the embedding runtime creates
/// the underlying communicator before first use and tears it down at process
/// exit.
#[derive(Clone)]
pub struct ParallelGroup {
    comm: Arc<dyn CollectiveCommunicator>,
}

impl ParallelGroup {
    /// Wrap a communicator supplied by the runtime.
    pub fn new(comm: Arc<dyn CollectiveCommunicator>) -> Result<Self> {
        let (rank, world_size) = (comm.rank(), comm.world_size());
        if world_size == 0 {
            return Err(ShardError::Group("world size must be at least 1".into()));
        }
        if rank >= world_size {
            return Err(ShardError::Group(format!(
                "rank {} out of range for world size {}",
                rank, world_size
            )));
        }
        Ok(Self { comm })
    }

    /// A single-rank group; all collectives on it are identities.
    pub fn solo() -> Self {
        let comm = LocalCommunicator::new_group(1).remove(0);
        Self {
            comm: Arc::new(comm),
        }
    }

    /// A connected set of in-process groups, one handle per rank.
    ///
    /// Each handle is meant to live on its own thread; the collectives
    /// synchronize through a shared barrier.
    pub fn local_groups(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(ShardError::Group("world size must be at least 1".into()));
        }
        debug!(world_size, "creating in-process tensor parallel group");
        LocalCommunicator::new_group(world_size)
            .into_iter()
            .map(|comm| Self::new(Arc::new(comm)))
            .collect()
    }

    /// Total number of ranks in this group.
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    /// This process's rank within the group, in `0..world_size`.
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Whether collectives on this group are identities.
    pub fn is_trivial(&self) -> bool {
        self.world_size() == 1
    }

    /// Blocking all-gather of every rank's tensor into a flat rank-ordered
    /// buffer. See [`CollectiveCommunicator::all_gather`].
    pub fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        self.comm.all_gather(tensor)
    }
}

impl std::fmt::Debug for ParallelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelGroup")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solo_group_is_trivial() {
        let group = ParallelGroup::solo();
        assert_eq!(group.world_size(), 1);
        assert_eq!(group.rank(), 0);
        assert!(group.is_trivial());
    }

    #[test]
    fn test_local_groups_ranks() -> Result<()> {
        let groups = ParallelGroup::local_groups(4)?;
        assert_eq!(groups.len(), 4);
        for (i, g) in groups.iter().enumerate() {
            assert_eq!(g.rank(), i);
            assert_eq!(g.world_size(), 4);
            assert!(!g.is_trivial());
        }
        Ok(())
    }

    #[test]
    fn test_zero_world_size_rejected() {
        assert!(ParallelGroup::local_groups(0).is_err());
    }
}

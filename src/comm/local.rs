//! In-process communicator backed by threads and a barrier.
//!
//! One `LocalCommunicator` per simulated rank, all sharing a slot table.
//! Lets tests exercise real multi-rank exchanges by running each rank on its
//! own thread, without a multi-process runtime.

use super::CollectiveCommunicator;
use crate::utils::error::{Result, ShardError};
use candle_core::Tensor;
use std::sync::{Arc, Barrier, Mutex};

struct SharedState {
    slots: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl LocalCommunicator {
    /// Create a connected set of communicators, one per rank.
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedState {
            slots: Mutex::new((0..world_size).map(|_| None).collect()),
            barrier: Barrier::new(world_size),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    fn lock_slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<Option<Tensor>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| ShardError::Communication("slot table poisoned by a peer rank".into()))
    }
}

impl CollectiveCommunicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        // 1. Publish this rank's flattened contribution
        {
            let mut slots = self.lock_slots()?;
            slots[self.rank] = Some(tensor.flatten_all()?);
        }

        // 2. Wait for all ranks to publish
        self.shared.barrier.wait();

        // 3. Concatenate in rank order
        let gathered = {
            let slots = self.lock_slots()?;
            let parts = slots
                .iter()
                .map(|t| {
                    t.as_ref().ok_or_else(|| {
                        ShardError::Communication("peer rank published no data".into())
                    })
                })
                .collect::<Result<Vec<&Tensor>>>()?;
            Tensor::cat(&parts, 0)?
        };

        // 4. Second barrier so the next collective cannot overwrite a slot
        //    before every rank has read it
        self.shared.barrier.wait();

        Ok(gathered)
    }
}

//! Communication backend seam.
//!
//! The collectives in this crate talk to the runtime through one narrow
//! adapter trait. Implementations include:
//! - [`LocalCommunicator`]: in-process, thread-backed simulation for tests
//!   and single-node runs.
//! - Real multi-process backends (NCCL, Gloo, ...) supplied by the embedding
//!   runtime; one implementation per target runtime.

use candle_core::Tensor;

use crate::utils::error::Result;

pub mod local;

pub use local::LocalCommunicator;

/// Adapter over a tensor-parallel communication runtime.
///
/// A collective is a group-wide synchronization point: every rank in the
/// group must issue the same sequence of calls with compatible shapes and
/// dtypes. Divergence across ranks is undefined behavior (stall or data
/// corruption) and is not detected at this layer, nor are peer failures
/// retried; distributed collectives are not safely retryable without
/// group-wide coordination.
pub trait CollectiveCommunicator: Send + Sync {
    /// Rank of this process within the group, in `0..world_size`.
    fn rank(&self) -> usize;

    /// Total number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Gather every rank's tensor into a flat buffer, ordered by rank.
    ///
    /// Each rank contributes `tensor`; the result is a 1-D tensor of length
    /// `world_size * tensor.elem_count()` where the slice
    /// `[r * numel, (r + 1) * numel)` holds rank `r`'s flattened
    /// contribution. Blocks until data from all ranks is present.
    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;
}

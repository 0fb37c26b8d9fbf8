//! Token-sharding collectives for Mixture-of-Experts tensor parallelism.
//!
//! Inside a tensor-parallel group, expert layers want their token tensors in
//! one of two representations: fully replicated (every rank holds the whole
//! tensor) or sharded (each rank holds one contiguous slice along a chosen
//! dimension). This crate provides the two differentiable primitives that move
//! between them:
//!
//! - [`gather_tokens`]: all-gather per-rank shards into the full tensor,
//!   concatenated in rank order.
//! - [`drop_tokens`]: keep only the calling rank's slice of a replicated
//!   tensor.
//!
//! Each is the other's gradient, so both participate in candle's reverse-mode
//! differentiation. When no parallel group is configured (or the group has a
//! single rank) both degrade to zero-overhead identities with no graph node.
//!
//! Process groups are passed explicitly as [`ParallelGroup`] handles; there is
//! no process-wide group state. The communication backend sits behind the
//! [`CollectiveCommunicator`] trait, with an in-process thread-backed
//! [`LocalCommunicator`] for tests and single-node simulation.

pub mod comm;
pub mod group;
pub mod ops;
pub mod utils;

pub use comm::{CollectiveCommunicator, LocalCommunicator};
pub use group::ParallelGroup;
pub use ops::{
    all_gather_along, drop_tokens, drop_tokens_detached, extract_shard, extract_shard_with,
    gather_tokens, gather_tokens_detached, CollectiveFn, DifferentiableCollective, ShardMode,
};
pub use utils::error::{Result, ShardError};

//! Token-sharding collectives and their autograd wiring.
//!
//! Two primitives move token tensors between replicated and sharded
//! representations inside a tensor-parallel group:
//!
//! - [`all_gather_along`]: reconstruct the full tensor from per-rank shards,
//!   concatenated in rank order along a dimension.
//! - [`extract_shard`]: keep only the calling rank's contiguous slice.
//!
//! Each is the other's mathematical inverse. [`DifferentiableCollective`]
//! pairs them up as a candle custom op so that [`gather_tokens`] and
//! [`drop_tokens`] participate in reverse-mode differentiation: the gradient
//! of spreading a shard into the full tensor is selecting the piece
//! attributable to this rank, and vice versa.

use crate::group::ParallelGroup;
use crate::utils::error::{Result, ShardError};
use candle_core::{CpuStorage, CustomOp1, Device, Layout, Shape, Storage, Tensor};
use tracing::trace;

/// A collective over one tensor: `(input, dim, group) -> output`.
///
/// Pure apart from the communication it issues; suitable for registration as
/// either side of a [`DifferentiableCollective`].
pub type CollectiveFn = fn(&Tensor, usize, &ParallelGroup) -> Result<Tensor>;

/// What [`extract_shard_with`] returns when the world size is greater than 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardMode {
    /// A non-owning view into the full tensor's storage. Default.
    View,
    /// Freshly allocated storage. Use when the source buffer may be reused
    /// by the communication provider before the shard is consumed.
    Copy,
}

/// Gather every rank's shard into the full tensor along `dim`.
///
/// Issues exactly one blocking all-gather; the result holds rank `r`'s shard
/// at `[r * chunk, (r + 1) * chunk)` along `dim`. With a single-rank group
/// this is a zero-copy identity and no communication is issued.
///
/// This is the raw forward computation: no gradient node is attached. For a
/// differentiable version use [`gather_tokens`].
pub fn all_gather_along(input: &Tensor, dim: usize, group: &ParallelGroup) -> Result<Tensor> {
    let world_size = group.world_size();
    if world_size == 1 {
        return Ok(input.clone());
    }
    input.dim(dim)?;

    trace!(
        rank = group.rank(),
        world_size,
        dim,
        numel = input.elem_count(),
        "all-gather tokens"
    );

    let input = input.contiguous()?;
    let flat = group.all_gather(&input)?;

    if dim == 0 {
        // Leading-dimension concatenation of row-major data equals flat
        // concatenation, so the exchange buffer can be reinterpreted directly.
        let mut dims = input.dims().to_vec();
        dims[0] *= world_size;
        Ok(flat.reshape(dims)?)
    } else {
        let numel = input.elem_count();
        let mut shards = Vec::with_capacity(world_size);
        for r in 0..world_size {
            shards.push(flat.narrow(0, r * numel, numel)?.reshape(input.dims())?);
        }
        Ok(Tensor::cat(&shards, dim)?)
    }
}

/// Keep only the calling rank's slice of a replicated tensor along `dim`.
///
/// Returns a non-owning view; see [`extract_shard_with`] to force a copy.
/// Purely local: never communicates, never suspends.
///
/// This is the raw forward computation: no gradient node is attached. For a
/// differentiable version use [`drop_tokens`].
pub fn extract_shard(input: &Tensor, dim: usize, group: &ParallelGroup) -> Result<Tensor> {
    extract_shard_with(input, dim, group, ShardMode::View)
}

/// [`extract_shard`] with an explicit view-vs-copy choice.
///
/// Fails fast with [`ShardError::DimensionMismatch`] when `shape[dim]` does
/// not divide evenly by the world size, before any communication could be
/// reached downstream.
pub fn extract_shard_with(
    input: &Tensor,
    dim: usize,
    group: &ParallelGroup,
    mode: ShardMode,
) -> Result<Tensor> {
    let world_size = group.world_size();
    if world_size == 1 {
        return Ok(input.clone());
    }

    let size = input.dim(dim)?;
    if size % world_size != 0 {
        return Err(ShardError::DimensionMismatch {
            dim,
            size,
            world_size,
        });
    }
    let chunk = size / world_size;

    trace!(
        rank = group.rank(),
        world_size,
        dim,
        chunk,
        "extract token shard"
    );

    let shard = input.narrow(dim, group.rank() * chunk, chunk)?;
    match mode {
        ShardMode::View => Ok(shard),
        ShardMode::Copy => Ok(shard.copy()?),
    }
}

/// A forward collective paired with its declared inverse, applied as one node
/// in candle's reverse-mode graph.
///
/// The sharding dimension is recorded at construction and reused by every
/// backward invocation; it is not a differentiable argument, so it receives
/// no gradient. Backward is pure apart from the communication its delegate
/// issues and may run zero or more times.
pub struct DifferentiableCollective {
    name: &'static str,
    forward: CollectiveFn,
    inverse: CollectiveFn,
    dim: usize,
    group: ParallelGroup,
}

impl DifferentiableCollective {
    /// Pair an arbitrary forward collective with its inverse.
    pub fn new(
        name: &'static str,
        forward: CollectiveFn,
        inverse: CollectiveFn,
        dim: usize,
        group: ParallelGroup,
    ) -> Self {
        Self {
            name,
            forward,
            inverse,
            dim,
            group,
        }
    }

    /// All-gather forward, shard-extraction backward.
    pub fn gather(dim: usize, group: ParallelGroup) -> Self {
        Self::new("gather-tokens", all_gather_along, extract_shard, dim, group)
    }

    /// Shard-extraction forward, all-gather backward.
    pub fn shard(dim: usize, group: ParallelGroup) -> Self {
        Self::new("drop-tokens", extract_shard, all_gather_along, dim, group)
    }

    /// Mirror the forward computation only, attaching no gradient node.
    ///
    /// For deployment-time graph capture and other export paths that trace
    /// values without differentiating.
    pub fn trace(&self, input: &Tensor) -> Result<Tensor> {
        (self.forward)(&input.detach(), self.dim, &self.group)
    }
}

impl CustomOp1 for DifferentiableCollective {
    fn name(&self) -> &'static str {
        self.name
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> candle_core::Result<(CpuStorage, Shape)> {
        let input = tensor_from_cpu_storage(storage, layout)?;
        let output = (self.forward)(&input, self.dim, &self.group)
            .map_err(candle_core::Error::wrap)?;
        owned_cpu_storage(&output)
    }

    fn bwd(
        &self,
        _arg: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> candle_core::Result<Option<Tensor>> {
        let grad = (self.inverse)(grad_res, self.dim, &self.group)
            .map_err(candle_core::Error::wrap)?;
        Ok(Some(grad))
    }
}

/// Rebuild a detached tensor from this rank's storage so the collective can
/// run through the regular tensor API inside the custom op.
fn tensor_from_cpu_storage(storage: &CpuStorage, layout: &Layout) -> candle_core::Result<Tensor> {
    let (start, end) = match layout.contiguous_offsets() {
        Some(offsets) => offsets,
        None => candle_core::bail!("token collective input must be contiguous"),
    };
    let shape = layout.shape().clone();
    let device = Device::Cpu;
    match storage {
        CpuStorage::U8(d) => Tensor::from_slice(&d[start..end], shape, &device),
        CpuStorage::U32(d) => Tensor::from_slice(&d[start..end], shape, &device),
        CpuStorage::I64(d) => Tensor::from_slice(&d[start..end], shape, &device),
        CpuStorage::BF16(d) => Tensor::from_slice(&d[start..end], shape, &device),
        CpuStorage::F16(d) => Tensor::from_slice(&d[start..end], shape, &device),
        CpuStorage::F32(d) => Tensor::from_slice(&d[start..end], shape, &device),
        CpuStorage::F64(d) => Tensor::from_slice(&d[start..end], shape, &device),
        _ => candle_core::bail!("unsupported dtype for token collectives"),
    }
}

/// Extract an owned copy of a tensor's data as `(storage, shape)`, the return
/// contract of a custom op forward.
fn owned_cpu_storage(tensor: &Tensor) -> candle_core::Result<(CpuStorage, Shape)> {
    let tensor = tensor.contiguous()?;
    let (storage, layout) = tensor.storage_and_layout();
    let (start, end) = match layout.contiguous_offsets() {
        Some(offsets) => offsets,
        None => candle_core::bail!("token collective output must be contiguous"),
    };
    let cpu = match &*storage {
        Storage::Cpu(cpu) => cpu,
        _ => candle_core::bail!("token collectives only run on cpu tensors"),
    };
    let out = match cpu {
        CpuStorage::U8(d) => CpuStorage::U8(d[start..end].to_vec()),
        CpuStorage::U32(d) => CpuStorage::U32(d[start..end].to_vec()),
        CpuStorage::I64(d) => CpuStorage::I64(d[start..end].to_vec()),
        CpuStorage::BF16(d) => CpuStorage::BF16(d[start..end].to_vec()),
        CpuStorage::F16(d) => CpuStorage::F16(d[start..end].to_vec()),
        CpuStorage::F32(d) => CpuStorage::F32(d[start..end].to_vec()),
        CpuStorage::F64(d) => CpuStorage::F64(d[start..end].to_vec()),
        _ => candle_core::bail!("unsupported dtype for token collectives"),
    };
    Ok((out, layout.shape().clone()))
}

/// Gather token shards from every rank of `group` into the full tensor,
/// concatenated in rank order along `dim`.
///
/// Participates in reverse-mode differentiation: the gradient is
/// [`drop_tokens`] of the upstream gradient. With no group, or a single-rank
/// group, returns the input unchanged and attaches no node to the graph.
///
/// Every rank in the group must call this the same number of times, in the
/// same order, with matching `dim` and compatible shapes and dtypes.
pub fn gather_tokens(input: &Tensor, dim: usize, group: Option<&ParallelGroup>) -> Result<Tensor> {
    let Some(group) = group.filter(|g| !g.is_trivial()) else {
        // no tensor parallelism configured
        return Ok(input.clone());
    };
    let input = input.contiguous()?;
    Ok(input.apply_op1(DifferentiableCollective::gather(dim, group.clone()))?)
}

/// Divide a replicated tensor among the ranks of `group`, keeping this rank's
/// slice along `dim`.
///
/// Participates in reverse-mode differentiation: the gradient is
/// [`gather_tokens`] of the upstream gradient. With no group, or a
/// single-rank group, returns the input unchanged and attaches no node to the
/// graph.
///
/// Fails fast with [`ShardError::DimensionMismatch`] when `shape[dim]` is not
/// divisible by the world size.
pub fn drop_tokens(input: &Tensor, dim: usize, group: Option<&ParallelGroup>) -> Result<Tensor> {
    let Some(group) = group.filter(|g| !g.is_trivial()) else {
        return Ok(input.clone());
    };
    // Check before entering the op so a bad shape cannot stall peers that
    // already entered their collective.
    let size = input.dim(dim)?;
    if size % group.world_size() != 0 {
        return Err(ShardError::DimensionMismatch {
            dim,
            size,
            world_size: group.world_size(),
        });
    }
    let input = input.contiguous()?;
    Ok(input.apply_op1(DifferentiableCollective::shard(dim, group.clone()))?)
}

/// Forward-only [`gather_tokens`]: same values, no gradient node.
pub fn gather_tokens_detached(
    input: &Tensor,
    dim: usize,
    group: Option<&ParallelGroup>,
) -> Result<Tensor> {
    match group {
        Some(g) if !g.is_trivial() => DifferentiableCollective::gather(dim, g.clone()).trace(input),
        _ => Ok(input.clone()),
    }
}

/// Forward-only [`drop_tokens`]: same values, no gradient node.
pub fn drop_tokens_detached(
    input: &Tensor,
    dim: usize,
    group: Option<&ParallelGroup>,
) -> Result<Tensor> {
    match group {
        Some(g) if !g.is_trivial() => DifferentiableCollective::shard(dim, g.clone()).trace(input),
        _ => Ok(input.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_gather_without_group_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (2, 4, 8), &device)?;

        let y = gather_tokens(&x, 0, None)?;
        assert_eq!(x.to_vec3::<f32>()?, y.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_drop_with_trivial_group_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let group = ParallelGroup::solo();
        let x = Tensor::randn(0f32, 1f32, (3, 5), &device)?;

        let y = drop_tokens(&x, 1, Some(&group))?;
        assert_eq!(x.to_vec2::<f32>()?, y.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_drop_indivisible_dim_fails_fast() -> Result<()> {
        let device = Device::Cpu;
        let groups = ParallelGroup::local_groups(2)?;
        let x = Tensor::zeros((5, 4), DType::F32, &device)?;

        // Shard extraction is local, so no peer thread is needed here.
        let err = extract_shard(&x, 0, &groups[0]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("dimension 0 (5)"), "unexpected message: {msg}");
        assert!(msg.contains("world size (2)"), "unexpected message: {msg}");

        let ok = extract_shard(&x, 1, &groups[0])?;
        assert_eq!(ok.dims(), &[5, 2]);
        Ok(())
    }

    #[test]
    fn test_extract_shard_rank_slices() -> Result<()> {
        let device = Device::Cpu;
        let groups = ParallelGroup::local_groups(2)?;
        let x = Tensor::arange(0f32, 12f32, &device)?.reshape((6, 2))?;

        let lo = extract_shard(&x, 0, &groups[0])?;
        let hi = extract_shard(&x, 0, &groups[1])?;
        assert_eq!(lo.to_vec2::<f32>()?, vec![
            vec![0.0, 1.0],
            vec![2.0, 3.0],
            vec![4.0, 5.0],
        ]);
        assert_eq!(hi.to_vec2::<f32>()?, vec![
            vec![6.0, 7.0],
            vec![8.0, 9.0],
            vec![10.0, 11.0],
        ]);
        Ok(())
    }

    #[test]
    fn test_extract_shard_copy_mode_matches_view() -> Result<()> {
        let device = Device::Cpu;
        let groups = ParallelGroup::local_groups(4)?;
        let x = Tensor::arange(0f32, 16f32, &device)?.reshape((2, 8))?;

        for g in &groups {
            let view = extract_shard_with(&x, 1, g, ShardMode::View)?;
            let copy = extract_shard_with(&x, 1, g, ShardMode::Copy)?;
            assert_eq!(view.dims(), &[2, 2]);
            assert_eq!(view.to_vec2::<f32>()?, copy.to_vec2::<f32>()?);
        }
        Ok(())
    }

    #[test]
    fn test_drop_bad_dim_propagates() {
        let device = Device::Cpu;
        let groups = ParallelGroup::local_groups(2).unwrap();
        let x = Tensor::zeros((4, 4), DType::F32, &device).unwrap();

        assert!(drop_tokens(&x, 3, Some(&groups[0])).is_err());
    }
}

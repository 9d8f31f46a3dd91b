// file: src/kv_cache.rs
// description: Growable key/value cache operator that appends decode steps and exposes the live history as a view.
// author: cipher-rc5

use half::f16;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

use crate::config::{KvCacheConfig, KvStream};
use crate::dtype::{DType, Element};
use crate::error::{OpError, Result};
use crate::op::Operator;
use crate::parallel::WorkerPool;
use crate::tensor::{Layout, Shape, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheStats {
    pub live_len: usize,
    pub capacity: usize,
    pub grow_events: usize,
    pub bytes: usize,
}

/// Owned cache storage: a tensor whose sequence axis is the capacity, plus
/// the length of the live prefix.
#[derive(Debug)]
pub struct CacheBuffer {
    tensor: Tensor,
    live_len: usize,
    max_capacity: Option<usize>,
    grow_events: usize,
}

impl CacheBuffer {
    pub fn allocate(
        axes: Shape,
        capacity: usize,
        dtype: DType,
        layout: Layout,
        max_capacity: Option<usize>,
    ) -> Result<Self> {
        let limit = max_capacity.unwrap_or(usize::MAX);
        if capacity > limit {
            return Err(OpError::CapacityExhausted {
                required: capacity,
                limit,
            });
        }
        let tensor = Tensor::try_zeros(axes.with_sequence(capacity), dtype, layout)
            .map_err(|_| OpError::CapacityExhausted {
                required: capacity,
                limit,
            })?;
        Ok(Self {
            tensor,
            live_len: 0,
            max_capacity,
            grow_events: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.tensor.shape().sequence
    }

    pub fn live_len(&self) -> usize {
        self.live_len
    }

    /// Batch, head and dimension of the cache with the live length as sequence.
    pub fn live_shape(&self) -> Shape {
        self.tensor.shape().with_sequence(self.live_len)
    }

    /// Ensures room for `required` positions. Grows to at least twice the
    /// current capacity, bounded by the hard limit, and copies the live
    /// prefix across. Returns whether a reallocation happened.
    pub fn reserve(&mut self, required: usize, pool: Option<&WorkerPool>) -> Result<bool> {
        let capacity = self.capacity();
        if required <= capacity {
            return Ok(false);
        }
        let limit = self.max_capacity.unwrap_or(usize::MAX);
        if required > limit {
            return Err(OpError::CapacityExhausted { required, limit });
        }

        let new_capacity = required.max(capacity.saturating_mul(2)).min(limit);
        let mut grown = Tensor::try_zeros(
            self.tensor.shape().with_sequence(new_capacity),
            self.tensor.dtype(),
            self.tensor.layout(),
        )
        .map_err(|_| OpError::CapacityExhausted { required, limit })?;
        copy_tensor_rows(&self.tensor, &mut grown, self.live_len, 0, pool)?;

        debug!(
            "kv cache grew {} -> {} positions ({} live)",
            capacity, new_capacity, self.live_len
        );
        self.tensor = grown;
        self.grow_events += 1;
        Ok(true)
    }

    /// Copies `chunk` to sequence offset `live_len`. The caller reserves
    /// first; nothing is written when the chunk does not fit.
    pub fn append(&mut self, chunk: &Tensor, pool: Option<&WorkerPool>) -> Result<()> {
        let incoming = chunk.shape();
        if !incoming.same_non_sequence_axes(&self.tensor.shape()) {
            return Err(OpError::ShapeMismatch {
                context: "kv cache append",
                expected: self.live_shape().with_sequence(incoming.sequence),
                got: incoming,
            });
        }
        let required = self.live_len + incoming.sequence;
        if required > self.capacity() {
            return Err(OpError::CapacityExhausted {
                required,
                limit: self.capacity(),
            });
        }
        copy_tensor_rows(chunk, &mut self.tensor, incoming.sequence, self.live_len, pool)?;
        self.live_len = required;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.live_len = 0;
    }

    pub fn view(&self) -> KvView<'_> {
        KvView {
            tensor: &self.tensor,
            live_len: self.live_len,
        }
    }

    pub fn stats(&self) -> KvCacheStats {
        KvCacheStats {
            live_len: self.live_len,
            capacity: self.capacity(),
            grow_events: self.grow_events,
            bytes: self.tensor.as_bytes().len(),
        }
    }
}

/// Borrowed view of a cache's live prefix `[0, live_len)`.
#[derive(Debug, Clone, Copy)]
pub struct KvView<'a> {
    tensor: &'a Tensor,
    live_len: usize,
}

impl KvView<'_> {
    pub fn shape(&self) -> Shape {
        self.tensor.shape().with_sequence(self.live_len)
    }

    pub fn dtype(&self) -> DType {
        self.tensor.dtype()
    }

    pub fn layout(&self) -> Layout {
        self.tensor.layout()
    }

    pub fn get(&self, n: usize, h: usize, s: usize, d: usize) -> f32 {
        assert!(
            s < self.live_len,
            "position {s} is outside the live prefix of {}",
            self.live_len
        );
        self.tensor.get(n, h, s, d)
    }

    pub fn row(&self, n: usize, h: usize, s: usize) -> Vec<f32> {
        (0..self.tensor.shape().dimension)
            .map(|d| self.get(n, h, s, d))
            .collect()
    }

    /// Materialises the live prefix as an owned tensor.
    pub fn to_tensor(&self) -> Tensor {
        Tensor::from_fn(self.shape(), self.dtype(), self.layout(), |n, h, s, d| {
            self.tensor.get(n, h, s, d)
        })
    }
}

pub struct KvCacheOp {
    name: String,
    config: KvCacheConfig,
    pool: Option<Arc<WorkerPool>>,
    buffer: Option<CacheBuffer>,
}

impl KvCacheOp {
    /// The operator is named `{prefix}.k_cache` or `{prefix}.v_cache`.
    pub fn new(prefix: &str, config: KvCacheConfig) -> Result<Self> {
        let pool = if config.multi_thread {
            Some(WorkerPool::shared(config.threads)?)
        } else {
            None
        };
        Self::with_pool(prefix, config, pool)
    }

    /// Copies run on `pool` when one is given, serially otherwise.
    pub fn with_pool(
        prefix: &str,
        config: KvCacheConfig,
        pool: Option<Arc<WorkerPool>>,
    ) -> Result<Self> {
        config.validate()?;
        let name = format!("{prefix}.{}", config.stream.suffix());
        Ok(Self {
            name,
            config,
            pool,
            buffer: None,
        })
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    pub fn stream(&self) -> KvStream {
        self.config.stream
    }

    pub fn cached_len(&self) -> usize {
        self.buffer.as_ref().map_or(0, CacheBuffer::live_len)
    }

    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, CacheBuffer::capacity)
    }

    /// Allocates or grows the cache for `chunk` and reports the shape of the
    /// history after it is appended.
    pub fn reshape(&mut self, chunk: &Tensor) -> Result<Shape> {
        let incoming = chunk.shape();
        if let Some(buffer) = self.buffer.as_mut() {
            let live = buffer.live_shape();
            if !live.same_non_sequence_axes(&incoming) {
                return Err(OpError::ShapeMismatch {
                    context: "kv cache reshape",
                    expected: live.with_sequence(incoming.sequence),
                    got: incoming,
                });
            }
            let required = live.sequence + incoming.sequence;
            buffer.reserve(required, self.pool.as_deref())?;
            return Ok(live.with_sequence(required));
        }

        let capacity = self.config.cache_limit.max(incoming.sequence);
        debug!(
            "{}: allocating kv cache {} with capacity {}",
            self.name, incoming, capacity
        );
        self.buffer = Some(CacheBuffer::allocate(
            incoming,
            capacity,
            chunk.dtype(),
            chunk.layout(),
            self.config.max_capacity,
        )?);
        Ok(incoming)
    }

    /// Appends `chunk` and returns the full history including it.
    pub fn execute(&mut self, chunk: &Tensor) -> Result<KvView<'_>> {
        self.reshape(chunk)?;
        let pool = self.pool.as_deref();
        let buffer = self.buffer.as_mut().ok_or_else(|| OpError::NotPrepared {
            name: self.name.clone(),
            shape: chunk.shape(),
        })?;
        buffer.append(chunk, pool)?;
        Ok(buffer.view())
    }

    /// Live history without appending.
    pub fn view(&self) -> Option<KvView<'_>> {
        self.buffer.as_ref().map(CacheBuffer::view)
    }

    /// Starts a new session, keeping the allocated capacity.
    pub fn reset(&mut self) {
        if let Some(buffer) = &mut self.buffer {
            buffer.reset();
        }
    }

    pub fn stats(&self) -> KvCacheStats {
        self.buffer.as_ref().map_or(
            KvCacheStats {
                live_len: 0,
                capacity: 0,
                grow_events: 0,
                bytes: 0,
            },
            CacheBuffer::stats,
        )
    }
}

impl Operator for KvCacheOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn free(&mut self) {
        if self.buffer.take().is_some() {
            debug!("{}: released kv cache", self.name);
        }
    }
}

fn copy_tensor_rows(
    src: &Tensor,
    dst: &mut Tensor,
    len: usize,
    offset: usize,
    pool: Option<&WorkerPool>,
) -> Result<()> {
    let (src_shape, src_layout) = (src.shape(), src.layout());
    let (dst_shape, dst_layout) = (dst.shape(), dst.layout());
    let plan = RowCopy {
        src_shape,
        src_layout,
        dst_shape,
        dst_layout,
        len,
        offset,
    };
    match (src.dtype(), dst.dtype()) {
        (DType::F32, DType::F32) => {
            plan.run(src.as_slice::<f32>()?, dst.as_mut_slice::<f32>()?, pool)
        }
        (DType::F32, DType::F16) => {
            plan.run(src.as_slice::<f32>()?, dst.as_mut_slice::<f16>()?, pool)
        }
        (DType::F16, DType::F32) => {
            plan.run(src.as_slice::<f16>()?, dst.as_mut_slice::<f32>()?, pool)
        }
        (DType::F16, DType::F16) => {
            plan.run(src.as_slice::<f16>()?, dst.as_mut_slice::<f16>()?, pool)
        }
    }
    Ok(())
}

/// Copies sequence rows `[0, len)` of the source to `[offset, offset + len)`
/// of the destination.
struct RowCopy {
    src_shape: Shape,
    src_layout: Layout,
    dst_shape: Shape,
    dst_layout: Layout,
    len: usize,
    offset: usize,
}

impl RowCopy {
    // Destination blocks are the spans above the sequence axis: one
    // (batch, head) pair for Bhsd, one batch for Bshd.
    fn run<S: Element, D: Element>(&self, src: &[S], dst: &mut [D], pool: Option<&WorkerPool>) {
        let dim = self.dst_shape.dimension;
        let heads = self.dst_shape.head;
        let block_len = match self.dst_layout {
            Layout::Bhsd => self.dst_shape.sequence * dim,
            Layout::Bshd => self.dst_shape.sequence * heads * dim,
        };
        if block_len == 0 || self.len == 0 {
            return;
        }

        let fill = |(block, out): (usize, &mut [D])| {
            let (n, head_range) = match self.dst_layout {
                Layout::Bhsd => (block / heads, (block % heads)..(block % heads + 1)),
                Layout::Bshd => (block, 0..heads),
            };
            for h in head_range {
                for s in 0..self.len {
                    let dst_row = match self.dst_layout {
                        Layout::Bhsd => self.offset + s,
                        Layout::Bshd => (self.offset + s) * heads + h,
                    };
                    let dst_start = dst_row * dim;
                    let src_start = self.src_layout.row_index(&self.src_shape, n, h, s) * dim;
                    copy_row(
                        &src[src_start..src_start + dim],
                        &mut out[dst_start..dst_start + dim],
                    );
                }
            }
        };

        match pool {
            Some(pool) => {
                pool.install(|| dst.par_chunks_mut(block_len).enumerate().for_each(fill))
            }
            None => dst.chunks_mut(block_len).enumerate().for_each(fill),
        }
    }
}

#[inline]
fn copy_row<S: Element, D: Element>(src: &[S], dst: &mut [D]) {
    if S::DTYPE == D::DTYPE {
        dst.copy_from_slice(bytemuck::cast_slice(src));
    } else {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = D::from_f32(s.to_f32());
        }
    }
}

// file: src/rope.rs
// description: Rotary positional embedding operator covering the interleaved, half-split, quarter-split and deinterleave conventions.
// author: cipher-rc5
// created: 2026-02-21
// modified: 2026-10-18

use half::f16;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{CursorPolicy, RopeConfig, RopeVariant};
use crate::dtype::{load_row, store_row, DType, Element};
use crate::error::{OpError, Result};
use crate::op::Operator;
use crate::parallel::WorkerPool;
use crate::position_table::{PositionTables, TableKind, TableRegistry, DEFAULT_ROPE_BASE};
use crate::tensor::{Layout, Shape, Tensor};

/// Absolute position of the next token handed to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionCursor {
    value: usize,
    max_positions: usize,
    policy: CursorPolicy,
}

impl PositionCursor {
    pub fn new(max_positions: usize, policy: CursorPolicy) -> Self {
        Self {
            value: 0,
            max_positions,
            policy,
        }
    }

    pub fn value(&self) -> usize {
        self.value
    }

    /// Fails if a call covering `len` positions is not allowed from here.
    pub fn check(&self, len: usize) -> Result<()> {
        if self.policy == CursorPolicy::Reject && self.value + len > self.max_positions {
            return Err(OpError::PositionOverflow {
                position: self.value + len - 1,
                max_positions: self.max_positions,
            });
        }
        Ok(())
    }

    /// Table row for local sequence offset `offset` within the current call.
    #[inline]
    pub fn position(&self, offset: usize) -> usize {
        (self.value + offset) % self.max_positions
    }

    pub fn advance(&mut self, len: usize) {
        self.value = match self.policy {
            CursorPolicy::Wrap => (self.value + len) % self.max_positions,
            CursorPolicy::Reject => self.value + len,
        };
    }

    pub fn set(&mut self, value: usize) -> Result<()> {
        if value >= self.max_positions {
            return Err(OpError::PositionOverflow {
                position: value,
                max_positions: self.max_positions,
            });
        }
        self.value = value;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }
}

/// `out[d], out[d+1]` rotate the adjacent pair `(d, d+1)`.
pub fn rotate_interleaved(src: &[f32], sin: &[f32], cos: &[f32], dst: &mut [f32], active: usize) {
    for d in (0..active).step_by(2) {
        let (x, y) = (src[d], src[d + 1]);
        dst[d] = x * cos[d] - y * sin[d];
        dst[d + 1] = x * sin[d] + y * cos[d];
    }
}

/// Half-split rotation addressing each element of a pair by index.
pub fn rotate_half_split_indexed(
    src: &[f32],
    sin: &[f32],
    cos: &[f32],
    dst: &mut [f32],
    active: usize,
) {
    let half = active / 2;
    for d in 0..half {
        let (x, y) = (src[d], src[d + half]);
        dst[d] = x * cos[d] - y * sin[d];
        dst[d + half] = x * sin[d] + y * cos[d];
    }
}

/// Half-split rotation over the two halves of one row slice.
pub fn rotate_half_split_sliced(
    src: &[f32],
    sin: &[f32],
    cos: &[f32],
    dst: &mut [f32],
    active: usize,
) {
    let half = active / 2;
    let (lo, hi) = src[..2 * half].split_at(half);
    let (out_lo, out_hi) = dst[..2 * half].split_at_mut(half);
    let pairs = lo.iter().zip(hi).zip(sin[..half].iter().zip(&cos[..half]));
    for ((o_lo, o_hi), ((&x, &y), (&s, &c))) in out_lo.iter_mut().zip(out_hi.iter_mut()).zip(pairs) {
        *o_lo = x * c - y * s;
        *o_hi = x * s + y * c;
    }
}

/// Bands `[0, q)` and `[q, 2q)` rotate against each other with `q = active / 4`;
/// `[2q, active)` passes through.
pub fn rotate_quarter_split(src: &[f32], sin: &[f32], cos: &[f32], dst: &mut [f32], active: usize) {
    let quarter = active / 4;
    for d in 0..active {
        dst[d] = if d < quarter {
            src[d] * cos[d] + -src[d + quarter] * sin[d]
        } else if d < 2 * quarter {
            src[d] * cos[d] + src[d - quarter] * sin[d]
        } else {
            src[d]
        };
    }
}

/// Reads even features into the first half of the row and odd features into
/// the second, writing one value per feature.
pub fn rotate_deinterleave(src: &[f32], sin: &[f32], cos: &[f32], dst: &mut [f32], active: usize) {
    let half_dim = src.len() / 2;
    for d in 0..active {
        let (value, paired) = if d < half_dim {
            (src[2 * d], -src[2 * d + 1])
        } else {
            let j = d - half_dim;
            (src[2 * j + 1], src[2 * j])
        };
        dst[d] = value * cos[d] + paired * sin[d];
    }
}

#[derive(Debug, Clone)]
struct Prepared {
    dimension: usize,
    active_dim: usize,
    tables: Arc<PositionTables>,
}

pub struct RopeOp {
    name: String,
    config: RopeConfig,
    registry: Arc<TableRegistry>,
    pool: Arc<WorkerPool>,
    cursor: PositionCursor,
    prepared: Option<Prepared>,
}

impl RopeOp {
    pub fn new(name: impl Into<String>, config: RopeConfig) -> Result<Self> {
        Self::with_registry(name, config, TableRegistry::global())
    }

    pub fn with_registry(
        name: impl Into<String>,
        config: RopeConfig,
        registry: Arc<TableRegistry>,
    ) -> Result<Self> {
        let pool = WorkerPool::shared(config.threads)?;
        Self::with_resources(name, config, registry, pool)
    }

    /// Builds the operator on caller-provided tables and workers.
    pub fn with_resources(
        name: impl Into<String>,
        config: RopeConfig,
        registry: Arc<TableRegistry>,
        pool: Arc<WorkerPool>,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        if config.variant == RopeVariant::Interleaved && config.theta != DEFAULT_ROPE_BASE {
            warn!(
                "{}: theta={} is ignored by the interleaved variant (base {})",
                name, config.theta, DEFAULT_ROPE_BASE
            );
        }
        let cursor = PositionCursor::new(config.max_positions, config.cursor_policy);
        Ok(Self {
            name,
            config,
            registry,
            pool,
            cursor,
            prepared: None,
        })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn position(&self) -> usize {
        self.cursor.value()
    }

    pub fn set_position(&mut self, position: usize) -> Result<()> {
        self.cursor.set(position)
    }

    /// Fails if a call of `len` positions would be rejected by the cursor.
    pub fn check_positions(&self, len: usize) -> Result<()> {
        self.cursor.check(len)
    }

    /// Starts a new generation session at position zero.
    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    /// Number of rotated features for a row of `dimension` features.
    pub fn active_dim(&self, dimension: usize) -> usize {
        (dimension as f32 * self.config.partial_rotary_factor) as usize
    }

    /// Validates `shape` for this variant and fetches the position tables
    /// execution will read. Returns the output shape.
    pub fn reshape(&mut self, shape: &Shape) -> Result<Shape> {
        let dimension = shape.dimension;
        if let Some(prepared) = &self.prepared {
            if prepared.dimension == dimension {
                return Ok(*shape);
            }
        }

        let active_dim = self.active_dim(dimension);
        self.check_active_dim(dimension, active_dim)?;

        let (kind, width) = match self.config.variant {
            RopeVariant::Interleaved => (TableKind::Interleaved, active_dim),
            RopeVariant::HalfSplit | RopeVariant::Deinterleave => (TableKind::HalfSplit, active_dim),
            RopeVariant::QuarterSplit => (TableKind::HalfSplit, active_dim / 2),
        };
        let tables = self.registry.tables_for(
            kind,
            width,
            self.config.table_base(),
            self.config.max_positions,
        )?;

        debug!(
            "{}: prepared {:?} rope, dimension={}, active_dim={}",
            self.name, self.config.variant, dimension, active_dim
        );
        self.prepared = Some(Prepared {
            dimension,
            active_dim,
            tables,
        });
        Ok(*shape)
    }

    fn check_active_dim(&self, dimension: usize, active_dim: usize) -> Result<()> {
        if active_dim == 0 {
            return Err(OpError::config(format!(
                "partial rotary factor {} leaves no rotated features for dimension {}",
                self.config.partial_rotary_factor, dimension
            )));
        }
        let ok = match self.config.variant {
            RopeVariant::Interleaved | RopeVariant::HalfSplit => active_dim % 2 == 0,
            RopeVariant::QuarterSplit => active_dim % 4 == 0,
            RopeVariant::Deinterleave => dimension % 2 == 0,
        };
        if !ok {
            return Err(OpError::config(format!(
                "{:?} rope cannot rotate active_dim={} of dimension={}",
                self.config.variant, active_dim, dimension
            )));
        }
        Ok(())
    }

    /// Rotates `input` into `output` at the cursor's positions, then advances
    /// the cursor by the sequence length.
    pub fn execute(&mut self, input: &Tensor, output: &mut Tensor) -> Result<()> {
        let shape = input.shape();
        if output.shape() != shape {
            return Err(OpError::ShapeMismatch {
                context: "rope output",
                expected: shape,
                got: output.shape(),
            });
        }
        let prepared = match &self.prepared {
            Some(p) if p.dimension == shape.dimension => p.clone(),
            _ => {
                return Err(OpError::NotPrepared {
                    name: self.name.clone(),
                    shape,
                })
            }
        };
        self.cursor.check(shape.sequence)?;

        if shape.numel() > 0 {
            let plan = RowPlan {
                variant: self.config.variant,
                shape,
                active_dim: prepared.active_dim,
                src_layout: input.layout(),
                dst_layout: output.layout(),
                cursor: self.cursor,
                tables: &prepared.tables,
            };
            match (input.dtype(), output.dtype()) {
                (DType::F32, DType::F32) => {
                    plan.run(&self.pool, input.as_slice::<f32>()?, output.as_mut_slice::<f32>()?)
                }
                (DType::F32, DType::F16) => {
                    plan.run(&self.pool, input.as_slice::<f32>()?, output.as_mut_slice::<f16>()?)
                }
                (DType::F16, DType::F32) => {
                    plan.run(&self.pool, input.as_slice::<f16>()?, output.as_mut_slice::<f32>()?)
                }
                (DType::F16, DType::F16) => {
                    plan.run(&self.pool, input.as_slice::<f16>()?, output.as_mut_slice::<f16>()?)
                }
            }
        }

        self.cursor.advance(shape.sequence);
        Ok(())
    }

    /// Reshape, allocate an output in the input's layout, and execute.
    pub fn forward(&mut self, input: &Tensor, out_dtype: DType) -> Result<Tensor> {
        let shape = self.reshape(&input.shape())?;
        let mut output = Tensor::zeros(shape, out_dtype, input.layout());
        self.execute(input, &mut output)?;
        Ok(output)
    }
}

impl Operator for RopeOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn free(&mut self) {
        self.prepared = None;
    }
}

/// Everything one call needs to rotate a single (batch, head, sequence) row.
struct RowPlan<'a> {
    variant: RopeVariant,
    shape: Shape,
    active_dim: usize,
    src_layout: Layout,
    dst_layout: Layout,
    cursor: PositionCursor,
    tables: &'a PositionTables,
}

impl RowPlan<'_> {
    fn rotate(&self, src: &[f32], sin: &[f32], cos: &[f32], dst: &mut [f32]) {
        let active = self.active_dim;
        match self.variant {
            RopeVariant::Interleaved => rotate_interleaved(src, sin, cos, dst, active),
            RopeVariant::HalfSplit if self.dst_layout == Layout::Bshd => {
                rotate_half_split_sliced(src, sin, cos, dst, active)
            }
            RopeVariant::HalfSplit => rotate_half_split_indexed(src, sin, cos, dst, active),
            RopeVariant::QuarterSplit => rotate_quarter_split(src, sin, cos, dst, active),
            RopeVariant::Deinterleave => rotate_deinterleave(src, sin, cos, dst, active),
        }
    }

    // Every output row is written by exactly one task.
    fn run<I: Element, O: Element>(&self, pool: &WorkerPool, src: &[I], dst: &mut [O]) {
        let dim = self.shape.dimension;
        let active = self.active_dim;
        pool.install(|| {
            dst.par_chunks_mut(dim).enumerate().for_each_init(
                || (vec![0.0f32; dim], vec![0.0f32; dim]),
                |(row_in, row_out), (row, out)| {
                    let (n, h, s) = self.dst_layout.decode_row(&self.shape, row);
                    let start = self.src_layout.row_index(&self.shape, n, h, s) * dim;
                    load_row(&src[start..start + dim], row_in);

                    let pos = self.cursor.position(s);
                    let sin = self.tables.sin_row(pos);
                    let cos = self.tables.cos_row(pos);
                    self.rotate(row_in, sin, cos, row_out);
                    row_out[active..].copy_from_slice(&row_in[active..]);

                    store_row(row_out, out);
                },
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(config: RopeConfig) -> RopeOp {
        RopeOp::with_registry("test.rope", config.with_threads(2), Arc::new(TableRegistry::new()))
            .unwrap()
    }

    fn row_tensor(values: &[f32], sequence: usize) -> Tensor {
        let dim = values.len();
        Tensor::from_fn(
            Shape::new(1, 1, sequence, dim),
            DType::F32,
            Layout::Bhsd,
            |_, _, _, d| values[d],
        )
    }

    #[test]
    fn test_interleaved_identity_then_rotation() {
        let mut rope = op(RopeConfig::new(RopeVariant::Interleaved));
        let input = row_tensor(&[1.0, 0.0, 1.0, 0.0], 1);

        let out = rope.forward(&input, DType::F32).unwrap();
        assert_eq!(out.to_logical_vec(), vec![1.0, 0.0, 1.0, 0.0]);
        assert_eq!(rope.position(), 1);

        let out = rope.forward(&input, DType::F32).unwrap().to_logical_vec();
        let expected = [
            1.0f64.cos() as f32,
            1.0f64.sin() as f32,
            0.01f64.cos() as f32,
            0.01f64.sin() as f32,
        ];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() <= 1e-5 * want.abs().max(1e-3), "{got} vs {want}");
        }
    }

    #[test]
    fn test_half_split_pairs_across_halves() {
        let mut rope = op(RopeConfig::new(RopeVariant::HalfSplit));
        rope.set_position(3).unwrap();
        let input = row_tensor(&[1.0, 2.0, 3.0, 4.0], 1);
        let out = rope.forward(&input, DType::F32).unwrap().to_logical_vec();

        let angle = 3.0f32;
        let (s, c) = (angle.sin(), angle.cos());
        assert!((out[0] - (1.0 * c - 3.0 * s)).abs() < 1e-6);
        assert!((out[2] - (1.0 * s + 3.0 * c)).abs() < 1e-6);
    }

    #[test]
    fn test_quarter_split_passes_upper_band() {
        let mut rope = op(RopeConfig::new(RopeVariant::QuarterSplit));
        rope.set_position(7).unwrap();
        let values = [0.5, -1.0, 2.0, 0.25, 9.0, 8.0, 7.0, 6.0];
        let out = rope.forward(&row_tensor(&values, 1), DType::F32).unwrap().to_logical_vec();
        assert_eq!(&out[4..], &values[4..]);
        let before = values[0] * values[0] + values[2] * values[2];
        let after = out[0] * out[0] + out[2] * out[2];
        assert!((before - after).abs() < 1e-4);
    }

    #[test]
    fn test_partial_rotation_passthrough_to_f16() {
        let mut rope = op(RopeConfig::new(RopeVariant::HalfSplit).with_partial_rotary_factor(0.5));
        rope.set_position(11).unwrap();
        let values = [0.3, 0.7, -1.1, 2.2, 1.2345, -6.5, 100.1, 0.001];
        let out = rope.forward(&row_tensor(&values, 1), DType::F16).unwrap();
        assert_eq!(out.dtype(), DType::F16);
        let out = out.to_logical_vec();
        for d in 4..8 {
            assert_eq!(out[d], f16::from_f32(values[d]).to_f32());
        }
    }

    #[test]
    fn test_deinterleave_identity_at_zero() {
        let mut rope = op(RopeConfig::new(RopeVariant::Deinterleave));
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = rope.forward(&row_tensor(&values, 1), DType::F32).unwrap().to_logical_vec();
        // even features first, then odd
        assert_eq!(out, vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_cursor_wraps_at_max_positions() {
        let mut rope = op(RopeConfig::new(RopeVariant::HalfSplit).with_max_positions(4));
        let input = row_tensor(&[1.0, 0.0, 0.0, 1.0], 2);
        rope.forward(&input, DType::F32).unwrap();
        rope.forward(&input, DType::F32).unwrap();
        assert_eq!(rope.position(), 0);

        let single = row_tensor(&[1.0, 0.0, 0.0, 1.0], 1);
        let out = rope.forward(&single, DType::F32).unwrap();
        assert_eq!(out.to_logical_vec(), vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_cursor_reject_policy() {
        let config = RopeConfig::new(RopeVariant::Interleaved)
            .with_max_positions(3)
            .with_cursor_policy(CursorPolicy::Reject);
        let mut rope = op(config);
        let input = row_tensor(&[1.0, 2.0], 2);
        rope.forward(&input, DType::F32).unwrap();
        assert!(matches!(
            rope.forward(&input, DType::F32),
            Err(OpError::PositionOverflow { position: 3, max_positions: 3 })
        ));
        assert_eq!(rope.position(), 2);
        rope.reset();
        assert_eq!(rope.position(), 0);
    }

    #[test]
    fn test_execute_requires_reshape() {
        let mut rope = op(RopeConfig::new(RopeVariant::HalfSplit));
        let input = row_tensor(&[1.0, 2.0, 3.0, 4.0], 1);
        let mut output = Tensor::zeros(input.shape(), DType::F32, Layout::Bhsd);
        assert!(matches!(
            rope.execute(&input, &mut output),
            Err(OpError::NotPrepared { .. })
        ));
    }

    #[test]
    fn test_rejects_unrotatable_dimensions() {
        let mut rope = op(RopeConfig::new(RopeVariant::QuarterSplit));
        assert!(rope.reshape(&Shape::new(1, 1, 1, 6)).is_err());

        let mut rope = op(RopeConfig::new(RopeVariant::Interleaved).with_partial_rotary_factor(0.1));
        assert!(matches!(
            rope.reshape(&Shape::new(1, 1, 1, 4)),
            Err(OpError::Config { .. })
        ));

        let mut rope = op(RopeConfig::new(RopeVariant::Deinterleave));
        assert!(rope.reshape(&Shape::new(1, 1, 1, 5)).is_err());
    }

    #[test]
    fn test_reshape_uses_registry_once_per_dimension() {
        let registry = Arc::new(TableRegistry::new());
        let config = RopeConfig::new(RopeVariant::HalfSplit).with_max_positions(32);
        let mut q = RopeOp::with_registry("q", config.clone(), Arc::clone(&registry)).unwrap();
        let mut k = RopeOp::with_registry("k", config, Arc::clone(&registry)).unwrap();
        q.reshape(&Shape::new(1, 4, 3, 8)).unwrap();
        k.reshape(&Shape::new(1, 2, 1, 8)).unwrap();
        q.reshape(&Shape::new(1, 4, 1, 8)).unwrap();
        assert_eq!(registry.generation_count(), 1);
    }

    #[test]
    fn test_sliced_and_indexed_half_split_agree() {
        let src: Vec<f32> = (0..10).map(|i| (i as f32 * 0.37).sin() * 3.0).collect();
        let tables = PositionTables::build(TableKind::HalfSplit, 8, 64, 10_000.0).unwrap();
        let mut a = vec![0.0; 10];
        let mut b = vec![0.0; 10];
        rotate_half_split_indexed(&src, tables.sin_row(41), tables.cos_row(41), &mut a, 8);
        rotate_half_split_sliced(&src, tables.sin_row(41), tables.cos_row(41), &mut b, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn test_free_drops_prepared_tables() {
        let mut rope = op(RopeConfig::new(RopeVariant::HalfSplit));
        let input = row_tensor(&[1.0, 2.0, 3.0, 4.0], 1);
        rope.forward(&input, DType::F32).unwrap();
        rope.free();
        let mut output = Tensor::zeros(input.shape(), DType::F32, Layout::Bhsd);
        assert!(rope.execute(&input, &mut output).is_err());
        assert!(rope.load().is_ok());
        assert_eq!(rope.name(), "test.rope");
    }
}

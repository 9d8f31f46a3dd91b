// file: src/position_table.rs
// description: Precomputed sine/cosine position tables and the shared registry that owns them.
// author: cipher-rc5

use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::debug;

use crate::error::{OpError, Result};

pub const DEFAULT_ROPE_BASE: f32 = 10_000.0;

/// Frequency layout of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// Adjacent features `2i` and `2i + 1` share frequency `i`.
    Interleaved,
    /// Frequency index restarts at zero at `width / 2`.
    HalfSplit,
}

/// Sine and cosine rows for positions `[0, max_positions)`.
#[derive(Debug, Clone)]
pub struct PositionTables {
    pub kind: TableKind,
    pub width: usize,
    pub max_positions: usize,
    pub base: f32,
    sin: Vec<f32>,
    cos: Vec<f32>,
}

impl PositionTables {
    pub fn build(kind: TableKind, width: usize, max_positions: usize, base: f32) -> Result<Self> {
        if width == 0 {
            return Err(OpError::config("position table width must be greater than zero"));
        }
        if !base.is_finite() || base <= 0.0 {
            return Err(OpError::config(format!(
                "position table base must be finite and positive, got {base}"
            )));
        }

        let mut sin = vec![0.0f32; max_positions * width];
        let mut cos = vec![0.0f32; max_positions * width];

        sin.par_chunks_mut(width)
            .zip(cos.par_chunks_mut(width))
            .enumerate()
            .for_each(|(pos, (sin_row, cos_row))| match kind {
                TableKind::Interleaved => fill_interleaved(pos, base, sin_row, cos_row),
                TableKind::HalfSplit => fill_half_split(pos, base, sin_row, cos_row),
            });

        Ok(Self {
            kind,
            width,
            max_positions,
            base,
            sin,
            cos,
        })
    }

    #[inline]
    pub fn sin_row(&self, pos: usize) -> &[f32] {
        &self.sin[pos * self.width..(pos + 1) * self.width]
    }

    #[inline]
    pub fn cos_row(&self, pos: usize) -> &[f32] {
        &self.cos[pos * self.width..(pos + 1) * self.width]
    }
}

// The angle is formed and evaluated in f64, then narrowed.
fn fill_interleaved(pos: usize, base: f32, sin_row: &mut [f32], cos_row: &mut [f32]) {
    let width = sin_row.len();
    let mut d = 0;
    while d < width {
        let i = d / 2;
        let angle = pos as f64 / (base as f64).powf(2.0 * i as f64 / width as f64);
        let (s, c) = (angle.sin() as f32, angle.cos() as f32);
        sin_row[d] = s;
        cos_row[d] = c;
        if d + 1 < width {
            sin_row[d + 1] = s;
            cos_row[d + 1] = c;
        }
        d += 2;
    }
}

// The quotient is formed in f64; sin/cos run in f32.
fn fill_half_split(pos: usize, base: f32, sin_row: &mut [f32], cos_row: &mut [f32]) {
    let width = sin_row.len();
    let half = width / 2;
    for d in 0..width {
        let i = if d < half { d } else { d - half };
        let angle = (pos as f64 / (base as f64).powf(2.0 * i as f64 / width as f64)) as f32;
        sin_row[d] = angle.sin();
        cos_row[d] = angle.cos();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TableKey {
    kind: TableKind,
    width: usize,
    base_bits: u32,
}

/// Shared owner of position tables.
///
/// Tables are built at most once per (kind, width, base) and rebuilt only
/// to cover more positions. Published tables are immutable, so readers never
/// observe a build in progress.
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: Mutex<HashMap<TableKey, Arc<PositionTables>>>,
    generations: AtomicUsize,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used when an operator is not given its own.
    pub fn global() -> Arc<TableRegistry> {
        static REGISTRY: OnceLock<Arc<TableRegistry>> = OnceLock::new();
        Arc::clone(REGISTRY.get_or_init(|| Arc::new(TableRegistry::new())))
    }

    pub fn tables_for(
        &self,
        kind: TableKind,
        width: usize,
        base: f32,
        max_positions: usize,
    ) -> Result<Arc<PositionTables>> {
        let key = TableKey {
            kind,
            width,
            base_bits: base.to_bits(),
        };
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = tables.get(&key) {
            if existing.max_positions >= max_positions {
                return Ok(Arc::clone(existing));
            }
        }

        debug!(
            "Generating {:?} position tables: width={}, positions={}, base={}",
            kind, width, max_positions, base
        );
        let built = Arc::new(PositionTables::build(kind, width, max_positions, base)?);
        self.generations.fetch_add(1, Ordering::Relaxed);
        tables.insert(key, Arc::clone(&built));
        Ok(built)
    }

    /// Number of table builds performed so far.
    pub fn generation_count(&self) -> usize {
        self.generations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(lhs: f32, rhs: f32, tol: f32) {
        assert!(
            (lhs - rhs).abs() <= tol,
            "expected {lhs} ~= {rhs} (tol={tol}), diff={}",
            (lhs - rhs).abs()
        );
    }

    #[test]
    fn test_position_zero_is_identity_row() {
        for kind in [TableKind::Interleaved, TableKind::HalfSplit] {
            let tables = PositionTables::build(kind, 8, 3, DEFAULT_ROPE_BASE).unwrap();
            assert!(tables.sin_row(0).iter().all(|&v| v == 0.0));
            assert!(tables.cos_row(0).iter().all(|&v| v == 1.0));
        }
    }

    #[test]
    fn test_interleaved_pairs_share_values() {
        let tables = PositionTables::build(TableKind::Interleaved, 4, 2, DEFAULT_ROPE_BASE).unwrap();
        let sin = tables.sin_row(1);
        let cos = tables.cos_row(1);
        approx_eq(sin[0], 1.0f32.sin(), 1e-6);
        approx_eq(cos[0], 1.0f32.cos(), 1e-6);
        assert_eq!(sin[0], sin[1]);
        approx_eq(sin[2], 0.01f32.sin(), 1e-6);
        assert_eq!(cos[2], cos[3]);
    }

    #[test]
    fn test_half_split_restarts_frequency_index() {
        let tables = PositionTables::build(TableKind::HalfSplit, 6, 4, 500.0).unwrap();
        for pos in 0..4 {
            let sin = tables.sin_row(pos);
            assert_eq!(&sin[..3], &sin[3..]);
        }
        approx_eq(tables.sin_row(3)[0], 3.0f32.sin(), 1e-6);
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(matches!(
            PositionTables::build(TableKind::HalfSplit, 0, 4, 10.0),
            Err(OpError::Config { .. })
        ));
        assert!(PositionTables::build(TableKind::HalfSplit, 4, 4, f32::NAN).is_err());
        assert!(PositionTables::build(TableKind::Interleaved, 4, 4, -1.0).is_err());
    }

    #[test]
    fn test_registry_generates_once_and_grows() {
        let registry = TableRegistry::new();
        let a = registry
            .tables_for(TableKind::HalfSplit, 8, DEFAULT_ROPE_BASE, 16)
            .unwrap();
        let b = registry
            .tables_for(TableKind::HalfSplit, 8, DEFAULT_ROPE_BASE, 8)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.generation_count(), 1);

        let grown = registry
            .tables_for(TableKind::HalfSplit, 8, DEFAULT_ROPE_BASE, 32)
            .unwrap();
        assert_eq!(grown.max_positions, 32);
        assert_eq!(grown.sin_row(5), a.sin_row(5));
        assert_eq!(registry.generation_count(), 2);

        registry
            .tables_for(TableKind::Interleaved, 8, DEFAULT_ROPE_BASE, 16)
            .unwrap();
        registry.tables_for(TableKind::HalfSplit, 4, DEFAULT_ROPE_BASE, 16).unwrap();
        assert_eq!(registry.generation_count(), 4);
    }
}

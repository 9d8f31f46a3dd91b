// file: src/tensor.rs
// description: Owned 4-axis (batch, head, sequence, dimension) tensor with layout tag and f32/f16 storage.
// author: cipher-rc5

use half::f16;
use std::collections::TryReserveError;
use std::fmt;

use crate::dtype::{DType, Element};
use crate::error::{OpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub batch: usize,
    pub head: usize,
    pub sequence: usize,
    pub dimension: usize,
}

impl Shape {
    pub fn new(batch: usize, head: usize, sequence: usize, dimension: usize) -> Self {
        Self {
            batch,
            head,
            sequence,
            dimension,
        }
    }

    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        match *dims {
            [batch, head, sequence, dimension] => Ok(Self::new(batch, head, sequence, dimension)),
            _ => Err(OpError::RankMismatch { rank: dims.len() }),
        }
    }

    pub fn numel(&self) -> usize {
        self.batch * self.head * self.sequence * self.dimension
    }

    /// Number of contiguous feature rows.
    pub fn rows(&self) -> usize {
        self.batch * self.head * self.sequence
    }

    pub fn with_sequence(self, sequence: usize) -> Self {
        Self { sequence, ..self }
    }

    /// True when batch, head and dimension agree; sequence may differ.
    pub fn same_non_sequence_axes(&self, other: &Shape) -> bool {
        self.batch == other.batch && self.head == other.head && self.dimension == other.dimension
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.batch, self.head, self.sequence, self.dimension
        )
    }
}

/// Physical ordering of the logical axes.
///
/// The feature axis is innermost in both, so every (batch, head, sequence)
/// row is contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    /// Head-major: batch, head, sequence, dimension.
    #[default]
    Bhsd,
    /// Sequence-major: batch, sequence, head, dimension.
    Bshd,
}

impl Layout {
    #[inline]
    pub fn row_index(self, shape: &Shape, n: usize, h: usize, s: usize) -> usize {
        match self {
            Layout::Bhsd => (n * shape.head + h) * shape.sequence + s,
            Layout::Bshd => (n * shape.sequence + s) * shape.head + h,
        }
    }

    /// Inverse of [`Layout::row_index`].
    #[inline]
    pub fn decode_row(self, shape: &Shape, row: usize) -> (usize, usize, usize) {
        match self {
            Layout::Bhsd => {
                let s = row % shape.sequence;
                let h = (row / shape.sequence) % shape.head;
                let n = row / (shape.sequence * shape.head);
                (n, h, s)
            }
            Layout::Bshd => {
                let h = row % shape.head;
                let s = (row / shape.head) % shape.sequence;
                let n = row / (shape.head * shape.sequence);
                (n, h, s)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl Storage {
    fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Storage::F32(vec![0.0; len]),
            DType::F16 => Storage::F16(vec![f16::ZERO; len]),
        }
    }

    fn try_zeros(dtype: DType, len: usize) -> std::result::Result<Self, TryReserveError> {
        Ok(match dtype {
            DType::F32 => {
                let mut v = Vec::new();
                v.try_reserve_exact(len)?;
                v.resize(len, 0.0f32);
                Storage::F32(v)
            }
            DType::F16 => {
                let mut v = Vec::new();
                v.try_reserve_exact(len)?;
                v.resize(len, f16::ZERO);
                Storage::F16(v)
            }
        })
    }

    fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F16(_) => DType::F16,
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::F16(v) => v.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    layout: Layout,
    storage: Storage,
}

impl Tensor {
    pub fn zeros(shape: Shape, dtype: DType, layout: Layout) -> Self {
        Self {
            shape,
            layout,
            storage: Storage::zeros(dtype, shape.numel()),
        }
    }

    /// Fallible allocation, used where running out of memory must surface
    /// as an error instead of an abort.
    pub(crate) fn try_zeros(
        shape: Shape,
        dtype: DType,
        layout: Layout,
    ) -> std::result::Result<Self, TryReserveError> {
        Ok(Self {
            shape,
            layout,
            storage: Storage::try_zeros(dtype, shape.numel())?,
        })
    }

    /// Builds a tensor from a function of the logical index.
    pub fn from_fn<F>(shape: Shape, dtype: DType, layout: Layout, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize, usize) -> f32,
    {
        let mut tensor = Self::zeros(shape, dtype, layout);
        for n in 0..shape.batch {
            for h in 0..shape.head {
                for s in 0..shape.sequence {
                    for d in 0..shape.dimension {
                        tensor.set(n, h, s, d, f(n, h, s, d));
                    }
                }
            }
        }
        tensor
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn row_offset(&self, n: usize, h: usize, s: usize) -> usize {
        self.layout.row_index(&self.shape, n, h, s) * self.shape.dimension
    }

    #[inline]
    pub fn offset(&self, n: usize, h: usize, s: usize, d: usize) -> usize {
        debug_assert!(d < self.shape.dimension);
        self.row_offset(n, h, s) + d
    }

    pub fn get(&self, n: usize, h: usize, s: usize, d: usize) -> f32 {
        let idx = self.offset(n, h, s, d);
        match &self.storage {
            Storage::F32(v) => v[idx],
            Storage::F16(v) => v[idx].to_f32(),
        }
    }

    pub fn set(&mut self, n: usize, h: usize, s: usize, d: usize, value: f32) {
        let idx = self.offset(n, h, s, d);
        match &mut self.storage {
            Storage::F32(v) => v[idx] = value,
            Storage::F16(v) => v[idx] = f16::from_f32(value),
        }
    }

    /// Changes the logical shape, reallocating zeroed storage when the
    /// element count changes.
    pub fn reshape(&mut self, shape: Shape) {
        if shape.numel() != self.storage.len() {
            self.storage = Storage::zeros(self.dtype(), shape.numel());
        }
        self.shape = shape;
    }

    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        match &self.storage {
            Storage::F32(v) if T::DTYPE == DType::F32 => Ok(bytemuck::cast_slice(v)),
            Storage::F16(v) if T::DTYPE == DType::F16 => Ok(bytemuck::cast_slice(v)),
            other => Err(OpError::DTypeMismatch {
                expected: T::DTYPE,
                got: other.dtype(),
            }),
        }
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        let got = self.storage.dtype();
        match &mut self.storage {
            Storage::F32(v) if T::DTYPE == DType::F32 => Ok(bytemuck::cast_slice_mut(v)),
            Storage::F16(v) if T::DTYPE == DType::F16 => Ok(bytemuck::cast_slice_mut(v)),
            _ => Err(OpError::DTypeMismatch {
                expected: T::DTYPE,
                got,
            }),
        }
    }

    /// Raw little-endian view of the storage.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::F32(v) => bytemuck::cast_slice(v),
            Storage::F16(v) => bytemuck::cast_slice(v),
        }
    }

    /// Copy of the contents in BHSD order, widened to f32.
    pub fn to_logical_vec(&self) -> Vec<f32> {
        let shape = self.shape;
        let mut out = Vec::with_capacity(shape.numel());
        for n in 0..shape.batch {
            for h in 0..shape.head {
                for s in 0..shape.sequence {
                    for d in 0..shape.dimension {
                        out.push(self.get(n, h, s, d));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_mismatch() {
        assert!(matches!(
            Shape::from_dims(&[2, 3, 4]),
            Err(OpError::RankMismatch { rank: 3 })
        ));
        assert_eq!(
            Shape::from_dims(&[1, 2, 3, 4]).unwrap(),
            Shape::new(1, 2, 3, 4)
        );
    }

    #[test]
    fn test_row_index_roundtrip_both_layouts() {
        let shape = Shape::new(2, 3, 5, 4);
        for layout in [Layout::Bhsd, Layout::Bshd] {
            let mut seen = vec![false; shape.rows()];
            for n in 0..shape.batch {
                for h in 0..shape.head {
                    for s in 0..shape.sequence {
                        let row = layout.row_index(&shape, n, h, s);
                        assert!(!seen[row], "row {row} visited twice for {layout:?}");
                        seen[row] = true;
                        assert_eq!(layout.decode_row(&shape, row), (n, h, s));
                    }
                }
            }
            assert!(seen.iter().all(|&v| v));
        }
    }

    #[test]
    fn test_layouts_share_logical_contents() {
        let shape = Shape::new(1, 2, 3, 4);
        let f = |n: usize, h: usize, s: usize, d: usize| (n * 1000 + h * 100 + s * 10 + d) as f32;
        let a = Tensor::from_fn(shape, DType::F32, Layout::Bhsd, f);
        let b = Tensor::from_fn(shape, DType::F32, Layout::Bshd, f);
        assert_eq!(a.to_logical_vec(), b.to_logical_vec());
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(b.get(0, 1, 2, 3), 123.0);
    }

    #[test]
    fn test_typed_slice_checks_dtype() {
        let t = Tensor::zeros(Shape::new(1, 1, 2, 2), DType::F16, Layout::Bhsd);
        assert_eq!(t.as_slice::<f16>().unwrap().len(), 4);
        assert!(matches!(
            t.as_slice::<f32>(),
            Err(OpError::DTypeMismatch { .. })
        ));
        assert_eq!(t.as_bytes().len(), 8);
    }

    #[test]
    fn test_typed_mut_slice_writes_through_and_checks_dtype() {
        let mut t = Tensor::zeros(Shape::new(1, 1, 2, 2), DType::F32, Layout::Bhsd);
        t.as_mut_slice::<f32>().unwrap()[3] = 7.5;
        assert_eq!(t.get(0, 0, 1, 1), 7.5);
        assert!(matches!(
            t.as_mut_slice::<f16>(),
            Err(OpError::DTypeMismatch {
                expected: DType::F16,
                got: DType::F32
            })
        ));
    }

    #[test]
    fn test_reshape_reallocates_only_on_size_change() {
        let mut t = Tensor::zeros(Shape::new(1, 1, 2, 2), DType::F32, Layout::Bhsd);
        t.set(0, 0, 1, 1, 7.0);
        t.reshape(Shape::new(1, 2, 1, 2));
        assert_eq!(t.numel(), 4);
        assert_eq!(t.get(0, 1, 0, 1), 7.0);
        t.reshape(Shape::new(1, 1, 4, 2));
        assert_eq!(t.numel(), 8);
        assert!(t.to_logical_vec().iter().all(|&v| v == 0.0));
    }
}

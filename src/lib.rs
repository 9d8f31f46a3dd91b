pub mod benchmark;
pub mod config;
pub mod dtype;
pub mod error;
pub mod kv_cache;
pub mod op;
pub mod parallel;
pub mod position_table;
pub mod rope;
pub mod tensor;

pub use config::{
    CursorPolicy, KvCacheConfig, KvStream, ModelConfig, RopeConfig, RopeVariant,
};
pub use dtype::{DType, Element};
pub use error::{OpError, Result};
pub use kv_cache::{CacheBuffer, KvCacheOp, KvCacheStats, KvView};
pub use op::Operator;
pub use parallel::WorkerPool;
pub use position_table::{PositionTables, TableKind, TableRegistry, DEFAULT_ROPE_BASE};
pub use rope::{PositionCursor, RopeOp};
pub use tensor::{Layout, Shape, Tensor};

/// The per-layer attention operators of one transformer layer: RoPE for Q
/// and K, and the two caches that accumulate K and V across decode steps.
pub struct LayerOps {
    pub q_rope: RopeOp,
    pub k_rope: RopeOp,
    pub k_cache: KvCacheOp,
    pub v_cache: KvCacheOp,
}

impl LayerOps {
    pub fn new(prefix: &str, config: &ModelConfig) -> Result<Self> {
        let rope = config.rope_config()?;
        Ok(Self {
            q_rope: RopeOp::new(format!("{prefix}.q_rope"), rope.clone())?,
            k_rope: RopeOp::new(format!("{prefix}.k_rope"), rope)?,
            k_cache: KvCacheOp::new(prefix, config.kv_cache_config(KvStream::Key)?)?,
            v_cache: KvCacheOp::new(prefix, config.kv_cache_config(KvStream::Value)?)?,
        })
    }

    /// Rotates `q` and `k`, appends the rotated `k` and `v`, and returns the
    /// rotated query with the length of the cached history.
    ///
    /// Every check that can fail runs before the first cursor moves or row is
    /// appended, so an error leaves positions and both caches unchanged.
    pub fn step(&mut self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<(Tensor, usize)> {
        self.prepare(q, k, v)?;
        let q_rot = self.q_rope.forward(q, q.dtype())?;
        let k_rot = self.k_rope.forward(k, k.dtype())?;
        let k_len = self.k_cache.execute(&k_rot)?.shape().sequence;
        let v_len = self.v_cache.execute(v)?.shape().sequence;
        debug_assert_eq!(k_len, v_len);
        Ok((q_rot, k_len))
    }

    fn prepare(&mut self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<()> {
        let (q_shape, k_shape, v_shape) = (q.shape(), k.shape(), v.shape());
        if q_shape.sequence != k_shape.sequence || q_shape.batch != k_shape.batch {
            return Err(OpError::ShapeMismatch {
                context: "layer query/key",
                expected: Shape::new(k_shape.batch, q_shape.head, k_shape.sequence, q_shape.dimension),
                got: q_shape,
            });
        }
        if k_shape != v_shape {
            return Err(OpError::ShapeMismatch {
                context: "layer key/value",
                expected: k_shape,
                got: v_shape,
            });
        }

        self.q_rope.reshape(&q_shape)?;
        self.k_rope.reshape(&k_shape)?;
        self.q_rope.check_positions(q_shape.sequence)?;
        self.k_rope.check_positions(k_shape.sequence)?;
        self.k_cache.reshape(k)?;
        self.v_cache.reshape(v)?;
        Ok(())
    }

    pub fn load(&mut self) -> Result<()> {
        self.q_rope.load()?;
        self.k_rope.load()?;
        self.k_cache.load()?;
        self.v_cache.load()
    }

    /// Clears positions and cached history for a new prompt.
    pub fn reset(&mut self) {
        self.q_rope.reset();
        self.k_rope.reset();
        self.k_cache.reset();
        self.v_cache.reset();
    }

    pub fn free(&mut self) {
        self.q_rope.free();
        self.k_rope.free();
        self.k_cache.free();
        self.v_cache.free();
    }
}

use anyhow::{Context, Result as AnyResult};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

use crate::error::{OpError, Result};
use crate::position_table::DEFAULT_ROPE_BASE;

/// Base used by the quarter-split (persimmon) convention regardless of θ.
pub const QUARTER_SPLIT_BASE: f32 = 25_000.0;
pub const DEFAULT_MAX_POSITIONS: usize = 16_384;
pub const DEFAULT_CACHE_LIMIT: usize = 256;
pub const DEFAULT_THREADS: usize = 4;

/// Positional-encoding convention applied by the RoPE operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RopeVariant {
    /// Adjacent pairs `(2i, 2i + 1)` ("llama").
    Interleaved,
    /// Feature `d` paired with `d + activeDim / 2` ("hf").
    HalfSplit,
    /// Three bands over a quarter split, base fixed at 25000 ("persimmon").
    QuarterSplit,
    /// Even/odd features deinterleaved into halves before rotating ("mla").
    Deinterleave,
}

impl std::str::FromStr for RopeVariant {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "llama" | "interleaved" => Ok(RopeVariant::Interleaved),
            "hf" | "hfhub" | "huggingface" | "half_split" => Ok(RopeVariant::HalfSplit),
            "persimmon" | "neox_partial" | "quarter_split" => Ok(RopeVariant::QuarterSplit),
            "mla" | "deinterleave" => Ok(RopeVariant::Deinterleave),
            _ => Err(OpError::config(format!("unknown rope variant: {s}"))),
        }
    }
}

/// What the position cursor does when it reaches `max_positions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorPolicy {
    /// Positions continue modulo `max_positions`.
    #[default]
    Wrap,
    /// Calls that would reach `max_positions` fail before writing.
    Reject,
}

#[derive(Debug, Clone)]
pub struct RopeConfig {
    pub variant: RopeVariant,
    pub theta: f32,
    pub partial_rotary_factor: f32,
    pub max_positions: usize,
    pub threads: usize,
    pub cursor_policy: CursorPolicy,
}

impl RopeConfig {
    pub fn new(variant: RopeVariant) -> Self {
        Self {
            variant,
            theta: DEFAULT_ROPE_BASE,
            partial_rotary_factor: 1.0,
            max_positions: DEFAULT_MAX_POSITIONS,
            threads: DEFAULT_THREADS,
            cursor_policy: CursorPolicy::Wrap,
        }
    }

    pub fn with_theta(mut self, theta: f32) -> Self {
        self.theta = theta;
        self
    }

    pub fn with_partial_rotary_factor(mut self, factor: f32) -> Self {
        self.partial_rotary_factor = factor;
        self
    }

    pub fn with_max_positions(mut self, max_positions: usize) -> Self {
        self.max_positions = max_positions;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_cursor_policy(mut self, policy: CursorPolicy) -> Self {
        self.cursor_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let factor = self.partial_rotary_factor;
        if !factor.is_finite() || factor <= 0.0 || factor > 1.0 {
            return Err(OpError::config(format!(
                "partial rotary factor must be in (0, 1], got {factor}"
            )));
        }
        if !self.theta.is_finite() || self.theta <= 0.0 {
            return Err(OpError::config(format!(
                "rope theta must be finite and positive, got {}",
                self.theta
            )));
        }
        if self.max_positions == 0 {
            return Err(OpError::config("max positions must be greater than zero"));
        }
        Ok(())
    }

    /// Base the position tables are generated with for this variant.
    pub fn table_base(&self) -> f32 {
        match self.variant {
            RopeVariant::Interleaved => DEFAULT_ROPE_BASE,
            RopeVariant::QuarterSplit => QUARTER_SPLIT_BASE,
            RopeVariant::HalfSplit | RopeVariant::Deinterleave => self.theta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvStream {
    Key,
    Value,
}

impl KvStream {
    pub fn suffix(self) -> &'static str {
        match self {
            KvStream::Key => "k_cache",
            KvStream::Value => "v_cache",
        }
    }
}

#[derive(Debug, Clone)]
pub struct KvCacheConfig {
    pub stream: KvStream,
    /// Sequence capacity allocated on first use.
    pub cache_limit: usize,
    /// Hard ceiling for growth; `None` grows until allocation fails.
    pub max_capacity: Option<usize>,
    pub multi_thread: bool,
    pub threads: usize,
}

impl KvCacheConfig {
    pub fn new(stream: KvStream) -> Self {
        Self {
            stream,
            cache_limit: DEFAULT_CACHE_LIMIT,
            max_capacity: None,
            multi_thread: false,
            threads: DEFAULT_THREADS,
        }
    }

    pub fn with_cache_limit(mut self, cache_limit: usize) -> Self {
        self.cache_limit = cache_limit;
        self
    }

    pub fn with_max_capacity(mut self, max_capacity: Option<usize>) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    pub fn with_multi_thread(mut self, multi_thread: bool, threads: usize) -> Self {
        self.multi_thread = multi_thread;
        self.threads = threads;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_limit == 0 {
            return Err(OpError::config("kv cache limit must be greater than zero"));
        }
        if let Some(max) = self.max_capacity {
            if max < self.cache_limit {
                return Err(OpError::config(format!(
                    "kv cache max capacity {max} is below the initial limit {}",
                    self.cache_limit
                )));
            }
        }
        Ok(())
    }
}

/// The subset of a model's `config.json` the operators are built from.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(alias = "n_head")]
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    #[serde(alias = "n_embd")]
    pub hidden_size: usize,
    pub head_dim: Option<usize>,
    #[serde(
        alias = "n_positions",
        alias = "max_position_embeddings",
        default = "default_max_positions"
    )]
    pub max_positions: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_partial_rotary_factor")]
    pub partial_rotary_factor: f32,
    #[serde(alias = "pos_encoding")]
    pub rope_type: Option<String>,
    pub kv_cache_limit: Option<usize>,
    pub num_threads: Option<usize>,
}

fn default_max_positions() -> usize {
    DEFAULT_MAX_POSITIONS
}

fn default_rope_theta() -> f32 {
    DEFAULT_ROPE_BASE
}

fn default_partial_rotary_factor() -> f32 {
    1.0
}

impl ModelConfig {
    pub fn load_from_path(path: &Path) -> AnyResult<Self> {
        let config_path = path.join("config.json");
        let file = File::open(&config_path)
            .with_context(|| format!("Failed to open config.json at {:?}", config_path))?;
        let config: ModelConfig = serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse config.json at {:?}", config_path))?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Missing `rope_type` means the half-split convention of HF checkpoints.
    pub fn rope_variant(&self) -> Result<RopeVariant> {
        match &self.rope_type {
            Some(name) => name.parse(),
            None => Ok(RopeVariant::HalfSplit),
        }
    }

    /// The cursor rejects at `max_positions`, the same bound the KV caches
    /// from [`ModelConfig::kv_cache_config`] stop at.
    pub fn rope_config(&self) -> Result<RopeConfig> {
        let variant = self.rope_variant()?;
        let config = RopeConfig::new(variant)
            .with_theta(self.rope_theta)
            .with_partial_rotary_factor(self.partial_rotary_factor)
            .with_max_positions(self.max_positions)
            .with_threads(self.num_threads.unwrap_or(DEFAULT_THREADS))
            .with_cursor_policy(CursorPolicy::Reject);
        config.validate()?;
        Ok(config)
    }

    pub fn kv_cache_config(&self, stream: KvStream) -> Result<KvCacheConfig> {
        let threads = self.num_threads.unwrap_or(DEFAULT_THREADS);
        let cache_limit = self
            .kv_cache_limit
            .unwrap_or(DEFAULT_CACHE_LIMIT)
            .min(self.max_positions);
        let config = KvCacheConfig::new(stream)
            .with_cache_limit(cache_limit)
            .with_max_capacity(Some(self.max_positions))
            .with_multi_thread(threads > 1, threads);
        config.validate()?;
        Ok(config)
    }
}

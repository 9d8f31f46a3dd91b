// file: src/main.rs
// description: CLI entrypoint that drives synthetic prefill and decode steps through the RoPE and KV-cache operators.
// author: cipher-rc5
// created: 2026-02-21
// modified: 2026-10-18

use anyhow::Result;
use clap::{ArgAction, Parser};
use oxidized_cpu_ops::benchmark::{DecodeMetrics, Stopwatch};
use oxidized_cpu_ops::{DType, LayerOps, Layout, ModelConfig, Shape, Tensor};
use std::path::PathBuf;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(author, version, about = "CPU RoPE + KV-cache decode runner")]
struct Args {
    #[arg(long, help = "Model directory containing config.json")]
    model_path: Option<PathBuf>,

    #[arg(long, default_value = "hf", help = "llama, hf, persimmon or mla")]
    rope_type: String,

    #[arg(long, default_value_t = 8)]
    heads: usize,

    #[arg(long, default_value_t = 64)]
    head_dim: usize,

    #[arg(long, default_value_t = 1.0)]
    partial_rotary_factor: f32,

    #[arg(long, default_value_t = 4096)]
    max_positions: usize,

    #[arg(long, default_value_t = 128)]
    prompt_len: usize,

    #[arg(long, default_value_t = 256)]
    steps: usize,

    #[arg(long, default_value_t = 4)]
    threads: usize,

    #[arg(long, value_enum, default_value = "f32")]
    dtype: DTypeArg,

    #[arg(long, value_enum, default_value = "bhsd")]
    layout: LayoutArg,

    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum DTypeArg {
    F32,
    F16,
}

impl From<DTypeArg> for DType {
    fn from(v: DTypeArg) -> Self {
        match v {
            DTypeArg::F32 => DType::F32,
            DTypeArg::F16 => DType::F16,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum LayoutArg {
    Bhsd,
    Bshd,
}

impl From<LayoutArg> for Layout {
    fn from(v: LayoutArg) -> Self {
        match v {
            LayoutArg::Bhsd => Layout::Bhsd,
            LayoutArg::Bshd => Layout::Bshd,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .init();

    let config = match &args.model_path {
        Some(path) => ModelConfig::load_from_path(path)?,
        None => synthetic_config(&args)?,
    };
    info!(
        "heads={}, kv_heads={}, head_dim={}, max_positions={}",
        config.num_attention_heads,
        config.num_kv_heads(),
        config.head_dim(),
        config.max_positions
    );

    let mut layer = LayerOps::new("layers.0", &config)?;
    layer.load()?;
    let metrics = run_decode(&mut layer, &config, &args)?;
    metrics.log();
    Ok(())
}

fn synthetic_config(args: &Args) -> Result<ModelConfig> {
    let json = serde_json::json!({
        "num_attention_heads": args.heads,
        "hidden_size": args.heads * args.head_dim,
        "max_position_embeddings": args.max_positions,
        "partial_rotary_factor": args.partial_rotary_factor,
        "rope_type": args.rope_type,
        "num_threads": args.threads,
    });
    Ok(serde_json::from_value(json)?)
}

fn run_decode(layer: &mut LayerOps, config: &ModelConfig, args: &Args) -> Result<DecodeMetrics> {
    let dtype = DType::from(args.dtype);
    let layout = Layout::from(args.layout);
    let head_dim = config.head_dim();
    let q_shape = |len| Shape::new(1, config.num_attention_heads, len, head_dim);
    let kv_shape = |len| Shape::new(1, config.num_kv_heads(), len, head_dim);

    let prefill = Stopwatch::start(format!("prefill of {} tokens", args.prompt_len));
    let q = synthetic(q_shape(args.prompt_len), dtype, layout, 0);
    let k = synthetic(kv_shape(args.prompt_len), dtype, layout, 1);
    let v = synthetic(kv_shape(args.prompt_len), dtype, layout, 2);
    layer.step(&q, &k, &v)?;
    let prefill_time = prefill.stop();

    let decode = Stopwatch::start(format!("{} decode steps", args.steps));
    for step in 0..args.steps {
        let seed = 3 + step;
        let q = synthetic(q_shape(1), dtype, layout, seed);
        let k = synthetic(kv_shape(1), dtype, layout, seed + 1);
        let v = synthetic(kv_shape(1), dtype, layout, seed + 2);
        layer.step(&q, &k, &v)?;
    }
    let decode_time = decode.stop();

    let stats = layer.k_cache.stats();
    Ok(DecodeMetrics {
        prefill_tokens: args.prompt_len,
        decode_steps: args.steps,
        prefill_time,
        decode_time,
        kv_capacity: stats.capacity,
        kv_bytes: stats.bytes,
        kv_grow_events: stats.grow_events,
    })
}

fn synthetic(shape: Shape, dtype: DType, layout: Layout, seed: usize) -> Tensor {
    Tensor::from_fn(shape, dtype, layout, |n, h, s, d| {
        let x = (seed * 131 + n * 71 + h * 37 + s * 17 + d) as f32;
        (x * 0.013).sin()
    })
}

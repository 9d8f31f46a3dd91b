// file: src/benchmark.rs
// description: Timing helpers for prefill/decode runs through the RoPE and KV-cache operators.
// author: cipher-rc5

use std::time::{Duration, Instant};
use tracing::info;

pub struct Stopwatch {
    start: Instant,
    operation: String,
}

impl Stopwatch {
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation: operation.into(),
        }
    }

    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        info!("{} took {:?}", self.operation, elapsed);
        elapsed
    }
}

#[derive(Debug, Clone)]
pub struct DecodeMetrics {
    pub prefill_tokens: usize,
    pub decode_steps: usize,
    pub prefill_time: Duration,
    pub decode_time: Duration,
    pub kv_capacity: usize,
    pub kv_bytes: usize,
    pub kv_grow_events: usize,
}

impl DecodeMetrics {
    pub fn prefill_tokens_per_second(&self) -> f64 {
        rate(self.prefill_tokens, self.prefill_time)
    }

    pub fn decode_steps_per_second(&self) -> f64 {
        rate(self.decode_steps, self.decode_time)
    }

    pub fn us_per_step(&self) -> f64 {
        if self.decode_steps == 0 {
            return 0.0;
        }
        self.decode_time.as_secs_f64() * 1e6 / self.decode_steps as f64
    }

    pub fn log(&self) {
        info!("Decode metrics:");
        info!(
            "  Prefill: {} tokens in {:?} ({:.2} tokens/sec)",
            self.prefill_tokens,
            self.prefill_time,
            self.prefill_tokens_per_second()
        );
        info!(
            "  Decode: {} steps in {:?} ({:.2} steps/sec, {:.2} us/step)",
            self.decode_steps,
            self.decode_time,
            self.decode_steps_per_second(),
            self.us_per_step()
        );
        info!(
            "  KV cache: capacity {} positions, {:.2} MB per stream, {} grow events",
            self.kv_capacity,
            self.kv_bytes as f64 / 1e6,
            self.kv_grow_events
        );
    }
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    count as f64 / secs
}

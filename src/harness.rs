//! Minimal timing driver for the benchmark clients.
//!
//! A [`Benchmark`] is set up once, run in batches inside the timed region,
//! and torn down once. [`measure`] calibrates a batch size so that one batch
//! lasts at least `min_duration`, times `repetitions` batches and reports the
//! median per-operation latency.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::error::NetError;

const MAX_ITERATIONS: u64 = 1 << 30;

/// A client operation driven by [`measure`].
pub trait Benchmark {
    /// One-time preparation outside the timed region.
    fn setup(&mut self) -> Result<(), NetError> {
        Ok(())
    }

    /// Perform the measured operation `iterations` times.
    fn run(&mut self, iterations: u64) -> Result<(), NetError>;

    /// One-time cleanup outside the timed region. Runs even if `run` failed.
    fn teardown(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct TimingOptions {
    pub repetitions: u32,
    pub warmup: Duration,
    pub min_duration: Duration,
}

impl Default for TimingOptions {
    fn default() -> Self {
        Self {
            repetitions: 11,
            warmup: Duration::ZERO,
            min_duration: Duration::from_millis(20),
        }
    }
}

/// Result of one [`measure`] call. Latencies are per operation.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub label: String,
    pub iterations: u64,
    pub repetitions: u32,
    pub median_us: f64,
    pub min_us: f64,
    pub max_us: f64,
}

impl Measurement {
    pub fn summary(&self) -> String {
        format!("{}: {:.4} microseconds", self.label, self.median_us)
    }
}

pub fn measure<B: Benchmark + ?Sized>(
    bench: &mut B,
    label: &str,
    options: &TimingOptions,
) -> Result<Measurement, NetError> {
    bench.setup()?;
    let result = timed(bench, label, options);
    bench.teardown();
    result
}

fn timed<B: Benchmark + ?Sized>(
    bench: &mut B,
    label: &str,
    options: &TimingOptions,
) -> Result<Measurement, NetError> {
    if !options.warmup.is_zero() {
        let start = Instant::now();
        while start.elapsed() < options.warmup {
            bench.run(1)?;
        }
    }

    let mut iterations = 1;
    loop {
        let elapsed = time_batch(bench, iterations)?;
        if elapsed >= options.min_duration || iterations >= MAX_ITERATIONS {
            break;
        }
        iterations *= 2;
    }
    debug!(label, iterations, "batch size calibrated");

    let repetitions = options.repetitions.max(1);
    let mut samples = Vec::with_capacity(repetitions as usize);
    for _ in 0..repetitions {
        let elapsed = time_batch(bench, iterations)?;
        samples.push(elapsed.as_secs_f64() * 1e6 / iterations as f64);
    }
    samples.sort_by(|a, b| a.total_cmp(b));

    Ok(Measurement {
        label: label.to_string(),
        iterations,
        repetitions,
        median_us: median(&samples),
        min_us: samples[0],
        max_us: samples[samples.len() - 1],
    })
}

fn time_batch<B: Benchmark + ?Sized>(bench: &mut B, iterations: u64) -> Result<Duration, NetError> {
    let start = Instant::now();
    bench.run(iterations)?;
    Ok(start.elapsed())
}

/// Median of sorted, non-empty samples.
fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

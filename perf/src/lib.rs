//! Shared fixtures and a small latency harness for the benches and
//! `perf_report`.

use paddock_events::{CarTelemetry, Pedals};
use std::path::PathBuf;
use std::time::Instant;

/// Region path unique to this process and `tag`, outside `/dev/shm` so a
/// crashed bench leaves nothing behind in shared memory.
pub fn temp_region_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("paddock_perf_{tag}_{}", std::process::id()))
}

pub fn temp_region_name(tag: &str) -> String {
    temp_region_path(tag).to_string_lossy().into_owned()
}

pub fn sample_telemetry(tick: u32) -> CarTelemetry {
    CarTelemetry {
        speed_kph: 212.5,
        rpm: 10_450.0,
        gear: 5,
        pedals: Pedals {
            throttle: 0.92,
            brake: 0.0,
            clutch: 0.0,
        },
        lap: 1 + tick / 6_000,
        lap_time_s: f64::from(tick % 6_000) / 60.0,
        lap_distance_pct: (tick % 6_000) as f32 / 6_000.0,
    }
}

/// Deterministic non-zero bytes, so CRC work is not trivially cheap.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

/// Per-operation latency summary in nanoseconds.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LatencyStats {
    pub name: String,
    pub samples: usize,
    pub min: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
}

impl LatencyStats {
    /// Summarizes `samples`; `None` if there are none.
    pub fn from_samples(name: &str, mut samples: Vec<u64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let total: u128 = samples.iter().map(|&s| u128::from(s)).sum();
        let at = |pct: f64| {
            let rank = (pct / 100.0 * samples.len() as f64).ceil() as usize;
            samples[rank.clamp(1, samples.len()) - 1]
        };
        Some(Self {
            name: name.to_owned(),
            samples: samples.len(),
            min: samples[0],
            mean: total as f64 / samples.len() as f64,
            p50: at(50.0),
            p90: at(90.0),
            p99: at(99.0),
            p999: at(99.9),
            max: samples[samples.len() - 1],
        })
    }
}

/// Times `op` individually `iters` times after `warmup` untimed calls.
pub fn sample_latency(iters: usize, warmup: usize, mut op: impl FnMut()) -> Vec<u64> {
    for _ in 0..warmup {
        op();
    }
    (0..iters)
        .map(|_| {
            let start = Instant::now();
            op();
            (start.elapsed().as_nanos() as u64).max(1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_come_from_sorted_samples() {
        let stats = LatencyStats::from_samples("x", (1..=1000).rev().collect()).unwrap();
        assert_eq!((stats.min, stats.max), (1, 1000));
        assert_eq!(stats.p50, 500);
        assert_eq!(stats.p99, 990);
        assert_eq!(stats.p999, 999);
        assert!(LatencyStats::from_samples("empty", Vec::new()).is_none());
    }

    #[test]
    fn payload_has_no_zero_bytes() {
        assert!(payload(1024).iter().all(|&b| b != 0));
    }
}

// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::detection::now_ms;

pub const DEFAULT_CAPACITY: usize = 10_000;

/// One timing/bandwidth observation, reported by a client or derived by a
/// pipeline. Reporters are untrusted: missing fields read as zero and `ts`
/// need not be monotonic across samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySample {
    // Milliseconds since the Unix epoch.
    pub ts: i64,
    pub e2e_latency_ms: f64,
    pub bytes_uplink: u64,
    pub bytes_downlink: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    // None (JSON null) when `count` is zero.
    pub median_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub fps: f64,
    pub kbps_uplink: f64,
    pub kbps_downlink: f64,
}

impl Summary {
    fn empty() -> Self {
        Summary{
            count: 0,
            median_latency_ms: None,
            p95_latency_ms: None,
            fps: 0.0,
            kbps_uplink: 0.0,
            kbps_downlink: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BufferStats {
    pub buffered: usize,
    pub capacity: usize,
    pub ingested: u64,
    pub evicted: u64,
}

// Samples in arrival order, bounded by count rather than age: the oldest
// arrivals are evicted first regardless of their `ts`.
#[derive(Debug)]
pub struct TelemetryBuffer {
    samples: VecDeque<TelemetrySample>,
    capacity: usize,
    ingested: u64,
    evicted: u64,
}

impl TelemetryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        TelemetryBuffer{
            samples: VecDeque::with_capacity(capacity),
            capacity,
            ingested: 0,
            evicted: 0,
        }
    }

    pub fn push(&mut self, sample: TelemetrySample) {
        self.samples.push_back(sample);
        self.ingested += 1;
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
            self.evicted += 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TelemetrySample> {
        self.samples.iter()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats{
            buffered: self.samples.len(),
            capacity: self.capacity,
            ingested: self.ingested,
            evicted: self.evicted,
        }
    }
}

/// Process-wide sink for telemetry samples. Ingestion is safe from any number
/// of concurrent producers; the append and the eviction that follows happen
/// under one lock, so the length bound holds at every instant.
pub struct TelemetryAggregator {
    buffer: Mutex<TelemetryBuffer>,
}

impl TelemetryAggregator {
    pub fn new(capacity: usize) -> Self {
        TelemetryAggregator{buffer: Mutex::new(TelemetryBuffer::new(capacity))}
    }

    pub fn ingest(&self, sample: TelemetrySample) {
        self.lock().push(sample);
    }

    pub fn stats(&self) -> BufferStats {
        self.lock().stats()
    }

    /// Statistics over samples whose `ts` lies within the trailing
    /// `window_seconds` ending now.
    pub fn summarize(&self, window_seconds: u64) -> Summary {
        self.summarize_at(now_ms(), window_seconds)
    }

    pub fn summarize_at(&self, now_ms: i64, window_seconds: u64) -> Summary {
        let window_ms = i64::try_from(window_seconds).unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let cutoff = now_ms.saturating_sub(window_ms);
        // Copy out the window so the lock is not held while sorting.
        let window: Vec<TelemetrySample> = self.lock().iter()
            .filter(|s| s.ts >= cutoff)
            .copied()
            .collect();
        summarize_samples(&window)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TelemetryBuffer> {
        // A panic while holding the lock cannot leave the buffer over its
        // bound (push evicts before returning), so keep using it.
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// Nearest-rank percentile: the element at rank ceil(p * (n - 1)) of the
// ascending-sorted values, no interpolation. `sorted` must be non-empty.
pub fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    let last = sorted.len() - 1;
    let rank = (p * last as f64).ceil();
    let index = if rank.is_nan() || rank < 0.0 {
        0
    } else {
        (rank as usize).min(last)
    };
    sorted[index]
}

pub fn summarize_samples(window: &[TelemetrySample]) -> Summary {
    if window.is_empty() {
        return Summary::empty();
    }
    let mut latencies: Vec<f64> = window.iter().map(|s| s.e2e_latency_ms).collect();
    latencies.sort_by(|a, b| a.total_cmp(b));

    let min_ts = window.iter().map(|s| s.ts).min().unwrap_or(0);
    let max_ts = window.iter().map(|s| s.ts).max().unwrap_or(0);
    // Reported values are untrusted; f64 accumulation cannot overflow.
    let duration_s = f64::max(1.0, (max_ts as f64 - min_ts as f64) / 1000.0);

    let uplink_bytes: f64 = window.iter().map(|s| s.bytes_uplink as f64).sum();
    let downlink_bytes: f64 = window.iter().map(|s| s.bytes_downlink as f64).sum();
    Summary{
        count: window.len(),
        median_latency_ms: Some(nearest_rank(&latencies, 0.5)),
        p95_latency_ms: Some(nearest_rank(&latencies, 0.95)),
        fps: window.len() as f64 / duration_s,
        kbps_uplink: uplink_bytes * 8.0 / 1000.0 / duration_s,
        kbps_downlink: downlink_bytes * 8.0 / 1000.0 / duration_s,
    }
}

// mod tests.

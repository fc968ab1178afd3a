// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use medians::Medianf64;
use rolling_stats;
use serde::Serialize;
use statistical;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DescriptiveStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ValueStats {
    // Over the most recent `capacity` values.
    pub recent: DescriptiveStats,

    // Over all values since construction or reset_session().
    pub session: DescriptiveStats,
}

pub struct ValueStatsAccumulator {
    pub value_stats: ValueStats,

    // State for `recent`.
    circular_buffer: CircularBuffer,

    // State for `session`.
    rolling_stats: rolling_stats::Stats<f64>,
}

impl ValueStatsAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            value_stats: ValueStats::default(),
            circular_buffer: CircularBuffer::new(capacity.max(1)),
            rolling_stats: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn add_value(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.circular_buffer.push(value);
        self.rolling_stats.update(value);

        let recent_values = self.circular_buffer.unordered_contents();
        let recent_stats = &mut self.value_stats.recent;
        recent_stats.min =
            recent_values.iter().copied().fold(f64::INFINITY, f64::min);
        recent_stats.max =
            recent_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        recent_stats.mean = statistical::mean(recent_values);
        if recent_values.len() > 1 {
            recent_stats.stddev = statistical::standard_deviation(
                recent_values, Some(recent_stats.mean));
        }
        let median = recent_values.medf_unchecked();
        recent_stats.median = Some(median);
        recent_stats.median_absolute_deviation = Some(recent_values.madf(median));

        let session_stats = &mut self.value_stats.session;
        session_stats.min = self.rolling_stats.min;
        session_stats.max = self.rolling_stats.max;
        session_stats.mean = self.rolling_stats.mean;
        session_stats.stddev = self.rolling_stats.std_dev;
        // No median or median_absolute_deviation for session_stats.
    }

    pub fn reset_session(&mut self) {
        self.value_stats.session = DescriptiveStats::default();
        self.rolling_stats = rolling_stats::Stats::<f64>::new();
    }
}

// We use a Vec<f64> to implement a ring buffer. We don't use VecDeque because
// we want a view of all elements as a single slice, and we don't care about
// their order.
#[derive(Debug)]
struct CircularBuffer {
    start: usize,
    data: Vec<f64>,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: f64) {
        if self.data.len() < self.data.capacity() {
            self.data.push(item);
        } else {
            self.data[self.start] = item;
            self.start += 1;
            self.start %= self.data.capacity();
        }
    }

    pub fn unordered_contents(&self) -> &[f64] {
        self.data.as_slice()
    }
}

// mod tests.

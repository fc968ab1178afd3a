// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use crate::detection::{DetectionBox, FrameResult, SourceFrame, now_ms};
use crate::detector_trait::DetectorTrait;
use crate::frame_source::FrameSourceTrait;
use crate::latest_slot::{self, SlotReader, SlotStats, SlotWriter};
use crate::rate_limiter::RateLimiter;
use crate::telemetry::{TelemetryAggregator, TelemetrySample};
use crate::value_stats::{ValueStats, ValueStatsAccumulator};

/// Runs frames from one source through the detector, one at a time, and
/// publishes each result to the pipeline's own latest-value slot.
///
/// The pipeline owns the only writer of its slot. Consumers get at the slot
/// through a `PipelineHandle`.
pub struct FramePipeline {
    id: u64,
    detector: Arc<dyn DetectorTrait + Send + Sync>,
    slot: SlotWriter<FrameResult>,

    // When present, each processed frame contributes a derived sample.
    telemetry: Option<Arc<TelemetryAggregator>>,

    rate_limiter: RateLimiter,

    // frame_id given to the most recently processed frame; 0 before the
    // first one.
    last_frame_id: i64,

    // Shared with PipelineHandle for reporting.
    state: Arc<Mutex<PipelineState>>,
}

struct PipelineState {
    running: bool,
    frames_processed: u64,
    detector_failures: u64,
    frames_dropped: u64,
    last_frame_id: Option<i64>,
    inference_latency: ValueStatsAccumulator,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineStats {
    pub pipeline_id: u64,
    pub running: bool,
    pub frames_processed: u64,
    pub detector_failures: u64,
    // Frames discarded before reaching the pipeline because it was busy.
    pub frames_dropped: u64,
    pub last_frame_id: Option<i64>,
    // Time spent inside the detector, ms.
    pub inference_latency_ms: ValueStats,
    pub slot: SlotStats,
}

/// Consumer-side view of a pipeline; cheap to clone.
#[derive(Clone)]
pub struct PipelineHandle {
    id: u64,
    reader: SlotReader<FrameResult>,
    state: Arc<Mutex<PipelineState>>,
}

fn lock_state(state: &Mutex<PipelineState>) -> MutexGuard<'_, PipelineState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PipelineHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn reader(&self) -> &SlotReader<FrameResult> {
        &self.reader
    }

    /// Latest published result, or the sentinel if there is none yet.
    pub fn latest(&self) -> FrameResult {
        match self.reader.peek() {
            Some(result) => (*result).clone(),
            None => FrameResult::sentinel(),
        }
    }

    /// Long-poll: waits for a published result whose frame_id differs from
    /// `prev_frame_id` and returns it. If the pipeline ends first, returns
    /// latest(). Callers bound the wait themselves.
    pub async fn next_result(&self, prev_frame_id: i64) -> FrameResult {
        let mut seen_version = 0;
        if let Some((version, current)) = self.reader.peek_versioned() {
            if current.frame_id != prev_frame_id {
                return (*current).clone();
            }
            seen_version = version;
        }
        while let Some((version, result)) = self.reader.wait_newer(seen_version).await {
            if result.frame_id != prev_frame_id {
                return (*result).clone();
            }
            seen_version = version;
        }
        self.latest()
    }

    /// Counts a frame that its producer discarded because the pipeline's
    /// input queue was full.
    pub fn record_dropped_frame(&self) {
        lock_state(&self.state).frames_dropped += 1;
    }

    /// Clears session-wide inference latency stats. The recent window is
    /// kept.
    pub fn reset_session_stats(&self) {
        lock_state(&self.state).inference_latency.reset_session();
    }

    pub fn stats(&self) -> PipelineStats {
        let state = lock_state(&self.state);
        PipelineStats{
            pipeline_id: self.id,
            running: state.running,
            frames_processed: state.frames_processed,
            detector_failures: state.detector_failures,
            frames_dropped: state.frames_dropped,
            last_frame_id: state.last_frame_id,
            inference_latency_ms: state.inference_latency.value_stats.clone(),
            slot: self.reader.stats(),
        }
    }
}

impl FramePipeline {
    pub fn new(id: u64,
               detector: Arc<dyn DetectorTrait + Send + Sync>,
               telemetry: Option<Arc<TelemetryAggregator>>,
               rate_limiter: RateLimiter,
               stats_capacity: usize) -> Self {
        let (slot, _reader) = latest_slot::channel();
        FramePipeline{
            id,
            detector,
            slot,
            telemetry,
            rate_limiter,
            last_frame_id: 0,
            state: Arc::new(Mutex::new(PipelineState{
                running: true,
                frames_processed: 0,
                detector_failures: 0,
                frames_dropped: 0,
                last_frame_id: None,
                inference_latency: ValueStatsAccumulator::new(stats_capacity),
            })),
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle{
            id: self.id,
            reader: self.slot.reader(),
            state: self.state.clone(),
        }
    }

    /// Processes frames until the source ends. Consumes the pipeline: when
    /// this returns, the detector handle and the slot writer are released;
    /// whatever was last published stays readable through handles.
    pub async fn run<S>(mut self, mut source: S)
    where S: FrameSourceTrait + Send
    {
        info!("Pipeline {} started with {} detector, min frame period {:?}",
              self.id, self.detector.name(), self.rate_limiter.period());
        while let Some(frame) = source.next_frame().await {
            let iteration_start = Instant::now();
            self.process_frame(frame).await;
            self.rate_limiter.throttle(iteration_start).await;
        }
        let frames = {
            let mut state = lock_state(&self.state);
            state.running = false;
            state.frames_processed
        };
        info!("Pipeline {} source ended after {} frames", self.id, frames);
    }

    /// Runs one frame through detection and publishes the result, assigning
    /// the next frame_id.
    pub async fn process_frame(&mut self, frame: SourceFrame) -> FrameResult {
        self.last_frame_id += 1;
        let frame_id = self.last_frame_id;
        self.process(frame, frame_id).await
    }

    /// Like process_frame(), but keeps the caller's frame_id. Used for
    /// request/response submissions where the client numbers its frames.
    pub async fn process_submitted(&mut self, frame: SourceFrame, frame_id: i64)
                                   -> FrameResult {
        self.process(frame, frame_id).await
    }

    async fn process(&mut self, frame: SourceFrame, frame_id: i64) -> FrameResult {
        // Producer clocks are not ours; keep capture <= recv <= inference.
        let recv_ts = i64::max(now_ms(), frame.capture_ts);
        let encoded_len = frame.encoded_len;
        let capture_ts = frame.capture_ts;

        let inference_start = Instant::now();
        let (detections, failed) = self.detect(frame).await;
        let inference_duration = inference_start.elapsed();
        let inference_ts = i64::max(now_ms(), recv_ts);

        let result = FrameResult{
            frame_id,
            capture_ts,
            recv_ts,
            inference_ts,
            detections,
        };
        self.slot.publish(result.clone());
        debug!("Pipeline {} published frame {} with {} detections in {:?}",
               self.id, frame_id, result.detections.len(), inference_duration);

        if let Some(telemetry) = &self.telemetry {
            let bytes_downlink = serde_json::to_vec(&result).map(|v| v.len()).unwrap_or(0);
            telemetry.ingest(TelemetrySample{
                ts: inference_ts,
                e2e_latency_ms: inference_ts.saturating_sub(capture_ts) as f64,
                bytes_uplink: encoded_len as u64,
                bytes_downlink: bytes_downlink as u64,
            });
        }

        let mut state = lock_state(&self.state);
        state.frames_processed += 1;
        if failed {
            state.detector_failures += 1;
        }
        state.last_frame_id = Some(frame_id);
        state.inference_latency.add_value(inference_duration.as_secs_f64() * 1000.0);
        result
    }

    // Detection is CPU-bound; run it on the blocking pool. The pipeline still
    // awaits it, so frames remain strictly sequential. Any failure, including
    // a detector panic, yields no detections for this frame.
    async fn detect(&self, frame: SourceFrame) -> (Vec<DetectionBox>, bool) {
        let detector = self.detector.clone();
        let image = frame.image;
        match tokio::task::spawn_blocking(move || detector.infer(&image)).await {
            Ok(Ok(detections)) => (detections, false),
            Ok(Err(e)) => {
                warn!("Pipeline {} detector failed: {:?}", self.id, e);
                (Vec::new(), true)
            },
            Err(e) => {
                warn!("Pipeline {} detector aborted: {}", self.id, e);
                (Vec::new(), true)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use canonical_error::{CanonicalError, internal_error};
    use image::RgbImage;

    use crate::frame_source::ChannelFrameSource;
    use super::*;

    // Reports one box per frame; fails on frames 13 pixels wide and panics on
    // frames 17 pixels wide.
    struct ScriptedDetector;

    impl DetectorTrait for ScriptedDetector {
        fn infer(&self, frame: &RgbImage) -> Result<Vec<DetectionBox>, CanonicalError> {
            match frame.width() {
                13 => Err(internal_error("scripted failure")),
                17 => panic!("scripted panic"),
                _ => Ok(vec![DetectionBox{
                    label: "cup".to_string(), score: 0.9,
                    xmin: 0.1, ymin: 0.1, xmax: 0.2, ymax: 0.2}]),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn frame(width: u32, capture_ts: i64) -> SourceFrame {
        SourceFrame{image: RgbImage::new(width, 4), capture_ts, encoded_len: 100}
    }

    fn pipeline(telemetry: Option<Arc<TelemetryAggregator>>,
                rate_limiter: RateLimiter) -> FramePipeline {
        FramePipeline::new(1, Arc::new(ScriptedDetector), telemetry, rate_limiter, 10)
    }

    #[tokio::test]
    async fn test_frame_ids_and_latest() {
        let pipeline = pipeline(None, RateLimiter::unlimited());
        let handle = pipeline.handle();
        assert!(handle.latest().is_sentinel());
        let mut listener = handle.reader().subscribe(100);

        let (sender, source) = ChannelFrameSource::new(16);
        let task = tokio::spawn(pipeline.run(source));
        for _ in 0..10 {
            sender.send(frame(8, now_ms())).await.unwrap();
        }
        drop(sender);
        task.await.unwrap();

        let mut ids = Vec::new();
        while let Some(result) = listener.recv().await {
            ids.push(result.frame_id);
        }
        assert_eq!(ids, (1..=10).collect::<Vec<i64>>());
        assert_eq!(handle.latest().frame_id, 10);

        let stats = handle.stats();
        assert!(!stats.running);
        assert_eq!(stats.frames_processed, 10);
        assert_eq!(stats.last_frame_id, Some(10));
        assert_eq!(stats.slot.published, 10);
        assert!(handle.reader().wait_newer(10).await.is_none());
    }

    #[tokio::test]
    async fn test_detector_failure_is_not_fatal() {
        let mut pipeline = pipeline(None, RateLimiter::unlimited());
        let first = pipeline.process_frame(frame(8, 0)).await;
        let failed = pipeline.process_frame(frame(13, 0)).await;
        let panicked = pipeline.process_frame(frame(17, 0)).await;
        let next = pipeline.process_frame(frame(8, 0)).await;

        assert_eq!(first.frame_id, 1);
        assert_eq!(first.detections.len(), 1);
        assert_eq!(failed.frame_id, 2);
        assert!(failed.detections.is_empty());
        assert_eq!(panicked.frame_id, 3);
        assert!(panicked.detections.is_empty());
        assert_eq!(next.frame_id, 4);
        assert_eq!(next.detections.len(), 1);
        assert_eq!(pipeline.handle().stats().detector_failures, 2);
    }

    #[tokio::test]
    async fn test_timestamps_ordered() {
        let mut pipeline = pipeline(None, RateLimiter::unlimited());
        let past = pipeline.process_frame(frame(8, now_ms() - 500)).await;
        assert!(past.capture_ts <= past.recv_ts);
        assert!(past.recv_ts <= past.inference_ts);
        assert!(past.recv_ts - past.capture_ts >= 500);

        // A producer clock running ahead of ours.
        let future_ts = now_ms() + 60_000;
        let ahead = pipeline.process_frame(frame(8, future_ts)).await;
        assert_eq!(ahead.capture_ts, future_ts);
        assert!(ahead.capture_ts <= ahead.recv_ts);
        assert!(ahead.recv_ts <= ahead.inference_ts);
    }

    #[tokio::test]
    async fn test_submitted_frame_keeps_client_id() {
        let mut pipeline = pipeline(None, RateLimiter::unlimited());
        let result = pipeline.process_submitted(frame(8, 0), 41).await;
        assert_eq!(result.frame_id, 41);
        assert_eq!(pipeline.handle().latest(), result);
        // Streaming numbering is unaffected.
        assert_eq!(pipeline.process_frame(frame(8, 0)).await.frame_id, 1);
    }

    #[tokio::test]
    async fn test_derived_telemetry() {
        let telemetry = Arc::new(TelemetryAggregator::new(100));
        let mut pipeline = pipeline(Some(telemetry.clone()), RateLimiter::unlimited());
        let result = pipeline.process_frame(frame(8, now_ms() - 40)).await;
        assert_eq!(telemetry.stats().buffered, 1);
        let summary = telemetry.summarize(30);
        assert_eq!(summary.count, 1);
        let latency = summary.median_latency_ms.unwrap();
        assert_eq!(latency, (result.inference_ts - result.capture_ts) as f64);
        assert!(latency >= 40.0);
        // 100 encoded bytes over the 1s floor.
        assert_eq!(summary.kbps_uplink, 0.8);
        assert!(summary.kbps_downlink > 0.0);
    }

    #[tokio::test]
    async fn test_extreme_capture_ts() {
        let telemetry = Arc::new(TelemetryAggregator::new(100));
        let mut pipeline = pipeline(Some(telemetry.clone()), RateLimiter::unlimited());
        let oldest = pipeline.process_frame(frame(8, i64::MIN)).await;
        assert_eq!(oldest.capture_ts, i64::MIN);
        assert!(oldest.recv_ts <= oldest.inference_ts);
        let newest = pipeline.process_frame(frame(8, i64::MAX)).await;
        assert_eq!(newest.recv_ts, i64::MAX);
        assert_eq!(newest.inference_ts, i64::MAX);
        assert_eq!(pipeline.handle().stats().frames_processed, 2);
        assert_eq!(telemetry.stats().buffered, 2);
        assert_eq!(telemetry.summarize_at(now_ms(), u64::MAX).count, 2);
    }

    #[tokio::test]
    async fn test_next_result_waits_for_new_frame() {
        let mut pipeline = pipeline(None, RateLimiter::unlimited());
        let handle = pipeline.handle();

        let waiter = handle.clone();
        let first = tokio::spawn(async move { waiter.next_result(-1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!first.is_finished());
        pipeline.process_frame(frame(8, 0)).await;
        assert_eq!(first.await.unwrap().frame_id, 1);

        // Already newer than what the caller has seen: no wait.
        assert_eq!(handle.next_result(-1).await.frame_id, 1);

        let waiter = handle.clone();
        let second = tokio::spawn(async move { waiter.next_result(1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        pipeline.process_frame(frame(8, 0)).await;
        assert_eq!(second.await.unwrap().frame_id, 2);

        // Once the pipeline is gone, the last result comes back as is.
        let waiter = handle.clone();
        let ended = tokio::spawn(async move { waiter.next_result(2).await });
        drop(pipeline);
        assert_eq!(ended.await.unwrap().frame_id, 2);
    }

    #[tokio::test]
    async fn test_dropped_frames_reported() {
        let pipeline = pipeline(None, RateLimiter::unlimited());
        let handle = pipeline.handle();
        assert_eq!(handle.stats().frames_dropped, 0);
        handle.record_dropped_frame();
        handle.clone().record_dropped_frame();
        assert_eq!(handle.stats().frames_dropped, 2);
        let json = serde_json::to_value(handle.stats()).unwrap();
        assert_eq!(json["frames_dropped"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_throttled_rate() {
        let pipeline = pipeline(None, RateLimiter::new(20.0));  // 50ms period.
        let (sender, source) = ChannelFrameSource::new(16);
        for _ in 0..3 {
            sender.send(frame(8, 0)).await.unwrap();
        }
        drop(sender);
        let start = Instant::now();
        pipeline.run(source).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

}  // mod tests.

// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use chrono::Utc;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// One detected object. Coordinates are normalized to the detector's working
/// (resized) image dimensions, not to the native resolution of the frame that
/// was submitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub label: String,

    // In [0, 1].
    pub score: f32,

    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

/// The outcome of running one frame through a pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    // Starts at 1 for each pipeline instance and increases by one per
    // received frame. -1 is reserved for the "nothing published yet" sentinel.
    pub frame_id: i64,

    // Milliseconds since the Unix epoch. Always
    // capture_ts <= recv_ts <= inference_ts.
    pub capture_ts: i64,
    pub recv_ts: i64,
    pub inference_ts: i64,

    pub detections: Vec<DetectionBox>,
}

impl FrameResult {
    /// The value handed to consumers when nothing has been published yet. It
    /// is distinguishable from a legitimate zero-detection frame only by its
    /// `frame_id`.
    pub fn sentinel() -> Self {
        FrameResult{
            frame_id: -1,
            capture_ts: 0,
            recv_ts: 0,
            inference_ts: 0,
            detections: Vec::new(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.frame_id == -1
    }
}

/// A decoded frame as yielded by a frame source.
#[derive(Clone)]
pub struct SourceFrame {
    pub image: RgbImage,

    // When the producer captured the frame, ms since the Unix epoch.
    pub capture_ts: i64,

    // Size of the frame as it arrived over the wire, before decoding. Zero if
    // not known.
    pub encoded_len: usize,
}

/// Current wall clock time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_serialization() {
        let sentinel = FrameResult::sentinel();
        assert!(sentinel.is_sentinel());
        let json = serde_json::to_value(&sentinel).unwrap();
        assert_eq!(json, serde_json::json!({
            "frame_id": -1,
            "capture_ts": 0,
            "recv_ts": 0,
            "inference_ts": 0,
            "detections": [],
        }));

        // A zero-detection frame is not the sentinel.
        let empty = FrameResult{frame_id: 1, ..FrameResult::sentinel()};
        assert!(!empty.is_sentinel());
    }

    #[test]
    fn test_now_ms_is_recent() {
        // 2020-01-01 in ms.
        assert!(now_ms() > 1_577_836_800_000);
    }

}  // mod tests.

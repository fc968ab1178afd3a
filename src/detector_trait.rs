// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;

use canonical_error::CanonicalError;
use image::RgbImage;

use crate::detection::DetectionBox;
use crate::heuristic_detector::HeuristicDetector;
use crate::inference_engine_trait::InferenceEngineTrait;
use crate::model_detector::{DEFAULT_MAX_DETECTIONS, DEFAULT_SCORE_THRESHOLD,
                            ModelDetector};

/// Working size that detectors resize frames to before analysis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl Default for InputSize {
    fn default() -> Self {
        InputSize{width: 320, height: 240}
    }
}

// Turns a decoded frame into an ordered list of detections. The frame can be
// of any resolution; implementations resize to their own working size, and
// the returned coordinates are normalized to that working size.
//
// Implementations keep no cross-call state other than (optionally) a cached
// model handle, and must tolerate repeated calls. An Err return means this
// frame could not be analyzed; callers treat it as "no detections" and move
// on.
pub trait DetectorTrait {
    fn infer(&self, frame: &RgbImage) -> Result<Vec<DetectionBox>, CanonicalError>;

    // Short name for logging.
    fn name(&self) -> &str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorKind {
    Heuristic,
    Model,
}

impl DetectorKind {
    // Accepts our own names as well as the legacy MODE values ("wasm" ran
    // the heuristic, "server" loaded a model).
    pub fn parse(value: &str) -> Option<DetectorKind> {
        match value.to_ascii_lowercase().as_str() {
            "heuristic" | "wasm" => Some(DetectorKind::Heuristic),
            "model" | "server" => Some(DetectorKind::Model),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Heuristic => "heuristic",
            DetectorKind::Model => "model",
        }
    }
}

#[derive(Clone, Debug)]
pub struct DetectorParams {
    pub input_size: InputSize,

    // Only used by the model variant.
    pub model_path: Option<String>,

    // Model variant decoding: rows scoring below `score_threshold` are
    // dropped, and at most `max_detections` boxes are kept per frame.
    pub score_threshold: f32,
    pub max_detections: usize,

    // Seeds the heuristic variant's label/score randomness. None seeds from
    // entropy.
    pub seed: Option<u64>,
}

impl Default for DetectorParams {
    fn default() -> Self {
        DetectorParams{
            input_size: InputSize::default(),
            model_path: None,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            max_detections: DEFAULT_MAX_DETECTIONS,
            seed: None,
        }
    }
}

/// Builds the configured detector. Callers only ever see the trait object,
/// so the choice of variant stays a runtime configuration matter.
pub fn create_detector(
    kind: DetectorKind,
    params: &DetectorParams,
    engine: Option<Arc<dyn InferenceEngineTrait + Send + Sync>>)
    -> Arc<dyn DetectorTrait + Send + Sync>
{
    match kind {
        DetectorKind::Heuristic => {
            Arc::new(HeuristicDetector::new(params.input_size, params.seed))
        },
        DetectorKind::Model => {
            let mut detector = ModelDetector::new(params.input_size,
                                                  params.model_path.clone(), engine);
            detector.set_score_threshold(params.score_threshold);
            detector.set_max_detections(params.max_detections);
            Arc::new(detector)
        },
    }
}

// mod tests.

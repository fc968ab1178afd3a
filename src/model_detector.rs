// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};

use canonical_error::{CanonicalError, internal_error};
use image::RgbImage;
use image::imageops::{self, FilterType};
use log::{info, warn};

use crate::detection::DetectionBox;
use crate::detector_trait::{DetectorTrait, InputSize};
use crate::heuristic_detector::LABELS;
use crate::inference_engine_trait::{EngineHandle, InferenceEngineTrait,
                                    RawOutput, Tensor};

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_MAX_DETECTIONS: usize = 100;

/// Delegates detection to an injected inference engine. If there is no
/// engine, no model path, or the model fails to load, every frame yields no
/// detections; this never becomes a pipeline failure.
pub struct ModelDetector {
    input_size: InputSize,
    model_path: Option<String>,
    engine: Option<Arc<dyn InferenceEngineTrait + Send + Sync>>,

    score_threshold: f32,
    max_detections: usize,

    state: Mutex<ModelState>,
}

enum ModelState {
    // Not yet attempted.
    Unloaded,
    Loaded(EngineHandle),
    // Load was attempted and failed, or there is nothing to load. We don't
    // retry.
    Unavailable,
}

impl ModelDetector {
    pub fn new(input_size: InputSize,
               model_path: Option<String>,
               engine: Option<Arc<dyn InferenceEngineTrait + Send + Sync>>)
               -> Self {
        ModelDetector{
            input_size,
            model_path: model_path.filter(|p| !p.is_empty()),
            engine,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            max_detections: DEFAULT_MAX_DETECTIONS,
            state: Mutex::new(ModelState::Unloaded),
        }
    }

    pub fn set_score_threshold(&mut self, score_threshold: f32) {
        self.score_threshold = score_threshold;
    }

    pub fn set_max_detections(&mut self, max_detections: usize) {
        self.max_detections = max_detections;
    }

    // Returns the cached handle, loading it on first use.
    fn handle(&self) -> Result<Option<EngineHandle>, CanonicalError> {
        let mut state = self.state.lock().map_err(
            |_| internal_error("model detector state lock poisoned"))?;
        if let ModelState::Unloaded = *state {
            *state = match (&self.engine, &self.model_path) {
                (Some(engine), Some(path)) => match engine.load(path) {
                    Ok(handle) => {
                        info!("Loaded detection model {}", path);
                        ModelState::Loaded(handle)
                    },
                    Err(e) => {
                        warn!("Could not load model {}, detections disabled: {:?}",
                              path, e);
                        ModelState::Unavailable
                    }
                },
                (None, _) => {
                    warn!("No inference engine available, detections disabled");
                    ModelState::Unavailable
                },
                (_, None) => {
                    warn!("No model path configured, detections disabled");
                    ModelState::Unavailable
                },
            };
        }
        match &*state {
            ModelState::Loaded(handle) => Ok(Some(handle.clone())),
            _ => Ok(None),
        }
    }

    // Resized RGB frame as a 1x3xHxW tensor scaled to [0, 1].
    fn to_tensor(&self, frame: &RgbImage) -> Tensor {
        let (width, height) = (self.input_size.width, self.input_size.height);
        let resized = imageops::resize(frame, width, height, FilterType::Triangle);
        let plane = (width * height) as usize;
        let mut data = vec![0.0_f32; 3 * plane];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            for channel in 0..3 {
                data[channel * plane + offset] = pixel[channel] as f32 / 255.0;
            }
        }
        Tensor{shape: [1, 3, height as usize, width as usize], data}
    }

    fn decode(&self, output: &RawOutput) -> Vec<DetectionBox> {
        let mut detections = Vec::<DetectionBox>::new();
        for row in output.rows() {
            if detections.len() >= self.max_detections {
                break;
            }
            let score = row[4];
            if !(score >= self.score_threshold) {
                continue;  // Also rejects NaN.
            }
            let xmin = row[0].clamp(0.0, 1.0);
            let ymin = row[1].clamp(0.0, 1.0);
            let xmax = row[2].clamp(0.0, 1.0);
            let ymax = row[3].clamp(0.0, 1.0);
            if !(xmin < xmax && ymin < ymax) {
                continue;
            }
            let class_index = row[5];
            let label = if class_index >= 0.0 &&
                (class_index as usize) < LABELS.len()
            {
                LABELS[class_index as usize]
            } else {
                "object"
            };
            detections.push(DetectionBox{
                label: label.to_string(),
                score: score.min(1.0),
                xmin, ymin, xmax, ymax,
            });
        }
        detections
    }
}

impl DetectorTrait for ModelDetector {
    fn infer(&self, frame: &RgbImage) -> Result<Vec<DetectionBox>, CanonicalError> {
        let handle = match self.handle()? {
            Some(handle) => handle,
            None => return Ok(Vec::new()),
        };
        let engine = match &self.engine {
            Some(engine) => engine,
            None => return Ok(Vec::new()),
        };
        let input = self.to_tensor(frame);
        let output = engine.run(&handle, &input)?;
        Ok(self.decode(&output))
    }

    fn name(&self) -> &str {
        "model"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use canonical_error::{invalid_argument_error, not_found_error};
    use super::*;

    // Engine that "loads" any path ending in .onnx and returns canned rows.
    struct FakeEngine {
        rows: Vec<f32>,
        fail_run: bool,
        load_count: AtomicUsize,
        last_shape: Mutex<Option<[usize; 4]>>,
    }

    impl FakeEngine {
        fn new(rows: Vec<f32>, fail_run: bool) -> Self {
            FakeEngine{rows, fail_run, load_count: AtomicUsize::new(0),
                       last_shape: Mutex::new(None)}
        }
    }

    impl InferenceEngineTrait for FakeEngine {
        fn load(&self, model_path: &str) -> Result<EngineHandle, CanonicalError> {
            self.load_count.fetch_add(1, Ordering::Relaxed);
            if !model_path.ends_with(".onnx") {
                return Err(not_found_error(&format!("no model at {}", model_path)));
            }
            Ok(EngineHandle{model_path: model_path.to_string(),
                            inner: Arc::new(())})
        }

        fn run(&self, _handle: &EngineHandle, input: &Tensor)
               -> Result<RawOutput, CanonicalError> {
            *self.last_shape.lock().unwrap() = Some(input.shape);
            if self.fail_run {
                return Err(invalid_argument_error("bad tensor"));
            }
            Ok(RawOutput{data: self.rows.clone()})
        }
    }

    fn detector(engine: Arc<FakeEngine>, path: &str) -> ModelDetector {
        ModelDetector::new(InputSize::default(), Some(path.to_string()),
                           Some(engine))
    }

    #[test]
    fn test_decodes_engine_output() {
        let engine = Arc::new(FakeEngine::new(vec![
            0.1, 0.2, 0.5, 0.6, 0.9, 0.0,   // person
            0.1, 0.2, 0.5, 0.6, 0.1, 1.0,   // below threshold
            -0.5, 0.0, 1.5, 0.4, 0.8, 9.0,  // clamped, unknown class
            0.5, 0.5, 0.5, 0.9, 0.8, 2.0,   // degenerate
        ], false));
        let detector = detector(engine.clone(), "tiny.onnx");
        let detections = detector.infer(&RgbImage::new(640, 480)).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].label, "person");
        assert_eq!(detections[0].xmax, 0.5);
        assert_eq!(detections[1].label, "object");
        assert_eq!(detections[1].xmin, 0.0);
        assert_eq!(detections[1].xmax, 1.0);
        assert_eq!(*engine.last_shape.lock().unwrap(), Some([1, 3, 240, 320]));
    }

    #[test]
    fn test_model_loaded_once() {
        let engine = Arc::new(FakeEngine::new(vec![], false));
        let detector = detector(engine.clone(), "tiny.onnx");
        let frame = RgbImage::new(32, 32);
        detector.infer(&frame).unwrap();
        detector.infer(&frame).unwrap();
        assert_eq!(engine.load_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_load_failure_degrades_to_empty() {
        let engine = Arc::new(FakeEngine::new(vec![0.1, 0.1, 0.2, 0.2, 0.9, 0.0],
                                              false));
        let detector = detector(engine.clone(), "/missing/model.bin");
        let frame = RgbImage::new(32, 32);
        assert!(detector.infer(&frame).unwrap().is_empty());
        assert!(detector.infer(&frame).unwrap().is_empty());
        // Not retried.
        assert_eq!(engine.load_count.load(Ordering::Relaxed), 1);

        let no_path = ModelDetector::new(InputSize::default(), Some(String::new()),
                                         Some(engine));
        assert!(no_path.infer(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_run_failure_is_reported() {
        let engine = Arc::new(FakeEngine::new(vec![], true));
        let detector = detector(engine, "tiny.onnx");
        assert!(detector.infer(&RgbImage::new(32, 32)).is_err());
    }

    #[test]
    fn test_max_detections() {
        let mut rows = Vec::new();
        for _ in 0..10 {
            rows.extend_from_slice(&[0.1, 0.1, 0.2, 0.2, 0.9, 1.0]);
        }
        let mut detector = detector(Arc::new(FakeEngine::new(rows, false)),
                                    "tiny.onnx");
        detector.set_max_detections(4);
        detector.set_score_threshold(0.5);
        assert_eq!(detector.infer(&RgbImage::new(8, 8)).unwrap().len(), 4);
    }

}  // mod tests.

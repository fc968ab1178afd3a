// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! A stand-in detector with no model behind it. It finds bright blobs in the
//! frame and reports their bounding boxes under made-up labels and scores. It
//! is a motion/blob proxy for exercising the pipeline end to end, NOT a
//! semantic classifier: labels and scores carry no meaning.

use std::sync::Mutex;

use canonical_error::{CanonicalError, internal_error};
use image::{GrayImage, RgbImage};
use image::imageops::{self, FilterType};
use imageproc::contours::{BorderType, Contour, find_contours};
use imageproc::contrast::{ThresholdType, otsu_level, threshold};
use rand::{Rng, SeedableRng};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::detection::DetectionBox;
use crate::detector_trait::{DetectorTrait, InputSize};

pub const LABELS: [&str; 4] = ["person", "bottle", "cup", "phone"];

// Only this many contours (in discovery order) are considered per frame.
const MAX_CONTOURS: usize = 3;

// Bounding boxes smaller than this (in working size pixels) are dropped.
const MIN_BOX_AREA: u32 = 200;

const MIN_SCORE: f32 = 0.5;
const MAX_SCORE: f32 = 0.95;

pub struct HeuristicDetector {
    input_size: InputSize,

    // Source of the fake labels and scores.
    rng: Mutex<SmallRng>,
}

// Pixel-space bounding rectangle, inclusive of both edge pixels.
#[derive(Debug, PartialEq)]
struct BoundingRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl HeuristicDetector {
    pub fn new(input_size: InputSize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        HeuristicDetector{input_size, rng: Mutex::new(rng)}
    }

    // Resizes to the working size, converts to intensity, and binarizes with
    // an automatically chosen (Otsu) level.
    fn binarize(&self, frame: &RgbImage) -> GrayImage {
        let resized = imageops::resize(frame, self.input_size.width,
                                       self.input_size.height,
                                       FilterType::Triangle);
        let gray = imageops::grayscale(&resized);
        let level = otsu_level(&gray);
        threshold(&gray, level, ThresholdType::Binary)
    }

    fn bounding_rect(contour: &Contour<u32>) -> Option<BoundingRect> {
        let first = contour.points.first()?;
        let (mut min_x, mut min_y) = (first.x, first.y);
        let (mut max_x, mut max_y) = (first.x, first.y);
        for point in &contour.points {
            min_x = min_x.min(point.x);
            min_y = min_y.min(point.y);
            max_x = max_x.max(point.x);
            max_y = max_y.max(point.y);
        }
        Some(BoundingRect{
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
        })
    }
}

impl DetectorTrait for HeuristicDetector {
    fn infer(&self, frame: &RgbImage) -> Result<Vec<DetectionBox>, CanonicalError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let binary = self.binarize(frame);
        let contours = find_contours::<u32>(&binary);
        // External contours only: outer borders not nested inside a hole.
        let external = contours.iter().filter(|c| {
            c.border_type == BorderType::Outer && c.parent.is_none()
        });

        let width = self.input_size.width as f32;
        let height = self.input_size.height as f32;
        let mut rng = self.rng.lock().map_err(
            |_| internal_error("heuristic detector rng lock poisoned"))?;
        let mut detections = Vec::<DetectionBox>::new();
        for contour in external.take(MAX_CONTOURS) {
            let rect = match Self::bounding_rect(contour) {
                Some(rect) => rect,
                None => continue,
            };
            if rect.width * rect.height < MIN_BOX_AREA {
                continue;
            }
            let label = LABELS.choose(&mut *rng).copied().unwrap_or(LABELS[0]);
            detections.push(DetectionBox{
                label: label.to_string(),
                score: rng.gen_range(MIN_SCORE..=MAX_SCORE),
                xmin: rect.x as f32 / width,
                ymin: rect.y as f32 / height,
                xmax: (rect.x + rect.width) as f32 / width,
                ymax: (rect.y + rect.height) as f32 / height,
            });
        }
        Ok(detections)
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

// mod tests.

// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::any::Any;
use std::sync::Arc;

use canonical_error::CanonicalError;

/// Dense f32 tensor in NCHW layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

/// Output of one model run: `rows` records of `ROW_LEN` floats each, laid out
/// as `[xmin, ymin, xmax, ymax, score, class_index]` with coordinates
/// normalized to the model's input size.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawOutput {
    pub data: Vec<f32>,
}

impl RawOutput {
    pub const ROW_LEN: usize = 6;

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(Self::ROW_LEN)
    }
}

/// Opaque handle to a loaded model. Engines downcast `inner` to their own
/// session type.
#[derive(Clone)]
pub struct EngineHandle {
    pub model_path: String,
    pub inner: Arc<dyn Any + Send + Sync>,
}

// Adapter for whatever runtime executes the detection model. Both calls are
// synchronous CPU work from the caller's point of view.
// Errors:
//   NotFound / InvalidArgument: the model artifact is missing or unreadable.
//   Internal: the runtime failed while executing.
pub trait InferenceEngineTrait {
    fn load(&self, model_path: &str) -> Result<EngineHandle, CanonicalError>;

    fn run(&self, handle: &EngineHandle, input: &Tensor)
           -> Result<RawOutput, CanonicalError>;
}

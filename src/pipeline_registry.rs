// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::detection::FrameResult;
use crate::pipeline::{PipelineHandle, PipelineStats};

/// Pipeline that serves request/response frame submissions.
pub const UPLOAD_PIPELINE_ID: u64 = 0;

/// Directory of live pipelines, keyed by pipeline id, for consumers that look
/// up results by id. Streaming pipelines are numbered from 1.
pub struct PipelineRegistry {
    next_id: AtomicU64,
    handles: Mutex<BTreeMap<u64, PipelineHandle>>,
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRegistry {
    pub fn new() -> Self {
        PipelineRegistry{
            next_id: AtomicU64::new(UPLOAD_PIPELINE_ID + 1),
            handles: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, handle: PipelineHandle) {
        self.lock().insert(handle.id(), handle);
    }

    pub fn remove(&self, id: u64) -> Option<PipelineHandle> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<PipelineHandle> {
        self.lock().get(&id).cloned()
    }

    /// Latest result of the given pipeline; the sentinel if the pipeline is
    /// unknown or has not published yet.
    pub fn latest(&self, id: u64) -> FrameResult {
        match self.get(id) {
            Some(handle) => handle.latest(),
            None => FrameResult::sentinel(),
        }
    }

    pub fn stats(&self) -> Vec<PipelineStats> {
        self.handles().iter().map(|h| h.stats()).collect()
    }

    pub fn reset_session_stats(&self) {
        for handle in self.handles() {
            handle.reset_session_stats();
        }
    }

    // Clones the handles so no pipeline lock is taken under ours.
    fn handles(&self) -> Vec<PipelineHandle> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, PipelineHandle>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// mod tests.

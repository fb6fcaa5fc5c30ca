//! Single-writer, multi-reader snapshot of the ingestion job.

use std::sync::{Arc, RwLock};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Idle,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildProgressSnapshot {
    pub processing: bool,
    pub progress: usize,
    pub total: usize,
    pub current_file: String,
    pub status: BuildStatus,
}

impl Default for BuildProgressSnapshot {
    fn default() -> Self {
        Self {
            processing: false,
            progress: 0,
            total: 0,
            current_file: String::new(),
            status: BuildStatus::Idle,
        }
    }
}

/// The writer replaces the whole snapshot under a dedicated lock; readers
/// obtain a consistent copy. The lock is independent of the index itself.
#[derive(Clone, Default)]
pub struct BuildProgress {
    inner: Arc<RwLock<BuildProgressSnapshot>>,
}

impl BuildProgress {
    pub fn snapshot(&self) -> BuildProgressSnapshot {
        self.inner.read().expect("progress lock poisoned").clone()
    }

    /// Mark the job started. Returns false if one is already running.
    pub fn try_begin(&self) -> bool {
        let mut guard = self.inner.write().expect("progress lock poisoned");
        if guard.processing {
            return false;
        }
        *guard = BuildProgressSnapshot {
            processing: true,
            progress: 0,
            total: 0,
            current_file: "scanning documents".to_string(),
            status: BuildStatus::Running,
        };
        true
    }

    pub fn advance(&self, progress: usize, total: usize, current_file: &str) {
        let mut guard = self.inner.write().expect("progress lock poisoned");
        *guard = BuildProgressSnapshot {
            processing: true,
            progress: progress.min(total),
            total,
            current_file: current_file.to_string(),
            status: BuildStatus::Running,
        };
    }

    pub fn complete(&self, total: usize) {
        let mut guard = self.inner.write().expect("progress lock poisoned");
        *guard = BuildProgressSnapshot {
            processing: false,
            progress: total,
            total,
            current_file: "done".to_string(),
            status: BuildStatus::Completed,
        };
    }

    pub fn fail(&self, message: &str) {
        let mut guard = self.inner.write().expect("progress lock poisoned");
        *guard = BuildProgressSnapshot {
            processing: false,
            progress: guard.progress,
            total: guard.total,
            current_file: message.to_string(),
            status: BuildStatus::Error,
        };
    }
}

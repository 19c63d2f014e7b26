//! Metrics and observability for the prediction pipeline

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::Stage;

/// Process-wide pipeline counters
#[derive(Default)]
pub struct Metrics {
    pub total_predictions: AtomicU64,
    pub successful_predictions: AtomicU64,
    pub failed_predictions: AtomicU64,
    pub total_latency_ms: AtomicU64,

    // Per-stage failure counters
    pub assembly_failures: AtomicU64,
    pub upload_failures: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub classification_failures: AtomicU64,

    pub uploads: AtomicU64,
    pub uploaded_bytes: AtomicU64,
    pub failed_uploads: AtomicU64,
    pub skipped_array_members: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_prediction(&self, failed_stage: Option<Stage>, latency_ms: u64) {
        self.total_predictions.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        let Some(stage) = failed_stage else {
            self.successful_predictions.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.failed_predictions.fetch_add(1, Ordering::Relaxed);
        let counter = match stage {
            Stage::Assembly => &self.assembly_failures,
            Stage::Upload => &self.upload_failures,
            Stage::Dispatch => &self.dispatch_failures,
            Stage::Classification => &self.classification_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self, success: bool, bytes: usize) {
        if success {
            self.uploads.fetch_add(1, Ordering::Relaxed);
            self.uploaded_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        } else {
            self.failed_uploads.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_skipped_member(&self) {
        self.skipped_array_members.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_predictions.load(Ordering::Relaxed);
        let successful = self.successful_predictions.load(Ordering::Relaxed);
        let failed = self.failed_predictions.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_predictions: total,
            successful_predictions: successful,
            failed_predictions: failed,
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            failures: StageFailures {
                assembly: self.assembly_failures.load(Ordering::Relaxed),
                upload: self.upload_failures.load(Ordering::Relaxed),
                dispatch: self.dispatch_failures.load(Ordering::Relaxed),
                classification: self.classification_failures.load(Ordering::Relaxed),
            },
            uploads: UploadMetrics {
                completed: self.uploads.load(Ordering::Relaxed),
                bytes: self.uploaded_bytes.load(Ordering::Relaxed),
                failed: self.failed_uploads.load(Ordering::Relaxed),
                skipped_array_members: self.skipped_array_members.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_predictions: u64,
    pub successful_predictions: u64,
    pub failed_predictions: u64,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
    pub failures: StageFailures,
    pub uploads: UploadMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailures {
    pub assembly: u64,
    pub upload: u64,
    pub dispatch: u64,
    pub classification: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMetrics {
    pub completed: u64,
    pub bytes: u64,
    pub failed: u64,
    pub skipped_array_members: u64,
}

/// Timer for tracking operation latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

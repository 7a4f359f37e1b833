//! Run-wide progress tracking.
//!
//! Two kinds of state live here: per-task records (started/finished with
//! outcome and duration) and per-directory metrics. The metrics map is only
//! reachable through locked accessors — set, get, update, iterate — because
//! bare read-modify-write on a shared map is exactly the race this layer
//! exists to prevent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::TaskOutcome;

/// Receives progress callbacks from the batch processor.
pub trait ProgressReporter: Send + Sync {
    /// Monotonic `(current, total)` after each completed job.
    fn progress(&self, current: usize, total: usize, message: &str);

    /// Per-file events with timing; default is to ignore them.
    fn file_event(&self, _event: &FileEvent<'_>) {}
}

/// Fine-grained per-file notifications.
#[derive(Debug)]
pub enum FileEvent<'a> {
    BinarySkipped { path: &'a str, size: usize },
    TransformFailed { path: &'a str, error: &'a str, elapsed: Duration },
    Transformed { path: &'a str, elapsed: Duration },
}

/// Reporter that forwards everything to the log.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn progress(&self, current: usize, total: usize, message: &str) {
        log::debug!("[{current}/{total}] {message}");
    }

    fn file_event(&self, event: &FileEvent<'_>) {
        match event {
            FileEvent::BinarySkipped { path, size } => {
                log::debug!("{path}: binary ({size} bytes), copied verbatim");
            }
            FileEvent::TransformFailed { path, error, elapsed } => {
                log::warn!("{path}: transform failed after {elapsed:?}: {error}");
            }
            FileEvent::Transformed { path, elapsed } => {
                log::trace!("{path}: transformed in {elapsed:?}");
            }
        }
    }
}

/// Counters for one directory mapping of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryMetrics {
    pub discovered: usize,
    pub processed: usize,
    pub excluded: usize,
    pub skipped: usize,
    pub errored: usize,
    pub binary_skipped: usize,
    pub bytes_discovered: u64,
    pub bytes_processed: u64,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl DirectoryMetrics {
    pub fn elapsed(&self) -> Option<Duration> {
        Some(self.finished_at?.duration_since(self.started_at?))
    }
}

#[derive(Debug, Clone)]
struct TaskRecord {
    started_at: Instant,
    finished_at: Option<Instant>,
    outcome: Option<TaskOutcome>,
}

/// Thread-safe run-wide counters.
#[derive(Default)]
pub struct ProgressTracker {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    directory_metrics: Mutex<HashMap<String, DirectoryMetrics>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_started(&self, task_id: &str) {
        self.started.fetch_add(1, Ordering::Relaxed);
        let mut tasks = self.tasks.lock().expect("task map mutex poisoned");
        tasks.insert(
            task_id.to_string(),
            TaskRecord {
                started_at: Instant::now(),
                finished_at: None,
                outcome: None,
            },
        );
    }

    pub fn task_finished(&self, task_id: &str, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed { .. } => self.succeeded.fetch_add(1, Ordering::Relaxed),
            TaskOutcome::Skipped { .. } => self.skipped.fetch_add(1, Ordering::Relaxed),
            TaskOutcome::Failed { .. } => self.failed.fetch_add(1, Ordering::Relaxed),
        };

        let mut tasks = self.tasks.lock().expect("task map mutex poisoned");
        if let Some(record) = tasks.get_mut(task_id) {
            record.finished_at = Some(Instant::now());
            record.outcome = Some(outcome.clone());
        }
    }

    pub fn task_duration(&self, task_id: &str) -> Option<Duration> {
        let tasks = self.tasks.lock().expect("task map mutex poisoned");
        let record = tasks.get(task_id)?;
        Some(record.finished_at?.duration_since(record.started_at))
    }

    pub fn counts(&self) -> (u64, u64, u64, u64) {
        (
            self.started.load(Ordering::Relaxed),
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
        )
    }

    /// Replace the metrics for one directory key (`task-id:dest`).
    pub fn set_directory_metrics(&self, key: &str, metrics: DirectoryMetrics) {
        let mut map = self
            .directory_metrics
            .lock()
            .expect("metrics mutex poisoned");
        map.insert(key.to_string(), metrics);
    }

    pub fn get_directory_metrics(&self, key: &str) -> Option<DirectoryMetrics> {
        let map = self
            .directory_metrics
            .lock()
            .expect("metrics mutex poisoned");
        map.get(key).cloned()
    }

    /// Atomic read-modify-write for one directory's metrics.
    pub fn update_directory_metrics<F>(&self, key: &str, update: F)
    where
        F: FnOnce(&mut DirectoryMetrics),
    {
        let mut map = self
            .directory_metrics
            .lock()
            .expect("metrics mutex poisoned");
        update(map.entry(key.to_string()).or_default());
    }

    /// Iterate a consistent snapshot of all directory metrics.
    pub fn each_directory_metrics<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &DirectoryMetrics),
    {
        let snapshot: Vec<(String, DirectoryMetrics)> = {
            let map = self
                .directory_metrics
                .lock()
                .expect("metrics mutex poisoned");
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (key, metrics) in &snapshot {
            visit(key, metrics);
        }
    }
}

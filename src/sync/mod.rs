//! The sync engine.
//!
//! A run flows top-down through three layers:
//!
//! - [`engine`] discovers forge-side state, builds the task list, and runs
//!   groups in dependency order with bounded parallelism across targets
//! - [`repo`] is the per-target pipeline: clone, produce changes, branch,
//!   commit, push, and reconcile the pull request
//! - [`batch`] and [`directory`] turn mappings into [`FileJob`]s and drive a
//!   worker pool that reads, transforms, and compares each file
//!
//! Work fans out as a tree of threads: one coordinator, up to
//! `max_concurrency` repository pipelines, and a pool of `worker_count` file
//! workers inside each pipeline. Everything blocking checks the shared
//! [`CancelToken`](crate::cancel::CancelToken), so cancelling the root
//! cancels the whole tree promptly.

pub mod batch;
pub mod diff;
pub mod directory;
pub mod engine;
pub mod modules;
pub mod progress;
pub mod repo;

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::{SourceSpec, TargetSpec, TransformSettings};

/// One (source, target) pair selected for execution.
#[derive(Debug, Clone)]
pub struct Task {
    pub group_id: String,
    pub source: SourceSpec,
    /// Source head resolved at discovery time; the whole run pins to it.
    pub source_commit: String,
    pub target: TargetSpec,
    pub branch_prefix: String,
    /// Group-level transform defaults, overlaid by target and mapping.
    pub group_transform: Option<TransformSettings>,
    /// True when more than one configured group sources into this target.
    /// An up-to-date target still syncs in that case — the up-to-date bit is
    /// per-target, not per-source.
    pub multi_source: bool,
}

impl Task {
    pub fn id(&self) -> String {
        format!("{}:{}", self.group_id, self.target.repo)
    }
}

/// Unit of work for the batch-processor pool.
#[derive(Debug, Clone)]
pub struct FileJob {
    /// Absolute path inside the source checkout.
    pub source_path: PathBuf,
    /// Target-repo-relative destination.
    pub dest_path: String,
    pub transform: Option<TransformSettings>,
    /// Path relative to the directory mapping root, for directory jobs.
    pub relative_path: Option<String>,
    pub file_index: usize,
    pub total_files: usize,
}

/// The outcome of processing one file: an add, a modification, or a
/// deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    /// New content; `None` for deletions.
    pub content: Option<Vec<u8>>,
    /// The target's previous content; `None` for brand-new files.
    pub original: Option<Vec<u8>>,
    pub is_new: bool,
    pub is_deleted: bool,
}

impl FileChange {
    pub fn added(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content: Some(content),
            original: None,
            is_new: true,
            is_deleted: false,
        }
    }

    pub fn modified(path: impl Into<String>, content: Vec<u8>, original: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content: Some(content),
            original: Some(original),
            is_new: false,
            is_deleted: false,
        }
    }

    pub fn deleted(path: impl Into<String>, original: Option<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: None,
            original,
            is_new: false,
            is_deleted: true,
        }
    }
}

/// Result of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Changes were produced (and, outside dry-run, a PR created/updated).
    Completed {
        changes: usize,
        pr_number: Option<u64>,
        dry_run: bool,
    },
    /// Nothing to do, or the decide-if-needed rules said skip.
    Skipped { reason: String },
    Failed { error: String },
}

/// Aggregated result of a whole run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: Duration,
    pub outcomes: Vec<(String, TaskOutcome)>,
}

impl SyncReport {
    pub fn record(&mut self, task_id: String, outcome: TaskOutcome) {
        self.total += 1;
        match &outcome {
            TaskOutcome::Completed { .. } => self.successful += 1,
            TaskOutcome::Skipped { .. } => self.skipped += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push((task_id, outcome));
    }

    /// Task-id -> error for every failed task.
    pub fn errors(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                TaskOutcome::Failed { error } => Some((id.as_str(), error.as_str())),
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tasks: {} synced, {} skipped, {} failed in {:.1?}",
            self.total, self.successful, self.skipped, self.failed, self.duration
        )
    }
}

/// A counting semaphore bounding concurrent repository pipelines.
///
/// Permits are handed out as RAII guards so a panicking pipeline still
/// releases its slot.
#[derive(Clone)]
pub struct Semaphore {
    state: Arc<(Mutex<usize>, Condvar)>,
}

/// Permit released on drop. Created by [`Semaphore::acquire`].
pub struct SemaphoreGuard {
    state: Arc<(Mutex<usize>, Condvar)>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Arc::new((Mutex::new(permits), Condvar::new())),
        }
    }

    /// Block until a permit is available.
    pub fn acquire(&self) -> SemaphoreGuard {
        let (lock, cvar) = &*self.state;
        let mut available = lock.lock().expect("semaphore mutex poisoned");
        while *available == 0 {
            available = cvar.wait(available).expect("semaphore mutex poisoned");
        }
        *available -= 1;

        SemaphoreGuard {
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.state;
        if let Ok(mut available) = lock.lock() {
            *available += 1;
            cvar.notify_one();
        }
    }
}

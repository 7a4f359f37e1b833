//! Top-level orchestration.
//!
//! `Engine::sync` discovers forge-side state once, builds the task list the
//! configuration implies, and walks groups in topological order. Groups run
//! sequentially; the targets inside a group run in parallel, bounded by one
//! run-wide semaphore of `max_concurrency` permits. A group that fails (or
//! is skipped because its dependencies failed) marks every downstream group
//! skipped — their tasks are recorded, never run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;

use super::progress::{LogReporter, ProgressReporter, ProgressTracker};
use super::repo::{PipelineContext, RepositorySync};
use super::{Semaphore, SyncReport, Task, TaskOutcome};
use crate::ai::{CommitMessageGenerator, PrBodyGenerator};
use crate::cache::ContentCache;
use crate::cancel::CancelToken;
use crate::config::{ConfigError, SyncConfig, SyncGroup};
use crate::forge::ForgeClient;
use crate::git::GitClient;
use crate::state::{CurrentState, DiscoveryError, StateDiscoverer};
use crate::sync::modules::ModuleResolver;
use crate::tree::TreeClient;

const CACHE_MAX_MEMORY: usize = 64 * 1024 * 1024;
const CACHE_TTL: Duration = Duration::from_secs(3600);
const TREE_TTL: Duration = Duration::from_secs(300);
const TAG_TTL: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub enum EngineError {
    Config(ConfigError),
    Discovery(DiscoveryError),
    Cancelled,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Config(e) => write!(f, "{e}"),
            EngineError::Discovery(e) => write!(f, "{e}"),
            EngineError::Cancelled => write!(f, "sync cancelled"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e)
    }
}

impl From<DiscoveryError> for EngineError {
    fn from(e: DiscoveryError) -> Self {
        EngineError::Discovery(e)
    }
}

/// The sync engine: owns the configuration and every shared handle.
pub struct Engine {
    config: SyncConfig,
    discoverer: Arc<dyn StateDiscoverer>,
    ctx: PipelineContext,
}

impl Engine {
    /// Validates the configuration and wires up the shared services.
    pub fn new(
        config: SyncConfig,
        forge: Arc<dyn ForgeClient>,
        git: Arc<dyn GitClient>,
        discoverer: Arc<dyn StateDiscoverer>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let ctx = PipelineContext {
            settings: config.settings.clone(),
            forge: Arc::clone(&forge),
            git: Arc::clone(&git),
            cache: Arc::new(ContentCache::new(CACHE_MAX_MEMORY, CACHE_TTL)),
            trees: Arc::new(TreeClient::new(Arc::clone(&forge), TREE_TTL)),
            tracker: Arc::new(ProgressTracker::new()),
            reporter: Some(Arc::new(LogReporter)),
            commit_generator: None,
            pr_body_generator: None,
            resolver: Some(Arc::new(ModuleResolver::new(git, TAG_TTL))),
        };

        Ok(Self {
            config,
            discoverer,
            ctx,
        })
    }

    pub fn with_commit_generator(mut self, generator: Arc<dyn CommitMessageGenerator>) -> Self {
        self.ctx.commit_generator = Some(generator);
        self
    }

    pub fn with_pr_body_generator(mut self, generator: Arc<dyn PrBodyGenerator>) -> Self {
        self.ctx.pr_body_generator = Some(generator);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.ctx.reporter = Some(reporter);
        self
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.ctx.tracker
    }

    /// Run state discovery only (the `status` command).
    pub fn discover_state(&self, token: &CancelToken) -> Result<CurrentState, EngineError> {
        Ok(self.discoverer.discover(token, &self.config)?)
    }

    /// Run the whole fleet sync.
    pub fn sync(
        &self,
        token: &CancelToken,
        target_filter: Option<&str>,
    ) -> Result<SyncReport, EngineError> {
        let started = Instant::now();
        let state = self.discoverer.discover(token, &self.config)?;
        log::info!(
            "discovered {} sources, {} targets",
            state.sources.len(),
            state.targets.len()
        );

        let order = self.config.execution_order()?;
        let semaphore = Semaphore::new(self.ctx.settings.max_concurrency);
        let mut report = SyncReport::default();
        // Groups whose failure (or dependency-skip) poisons their dependents.
        let mut poisoned: HashSet<String> = HashSet::new();

        for index in order {
            let group = &self.config.groups[index];

            if !self.group_selected(group) {
                log::debug!("group {:?} filtered out", group.id);
                continue;
            }
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            if group.depends_on.iter().any(|dep| poisoned.contains(dep)) {
                log::warn!("group {:?} skipped: dependencies failed", group.id);
                for task in self.build_tasks(group, &state, target_filter) {
                    report.record(
                        task.id(),
                        TaskOutcome::Skipped {
                            reason: "Dependencies failed".to_string(),
                        },
                    );
                }
                poisoned.insert(group.id.clone());
                continue;
            }

            let tasks = self.build_tasks(group, &state, target_filter);
            if tasks.is_empty() {
                continue;
            }

            let mut group_failed = false;
            for (task_id, outcome) in self.run_group(token, &semaphore, &state, tasks) {
                if matches!(outcome, TaskOutcome::Failed { .. }) {
                    group_failed = true;
                }
                report.record(task_id, outcome);
            }
            if group_failed {
                poisoned.insert(group.id.clone());
            }
        }

        report.duration = started.elapsed();
        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        log::info!("{report}");
        Ok(report)
    }

    fn group_selected(&self, group: &SyncGroup) -> bool {
        let settings = &self.ctx.settings;
        if settings.skip_groups.iter().any(|id| id == &group.id) {
            return false;
        }
        if !settings.group_filter.is_empty()
            && !settings.group_filter.iter().any(|id| id == &group.id)
        {
            return false;
        }
        true
    }

    fn build_tasks(
        &self,
        group: &SyncGroup,
        state: &CurrentState,
        target_filter: Option<&str>,
    ) -> Vec<Task> {
        let source_commit = state
            .sources
            .get(&group.source.repo)
            .map(|s| s.latest_commit.clone())
            .unwrap_or_default();

        group
            .targets
            .iter()
            .filter(|target| target_filter.is_none_or(|filter| target.repo == filter))
            .map(|target| Task {
                group_id: group.id.clone(),
                source: group.source.clone(),
                source_commit: source_commit.clone(),
                target: target.clone(),
                branch_prefix: group.branch_prefix(&self.config.settings).to_string(),
                group_transform: group.transform.clone(),
                multi_source: self.config.sources_targeting(&target.repo) > 1,
            })
            .collect()
    }

    /// Run one group's tasks in bounded parallel and collect every outcome.
    fn run_group(
        &self,
        token: &CancelToken,
        semaphore: &Semaphore,
        state: &CurrentState,
        tasks: Vec<Task>,
    ) -> Vec<(String, TaskOutcome)> {
        let (tx, rx) = unbounded();

        std::thread::scope(|scope| {
            for task in &tasks {
                let tx = tx.clone();
                let semaphore = semaphore.clone();
                scope.spawn(move || {
                    let _permit = semaphore.acquire();
                    let task_id = task.id();

                    let outcome = if token.is_cancelled() {
                        TaskOutcome::Failed {
                            error: "cancelled".to_string(),
                        }
                    } else {
                        self.ctx.tracker.task_started(&task_id);
                        let outcome = RepositorySync::new(&self.ctx, task).run(token, state);
                        self.ctx.tracker.task_finished(&task_id, &outcome);
                        outcome
                    };
                    let _ = tx.send((task_id, outcome));
                });
            }
        });
        drop(tx);

        let mut outcomes: Vec<(String, TaskOutcome)> = rx.iter().collect();
        // Scope join makes collection complete; sort for stable reporting.
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }
}

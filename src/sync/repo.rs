//! Per-target pipeline.
//!
//! One task moves through a fixed sequence: decide whether sync is needed,
//! clone the source (pinned to the discovered commit) and the target, turn
//! file and directory mappings into changes, and — when anything actually
//! changed — branch, commit, push, and create or update the pull request.
//! The task-scoped temp directory is owned by a guard, so cleanup happens on
//! every exit path including panics and cancellation.
//!
//! Failure discipline: per-file problems are logged by the batch processor,
//! per-directory problems skip that directory (the task fails only if every
//! directory failed), and anything in the clone/commit/push/PR sequence
//! fails this task without touching its siblings.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;

use super::batch::{BatchContext, BatchProcessor, JobOutcome};
use super::diff::render_unified_diff;
use super::directory::DirectoryProcessor;
use super::modules::ModuleResolver;
use super::progress::{ProgressReporter, ProgressTracker};
use super::{FileChange, FileJob, Task, TaskOutcome};
use crate::ai::{
    ChangeSummary, CommitMessageGenerator, PrBodyGenerator, default_commit_message,
    default_pr_title,
};
use crate::cache::ContentCache;
use crate::cancel::CancelToken;
use crate::config::{Settings, TransformSettings};
use crate::forge::{ForgeClient, NewPullRequest, PrFilter};
use crate::git::{GitClient, task_checkout_paths};
use crate::state::{CurrentState, DirectoryReport, SyncMetadata, SyncStatus};
use crate::tree::TreeClient;

/// Engine-owned handles shared read-only with every pipeline.
pub struct PipelineContext {
    pub settings: Settings,
    pub forge: Arc<dyn ForgeClient>,
    pub git: Arc<dyn GitClient>,
    pub cache: Arc<ContentCache>,
    pub trees: Arc<TreeClient>,
    pub tracker: Arc<ProgressTracker>,
    pub reporter: Option<Arc<dyn ProgressReporter>>,
    pub commit_generator: Option<Arc<dyn CommitMessageGenerator>>,
    pub pr_body_generator: Option<Arc<dyn PrBodyGenerator>>,
    pub resolver: Option<Arc<ModuleResolver>>,
}

/// Runs one task end to end.
pub struct RepositorySync<'a> {
    ctx: &'a PipelineContext,
    task: &'a Task,
}

impl<'a> RepositorySync<'a> {
    pub fn new(ctx: &'a PipelineContext, task: &'a Task) -> Self {
        Self { ctx, task }
    }

    pub fn run(&self, token: &CancelToken, state: &CurrentState) -> TaskOutcome {
        if let Some(reason) = self.skip_reason(state) {
            log::info!("{}: skipped ({reason})", self.task.id());
            return TaskOutcome::Skipped { reason };
        }

        match self.execute(token) {
            Ok(outcome) => outcome,
            Err(error) => {
                log::error!("{}: {error:#}", self.task.id());
                TaskOutcome::Failed {
                    error: format!("{error:#}"),
                }
            }
        }
    }

    /// Decide-if-needed. `force` bypasses every rule.
    fn skip_reason(&self, state: &CurrentState) -> Option<String> {
        if self.ctx.settings.force {
            return None;
        }
        let target_state = state.targets.get(&self.task.target.repo)?;

        match target_state.status {
            SyncStatus::Unknown | SyncStatus::Behind => None,
            SyncStatus::UpToDate => {
                if self.task.multi_source {
                    None
                } else {
                    Some("target is up to date".to_string())
                }
            }
            SyncStatus::Pending => {
                if self.ctx.settings.update_existing_prs {
                    None
                } else {
                    Some("open sync PR exists and updating is disabled".to_string())
                }
            }
            SyncStatus::Conflict => {
                log::warn!(
                    "{}: target reports sync conflicts, leaving it alone",
                    self.task.id()
                );
                Some("target has unresolved sync conflicts".to_string())
            }
        }
    }

    fn execute(&self, token: &CancelToken) -> Result<TaskOutcome> {
        let task_id = self.task.id();
        let temp = TempDir::with_prefix("repocast-").context("creating task directory")?;
        let (source_dir, target_dir) = task_checkout_paths(temp.path());

        log::info!(
            "{task_id}: syncing {}@{} -> {}",
            self.task.source.repo,
            &self.task.source_commit[..self.task.source_commit.len().min(8)],
            self.task.target.repo
        );

        self.ctx
            .git
            .clone_repo(&self.task.source.repo, &self.task.source_commit, &source_dir)
            .with_context(|| format!("cloning source {}", self.task.source.repo))?;

        let target_branch = match &self.task.target.branch {
            Some(branch) => {
                self.ctx
                    .git
                    .clone_repo(&self.task.target.repo, branch, &target_dir)
                    .with_context(|| format!("cloning target {}", self.task.target.repo))?;
                branch.clone()
            }
            None => {
                self.ctx
                    .git
                    .clone_repo(&self.task.target.repo, "HEAD", &target_dir)
                    .with_context(|| format!("cloning target {}", self.task.target.repo))?;
                self.ctx
                    .git
                    .default_branch(&target_dir)
                    .unwrap_or_else(|_| "main".to_string())
            }
        };

        let batch_ctx = BatchContext {
            source_repo: self.task.source.repo.clone(),
            target_repo: self.task.target.repo.clone(),
            target_branch: target_branch.clone(),
        };
        let mut batch = BatchProcessor::new(
            Arc::clone(&self.ctx.forge),
            Arc::clone(&self.ctx.cache),
            self.ctx.settings.worker_count,
        );
        if let Some(reporter) = &self.ctx.reporter {
            batch = batch.with_reporter(Arc::clone(reporter));
        }

        let mut changes = Vec::new();
        let mut reports = Vec::new();

        self.process_file_mappings(token, &batch, &batch_ctx, &source_dir, &mut changes)?;
        self.process_directory_mappings(
            token,
            &batch,
            &batch_ctx,
            &task_id,
            &source_dir,
            &mut changes,
            &mut reports,
        )?;

        if changes.is_empty() {
            log::info!("{task_id}: no changes, nothing to sync");
            return Ok(TaskOutcome::Skipped {
                reason: "no changes".to_string(),
            });
        }

        let diff = render_unified_diff(&changes);
        let summary = self.summarize(&changes, diff);
        let branch = self.branch_name();

        if self.ctx.settings.dry_run {
            log::info!(
                "{task_id}: dry run - would push branch {branch} with {} changes and open a PR \
                 against {target_branch}",
                changes.len()
            );
            log::debug!("{task_id}: dry-run diff:\n{}", summary.diff);
            return Ok(TaskOutcome::Completed {
                changes: changes.len(),
                pr_number: None,
                dry_run: true,
            });
        }

        self.ctx
            .git
            .create_branch(&target_dir, &branch)
            .context("creating sync branch")?;
        apply_changes(&target_dir, &changes).context("writing changes to working tree")?;
        self.ctx
            .git
            .add_all(&target_dir)
            .context("staging changes")?;

        let message = self.commit_message(&summary);
        self.ctx
            .git
            .commit(&target_dir, &message)
            .context("committing changes")?;
        self.ctx
            .git
            .push(&target_dir, &branch, false)
            .context("pushing sync branch")?;

        let sync_commit = self
            .ctx
            .git
            .head_sha(&target_dir)
            .context("reading sync commit")?;

        let metadata = SyncMetadata {
            source_repo: self.task.source.repo.clone(),
            source_commit: self.task.source_commit.clone(),
            target_repo: self.task.target.repo.clone(),
            sync_commit,
            directories: reports,
        };

        let title = default_pr_title(&summary);
        let body = self.pr_body(&summary, &metadata);
        let pr_number = self
            .reconcile_pr(token, &branch, &target_branch, &title, &body)
            .context("creating pull request")?;

        if self.ctx.settings.automerge && !self.ctx.settings.automerge_labels.is_empty() {
            if let Err(e) = self.ctx.forge.add_labels(
                token,
                &self.task.target.repo,
                pr_number,
                &self.ctx.settings.automerge_labels,
            ) {
                log::warn!("{task_id}: failed to apply automerge labels: {e}");
            }
        }

        log::info!("{task_id}: opened PR #{pr_number} ({} changes)", changes.len());
        Ok(TaskOutcome::Completed {
            changes: changes.len(),
            pr_number: Some(pr_number),
            dry_run: false,
        })
    }

    fn process_file_mappings(
        &self,
        token: &CancelToken,
        batch: &BatchProcessor,
        batch_ctx: &BatchContext,
        source_dir: &Path,
        changes: &mut Vec<FileChange>,
    ) -> Result<()> {
        let mappings = &self.task.target.files;
        if mappings.is_empty() {
            return Ok(());
        }

        let mut jobs = Vec::new();
        for mapping in mappings {
            if mapping.delete {
                if let Some(change) = self.process_file_deletion(token, batch_ctx, &mapping.dest)? {
                    changes.push(change);
                }
                continue;
            }

            let transform = self.merged_transform(mapping.transform.as_ref());
            jobs.push(FileJob {
                source_path: source_dir.join(&mapping.src),
                dest_path: mapping.dest.clone(),
                transform,
                relative_path: None,
                file_index: jobs.len(),
                total_files: mappings.len(),
            });
        }

        let results = batch
            .process(token, batch_ctx, jobs)
            .map_err(|_| anyhow::anyhow!("cancelled"))?;
        for result in results {
            match result.outcome {
                JobOutcome::Changed(change) => changes.push(change),
                JobOutcome::Unchanged => {}
                JobOutcome::SourceMissing => {
                    log::debug!("{}: source file missing, skipped", result.dest_path);
                }
                JobOutcome::Error(message) => {
                    log::warn!("{}: {message}", result.dest_path);
                }
            }
        }
        Ok(())
    }

    /// A `delete: true` file mapping removes `dest` from the target; it only
    /// produces a change when the file actually exists there.
    fn process_file_deletion(
        &self,
        token: &CancelToken,
        batch_ctx: &BatchContext,
        dest: &str,
    ) -> Result<Option<FileChange>> {
        let tree = self
            .ctx
            .trees
            .get_tree(token, &batch_ctx.target_repo, &batch_ctx.target_branch)
            .context("fetching target tree for deletion")?;

        if !tree.has_file(dest) {
            log::debug!("{dest}: already absent from target, nothing to delete");
            return Ok(None);
        }

        let original = self
            .ctx
            .forge
            .get_file(token, &batch_ctx.target_repo, dest, &batch_ctx.target_branch)
            .ok();
        Ok(Some(FileChange::deleted(dest.to_string(), original)))
    }

    #[allow(clippy::too_many_arguments)]
    fn process_directory_mappings(
        &self,
        token: &CancelToken,
        batch: &BatchProcessor,
        batch_ctx: &BatchContext,
        task_id: &str,
        source_dir: &Path,
        changes: &mut Vec<FileChange>,
        reports: &mut Vec<DirectoryReport>,
    ) -> Result<()> {
        let mappings = &self.task.target.directories;
        if mappings.is_empty() {
            return Ok(());
        }

        let mut processor = DirectoryProcessor::new(
            Arc::clone(&self.ctx.forge),
            Arc::clone(&self.ctx.trees),
            Arc::clone(&self.ctx.tracker),
        );
        if let Some(resolver) = &self.ctx.resolver {
            processor = processor.with_resolver(Arc::clone(resolver));
        }

        let mut failures = 0;
        for mapping in mappings {
            let transform = self.merged_transform(mapping.transform.as_ref());
            match processor.process(
                token,
                batch,
                batch_ctx,
                task_id,
                source_dir,
                mapping,
                transform,
            ) {
                Ok((dir_changes, report)) => {
                    changes.extend(dir_changes);
                    reports.push(report);
                }
                Err(e) => {
                    log::warn!("{task_id}: directory {:?} failed: {e}", mapping.dest);
                    failures += 1;
                }
            }
            token.check().map_err(|_| anyhow::anyhow!("cancelled"))?;
        }

        // One broken directory is survivable; a task where nothing at all
        // could be processed is not.
        if failures == mappings.len() {
            anyhow::bail!("all {failures} directory mappings failed");
        }
        Ok(())
    }

    /// Merge transform layers: group defaults, then target, then mapping.
    fn merged_transform(&self, mapping: Option<&TransformSettings>) -> Option<TransformSettings> {
        let base = TransformSettings::merge(
            self.task.group_transform.as_ref(),
            self.task.target.transform.as_ref(),
        );
        TransformSettings::merge(base.as_ref(), mapping)
    }

    fn summarize(&self, changes: &[FileChange], diff: String) -> ChangeSummary {
        let mut summary = ChangeSummary {
            source_repo: self.task.source.repo.clone(),
            source_commit: self.task.source_commit.clone(),
            target_repo: self.task.target.repo.clone(),
            diff,
            ..Default::default()
        };
        for change in changes {
            if change.is_deleted {
                summary.deleted.push(change.path.clone());
            } else if change.is_new {
                summary.added.push(change.path.clone());
            } else {
                summary.modified.push(change.path.clone());
            }
        }
        summary.added.sort();
        summary.modified.sort();
        summary.deleted.sort();
        summary
    }

    /// Deterministic branch name: prefix, group, timestamp, short commit.
    fn branch_name(&self) -> String {
        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let short = &self.task.source_commit[..self.task.source_commit.len().min(8)];
        format!(
            "{}{}-{timestamp}-{short}",
            self.task.branch_prefix, self.task.group_id
        )
    }

    fn commit_message(&self, summary: &ChangeSummary) -> String {
        if let Some(generator) = &self.ctx.commit_generator {
            match generator.generate(summary) {
                Ok(message) => return message,
                Err(e) => log::warn!("commit message generation failed, using template: {e}"),
            }
        }
        default_commit_message(summary)
    }

    fn pr_body(&self, summary: &ChangeSummary, metadata: &SyncMetadata) -> String {
        let narrative = self
            .ctx
            .pr_body_generator
            .as_ref()
            .and_then(|generator| match generator.generate(summary) {
                Ok(body) => Some(body),
                Err(e) => {
                    log::warn!("PR body generation failed, using template: {e}");
                    None
                }
            });

        render_pr_body(summary, metadata, narrative.as_deref())
    }

    /// Create the PR, recovering from the orphan-branch rejection: if an
    /// open PR already rides this head ref, update it; otherwise delete the
    /// stale branch and retry the creation exactly once.
    fn reconcile_pr(
        &self,
        token: &CancelToken,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<u64> {
        let repo = &self.task.target.repo;
        let new_pr = NewPullRequest {
            title: title.to_string(),
            body: body.to_string(),
            head: branch.to_string(),
            base: base.to_string(),
        };

        let first_error = match self.ctx.forge.create_pr(token, repo, &new_pr) {
            Ok(pr) => return Ok(pr.number),
            Err(e) if e.is_invalid_head_branch() => e,
            Err(e) => return Err(e).context("create_pr"),
        };
        log::warn!("{repo}: create_pr rejected the head branch, attempting recovery");

        let open_prs = self
            .ctx
            .forge
            .list_prs(token, repo, PrFilter::Open)
            .context("listing open PRs for recovery")?;

        if let Some(existing) = open_prs.iter().find(|pr| pr.head_ref == branch) {
            self.ctx
                .forge
                .update_pr(token, repo, existing.number, title, body)
                .context("updating existing PR")?;
            log::info!("{repo}: updated existing PR #{}", existing.number);
            return Ok(existing.number);
        }

        // No PR rides the branch: it is an orphan from an earlier run.
        self.ctx
            .forge
            .delete_branch(token, repo, branch)
            .with_context(|| format!("deleting orphan branch after: {first_error}"))?;
        let pr = self
            .ctx
            .forge
            .create_pr(token, repo, &new_pr)
            .context("retrying create_pr after orphan cleanup")?;
        Ok(pr.number)
    }
}

/// Materialise the change set inside the target working tree.
fn apply_changes(dir: &Path, changes: &[FileChange]) -> std::io::Result<()> {
    for change in changes {
        let path = dir.join(&change.path);
        if change.is_deleted {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, change.content.as_deref().unwrap_or_default())?;
    }
    Ok(())
}

/// Default PR body: optional narrative, a "What Changed" section, and the
/// machine-readable metadata block future runs parse.
pub fn render_pr_body(
    summary: &ChangeSummary,
    metadata: &SyncMetadata,
    narrative: Option<&str>,
) -> String {
    let mut body = String::new();

    match narrative {
        Some(text) => {
            body.push_str(text.trim());
            body.push_str("\n\n");
        }
        None => {
            body.push_str(&format!(
                "Automated file sync from `{}`@`{}`.\n\n",
                summary.source_repo,
                &summary.source_commit[..summary.source_commit.len().min(8)]
            ));
        }
    }

    body.push_str("## What Changed\n\n");
    for path in &summary.added {
        body.push_str(&format!("- Added `{path}`\n"));
    }
    for path in &summary.modified {
        body.push_str(&format!("- Modified `{path}`\n"));
    }
    for path in &summary.deleted {
        body.push_str(&format!("- Deleted `{path}`\n"));
    }

    body.push('\n');
    body.push_str(&metadata.render_block());
    body.push('\n');
    body
}

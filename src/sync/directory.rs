//! Directory-mapping processing.
//!
//! Walks a mapped subtree of the source checkout, filters it through the
//! exclusion engine, translates destinations (structure-preserving or
//! flattened), and feeds the surviving files to the batch processor. Delete
//! mode never walks the source at all: it enumerates the target's tree and
//! emits a deletion per file under `dest`.
//!
//! Walk errors are warnings, not failures — a single unreadable entry must
//! not lose the rest of the tree.

use std::path::Path;
use std::sync::Arc;

use walkdir::WalkDir;

use super::batch::{BatchContext, BatchProcessor, JobOutcome};
use super::modules::ModuleResolver;
use super::progress::{DirectoryMetrics, ProgressTracker};
use super::{FileChange, FileJob};
use crate::cancel::{CancelToken, Cancelled};
use crate::config::{DirectoryMapping, TransformSettings};
use crate::exclusion::{ExclusionEngine, ExclusionError};
use crate::forge::{ForgeClient, ForgeError};
use crate::state::DirectoryReport;
use crate::transform::is_binary_path;
use crate::tree::TreeClient;

#[derive(Debug)]
pub enum DirectoryError {
    Pattern(ExclusionError),
    Tree(ForgeError),
    Cancelled,
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::Pattern(e) => write!(f, "{e}"),
            DirectoryError::Tree(e) => write!(f, "failed to enumerate target tree: {e}"),
            DirectoryError::Cancelled => write!(f, "directory processing cancelled"),
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<Cancelled> for DirectoryError {
    fn from(_: Cancelled) -> Self {
        DirectoryError::Cancelled
    }
}

/// Processes one [`DirectoryMapping`] end to end.
pub struct DirectoryProcessor {
    forge: Arc<dyn ForgeClient>,
    trees: Arc<TreeClient>,
    tracker: Arc<ProgressTracker>,
    resolver: Option<Arc<ModuleResolver>>,
}

impl DirectoryProcessor {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        trees: Arc<TreeClient>,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            forge,
            trees,
            tracker,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<ModuleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Produce the changes for one mapping, recording its metrics under
    /// `"{task_id}:{dest}"`.
    pub fn process(
        &self,
        token: &CancelToken,
        batch: &BatchProcessor,
        ctx: &BatchContext,
        task_id: &str,
        source_root: &Path,
        mapping: &DirectoryMapping,
        transform: Option<TransformSettings>,
    ) -> Result<(Vec<FileChange>, DirectoryReport), DirectoryError> {
        token.check()?;

        if mapping.delete {
            return self.process_deletion(token, ctx, task_id, mapping);
        }

        let engine = ExclusionEngine::new(&mapping.exclude, &mapping.include_only)
            .map_err(DirectoryError::Pattern)?;

        // Module-aware mappings walk a pinned tag checkout instead of the
        // task's source clone; the checkout guard removes it on scope exit.
        let checkout = match (&mapping.module, &self.resolver) {
            (Some(module), Some(resolver)) => {
                resolver.checkout(token, &ctx.source_repo, module)
            }
            _ => None,
        };
        let effective_root = checkout
            .as_ref()
            .map(|c| c.root.as_path())
            .unwrap_or(source_root);

        let mut metrics = DirectoryMetrics {
            started_at: Some(std::time::Instant::now()),
            ..Default::default()
        };
        let candidates = self.discover(
            token,
            &engine,
            mapping,
            &effective_root.join(&mapping.src),
            &mut metrics,
        )?;

        let total = candidates.len();
        let jobs: Vec<FileJob> = candidates
            .into_iter()
            .enumerate()
            .map(|(index, candidate)| {
                if is_binary_path(&candidate.relative) {
                    metrics.binary_skipped += 1;
                }
                FileJob {
                    source_path: candidate.absolute,
                    dest_path: translate_dest(&mapping.dest, &candidate.relative, mapping.preserve_structure),
                    transform: transform.clone(),
                    relative_path: Some(candidate.relative),
                    file_index: index,
                    total_files: total,
                }
            })
            .collect();

        let results = batch.process(token, ctx, jobs)?;

        let mut changes = Vec::new();
        for result in results {
            match result.outcome {
                JobOutcome::Changed(change) => {
                    metrics.processed += 1;
                    if let Some(content) = &change.content {
                        metrics.bytes_processed += content.len() as u64;
                    }
                    changes.push(change);
                }
                JobOutcome::Unchanged | JobOutcome::SourceMissing => metrics.skipped += 1,
                JobOutcome::Error(message) => {
                    log::warn!("{}: {message}", result.dest_path);
                    metrics.errored += 1;
                }
            }
        }

        metrics.finished_at = Some(std::time::Instant::now());
        let report = DirectoryReport {
            path: mapping.dest.clone(),
            files_examined: metrics.discovered,
            files_synced: metrics.processed,
        };
        self.tracker
            .set_directory_metrics(&format!("{task_id}:{}", mapping.dest), metrics);

        Ok((changes, report))
    }

    fn discover(
        &self,
        token: &CancelToken,
        engine: &ExclusionEngine,
        mapping: &DirectoryMapping,
        walk_root: &Path,
        metrics: &mut DirectoryMetrics,
    ) -> Result<Vec<Candidate>, DirectoryError> {
        let mut candidates = Vec::new();
        let include_hidden = mapping.include_hidden;

        let root = walk_root.to_path_buf();
        let pruning_root = root.clone();
        let pruning_engine = engine.clone();
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |entry| {
                let Ok(rel) = entry.path().strip_prefix(&pruning_root) else {
                    return true;
                };
                if rel.as_os_str().is_empty() || !entry.file_type().is_dir() {
                    return true;
                }
                if !include_hidden
                    && entry.file_name().to_string_lossy().starts_with('.')
                {
                    return false;
                }
                let rel = rel.to_string_lossy().replace('\\', "/");
                !pruning_engine.is_directory_excluded(&rel)
            });

        for entry in walker {
            token.check()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("walk error under {}: {e}", walk_root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(walk_root) else {
                continue;
            };
            let relative = rel.to_string_lossy().replace('\\', "/");

            metrics.discovered += 1;
            if let Ok(meta) = entry.metadata() {
                metrics.bytes_discovered += meta.len();
            }

            if !include_hidden
                && entry.file_name().to_string_lossy().starts_with('.')
            {
                metrics.skipped += 1;
                continue;
            }
            if engine.is_excluded(&relative) {
                metrics.excluded += 1;
                continue;
            }

            candidates.push(Candidate {
                absolute: entry.into_path(),
                relative,
            });
        }

        Ok(candidates)
    }

    /// Delete mode: enumerate the target's tree under `dest` and emit a
    /// deletion per file, with best-effort original content for the diff.
    fn process_deletion(
        &self,
        token: &CancelToken,
        ctx: &BatchContext,
        task_id: &str,
        mapping: &DirectoryMapping,
    ) -> Result<(Vec<FileChange>, DirectoryReport), DirectoryError> {
        let tree = self
            .trees
            .get_tree(token, &ctx.target_repo, &ctx.target_branch)
            .map_err(DirectoryError::Tree)?;

        let mut metrics = DirectoryMetrics {
            started_at: Some(std::time::Instant::now()),
            ..Default::default()
        };
        let mut changes = Vec::new();

        for path in tree.files_under(&mapping.dest) {
            token.check()?;
            metrics.discovered += 1;

            let original = match self
                .forge
                .get_file(token, &ctx.target_repo, &path, &ctx.target_branch)
            {
                Ok(content) => Some(content),
                Err(e) => {
                    log::debug!("no original content for {path}: {e}");
                    None
                }
            };
            metrics.processed += 1;
            changes.push(FileChange::deleted(path, original));
        }

        metrics.finished_at = Some(std::time::Instant::now());
        let report = DirectoryReport {
            path: mapping.dest.clone(),
            files_examined: metrics.discovered,
            files_synced: metrics.processed,
        };
        self.tracker
            .set_directory_metrics(&format!("{task_id}:{}", mapping.dest), metrics);

        Ok((changes, report))
    }
}

struct Candidate {
    absolute: std::path::PathBuf,
    relative: String,
}

/// Destination path for one discovered file.
///
/// Structure-preserving keeps the relative path under `dest`; flatten mode
/// drops everything but the base name (collisions are last-writer-wins).
fn translate_dest(dest: &str, relative: &str, preserve_structure: bool) -> String {
    let dest = dest.trim_end_matches('/');
    let tail = if preserve_structure {
        relative
    } else {
        relative.rsplit('/').next().unwrap_or(relative)
    };
    if dest.is_empty() || dest == "." {
        tail.to_string()
    } else {
        format!("{dest}/{tail}")
    }
}

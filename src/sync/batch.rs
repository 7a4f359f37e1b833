//! Worker pool turning [`FileJob`]s into [`FileChange`]s.
//!
//! Jobs and results flow through bounded crossbeam channels sized to the job
//! count, so sends never stall. The close protocol is fixed: the submitting
//! thread sends every job and drops the sender (the only writer that closes
//! the job channel); workers never close anything; the result channel closes
//! when the last worker's sender drops at scope exit, after which the
//! collector drains it. Worker bodies run under `catch_unwind`, so every job
//! accounts for exactly one result even if processing panics.
//!
//! Per-file failures are results, not errors: a failed transform falls back
//! to the original bytes, a missing source becomes a skip. Only cancellation
//! aborts the batch.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_channel::{bounded, select};

use super::progress::{FileEvent, ProgressReporter};
use super::{FileChange, FileJob};
use crate::cache::ContentCache;
use crate::cancel::{CancelToken, Cancelled};
use crate::config::TransformSettings;
use crate::forge::ForgeClient;
use crate::transform::template::{RepoNameTransformer, TemplateTransformer};
use crate::transform::{TransformChain, TransformContext, is_binary};

/// Repos and branch the current batch runs against.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub source_repo: String,
    pub target_repo: String,
    pub target_branch: String,
}

/// What happened to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Changed(FileChange),
    /// Target already holds identical content.
    Unchanged,
    /// Source file vanished between discovery and read.
    SourceMissing,
    Error(String),
}

/// Exactly one of these is produced per submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub dest_path: String,
    pub outcome: JobOutcome,
}

/// Build the transformer chain for one mapping's settings.
pub fn build_chain(settings: &TransformSettings) -> TransformChain {
    let mut chain = TransformChain::new();
    if settings.repo_name {
        chain.push(Box::new(RepoNameTransformer));
    }
    if settings.template {
        chain.push(Box::new(TemplateTransformer));
    }
    chain
}

/// Bounded-concurrency file processor shared by file and directory mappings.
pub struct BatchProcessor {
    forge: Arc<dyn ForgeClient>,
    cache: Arc<ContentCache>,
    worker_count: usize,
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl BatchProcessor {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        cache: Arc<ContentCache>,
        worker_count: usize,
    ) -> Self {
        Self {
            forge,
            cache,
            worker_count: worker_count.max(1),
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Process all jobs through the pool, returning one result per job.
    pub fn process(
        &self,
        token: &CancelToken,
        ctx: &BatchContext,
        jobs: Vec<FileJob>,
    ) -> Result<Vec<JobResult>, Cancelled> {
        token.check()?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let total = jobs.len();
        let (job_tx, job_rx) = bounded::<FileJob>(total);
        let (result_tx, result_rx) = bounded::<JobResult>(total);

        // Producer: buffered to len(jobs), so this never blocks; dropping
        // the sender is what closes the job channel.
        for job in jobs {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let completed = AtomicUsize::new(0);
        let workers = self.worker_count.min(total);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let completed = &completed;
                scope.spawn(move || {
                    loop {
                        let job = select! {
                            recv(token.cancelled_channel()) -> _ => break,
                            recv(job_rx) -> msg => match msg {
                                Ok(job) => job,
                                // Job channel closed: input exhausted.
                                Err(_) => break,
                            },
                        };

                        let dest = job.dest_path.clone();
                        let result =
                            catch_unwind(AssertUnwindSafe(|| self.process_job(token, ctx, &job)))
                                .unwrap_or_else(|_| JobResult {
                                    dest_path: dest,
                                    outcome: JobOutcome::Error(
                                        "worker panicked while processing file".to_string(),
                                    ),
                                });

                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        if let Some(reporter) = &self.reporter {
                            reporter.progress(done, total, &result.dest_path);
                        }
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
        });

        // Collector: all worker senders are gone once the scope joins, so
        // this drains to disconnect without blocking.
        drop(result_tx);
        let results: Vec<JobResult> = result_rx.iter().collect();

        token.check()?;
        Ok(results)
    }

    fn process_job(&self, token: &CancelToken, ctx: &BatchContext, job: &FileJob) -> JobResult {
        let dest_path = job.dest_path.clone();

        let source_bytes = match std::fs::read(&job.source_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("{}: source missing, skipping", job.source_path.display());
                return JobResult {
                    dest_path,
                    outcome: JobOutcome::SourceMissing,
                };
            }
            Err(e) => {
                return JobResult {
                    dest_path,
                    outcome: JobOutcome::Error(format!(
                        "failed to read {}: {e}",
                        job.source_path.display()
                    )),
                };
            }
        };

        let binary = is_binary(&job.dest_path, &source_bytes);
        if binary && let Some(reporter) = &self.reporter {
            reporter.file_event(&FileEvent::BinarySkipped {
                path: &job.dest_path,
                size: source_bytes.len(),
            });
        }

        let output = match (&job.transform, binary) {
            (Some(settings), false) if !settings.is_noop() => {
                self.apply_transforms(ctx, job, settings, &source_bytes)
            }
            _ => source_bytes.clone(),
        };

        let existing = match self.existing_content(token, ctx, &job.dest_path) {
            Ok(existing) => existing,
            Err(message) => {
                return JobResult {
                    dest_path,
                    outcome: JobOutcome::Error(message),
                };
            }
        };

        match existing {
            Some(current) if current == output => JobResult {
                dest_path,
                outcome: JobOutcome::Unchanged,
            },
            Some(current) => JobResult {
                dest_path: dest_path.clone(),
                outcome: JobOutcome::Changed(FileChange::modified(dest_path, output, current)),
            },
            None => JobResult {
                dest_path: dest_path.clone(),
                outcome: JobOutcome::Changed(FileChange::added(dest_path, output)),
            },
        }
    }

    /// Run the chain; on failure log, report, and fall back to the original
    /// bytes so one broken file cannot abort the batch.
    fn apply_transforms(
        &self,
        ctx: &BatchContext,
        job: &FileJob,
        settings: &TransformSettings,
        source_bytes: &[u8],
    ) -> Vec<u8> {
        let chain = build_chain(settings);
        let transform_ctx = TransformContext {
            source_repo: ctx.source_repo.clone(),
            target_repo: ctx.target_repo.clone(),
            file_path: job.dest_path.clone(),
            variables: settings.variables.clone(),
            relative_path: job.relative_path.clone(),
            file_index: Some(job.file_index),
            total_files: Some(job.total_files),
        };

        let start = Instant::now();
        match chain.apply(source_bytes.to_vec(), &transform_ctx) {
            Ok(bytes) => {
                if let Some(reporter) = &self.reporter {
                    reporter.file_event(&FileEvent::Transformed {
                        path: &job.dest_path,
                        elapsed: start.elapsed(),
                    });
                }
                bytes
            }
            Err(err) => {
                log::warn!(
                    "{}: transform failed, using original content: {err}",
                    job.dest_path
                );
                if let Some(reporter) = &self.reporter {
                    reporter.file_event(&FileEvent::TransformFailed {
                        path: &job.dest_path,
                        error: &err.to_string(),
                        elapsed: start.elapsed(),
                    });
                }
                source_bytes.to_vec()
            }
        }
    }

    /// Current content of the destination on the target, via the cache.
    fn existing_content(
        &self,
        token: &CancelToken,
        ctx: &BatchContext,
        dest_path: &str,
    ) -> Result<Option<Vec<u8>>, String> {
        match self
            .cache
            .get(token, &ctx.target_repo, &ctx.target_branch, dest_path)
        {
            Ok(Some(content)) => return Ok(Some(content.as_ref().clone())),
            Ok(None) => {}
            Err(e) => return Err(e.to_string()),
        }

        match self
            .forge
            .get_file(token, &ctx.target_repo, dest_path, &ctx.target_branch)
        {
            Ok(content) => {
                if let Err(e) = self.cache.put(
                    token,
                    &ctx.target_repo,
                    &ctx.target_branch,
                    dest_path,
                    content.clone(),
                ) {
                    log::debug!("not caching {dest_path}: {e}");
                }
                Ok(Some(content))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(format!("failed to fetch {dest_path}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::{
        CommitInfo, ForgeError, GitTree, NewPullRequest, PrFilter, PullRequest,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Forge stub serving a fixed file table.
    struct FileForge {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl FileForge {
        fn new(files: &[(&str, &[u8])]) -> Self {
            Self {
                files: Mutex::new(
                    files
                        .iter()
                        .map(|(path, content)| (path.to_string(), content.to_vec()))
                        .collect(),
                ),
            }
        }
    }

    impl ForgeClient for FileForge {
        fn get_commit(
            &self,
            _t: &CancelToken,
            _r: &str,
            _g: &str,
        ) -> Result<CommitInfo, ForgeError> {
            Ok(CommitInfo { sha: "x".into() })
        }

        fn get_git_tree(
            &self,
            _t: &CancelToken,
            _r: &str,
            sha: &str,
            _rec: bool,
        ) -> Result<GitTree, ForgeError> {
            Ok(GitTree {
                sha: sha.into(),
                entries: Vec::new(),
                truncated: false,
            })
        }

        fn get_file(
            &self,
            _t: &CancelToken,
            repo: &str,
            path: &str,
            _r: &str,
        ) -> Result<Vec<u8>, ForgeError> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| ForgeError::NotFound {
                    repo: repo.into(),
                    what: format!("file {path}"),
                })
        }

        fn list_prs(
            &self,
            _t: &CancelToken,
            _r: &str,
            _f: PrFilter,
        ) -> Result<Vec<PullRequest>, ForgeError> {
            Ok(Vec::new())
        }

        fn create_pr(
            &self,
            _t: &CancelToken,
            _r: &str,
            _p: &NewPullRequest,
        ) -> Result<PullRequest, ForgeError> {
            unimplemented!("not used in batch tests")
        }

        fn update_pr(
            &self,
            _t: &CancelToken,
            _r: &str,
            _n: u64,
            _ti: &str,
            _b: &str,
        ) -> Result<(), ForgeError> {
            Ok(())
        }

        fn add_labels(
            &self,
            _t: &CancelToken,
            _r: &str,
            _n: u64,
            _l: &[String],
        ) -> Result<(), ForgeError> {
            Ok(())
        }

        fn delete_branch(&self, _t: &CancelToken, _r: &str, _b: &str) -> Result<(), ForgeError> {
            Ok(())
        }

        fn list_branches(&self, _t: &CancelToken, _r: &str) -> Result<Vec<String>, ForgeError> {
            Ok(Vec::new())
        }

        fn current_user(&self, _t: &CancelToken) -> Result<String, ForgeError> {
            Ok("stub".into())
        }
    }

    fn processor(forge: FileForge, workers: usize) -> BatchProcessor {
        BatchProcessor::new(
            Arc::new(forge),
            Arc::new(ContentCache::new(1 << 20, Duration::from_secs(60))),
            workers,
        )
    }

    fn ctx() -> BatchContext {
        BatchContext {
            source_repo: "org/template".into(),
            target_repo: "org/app".into(),
            target_branch: "main".into(),
        }
    }

    fn job(dir: &std::path::Path, name: &str, index: usize, total: usize) -> FileJob {
        FileJob {
            source_path: dir.join(name),
            dest_path: name.to_string(),
            transform: None,
            relative_path: None,
            file_index: index,
            total_files: total,
        }
    }

    #[test]
    fn test_every_job_yields_exactly_one_result() {
        let dir = tempfile::tempdir().unwrap();
        let total = 25;
        let mut jobs = Vec::new();
        for i in 0..total {
            let name = format!("file-{i}.txt");
            std::fs::write(dir.path().join(&name), format!("content {i}")).unwrap();
            jobs.push(job(dir.path(), &name, i, total));
        }

        let p = processor(FileForge::new(&[]), 4);
        let results = p.process(&CancelToken::new(), &ctx(), jobs).unwrap();

        assert_eq!(results.len(), total);
        assert!(results
            .iter()
            .all(|r| matches!(r.outcome, JobOutcome::Changed(_))));
    }

    #[test]
    fn test_unchanged_content_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("same.txt"), b"identical").unwrap();

        let p = processor(FileForge::new(&[("same.txt", b"identical")]), 2);
        let results = p
            .process(&CancelToken::new(), &ctx(), vec![job(dir.path(), "same.txt", 0, 1)])
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, JobOutcome::Unchanged);
    }

    #[test]
    fn test_modified_content_carries_original() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.go"), b"B").unwrap();

        let p = processor(FileForge::new(&[("main.go", b"B-old")]), 2);
        let results = p
            .process(&CancelToken::new(), &ctx(), vec![job(dir.path(), "main.go", 0, 1)])
            .unwrap();

        match &results[0].outcome {
            JobOutcome::Changed(change) => {
                assert!(!change.is_new);
                assert_eq!(change.content.as_deref(), Some(b"B".as_slice()));
                assert_eq!(change.original.as_deref(), Some(b"B-old".as_slice()));
            }
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_target_file_is_new() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fresh.txt"), b"hello").unwrap();

        let p = processor(FileForge::new(&[]), 2);
        let results = p
            .process(&CancelToken::new(), &ctx(), vec![job(dir.path(), "fresh.txt", 0, 1)])
            .unwrap();

        match &results[0].outcome {
            JobOutcome::Changed(change) => {
                assert!(change.is_new);
                assert!(change.original.is_none());
            }
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_source_is_skip_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(FileForge::new(&[]), 2);
        let results = p
            .process(&CancelToken::new(), &ctx(), vec![job(dir.path(), "ghost.txt", 0, 1)])
            .unwrap();
        assert_eq!(results[0].outcome, JobOutcome::SourceMissing);
    }

    #[test]
    fn test_transform_failure_falls_back_to_original() {
        let dir = tempfile::tempdir().unwrap();
        // Invalid UTF-8 makes the template transformer fail.
        std::fs::write(dir.path().join("blob.txt"), [0xff, 0xfe, 0x41]).unwrap();

        let settings = TransformSettings {
            template: true,
            repo_name: false,
            variables: Default::default(),
        };
        let mut j = job(dir.path(), "blob.txt", 0, 1);
        j.transform = Some(settings);

        let p = processor(FileForge::new(&[]), 1);
        let results = p.process(&CancelToken::new(), &ctx(), vec![j]).unwrap();

        match &results[0].outcome {
            JobOutcome::Changed(change) => {
                assert_eq!(change.content.as_deref(), Some([0xff, 0xfe, 0x41].as_slice()));
            }
            other => panic!("expected fallback change, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_bypasses_transform() {
        let dir = tempfile::tempdir().unwrap();
        let payload = [0u8, 1, 2, 3];
        std::fs::write(dir.path().join("logo.png"), payload).unwrap();

        let settings = TransformSettings {
            template: true,
            repo_name: true,
            variables: Default::default(),
        };
        let mut j = job(dir.path(), "logo.png", 0, 1);
        j.transform = Some(settings);

        let p = processor(FileForge::new(&[]), 1);
        let results = p.process(&CancelToken::new(), &ctx(), vec![j]).unwrap();

        match &results[0].outcome {
            JobOutcome::Changed(change) => {
                assert_eq!(change.content.as_deref(), Some(payload.as_slice()));
            }
            other => panic!("expected verbatim change, got {other:?}"),
        }
    }

    #[test]
    fn test_template_transform_applies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("n.txt"), b"repo is {{ target_repo }}").unwrap();

        let settings = TransformSettings {
            template: true,
            repo_name: false,
            variables: Default::default(),
        };
        let mut j = job(dir.path(), "n.txt", 0, 1);
        j.transform = Some(settings);

        let p = processor(FileForge::new(&[]), 1);
        let results = p.process(&CancelToken::new(), &ctx(), vec![j]).unwrap();

        match &results[0].outcome {
            JobOutcome::Changed(change) => {
                assert_eq!(change.content.as_deref(), Some(b"repo is org/app".as_slice()));
            }
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn test_progress_reporter_sees_every_job() {
        struct Counting(AtomicUsize);
        impl ProgressReporter for Counting {
            fn progress(&self, _c: usize, _t: usize, _m: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut jobs = Vec::new();
        for i in 0..7 {
            let name = format!("f{i}");
            std::fs::write(dir.path().join(&name), b"x").unwrap();
            jobs.push(job(dir.path(), &name, i, 7));
        }

        let reporter = Arc::new(Counting(AtomicUsize::new(0)));
        let p = processor(FileForge::new(&[]), 3).with_reporter(Arc::clone(&reporter) as _);
        p.process(&CancelToken::new(), &ctx(), jobs).unwrap();

        assert_eq!(reporter.0.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_cancellation_aborts_batch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();

        let token = CancelToken::new();
        token.cancel();

        let p = processor(FileForge::new(&[]), 2);
        let result = p.process(&token, &ctx(), vec![job(dir.path(), "f", 0, 1)]);
        assert_eq!(result, Err(Cancelled));
    }

    #[test]
    fn test_empty_job_list() {
        let p = processor(FileForge::new(&[]), 2);
        let results = p.process(&CancelToken::new(), &ctx(), Vec::new()).unwrap();
        assert!(results.is_empty());
    }
}

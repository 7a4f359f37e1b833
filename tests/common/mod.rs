//! Test harness: in-memory forge and git collaborators.
//!
//! `MockForge` serves a per-repo file table (from which trees are derived),
//! records every call, and can be told to fail PR creation in the two ways
//! the engine must handle: once with the orphan-branch validation error, or
//! always (to fail a whole group). `MockGit` "clones" by copying a fixture
//! directory, so the pipeline exercises real filesystem walks without a git
//! binary.

// Each integration-test binary compiles its own copy of this module and
// uses a different subset of the harness.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use repocast::cancel::CancelToken;
use repocast::config::SyncConfig;
use repocast::forge::{
    CommitInfo, ForgeClient, ForgeError, GitTree, NewPullRequest, PrFilter, PullRequest,
    TreeEntry, TreeEntryKind,
};
use repocast::git::{GitClient, GitError};
use repocast::state::{
    CurrentState, DiscoveryError, SourceState, StateDiscoverer, SyncStatus, TargetState,
};

/// Parse and validate a YAML manifest for a test.
pub fn manifest(yaml: &str) -> SyncConfig {
    let config: SyncConfig = serde_yaml::from_str(yaml).expect("test manifest must parse");
    config.validate().expect("test manifest must validate");
    config
}

/// Forge stub with a programmable PR-creation failure mode.
#[derive(Default)]
pub struct MockForge {
    files: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    prs: Mutex<Vec<PullRequest>>,
    next_pr: AtomicU64,
    /// Fail the next create_pr with the head-invalid validation error.
    pub fail_next_create: AtomicBool,
    /// When recovering, pretend an open PR already rides the rejected head.
    pub adopt_rejected_head: AtomicBool,
    /// Fail every create_pr with an auth error.
    pub always_fail_create: AtomicBool,
    last_create_head: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockForge {
    pub fn new() -> Self {
        Self {
            next_pr: AtomicU64::new(1),
            ..Self::default()
        }
    }

    /// Seed the file table of one repo.
    pub fn with_files(self, repo: &str, files: &[(&str, &[u8])]) -> Self {
        {
            let mut table = self.files.lock().unwrap();
            let entry = table.entry(repo.to_string()).or_default();
            for (path, content) in files {
                entry.insert(path.to_string(), content.to_vec());
            }
        }
        self
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    /// Number of recorded calls whose name starts with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn open_prs(&self) -> Vec<PullRequest> {
        self.prs.lock().unwrap().iter().filter(|pr| pr.open).cloned().collect()
    }
}

impl ForgeClient for MockForge {
    fn get_commit(
        &self,
        _token: &CancelToken,
        repo: &str,
        _reference: &str,
    ) -> Result<CommitInfo, ForgeError> {
        self.record(format!("get_commit:{repo}"));
        Ok(CommitInfo {
            sha: format!("head-of-{repo}"),
        })
    }

    fn get_git_tree(
        &self,
        _token: &CancelToken,
        repo: &str,
        sha: &str,
        _recursive: bool,
    ) -> Result<GitTree, ForgeError> {
        self.record(format!("get_git_tree:{repo}"));
        let table = self.files.lock().unwrap();
        let entries = table
            .get(repo)
            .map(|files| {
                files
                    .iter()
                    .map(|(path, content)| TreeEntry {
                        path: path.clone(),
                        kind: TreeEntryKind::Blob,
                        sha: format!("blob-{path}"),
                        size: Some(content.len() as u64),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(GitTree {
            sha: sha.to_string(),
            entries,
            truncated: false,
        })
    }

    fn get_file(
        &self,
        _token: &CancelToken,
        repo: &str,
        path: &str,
        _reference: &str,
    ) -> Result<Vec<u8>, ForgeError> {
        self.record(format!("get_file:{repo}:{path}"));
        let table = self.files.lock().unwrap();
        table
            .get(repo)
            .and_then(|files| files.get(path))
            .cloned()
            .ok_or_else(|| ForgeError::NotFound {
                repo: repo.to_string(),
                what: format!("file {path}"),
            })
    }

    fn list_prs(
        &self,
        _token: &CancelToken,
        repo: &str,
        _filter: PrFilter,
    ) -> Result<Vec<PullRequest>, ForgeError> {
        self.record(format!("list_prs:{repo}"));
        let mut prs = self.open_prs();
        if self.adopt_rejected_head.load(Ordering::SeqCst)
            && let Some(head) = self.last_create_head.lock().unwrap().clone()
        {
            prs.push(PullRequest {
                number: 7,
                title: "Sync files".to_string(),
                body: String::new(),
                head_ref: head,
                base_ref: "main".to_string(),
                open: true,
            });
        }
        Ok(prs)
    }

    fn create_pr(
        &self,
        _token: &CancelToken,
        repo: &str,
        pr: &NewPullRequest,
    ) -> Result<PullRequest, ForgeError> {
        self.record(format!("create_pr:{repo}"));
        *self.last_create_head.lock().unwrap() = Some(pr.head.clone());

        if self.always_fail_create.load(Ordering::SeqCst) {
            return Err(ForgeError::Auth {
                message: "bad credentials".to_string(),
            });
        }
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(ForgeError::Validation {
                message: "Validation Failed: field head is invalid".to_string(),
            });
        }

        let created = PullRequest {
            number: self.next_pr.fetch_add(1, Ordering::SeqCst),
            title: pr.title.clone(),
            body: pr.body.clone(),
            head_ref: pr.head.clone(),
            base_ref: pr.base.clone(),
            open: true,
        };
        self.prs.lock().unwrap().push(created.clone());
        Ok(created)
    }

    fn update_pr(
        &self,
        _token: &CancelToken,
        repo: &str,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<(), ForgeError> {
        self.record(format!("update_pr:{repo}:{number}"));
        let mut prs = self.prs.lock().unwrap();
        if let Some(pr) = prs.iter_mut().find(|pr| pr.number == number) {
            pr.title = title.to_string();
            pr.body = body.to_string();
        }
        Ok(())
    }

    fn add_labels(
        &self,
        _token: &CancelToken,
        repo: &str,
        number: u64,
        labels: &[String],
    ) -> Result<(), ForgeError> {
        self.record(format!("add_labels:{repo}:{number}:{}", labels.join(",")));
        Ok(())
    }

    fn delete_branch(
        &self,
        _token: &CancelToken,
        repo: &str,
        branch: &str,
    ) -> Result<(), ForgeError> {
        self.record(format!("delete_branch:{repo}:{branch}"));
        Ok(())
    }

    fn list_branches(&self, _token: &CancelToken, repo: &str) -> Result<Vec<String>, ForgeError> {
        self.record(format!("list_branches:{repo}"));
        Ok(vec!["main".to_string()])
    }

    fn current_user(&self, _token: &CancelToken) -> Result<String, ForgeError> {
        Ok("repocast-bot".to_string())
    }
}

/// Git stub that clones by copying fixture directories.
#[derive(Default)]
pub struct MockGit {
    fixtures: HashMap<String, PathBuf>,
    calls: Mutex<Vec<String>>,
    pub fail_push: AtomicBool,
}

impl MockGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the directory a repo slug "clones" from.
    pub fn with_fixture(mut self, repo: &str, dir: &Path) -> Self {
        self.fixtures.insert(repo.to_string(), dir.to_path_buf());
        self
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn pushed_branches(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| call.strip_prefix("push:").map(|b| b.to_string()))
            .collect()
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

impl GitClient for MockGit {
    fn clone_repo(&self, repo: &str, reference: &str, dest: &Path) -> Result<(), GitError> {
        self.record(format!("clone:{repo}@{reference}"));
        match self.fixtures.get(repo) {
            Some(fixture) => {
                copy_dir(fixture, dest).map_err(|e| GitError::CommandFailed(e.to_string()))
            }
            None => std::fs::create_dir_all(dest)
                .map_err(|e| GitError::CommandFailed(e.to_string())),
        }
    }

    fn create_branch(&self, _dir: &Path, branch: &str) -> Result<(), GitError> {
        self.record(format!("create_branch:{branch}"));
        Ok(())
    }

    fn checkout(&self, _dir: &Path, reference: &str) -> Result<(), GitError> {
        self.record(format!("checkout:{reference}"));
        Ok(())
    }

    fn add_all(&self, _dir: &Path) -> Result<(), GitError> {
        self.record("add_all");
        Ok(())
    }

    fn commit(&self, _dir: &Path, _message: &str) -> Result<(), GitError> {
        self.record("commit");
        Ok(())
    }

    fn push(&self, _dir: &Path, branch: &str, _force: bool) -> Result<(), GitError> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(GitError::CommandFailed("push rejected".to_string()));
        }
        self.record(format!("push:{branch}"));
        Ok(())
    }

    fn delete_remote_branch(&self, _dir: &Path, branch: &str) -> Result<(), GitError> {
        self.record(format!("delete_remote_branch:{branch}"));
        Ok(())
    }

    fn head_sha(&self, _dir: &Path) -> Result<String, GitError> {
        Ok("s1nc3d00".to_string())
    }

    fn changed_files(&self, _dir: &Path) -> Result<Vec<String>, GitError> {
        Ok(Vec::new())
    }

    fn diff(&self, _dir: &Path) -> Result<String, GitError> {
        Ok(String::new())
    }

    fn list_tags(&self, _repo: &str) -> Result<Vec<String>, GitError> {
        Ok(Vec::new())
    }

    fn default_branch(&self, _dir: &Path) -> Result<String, GitError> {
        Ok("main".to_string())
    }
}

/// Discoverer returning a pre-built snapshot.
pub struct StaticDiscoverer {
    state: CurrentState,
}

impl StaticDiscoverer {
    pub fn new(state: CurrentState) -> Self {
        Self { state }
    }
}

impl StateDiscoverer for StaticDiscoverer {
    fn discover(
        &self,
        _token: &CancelToken,
        _config: &SyncConfig,
    ) -> Result<CurrentState, DiscoveryError> {
        Ok(self.state.clone())
    }
}

/// Snapshot builder used by most scenarios.
pub fn fleet_state(
    sources: &[(&str, &str)],
    targets: &[(&str, SyncStatus)],
) -> CurrentState {
    let mut state = CurrentState::default();
    for (repo, commit) in sources {
        state.sources.insert(
            repo.to_string(),
            SourceState {
                repo: repo.to_string(),
                branch: "main".to_string(),
                latest_commit: commit.to_string(),
            },
        );
    }
    for (repo, status) in targets {
        state.targets.insert(
            repo.to_string(),
            TargetState {
                repo: repo.to_string(),
                last_sync_commit: None,
                status: *status,
                open_prs: Vec::new(),
            },
        );
    }
    state
}

/// Write a fixture tree: `files` are `(relative path, content)` pairs.
pub fn write_fixture(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }
}

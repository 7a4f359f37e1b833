//! Batched repository-tree lookups.
//!
//! Checking whether a hundred destination paths exist in a target would cost
//! a hundred forge calls done naively. The tree client instead fetches the
//! full recursive tree once per `(repo, ref)`, indexes it, and answers every
//! existence query locally. Trees are cached with a TTL and fetched under the
//! shared retry policy, which is the only place rate-limit backoff lives.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::forge::{ForgeClient, ForgeError, TreeEntry, TreeEntryKind};
use crate::retry::{RetryCounters, RetryPolicy};

/// Indexed snapshot of a repository tree at one commit.
#[derive(Debug, Clone)]
pub struct TreeMap {
    pub sha: String,
    pub truncated: bool,
    pub fetched_at: Instant,
    files: HashMap<String, TreeEntry>,
    directories: HashSet<String>,
}

impl TreeMap {
    fn from_entries(sha: String, truncated: bool, entries: Vec<TreeEntry>) -> Self {
        let mut files = HashMap::new();
        let mut directories = HashSet::new();
        // The root is always present, even for an empty repository.
        directories.insert(String::new());

        for entry in entries {
            let path = normalize(&entry.path).to_string();
            match entry.kind {
                TreeEntryKind::Tree => {
                    directories.insert(path);
                }
                TreeEntryKind::Blob => {
                    // Every ancestor of a blob is implicitly a directory,
                    // even when the listing omits the tree node.
                    let mut parent = path.as_str();
                    while let Some(idx) = parent.rfind('/') {
                        parent = &parent[..idx];
                        directories.insert(parent.to_string());
                    }
                    files.insert(path, entry);
                }
            }
        }

        Self {
            sha,
            truncated,
            fetched_at: Instant::now(),
            files,
            directories,
        }
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.contains_key(normalize(path))
    }

    pub fn has_directory(&self, path: &str) -> bool {
        let path = normalize(path);
        path.is_empty() || self.directories.contains(path)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// All file paths underneath `dir`, at any depth.
    pub fn files_under(&self, dir: &str) -> Vec<String> {
        let dir = normalize(dir);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let mut paths: Vec<String> = self
            .files
            .keys()
            .filter(|path| dir.is_empty() || path.starts_with(&prefix))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Direct child files of `dir` (no recursion into subdirectories).
    pub fn files_in_directory(&self, dir: &str) -> Vec<String> {
        let dir = normalize(dir);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let mut paths: Vec<String> = self
            .files
            .keys()
            .filter(|path| {
                let rest = match path.strip_prefix(&prefix) {
                    Some(rest) if !prefix.is_empty() => rest,
                    _ if prefix.is_empty() => path,
                    _ => return false,
                };
                !rest.contains('/')
            })
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Counter snapshot for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub tree_fetches: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retries: u64,
    pub rate_limits: u64,
    /// Exponential moving average of fetched tree node counts.
    pub avg_tree_size: u64,
}

struct CachedTree {
    tree: Arc<TreeMap>,
    fetched_at: Instant,
}

/// Caching, retrying wrapper over the forge's tree API.
pub struct TreeClient {
    forge: Arc<dyn ForgeClient>,
    ttl: Duration,
    policy: RetryPolicy,
    cache: Mutex<HashMap<(String, String), CachedTree>>,
    counters: RetryCounters,
    tree_fetches: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    avg_tree_size: AtomicU64,
}

impl TreeClient {
    pub fn new(forge: Arc<dyn ForgeClient>, ttl: Duration) -> Self {
        Self::with_policy(forge, ttl, RetryPolicy::default())
    }

    pub fn with_policy(forge: Arc<dyn ForgeClient>, ttl: Duration, policy: RetryPolicy) -> Self {
        Self {
            forge,
            ttl,
            policy,
            cache: Mutex::new(HashMap::new()),
            counters: RetryCounters::default(),
            tree_fetches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            avg_tree_size: AtomicU64::new(0),
        }
    }

    /// Fetch (or reuse) the indexed tree for `(repo, reference)`.
    pub fn get_tree(
        &self,
        token: &CancelToken,
        repo: &str,
        reference: &str,
    ) -> Result<Arc<TreeMap>, ForgeError> {
        if token.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }

        let key = (repo.to_string(), reference.to_string());
        {
            let cache = self.cache.lock().expect("tree cache mutex poisoned");
            if let Some(cached) = cache.get(&key)
                && cached.fetched_at.elapsed() < self.ttl
            {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&cached.tree));
            }
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let seed = format!("tree:{repo}@{reference}");
        let tree = self.policy.run(token, &seed, &self.counters, || {
            let commit = self.forge.get_commit(token, repo, reference)?;
            self.forge.get_git_tree(token, repo, &commit.sha, true)
        })?;
        self.tree_fetches.fetch_add(1, Ordering::Relaxed);

        if tree.truncated {
            log::warn!(
                "tree listing for {repo}@{reference} was truncated; \
                 existence checks may report false negatives"
            );
        }

        let node_count = tree.entries.len() as u64;
        let old = self.avg_tree_size.load(Ordering::Relaxed);
        let ema = if old == 0 {
            node_count
        } else {
            (old * 9 + node_count) / 10
        };
        self.avg_tree_size.store(ema, Ordering::Relaxed);

        let map = Arc::new(TreeMap::from_entries(tree.sha, tree.truncated, tree.entries));
        let mut cache = self.cache.lock().expect("tree cache mutex poisoned");
        cache.insert(
            key,
            CachedTree {
                tree: Arc::clone(&map),
                fetched_at: Instant::now(),
            },
        );
        Ok(map)
    }

    /// Existence of many files answered from a single tree fetch.
    pub fn batch_check_files(
        &self,
        token: &CancelToken,
        repo: &str,
        reference: &str,
        paths: &[String],
    ) -> Result<HashMap<String, bool>, ForgeError> {
        let tree = self.get_tree(token, repo, reference)?;
        Ok(paths
            .iter()
            .map(|path| (path.clone(), tree.has_file(path)))
            .collect())
    }

    pub fn batch_check_directories(
        &self,
        token: &CancelToken,
        repo: &str,
        reference: &str,
        paths: &[String],
    ) -> Result<HashMap<String, bool>, ForgeError> {
        let tree = self.get_tree(token, repo, reference)?;
        Ok(paths
            .iter()
            .map(|path| (path.clone(), tree.has_directory(path)))
            .collect())
    }

    pub fn files_in_directory(
        &self,
        token: &CancelToken,
        repo: &str,
        reference: &str,
        dir: &str,
    ) -> Result<Vec<String>, ForgeError> {
        let tree = self.get_tree(token, repo, reference)?;
        Ok(tree.files_in_directory(dir))
    }

    pub fn invalidate(&self, repo: &str, reference: &str) {
        let mut cache = self.cache.lock().expect("tree cache mutex poisoned");
        cache.remove(&(repo.to_string(), reference.to_string()));
    }

    pub fn stats(&self) -> TreeStats {
        TreeStats {
            tree_fetches: self.tree_fetches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            retries: self.counters.retries(),
            rate_limits: self.counters.rate_limits(),
            avg_tree_size: self.avg_tree_size.load(Ordering::Relaxed),
        }
    }
}

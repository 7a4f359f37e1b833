//! Module-aware source resolution.
//!
//! A directory mapping may pin its source to a released version instead of
//! the branch head. The resolver matches the configured semver constraint
//! against the source repo's tags (cached with a TTL — tag listing is a
//! remote call) and clones the winning tag into a temporary checkout that is
//! removed when the guard drops. Resolution failures are non-fatal: the
//! mapping falls back to the task's HEAD checkout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use semver::{Version, VersionReq};
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::config::ModuleSpec;
use crate::git::GitClient;

/// Temporary tag checkout; the directory is deleted when this drops.
pub struct ModuleCheckout {
    pub tag: String,
    pub root: PathBuf,
    _dir: TempDir,
}

pub struct ModuleResolver {
    git: Arc<dyn GitClient>,
    ttl: Duration,
    tags: Mutex<HashMap<String, (Vec<String>, Instant)>>,
}

impl ModuleResolver {
    pub fn new(git: Arc<dyn GitClient>, ttl: Duration) -> Self {
        Self {
            git,
            ttl,
            tags: Mutex::new(HashMap::new()),
        }
    }

    fn tags_for(&self, repo: &str) -> Option<Vec<String>> {
        {
            let cache = self.tags.lock().expect("tag cache mutex poisoned");
            if let Some((tags, fetched_at)) = cache.get(repo)
                && fetched_at.elapsed() < self.ttl
            {
                return Some(tags.clone());
            }
        }

        match self.git.list_tags(repo) {
            Ok(tags) => {
                let mut cache = self.tags.lock().expect("tag cache mutex poisoned");
                cache.insert(repo.to_string(), (tags.clone(), Instant::now()));
                Some(tags)
            }
            Err(e) => {
                log::warn!("failed to list tags for {repo}: {e}");
                None
            }
        }
    }

    /// Resolve a constraint (`^1.2`, `~0.4.1`, `>=1, <2`, `latest`) to the
    /// best matching tag name, or `None` when nothing matches.
    pub fn resolve_version(&self, repo: &str, constraint: &str) -> Option<String> {
        let tags = self.tags_for(repo)?;

        // Pair each tag with its parsed version, tolerating a leading `v`.
        let mut versions: Vec<(Version, String)> = tags
            .into_iter()
            .filter_map(|tag| {
                let bare = tag.strip_prefix('v').unwrap_or(&tag);
                Version::parse(bare).ok().map(|v| (v, tag))
            })
            .collect();
        versions.sort_by(|a, b| b.0.cmp(&a.0));

        if constraint.eq_ignore_ascii_case("latest") {
            return versions.into_iter().next().map(|(_, tag)| tag);
        }

        let req = match VersionReq::parse(constraint) {
            Ok(req) => req,
            Err(e) => {
                log::warn!("unparseable version constraint {constraint:?}: {e}");
                return None;
            }
        };
        versions
            .into_iter()
            .find(|(version, _)| req.matches(version))
            .map(|(_, tag)| tag)
    }

    /// Resolve and clone the matching tag. Any failure logs and returns
    /// `None`, which callers treat as "use HEAD".
    pub fn checkout(
        &self,
        token: &CancelToken,
        repo: &str,
        module: &ModuleSpec,
    ) -> Option<ModuleCheckout> {
        if token.is_cancelled() || !module.check_tags {
            return None;
        }

        let tag = match self.resolve_version(repo, &module.version) {
            Some(tag) => tag,
            None => {
                log::warn!(
                    "no tag of {repo} satisfies {:?}; falling back to HEAD",
                    module.version
                );
                return None;
            }
        };

        let dir = match TempDir::with_prefix("repocast-module-") {
            Ok(dir) => dir,
            Err(e) => {
                log::warn!("failed to create module checkout dir: {e}");
                return None;
            }
        };
        let root = dir.path().join("module");

        match self.git.clone_repo(repo, &tag, &root) {
            Ok(()) => {
                log::debug!("resolved {repo} {:?} -> {tag}", module.version);
                Some(ModuleCheckout {
                    tag,
                    root,
                    _dir: dir,
                })
            }
            Err(e) => {
                log::warn!("failed to clone {repo}@{tag}: {e}; falling back to HEAD");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitError;
    use rstest::rstest;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TagGit {
        tags: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl TagGit {
        fn new(tags: Vec<&'static str>) -> Self {
            Self {
                tags,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl GitClient for TagGit {
        fn clone_repo(&self, _r: &str, _g: &str, dest: &Path) -> Result<(), GitError> {
            std::fs::create_dir_all(dest)
                .map_err(|e| GitError::CommandFailed(e.to_string()))
        }

        fn create_branch(&self, _d: &Path, _b: &str) -> Result<(), GitError> {
            Ok(())
        }

        fn checkout(&self, _d: &Path, _r: &str) -> Result<(), GitError> {
            Ok(())
        }

        fn add_all(&self, _d: &Path) -> Result<(), GitError> {
            Ok(())
        }

        fn commit(&self, _d: &Path, _m: &str) -> Result<(), GitError> {
            Ok(())
        }

        fn push(&self, _d: &Path, _b: &str, _f: bool) -> Result<(), GitError> {
            Ok(())
        }

        fn delete_remote_branch(&self, _d: &Path, _b: &str) -> Result<(), GitError> {
            Ok(())
        }

        fn head_sha(&self, _d: &Path) -> Result<String, GitError> {
            Ok("sha".into())
        }

        fn changed_files(&self, _d: &Path) -> Result<Vec<String>, GitError> {
            Ok(Vec::new())
        }

        fn diff(&self, _d: &Path) -> Result<String, GitError> {
            Ok(String::new())
        }

        fn list_tags(&self, _repo: &str) -> Result<Vec<String>, GitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.tags.iter().map(|t| t.to_string()).collect())
        }

        fn default_branch(&self, _d: &Path) -> Result<String, GitError> {
            Ok("main".into())
        }
    }

    fn resolver(tags: Vec<&'static str>) -> ModuleResolver {
        ModuleResolver::new(Arc::new(TagGit::new(tags)), Duration::from_secs(60))
    }

    #[rstest]
    #[case("latest", Some("v2.1.0"))]
    #[case("^1.0", Some("v1.4.2"))]
    #[case("~1.3", Some("v1.3.9"))]
    #[case(">=1, <2", Some("v1.4.2"))]
    #[case("^3", None)]
    fn test_resolve_constraints(#[case] constraint: &str, #[case] expected: Option<&str>) {
        let r = resolver(vec!["v1.3.9", "v1.4.2", "v2.1.0", "v1.0.0", "not-a-version"]);
        assert_eq!(
            r.resolve_version("org/t", constraint).as_deref(),
            expected
        );
    }

    #[test]
    fn test_tags_without_v_prefix() {
        let r = resolver(vec!["0.4.1", "0.4.7", "0.5.0"]);
        assert_eq!(r.resolve_version("org/t", "~0.4").as_deref(), Some("0.4.7"));
    }

    #[test]
    fn test_tag_cache_avoids_repeat_listing() {
        let git = Arc::new(TagGit::new(vec!["v1.0.0"]));
        let r = ModuleResolver::new(Arc::clone(&git) as Arc<dyn GitClient>, Duration::from_secs(60));

        r.resolve_version("org/t", "latest");
        r.resolve_version("org/t", "latest");
        assert_eq!(git.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_checkout_resolves_and_clones() {
        let r = resolver(vec!["v1.2.3"]);
        let module = ModuleSpec {
            kind: None,
            version: "^1".into(),
            check_tags: true,
            update_refs: false,
        };
        let checkout = r.checkout(&CancelToken::new(), "org/t", &module).unwrap();
        assert_eq!(checkout.tag, "v1.2.3");
        assert!(checkout.root.exists());
    }

    #[test]
    fn test_checkout_falls_back_when_unresolvable() {
        let r = resolver(vec!["v1.0.0"]);
        let module = ModuleSpec {
            kind: None,
            version: "^9".into(),
            check_tags: true,
            update_refs: false,
        };
        assert!(r.checkout(&CancelToken::new(), "org/t", &module).is_none());
    }

    #[test]
    fn test_check_tags_disabled_skips_resolution() {
        let git = Arc::new(TagGit::new(vec!["v1.0.0"]));
        let r = ModuleResolver::new(Arc::clone(&git) as Arc<dyn GitClient>, Duration::from_secs(60));
        let module = ModuleSpec {
            kind: None,
            version: "latest".into(),
            check_tags: false,
            update_refs: false,
        };
        assert!(r.checkout(&CancelToken::new(), "org/t", &module).is_none());
        assert_eq!(git.calls.load(Ordering::SeqCst), 0);
    }
}

//! Git operations for the sync pipeline.
//!
//! All repository manipulation goes through [`GitClient`], so tests can drop
//! in an in-memory fake. The shipped [`CliGit`] shells out to the user's git
//! binary and returns stdout, surfacing stderr verbatim on failure.

use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug)]
pub enum GitError {
    CommandFailed(String),
    ParseError(String),
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::CommandFailed(msg) => write!(f, "{msg}"),
            GitError::ParseError(msg) => write!(f, "git output parse error: {msg}"),
        }
    }
}

impl std::error::Error for GitError {}

/// Operations the per-target pipeline needs from git.
pub trait GitClient: Send + Sync {
    /// Clone `repo` (an `owner/name` slug) at `reference` into `dest`.
    fn clone_repo(&self, repo: &str, reference: &str, dest: &Path) -> Result<(), GitError>;

    /// Create and check out a new branch.
    fn create_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError>;

    fn checkout(&self, dir: &Path, reference: &str) -> Result<(), GitError>;

    fn add_all(&self, dir: &Path) -> Result<(), GitError>;

    fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError>;

    fn push(&self, dir: &Path, branch: &str, force: bool) -> Result<(), GitError>;

    fn delete_remote_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError>;

    fn head_sha(&self, dir: &Path) -> Result<String, GitError>;

    fn changed_files(&self, dir: &Path) -> Result<Vec<String>, GitError>;

    fn diff(&self, dir: &Path) -> Result<String, GitError>;

    /// Tags of a remote repo, most useful for module version resolution.
    fn list_tags(&self, repo: &str) -> Result<Vec<String>, GitError>;

    fn default_branch(&self, dir: &Path) -> Result<String, GitError>;
}

/// Subprocess-backed [`GitClient`].
#[derive(Debug, Clone)]
pub struct CliGit {
    /// Base URL repos are cloned from; slugs are appended as `{base}/{slug}.git`.
    base_url: String,
}

impl Default for CliGit {
    fn default() -> Self {
        Self {
            base_url: "https://github.com".to_string(),
        }
    }
}

impl CliGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn remote_url(&self, repo: &str) -> String {
        format!("{}/{}.git", self.base_url.trim_end_matches('/'), repo)
    }

    /// Run a git command in `dir` and return its stdout.
    fn run_command(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        cmd.current_dir(dir);
        log::debug!("$ git {} (in {})", args.join(" "), dir.display());

        let output = cmd
            .output()
            .map_err(|e| GitError::CommandFailed(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl GitClient for CliGit {
    fn clone_repo(&self, repo: &str, reference: &str, dest: &Path) -> Result<(), GitError> {
        let url = self.remote_url(repo);
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let dest_str = dest.to_string_lossy();

        // Branch names can be cloned shallowly; bare SHAs need a full clone
        // followed by a detached checkout.
        let shallow = self.run_command(
            parent,
            &[
                "clone",
                "--depth",
                "1",
                "--branch",
                reference,
                &url,
                &dest_str,
            ],
        );
        match shallow {
            Ok(_) => Ok(()),
            Err(_) => {
                self.run_command(parent, &["clone", &url, &dest_str])?;
                self.checkout(dest, reference)
            }
        }
    }

    fn create_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        self.run_command(dir, &["checkout", "-b", branch])?;
        Ok(())
    }

    fn checkout(&self, dir: &Path, reference: &str) -> Result<(), GitError> {
        self.run_command(dir, &["checkout", reference])?;
        Ok(())
    }

    fn add_all(&self, dir: &Path) -> Result<(), GitError> {
        self.run_command(dir, &["add", "--all"])?;
        Ok(())
    }

    fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.run_command(dir, &["commit", "--message", message])?;
        Ok(())
    }

    fn push(&self, dir: &Path, branch: &str, force: bool) -> Result<(), GitError> {
        let refspec = format!("{branch}:{branch}");
        if force {
            self.run_command(dir, &["push", "--force", "origin", &refspec])?;
        } else {
            self.run_command(dir, &["push", "origin", &refspec])?;
        }
        Ok(())
    }

    fn delete_remote_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        self.run_command(dir, &["push", "origin", "--delete", branch])?;
        Ok(())
    }

    fn head_sha(&self, dir: &Path) -> Result<String, GitError> {
        let stdout = self.run_command(dir, &["rev-parse", "HEAD"])?;
        let sha = stdout.trim();
        if sha.is_empty() {
            return Err(GitError::ParseError("empty rev-parse output".to_string()));
        }
        Ok(sha.to_string())
    }

    fn changed_files(&self, dir: &Path) -> Result<Vec<String>, GitError> {
        let stdout = self.run_command(dir, &["status", "--porcelain"])?;
        Ok(parse_porcelain_status(&stdout))
    }

    fn diff(&self, dir: &Path) -> Result<String, GitError> {
        self.run_command(dir, &["diff", "HEAD"])
    }

    fn list_tags(&self, repo: &str) -> Result<Vec<String>, GitError> {
        let url = self.remote_url(repo);
        let stdout = self.run_command(Path::new("."), &["ls-remote", "--tags", "--refs", &url])?;
        Ok(parse_ls_remote_tags(&stdout))
    }

    fn default_branch(&self, dir: &Path) -> Result<String, GitError> {
        let stdout = self.run_command(dir, &["rev-parse", "--abbrev-ref", "origin/HEAD"])?;
        let trimmed = stdout.trim();
        let branch = trimmed.strip_prefix("origin/").unwrap_or(trimmed);
        if branch.is_empty() {
            return Err(GitError::ParseError(
                "empty branch name from origin/HEAD".to_string(),
            ));
        }
        Ok(branch.to_string())
    }
}

fn parse_porcelain_status(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            if line.len() < 4 {
                return None;
            }
            // XY <path>; renames are "XY old -> new".
            let path = &line[3..];
            let path = path.split(" -> ").last().unwrap_or(path);
            Some(path.trim().to_string())
        })
        .collect()
}

fn parse_ls_remote_tags(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (_sha, reference) = line.split_once('\t')?;
            reference
                .strip_prefix("refs/tags/")
                .map(|tag| tag.to_string())
        })
        .collect()
}

/// Build the working-copy layout for one task: `<root>/source` and
/// `<root>/target` checkouts side by side.
pub fn task_checkout_paths(root: &Path) -> (PathBuf, PathBuf) {
    (root.join("source"), root.join("target"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_porcelain_status() {
        let output = " M src/main.rs\n?? new-file.txt\nR  old.txt -> new.txt\n";
        let files = parse_porcelain_status(output);
        assert_eq!(files, vec!["src/main.rs", "new-file.txt", "new.txt"]);
    }

    #[test]
    fn test_parse_porcelain_status_empty() {
        assert!(parse_porcelain_status("").is_empty());
    }

    #[test]
    fn test_parse_ls_remote_tags() {
        let output = "\
abc123\trefs/tags/v1.0.0\n\
def456\trefs/tags/v1.1.0\n\
0000aa\trefs/heads/main\n";
        let tags = parse_ls_remote_tags(output);
        assert_eq!(tags, vec!["v1.0.0", "v1.1.0"]);
    }

    #[test]
    fn test_remote_url_building() {
        let git = CliGit::with_base_url("https://github.example.com/");
        assert_eq!(
            git.remote_url("org/app"),
            "https://github.example.com/org/app.git"
        );
    }

    #[test]
    fn test_task_checkout_paths() {
        let (source, target) = task_checkout_paths(Path::new("/tmp/task"));
        assert_eq!(source, Path::new("/tmp/task/source"));
        assert_eq!(target, Path::new("/tmp/task/target"));
    }
}

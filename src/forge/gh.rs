//! Forge client backed by the `gh` CLI.
//!
//! Every call is a `gh api` invocation, so authentication, proxies, and
//! enterprise hosts come from the user's existing `gh auth` setup. Responses
//! are parsed from JSON; failures are mapped onto [`ForgeError`] by the HTTP
//! status markers `gh` embeds in stderr.

use std::process::Command;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

use super::{
    CommitInfo, ForgeClient, ForgeError, GitTree, NewPullRequest, PrFilter, PullRequest, TreeEntry,
    TreeEntryKind,
};
use crate::cancel::CancelToken;

/// `gh`-CLI implementation of [`ForgeClient`].
#[derive(Debug, Clone, Default)]
pub struct GhForge {
    /// Optional `GH_HOST` override for enterprise installs.
    host: Option<String>,
}

impl GhForge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
        }
    }

    fn run(&self, token: &CancelToken, args: &[&str]) -> Result<String, ForgeError> {
        if token.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }

        let mut cmd = Command::new("gh");
        cmd.args(args);
        if let Some(host) = &self.host {
            cmd.env("GH_HOST", host);
        }
        log::debug!("$ gh {}", args.join(" "));

        let output = cmd.output().map_err(|e| ForgeError::CommandFailed {
            message: format!("failed to run gh: {e}"),
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(map_gh_error(&stderr))
    }

    fn api_json(&self, token: &CancelToken, args: &[&str]) -> Result<Value, ForgeError> {
        let stdout = self.run(token, args)?;
        serde_json::from_str(&stdout).map_err(|e| ForgeError::CommandFailed {
            message: format!("unparseable gh response: {e}"),
        })
    }
}

/// Map a `gh` stderr line onto a typed error by its HTTP status markers.
fn map_gh_error(stderr: &str) -> ForgeError {
    let lower = stderr.to_lowercase();

    if lower.contains("rate limit") {
        return ForgeError::RateLimited {
            message: stderr.to_string(),
            retry_after: parse_retry_after(&lower),
        };
    }
    if lower.contains("http 404") || lower.contains("not found") {
        return ForgeError::NotFound {
            repo: String::new(),
            what: stderr.to_string(),
        };
    }
    if lower.contains("http 401") || lower.contains("bad credentials") {
        return ForgeError::Auth {
            message: stderr.to_string(),
        };
    }
    if lower.contains("http 422") || lower.contains("validation failed") {
        return ForgeError::Validation {
            message: stderr.to_string(),
        };
    }
    ForgeError::CommandFailed {
        message: stderr.to_string(),
    }
}

fn parse_retry_after(lower: &str) -> Option<Duration> {
    let rest = lower.split("retry-after:").nth(1)?;
    let seconds: u64 = rest.trim().split_whitespace().next()?.parse().ok()?;
    Some(Duration::from_secs(seconds))
}

fn parse_tree(value: &Value) -> Result<GitTree, ForgeError> {
    let sha = value["sha"].as_str().unwrap_or_default().to_string();
    let truncated = value["truncated"].as_bool().unwrap_or(false);
    let entries = value["tree"]
        .as_array()
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|node| {
                    let kind = match node["type"].as_str()? {
                        "blob" => TreeEntryKind::Blob,
                        "tree" => TreeEntryKind::Tree,
                        _ => return None,
                    };
                    Some(TreeEntry {
                        path: node["path"].as_str()?.to_string(),
                        kind,
                        sha: node["sha"].as_str().unwrap_or_default().to_string(),
                        size: node["size"].as_u64(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(GitTree {
        sha,
        entries,
        truncated,
    })
}

fn parse_pr(value: &Value) -> Option<PullRequest> {
    Some(PullRequest {
        number: value["number"].as_u64()?,
        title: value["title"].as_str().unwrap_or_default().to_string(),
        body: value["body"].as_str().unwrap_or_default().to_string(),
        head_ref: value["head"]["ref"].as_str().unwrap_or_default().to_string(),
        base_ref: value["base"]["ref"].as_str().unwrap_or_default().to_string(),
        open: value["state"].as_str() == Some("open"),
    })
}

fn decode_content(value: &Value, repo: &str, path: &str) -> Result<Vec<u8>, ForgeError> {
    let encoding = value["encoding"].as_str().unwrap_or("base64");
    let raw = value["content"].as_str().unwrap_or_default();

    match encoding {
        "base64" => {
            let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
            BASE64.decode(&compact).map_err(|e| ForgeError::CommandFailed {
                message: format!("undecodable content for {repo}:{path}: {e}"),
            })
        }
        "none" | "" => Ok(raw.as_bytes().to_vec()),
        other => Err(ForgeError::CommandFailed {
            message: format!("unsupported content encoding {other:?} for {repo}:{path}"),
        }),
    }
}

impl ForgeClient for GhForge {
    fn get_commit(
        &self,
        token: &CancelToken,
        repo: &str,
        reference: &str,
    ) -> Result<CommitInfo, ForgeError> {
        let endpoint = format!("repos/{repo}/commits/{reference}");
        let value = self.api_json(token, &["api", &endpoint])?;
        let sha = value["sha"]
            .as_str()
            .ok_or_else(|| ForgeError::CommandFailed {
                message: format!("no sha in commit response for {repo}@{reference}"),
            })?
            .to_string();
        Ok(CommitInfo { sha })
    }

    fn get_git_tree(
        &self,
        token: &CancelToken,
        repo: &str,
        sha: &str,
        recursive: bool,
    ) -> Result<GitTree, ForgeError> {
        let endpoint = if recursive {
            format!("repos/{repo}/git/trees/{sha}?recursive=1")
        } else {
            format!("repos/{repo}/git/trees/{sha}")
        };
        let value = self.api_json(token, &["api", &endpoint])?;
        parse_tree(&value)
    }

    fn get_file(
        &self,
        token: &CancelToken,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Vec<u8>, ForgeError> {
        let path = path.trim_start_matches('/');
        let endpoint = format!("repos/{repo}/contents/{path}?ref={reference}");
        let value = match self.api_json(token, &["api", &endpoint]) {
            Ok(value) => value,
            Err(ForgeError::NotFound { .. }) => {
                return Err(ForgeError::NotFound {
                    repo: repo.to_string(),
                    what: format!("file {path}"),
                });
            }
            Err(err) => return Err(err),
        };
        decode_content(&value, repo, path)
    }

    fn list_prs(
        &self,
        token: &CancelToken,
        repo: &str,
        filter: PrFilter,
    ) -> Result<Vec<PullRequest>, ForgeError> {
        let state = match filter {
            PrFilter::Open => "open",
            PrFilter::Closed => "closed",
            PrFilter::All => "all",
        };
        let endpoint = format!("repos/{repo}/pulls?state={state}&per_page=100");
        let value = self.api_json(token, &["api", &endpoint])?;
        Ok(value
            .as_array()
            .map(|prs| prs.iter().filter_map(parse_pr).collect())
            .unwrap_or_default())
    }

    fn create_pr(
        &self,
        token: &CancelToken,
        repo: &str,
        pr: &NewPullRequest,
    ) -> Result<PullRequest, ForgeError> {
        let endpoint = format!("repos/{repo}/pulls");
        let title = format!("title={}", pr.title);
        let body = format!("body={}", pr.body);
        let head = format!("head={}", pr.head);
        let base = format!("base={}", pr.base);
        let value = self.api_json(
            token,
            &[
                "api", &endpoint, "-X", "POST", "-f", &title, "-f", &body, "-f", &head, "-f",
                &base,
            ],
        )?;
        parse_pr(&value).ok_or_else(|| ForgeError::CommandFailed {
            message: format!("unparseable create-pr response for {repo}"),
        })
    }

    fn update_pr(
        &self,
        token: &CancelToken,
        repo: &str,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<(), ForgeError> {
        let endpoint = format!("repos/{repo}/pulls/{number}");
        let title = format!("title={title}");
        let body = format!("body={body}");
        self.run(
            token,
            &[
                "api", &endpoint, "-X", "PATCH", "-f", &title, "-f", &body,
            ],
        )?;
        Ok(())
    }

    fn add_labels(
        &self,
        token: &CancelToken,
        repo: &str,
        number: u64,
        labels: &[String],
    ) -> Result<(), ForgeError> {
        if labels.is_empty() {
            return Ok(());
        }
        let endpoint = format!("repos/{repo}/issues/{number}/labels");
        let mut args: Vec<String> = vec!["api".into(), endpoint, "-X".into(), "POST".into()];
        for label in labels {
            args.push("-f".into());
            args.push(format!("labels[]={label}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(token, &arg_refs)?;
        Ok(())
    }

    fn delete_branch(
        &self,
        token: &CancelToken,
        repo: &str,
        branch: &str,
    ) -> Result<(), ForgeError> {
        let endpoint = format!("repos/{repo}/git/refs/heads/{branch}");
        self.run(token, &["api", "-X", "DELETE", &endpoint])?;
        Ok(())
    }

    fn list_branches(&self, token: &CancelToken, repo: &str) -> Result<Vec<String>, ForgeError> {
        let endpoint = format!("repos/{repo}/branches?per_page=100");
        let stdout = self.run(token, &["api", &endpoint, "--jq", ".[].name"])?;
        Ok(stdout.lines().map(|line| line.to_string()).collect())
    }

    fn current_user(&self, token: &CancelToken) -> Result<String, ForgeError> {
        let stdout = self.run(token, &["api", "user", "--jq", ".login"])?;
        Ok(stdout.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_gh_error_statuses() {
        assert!(matches!(
            map_gh_error("gh: Not Found (HTTP 404)"),
            ForgeError::NotFound { .. }
        ));
        assert!(matches!(
            map_gh_error("HTTP 403: API rate limit exceeded"),
            ForgeError::RateLimited { .. }
        ));
        assert!(matches!(
            map_gh_error("HTTP 401: Bad credentials"),
            ForgeError::Auth { .. }
        ));
        assert!(matches!(
            map_gh_error("HTTP 422: Validation Failed (head is invalid)"),
            ForgeError::Validation { .. }
        ));
        assert!(matches!(
            map_gh_error("something else went wrong"),
            ForgeError::CommandFailed { .. }
        ));
    }

    #[test]
    fn test_retry_after_hint_parsed() {
        let err = map_gh_error("HTTP 429: rate limit, Retry-After: 7");
        match err {
            ForgeError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_tree() {
        let value = json!({
            "sha": "abc",
            "truncated": false,
            "tree": [
                {"path": "README.md", "type": "blob", "sha": "s1", "size": 12},
                {"path": "src", "type": "tree", "sha": "s2"},
                {"path": "weird", "type": "commit", "sha": "s3"}
            ]
        });
        let tree = parse_tree(&value).unwrap();
        assert_eq!(tree.sha, "abc");
        assert!(!tree.truncated);
        assert_eq!(tree.entries.len(), 2);
        assert_eq!(tree.entries[0].kind, TreeEntryKind::Blob);
        assert_eq!(tree.entries[0].size, Some(12));
        assert_eq!(tree.entries[1].kind, TreeEntryKind::Tree);
    }

    #[test]
    fn test_parse_pr_handles_null_body() {
        let value = json!({
            "number": 17,
            "title": "Sync files",
            "body": null,
            "head": {"ref": "chore/sync-files-x"},
            "base": {"ref": "main"},
            "state": "open"
        });
        let pr = parse_pr(&value).unwrap();
        assert_eq!(pr.number, 17);
        assert_eq!(pr.body, "");
        assert!(pr.open);
        assert_eq!(pr.head_ref, "chore/sync-files-x");
    }

    #[test]
    fn test_decode_content_base64_with_newlines() {
        let value = json!({
            "encoding": "base64",
            "content": "aGVs\nbG8g\nd29ybGQ=\n"
        });
        let bytes = decode_content(&value, "o/r", "f").unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn test_decode_content_unsupported_encoding() {
        let value = json!({"encoding": "utf-16", "content": "x"});
        assert!(decode_content(&value, "o/r", "f").is_err());
    }
}

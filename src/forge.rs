//! Forge (code host) client interface.
//!
//! The sync engine never talks HTTP itself; it consumes this trait. The
//! shipped implementation shells out to the `gh` CLI (see [`gh`]), the same
//! way CI status detection does, which delegates authentication and host
//! selection to tooling the user already has configured.

pub mod gh;

use std::time::Duration;

use crate::cancel::CancelToken;
use crate::retry::{ErrorClass, Retryable, classify_text};

/// A resolved commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEntryKind {
    Blob,
    Tree,
}

/// One node of a git tree listing.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: String,
    pub kind: TreeEntryKind,
    pub sha: String,
    pub size: Option<u64>,
}

/// A (possibly truncated) recursive tree listing.
#[derive(Debug, Clone)]
pub struct GitTree {
    pub sha: String,
    pub entries: Vec<TreeEntry>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrFilter {
    Open,
    Closed,
    All,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head_ref: String,
    pub base_ref: String,
    pub open: bool,
}

/// Payload for PR creation.
#[derive(Debug, Clone)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

/// Forge failure, classified for the retry layer.
#[derive(Debug)]
pub enum ForgeError {
    /// File, ref, or repo does not exist.
    NotFound { repo: String, what: String },
    /// Rate limit hit; `retry_after` carries the server hint when present.
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    /// PR creation rejected by validation (e.g. stale head branch).
    Validation { message: String },
    /// Authentication or authorization failure.
    Auth { message: String },
    /// Anything else the underlying tool reported.
    CommandFailed { message: String },
    Cancelled,
}

impl std::fmt::Display for ForgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForgeError::NotFound { repo, what } => write!(f, "{what} not found in {repo}"),
            ForgeError::RateLimited { message, .. } => write!(f, "rate limited: {message}"),
            ForgeError::Validation { message } => write!(f, "validation failed: {message}"),
            ForgeError::Auth { message } => write!(f, "authentication failed: {message}"),
            ForgeError::CommandFailed { message } => write!(f, "{message}"),
            ForgeError::Cancelled => write!(f, "forge call cancelled"),
        }
    }
}

impl std::error::Error for ForgeError {}

impl Retryable for ForgeError {
    fn class(&self) -> ErrorClass {
        match self {
            ForgeError::NotFound { .. } => ErrorClass::NotFound,
            ForgeError::RateLimited { .. } => ErrorClass::RateLimited,
            ForgeError::Validation { .. } | ForgeError::Auth { .. } => ErrorClass::Fatal,
            ForgeError::Cancelled => ErrorClass::Cancelled,
            // The CLI flattens transport problems into text; classify by it.
            ForgeError::CommandFailed { message } => classify_text(message),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ForgeError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl ForgeError {
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    /// The "orphan branch" signature: a pushed branch whose PR was closed,
    /// making the forge reject a fresh `create_pr` for the same head.
    pub fn is_invalid_head_branch(&self) -> bool {
        let message = match self {
            ForgeError::Validation { message } => message,
            ForgeError::CommandFailed { message } => message,
            _ => return false,
        };
        let lower = message.to_lowercase();
        lower.contains("head") && (lower.contains("invalid") || lower.contains("not valid"))
    }
}

/// Operations the sync engine needs from a code host.
pub trait ForgeClient: Send + Sync {
    fn get_commit(
        &self,
        token: &CancelToken,
        repo: &str,
        reference: &str,
    ) -> Result<CommitInfo, ForgeError>;

    fn get_git_tree(
        &self,
        token: &CancelToken,
        repo: &str,
        sha: &str,
        recursive: bool,
    ) -> Result<GitTree, ForgeError>;

    fn get_file(
        &self,
        token: &CancelToken,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Vec<u8>, ForgeError>;

    fn list_prs(
        &self,
        token: &CancelToken,
        repo: &str,
        filter: PrFilter,
    ) -> Result<Vec<PullRequest>, ForgeError>;

    fn create_pr(
        &self,
        token: &CancelToken,
        repo: &str,
        pr: &NewPullRequest,
    ) -> Result<PullRequest, ForgeError>;

    fn update_pr(
        &self,
        token: &CancelToken,
        repo: &str,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<(), ForgeError>;

    fn add_labels(
        &self,
        token: &CancelToken,
        repo: &str,
        number: u64,
        labels: &[String],
    ) -> Result<(), ForgeError>;

    fn delete_branch(&self, token: &CancelToken, repo: &str, branch: &str)
    -> Result<(), ForgeError>;

    fn list_branches(&self, token: &CancelToken, repo: &str) -> Result<Vec<String>, ForgeError>;

    fn current_user(&self, token: &CancelToken) -> Result<String, ForgeError>;
}

//! Observed forge-side state and the PR metadata contract.
//!
//! Every sync PR carries a machine-readable YAML block in its body. That
//! block is the persistence layer of the whole tool: the next run reads it
//! back to learn which source commit a target last received, without any
//! database or local state.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::forge::{ForgeClient, ForgeError, PrFilter, PullRequest};

/// Observed sync status of one target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum SyncStatus {
    UpToDate,
    Behind,
    Pending,
    Conflict,
    Unknown,
}

/// Resolved source head at discovery time.
#[derive(Debug, Clone)]
pub struct SourceState {
    pub repo: String,
    pub branch: String,
    pub latest_commit: String,
}

/// Everything known about one target repository.
#[derive(Debug, Clone)]
pub struct TargetState {
    pub repo: String,
    pub last_sync_commit: Option<String>,
    pub status: SyncStatus,
    pub open_prs: Vec<PullRequest>,
}

/// Snapshot of the fleet, never mutated by the engine.
#[derive(Debug, Clone, Default)]
pub struct CurrentState {
    pub sources: HashMap<String, SourceState>,
    pub targets: HashMap<String, TargetState>,
}

#[derive(Debug)]
pub struct DiscoveryError(pub ForgeError);

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "state discovery failed: {}", self.0)
    }
}

impl std::error::Error for DiscoveryError {}

/// Enumerates current state for every configured source and target.
pub trait StateDiscoverer: Send + Sync {
    fn discover(
        &self,
        token: &CancelToken,
        config: &SyncConfig,
    ) -> Result<CurrentState, DiscoveryError>;
}

const METADATA_OPEN: &str = "<!-- repocast-metadata";
const METADATA_CLOSE: &str = "-->";

static METADATA_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<!-- repocast-metadata\n(.*?)-->").expect("metadata regex must compile")
});

/// Per-directory counts persisted in the PR body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryReport {
    pub path: String,
    pub files_examined: usize,
    pub files_synced: usize,
}

/// The machine-readable YAML block carried in every sync PR body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub source_repo: String,
    pub source_commit: String,
    pub target_repo: String,
    pub sync_commit: String,
    #[serde(default)]
    pub directories: Vec<DirectoryReport>,
}

impl SyncMetadata {
    /// Render the delimited block for embedding in a PR body.
    pub fn render_block(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        format!("{METADATA_OPEN}\n{yaml}{METADATA_CLOSE}")
    }

    /// Extract and parse the block from a PR body, if present.
    pub fn extract(body: &str) -> Option<Self> {
        let captures = METADATA_BLOCK.captures(body)?;
        serde_yaml::from_str(captures.get(1)?.as_str()).ok()
    }
}

/// Discoverer that reads open sync PRs and their metadata blocks.
pub struct PrStateDiscoverer {
    forge: Arc<dyn ForgeClient>,
}

impl PrStateDiscoverer {
    pub fn new(forge: Arc<dyn ForgeClient>) -> Self {
        Self { forge }
    }
}

impl StateDiscoverer for PrStateDiscoverer {
    fn discover(
        &self,
        token: &CancelToken,
        config: &SyncConfig,
    ) -> Result<CurrentState, DiscoveryError> {
        let mut state = CurrentState::default();

        for group in &config.groups {
            if state.sources.contains_key(&group.source.repo) {
                continue;
            }
            let commit = self
                .forge
                .get_commit(token, &group.source.repo, &group.source.branch)
                .map_err(DiscoveryError)?;
            state.sources.insert(
                group.source.repo.clone(),
                SourceState {
                    repo: group.source.repo.clone(),
                    branch: group.source.branch.clone(),
                    latest_commit: commit.sha,
                },
            );
        }

        for group in &config.groups {
            let prefix = group.branch_prefix(&config.settings).to_string();
            let source_head = state
                .sources
                .get(&group.source.repo)
                .map(|s| s.latest_commit.clone())
                .unwrap_or_default();

            for target in &group.targets {
                if state.targets.contains_key(&target.repo) {
                    continue;
                }

                let open_prs: Vec<PullRequest> = self
                    .forge
                    .list_prs(token, &target.repo, PrFilter::Open)
                    .map_err(DiscoveryError)?
                    .into_iter()
                    .filter(|pr| pr.head_ref.starts_with(&prefix))
                    .collect();

                let metadata = open_prs.iter().find_map(|pr| SyncMetadata::extract(&pr.body));
                let last_sync_commit = metadata.as_ref().map(|m| m.source_commit.clone());

                let status = match (&metadata, open_prs.is_empty()) {
                    (_, true) => SyncStatus::Unknown,
                    (Some(m), false) if m.source_commit == source_head => SyncStatus::Pending,
                    (Some(_), false) => SyncStatus::Behind,
                    (None, false) => SyncStatus::Pending,
                };

                state.targets.insert(
                    target.repo.clone(),
                    TargetState {
                        repo: target.repo.clone(),
                        last_sync_commit,
                        status,
                        open_prs,
                    },
                );
            }
        }

        Ok(state)
    }
}

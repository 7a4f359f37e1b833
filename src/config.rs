//! Sync manifest: model, loading, validation.
//!
//! The manifest declares groups of one source repository mapped onto many
//! targets. It is loaded through the `config` crate (YAML or TOML file plus
//! `REPOCAST_*` environment overrides) and validated up front — group ids
//! unique, dependencies forming a DAG, every mapping well-formed — so a run
//! never discovers a bad manifest halfway through a fleet.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum ConfigError {
    Load(config::ConfigError),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Load(e) => write!(f, "failed to load configuration: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Load(e)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    5
}

fn default_worker_count() -> usize {
    10
}

fn default_timeout() -> String {
    "10m".to_string()
}

fn default_branch_prefix() -> String {
    "chore/sync-files-".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_true")]
    pub update_existing_prs: bool,
    #[serde(default)]
    pub automerge: bool,
    #[serde(default)]
    pub automerge_labels: Vec<String>,
    #[serde(default)]
    pub group_filter: Vec<String>,
    #[serde(default)]
    pub skip_groups: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            worker_count: default_worker_count(),
            dry_run: false,
            force: false,
            update_existing_prs: true,
            automerge: false,
            automerge_labels: Vec::new(),
            group_filter: Vec::new(),
            skip_groups: Vec::new(),
            timeout: default_timeout(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

impl Settings {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.timeout)
            .ok_or_else(|| ConfigError::Invalid(format!("unparseable timeout {:?}", self.timeout)))
    }
}

/// The repository files are copied from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

/// Transform switches, merged group -> target -> mapping (most specific
/// flags win, variables overlay).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformSettings {
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub repo_name: bool,
    #[serde(default)]
    pub variables: IndexMap<String, String>,
}

impl TransformSettings {
    pub fn is_noop(&self) -> bool {
        !self.template && !self.repo_name
    }

    /// Overlay `over` onto `base`. `None` layers are transparent.
    pub fn merge(base: Option<&Self>, over: Option<&Self>) -> Option<Self> {
        match (base, over) {
            (None, None) => None,
            (Some(base), None) => Some(base.clone()),
            (None, Some(over)) => Some(over.clone()),
            (Some(base), Some(over)) => {
                let mut variables = base.variables.clone();
                for (key, value) in &over.variables {
                    variables.insert(key.clone(), value.clone());
                }
                Some(Self {
                    template: over.template,
                    repo_name: over.repo_name,
                    variables,
                })
            }
        }
    }
}

/// One file copied (or deleted) on the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMapping {
    #[serde(default)]
    pub src: String,
    pub dest: String,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub transform: Option<TransformSettings>,
}

/// Module-aware source selection for a directory mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Semver constraint (`^1.2`, `~0.4.1`, `>=1, <2`) or `latest`.
    pub version: String,
    #[serde(default = "default_true")]
    pub check_tags: bool,
    #[serde(default)]
    pub update_refs: bool,
}

/// One directory subtree mapped onto the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryMapping {
    #[serde(default)]
    pub src: String,
    pub dest: String,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub include_only: Vec<String>,
    #[serde(default = "default_true")]
    pub include_hidden: bool,
    /// When false, discovered files are flattened into `dest` by base name.
    /// Base-name collisions resolve last-writer-wins.
    #[serde(default = "default_true")]
    pub preserve_structure: bool,
    #[serde(default)]
    pub transform: Option<TransformSettings>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub module: Option<ModuleSpec>,
}

/// One repository receiving files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub repo: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub files: Vec<FileMapping>,
    #[serde(default)]
    pub directories: Vec<DirectoryMapping>,
    #[serde(default)]
    pub transform: Option<TransformSettings>,
}

/// One source mapped onto N targets, with optional ordering constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncGroup {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Tie-break among groups whose dependencies are satisfied; lower runs
    /// first.
    #[serde(default)]
    pub priority: i64,
    pub source: SourceSpec,
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub branch_prefix: Option<String>,
    #[serde(default)]
    pub transform: Option<TransformSettings>,
}

/// The whole manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub groups: Vec<SyncGroup>,
}

impl SyncConfig {
    /// Load a manifest file plus `REPOCAST_*` environment overrides, then
    /// validate it.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let expanded = shellexpand::tilde(path).into_owned();
        let config = Config::builder()
            .add_source(File::from(PathBuf::from(expanded)))
            .add_source(Environment::with_prefix("REPOCAST").separator("__"))
            .build()?;
        let parsed: SyncConfig = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(ConfigError::Invalid("no groups defined".into()));
        }
        if self.settings.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be >= 1".into()));
        }
        if self.settings.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be >= 1".into()));
        }
        self.settings.timeout()?;

        let mut ids = HashSet::new();
        for group in &self.groups {
            if group.id.is_empty() {
                return Err(ConfigError::Invalid("group with empty id".into()));
            }
            if !ids.insert(group.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate group id {:?}",
                    group.id
                )));
            }
            if group.source.repo.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "group {:?} has an empty source repo",
                    group.id
                )));
            }
            for target in &group.targets {
                validate_target(&group.id, target)?;
            }
        }

        for group in &self.groups {
            for dep in &group.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "group {:?} depends on unknown group {:?}",
                        group.id, dep
                    )));
                }
            }
        }

        // Rejecting cycles here means execution_order() cannot fail later.
        self.execution_order()?;
        Ok(())
    }

    /// Topological order of group indexes (Kahn), breaking ties by
    /// (priority, declaration order).
    pub fn execution_order(&self) -> Result<Vec<usize>, ConfigError> {
        let index_of: HashMap<&str, usize> = self
            .groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.id.as_str(), i))
            .collect();

        let mut indegree = vec![0usize; self.groups.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.groups.len()];
        for (i, group) in self.groups.iter().enumerate() {
            for dep in &group.depends_on {
                let d = index_of[dep.as_str()];
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: Vec<usize> = (0..self.groups.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.groups.len());
        let mut queue = VecDeque::new();

        while !ready.is_empty() || !queue.is_empty() {
            ready.sort_by_key(|&i| (self.groups[i].priority, i));
            queue.extend(ready.drain(..));

            let Some(next) = queue.pop_front() else { break };
            order.push(next);
            for &dependent in &dependents[next] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.push(dependent);
                }
            }
        }

        if order.len() != self.groups.len() {
            return Err(ConfigError::Invalid(
                "dependency cycle among groups".into(),
            ));
        }
        Ok(order)
    }

    /// How many groups source into `repo`. Drives the rule that an
    /// up-to-date target is still synced when it receives from multiple
    /// sources.
    pub fn sources_targeting(&self, repo: &str) -> usize {
        self.groups
            .iter()
            .filter(|group| group.targets.iter().any(|t| t.repo == repo))
            .count()
    }

    pub fn group(&self, id: &str) -> Option<&SyncGroup> {
        self.groups.iter().find(|g| g.id == id)
    }
}

impl SyncGroup {
    pub fn branch_prefix<'a>(&'a self, settings: &'a Settings) -> &'a str {
        self.branch_prefix
            .as_deref()
            .unwrap_or(&settings.branch_prefix)
    }
}

fn validate_target(group_id: &str, target: &TargetSpec) -> Result<(), ConfigError> {
    if target.repo.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "group {group_id:?} has a target with an empty repo"
        )));
    }
    if target.files.is_empty() && target.directories.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "target {:?} in group {group_id:?} has no file or directory mappings",
            target.repo
        )));
    }

    for file in &target.files {
        if file.dest.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "file mapping in target {:?} has an empty dest",
                target.repo
            )));
        }
        if !file.delete && file.src.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "file mapping {:?} in target {:?} has no src",
                file.dest, target.repo
            )));
        }
    }

    for dir in &target.directories {
        if dir.dest.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "directory mapping in target {:?} has an empty dest",
                target.repo
            )));
        }
        if !dir.delete && dir.src.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "directory mapping {:?} in target {:?} has no src",
                dir.dest, target.repo
            )));
        }
        for pattern in dir.exclude.iter().chain(dir.include_only.iter()) {
            if pattern.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "empty pattern in directory mapping {:?} of target {:?}",
                    dir.dest, target.repo
                )));
            }
        }
    }
    Ok(())
}

/// Parse `90s`, `10m`, `2h`, `500ms`, or a bare number of seconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(seconds) = input.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let split = input.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = input.split_at(split);
    let value: u64 = number.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

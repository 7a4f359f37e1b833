//! Commit-message and PR-body generation.
//!
//! Generation is pluggable: when an external LLM command is configured it is
//! executed with the prompt on stdin and its trimmed stdout becomes the
//! message; otherwise deterministic templates are used. Generator failures
//! never fail a sync — callers fall back to the templates.

use std::io::Write;
use std::process::{Command, Stdio};

/// What changed in one task, for prompt and template construction.
#[derive(Debug, Clone, Default)]
pub struct ChangeSummary {
    pub source_repo: String,
    pub source_commit: String,
    pub target_repo: String,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub diff: String,
}

impl ChangeSummary {
    pub fn total_files(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

#[derive(Debug)]
pub struct GeneratorError(pub String);

impl std::fmt::Display for GeneratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "generator failed: {}", self.0)
    }
}

impl std::error::Error for GeneratorError {}

pub trait CommitMessageGenerator: Send + Sync {
    fn generate(&self, summary: &ChangeSummary) -> Result<String, GeneratorError>;
}

pub trait PrBodyGenerator: Send + Sync {
    fn generate(&self, summary: &ChangeSummary) -> Result<String, GeneratorError>;
}

/// Deterministic commit message used when no generator is configured or the
/// configured one fails.
pub fn default_commit_message(summary: &ChangeSummary) -> String {
    let short = summary.source_commit.get(..8).unwrap_or(&summary.source_commit);
    format!(
        "chore: sync {} files from {}@{}",
        summary.total_files(),
        summary.source_repo,
        short
    )
}

/// Deterministic PR title.
pub fn default_pr_title(summary: &ChangeSummary) -> String {
    let short = summary.source_commit.get(..8).unwrap_or(&summary.source_commit);
    format!("Sync files from {}@{}", summary.source_repo, short)
}

/// Generator that pipes a prompt into an external command.
///
/// This is the canonical way LLM-backed generation runs here: the command
/// gets the prompt on stdin and must print the message to stdout. Anything
/// on stderr plus a non-zero exit becomes a [`GeneratorError`].
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn execute(&self, prompt: &str) -> Result<String, GeneratorError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        log::debug!("$ {} {}", self.command, self.args.join(" "));

        let mut child = cmd.spawn().map_err(|e| GeneratorError(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .map_err(|e| GeneratorError(e.to_string()))?;
            // stdin drops here, closing the pipe
        }

        let output = child
            .wait_with_output()
            .map_err(|e| GeneratorError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GeneratorError(format!("command failed: {stderr}")));
        }

        let message = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if message.is_empty() {
            return Err(GeneratorError("command returned empty message".into()));
        }

        Ok(message)
    }

    fn commit_prompt(summary: &ChangeSummary) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "Write a concise, conventional git commit message for a template \
             sync. Subject line under 72 characters, no trailing period.\n\n",
        );
        prompt.push_str(&format!(
            "Source: {}@{}\nTarget: {}\n\n",
            summary.source_repo, summary.source_commit, summary.target_repo
        ));
        prompt.push_str("Diff:\n");
        prompt.push_str(&summary.diff);
        prompt
    }

    fn pr_prompt(summary: &ChangeSummary) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "Write a short pull-request description for an automated file \
             sync. Explain what changed and why in plain language.\n\n",
        );
        prompt.push_str(&format!(
            "{} added, {} modified, {} deleted\n\nDiff:\n",
            summary.added.len(),
            summary.modified.len(),
            summary.deleted.len()
        ));
        prompt.push_str(&summary.diff);
        prompt
    }
}

impl CommitMessageGenerator for CommandGenerator {
    fn generate(&self, summary: &ChangeSummary) -> Result<String, GeneratorError> {
        self.execute(&Self::commit_prompt(summary))
    }
}

impl PrBodyGenerator for CommandGenerator {
    fn generate(&self, summary: &ChangeSummary) -> Result<String, GeneratorError> {
        self.execute(&Self::pr_prompt(summary))
    }
}

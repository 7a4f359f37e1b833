//! Path exclusion patterns for directory mappings.
//!
//! Patterns are glob-style (`*` within a component, `**` across components)
//! and compiled once at construction — this code sits in the inner loop of
//! the source-tree walk. Four shapes are recognized:
//!
//! - plain: `*.log` — matched against the file name at any depth
//! - nested: `**/*.out` or `build/cache/*` — matched against the full
//!   relative path
//! - directory: `vendor/` — excludes the directory and its whole subtree
//! - negation: `!important.log` — re-includes a path that an earlier
//!   exclusion removed
//!
//! An optional `include_only` list acts as a positive filter: when non-empty,
//! a file is kept only if it matches at least one include-only pattern,
//! independent of the exclusion result.

use glob::{Pattern, PatternError};

/// Error produced for patterns rejected at construction.
#[derive(Debug)]
pub enum ExclusionError {
    Empty,
    Invalid { pattern: String, source: PatternError },
}

impl std::fmt::Display for ExclusionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExclusionError::Empty => write!(f, "empty exclusion pattern"),
            ExclusionError::Invalid { pattern, source } => {
                write!(f, "invalid pattern {pattern:?}: {source}")
            }
        }
    }
}

impl std::error::Error for ExclusionError {}

#[derive(Debug, Clone)]
struct CompiledPattern {
    raw: String,
    glob: Pattern,
    /// Trailing-slash pattern: matches the directory itself and everything
    /// beneath it.
    directory: bool,
    /// True when the pattern contains a path separator or `**`, in which case
    /// it matches against the full relative path instead of the file name.
    full_path: bool,
}

impl CompiledPattern {
    fn compile(raw: &str) -> Result<Self, ExclusionError> {
        if raw.is_empty() {
            return Err(ExclusionError::Empty);
        }

        let directory = raw.ends_with('/');
        let trimmed = raw.trim_end_matches('/');
        let glob = Pattern::new(trimmed).map_err(|source| ExclusionError::Invalid {
            pattern: raw.to_string(),
            source,
        })?;

        Ok(Self {
            raw: raw.to_string(),
            glob,
            directory,
            full_path: trimmed.contains('/') || trimmed.contains("**"),
        })
    }

    fn matches(&self, path: &str) -> bool {
        if self.directory {
            let dir = self.raw.trim_end_matches('/');
            return path == dir
                || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
                || self.glob.matches(path);
        }
        if self.full_path {
            return self.glob.matches(path);
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        self.glob.matches(name) || self.glob.matches(path)
    }

    /// Whether anything under the directory `dir` could match this pattern.
    /// Used for conservative pruning: comparing the literal prefix of the
    /// pattern (up to its first wildcard) against the directory path. Any
    /// wildcard ambiguity answers `true`.
    fn could_match_under(&self, dir: &str) -> bool {
        if !self.full_path {
            // Name-only patterns can match at any depth.
            return true;
        }
        let literal: String = self
            .raw
            .trim_start_matches('!')
            .chars()
            .take_while(|c| !matches!(c, '*' | '?' | '['))
            .collect();
        let literal = literal.trim_end_matches('/');
        literal.starts_with(dir) || dir.starts_with(literal) || literal.is_empty()
    }
}

/// Precompiled include/exclude decision for one directory mapping.
#[derive(Debug, Clone)]
pub struct ExclusionEngine {
    excludes: Vec<CompiledPattern>,
    negations: Vec<CompiledPattern>,
    include_only: Vec<CompiledPattern>,
}

impl ExclusionEngine {
    /// Compile the pattern lists. Empty patterns are configuration errors.
    pub fn new(exclude: &[String], include_only: &[String]) -> Result<Self, ExclusionError> {
        let mut excludes = Vec::new();
        let mut negations = Vec::new();

        for raw in exclude {
            if let Some(negated) = raw.strip_prefix('!') {
                negations.push(CompiledPattern::compile(negated)?);
            } else {
                excludes.push(CompiledPattern::compile(raw)?);
            }
        }

        let include_only = include_only
            .iter()
            .map(|raw| CompiledPattern::compile(raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            excludes,
            negations,
            include_only,
        })
    }

    /// Decide whether a relative file path is excluded.
    pub fn is_excluded(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');

        let mut excluded = self.excludes.iter().any(|p| p.matches(path));
        if excluded && self.negations.iter().any(|p| p.matches(path)) {
            excluded = false;
        }

        if !self.include_only.is_empty() && !self.include_only.iter().any(|p| p.matches(path)) {
            return true;
        }

        excluded
    }

    /// Conservative directory check used to prune subtrees during the walk.
    ///
    /// A subtree must not be pruned if any negation could re-include a path
    /// inside it, so this only answers `true` when the directory matches an
    /// exclusion and no negation could apply underneath. When uncertain, the
    /// walk descends and files are filtered individually.
    pub fn is_directory_excluded(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');

        if !self.excludes.iter().any(|p| p.matches(path)) {
            return false;
        }

        !self.negations.iter().any(|p| p.could_match_under(path))
    }

    pub fn has_include_only(&self) -> bool {
        !self.include_only.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn engine(exclude: &[&str], include_only: &[&str]) -> ExclusionEngine {
        ExclusionEngine::new(
            &exclude.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &include_only.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_pattern_rejected() {
        let result = ExclusionEngine::new(&[String::new()], &[]);
        assert!(matches!(result, Err(ExclusionError::Empty)));
    }

    #[rstest]
    #[case("debug.log", true)]
    #[case("nested/deep/trace.log", true)]
    #[case("notes.txt", false)]
    fn test_plain_pattern_matches_any_depth(#[case] path: &str, #[case] excluded: bool) {
        let e = engine(&["*.log"], &[]);
        assert_eq!(e.is_excluded(path), excluded);
    }

    #[test]
    fn test_nested_pattern() {
        let e = engine(&["**/*.out"], &[]);
        assert!(e.is_excluded("a/b/c.out"));
        assert!(e.is_excluded("top.out"));
        assert!(!e.is_excluded("a/b/c.txt"));
    }

    #[test]
    fn test_directory_pattern_excludes_subtree() {
        let e = engine(&["vendor/"], &[]);
        assert!(e.is_excluded("vendor"));
        assert!(e.is_excluded("vendor/lib/mod.rs"));
        assert!(!e.is_excluded("vendored/file.rs"));
    }

    #[test]
    fn test_negation_reincludes() {
        let e = engine(&["*.log", "!important.log"], &[]);
        assert!(e.is_excluded("debug.log"));
        assert!(!e.is_excluded("important.log"));
        assert!(!e.is_excluded("logs/important.log"));
    }

    #[test]
    fn test_include_only_filters_everything_else() {
        let e = engine(&[], &["*.yml"]);
        assert!(!e.is_excluded("ci.yml"));
        assert!(e.is_excluded("README.md"));
    }

    #[test]
    fn test_include_only_combines_with_exclusion() {
        let e = engine(&["scorecard.yml"], &["*.yml"]);
        assert!(e.is_excluded("scorecard.yml"));
        assert!(!e.is_excluded("ci.yml"));
        assert!(e.is_excluded("script.sh"));
    }

    #[test]
    fn test_leading_slash_normalised() {
        let e = engine(&["*.log"], &[]);
        assert_eq!(e.is_excluded("/debug.log"), e.is_excluded("debug.log"));
    }

    #[test]
    fn test_directory_pruning_without_negations() {
        let e = engine(&["vendor/"], &[]);
        assert!(e.is_directory_excluded("vendor"));
        assert!(!e.is_directory_excluded("src"));
    }

    #[test]
    fn test_directory_not_pruned_when_negation_could_reinclude() {
        let e = engine(&["vendor/", "!vendor/keep.txt"], &[]);
        assert!(!e.is_directory_excluded("vendor"));
        // Individual files still filter correctly.
        assert!(e.is_excluded("vendor/drop.txt"));
        assert!(!e.is_excluded("vendor/keep.txt"));
    }

    #[test]
    fn test_unrelated_negation_still_prunes() {
        let e = engine(&["vendor/", "!docs/keep.md"], &[]);
        assert!(e.is_directory_excluded("vendor"));
    }

    #[test]
    fn test_name_only_negation_blocks_pruning() {
        // `!keep.txt` could match at any depth, including inside vendor/.
        let e = engine(&["vendor/", "!keep.txt"], &[]);
        assert!(!e.is_directory_excluded("vendor"));
    }

    #[test]
    fn test_is_excluded_is_deterministic() {
        let e = engine(&["*.tmp", "build/", "!build/keep"], &[]);
        for _ in 0..3 {
            assert!(e.is_excluded("a.tmp"));
            assert!(e.is_excluded("build/out.bin"));
            assert!(!e.is_excluded("build/keep"));
        }
    }
}

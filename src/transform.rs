//! Content transformation between source and target.
//!
//! A [`TransformChain`] runs an ordered list of [`Transformer`]s over file
//! bytes. The chain itself propagates the first failure; the batch processor
//! is what decides to fall back to the untransformed bytes, so one bad file
//! never aborts a task.
//!
//! Binary content bypasses transformation entirely. Classification combines
//! a small extension allow-list with a NUL-byte scan of the first 8 KiB —
//! cheap, and good enough for the config-file payloads this tool moves.

pub mod template;

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexMap;
use once_cell::sync::Lazy;

/// Per-file context handed to every transformer.
#[derive(Debug, Clone, Default)]
pub struct TransformContext {
    pub source_repo: String,
    pub target_repo: String,
    /// Destination path of the file being transformed.
    pub file_path: String,
    pub variables: IndexMap<String, String>,
    /// Set for directory-mapping jobs only.
    pub relative_path: Option<String>,
    pub file_index: Option<usize>,
    pub total_files: Option<usize>,
}

#[derive(Debug)]
pub struct TransformError {
    pub transformer: String,
    pub message: String,
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} transform failed: {}", self.transformer, self.message)
    }
}

impl std::error::Error for TransformError {}

/// One step of the transformation chain.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    fn transform(&self, input: &[u8], ctx: &TransformContext)
    -> Result<Vec<u8>, TransformError>;
}

/// Ordered transformer pipeline.
#[derive(Default)]
pub struct TransformChain {
    transformers: Vec<Box<dyn Transformer>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transformer: Box<dyn Transformer>) {
        self.transformers.push(transformer);
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    /// Apply every transformer in order, stopping at the first failure.
    pub fn apply(&self, input: Vec<u8>, ctx: &TransformContext) -> Result<Vec<u8>, TransformError> {
        let mut current = input;
        for transformer in &self.transformers {
            current = transformer.transform(&current, ctx)?;
        }
        Ok(current)
    }
}

static BINARY_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "tar", "gz", "bz2",
        "xz", "zst", "7z", "jar", "exe", "dll", "so", "dylib", "a", "o", "bin", "dat", "class",
        "wasm", "woff", "woff2", "ttf", "otf", "eot", "mp3", "mp4", "avi", "mov", "sqlite",
    ]
    .into_iter()
    .collect()
});

/// Extension-based binary hint.
pub fn is_binary_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(ext.to_ascii_lowercase().as_str()))
}

/// NUL-byte scan of the first 8 KiB.
pub fn is_binary_content(content: &[u8]) -> bool {
    let window = &content[..content.len().min(8192)];
    window.contains(&0)
}

/// Combined classification used by the batch processor.
pub fn is_binary(path: &str, content: &[u8]) -> bool {
    is_binary_path(path) || is_binary_content(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl Transformer for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn transform(
            &self,
            input: &[u8],
            _ctx: &TransformContext,
        ) -> Result<Vec<u8>, TransformError> {
            Ok(input.to_ascii_uppercase())
        }
    }

    struct Exclaim;

    impl Transformer for Exclaim {
        fn name(&self) -> &str {
            "exclaim"
        }

        fn transform(
            &self,
            input: &[u8],
            _ctx: &TransformContext,
        ) -> Result<Vec<u8>, TransformError> {
            let mut out = input.to_vec();
            out.push(b'!');
            Ok(out)
        }
    }

    struct Failing;

    impl Transformer for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn transform(
            &self,
            _input: &[u8],
            _ctx: &TransformContext,
        ) -> Result<Vec<u8>, TransformError> {
            Err(TransformError {
                transformer: "failing".into(),
                message: "boom".into(),
            })
        }
    }

    #[test]
    fn test_chain_applies_in_order() {
        let mut chain = TransformChain::new();
        chain.push(Box::new(Upper));
        chain.push(Box::new(Exclaim));

        let out = chain
            .apply(b"hello".to_vec(), &TransformContext::default())
            .unwrap();
        assert_eq!(out, b"HELLO!");
    }

    #[test]
    fn test_chain_stops_at_first_failure() {
        let mut chain = TransformChain::new();
        chain.push(Box::new(Failing));
        chain.push(Box::new(Upper));

        let err = chain
            .apply(b"hello".to_vec(), &TransformContext::default())
            .unwrap_err();
        assert_eq!(err.transformer, "failing");
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let chain = TransformChain::new();
        assert!(chain.is_empty());
        let out = chain
            .apply(b"bytes".to_vec(), &TransformContext::default())
            .unwrap();
        assert_eq!(out, b"bytes");
    }

    #[test]
    fn test_binary_extension_detection() {
        assert!(is_binary_path("logo.png"));
        assert!(is_binary_path("dir/archive.ZIP"));
        assert!(!is_binary_path("README.md"));
        assert!(!is_binary_path("Makefile"));
    }

    #[test]
    fn test_binary_null_byte_detection() {
        assert!(is_binary_content(b"abc\0def"));
        assert!(!is_binary_content(b"plain text"));
    }

    #[test]
    fn test_null_byte_beyond_window_not_scanned() {
        let mut content = vec![b'a'; 9000];
        content.push(0);
        assert!(!is_binary_content(&content));
    }

    #[test]
    fn test_combined_classification() {
        assert!(is_binary("x.png", b"text"));
        assert!(is_binary("x.txt", b"\0"));
        assert!(!is_binary("x.txt", b"text"));
    }
}

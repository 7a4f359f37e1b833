//! Synthetic unified diffs for PR bodies.
//!
//! The diff is rendered from the [`FileChange`] set rather than asked of
//! git, so it works identically in dry-run mode and for deletions whose
//! content only exists on the forge. New and deleted files use `/dev/null`
//! headers; binary payloads get a one-line marker.

use similar::TextDiff;

use super::FileChange;
use crate::transform::is_binary_content;

/// Render one unified diff covering every change, sorted by path.
pub fn render_unified_diff(changes: &[FileChange]) -> String {
    let mut sorted: Vec<&FileChange> = changes.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut out = String::new();
    for change in sorted {
        out.push_str(&render_one(change));
    }
    out
}

fn render_one(change: &FileChange) -> String {
    let empty: Vec<u8> = Vec::new();
    let old = change.original.as_ref().unwrap_or(&empty);
    let new = change.content.as_ref().unwrap_or(&empty);

    if old == new {
        return String::new();
    }

    let (old_name, new_name) = if change.is_new {
        ("/dev/null".to_string(), format!("b/{}", change.path))
    } else if change.is_deleted {
        (format!("a/{}", change.path), "/dev/null".to_string())
    } else {
        (format!("a/{}", change.path), format!("b/{}", change.path))
    };

    if is_binary_content(old) || is_binary_content(new) {
        return format!("Binary files {old_name} and {new_name} differ\n");
    }

    let old_text = String::from_utf8_lossy(old);
    let new_text = String::from_utf8_lossy(new);
    let diff = TextDiff::from_lines(old_text.as_ref(), new_text.as_ref());

    let mut out = format!("diff --git a/{path} b/{path}\n", path = change.path);
    out.push_str(
        &diff
            .unified_diff()
            .context_radius(3)
            .header(&old_name, &new_name)
            .to_string(),
    );
    out
}

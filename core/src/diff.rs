//! Diff executor for the tool-call shapes the model emits.
//!
//! Three forms: full-file writes, literal old→new substitutions (single
//! and multi), and anchored line-range replacements. All of them apply
//! against a resolved *base* (pending turn buffer > output > context)
//! pinned by the base's `file_id`; a stale id is rejected with a detail
//! message the hidden repair retry can feed back to the model.
//!
//! Edit failures accumulate instead of raising on first error so one bad
//! hunk never discards its siblings.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchReplaceArgs {
    pub path: String,
    pub old_string: String,
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchReplaceMultiArgs {
    pub edits: Vec<SearchReplaceArgs>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchoredChange {
    pub start: u32,
    pub end: u32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnchoredArgs {
    pub path: String,
    pub changes: Vec<AnchoredChange>,
    pub file_id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("old_string not found in the file")]
    NoMatch,

    #[error("old_string matches {0} locations; pass replace_all or add surrounding context")]
    MultipleMatches(usize),

    #[error("file_id mismatch: the file is at version {expected}, edit referenced {got}")]
    FileIdMismatch { expected: String, got: String },

    #[error("line range {start}-{end} is invalid for a file with {line_count} lines")]
    RangeOutOfBounds {
        start: u32,
        end: u32,
        line_count: usize,
    },

    #[error("line ranges {0}-{1} and {2}-{3} overlap")]
    OverlappingRanges(u32, u32, u32, u32),
}

/// Replace exactly one occurrence of `old_string` (or every occurrence
/// with `replace_all`).
pub fn apply_search_replace(
    base: &str,
    old_string: &str,
    new_string: &str,
    replace_all: bool,
) -> Result<String, EditError> {
    let count = base.matches(old_string).count();
    if old_string.is_empty() || count == 0 {
        return Err(EditError::NoMatch);
    }
    if count > 1 && !replace_all {
        return Err(EditError::MultipleMatches(count));
    }
    if replace_all {
        Ok(base.replace(old_string, new_string))
    } else {
        Ok(base.replacen(old_string, new_string, 1))
    }
}

/// Apply anchored line-range replacements in a single pass. Ranges are
/// 1-indexed inclusive over the base; they must be in range and pairwise
/// disjoint. No-op changes are dropped (and logged) rather than rejected.
pub fn apply_anchored(base: &str, changes: &[AnchoredChange]) -> Result<String, EditError> {
    let had_trailing_newline = base.ends_with('\n');
    let lines: Vec<&str> = base.lines().collect();
    let line_count = lines.len();

    let mut sorted: Vec<&AnchoredChange> = changes.iter().collect();
    sorted.sort_by_key(|c| c.start);

    for change in &sorted {
        if change.start < 1 || change.end < change.start || change.end as usize > line_count {
            return Err(EditError::RangeOutOfBounds {
                start: change.start,
                end: change.end,
                line_count,
            });
        }
    }
    for pair in sorted.windows(2) {
        if pair[1].start <= pair[0].end {
            return Err(EditError::OverlappingRanges(
                pair[0].start,
                pair[0].end,
                pair[1].start,
                pair[1].end,
            ));
        }
    }

    let mut out: Vec<&str> = Vec::with_capacity(line_count);
    let mut cursor = 0usize; // 0-indexed next line to copy
    for change in &sorted {
        let start = change.start as usize - 1;
        let end = change.end as usize; // exclusive
        let replacement: Vec<&str> = if change.content.is_empty() {
            Vec::new()
        } else {
            change.content.lines().collect()
        };
        if replacement == lines[start..end] {
            debug!(
                "dropping no-op anchored change {}-{}",
                change.start, change.end
            );
            continue;
        }
        out.extend_from_slice(&lines[cursor..start]);
        out.extend_from_slice(&replacement);
        cursor = end;
    }
    out.extend_from_slice(&lines[cursor..]);

    let mut result = out.join("\n");
    if had_trailing_newline && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

/// Optimistic-concurrency check shared by every edit shape.
pub fn check_file_id(expected: &str, got: &str) -> Result<(), EditError> {
    if expected == got {
        Ok(())
    } else {
        Err(EditError::FileIdMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_replacement() {
        assert_eq!(
            apply_search_replace("A\nB\n", "A", "X", false).unwrap(),
            "X\nB\n"
        );
    }

    #[test]
    fn missing_needle_is_no_match() {
        assert_eq!(
            apply_search_replace("A\nB\n", "Z", "Y", false),
            Err(EditError::NoMatch)
        );
        assert_eq!(
            apply_search_replace("A\n", "", "Y", false),
            Err(EditError::NoMatch)
        );
    }

    #[test]
    fn ambiguous_needle_requires_replace_all() {
        assert_eq!(
            apply_search_replace("x x x", "x", "y", false),
            Err(EditError::MultipleMatches(3))
        );
        assert_eq!(
            apply_search_replace("x x x", "x", "y", true).unwrap(),
            "y y y"
        );
    }

    #[test]
    fn anchored_replaces_disjoint_ranges_in_one_pass() {
        let base = "l1\nl2\nl3\nl4\nl5\n";
        let changes = vec![
            AnchoredChange {
                start: 4,
                end: 5,
                content: "D\nE\n".to_string(),
            },
            AnchoredChange {
                start: 1,
                end: 1,
                content: "A\n".to_string(),
            },
        ];
        assert_eq!(
            apply_anchored(base, &changes).unwrap(),
            "A\nl2\nl3\nD\nE\n"
        );
    }

    #[test]
    fn anchored_empty_content_deletes_lines() {
        let base = "l1\nl2\nl3\n";
        let changes = vec![AnchoredChange {
            start: 2,
            end: 2,
            content: String::new(),
        }];
        assert_eq!(apply_anchored(base, &changes).unwrap(), "l1\nl3\n");
    }

    #[test]
    fn anchored_rejects_bad_ranges() {
        let base = "l1\nl2\n";
        assert_eq!(
            apply_anchored(
                base,
                &[AnchoredChange {
                    start: 0,
                    end: 1,
                    content: "x".to_string()
                }]
            ),
            Err(EditError::RangeOutOfBounds {
                start: 0,
                end: 1,
                line_count: 2
            })
        );
        assert_eq!(
            apply_anchored(
                base,
                &[AnchoredChange {
                    start: 1,
                    end: 3,
                    content: "x".to_string()
                }]
            ),
            Err(EditError::RangeOutOfBounds {
                start: 1,
                end: 3,
                line_count: 2
            })
        );
        assert_eq!(
            apply_anchored(
                base,
                &[
                    AnchoredChange {
                        start: 1,
                        end: 2,
                        content: "x".to_string()
                    },
                    AnchoredChange {
                        start: 2,
                        end: 2,
                        content: "y".to_string()
                    }
                ]
            ),
            Err(EditError::OverlappingRanges(1, 2, 2, 2))
        );
    }

    #[test]
    fn anchored_drops_noop_changes() {
        let base = "l1\nl2\n";
        let changes = vec![
            AnchoredChange {
                start: 1,
                end: 1,
                content: "l1\n".to_string(),
            },
            AnchoredChange {
                start: 2,
                end: 2,
                content: "X\n".to_string(),
            },
        ];
        assert_eq!(apply_anchored(base, &changes).unwrap(), "l1\nX\n");
    }

    #[test]
    fn file_id_mismatch_detail_names_both_ids() {
        let err = check_file_id("aaaa0000", "bbbb1111").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("aaaa0000"));
        assert!(msg.contains("bbbb1111"));
    }
}

//! Unified-diff parsing, patch-path confinement, and the pure hunk
//! applier.
//!
//! Parsing rejects hostile paths (absolute, drive-specified, traversing)
//! before any filesystem access; `confine_diff` then proves every touched
//! path resolves inside the workspace. `apply_file_diff` is a pure text
//! transform: it never touches disk.

use crate::confine::{confine_path, patch_path_is_lexically_safe};
use std::path::Path;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PatchError {
    #[error("empty_diff")]
    EmptyDiff,
    #[error("path_rejected:{path}: {why}")]
    PathRejected { path: String, why: String },
    #[error("invalid_hunk_header at line {line}: {detail}")]
    InvalidHunkHeader { line: usize, detail: String },
    #[error("context_mismatch at original line {original_line}: expected {expected:?}, found {found:?}")]
    ContextMismatch {
        original_line: usize,
        expected: String,
        found: String,
    },
    #[error("delete_mismatch at original line {original_line}: expected {expected:?}, found {found:?}")]
    DeleteMismatch {
        original_line: usize,
        expected: String,
        found: String,
    },
    #[error("overlapping_hunks at original line {original_line}")]
    OverlappingHunks { original_line: usize },
    #[error("hunk_outside_file: hunk starts at line {start} but file has {len} lines")]
    HunkOutsideFile { start: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Del(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

/// One file's worth of a unified diff. `None` paths are the no-file
/// sentinel (`/dev/null`): creation has no old path, deletion no new one.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiff {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    /// The path this diff effectively touches.
    pub fn target_path(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }
}

fn clean_header_path(raw: &str, line: usize) -> Result<Option<String>, PatchError> {
    // `--- a/x	2024-01-01` carries an optional tab-separated timestamp.
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" {
        return Ok(None);
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    let normalized = stripped.replace('\\', "/");
    if normalized.is_empty() {
        return Err(PatchError::PathRejected {
            path: raw.to_string(),
            why: format!("empty path in header at line {}", line),
        });
    }
    if !patch_path_is_lexically_safe(&normalized) {
        return Err(PatchError::PathRejected {
            path: normalized,
            why: "absolute, drive-specified, or traversing".to_string(),
        });
    }
    Ok(Some(normalized))
}

fn parse_range(text: &str, line: usize) -> Result<(usize, usize), PatchError> {
    let bad = |detail: &str| PatchError::InvalidHunkHeader {
        line,
        detail: detail.to_string(),
    };
    let (start, len) = match text.split_once(',') {
        Some((s, l)) => (
            s.parse::<usize>().map_err(|_| bad("bad start"))?,
            l.parse::<usize>().map_err(|_| bad("bad length"))?,
        ),
        None => (text.parse::<usize>().map_err(|_| bad("bad start"))?, 1),
    };
    Ok((start, len))
}

fn parse_hunk_header(text: &str, line: usize) -> Result<(usize, usize, usize, usize), PatchError> {
    let bad = |detail: &str| PatchError::InvalidHunkHeader {
        line,
        detail: detail.to_string(),
    };
    let rest = text.strip_prefix("@@ ").ok_or_else(|| bad("missing @@"))?;
    let (ranges, _) = rest.split_once(" @@").ok_or_else(|| bad("missing closing @@"))?;
    let (old, new) = ranges.split_once(' ').ok_or_else(|| bad("missing ranges"))?;
    let old = old.strip_prefix('-').ok_or_else(|| bad("missing -range"))?;
    let new = new.strip_prefix('+').ok_or_else(|| bad("missing +range"))?;
    let (old_start, old_len) = parse_range(old, line)?;
    let (new_start, new_len) = parse_range(new, line)?;
    Ok((old_start, old_len, new_start, new_len))
}

fn hunk_is_open(hunk: &Hunk) -> bool {
    let mut consumed_old = 0usize;
    let mut consumed_new = 0usize;
    for line in &hunk.lines {
        match line {
            HunkLine::Context(_) => {
                consumed_old += 1;
                consumed_new += 1;
            }
            HunkLine::Del(_) => consumed_old += 1,
            HunkLine::Add(_) => consumed_new += 1,
        }
    }
    consumed_old < hunk.old_len || consumed_new < hunk.new_len
}

/// Parse a unified diff into per-file diffs.
///
/// Accepts both the extended `diff --git a/X b/Y` form and plain
/// `---`/`+++` pairs. Hostile paths fail here, at parse time. Content
/// lines beginning with `---`/`+++` inside a still-open hunk are
/// disambiguated by the hunk's declared lengths.
pub fn parse_unified_diff(text: &str) -> Result<Vec<FileDiff>, PatchError> {
    let mut files: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;

    for (i, line) in text.lines().enumerate() {
        let line_no = i + 1;
        let in_open_hunk = current
            .as_ref()
            .and_then(|f| f.hunks.last())
            .is_some_and(hunk_is_open);
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(file) = current.take() {
                files.push(file);
            }
            let mut parts = rest.split_whitespace();
            let old_raw = parts.next().unwrap_or("");
            let new_raw = parts.next().unwrap_or("");
            current = Some(FileDiff {
                old_path: clean_header_path(old_raw, line_no)?,
                new_path: clean_header_path(new_raw, line_no)?,
                hunks: Vec::new(),
            });
        } else if line.starts_with("--- ") && !in_open_hunk {
            let rest = &line[4..];
            let old_path = clean_header_path(rest, line_no)?;
            match current.as_mut() {
                // A `diff --git` header was already seen and no hunks have
                // started: this `---` refines it.
                Some(file) if file.hunks.is_empty() => file.old_path = old_path,
                _ => {
                    if let Some(file) = current.take() {
                        files.push(file);
                    }
                    current = Some(FileDiff {
                        old_path,
                        new_path: None,
                        hunks: Vec::new(),
                    });
                }
            }
        } else if line.starts_with("+++ ") && !in_open_hunk {
            let rest = &line[4..];
            let new_path = clean_header_path(rest, line_no)?;
            match current.as_mut() {
                Some(file) if file.hunks.is_empty() => file.new_path = new_path,
                _ => {
                    return Err(PatchError::InvalidHunkHeader {
                        line: line_no,
                        detail: "+++ without preceding ---".to_string(),
                    })
                }
            }
        } else if line.starts_with("@@") {
            let file = current.as_mut().ok_or(PatchError::InvalidHunkHeader {
                line: line_no,
                detail: "hunk before any file header".to_string(),
            })?;
            let (old_start, old_len, new_start, new_len) = parse_hunk_header(line, line_no)?;
            file.hunks.push(Hunk {
                old_start,
                old_len,
                new_start,
                new_len,
                lines: Vec::new(),
            });
        } else if let Some(hunk) = current.as_mut().and_then(|f| f.hunks.last_mut()) {
            if let Some(text) = line.strip_prefix(' ') {
                hunk.lines.push(HunkLine::Context(text.to_string()));
            } else if let Some(text) = line.strip_prefix('+') {
                hunk.lines.push(HunkLine::Add(text.to_string()));
            } else if let Some(text) = line.strip_prefix('-') {
                hunk.lines.push(HunkLine::Del(text.to_string()));
            } else if line.is_empty() {
                // Some producers emit bare empty lines for empty context.
                hunk.lines.push(HunkLine::Context(String::new()));
            }
            // `\ No newline at end of file` and any other marker is metadata.
        }
        // Lines outside hunks (`index`, mode lines, prose) are skipped.
    }
    if let Some(file) = current.take() {
        files.push(file);
    }

    let files: Vec<FileDiff> = files
        .into_iter()
        .filter(|f| f.target_path().is_some())
        .collect();
    if files.is_empty() {
        return Err(PatchError::EmptyDiff);
    }
    Ok(files)
}

/// Total added + deleted lines across the diff.
pub fn changed_line_count(files: &[FileDiff]) -> u64 {
    files
        .iter()
        .flat_map(|f| &f.hunks)
        .flat_map(|h| &h.lines)
        .filter(|l| matches!(l, HunkLine::Add(_) | HunkLine::Del(_)))
        .count() as u64
}

/// Parse the diff and prove every touched path resolves inside the
/// workspace (symlinks followed). Returns the confined relative paths.
pub fn confine_diff(workspace: &Path, text: &str) -> Result<Vec<String>, PatchError> {
    let files = parse_unified_diff(text)?;
    let mut out = Vec::new();
    for file in &files {
        for path in [file.old_path.as_deref(), file.new_path.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = confine_path(workspace, path) {
                return Err(PatchError::PathRejected {
                    path: path.to_string(),
                    why: e.to_string(),
                });
            }
        }
        if let Some(target) = file.target_path() {
            if !out.iter().any(|p| p == target) {
                out.push(target.to_string());
            }
        }
    }
    Ok(out)
}

/// Apply one file's hunks to its original text.
///
/// Context lines must match the original at the cursor, deletes must match
/// and consume, adds insert without consuming. Hunks must be in order and
/// non-overlapping. Trailing-newline presence follows the original (a
/// created file ends with a newline).
pub fn apply_file_diff(original: &str, diff: &FileDiff) -> Result<String, PatchError> {
    let old_lines: Vec<&str> = if original.is_empty() {
        Vec::new()
    } else {
        original.trim_end_matches('\n').split('\n').collect()
    };

    let mut out: Vec<String> = Vec::new();
    let mut cursor = 0usize; // lines of the original consumed so far

    for hunk in &diff.hunks {
        // `-N,0` means "insert after line N"; otherwise the hunk begins at
        // line N itself.
        let hunk_begin = if hunk.old_len == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        if hunk_begin < cursor {
            return Err(PatchError::OverlappingHunks {
                original_line: hunk.old_start,
            });
        }
        if hunk_begin > old_lines.len() {
            return Err(PatchError::HunkOutsideFile {
                start: hunk.old_start,
                len: old_lines.len(),
            });
        }
        out.extend(old_lines[cursor..hunk_begin].iter().map(|s| s.to_string()));
        cursor = hunk_begin;

        for line in &hunk.lines {
            match line {
                HunkLine::Context(expected) => {
                    let found = old_lines.get(cursor).copied().unwrap_or("");
                    if cursor >= old_lines.len() || found != expected {
                        return Err(PatchError::ContextMismatch {
                            original_line: cursor + 1,
                            expected: expected.clone(),
                            found: found.to_string(),
                        });
                    }
                    out.push(expected.clone());
                    cursor += 1;
                }
                HunkLine::Del(expected) => {
                    let found = old_lines.get(cursor).copied().unwrap_or("");
                    if cursor >= old_lines.len() || found != expected {
                        return Err(PatchError::DeleteMismatch {
                            original_line: cursor + 1,
                            expected: expected.clone(),
                            found: found.to_string(),
                        });
                    }
                    cursor += 1;
                }
                HunkLine::Add(text) => {
                    out.push(text.clone());
                }
            }
        }
    }
    out.extend(old_lines[cursor..].iter().map(|s| s.to_string()));

    if out.is_empty() {
        return Ok(String::new());
    }
    let mut joined = out.join("\n");
    if original.is_empty() || original.ends_with('\n') {
        joined.push('\n');
    }
    Ok(joined)
}

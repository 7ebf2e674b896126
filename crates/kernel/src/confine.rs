//! Workspace confinement: a resolved path must stay inside the workspace
//! root, verified after symlink resolution.
//!
//! Shared by the gate, the controller (which re-derives every path
//! independently), and the episode orchestrator's trace candidate filter.

use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfineError {
    #[error("absolute_path:{path}")]
    AbsolutePath { path: String },
    #[error("path_traversal:{path}")]
    Traversal { path: String },
    #[error("path_escape:{path}")]
    Escape { path: String },
    #[error("path_invalid:{path}: {detail}")]
    Invalid { path: String, detail: String },
}

/// Lexically normalize a workspace-relative path.
///
/// Rejects absolute paths, drive specifiers, and `..` segments before any
/// filesystem access happens; backslashes normalize to `/`.
pub fn normalize_rel(path: &str) -> Result<Vec<String>, ConfineError> {
    let text = path.replace('\\', "/");
    if text.starts_with('/') {
        return Err(ConfineError::AbsolutePath {
            path: path.to_string(),
        });
    }
    if text.contains(':') {
        return Err(ConfineError::AbsolutePath {
            path: path.to_string(),
        });
    }
    let mut parts = Vec::new();
    for raw in text.split('/') {
        match raw {
            "" | "." => {}
            ".." => {
                return Err(ConfineError::Traversal {
                    path: path.to_string(),
                })
            }
            part => parts.push(part.to_string()),
        }
    }
    if parts.is_empty() {
        return Err(ConfineError::Invalid {
            path: path.to_string(),
            detail: "empty path".to_string(),
        });
    }
    Ok(parts)
}

/// Resolve `path` against `workspace_root` and prove it stays inside.
///
/// Existing components are resolved through symlinks one at a time; every
/// resolution must land back under the canonicalized root, so a
/// workspace-internal symlink pointing outside is rejected rather than
/// silently followed. Nonexistent suffixes are appended lexically (a path
/// that does not exist cannot be a symlink).
pub fn confine_path(workspace_root: &Path, path: &str) -> Result<PathBuf, ConfineError> {
    if Path::new(path).is_absolute() {
        return Err(ConfineError::AbsolutePath {
            path: path.to_string(),
        });
    }
    let parts = normalize_rel(path)?;
    let root = fs::canonicalize(workspace_root).map_err(|e| ConfineError::Invalid {
        path: path.to_string(),
        detail: format!("workspace root: {}", e),
    })?;

    let mut cur = root.clone();
    let mut resolving = true;
    for part in &parts {
        let candidate = cur.join(part);
        if resolving && candidate.symlink_metadata().is_ok() {
            let resolved =
                fs::canonicalize(&candidate).map_err(|e| ConfineError::Invalid {
                    path: path.to_string(),
                    detail: e.to_string(),
                })?;
            if !resolved.starts_with(&root) {
                return Err(ConfineError::Escape {
                    path: path.to_string(),
                });
            }
            cur = resolved;
        } else {
            resolving = false;
            cur = candidate;
        }
    }
    // A resolved ancestor may itself sit outside the root even when every
    // final component check passed (defense against crafted components).
    if !cur.starts_with(&root) {
        return Err(ConfineError::Escape {
            path: path.to_string(),
        });
    }
    Ok(cur)
}

/// True when the normalized path falls under one of the allowed relative
/// roots (`.` allows everything).
pub fn under_path_roots(path: &str, roots: &[String]) -> bool {
    let Ok(parts) = normalize_rel(path) else {
        return false;
    };
    let normalized = parts.join("/");
    roots.iter().any(|root| {
        root == "." || normalized == *root || normalized.starts_with(&format!("{}/", root))
    })
}

fn components_contain_parent(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::ParentDir))
}

/// Lexical screen for patch paths: absolute, drive-specified, or
/// traversing paths never reach the resolver.
pub fn patch_path_is_lexically_safe(path: &str) -> bool {
    let text = path.replace('\\', "/");
    !(text.starts_with('/') || text.contains(':') || components_contain_parent(Path::new(&text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            confine_path(dir.path(), "/etc/passwd"),
            Err(ConfineError::AbsolutePath { .. })
        ));
        assert!(matches!(
            confine_path(dir.path(), "a/../../pwn.txt"),
            Err(ConfineError::Traversal { .. })
        ));
        assert!(matches!(
            confine_path(dir.path(), "C:\\windows\\system32"),
            Err(ConfineError::AbsolutePath { .. })
        ));
    }

    #[test]
    fn accepts_confined_paths_existing_or_not() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "x").unwrap();

        let existing = confine_path(dir.path(), "src/lib.rs").unwrap();
        assert!(existing.ends_with("src/lib.rs"));
        let fresh = confine_path(dir.path(), "src/new_module.rs").unwrap();
        assert!(fresh.ends_with("src/new_module.rs"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("leak")).unwrap();

        assert!(matches!(
            confine_path(dir.path(), "leak/secret.txt"),
            Err(ConfineError::Escape { .. })
        ));
    }

    #[test]
    fn path_roots_screen() {
        let roots = vec!["src".to_string()];
        assert!(under_path_roots("src/lib.rs", &roots));
        assert!(!under_path_roots("tests/lib.rs", &roots));
        assert!(under_path_roots("tests/lib.rs", &[".".to_string()]));
    }
}

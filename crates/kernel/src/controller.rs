//! Executes gate-approved actions against the real workspace and process
//! boundary.
//!
//! Defense in depth: every path is re-confined here, independently of the
//! gate. A confinement failure after approval means the filesystem changed
//! underneath us (TOCTOU) and is an invariant breach that stops the
//! episode; it is the only error class that propagates instead of being
//! reported as a failed [`ExecResult`].

use crate::action::Action;
use crate::confine::confine_path;
use crate::diff::{apply_file_diff, parse_unified_diff};
use crate::envelope::EnvelopeRegistry;
use crate::state::{Decision, ExecResult, StateSnapshot};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The gate should have made this impossible; treat as fatal.
    #[error("invariant: {0}")]
    Invariant(String),
}

/// Seam for the capability-gated actions the core cannot execute itself
/// (network, memory, delegation). Injected so the controller is testable
/// without any real provider.
pub trait ExternalActions {
    fn execute(&mut self, action: &Action) -> ExecResult;
}

/// Default provider: reports every external action as unavailable.
pub struct NoExternalActions;

impl ExternalActions for NoExternalActions {
    fn execute(&mut self, action: &Action) -> ExecResult {
        ExecResult::failed(action.clone(), "external_provider_unavailable")
    }
}

/// Execute every approved action of an ALLOW decision, in order.
pub fn execute(
    state: &StateSnapshot,
    decision: &Decision,
    envelopes: &EnvelopeRegistry,
    externals: &mut dyn ExternalActions,
) -> Result<Vec<ExecResult>, ControllerError> {
    if !decision.is_allow() {
        return Err(ControllerError::Invariant(
            "controller called on a DENY decision".to_string(),
        ));
    }

    let mut results = Vec::with_capacity(decision.approved_actions.len());
    for action in &decision.approved_actions {
        debug!(kind = action.kind().as_str(), "executing action");
        let result = execute_one(state, action, envelopes, externals)?;
        if !result.ok {
            warn!(kind = action.kind().as_str(), "action failed");
        }
        results.push(result);
    }
    Ok(results)
}

fn execute_one(
    state: &StateSnapshot,
    action: &Action,
    envelopes: &EnvelopeRegistry,
    externals: &mut dyn ExternalActions,
) -> Result<ExecResult, ControllerError> {
    let env = envelopes.spec(action.kind());
    let started = Instant::now();
    let mut result = match action {
        Action::ReadFile { path } => {
            let abs = reconfine(state, path)?;
            match fs::read(&abs) {
                Ok(bytes) => {
                    let mut text = String::from_utf8_lossy(&bytes).into_owned();
                    let truncated = truncate_to(&mut text, env.max_bytes as usize);
                    let mut result = ok_result(action, text);
                    if truncated {
                        result
                            .artifacts
                            .insert("truncated".to_string(), "true".to_string());
                    }
                    result
                }
                Err(e) => ExecResult::failed(action.clone(), format!("read failed: {}", e)),
            }
        }
        Action::WriteFile { path, text } => {
            let abs = reconfine(state, path)?;
            match write_atomic(&abs, text.as_bytes()) {
                Ok(()) => {
                    let mut result = ok_result(action, String::new());
                    result
                        .artifacts
                        .insert("bytes_written".to_string(), text.len().to_string());
                    result
                }
                Err(e) => ExecResult::failed(action.clone(), format!("write failed: {}", e)),
            }
        }
        Action::ApplyPatch { patch } => apply_patch(state, action, patch)?,
        Action::RunTests { argv, .. } => {
            run_process(action, argv, &state.workspace_root, env.max_wall_ms, env.max_bytes)
        }
        Action::ShellExec { command } => {
            let argv = vec!["sh".to_string(), "-c".to_string(), command.clone()];
            run_process(action, &argv, &state.workspace_root, env.max_wall_ms, env.max_bytes)
        }
        Action::Grep { pattern, path } => grep_workspace(state, action, pattern, path.as_deref(), env.max_bytes)?,
        Action::WebSearch { .. }
        | Action::BrowseUrl { .. }
        | Action::Remember { .. }
        | Action::Recall { .. }
        | Action::Delegate { .. } => externals.execute(action),
    };
    result.duration_ms = started.elapsed().as_millis() as u64;
    Ok(result)
}

fn reconfine(state: &StateSnapshot, path: &str) -> Result<std::path::PathBuf, ControllerError> {
    confine_path(&state.workspace_root, path).map_err(|e| {
        ControllerError::Invariant(format!(
            "confinement failed at execution time for approved path {}: {}",
            path, e
        ))
    })
}

fn ok_result(action: &Action, stdout: String) -> ExecResult {
    ExecResult {
        action: action.clone(),
        ok: true,
        stdout,
        stderr: String::new(),
        exit_code: Some(0),
        duration_ms: 0,
        artifacts: BTreeMap::new(),
    }
}

fn truncate_to(text: &mut String, cap: usize) -> bool {
    if text.len() <= cap {
        return false;
    }
    let mut cut = cap;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    true
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent"))?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?
        .to_string_lossy()
        .to_string();
    let tmp_path = parent.join(format!(".{}.warden.tmp", file_name));
    fs::write(&tmp_path, bytes)?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    Ok(())
}

fn apply_patch(
    state: &StateSnapshot,
    action: &Action,
    patch: &str,
) -> Result<ExecResult, ControllerError> {
    let files = match parse_unified_diff(patch) {
        Ok(files) => files,
        Err(e) => {
            return Ok(ExecResult::failed(
                action.clone(),
                format!("patch parse failed: {}", e),
            ))
        }
    };

    // All-or-nothing per action: every file is patched in memory before
    // anything is written back.
    let mut staged: Vec<(std::path::PathBuf, String, String)> = Vec::new();
    for file in &files {
        let Some(target) = file.target_path() else {
            continue;
        };
        let abs = reconfine(state, target)?;
        let original = match fs::read_to_string(&abs) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Ok(ExecResult::failed(
                    action.clone(),
                    format!("patch target unreadable: {}: {}", target, e),
                ))
            }
        };
        match apply_file_diff(&original, file) {
            Ok(patched) => staged.push((abs, target.to_string(), patched)),
            Err(e) => {
                return Ok(ExecResult::failed(
                    action.clone(),
                    format!("patch apply failed: {}: {}", target, e),
                ))
            }
        }
    }

    let mut changed = Vec::new();
    for (abs, target, patched) in staged {
        if let Err(e) = write_atomic(&abs, patched.as_bytes()) {
            return Ok(ExecResult::failed(
                action.clone(),
                format!("patch write failed: {}: {}", target, e),
            ));
        }
        changed.push(target);
    }

    let mut result = ok_result(action, String::new());
    result
        .artifacts
        .insert("files_changed".to_string(), changed.join(","));
    Ok(result)
}

fn run_process(
    action: &Action,
    argv: &[String],
    workspace: &Path,
    max_wall_ms: u64,
    output_cap: u64,
) -> ExecResult {
    let Some((program, args)) = argv.split_first() else {
        return ExecResult::failed(action.clone(), "empty argv");
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecResult::failed(action.clone(), format!("spawn failed: {}: {}", program, e))
        }
    };

    // Drain pipes on threads so a chatty child cannot deadlock against a
    // full pipe while we wait on it.
    let stdout_handle = child.stdout.take().map(|mut pipe| {
        let cap = output_cap as usize;
        std::thread::spawn(move || read_capped(&mut pipe, cap))
    });
    let stderr_handle = child.stderr.take().map(|mut pipe| {
        let cap = output_cap as usize;
        std::thread::spawn(move || read_capped(&mut pipe, cap))
    });

    let timeout = Duration::from_millis(max_wall_ms);
    let (status, timed_out) = match child.wait_timeout(timeout) {
        Ok(Some(status)) => (Some(status), false),
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            (None, true)
        }
        Err(e) => {
            return ExecResult::failed(action.clone(), format!("wait failed: {}", e));
        }
    };

    let stdout = stdout_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    let exit_code = status.and_then(|s| s.code());
    let ok = !timed_out && status.map(|s| s.success()).unwrap_or(false);
    let mut artifacts = BTreeMap::new();
    if timed_out {
        artifacts.insert("timed_out".to_string(), "true".to_string());
    }
    ExecResult {
        action: action.clone(),
        ok,
        stdout,
        stderr,
        exit_code,
        duration_ms: 0,
        artifacts,
    }
}

fn read_capped(pipe: &mut impl Read, cap: usize) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < cap {
                    let take = n.min(cap - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
                // Keep draining past the cap so the child never blocks.
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn grep_workspace(
    state: &StateSnapshot,
    action: &Action,
    pattern: &str,
    path: Option<&str>,
    output_cap: u64,
) -> Result<ExecResult, ControllerError> {
    let re = match regex::Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            return Ok(ExecResult::failed(
                action.clone(),
                format!("pattern invalid: {}", e),
            ))
        }
    };
    let root = match path {
        Some(rel) => reconfine(state, rel)?,
        None => state.workspace_root.clone(),
    };

    // A file target greps just that file; a directory is walked, sorted.
    let (scan_root, mut files) = if root.is_file() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let parent = root.parent().unwrap_or(&root).to_path_buf();
        (parent, vec![name])
    } else {
        (root.clone(), Vec::new())
    };
    if files.is_empty() {
        collect_files(&scan_root, &scan_root, &mut files);
        files.sort();
    }

    let mut out = String::new();
    let mut match_count = 0u64;
    'files: for file in &files {
        let Ok(text) = fs::read_to_string(scan_root.join(file)) else {
            continue;
        };
        for (line_no, line) in text.lines().enumerate() {
            if re.is_match(line) {
                match_count += 1;
                out.push_str(&format!("{}:{}:{}\n", file, line_no + 1, line));
                if out.len() as u64 >= output_cap {
                    break 'files;
                }
            }
        }
    }

    let mut result = ok_result(action, out);
    result
        .artifacts
        .insert("match_count".to_string(), match_count.to_string());
    Ok(result)
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = path.symlink_metadata() else {
            continue;
        };
        if meta.is_dir() {
            collect_files(base, &path, out);
        } else if meta.is_file() {
            let rel = path.strip_prefix(base).unwrap_or(&path);
            out.push(rel.to_string_lossy().to_string());
        }
        // Symlinks are skipped: grep stays inside the workspace.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Proposal;
    use crate::gate::gate;
    use crate::policy::GatePolicy;
    use crate::state::{DecisionStatus, Mode};

    fn snapshot(dir: &Path) -> StateSnapshot {
        StateSnapshot {
            task_id: "t1".to_string(),
            workspace_root: dir.to_path_buf(),
            step: 0,
            budget_actions_remaining: 20,
            budget_wall_ms_remaining: 60_000,
            mode: Mode::Normal,
            notes: BTreeMap::new(),
        }
    }

    #[test]
    fn executing_a_deny_is_an_invariant_breach() {
        let dir = tempfile::tempdir().unwrap();
        let state = snapshot(dir.path());
        let decision = gate(
            &state,
            &Proposal::new(vec![], "empty"),
            &GatePolicy::default(),
            &EnvelopeRegistry::builtin(),
        );
        assert_eq!(decision.status, DecisionStatus::Deny);
        let err = execute(
            &state,
            &decision,
            &EnvelopeRegistry::builtin(),
            &mut NoExternalActions,
        )
        .unwrap_err();
        assert!(matches!(err, ControllerError::Invariant(_)));
    }

    #[cfg(unix)]
    #[test]
    fn read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.txt"), "before\n").unwrap();
        std::fs::write(dir.path().join("ok.sh"), "exit 0\n").unwrap();
        let state = snapshot(dir.path());
        let envelopes = EnvelopeRegistry::builtin();
        let mut policy = GatePolicy::default();
        policy.test_command_allowlist = vec![vec!["sh".to_string(), "ok.sh".to_string()]];

        let proposal = Proposal::new(
            vec![
                Action::ReadFile {
                    path: "note.txt".to_string(),
                },
                Action::WriteFile {
                    path: "note.txt".to_string(),
                    text: "after\n".to_string(),
                },
                Action::RunTests {
                    argv: vec!["sh".to_string(), "ok.sh".to_string()],
                    mode: None,
                },
            ],
            "round trip",
        );
        let decision = gate(&state, &proposal, &policy, &envelopes);
        assert_eq!(decision.status, DecisionStatus::Allow, "{:?}", decision.reasons);

        let results = execute(&state, &decision, &envelopes, &mut NoExternalActions).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].ok);
        assert_eq!(results[0].stdout, "before\n");
        assert!(results[1].ok);
        assert!(results[2].ok);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("note.txt")).unwrap(),
            "after\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn timeout_is_a_failed_result_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let action = Action::ShellExec {
            command: "sleep 5".to_string(),
        };
        let result = run_process(
            &action,
            &[
                "sh".to_string(),
                "-c".to_string(),
                "sleep 5".to_string(),
            ],
            dir.path(),
            100,
            64 * 1024,
        );
        assert!(!result.ok);
        assert_eq!(result.artifacts.get("timed_out").map(String::as_str), Some("true"));
    }

    #[test]
    fn grep_reports_matches_with_locations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\nbeta\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta\ngamma\n").unwrap();
        let state = snapshot(dir.path());

        let action = Action::Grep {
            pattern: "beta".to_string(),
            path: None,
        };
        let result = grep_workspace(&state, &action, "beta", None, 64 * 1024).unwrap();
        assert!(result.ok);
        assert_eq!(result.artifacts.get("match_count").map(String::as_str), Some("2"));
        assert!(result.stdout.contains("a.txt:2:beta"));
        assert!(result.stdout.contains("b.txt:1:beta"));
    }
}

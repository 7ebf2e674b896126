//! The deterministic security gate.
//!
//! `gate` is a pure function of (snapshot, proposal, policy, envelope
//! registry): no filesystem or network I/O beyond the path-existence
//! checks confinement needs, no clock, no randomness. Calling it any
//! number of times with identical inputs yields a byte-identical
//! [`Decision`]. Every rejection is data in `Decision.reasons`; the gate
//! never panics on adversarial input.

use crate::action::{Action, ActionKind, Proposal};
use crate::confine::{confine_path, under_path_roots};
use crate::diff::{changed_line_count, confine_diff, parse_unified_diff};
use crate::envelope::EnvelopeRegistry;
use crate::policy::GatePolicy;
use crate::state::{Decision, DecisionStatus, Mode, StateSnapshot};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

pub const REASON_EMPTY_PROPOSAL: &str = "empty_proposal";
pub const REASON_MAX_ACTIONS: &str = "max_actions_exceeded";
pub const REASON_BUDGET_ACTIONS: &str = "budget_actions_exhausted";
pub const REASON_PATH_OUT_OF_BOUNDS: &str = "path_out_of_bounds";
pub const REASON_PATH_ROOT: &str = "path_root_not_allowed";
pub const REASON_WRITE_TOO_LARGE: &str = "write_too_large";
pub const REASON_CUMULATIVE_WRITE_CAP: &str = "cumulative_write_cap";
pub const REASON_PATCH_INVALID: &str = "patch_invalid";
pub const REASON_PATCH_OUT_OF_BOUNDS: &str = "patch_out_of_bounds";
pub const REASON_PATCH_TOO_LARGE: &str = "patch_too_large";
pub const REASON_TEST_COMMAND: &str = "test_command_not_allowed";
pub const REASON_TEST_TOKEN: &str = "test_token_unsafe";
pub const REASON_TEST_PATH: &str = "test_path_out_of_bounds";
pub const REASON_SHELL_DENIED: &str = "shell_denied";
pub const REASON_NETWORK_DENIED: &str = "network_denied";
pub const REASON_DOMAIN: &str = "domain_not_allowed";
pub const REASON_PATTERN_TOO_LONG: &str = "pattern_too_long";
pub const REASON_PATTERN_CATASTROPHIC: &str = "pattern_catastrophic";
pub const REASON_RATE_LIMIT: &str = "rate_limit_exceeded";
pub const REASON_ORDER_WRITE_WITHOUT_READ: &str = "order:write_without_read_same_proposal";
pub const REASON_ORDER_WRITE_WITHOUT_TEST: &str = "order:write_without_test_run";
pub const REASON_PANIC_SINGLE: &str = "panic_mode:single_action_only";
pub const REASON_PANIC_CAPABILITY: &str = "panic_mode:capability_denied";

fn safe_test_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_./:@-]*$").unwrap())
}

/// Validate one proposal against the current snapshot, policy, and
/// envelope registry.
pub fn gate(
    state: &StateSnapshot,
    proposal: &Proposal,
    policy: &GatePolicy,
    envelopes: &EnvelopeRegistry,
) -> Decision {
    let mut reasons: Vec<String> = Vec::new();

    if proposal.actions.is_empty() {
        return Decision {
            status: DecisionStatus::Deny,
            reasons: vec![REASON_EMPTY_PROPOSAL.to_string()],
            approved_actions: Vec::new(),
            denied_actions: Vec::new(),
            transforms: BTreeMap::new(),
        };
    }

    let n = proposal.actions.len();
    if n > policy.max_actions_per_proposal as usize {
        reasons.push(format!("{}:{}", REASON_MAX_ACTIONS, n));
    }
    if n > state.budget_actions_remaining as usize {
        reasons.push(format!("{}:{}", REASON_BUDGET_ACTIONS, n));
    }
    if state.mode == Mode::Panic && n > 1 {
        reasons.push(REASON_PANIC_SINGLE.to_string());
    }

    let mut action_ok = vec![true; n];
    let mut kind_counts: BTreeMap<ActionKind, u32> = BTreeMap::new();
    let mut cumulative_write_bytes: u64 = 0;

    for (i, action) in proposal.actions.iter().enumerate() {
        let kind = action.kind();
        let env = envelopes.spec(kind);
        let mut fail = |reason: String, reasons: &mut Vec<String>| {
            reasons.push(reason);
            action_ok[i] = false;
        };

        let count = kind_counts.entry(kind).or_insert(0);
        *count += 1;
        if *count > env.rate_limit_per_min {
            fail(
                format!("{}:{}", REASON_RATE_LIMIT, kind.as_str()),
                &mut reasons,
            );
            continue;
        }

        // Reflexive lockdown denies capability kinds outright, whatever
        // the policy grants.
        if state.mode == Mode::Panic && (kind.is_shell() || kind.is_network()) {
            fail(
                format!("{}:{}", REASON_PANIC_CAPABILITY, kind.as_str()),
                &mut reasons,
            );
            continue;
        }

        match action {
            Action::ReadFile { path } => {
                if confine_path(&state.workspace_root, path).is_err() {
                    fail(
                        format!("{}:{}", REASON_PATH_OUT_OF_BOUNDS, path),
                        &mut reasons,
                    );
                } else if !under_path_roots(path, &env.path_roots) {
                    fail(format!("{}:{}", REASON_PATH_ROOT, path), &mut reasons);
                }
            }
            Action::WriteFile { path, text } => {
                if confine_path(&state.workspace_root, path).is_err() {
                    fail(
                        format!("{}:{}", REASON_PATH_OUT_OF_BOUNDS, path),
                        &mut reasons,
                    );
                    continue;
                }
                if !under_path_roots(path, &env.path_roots) {
                    fail(format!("{}:{}", REASON_PATH_ROOT, path), &mut reasons);
                    continue;
                }
                let bytes = text.len() as u64;
                let per_file_cap = policy.max_write_bytes.min(env.max_bytes);
                // Per-file violation fails fast; the cumulative total only
                // accumulates writes that passed the per-file cap.
                if bytes > per_file_cap {
                    fail(
                        format!("{}:{}", REASON_WRITE_TOO_LARGE, path),
                        &mut reasons,
                    );
                    continue;
                }
                cumulative_write_bytes += bytes;
                if cumulative_write_bytes > policy.max_total_write_bytes {
                    fail(
                        format!("{}:{}", REASON_CUMULATIVE_WRITE_CAP, cumulative_write_bytes),
                        &mut reasons,
                    );
                }
            }
            Action::ApplyPatch { patch } => match parse_unified_diff(patch) {
                Err(e) => {
                    fail(format!("{}:{}", REASON_PATCH_INVALID, e), &mut reasons);
                }
                Ok(files) => {
                    if let Err(e) = confine_diff(&state.workspace_root, patch) {
                        fail(format!("{}:{}", REASON_PATCH_OUT_OF_BOUNDS, e), &mut reasons);
                        continue;
                    }
                    let changed = changed_line_count(&files);
                    if env.max_lines_changed > 0 && changed > u64::from(env.max_lines_changed) {
                        fail(format!("{}:{}", REASON_PATCH_TOO_LARGE, changed), &mut reasons);
                    }
                }
            },
            Action::RunTests { argv, .. } => {
                let prefix = policy
                    .test_command_allowlist
                    .iter()
                    .filter(|prefix| argv.len() >= prefix.len() && argv[..prefix.len()] == prefix[..])
                    .max_by_key(|prefix| prefix.len());
                let Some(prefix) = prefix else {
                    let argv0 = argv.first().map(String::as_str).unwrap_or("<empty>");
                    fail(format!("{}:{}", REASON_TEST_COMMAND, argv0), &mut reasons);
                    continue;
                };
                for token in &argv[prefix.len()..] {
                    if !safe_test_token_re().is_match(token) {
                        fail(format!("{}:{}", REASON_TEST_TOKEN, token), &mut reasons);
                        continue;
                    }
                    if token_names_file(token) {
                        let file_part = token.split("::").next().unwrap_or(token);
                        if confine_path(&state.workspace_root, file_part).is_err() {
                            fail(format!("{}:{}", REASON_TEST_PATH, token), &mut reasons);
                        }
                    }
                }
            }
            Action::Grep { pattern, path } => {
                if pattern.len() > policy.max_pattern_len {
                    fail(
                        format!("{}:{}", REASON_PATTERN_TOO_LONG, pattern.len()),
                        &mut reasons,
                    );
                    continue;
                }
                if pattern_is_catastrophic(pattern) {
                    fail(
                        format!("{}:{}", REASON_PATTERN_CATASTROPHIC, pattern),
                        &mut reasons,
                    );
                    continue;
                }
                if let Some(path) = path {
                    if confine_path(&state.workspace_root, path).is_err() {
                        fail(
                            format!("{}:{}", REASON_PATH_OUT_OF_BOUNDS, path),
                            &mut reasons,
                        );
                    }
                }
            }
            Action::ShellExec { .. } => {
                // Capability grant only; the command text is never
                // inspected here.
                if policy.deny_shell || !env.allow_shell {
                    fail(REASON_SHELL_DENIED.to_string(), &mut reasons);
                }
            }
            Action::WebSearch { .. } | Action::Delegate { .. } => {
                if policy.deny_network || !env.allow_network {
                    fail(
                        format!("{}:{}", REASON_NETWORK_DENIED, kind.as_str()),
                        &mut reasons,
                    );
                }
            }
            Action::BrowseUrl { url } => {
                if policy.deny_network || !env.allow_network {
                    fail(
                        format!("{}:{}", REASON_NETWORK_DENIED, kind.as_str()),
                        &mut reasons,
                    );
                    continue;
                }
                if !env.domain_allowlist.is_empty() {
                    let host = url_host(url);
                    if !env.domain_allowlist.iter().any(|d| host == *d) {
                        fail(format!("{}:{}", REASON_DOMAIN, host), &mut reasons);
                    }
                }
            }
            Action::Remember { .. } | Action::Recall { .. } => {}
        }
    }

    check_ordering(proposal, &mut reasons);

    let status = if reasons.is_empty() {
        DecisionStatus::Allow
    } else {
        DecisionStatus::Deny
    };
    let mut approved_actions = Vec::new();
    let mut denied_actions = Vec::new();
    for (action, ok) in proposal.actions.iter().zip(&action_ok) {
        if *ok && status == DecisionStatus::Allow {
            approved_actions.push(action.clone());
        } else {
            denied_actions.push(action.clone());
        }
    }

    Decision {
        status,
        reasons,
        approved_actions,
        denied_actions,
        transforms: BTreeMap::new(),
    }
}

/// Ordering rules: a write/patch of path P needs an earlier READ_FILE of
/// P in the same proposal, and any write/patch needs a later RUN_TESTS.
fn check_ordering(proposal: &Proposal, reasons: &mut Vec<String>) {
    let mut read_paths: BTreeSet<String> = BTreeSet::new();
    let mut last_write_idx: Option<usize> = None;
    let mut last_test_idx: Option<usize> = None;

    for (i, action) in proposal.actions.iter().enumerate() {
        match action {
            Action::ReadFile { path } => {
                read_paths.insert(normalized_or_raw(path));
            }
            Action::WriteFile { path, .. } => {
                if !read_paths.contains(&normalized_or_raw(path)) {
                    reasons.push(format!("{}:{}", REASON_ORDER_WRITE_WITHOUT_READ, path));
                }
                last_write_idx = Some(i);
            }
            Action::ApplyPatch { patch } => {
                if let Ok(files) = parse_unified_diff(patch) {
                    for file in &files {
                        if let Some(target) = file.target_path() {
                            if !read_paths.contains(&normalized_or_raw(target)) {
                                reasons
                                    .push(format!("{}:{}", REASON_ORDER_WRITE_WITHOUT_READ, target));
                            }
                        }
                    }
                }
                last_write_idx = Some(i);
            }
            Action::RunTests { .. } => {
                last_test_idx = Some(i);
            }
            _ => {}
        }
    }

    if let Some(write_idx) = last_write_idx {
        let verified = matches!(last_test_idx, Some(test_idx) if test_idx > write_idx);
        if !verified {
            reasons.push(REASON_ORDER_WRITE_WITHOUT_TEST.to_string());
        }
    }
}

fn normalized_or_raw(path: &str) -> String {
    crate::confine::normalize_rel(path)
        .map(|parts| parts.join("/"))
        .unwrap_or_else(|_| path.to_string())
}

fn token_names_file(token: &str) -> bool {
    let file_part = token.split("::").next().unwrap_or(token);
    file_part.contains('/') || file_part.contains('.')
}

/// Host portion of a URL, without scheme, userinfo, port, or path.
fn url_host(url: &str) -> String {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = authority.rsplit('@').next().unwrap_or(authority);
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

/// Scan a pattern for nested unbounded quantifiers, the construct behind
/// catastrophic backtracking (`(a+)+`, `(a*)*`, `(a+){2,}` and friends).
pub fn pattern_is_catastrophic(pattern: &str) -> bool {
    // Each stack frame tracks whether its group saw an unbounded
    // quantifier at any depth.
    let mut stack: Vec<bool> = Vec::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '(' => stack.push(false),
            ')' => {
                let inner_quantified = stack.pop().unwrap_or(false);
                let group_quantified = matches!(chars.peek(), Some(&('*' | '+' | '{')));
                if inner_quantified && group_quantified {
                    return true;
                }
                if inner_quantified {
                    if let Some(outer) = stack.last_mut() {
                        *outer = true;
                    }
                }
            }
            '*' | '+' => {
                if let Some(frame) = stack.last_mut() {
                    *frame = true;
                }
            }
            '{' => {
                // `{n,}` with no upper bound counts as unbounded.
                let mut body = String::new();
                for next in chars.by_ref() {
                    if next == '}' {
                        break;
                    }
                    body.push(next);
                }
                if body.ends_with(',') {
                    if let Some(frame) = stack.last_mut() {
                        *frame = true;
                    }
                }
            }
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catastrophic_patterns_are_flagged() {
        assert!(pattern_is_catastrophic("(a+)+"));
        assert!(pattern_is_catastrophic("(a*)*"));
        assert!(pattern_is_catastrophic("((ab)+c*)+"));
        assert!(pattern_is_catastrophic("(x{2,})+"));
    }

    #[test]
    fn ordinary_patterns_pass() {
        assert!(!pattern_is_catastrophic("fn [a-z_]+\\("));
        assert!(!pattern_is_catastrophic("error: .*"));
        assert!(!pattern_is_catastrophic("(abc)+def"));
        assert!(!pattern_is_catastrophic("\\(a+\\)+"));
    }

    #[test]
    fn url_host_extraction() {
        assert_eq!(url_host("https://docs.rs/regex/latest"), "docs.rs");
        assert_eq!(url_host("http://user@internal:8080/x"), "internal");
        assert_eq!(url_host("crates.io/api"), "crates.io");
    }
}

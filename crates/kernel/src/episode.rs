//! Episode orchestration: gate -> controller -> ledger -> reward, once
//! (single-phase) or twice (two-phase probe-then-remediate).

use crate::action::{Action, Proposal};
use crate::confine::confine_path;
use crate::controller::{execute, ControllerError, ExternalActions};
use crate::diff::parse_unified_diff;
use crate::envelope::EnvelopeRegistry;
use crate::gate::gate;
use crate::policy::GatePolicy;
use crate::state::{Decision, DecisionStatus, ExecResult, StateSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;
use warden_ledger::{LedgerAppender, LedgerError};

/// Reward shaping: base when the verifying test run failed, and the
/// ceiling on the monotonic time penalty.
const REWARD_BASE_TESTS_FAILED: f64 = 0.25;
const TIME_PENALTY_CEILING: f64 = 0.2;
const TIME_PENALTY_PER_MS: f64 = 0.2 / 60_000.0;

const DEFAULT_MAX_CANDIDATES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum EpisodeError {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("controller: {0}")]
    Controller(#[from] ControllerError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-entry metadata committed alongside state/proposal/decision/results.
/// Carrying the policy here is what lets the replay verifier re-run the
/// gate from the ledger alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeMeta {
    pub episode_id: String,
    pub phase: u8,
    pub arm_id: Option<String>,
    pub policy: GatePolicy,
    pub reward: f64,
    pub tests_passed: bool,
    pub wall_ms: u64,
}

#[derive(Debug, Clone)]
pub struct EpisodeReport {
    pub episode_id: String,
    pub phase_count: u8,
    pub decision_status: DecisionStatus,
    pub tests_passed: bool,
    pub reward: f64,
    pub wall_ms: u64,
    pub entry_hashes: Vec<String>,
}

/// Inputs for a two-phase episode: the probe command, an optional prior
/// trace artifact to read first, and an optional remediation patch the
/// caller supplies for phase 2.
#[derive(Debug, Clone)]
pub struct TwoPhaseProbe {
    pub test_argv: Vec<String>,
    pub trace_artifact: Option<String>,
    pub remediation_patch: Option<String>,
    pub max_candidates: usize,
    pub arm_id: Option<String>,
}

impl TwoPhaseProbe {
    pub fn new(test_argv: Vec<String>) -> Self {
        Self {
            test_argv,
            trace_artifact: None,
            remediation_patch: None,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            arm_id: None,
        }
    }
}

/// Bounded reward in [0, 1]: zero on denial, else a base scaled by the
/// verifying test result minus a capped monotonic time penalty.
pub fn compute_reward(status: DecisionStatus, tests_passed: bool, wall_ms: u64) -> f64 {
    if status == DecisionStatus::Deny {
        return 0.0;
    }
    let base = if tests_passed {
        1.0
    } else {
        REWARD_BASE_TESTS_FAILED
    };
    let penalty = (wall_ms as f64 * TIME_PENALTY_PER_MS).min(TIME_PENALTY_CEILING);
    (base - penalty).clamp(0.0, 1.0)
}

fn tests_passed_in(results: &[ExecResult]) -> bool {
    let mut saw_test = false;
    let mut all_ok = true;
    for result in results {
        if matches!(result.action, Action::RunTests { .. }) {
            saw_test = true;
            all_ok &= result.ok;
        }
    }
    saw_test && all_ok
}

fn wall_ms_of(results: &[ExecResult]) -> u64 {
    results.iter().map(|r| r.duration_ms).sum()
}

fn append_entry(
    ledger: &mut LedgerAppender,
    state: &StateSnapshot,
    proposal: &Proposal,
    decision: &Decision,
    results: &[ExecResult],
    meta: &EpisodeMeta,
) -> Result<String, EpisodeError> {
    let payload = serde_json::json!({
        "state": state,
        "proposal": proposal,
        "decision": decision,
        "results": results,
        "meta": meta,
    });
    let entry = ledger.append(payload)?;
    Ok(entry.entry_hash)
}

/// Run one gated proposal to completion and ledger it.
pub fn run_episode(
    state: &StateSnapshot,
    proposal: &Proposal,
    policy: &GatePolicy,
    envelopes: &EnvelopeRegistry,
    ledger: &mut LedgerAppender,
    externals: &mut dyn ExternalActions,
    arm_id: Option<String>,
) -> Result<EpisodeReport, EpisodeError> {
    let episode_id = Uuid::new_v4().to_string();
    let decision = gate(state, proposal, policy, envelopes);
    debug!(
        episode = %episode_id,
        status = decision.status.as_str(),
        reasons = decision.reasons.len(),
        "gate decided"
    );

    let results = if decision.is_allow() {
        execute(state, &decision, envelopes, externals)?
    } else {
        Vec::new()
    };
    let tests_passed = tests_passed_in(&results);
    let wall_ms = wall_ms_of(&results);
    let reward = compute_reward(decision.status, tests_passed, wall_ms);

    let meta = EpisodeMeta {
        episode_id: episode_id.clone(),
        phase: 1,
        arm_id,
        policy: policy.clone(),
        reward,
        tests_passed,
        wall_ms,
    };
    let entry_hash = append_entry(ledger, state, proposal, &decision, &results, &meta)?;
    info!(episode = %episode_id, reward, "episode committed");

    Ok(EpisodeReport {
        episode_id,
        phase_count: 1,
        decision_status: decision.status,
        tests_passed,
        reward,
        wall_ms,
        entry_hashes: vec![entry_hash],
    })
}

/// Deterministically extract candidate file paths from a failure trace:
/// path-shaped tokens, frequency-ranked, workspace-confined, ties broken
/// by path string.
pub fn extract_trace_candidates(
    workspace_root: &std::path::Path,
    trace: &str,
    max_candidates: usize,
) -> Vec<String> {
    use std::collections::BTreeMap;

    let token_re = path_token_re();
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for capture in token_re.find_iter(trace) {
        let raw = capture.as_str().trim_start_matches("./");
        let Ok(abs) = confine_path(workspace_root, raw) else {
            continue;
        };
        if !abs.is_file() {
            continue;
        }
        *counts.entry(raw.to_string()).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    // Highest count first; BTreeMap order already breaks count ties by
    // path string.
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(max_candidates)
        .map(|(path, _)| path)
        .collect()
}

fn path_token_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(
            r"[A-Za-z0-9_][A-Za-z0-9_./-]*\.(?:py|rs|js|ts|go|java|c|cc|cpp|h|hpp|rb|toml|json|yaml|yml|txt)",
        )
        .unwrap()
    })
}

/// Probe-then-remediate: run the tests, and when they fail, read the
/// files the trace implicates, optionally apply the caller's patch, and
/// run the tests again -- each phase gated, executed, and ledgered on its
/// own budget.
pub fn run_two_phase_episode(
    state: &StateSnapshot,
    policy: &GatePolicy,
    envelopes: &EnvelopeRegistry,
    ledger: &mut LedgerAppender,
    externals: &mut dyn ExternalActions,
    probe: &TwoPhaseProbe,
) -> Result<EpisodeReport, EpisodeError> {
    let episode_id = Uuid::new_v4().to_string();

    // Phase 1: probe.
    let mut phase1_actions = Vec::new();
    if let Some(artifact) = &probe.trace_artifact {
        phase1_actions.push(Action::ReadFile {
            path: artifact.clone(),
        });
    }
    phase1_actions.push(Action::RunTests {
        argv: probe.test_argv.clone(),
        mode: None,
    });
    let phase1_proposal = Proposal::new(phase1_actions, "probe: run the verifying tests");

    let phase1_decision = gate(state, &phase1_proposal, policy, envelopes);
    let phase1_results = if phase1_decision.is_allow() {
        execute(state, &phase1_decision, envelopes, externals)?
    } else {
        Vec::new()
    };
    let phase1_passed = tests_passed_in(&phase1_results);
    let phase1_wall = wall_ms_of(&phase1_results);

    // A passing probe ends the episode with full reward.
    let phase1_reward = if phase1_decision.is_allow() && phase1_passed {
        1.0
    } else {
        compute_reward(phase1_decision.status, phase1_passed, phase1_wall)
    };
    let phase1_meta = EpisodeMeta {
        episode_id: episode_id.clone(),
        phase: 1,
        arm_id: probe.arm_id.clone(),
        policy: policy.clone(),
        reward: phase1_reward,
        tests_passed: phase1_passed,
        wall_ms: phase1_wall,
    };
    let phase1_hash = append_entry(
        ledger,
        state,
        &phase1_proposal,
        &phase1_decision,
        &phase1_results,
        &phase1_meta,
    )?;

    if !phase1_decision.is_allow() || phase1_passed {
        return Ok(EpisodeReport {
            episode_id,
            phase_count: 1,
            decision_status: phase1_decision.status,
            tests_passed: phase1_passed,
            reward: phase1_reward,
            wall_ms: phase1_wall,
            entry_hashes: vec![phase1_hash],
        });
    }

    // Phase 2: trace-directed remediation, on what is left of the budget.
    let mut trace = String::new();
    for result in &phase1_results {
        trace.push_str(&result.stdout);
        trace.push('\n');
        trace.push_str(&result.stderr);
        trace.push('\n');
    }
    let candidates =
        extract_trace_candidates(&state.workspace_root, &trace, probe.max_candidates);
    info!(episode = %episode_id, candidates = candidates.len(), "phase 2 candidates");

    let mut phase2_actions: Vec<Action> = candidates
        .iter()
        .map(|path| Action::ReadFile { path: path.clone() })
        .collect();
    if let Some(patch) = &probe.remediation_patch {
        // The patch is applied only when every target is among the read
        // candidates; an invented target never ships.
        let targets_known = parse_unified_diff(patch).is_ok_and(|files| {
            files.iter().all(|file| {
                file.target_path()
                    .map(|t| candidates.iter().any(|c| c == t))
                    .unwrap_or(false)
            })
        });
        if targets_known {
            phase2_actions.push(Action::ApplyPatch {
                patch: patch.clone(),
            });
        } else {
            debug!(episode = %episode_id, "remediation patch skipped: target not among candidates");
        }
    }
    phase2_actions.push(Action::RunTests {
        argv: probe.test_argv.clone(),
        mode: None,
    });
    let phase2_proposal = Proposal::new(
        phase2_actions,
        "remediate: read implicated files, patch, re-run tests",
    );

    let mut phase2_state = state.clone();
    phase2_state.step += 1;
    phase2_state.budget_actions_remaining = state
        .budget_actions_remaining
        .saturating_sub(phase1_proposal.actions.len() as u32);
    phase2_state.budget_wall_ms_remaining =
        state.budget_wall_ms_remaining.saturating_sub(phase1_wall);

    let phase2_decision = gate(&phase2_state, &phase2_proposal, policy, envelopes);
    let phase2_results = if phase2_decision.is_allow() {
        execute(&phase2_state, &phase2_decision, envelopes, externals)?
    } else {
        Vec::new()
    };
    let phase2_passed = tests_passed_in(&phase2_results);
    let phase2_wall = wall_ms_of(&phase2_results);
    let total_wall = phase1_wall + phase2_wall;
    let reward = compute_reward(phase2_decision.status, phase2_passed, total_wall);

    let phase2_meta = EpisodeMeta {
        episode_id: episode_id.clone(),
        phase: 2,
        arm_id: probe.arm_id.clone(),
        policy: policy.clone(),
        reward,
        tests_passed: phase2_passed,
        wall_ms: total_wall,
    };
    let phase2_hash = append_entry(
        ledger,
        &phase2_state,
        &phase2_proposal,
        &phase2_decision,
        &phase2_results,
        &phase2_meta,
    )?;

    Ok(EpisodeReport {
        episode_id,
        phase_count: 2,
        decision_status: phase2_decision.status,
        tests_passed: phase2_passed,
        reward,
        wall_ms: total_wall,
        entry_hashes: vec![phase1_hash, phase2_hash],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_is_zero_on_deny() {
        assert_eq!(compute_reward(DecisionStatus::Deny, true, 0), 0.0);
    }

    #[test]
    fn reward_penalizes_time_monotonically_with_ceiling() {
        let fast = compute_reward(DecisionStatus::Allow, true, 1_000);
        let slow = compute_reward(DecisionStatus::Allow, true, 30_000);
        let slowest = compute_reward(DecisionStatus::Allow, true, 10_000_000);
        assert!(fast > slow);
        assert!(slow > slowest);
        assert!((slowest - (1.0 - TIME_PENALTY_CEILING)).abs() < 1e-9);
    }

    #[test]
    fn reward_stays_in_unit_interval() {
        for wall_ms in [0u64, 100, 60_000, 10_000_000] {
            for passed in [true, false] {
                let r = compute_reward(DecisionStatus::Allow, passed, wall_ms);
                assert!((0.0..=1.0).contains(&r));
            }
        }
    }

    #[test]
    fn trace_candidates_rank_by_frequency_then_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.py"), "x").unwrap();
        std::fs::write(dir.path().join("g.py"), "x").unwrap();
        let trace = "\
Traceback (most recent call last):
  File \"f.py\", line 10, in run
  File \"g.py\", line 4, in helper
  File \"f.py\", line 12, in run
error in f.py
";
        let candidates = extract_trace_candidates(dir.path(), trace, 5);
        assert_eq!(candidates, vec!["f.py".to_string(), "g.py".to_string()]);
    }

    #[test]
    fn trace_candidates_are_workspace_confined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inside.py"), "x").unwrap();
        let trace = "inside.py failed\n/etc/passwd.py also mentioned\nmissing.py not on disk\n";
        let candidates = extract_trace_candidates(dir.path(), trace, 5);
        assert_eq!(candidates, vec!["inside.py".to_string()]);
    }
}

//! Snapshot, decision, and execution-result types that flow through the
//! gate -> controller -> ledger pipeline.

use crate::action::Action;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    /// Reflexive lockdown: one action per proposal, no shell, no network.
    Panic,
}

/// Everything the gate may know about the world besides the proposal and
/// the policy. Never carries live state the ledger does not also capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub task_id: String,
    pub workspace_root: PathBuf,
    pub step: u64,
    pub budget_actions_remaining: u32,
    pub budget_wall_ms_remaining: u64,
    pub mode: Mode,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Allow,
    Deny,
}

impl DecisionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionStatus::Allow => "allow",
            DecisionStatus::Deny => "deny",
        }
    }
}

/// Output of the gate. A pure function of (state, proposal, policy,
/// envelope registry); identical inputs always produce an identical value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub status: DecisionStatus,
    pub reasons: Vec<String>,
    pub approved_actions: Vec<Action>,
    pub denied_actions: Vec<Action>,
    #[serde(default)]
    pub transforms: BTreeMap<String, String>,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        self.status == DecisionStatus::Allow
    }

    /// Denial for input that failed to decode at the boundary. Recorded as
    /// data; adversarial proposals never crash the gate.
    pub fn denied_malformed(reason: impl Into<String>) -> Self {
        Self {
            status: DecisionStatus::Deny,
            reasons: vec![reason.into()],
            approved_actions: Vec::new(),
            denied_actions: Vec::new(),
            transforms: BTreeMap::new(),
        }
    }
}

/// Outcome of executing one approved action. Failures are data, not
/// errors; the episode continues and ledgers them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub action: Action,
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

impl ExecResult {
    pub fn failed(action: Action, stderr: impl Into<String>) -> Self {
        Self {
            action,
            ok: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: None,
            duration_ms: 0,
            artifacts: BTreeMap::new(),
        }
    }
}

//! Static per-action-kind capability and resource ceilings.
//!
//! The registry is an explicit service object passed by reference through
//! the orchestrator; there is no global instance.

use crate::action::ActionKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EnvelopeSpec {
    /// Hard wall-clock timeout the controller enforces per action.
    pub max_wall_ms: u64,
    pub allow_network: bool,
    pub allow_shell: bool,
    /// Relative roots inside the workspace this kind may touch; `.` means
    /// the whole workspace.
    pub path_roots: Vec<String>,
    /// Byte ceiling for payloads and captured output.
    pub max_bytes: u64,
    /// Total added-plus-deleted line ceiling for APPLY_PATCH.
    pub max_lines_changed: u32,
    /// Deterministic per-proposal ceiling on actions of this kind.
    pub rate_limit_per_min: u32,
    /// Hosts BROWSE_URL may reach; empty means any (when network is
    /// granted at all).
    pub domain_allowlist: Vec<String>,
}

impl Default for EnvelopeSpec {
    fn default() -> Self {
        Self {
            max_wall_ms: 10_000,
            allow_network: false,
            allow_shell: false,
            path_roots: vec![".".to_string()],
            max_bytes: 1024 * 1024,
            max_lines_changed: 0,
            rate_limit_per_min: 60,
            domain_allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeRegistry {
    specs: BTreeMap<ActionKind, EnvelopeSpec>,
}

impl EnvelopeRegistry {
    /// The built-in envelope table.
    pub fn builtin() -> Self {
        let mut specs = BTreeMap::new();
        specs.insert(
            ActionKind::ReadFile,
            EnvelopeSpec {
                max_wall_ms: 2_000,
                rate_limit_per_min: 120,
                ..EnvelopeSpec::default()
            },
        );
        specs.insert(
            ActionKind::WriteFile,
            EnvelopeSpec {
                max_wall_ms: 5_000,
                max_bytes: 256 * 1024,
                rate_limit_per_min: 30,
                ..EnvelopeSpec::default()
            },
        );
        specs.insert(
            ActionKind::ApplyPatch,
            EnvelopeSpec {
                max_wall_ms: 5_000,
                max_lines_changed: 2_000,
                rate_limit_per_min: 10,
                ..EnvelopeSpec::default()
            },
        );
        specs.insert(
            ActionKind::RunTests,
            EnvelopeSpec {
                max_wall_ms: 120_000,
                rate_limit_per_min: 10,
                ..EnvelopeSpec::default()
            },
        );
        specs.insert(
            ActionKind::Grep,
            EnvelopeSpec {
                max_wall_ms: 10_000,
                rate_limit_per_min: 30,
                ..EnvelopeSpec::default()
            },
        );
        specs.insert(
            ActionKind::ShellExec,
            EnvelopeSpec {
                max_wall_ms: 30_000,
                allow_shell: true,
                rate_limit_per_min: 10,
                ..EnvelopeSpec::default()
            },
        );
        specs.insert(
            ActionKind::WebSearch,
            EnvelopeSpec {
                max_wall_ms: 15_000,
                allow_network: true,
                rate_limit_per_min: 10,
                ..EnvelopeSpec::default()
            },
        );
        specs.insert(
            ActionKind::BrowseUrl,
            EnvelopeSpec {
                max_wall_ms: 15_000,
                allow_network: true,
                rate_limit_per_min: 10,
                ..EnvelopeSpec::default()
            },
        );
        specs.insert(
            ActionKind::Remember,
            EnvelopeSpec {
                max_wall_ms: 2_000,
                max_bytes: 64 * 1024,
                rate_limit_per_min: 30,
                ..EnvelopeSpec::default()
            },
        );
        specs.insert(
            ActionKind::Recall,
            EnvelopeSpec {
                max_wall_ms: 2_000,
                max_bytes: 64 * 1024,
                rate_limit_per_min: 30,
                ..EnvelopeSpec::default()
            },
        );
        specs.insert(
            ActionKind::Delegate,
            EnvelopeSpec {
                max_wall_ms: 60_000,
                allow_network: true,
                rate_limit_per_min: 5,
                ..EnvelopeSpec::default()
            },
        );
        Self { specs }
    }

    /// Replace the spec for one kind (test and tuning hook).
    pub fn with_spec(mut self, kind: ActionKind, spec: EnvelopeSpec) -> Self {
        self.specs.insert(kind, spec);
        self
    }

    pub fn spec(&self, kind: ActionKind) -> EnvelopeSpec {
        self.specs.get(&kind).cloned().unwrap_or_default()
    }
}

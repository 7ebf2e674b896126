//! Gate policy and strategy-arm definitions.
//!
//! The policy is an explicit versioned document: named fields, serde
//! defaults, a `schema` string checked on load. Nothing is looked up by
//! string key at runtime.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const GATE_POLICY_SCHEMA: &str = "warden.gate_policy.v1";

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("policy_invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct GatePolicy {
    pub schema: String,
    pub max_actions_per_proposal: u32,
    /// Per-file byte cap for WRITE_FILE content.
    pub max_write_bytes: u64,
    /// Running-total byte cap across all writes in one proposal.
    pub max_total_write_bytes: u64,
    /// Length cap for pattern-bearing actions (GREP).
    pub max_pattern_len: usize,
    pub deny_shell: bool,
    pub deny_network: bool,
    /// Fixed argv prefixes a RUN_TESTS command must extend.
    pub test_command_allowlist: Vec<Vec<String>>,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            schema: GATE_POLICY_SCHEMA.to_string(),
            max_actions_per_proposal: 20,
            max_write_bytes: 256 * 1024,
            max_total_write_bytes: 1024 * 1024,
            max_pattern_len: 256,
            deny_shell: true,
            deny_network: true,
            test_command_allowlist: vec![
                vec!["pytest".to_string()],
                vec!["python".to_string(), "-m".to_string(), "pytest".to_string()],
                vec!["cargo".to_string(), "test".to_string()],
                vec!["go".to_string(), "test".to_string()],
                vec!["npm".to_string(), "test".to_string()],
            ],
        }
    }
}

/// Load a policy document, falling back to defaults when the file is
/// absent. A present-but-wrong document is an error, never a silent
/// default.
pub fn load_policy(path: &Path) -> Result<GatePolicy, PolicyError> {
    if !path.exists() {
        return Ok(GatePolicy::default());
    }
    let bytes = fs::read(path)?;
    let policy: GatePolicy =
        serde_json::from_slice(&bytes).map_err(|e| PolicyError::Invalid(e.to_string()))?;
    if policy.schema != GATE_POLICY_SCHEMA {
        return Err(PolicyError::Invalid(format!(
            "schema {} is not {}",
            policy.schema, GATE_POLICY_SCHEMA
        )));
    }
    Ok(policy)
}

/// One named bundle of execution-strategy knobs the bandit selects
/// between. Immutable once defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PolicyArm {
    pub arm_id: String,
    pub context_policy: String,
    pub patch_policy: String,
    pub model_policy: String,
    pub max_actions: u32,
    pub max_wall_ms: u64,
}

/// Built-in strategy arms for the episode runner.
pub fn default_arms() -> Vec<PolicyArm> {
    vec![
        PolicyArm {
            arm_id: "probe-first".to_string(),
            context_policy: "trace".to_string(),
            patch_policy: "conservative".to_string(),
            model_policy: "default".to_string(),
            max_actions: 12,
            max_wall_ms: 120_000,
        },
        PolicyArm {
            arm_id: "read-heavy".to_string(),
            context_policy: "wide".to_string(),
            patch_policy: "conservative".to_string(),
            model_policy: "default".to_string(),
            max_actions: 20,
            max_wall_ms: 180_000,
        },
        PolicyArm {
            arm_id: "patch-direct".to_string(),
            context_policy: "narrow".to_string(),
            patch_policy: "eager".to_string(),
            model_policy: "default".to_string(),
            max_actions: 8,
            max_wall_ms: 90_000,
        },
    ]
}

//! The action vocabulary consumed from the upstream proposer.
//!
//! Wire form is `{ "name": "READ_FILE", "args": { ... } }`. Inside the
//! crate an action is a closed enum: an unknown kind can only exist at the
//! deserialization boundary, where it maps to a [`DecodeError`] that the
//! caller records as a denial.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        text: String,
    },
    ApplyPatch {
        patch: String,
    },
    RunTests {
        argv: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
    },
    Grep {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    ShellExec {
        command: String,
    },
    WebSearch {
        query: String,
    },
    BrowseUrl {
        url: String,
    },
    Remember {
        content: String,
    },
    Recall {
        query: String,
    },
    Delegate {
        task: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    ReadFile,
    WriteFile,
    ApplyPatch,
    RunTests,
    Grep,
    ShellExec,
    WebSearch,
    BrowseUrl,
    Remember,
    Recall,
    Delegate,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::ReadFile => "READ_FILE",
            ActionKind::WriteFile => "WRITE_FILE",
            ActionKind::ApplyPatch => "APPLY_PATCH",
            ActionKind::RunTests => "RUN_TESTS",
            ActionKind::Grep => "GREP",
            ActionKind::ShellExec => "SHELL_EXEC",
            ActionKind::WebSearch => "WEB_SEARCH",
            ActionKind::BrowseUrl => "BROWSE_URL",
            ActionKind::Remember => "REMEMBER",
            ActionKind::Recall => "RECALL",
            ActionKind::Delegate => "DELEGATE",
        }
    }

    /// Kinds that reach the network and are granted by capability only.
    pub fn is_network(self) -> bool {
        matches!(
            self,
            ActionKind::WebSearch | ActionKind::BrowseUrl | ActionKind::Delegate
        )
    }

    pub fn is_shell(self) -> bool {
        matches!(self, ActionKind::ShellExec)
    }

    /// Kinds that mutate the workspace.
    pub fn is_write(self) -> bool {
        matches!(self, ActionKind::WriteFile | ActionKind::ApplyPatch)
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::ReadFile { .. } => ActionKind::ReadFile,
            Action::WriteFile { .. } => ActionKind::WriteFile,
            Action::ApplyPatch { .. } => ActionKind::ApplyPatch,
            Action::RunTests { .. } => ActionKind::RunTests,
            Action::Grep { .. } => ActionKind::Grep,
            Action::ShellExec { .. } => ActionKind::ShellExec,
            Action::WebSearch { .. } => ActionKind::WebSearch,
            Action::BrowseUrl { .. } => ActionKind::BrowseUrl,
            Action::Remember { .. } => ActionKind::Remember,
            Action::Recall { .. } => ActionKind::Recall,
            Action::Delegate { .. } => ActionKind::Delegate,
        }
    }
}

/// An ordered bundle of actions from the untrusted proposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub actions: Vec<Action>,
    pub rationale: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Proposal {
    pub fn new(actions: Vec<Action>, rationale: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            actions,
            rationale: rationale.into(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown_action:{name}")]
    UnknownAction { name: String },
    #[error("malformed_proposal:{detail}")]
    Malformed { detail: String },
}

const KNOWN_ACTION_NAMES: &[&str] = &[
    "READ_FILE",
    "WRITE_FILE",
    "APPLY_PATCH",
    "RUN_TESTS",
    "GREP",
    "SHELL_EXEC",
    "WEB_SEARCH",
    "BROWSE_URL",
    "REMEMBER",
    "RECALL",
    "DELEGATE",
];

/// Decode a proposal from untrusted JSON.
///
/// Unknown action kinds are reported by name so the resulting denial says
/// what was actually proposed; every other shape problem degrades to a
/// `malformed_proposal` detail. This is the only place an unknown kind is
/// representable.
pub fn decode_proposal(value: &serde_json::Value) -> Result<Proposal, DecodeError> {
    if let Some(actions) = value.get("actions").and_then(|v| v.as_array()) {
        for action in actions {
            if let Some(name) = action.get("name").and_then(|v| v.as_str()) {
                if !KNOWN_ACTION_NAMES.contains(&name) {
                    return Err(DecodeError::UnknownAction {
                        name: name.to_string(),
                    });
                }
            }
        }
    }
    serde_json::from_value(value.clone()).map_err(|e| DecodeError::Malformed {
        detail: e.to_string(),
    })
}

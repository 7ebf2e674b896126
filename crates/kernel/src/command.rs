//! Argument structs for the `warden` CLI commands.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RunArgs {
    pub workspace_root: PathBuf,
    pub task_id: String,
    pub ledger_path: PathBuf,
    pub episodes: u64,
    /// Pin every episode to one strategy arm instead of letting the
    /// bandit choose.
    pub arm_override: Option<String>,
    pub outcomes_path: Option<PathBuf>,
    pub policy_path: Option<PathBuf>,
    /// Test command override; defaults to the first allowlisted prefix.
    pub test_argv: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ReplayArgs {
    pub ledger_path: PathBuf,
}

#[derive(Debug)]
pub enum Command {
    Run(RunArgs),
    Replay(ReplayArgs),
}

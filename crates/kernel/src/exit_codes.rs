//! Stable exit codes for the `warden` CLI.

/// Command succeeded; replay verification passed.
pub const OK: i32 = 0;
/// Usage error or any non-verification failure.
pub const INVALID: i32 = 1;
/// Replay found a broken hash chain.
pub const CHAIN_FAILURE: i32 = 2;
/// Replay found a non-deterministic or mismatched gate decision.
pub const DETERMINISM_FAILURE: i32 = 3;

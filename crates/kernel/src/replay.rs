//! Replay verification: prove, from the persisted ledger alone, that the
//! chain is intact and that the gate is deterministic.

use crate::action::Proposal;
use crate::envelope::EnvelopeRegistry;
use crate::episode::EpisodeMeta;
use crate::gate::gate;
use crate::state::{Decision, StateSnapshot};
use warden_ledger::{verify_chain, LedgerError};

/// Gate re-runs per entry. Two fresh runs plus the recorded decision give
/// three pairwise-equal values before an entry counts as deterministic.
const GATE_RERUNS: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub entry_count: u64,
    pub chain_ok: bool,
    pub determinism_ok: bool,
    pub discrepancies: Vec<String>,
}

impl ReplayReport {
    pub fn ok(&self) -> bool {
        self.chain_ok && self.determinism_ok
    }
}

/// Run both verification passes over a ledger file. Never mutates it.
pub fn replay_verify(
    ledger_path: &std::path::Path,
    envelopes: &EnvelopeRegistry,
) -> Result<ReplayReport, ReplayError> {
    let chain = verify_chain(ledger_path)?;
    let mut discrepancies = chain.problems.clone();
    let chain_ok = chain.ok();

    let mut determinism_ok = true;
    let entries = warden_ledger::read_entries(ledger_path)?;
    for entry in &entries {
        let idx = entry.idx;
        let state: StateSnapshot = match decode_field(&entry.payload, "state") {
            Ok(v) => v,
            Err(detail) => {
                determinism_ok = false;
                discrepancies.push(format!("entry {}: {}", idx, detail));
                continue;
            }
        };
        let proposal: Proposal = match decode_field(&entry.payload, "proposal") {
            Ok(v) => v,
            Err(detail) => {
                determinism_ok = false;
                discrepancies.push(format!("entry {}: {}", idx, detail));
                continue;
            }
        };
        let recorded: Decision = match decode_field(&entry.payload, "decision") {
            Ok(v) => v,
            Err(detail) => {
                determinism_ok = false;
                discrepancies.push(format!("entry {}: {}", idx, detail));
                continue;
            }
        };
        let meta: EpisodeMeta = match decode_field(&entry.payload, "meta") {
            Ok(v) => v,
            Err(detail) => {
                determinism_ok = false;
                discrepancies.push(format!("entry {}: {}", idx, detail));
                continue;
            }
        };

        let mut reruns = Vec::with_capacity(GATE_RERUNS);
        for _ in 0..GATE_RERUNS {
            reruns.push(gate(&state, &proposal, &meta.policy, envelopes));
        }
        if reruns.windows(2).any(|pair| pair[0] != pair[1]) {
            determinism_ok = false;
            discrepancies.push(format!(
                "entry {}: gate produced diverging decisions across re-runs",
                idx
            ));
            continue;
        }
        if reruns[0] != recorded {
            determinism_ok = false;
            discrepancies.push(format!(
                "entry {}: re-run decision differs from recorded decision",
                idx
            ));
        }
    }

    Ok(ReplayReport {
        entry_count: entries.len() as u64,
        chain_ok,
        determinism_ok,
        discrepancies,
    })
}

fn decode_field<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
    field: &str,
) -> Result<T, String> {
    let value = payload
        .get(field)
        .ok_or_else(|| format!("payload missing {}", field))?;
    serde_json::from_value(value.clone())
        .map_err(|e| format!("payload field {} undecodable: {}", field, e))
}

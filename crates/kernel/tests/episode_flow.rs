use std::collections::BTreeMap;
use std::path::Path;
use warden_kernel::action::{Action, Proposal};
use warden_kernel::controller::NoExternalActions;
use warden_kernel::envelope::EnvelopeRegistry;
use warden_kernel::episode::{
    run_episode, run_two_phase_episode, EpisodeMeta, TwoPhaseProbe,
};
use warden_kernel::policy::GatePolicy;
use warden_kernel::replay::replay_verify;
use warden_kernel::state::{Decision, DecisionStatus, Mode, StateSnapshot};
use warden_ledger::{read_entries, LedgerAppender, LedgerEntry};

fn snapshot(dir: &Path) -> StateSnapshot {
    StateSnapshot {
        task_id: "task-episode".to_string(),
        workspace_root: dir.to_path_buf(),
        step: 0,
        budget_actions_remaining: 20,
        budget_wall_ms_remaining: 300_000,
        mode: Mode::Normal,
        notes: BTreeMap::new(),
    }
}

/// Policy whose test command is a workspace-local shell script, so the
/// verifying run works without any toolchain installed.
fn script_policy() -> GatePolicy {
    let mut policy = GatePolicy::default();
    policy.test_command_allowlist = vec![vec!["sh".to_string(), "run_tests.sh".to_string()]];
    policy
}

fn script_argv() -> Vec<String> {
    vec!["sh".to_string(), "run_tests.sh".to_string()]
}

#[cfg(unix)]
#[test]
fn single_phase_episode_executes_and_ledgers() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("run_tests.sh"), "exit 0\n").unwrap();
    std::fs::write(ws.path().join("note.txt"), "before\n").unwrap();
    let ledger_dir = tempfile::tempdir().unwrap();
    let ledger_path = ledger_dir.path().join("ledger.jsonl");
    let mut ledger = LedgerAppender::open(&ledger_path).unwrap();

    let state = snapshot(ws.path());
    let policy = script_policy();
    let envelopes = EnvelopeRegistry::builtin();
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
                argv: script_argv(),
                mode: None,
            },
        ],
        "edit and verify",
    );

    let report = run_episode(
        &state,
        &proposal,
        &policy,
        &envelopes,
        &mut ledger,
        &mut NoExternalActions,
        Some("probe-first".to_string()),
    )
    .unwrap();

    assert_eq!(report.phase_count, 1);
    assert_eq!(report.decision_status, DecisionStatus::Allow);
    assert!(report.tests_passed);
    assert!(report.reward > 0.7);

    let entries = read_entries(&ledger_path).unwrap();
    assert_eq!(entries.len(), 1);
    let results = entries[0].payload.get("results").unwrap().as_array().unwrap();
    assert_eq!(results.len(), 3);

    let replay = replay_verify(&ledger_path, &envelopes).unwrap();
    assert!(replay.ok(), "{:?}", replay.discrepancies);
}

#[cfg(unix)]
#[test]
fn denied_episode_has_zero_reward_and_no_results() {
    let ws = tempfile::tempdir().unwrap();
    let ledger_dir = tempfile::tempdir().unwrap();
    let ledger_path = ledger_dir.path().join("ledger.jsonl");
    let mut ledger = LedgerAppender::open(&ledger_path).unwrap();

    let report = run_episode(
        &snapshot(ws.path()),
        &Proposal::new(
            vec![Action::WriteFile {
                path: "/etc/x".to_string(),
                text: "pwn".to_string(),
            }],
            "escape attempt",
        ),
        &GatePolicy::default(),
        &EnvelopeRegistry::builtin(),
        &mut ledger,
        &mut NoExternalActions,
        None,
    )
    .unwrap();

    assert_eq!(report.decision_status, DecisionStatus::Deny);
    assert_eq!(report.reward, 0.0);
    let entries = read_entries(&ledger_path).unwrap();
    assert!(entries[0].payload["results"].as_array().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn passing_probe_ends_at_phase_one_with_full_reward() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("run_tests.sh"), "exit 0\n").unwrap();
    let ledger_dir = tempfile::tempdir().unwrap();
    let ledger_path = ledger_dir.path().join("ledger.jsonl");
    let mut ledger = LedgerAppender::open(&ledger_path).unwrap();

    let report = run_two_phase_episode(
        &snapshot(ws.path()),
        &script_policy(),
        &EnvelopeRegistry::builtin(),
        &mut ledger,
        &mut NoExternalActions,
        &TwoPhaseProbe::new(script_argv()),
    )
    .unwrap();

    assert_eq!(report.phase_count, 1);
    assert!(report.tests_passed);
    assert_eq!(report.reward, 1.0);
    assert_eq!(read_entries(&ledger_path).unwrap().len(), 1);
}

#[cfg(unix)]
#[test]
fn failing_probe_reads_trace_candidates_by_frequency() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("f.py"), "broken\n").unwrap();
    std::fs::write(ws.path().join("g.py"), "fine\n").unwrap();
    std::fs::write(
        ws.path().join("run_tests.sh"),
        "echo 'File \"f.py\", line 3, in test_main'\n\
         echo 'f.py raised ValueError'\n\
         echo 'f.py is implicated'\n\
         echo 'g.py mentioned once'\n\
         exit 1\n",
    )
    .unwrap();
    let ledger_dir = tempfile::tempdir().unwrap();
    let ledger_path = ledger_dir.path().join("ledger.jsonl");
    let mut ledger = LedgerAppender::open(&ledger_path).unwrap();

    let report = run_two_phase_episode(
        &snapshot(ws.path()),
        &script_policy(),
        &EnvelopeRegistry::builtin(),
        &mut ledger,
        &mut NoExternalActions,
        &TwoPhaseProbe::new(script_argv()),
    )
    .unwrap();

    assert_eq!(report.phase_count, 2);
    assert!(!report.tests_passed);

    let entries = read_entries(&ledger_path).unwrap();
    assert_eq!(entries.len(), 2);
    let phase2_actions = entries[1].payload["proposal"]["actions"].as_array().unwrap();
    // f.py (named three times) outranks g.py (named once); the test run
    // comes last.
    assert_eq!(phase2_actions[0]["name"], "READ_FILE");
    assert_eq!(phase2_actions[0]["args"]["path"], "f.py");
    assert_eq!(phase2_actions[1]["args"]["path"], "g.py");
    assert_eq!(
        phase2_actions.last().unwrap()["name"],
        "RUN_TESTS"
    );

    // Phase 2 was gated on the leftover budget: the one-action probe was
    // deducted first.
    let phase2_state: StateSnapshot =
        serde_json::from_value(entries[1].payload["state"].clone()).unwrap();
    assert_eq!(phase2_state.budget_actions_remaining, 19);
    assert_eq!(phase2_state.step, 1);
}

#[cfg(unix)]
#[test]
fn remediation_patch_lands_when_its_target_is_a_candidate() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("f.py"), "BROKEN\n").unwrap();
    std::fs::write(
        ws.path().join("run_tests.sh"),
        "grep -q FIXED f.py && exit 0\n\
         echo 'assertion failed in f.py'\n\
         exit 1\n",
    )
    .unwrap();
    let ledger_dir = tempfile::tempdir().unwrap();
    let ledger_path = ledger_dir.path().join("ledger.jsonl");
    let mut ledger = LedgerAppender::open(&ledger_path).unwrap();

    let mut probe = TwoPhaseProbe::new(script_argv());
    probe.remediation_patch = Some(
        "--- a/f.py\n\
         +++ b/f.py\n\
         @@ -1 +1 @@\n\
         -BROKEN\n\
         +FIXED\n"
            .to_string(),
    );

    let report = run_two_phase_episode(
        &snapshot(ws.path()),
        &script_policy(),
        &EnvelopeRegistry::builtin(),
        &mut ledger,
        &mut NoExternalActions,
        &probe,
    )
    .unwrap();

    assert_eq!(report.phase_count, 2);
    assert!(report.tests_passed, "patch should have fixed the tests");
    assert!(report.reward > 0.7);
    assert_eq!(
        std::fs::read_to_string(ws.path().join("f.py")).unwrap(),
        "FIXED\n"
    );
}

#[cfg(unix)]
#[test]
fn remediation_patch_with_an_invented_target_is_skipped() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("f.py"), "BROKEN\n").unwrap();
    std::fs::write(
        ws.path().join("run_tests.sh"),
        "echo 'failure in f.py'\nexit 1\n",
    )
    .unwrap();
    let ledger_dir = tempfile::tempdir().unwrap();
    let ledger_path = ledger_dir.path().join("ledger.jsonl");
    let mut ledger = LedgerAppender::open(&ledger_path).unwrap();

    let mut probe = TwoPhaseProbe::new(script_argv());
    probe.remediation_patch = Some(
        "--- a/unrelated.py\n\
         +++ b/unrelated.py\n\
         @@ -1 +1 @@\n\
         -BROKEN\n\
         +FIXED\n"
            .to_string(),
    );

    run_two_phase_episode(
        &snapshot(ws.path()),
        &script_policy(),
        &EnvelopeRegistry::builtin(),
        &mut ledger,
        &mut NoExternalActions,
        &probe,
    )
    .unwrap();

    let entries = read_entries(&ledger_path).unwrap();
    let phase2_actions = entries[1].payload["proposal"]["actions"].as_array().unwrap();
    assert!(
        phase2_actions.iter().all(|a| a["name"] != "APPLY_PATCH"),
        "invented-target patch must not ship"
    );
}

#[cfg(unix)]
#[test]
fn replay_detects_ledger_tampering_and_decision_rewrites() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("run_tests.sh"), "exit 0\n").unwrap();
    let ledger_dir = tempfile::tempdir().unwrap();
    let ledger_path = ledger_dir.path().join("ledger.jsonl");
    let mut ledger = LedgerAppender::open(&ledger_path).unwrap();

    let state = snapshot(ws.path());
    let policy = script_policy();
    let envelopes = EnvelopeRegistry::builtin();
    for _ in 0..2 {
        run_episode(
            &state,
            &Proposal::new(
                vec![Action::RunTests {
                    argv: script_argv(),
                    mode: None,
                }],
                "probe",
            ),
            &policy,
            &envelopes,
            &mut ledger,
            &mut NoExternalActions,
            None,
        )
        .unwrap();
    }

    let clean = replay_verify(&ledger_path, &envelopes).unwrap();
    assert!(clean.ok(), "{:?}", clean.discrepancies);

    // Tamper entry 0's hash: both index 0 and index 1 must be reported.
    let mut entries = read_entries(&ledger_path).unwrap();
    entries[0].entry_hash = "f".repeat(64);
    write_entries(&ledger_path, &entries);
    let tampered = replay_verify(&ledger_path, &envelopes).unwrap();
    assert!(!tampered.chain_ok);
    assert!(tampered.discrepancies.iter().any(|d| d.starts_with("entry 0:")));
    assert!(tampered.discrepancies.iter().any(|d| d.starts_with("entry 1:")));
}

#[cfg(unix)]
#[test]
fn replay_flags_a_recorded_decision_the_gate_would_not_make() {
    let ws = tempfile::tempdir().unwrap();
    let ledger_dir = tempfile::tempdir().unwrap();
    let ledger_path = ledger_dir.path().join("ledger.jsonl");
    let mut ledger = LedgerAppender::open(&ledger_path).unwrap();

    // Hand-forge a ledger whose chain is valid but whose recorded
    // decision claims ALLOW for a proposal the gate denies.
    let state = snapshot(ws.path());
    let proposal = Proposal::new(
        vec![Action::WriteFile {
            path: "/etc/x".to_string(),
            text: "pwn".to_string(),
        }],
        "forged",
    );
    let forged_decision = Decision {
        status: DecisionStatus::Allow,
        reasons: vec![],
        approved_actions: proposal.actions.clone(),
        denied_actions: vec![],
        transforms: BTreeMap::new(),
    };
    let meta = EpisodeMeta {
        episode_id: "forged-episode".to_string(),
        phase: 1,
        arm_id: None,
        policy: GatePolicy::default(),
        reward: 1.0,
        tests_passed: true,
        wall_ms: 0,
    };
    ledger
        .append(serde_json::json!({
            "state": state,
            "proposal": proposal,
            "decision": forged_decision,
            "results": [],
            "meta": meta,
        }))
        .unwrap();

    let report = replay_verify(&ledger_path, &EnvelopeRegistry::builtin()).unwrap();
    assert!(report.chain_ok);
    assert!(!report.determinism_ok);
    assert!(report
        .discrepancies
        .iter()
        .any(|d| d.contains("differs from recorded")));
}

fn write_entries(path: &Path, entries: &[LedgerEntry]) {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry).unwrap());
        out.push('\n');
    }
    std::fs::write(path, out).unwrap();
}

//! Thin CLI entry point: `warden run` drives gated episodes against a
//! workspace, `warden replay` verifies a ledger. Everything interesting
//! lives in the library; this file parses flags and prints status lines.

use crate::bandit::ThompsonSampler;
use crate::command::{Command, ReplayArgs, RunArgs};
use crate::controller::NoExternalActions;
use crate::envelope::EnvelopeRegistry;
use crate::episode::{run_two_phase_episode, TwoPhaseProbe};
use crate::exit_codes;
use crate::outcome::{OutcomeRecord, OutcomeStore};
use crate::policy::{default_arms, load_policy, GatePolicy};
use crate::replay::replay_verify;
use crate::state::{Mode, StateSnapshot};
use std::collections::BTreeMap;
use std::path::PathBuf;
use warden_common::sha256_hex;
use warden_ledger::LedgerAppender;

/// Dev diagnostics only (`RUST_LOG`, stderr); the ledger is the product
/// output.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

pub fn run<I>(args: I) -> i32
where
    I: Iterator<Item = String>,
{
    match parse_command(args) {
        Ok(Command::Run(args)) => run_episodes(args),
        Ok(Command::Replay(args)) => run_replay(args),
        Err(message) => {
            eprintln!("error: {}", message);
            eprintln!("{}", USAGE);
            exit_codes::INVALID
        }
    }
}

const USAGE: &str = "\
usage:
  warden run --workspace <dir> --task <id> --ledger <path>
             [--episodes N] [--arm <arm_id>] [--outcomes <path>]
             [--policy <path>] [--test-cmd '<argv...>']
  warden replay --ledger <path>";

fn parse_command<I>(mut it: I) -> Result<Command, String>
where
    I: Iterator<Item = String>,
{
    match it.next().as_deref() {
        Some("run") => parse_run_args(it).map(Command::Run),
        Some("replay") => parse_replay_args(it).map(Command::Replay),
        Some(other) => Err(format!("unknown command: {}", other)),
        None => Err("missing command".to_string()),
    }
}

fn parse_run_args<I>(mut it: I) -> Result<RunArgs, String>
where
    I: Iterator<Item = String>,
{
    let mut workspace_root: Option<PathBuf> = None;
    let mut task_id: Option<String> = None;
    let mut ledger_path: Option<PathBuf> = None;
    let mut episodes: u64 = 1;
    let mut arm_override: Option<String> = None;
    let mut outcomes_path: Option<PathBuf> = None;
    let mut policy_path: Option<PathBuf> = None;
    let mut test_argv: Option<Vec<String>> = None;

    while let Some(a) = it.next() {
        match a.as_str() {
            "--workspace" => {
                workspace_root = Some(PathBuf::from(
                    it.next().ok_or("missing value for --workspace")?,
                ));
            }
            "--task" => {
                task_id = Some(it.next().ok_or("missing value for --task")?);
            }
            "--ledger" => {
                ledger_path = Some(PathBuf::from(
                    it.next().ok_or("missing value for --ledger")?,
                ));
            }
            "--episodes" => {
                let v = it.next().ok_or("missing value for --episodes")?;
                episodes = v
                    .parse::<u64>()
                    .map_err(|_| "invalid value for --episodes".to_string())?;
            }
            "--arm" => {
                arm_override = Some(it.next().ok_or("missing value for --arm")?);
            }
            "--outcomes" => {
                outcomes_path = Some(PathBuf::from(
                    it.next().ok_or("missing value for --outcomes")?,
                ));
            }
            "--policy" => {
                policy_path = Some(PathBuf::from(
                    it.next().ok_or("missing value for --policy")?,
                ));
            }
            "--test-cmd" => {
                let v = it.next().ok_or("missing value for --test-cmd")?;
                let argv: Vec<String> = v.split_whitespace().map(str::to_string).collect();
                if argv.is_empty() {
                    return Err("empty --test-cmd".to_string());
                }
                test_argv = Some(argv);
            }
            other => return Err(format!("unknown flag: {}", other)),
        }
    }

    Ok(RunArgs {
        workspace_root: workspace_root.ok_or("missing --workspace")?,
        task_id: task_id.ok_or("missing --task")?,
        ledger_path: ledger_path.ok_or("missing --ledger")?,
        episodes,
        arm_override,
        outcomes_path,
        policy_path,
        test_argv,
    })
}

fn parse_replay_args<I>(mut it: I) -> Result<ReplayArgs, String>
where
    I: Iterator<Item = String>,
{
    let mut ledger_path: Option<PathBuf> = None;
    while let Some(a) = it.next() {
        match a.as_str() {
            "--ledger" => {
                ledger_path = Some(PathBuf::from(
                    it.next().ok_or("missing value for --ledger")?,
                ));
            }
            other => return Err(format!("unknown flag: {}", other)),
        }
    }
    Ok(ReplayArgs {
        ledger_path: ledger_path.ok_or("missing --ledger")?,
    })
}

/// Deterministic per-task bandit seed: the first 16 hex digits of the
/// task id's hash.
fn task_seed(task_id: &str) -> u64 {
    let digest = sha256_hex(task_id.as_bytes());
    u64::from_str_radix(&digest[..16], 16).unwrap_or(0)
}

fn run_episodes(args: RunArgs) -> i32 {
    let mut policy = match &args.policy_path {
        Some(path) => match load_policy(path) {
            Ok(policy) => policy,
            Err(e) => {
                eprintln!("error: {}", e);
                return exit_codes::INVALID;
            }
        },
        None => GatePolicy::default(),
    };
    // An operator-supplied test command is an explicit grant; the policy
    // recorded in the ledger carries it so replay sees the same inputs.
    if let Some(argv) = &args.test_argv {
        if !policy.test_command_allowlist.contains(argv) {
            policy.test_command_allowlist.push(argv.clone());
        }
    }
    let envelopes = EnvelopeRegistry::builtin();

    let mut ledger = match LedgerAppender::open(&args.ledger_path) {
        Ok(ledger) => ledger,
        Err(e) => {
            eprintln!("error: {}", e);
            return exit_codes::INVALID;
        }
    };

    let outcomes_path = args
        .outcomes_path
        .clone()
        .unwrap_or_else(|| args.ledger_path.with_extension("outcomes.sqlite"));
    let outcomes = match OutcomeStore::open(&outcomes_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("error: {}", e);
            return exit_codes::INVALID;
        }
    };

    let arms = default_arms();
    let arm_ids: Vec<&str> = arms.iter().map(|arm| arm.arm_id.as_str()).collect();
    let mut bandit = ThompsonSampler::new(task_seed(&args.task_id));
    match outcomes.warm_start_arms() {
        Ok(seeds) => {
            for (arm_id, (alpha, beta)) in seeds {
                bandit.seed_arm(&arm_id, alpha, beta);
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return exit_codes::INVALID;
        }
    }

    let test_argv = args
        .test_argv
        .clone()
        .or_else(|| policy.test_command_allowlist.first().cloned())
        .unwrap_or_default();

    for episode_idx in 0..args.episodes {
        let arm_id = match &args.arm_override {
            Some(arm) => arm.clone(),
            None => match bandit.choose(&arm_ids) {
                Some(arm) => arm,
                None => {
                    eprintln!("error: no strategy arms configured");
                    return exit_codes::INVALID;
                }
            },
        };
        let arm = arms.iter().find(|a| a.arm_id == arm_id);
        let (max_actions, max_wall_ms) = arm
            .map(|a| (a.max_actions, a.max_wall_ms))
            .unwrap_or((12, 120_000));

        let state = StateSnapshot {
            task_id: args.task_id.clone(),
            workspace_root: args.workspace_root.clone(),
            step: episode_idx,
            budget_actions_remaining: max_actions,
            budget_wall_ms_remaining: max_wall_ms,
            mode: Mode::Normal,
            notes: BTreeMap::new(),
        };
        let mut probe = TwoPhaseProbe::new(test_argv.clone());
        probe.arm_id = Some(arm_id.clone());

        let report = match run_two_phase_episode(
            &state,
            &policy,
            &envelopes,
            &mut ledger,
            &mut NoExternalActions,
            &probe,
        ) {
            Ok(report) => report,
            Err(e) => {
                eprintln!("error: episode {} failed: {}", episode_idx, e);
                return exit_codes::INVALID;
            }
        };

        println!(
            "episode={} arm={} phases={} status={} tests_passed={} reward={:.3}",
            episode_idx,
            arm_id,
            report.phase_count,
            report.decision_status.as_str(),
            report.tests_passed,
            report.reward
        );

        bandit.update(&arm_id, report.reward);
        let record = OutcomeRecord {
            ts: unix_ts(),
            task_id: args.task_id.clone(),
            arm_id,
            decision_status: report.decision_status.as_str().to_string(),
            tests_passed: report.tests_passed,
            wall_ms: report.wall_ms,
            reward: report.reward,
            meta: BTreeMap::from([(
                "episode_id".to_string(),
                report.episode_id.clone(),
            )]),
        };
        if let Err(e) = outcomes.insert(&record) {
            eprintln!("error: {}", e);
            return exit_codes::INVALID;
        }
    }

    verify_and_report(&args.ledger_path, &envelopes)
}

fn run_replay(args: ReplayArgs) -> i32 {
    verify_and_report(&args.ledger_path, &EnvelopeRegistry::builtin())
}

fn verify_and_report(ledger_path: &std::path::Path, envelopes: &EnvelopeRegistry) -> i32 {
    let report = match replay_verify(ledger_path, envelopes) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("error: {}", e);
            return exit_codes::INVALID;
        }
    };
    for discrepancy in &report.discrepancies {
        eprintln!("replay: {}", discrepancy);
    }
    if !report.chain_ok {
        eprintln!("REPLAY_FAILED chain ({} entries)", report.entry_count);
        return exit_codes::CHAIN_FAILURE;
    }
    if !report.determinism_ok {
        eprintln!("REPLAY_FAILED determinism ({} entries)", report.entry_count);
        return exit_codes::DETERMINISM_FAILURE;
    }
    println!("REPLAY_OK ({} entries)", report.entry_count);
    exit_codes::OK
}

fn unix_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

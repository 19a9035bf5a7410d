//! Runs a checked program along a single execution, snapshotting every state it reaches.
//!
//! Usage: `mcheck-run <program> [args...]`, configured through `MCHECK_*` environment variables.

use std::process::Command;

use anyhow::Context;
use mcheck_remote::{ProtocolError, ResumeOutcome};
use mcheck_state::{CheckerConfig, Session, SnapshotContext, VisitedState, VisitedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    /// Every task terminated.
    Completed,
    Deadlock,
    AssertionFailed,
    DepthLimit,

    /// The checked process closed the control channel.
    Terminated,

    /// The checked process was killed by a signal.
    Crashed { signal: &'static str },
}

impl Outcome {
    /// Whether the checked process is still blocked waiting for a command.
    fn process_alive(&self) -> bool {
        !matches!(self, Outcome::Terminated | Outcome::Crashed { .. })
    }
}

#[derive(Debug, serde::Serialize)]
struct Report {
    outcome: Outcome,
    states: u64,
    visited_hits: u64,
    comparisons: u64,
    live_pages: usize,

    /// Whether restoring the initial state reproduced it exactly.
    restore_check: Option<bool>,
    config: CheckerConfig,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("MCHECK_LOG"))
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        log_error_and_exit(e);
    }
}

fn log_error_and_exit(error: anyhow::Error) -> ! {
    tracing::error!("{:?}", error);
    eprintln!("[mcheck]: {:?}", error);
    std::process::exit(1);
}

/// Map the termination of the checked process to the final outcome of the run.
fn alive<T>(result: Result<T, ProtocolError>) -> anyhow::Result<Result<T, Outcome>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(ProtocolError::Closed) => Ok(Err(Outcome::Terminated)),
        Err(ProtocolError::ProcessCrashed(signal)) => {
            Ok(Err(Outcome::Crashed { signal: signal.as_str() }))
        }
        Err(e) => Err(e.into()),
    }
}

/// `None` while the process keeps running.
fn outcome_of(resumed: Result<ResumeOutcome, Outcome>) -> Option<Outcome> {
    match resumed {
        Ok(ResumeOutcome::Waiting) => None,
        Ok(ResumeOutcome::AssertionFailed) => Some(Outcome::AssertionFailed),
        Err(end) => Some(end),
    }
}

fn run() -> anyhow::Result<()> {
    let mut args = std::env::args_os().skip(1);
    let program = args.next().context("usage: mcheck-run <program> [args...]")?;
    let config = CheckerConfig::from_env()?;
    tracing::info!("{config:?}");

    let mut command = Command::new(&program);
    command.args(args);
    let mut session = Session::spawn(command, &config)
        .with_context(|| format!("failed to start {}", program.to_string_lossy()))?;

    let mut ctx = SnapshotContext::new(config.clone());
    let mut visited = VisitedStore::new(config.max_visited_states);
    let mut visited_hits = 0;
    let mut initial = None;
    let mut states = 0;

    let mut outcome = outcome_of(alive(session.controller_mut().resume())?);
    while outcome.is_none() {
        if states >= config.max_depth {
            outcome = Some(Outcome::DepthLimit);
            break;
        }
        states += 1;

        let snapshot = ctx.take_snapshot(&mut session, states)?;
        tracing::debug!("state {states}: propositions {:?}", session.read_propositions()?);
        initial.get_or_insert_with(|| snapshot.clone());
        if visited.is_visited(VisitedState::new(snapshot, states), &ctx).is_some() {
            visited_hits += 1;
        }

        let controller = session.controller_mut();
        match alive(controller.deadlock_check())? {
            Ok(false) => {}
            Ok(true) => {
                tracing::info!("deadlock detected in state {states}");
                outcome = Some(Outcome::Deadlock);
                break;
            }
            Err(end) => {
                outcome = Some(end);
                break;
            }
        }

        let tasks: Vec<_> = controller.declarations().tasks().collect();
        let mut next = Err(Outcome::Completed);
        for task in tasks {
            match alive(controller.actor_enabled(task))? {
                Ok(true) => next = Ok(task),
                Ok(false) => continue,
                Err(end) => next = Err(end),
            }
            break;
        }
        let task = match next {
            Ok(task) => task,
            Err(end) => {
                outcome = Some(end);
                break;
            }
        };

        tracing::debug!("state {states}: executing task {task}");
        outcome = match alive(controller.handle_simcall(task, 0))? {
            Ok(ResumeOutcome::Waiting) => outcome_of(alive(controller.resume())?),
            other => outcome_of(other),
        };
    }

    let outcome = outcome.unwrap_or(Outcome::Completed);
    tracing::info!("{outcome:?} after {states} states");

    let mut restore_check = None;
    if outcome.process_alive() {
        if let Some(initial) = initial {
            ctx.restore_snapshot(&mut session, &initial)?;
            let restored = ctx.take_snapshot(&mut session, states + 1)?;
            restore_check = Some(ctx.snapshot_equal(&initial, &restored));
        }
    }

    let report = Report {
        outcome,
        states,
        visited_hits,
        comparisons: visited.comparisons(),
        live_pages: ctx.page_store().live_pages(),
        restore_check,
        config,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

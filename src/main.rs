#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # runpilot
//!
//! Command-line driver for remotely executed browser-automation sessions.
//!
//! ## Subcommands
//!
//! - `runpilot watch <id>`: attach to a session and print its timeline
//! - `runpilot new <instruction> [--start]`: create a session, wait for the
//!   plan, optionally start execution and follow it to the end
//! - `runpilot run <id> [--skip-failures]`: run till end; on a failed step
//!   either skip it and continue or cancel the run
//!
//! Configuration: `--config <path>`, else `runpilot.toml`, else defaults;
//! `RUNPILOT_BASE_URL`, `RUNPILOT_API_KEY` and `RUNPILOT_MODEL` override.

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use runpilot::connection::ConnectionMode;
use runpilot::gate::GateState;
use runpilot::run_till_end::RunPhase;
use runpilot::{CommandError, Config, SessionController, UserCommand};

/// Drive and observe remotely executed browser-automation sessions.
#[derive(Parser)]
#[command(name = "runpilot", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to a session and print timeline entries as they arrive.
    Watch { session_id: String },
    /// Create a session from an instruction.
    New {
        instruction: String,
        /// Start execution once the plan is ready.
        #[arg(long)]
        start: bool,
    },
    /// Run all remaining steps of a session.
    Run {
        session_id: String,
        /// Skip failed steps instead of cancelling the run.
        #[arg(long)]
        skip_failures: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("runpilot: configuration error: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("runpilot v{} -> {}", env!("CARGO_PKG_VERSION"), config.server.base_url);

    let mut ctl = match SessionController::from_config(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("runpilot: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Watch { session_id } => watch(&mut ctl, &session_id).await,
        Commands::New { instruction, start } => new_session(&mut ctl, instruction, start).await,
        Commands::Run {
            session_id,
            skip_failures,
        } => run_till_end(&mut ctl, &session_id, skip_failures).await,
    };

    ctl.detach().await;
    if let Err(e) = result {
        eprintln!("runpilot: {e}");
        std::process::exit(1);
    }
}

/// Prints timeline entries the caller has not seen yet.
struct Printer {
    seen: usize,
}

impl Printer {
    fn flush(&mut self, ctl: &SessionController) {
        let timeline = ctl.timeline();
        if timeline.len() < self.seen {
            // Reset cleared the timeline.
            self.seen = 0;
        }
        for entry in timeline.since(self.seen) {
            match entry {
                runpilot::timeline::TimelineEntry::Step(n) => match ctl.replica().step(*n) {
                    Some(step) => println!(
                        "Step {n}: {}",
                        step.goal.as_deref().unwrap_or("(no goal)")
                    ),
                    None => println!("{entry}"),
                },
                _ => println!("{entry}"),
            }
        }
        self.seen = timeline.len();
    }
}

/// Apply one inbound item. Returns `false` on Ctrl-C or when the transport ends.
async fn pump(ctl: &mut SessionController, printer: &mut Printer) -> bool {
    let keep_going = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            false
        }
        item = ctl.next_inbound() => match item {
            Some(item) => {
                ctl.handle_inbound(item).await;
                true
            }
            None => false,
        }
    };
    printer.flush(ctl);
    keep_going
}

/// Pump until the transport can carry commands.
async fn wait_for_transport(
    ctl: &mut SessionController,
    printer: &mut Printer,
) -> Result<(), CommandError> {
    while ctl.connection().mode == ConnectionMode::Disconnected {
        if !pump(ctl, printer).await {
            return Err(CommandError::Rejected("interrupted before connecting".into()));
        }
    }
    Ok(())
}

/// Pump until the gate is idle again. Errors if a failure needs a decision.
async fn wait_for_idle(
    ctl: &mut SessionController,
    printer: &mut Printer,
) -> Result<bool, CommandError> {
    loop {
        match ctl.gate_state() {
            GateState::Idle => return Ok(true),
            GateState::FailurePendingDecision => {
                let dropped = ctl.resolve_failure_by_discarding().await;
                printer.flush(ctl);
                return Err(CommandError::Rejected(format!(
                    "command failed, discarded {dropped} queued command(s)"
                )));
            }
            GateState::Busy(_) => {
                if !pump(ctl, printer).await {
                    return Ok(false);
                }
            }
        }
    }
}

async fn watch(ctl: &mut SessionController, session_id: &str) -> Result<(), CommandError> {
    ctl.attach(session_id).await?;
    let mut printer = Printer { seen: 0 };
    while pump(ctl, &mut printer).await {}
    Ok(())
}

async fn new_session(
    ctl: &mut SessionController,
    instruction: String,
    start: bool,
) -> Result<(), CommandError> {
    let mut printer = Printer { seen: 0 };
    ctl.submit(UserCommand::Instruct(instruction)).await?;
    printer.flush(ctl);
    if let Some(id) = ctl.session_id() {
        println!("Session {id}");
    }

    if !wait_for_idle(ctl, &mut printer).await? || !start {
        return Ok(());
    }

    wait_for_transport(ctl, &mut printer).await?;
    ctl.submit(UserCommand::Start).await?;
    printer.flush(ctl);
    wait_for_idle(ctl, &mut printer).await?;
    println!("Finished with status {}", ctl.replica().status);
    Ok(())
}

async fn run_till_end(
    ctl: &mut SessionController,
    session_id: &str,
    skip_failures: bool,
) -> Result<(), CommandError> {
    ctl.attach(session_id).await?;
    let mut printer = Printer { seen: 0 };
    wait_for_transport(ctl, &mut printer).await?;

    ctl.submit(UserCommand::RunTillEnd).await?;
    printer.flush(ctl);

    loop {
        match ctl.run_phase() {
            RunPhase::Completed | RunPhase::Idle => break,
            RunPhase::Paused => {
                if skip_failures {
                    ctl.skip_failed_step().await?;
                } else {
                    warn!("Step failed, cancelling run");
                    ctl.cancel_run().await?;
                }
                printer.flush(ctl);
            }
            RunPhase::Running => {
                if !pump(ctl, &mut printer).await {
                    if ctl.run_phase() == RunPhase::Running {
                        ctl.cancel_run().await?;
                        printer.flush(ctl);
                    }
                    break;
                }
            }
        }
    }

    let state = ctl.run_state();
    println!(
        "Run finished: {} completed, skipped {:?}",
        state.completed_steps, state.skipped_steps
    );
    Ok(())
}

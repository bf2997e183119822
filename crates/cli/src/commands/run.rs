//! Run Commands

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use runcast_common::{Run, RunStatus, StepStatus};

use crate::client::ServerClient;
use crate::output::{print_list, print_run, print_success, print_warning, run_status, OutputFormat};

#[derive(Subcommand)]
pub enum RunCommands {
    /// Submit a run of a stored scenario
    Submit {
        /// Scenario ID
        scenario: String,

        /// Run ID; resubmitting the same id is a no-op
        #[arg(long)]
        run_id: Option<String>,

        /// Follow the run until it finishes
        #[arg(short, long)]
        watch: bool,

        #[command(flatten)]
        poll: PollArgs,
    },

    /// Show a run snapshot
    Get {
        /// Run ID
        id: String,
    },

    /// List recent runs, newest first
    List {
        /// Maximum number of runs
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Follow a run until it finishes; exits non-zero unless it passed
    Watch {
        /// Run ID
        id: String,

        #[command(flatten)]
        poll: PollArgs,
    },
}

#[derive(Args, Clone, Copy)]
pub struct PollArgs {
    /// Poll interval in milliseconds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Give up after this many seconds (0 waits forever)
    #[arg(long, default_value = "0")]
    timeout_secs: u64,
}

impl PollArgs {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(50))
    }

    fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Steps that reached a terminal status
fn settled_steps(run: &Run) -> usize {
    run.step_results
        .iter()
        .filter(|s| s.status.is_terminal())
        .count()
}

/// Name of the step currently executing, if any
fn current_step(run: &Run) -> Option<String> {
    run.step_results
        .iter()
        .find(|s| s.status == StepStatus::Running)
        .map(|s| s.name.clone().unwrap_or_else(|| s.step_id.clone()))
}

async fn watch(client: &ServerClient, id: &str, poll: PollArgs, format: OutputFormat) -> Result<()> {
    let progress = matches!(format, OutputFormat::Table).then(|| {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    });

    let result = client
        .watch_run(id, poll.interval(), poll.timeout(), |run| {
            if let Some(bar) = &progress {
                bar.set_length(run.step_results.len() as u64);
                bar.set_position(settled_steps(run) as u64);
                let step = current_step(run).unwrap_or_default();
                bar.set_message(format!("{} {}", run_status(run.status), step));
            }
        })
        .await;

    if let Some(bar) = &progress {
        bar.finish_and_clear();
    }
    let run = result?;

    print_run(&run, format);
    if run.status != RunStatus::Passed {
        bail!("run {} finished {}", run.id, run.status);
    }
    Ok(())
}

pub async fn execute(cmd: RunCommands, client: ServerClient, format: OutputFormat) -> Result<()> {
    match cmd {
        RunCommands::Submit {
            scenario,
            run_id,
            watch: follow,
            poll,
        } => {
            let submitted = client.submit_run(&scenario, run_id.as_deref()).await?;
            if submitted.created {
                print_success(&format!(
                    "Run '{}' of scenario '{}' submitted",
                    submitted.run_id, scenario
                ));
            } else {
                print_warning(&format!(
                    "Run '{}' already exists ({})",
                    submitted.run_id, submitted.run.status
                ));
            }

            if follow {
                watch(&client, &submitted.run_id, poll, format).await?;
            } else {
                print_run(&submitted.run, format);
            }
        }

        RunCommands::Get { id } => {
            let run = client.get_run(&id).await?;
            print_run(&run, format);
        }

        RunCommands::List { limit } => {
            let runs = client.list_runs(limit).await?;
            print_list(&runs, format);
        }

        RunCommands::Watch { id, poll } => {
            watch(&client, &id, poll, format).await?;
        }
    }

    Ok(())
}

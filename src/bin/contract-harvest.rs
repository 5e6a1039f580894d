//! Command line entry point.
//!
//! ```text
//! contract-harvest --config harvest.json listing --start 2023-11-01 --end 2023-11-06
//! contract-harvest detail
//! contract-harvest attachment
//! contract-harvest all
//! contract-harvest retry-failed --phase detail
//! ```
//!
//! Exit status: 0 when every target was fetched and stored, 2 when the run
//! finished but wrote failure ledger entries, 1 on a fatal error.

use clap::{Parser, Subcommand};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use contract_harvest::{Config, Harvester, Phase, RunSummary, run_with_shutdown};

#[derive(Parser, Debug)]
#[command(name = "contract-harvest", author, version, about)]
struct Args {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Inclusive start date (YYYY-MM-DD) overriding the configured one
    #[arg(long, global = true)]
    start: Option<String>,

    /// Exclusive end date (YYYY-MM-DD) overriding the configured one
    #[arg(long, global = true)]
    end: Option<String>,

    /// Also write logs to <DIR>/<phase>_<YYYY_MM_DD>.log
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk the paged listing into per-day sheets
    Listing,
    /// Fetch the detail page of every listed contract
    Detail,
    /// Download attachments referenced by detail rows
    Attachment,
    /// Run listing, detail and attachment in order
    All,
    /// Replay targets recorded in a phase's failure ledger
    RetryFailed {
        /// Phase whose ledger is replayed
        #[arg(long)]
        phase: Phase,
    },
}

impl Command {
    fn phases(&self) -> Vec<Phase> {
        match self {
            Command::Listing => vec![Phase::Listing],
            Command::Detail => vec![Phase::Detail],
            Command::Attachment => vec![Phase::Attachment],
            Command::All => Phase::ALL.to_vec(),
            Command::RetryFailed { phase } => vec![*phase],
        }
    }

    fn log_name(&self) -> String {
        match self {
            Command::All => "all".to_string(),
            Command::RetryFailed { phase } => format!("retry_{phase}"),
            other => other.phases().first().map(Phase::to_string).unwrap_or_default(),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(args.log_dir.as_deref(), &args.command.log_name()) {
        eprintln!("cannot set up logging: {e}");
        return ExitCode::from(1);
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "cannot start runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config, &args.command)) {
        Ok(summary) => {
            for phase in &summary.phases {
                println!("{phase}");
            }
            if summary.is_degraded() {
                tracing::warn!("run finished with failures recorded in the ledger");
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "run aborted");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config, command: &Command) -> contract_harvest::Result<RunSummary> {
    let cancel = CancellationToken::new();
    let harvester = Harvester::from_config(config, cancel.clone())?;

    run_with_shutdown(cancel, async {
        match command {
            Command::All => harvester.run_all().await,
            Command::RetryFailed { phase } => Ok(RunSummary {
                phases: vec![harvester.retry_failed(*phase).await?],
            }),
            single => {
                let mut summary = RunSummary::default();
                for phase in single.phases() {
                    summary.phases.push(harvester.run(phase).await?);
                }
                Ok(summary)
            }
        }
    })
    .await
}

fn load_config(args: &Args) -> contract_harvest::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    for phase in args.command.phases() {
        let settings = config.phase_mut(phase);
        if let Some(start) = &args.start {
            settings.start_date = start.clone();
        }
        if let Some(end) = &args.end {
            settings.end_date = end.clone();
        }
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(log_dir: Option<&Path>, name: &str) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file_name = format!("{name}_{}.log", chrono::Local::now().format("%Y_%m_%d"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(file_name))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

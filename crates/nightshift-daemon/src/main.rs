use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use nightshift_core::types::RunTrigger;
use nightshift_core::NightshiftConfig;
use nightshift_scheduler::db::Connector;
use nightshift_scheduler::{
    Clock, HandlerRegistry, RunContext, SchedulerEngine, SchedulerError, Selection, SystemClock,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod logging;
mod report;
mod signals;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("NIGHTSHIFT_GIT_SHA"),
    ")"
);

/// Some handlers failed.
const EXIT_FAILED: u8 = 1;
/// The configuration could not be loaded, validated or resolved.
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(
    name = "nightshift",
    version,
    long_version = LONG_VERSION,
    about = "Daily batched clean-up and archival of SQLite tables"
)]
struct Cli {
    /// Configuration file (default: ./nightshift.toml).
    #[arg(short, long, global = true, env = "NIGHTSHIFT_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run every day at the configured start time (default).
    Serve {
        /// Run all handlers once and exit. Also enabled by RUN_NOW=true|1|yes.
        #[arg(long)]
        run_now: bool,
    },
    /// Run handlers immediately and exit.
    Run {
        /// Only run this handler.
        #[arg(long)]
        handler: Option<String>,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and resolve every handler without touching data.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match NightshiftConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("nightshift: [{}] {e}", e.code());
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let _log_guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("nightshift: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let command = cli.command.unwrap_or(Command::Serve { run_now: false });
    let result = match command {
        Command::Serve { run_now } => {
            serve(cli.config, config, run_now || run_now_from_env()).await
        }
        Command::Run { handler, json } => run(config, handler, json).await,
        Command::Check => check(&config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

async fn serve(
    config_path: Option<String>,
    config: NightshiftConfig,
    run_now: bool,
) -> anyhow::Result<ExitCode> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.scheduler.use_utc));
    let shutdown = CancellationToken::new();
    signals::spawn_shutdown_listener(shutdown.clone());

    let mut engine = SchedulerEngine::new(config, HandlerRegistry::with_builtins(), clock);

    if run_now {
        info!("RUN_NOW set, running all handlers once");
        return match engine
            .run_once(Selection::All, RunTrigger::OnDemand, &shutdown)
            .await
        {
            Ok(summary) => Ok(exit_for(summary.any_failed())),
            Err(e) => Ok(not_started(e)),
        };
    }

    engine = engine.with_config_loader(move || NightshiftConfig::load(config_path.as_deref()));
    signals::spawn_run_now_listener(engine.handle(), shutdown.clone());

    info!(
        start_time = %engine.config().scheduler.start_time,
        handlers = ?engine.config().scheduler.handlers,
        "nightshift daemon started"
    );
    engine.run(shutdown).await;
    Ok(ExitCode::SUCCESS)
}

async fn run(
    config: NightshiftConfig,
    handler: Option<String>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.scheduler.use_utc));
    let shutdown = CancellationToken::new();
    signals::spawn_shutdown_listener(shutdown.clone());

    let selection = handler.map_or(Selection::All, Selection::Only);
    let mut engine = SchedulerEngine::new(config, HandlerRegistry::with_builtins(), clock);
    let summary = match engine.run_once(selection, RunTrigger::OnDemand, &shutdown).await {
        Ok(summary) => summary,
        Err(e) => return Ok(not_started(e)),
    };

    if json {
        println!("{}", report::to_json(&summary)?);
    } else {
        print!("{}", report::render(&summary));
    }
    Ok(exit_for(summary.any_failed()))
}

fn check(config: &NightshiftConfig) -> anyhow::Result<ExitCode> {
    let registry = HandlerRegistry::with_builtins();
    let now = SystemClock::new(config.scheduler.use_utc).now();

    // every section, scheduled or not, must resolve
    let selections = std::iter::once(Selection::All)
        .chain(config.handlers.keys().cloned().map(Selection::Only));
    for selection in selections {
        if let Err(e) = RunContext::build(config, &registry, &selection, RunTrigger::OnDemand, now) {
            eprintln!("nightshift: [{}] {e}", e.code());
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    }

    Connector::from_config(&config.database)
        .ping()
        .map_err(|e| anyhow::anyhow!("database unreachable: {e}"))?;

    println!(
        "configuration ok: {} handler section(s), {} scheduled daily at {}",
        config.handlers.len(),
        config.scheduler.handlers.len(),
        config.scheduler.start_time
    );
    Ok(ExitCode::SUCCESS)
}

/// Exit status for a run that never started. The engine has logged the cause.
fn not_started(e: SchedulerError) -> ExitCode {
    match e {
        SchedulerError::Config(_) => ExitCode::from(EXIT_CONFIG),
        e => {
            eprintln!("nightshift: {e}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

fn exit_for(any_failed: bool) -> ExitCode {
    if any_failed {
        ExitCode::from(EXIT_FAILED)
    } else {
        ExitCode::SUCCESS
    }
}

fn run_now_from_env() -> bool {
    std::env::var("RUN_NOW").is_ok_and(|v| is_truthy(&v))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

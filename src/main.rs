use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wed_fleet::domain::models::{Command, SessionOutcome};
use wed_fleet::domain::session::SessionOptions;
use wed_fleet::domain::settings::{FleetConfig, LogSettings};
use wed_fleet::infrastructure::bluetooth::backend::RadioBackend;
use wed_fleet::infrastructure::bluetooth::channel::DEFAULT_RADIO_TIMEOUT;
use wed_fleet::infrastructure::logging;
use wed_fleet::presentation::app::{self, simulated_fleet, App};
use wed_fleet::presentation::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if let Commands::Inspect { file } = &cli.command {
        app::inspect(file)?;
        return Ok(ExitCode::SUCCESS);
    }

    // Config errors are fatal before anything touches the radio
    let config = match &cli.command {
        Commands::Start { config } => Some(
            FleetConfig::load(config)
                .with_context(|| format!("Invalid fleet config {}", config.display()))?,
        ),
        _ => None,
    };

    let mut log_settings = match (&config, &cli.command) {
        (Some(config), _) => config.effective_log_settings(),
        (None, Commands::Download {
            log_dir: Some(dir), ..
        }) => LogSettings::default().with_log_dir(dir),
        _ => LogSettings::default(),
    };
    if cli.verbose {
        log_settings.level = "debug".to_string();
    }
    let _guard = logging::init_logger(&log_settings)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping sessions");
            ctrl_c.cancel();
        }
    });

    let radio_timeout = config
        .as_ref()
        .map_or(DEFAULT_RADIO_TIMEOUT, FleetConfig::radio_timeout);

    if cli.simulate {
        let devices = match &config {
            Some(config) => config.devices.clone(),
            None => cli.command.devices(),
        };
        info!("Using simulated devices");
        let app = App::new(simulated_fleet(&devices), radio_timeout);
        return execute(&app, cli.command, config, cancel).await;
    }

    run_on_radio(cli.command, config, radio_timeout, cancel).await
}

#[cfg(windows)]
async fn run_on_radio(
    command: Commands,
    config: Option<FleetConfig>,
    radio_timeout: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<ExitCode> {
    use wed_fleet::infrastructure::bluetooth::WinRtBackend;

    let app = App::new(WinRtBackend::new(), radio_timeout);
    execute(&app, command, config, cancel).await
}

#[cfg(not(windows))]
async fn run_on_radio(
    _command: Commands,
    _config: Option<FleetConfig>,
    _radio_timeout: Duration,
    _cancel: CancellationToken,
) -> anyhow::Result<ExitCode> {
    anyhow::bail!("No Bluetooth backend on this platform, run with --simulate")
}

fn exit_code(outcomes: &[SessionOutcome]) -> ExitCode {
    if outcomes.iter().all(SessionOutcome::succeeded) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn execute<B: RadioBackend>(
    app: &App<B>,
    command: Commands,
    config: Option<FleetConfig>,
    cancel: CancellationToken,
) -> anyhow::Result<ExitCode> {
    match command {
        Commands::List { duration } => {
            app.list(Duration::from_secs(duration)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Blink { device } => {
            let options = SessionOptions::new(Command::Blink);
            let outcomes = app.run_sessions(&[device], options, cancel).await;
            Ok(exit_code(&outcomes))
        }
        Commands::Status { devices } => {
            let options = SessionOptions::new(Command::Status);
            let outcomes = app.run_sessions(&devices, options, cancel).await;
            Ok(exit_code(&outcomes))
        }
        Commands::Download {
            devices,
            raw,
            file_prefix,
            min_logs,
            ..
        } => {
            let options = SessionOptions {
                raw,
                min_logs,
                file_prefix,
                ..SessionOptions::new(Command::Download)
            };
            let outcomes = app.run_sessions(&devices, options, cancel).await;
            Ok(exit_code(&outcomes))
        }
        Commands::Inspect { file } => {
            app::inspect(&file)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Start { .. } => {
            let config = config.context("Fleet config was not loaded")?;
            let summary = app.start(&config, cancel).await?;
            info!(
                "{} sessions: {} succeeded, {} failed",
                summary.sessions, summary.succeeded, summary.failed
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

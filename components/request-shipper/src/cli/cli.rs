// Local crates
use crate::{
    helpers::load_config::{Config, Overrides},
    instrumentation::tracing::{init_panic_handler, init_tracing},
    orchestrator::orchestrator::RunOutcome,
    runtime,
};

// External crates
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode};

#[derive(Parser)]
#[command(
    name = "request-shipper",
    long_about = "Tails web-server access logs, adds geolocation to every request and ships the results to InfluxDB or stdout.",
    about = "Access log to InfluxDB shipper",
    version,
    term_width = 100,
    after_help = "\
    EXAMPLES:
        request-shipper run --filepath '/var/log/nginx/*.log' --influxdb requests --daemon
        request-shipper run --config /etc/request-shipper.toml --preview --format json
        request-shipper validate --config ./request-shipper.toml"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ship access logs
    Run(RunArgs),

    /// Load and validate the configuration, then print it
    Validate(RunArgs),

    /// Display version information
    Version,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// TOML configuration file
    #[arg(short, long, env = "SHIPPER_CONFIG")]
    config: Option<PathBuf>,

    /// Log files to analyze, glob patterns allowed between quotes
    #[arg(long)]
    filepath: Option<String>,

    /// Output format: influx | json
    #[arg(long)]
    format: Option<String>,

    /// Influx url connection
    #[arg(long)]
    influxurl: Option<String>,

    /// Influx database name
    #[arg(long)]
    influxdb: Option<String>,

    #[arg(long)]
    influxuser: Option<String>,

    #[arg(long)]
    influxpass: Option<String>,

    /// GeoIP city database file
    #[arg(long)]
    geoipdb: Option<String>,

    /// Tail files and send points continuously by limit or by refresh
    #[arg(long)]
    daemon: bool,

    /// Poll instead of filesystem notifications (daemon mode)
    #[arg(long)]
    poll: bool,

    /// Print points to stdout
    #[arg(long)]
    preview: bool,

    /// Batch size
    #[arg(long)]
    limit: Option<u64>,

    /// Send points every refresh seconds (daemon mode)
    #[arg(long)]
    refresh: Option<u64>,

    /// Skip or retire files untouched for this many seconds
    #[arg(long = "files-old")]
    files_old: Option<u64>,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            filepath: self.filepath.clone(),
            format: self.format.clone(),
            influx_url: self.influxurl.clone(),
            influx_db: self.influxdb.clone(),
            influx_user: self.influxuser.clone(),
            influx_pass: self.influxpass.clone(),
            geoip_db: self.geoipdb.clone(),
            daemon: self.daemon.then_some(true),
            poll: self.poll.then_some(true),
            preview: self.preview.then_some(true),
            limit: self.limit,
            refresh: self.refresh,
            files_old: self.files_old,
            debug: self.debug.then_some(true),
        }
    }

    fn load(&self) -> Result<Config> {
        let config = Config::load(self.config.as_deref(), &self.overrides())
            .context("Failed to load configuration")?;
        Ok(config)
    }
}

/// Entry function for CLI
pub async fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => ship(args).await,
        Commands::Validate(args) => validate_config(args),
        Commands::Version => {
            show_version();
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Request shipper failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

//
// ------------------------ Command Implementations ------------------------------
//

async fn ship(args: RunArgs) -> Result<ExitCode> {
    let config = args.load()?;

    let _guard = match init_tracing(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging disabled: {e}");
            None
        }
    };
    init_panic_handler();

    let config = config.validate().context("Invalid configuration")?;
    let outcome = runtime::runtime::run_shipper(config).await?;

    Ok(match outcome {
        RunOutcome::Completed | RunOutcome::Interrupted => ExitCode::SUCCESS,
        RunOutcome::Aborted => ExitCode::FAILURE,
    })
}

/// Validate configuration and print the effective settings
fn validate_config(args: RunArgs) -> Result<ExitCode> {
    let config = args.load()?.validate().context("Invalid configuration")?;
    println!("Configuration valid:\n{}", config.to_toml()?);
    Ok(ExitCode::SUCCESS)
}

/// Show version information
fn show_version() {
    println!("request-shipper {}", env!("CARGO_PKG_VERSION"));
}

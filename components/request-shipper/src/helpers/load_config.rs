//! Runtime configuration.
//!
//! Sources are layered lowest to highest priority: built-in defaults, an
//! optional TOML file, `SHIPPER__SECTION__KEY` environment variables and
//! finally command-line overrides. The result is validated once and shared
//! read-only for the rest of the process.

// External crates
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::instrument;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "SHIPPER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("files.path must not be empty")]
    EmptyPath,

    #[error("delivery to influx requires {0}, set it or enable preview")]
    MissingInfluxSetting(&'static str),

    #[error("output.batch_size must be at least 1")]
    InvalidBatchSize,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// InfluxDB line protocol
    #[default]
    Influx,
    /// One JSON document per request
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Influx => f.write_str("influx"),
            Self::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Log files to analyze, glob patterns allowed.
    pub path: String,
    /// Keep following files and rescan the glob.
    pub daemon: bool,
    /// Poll for growth instead of filesystem notifications.
    pub poll: bool,
    pub poll_interval_ms: u64,
    /// Files untouched for longer than this are skipped or retired.
    pub stale_after_secs: u64,
    pub stale_check_interval_secs: u64,
    pub rescan_interval_secs: u64,
    /// Lines whose request is older than this are dropped. Unset keeps everything.
    pub max_line_age_secs: Option<u64>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            path: "/var/log/nginx/access.log".to_string(),
            daemon: false,
            poll: false,
            poll_interval_ms: 250,
            stale_after_secs: 86_400,
            stale_check_interval_secs: 60,
            rescan_interval_secs: 60,
            max_line_age_secs: None,
        }
    }
}

impl FilesConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_interval_secs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn max_line_age(&self) -> Option<Duration> {
        self.max_line_age_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    /// Print records to stdout instead of delivering them.
    pub preview: bool,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Influx,
            preview: false,
            batch_size: 2000,
            flush_interval_secs: 120,
        }
    }
}

impl OutputConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub timeout_ms: u64,
    /// Retries of the initial connection probe and of each health check.
    pub connect_retries: u32,
    pub retry_initial_ms: u64,
    pub retry_step_ms: u64,
    pub health_check_interval_secs: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            database: String::new(),
            username: String::new(),
            password: String::new(),
            timeout_ms: 10_000,
            connect_retries: 5,
            retry_initial_ms: 5_000,
            retry_step_ms: 1_000,
            health_check_interval_secs: 120,
        }
    }
}

impl fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("url", &self.url)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout_ms", &self.timeout_ms)
            .field("connect_retries", &self.connect_retries)
            .field("retry_initial_ms", &self.retry_initial_ms)
            .field("retry_step_ms", &self.retry_step_ms)
            .field("health_check_interval_secs", &self.health_check_interval_secs)
            .finish()
    }
}

impl InfluxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_step(&self) -> Duration {
        Duration::from_millis(self.retry_step_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoipConfig {
    pub database: PathBuf,
}

impl Default for GeoipConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("GeoLite2-City.mmdb"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub debug: bool,
    pub json: bool,
    /// Also write daily-rotated log files here.
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve prometheus metrics on this address, e.g. `127.0.0.1:9100`.
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub files: FilesConfig,
    pub output: OutputConfig,
    pub influx: InfluxConfig,
    pub geoip: GeoipConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Command-line values that take precedence over every other source.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub filepath: Option<String>,
    pub format: Option<String>,
    pub influx_url: Option<String>,
    pub influx_db: Option<String>,
    pub influx_user: Option<String>,
    pub influx_pass: Option<String>,
    pub geoip_db: Option<String>,
    pub daemon: Option<bool>,
    pub poll: Option<bool>,
    pub preview: Option<bool>,
    pub limit: Option<u64>,
    pub refresh: Option<u64>,
    pub files_old: Option<u64>,
    pub debug: Option<bool>,
}

impl Config {
    /// Load the configuration from every source. Not validated yet.
    #[instrument(
        name = "config_loader",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            tracing::trace!(
                configuration_file_path = %path.display(),
                "Loading request shipper configuration file"
            );
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("files.path", overrides.filepath.clone())?
            .set_override_option("output.format", overrides.format.clone())?
            .set_override_option("influx.url", overrides.influx_url.clone())?
            .set_override_option("influx.database", overrides.influx_db.clone())?
            .set_override_option("influx.username", overrides.influx_user.clone())?
            .set_override_option("influx.password", overrides.influx_pass.clone())?
            .set_override_option("geoip.database", overrides.geoip_db.clone())?
            .set_override_option("files.daemon", overrides.daemon)?
            .set_override_option("files.poll", overrides.poll)?
            .set_override_option("output.preview", overrides.preview)?
            .set_override_option("output.batch_size", overrides.limit)?
            // The refresh period drives both batch flushing and health checks.
            .set_override_option("output.flush_interval_secs", overrides.refresh)?
            .set_override_option("influx.health_check_interval_secs", overrides.refresh)?
            .set_override_option("files.stale_after_secs", overrides.files_old)?
            .set_override_option("logging.debug", overrides.debug)?;

        let config: Config = builder.build()?.try_deserialize()?;
        tracing::trace!("Request shipper configuration loaded");
        Ok(config)
    }

    /// Normalize conflicting flags (with a warning) and reject unusable settings.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.files.poll && !self.files.daemon {
            tracing::warn!("Setting poll to false due to not daemon mode");
            self.files.poll = false;
        }
        if self.output.format == OutputFormat::Json && !self.output.preview {
            tracing::warn!("Setting preview to true due to json format");
            self.output.preview = true;
        }
        if self.files.path.trim().is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        if !self.output.preview {
            if self.influx.url.trim().is_empty() {
                return Err(ConfigError::MissingInfluxSetting("influx.url"));
            }
            if self.influx.database.trim().is_empty() {
                return Err(ConfigError::MissingInfluxSetting("influx.database"));
            }
        }
        if self.output.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        let intervals = [
            ("output.flush_interval_secs", self.output.flush_interval_secs),
            (
                "influx.health_check_interval_secs",
                self.influx.health_check_interval_secs,
            ),
            ("files.poll_interval_ms", self.files.poll_interval_ms),
            (
                "files.stale_check_interval_secs",
                self.files.stale_check_interval_secs,
            ),
            ("files.rescan_interval_secs", self.files.rescan_interval_secs),
            ("influx.timeout_ms", self.influx.timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroInterval(*name));
        }

        Ok(self)
    }

    /// Effective configuration as TOML, with the influx password masked.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if !shown.influx.password.is_empty() {
            shown.influx.password = "********".to_string();
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}

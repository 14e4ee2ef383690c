use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::sync::PassErrorPolicy;
use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "fde-rs",
    version,
    about = "Export daily heart-rate readings into InfluxDB or SQLite"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Owner recorded on every exported reading
    #[arg(short = 'u', long, global = true, env = "FDE_USERNAME", default_value = "")]
    pub username: String,

    /// First day to export: a date (2019/06/01 or 2019-06-01) or a lookback
    /// such as 48h, counted back from now and rounded down to midnight
    #[arg(long, global = true, env = "FDE_START_DATE")]
    pub starting_date: Option<String>,

    /// Store readings in this SQLite database instead of InfluxDB
    #[arg(long, global = true, env = "FDE_SQLITE_PATH")]
    pub sqlite_path: Option<String>,

    /// InfluxDB base URL
    #[arg(
        long,
        global = true,
        env = "FDE_INFLUXDB_URL",
        default_value = "http://localhost:8086"
    )]
    pub influxdb_url: String,

    /// InfluxDB database name
    #[arg(
        long,
        global = true,
        env = "FDE_INFLUXDB_DATABASE",
        default_value = "fitbit-data"
    )]
    pub influxdb_database: String,

    /// InfluxDB username
    #[arg(long, global = true, env = "FDE_INFLUXDB_USERNAME")]
    pub influxdb_username: Option<String>,

    /// InfluxDB password.
    /// WARNING: passing via --influxdb-password is visible in process listings.
    /// Prefer the FDE_INFLUXDB_PASSWORD environment variable instead.
    #[arg(long, global = true, env = "FDE_INFLUXDB_PASSWORD", hide_env_values = true)]
    pub influxdb_password: Option<String>,

    /// Readings buffered before a write is forced
    #[arg(long, global = true, env = "FDE_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Seconds between periodic flushes of buffered readings
    #[arg(long, global = true, env = "FDE_BATCH_INTERVAL", default_value_t = 5)]
    pub batch_interval: u64,

    /// Seconds between attempts to create the InfluxDB database at startup
    #[arg(long, global = true, env = "FDE_SETUP_RETRY_PERIOD", default_value_t = 2)]
    pub setup_retry_period: u64,

    /// Seconds to keep retrying InfluxDB setup before giving up
    #[arg(long, global = true, env = "FDE_SETUP_RETRY_TIMEOUT", default_value_t = 120)]
    pub setup_retry_timeout: u64,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, value_enum, env = "FDE_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Export from an unpacked download of personal data
    #[command(visible_alias = "off")]
    Offline(OfflineArgs),

    /// Export from the online intraday API
    #[command(visible_alias = "a")]
    Api(ApiArgs),
}

#[derive(Args, Debug)]
pub struct OfflineArgs {
    /// Folder containing heart_rate-YYYY-MM-DD.json files
    /// (default: ~/.local/fitbit-data-exporter/)
    #[arg(long, env = "FDE_DIR_PATH")]
    pub dir_path: Option<String>,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    /// OAuth2 credentials file holding the access token
    /// (default: <config dir>/fitbit-oauth2.json)
    #[arg(long, env = "FDE_API_OAUTH2_CONF_FILE")]
    pub conf_file: Option<String>,

    /// Access token to use instead of the credentials file. It is never
    /// refreshed.
    #[arg(long, env = "FDE_API_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// OAuth2 client id used to refresh the access token
    /// (overrides ClientID in the credentials file)
    #[arg(long, env = "FDE_API_CLIENT_ID", requires = "client_secret")]
    pub client_id: Option<String>,

    /// OAuth2 client secret used to refresh the access token
    #[arg(long, env = "FDE_API_CLIENT_SECRET", hide_env_values = true, requires = "client_id")]
    pub client_secret: Option<String>,

    /// OAuth2 token endpoint
    #[arg(long, env = "FDE_API_TOKEN_URL", default_value = crate::source::oauth2::DEFAULT_TOKEN_URL)]
    pub token_url: String,

    /// Intraday heart-rate endpoint
    #[arg(long, env = "FDE_API_BASE_URL", default_value = crate::source::api::DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Intraday detail level (1sec or 1min)
    #[arg(long, env = "FDE_API_PRECISION", default_value = crate::source::api::DEFAULT_PRECISION)]
    pub precision: String,

    /// Keep running, exporting each new day as it completes
    #[arg(long, env = "FDE_API_DAEMON")]
    pub daemon: bool,

    /// In daemon mode, what to do when a pass fails
    #[arg(long, value_enum, env = "FDE_API_ON_PASS_ERROR", default_value = "stop")]
    pub on_pass_error: PassErrorPolicy,
}

impl ApiArgs {
    pub(crate) fn default_conf_file() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fitbit-oauth2.json")
    }
}

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate};

use crate::cli::{ApiArgs, Cli, Command};
use crate::model::start_of_day;
use crate::retry::DeadlineConfig;
use crate::source::OfflineSource;
use crate::storage::{BatchConfig, InfluxConfig};
use crate::sync::PassErrorPolicy;
use crate::types::LogLevel;

/// Where readings come from.
#[derive(Debug)]
pub enum SourceConfig {
    Offline {
        dir: PathBuf,
    },
    Api {
        conf_file: PathBuf,
        access_token: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
        token_url: String,
        base_url: String,
        precision: String,
        daemon: bool,
        on_pass_error: PassErrorPolicy,
    },
}

/// Where readings go.
#[derive(Debug)]
pub enum StorageConfig {
    Sqlite(PathBuf),
    Influx(InfluxConfig),
}

/// Application configuration.
pub struct Config {
    pub owner: String,
    pub since: DateTime<Local>,
    pub source: SourceConfig,
    pub storage: StorageConfig,
    pub batch: BatchConfig,
    pub setup: DeadlineConfig,
    pub log_level: LogLevel,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            SourceConfig::Offline { .. } => "offline",
            SourceConfig::Api { .. } => "api",
        };
        f.debug_struct("Config")
            .field("owner", &self.owner)
            .field("since", &self.since)
            .field("source", &source)
            .field("storage", &self.storage)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let starting_date = cli
            .starting_date
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--starting-date is required"))?;
        let since = parse_starting_date(starting_date, Local::now())?;

        if cli.batch_size == 0 {
            anyhow::bail!("--batch-size must be at least 1");
        }

        let source = match cli.command {
            Command::Offline(args) => {
                let dir = match args.dir_path {
                    Some(d) => expand_tilde(&d),
                    None => OfflineSource::default_dir().ok_or_else(|| {
                        anyhow::anyhow!("cannot determine home directory, pass --dir-path")
                    })?,
                };
                SourceConfig::Offline { dir }
            }
            Command::Api(args) => SourceConfig::Api {
                conf_file: args
                    .conf_file
                    .map(|f| expand_tilde(&f))
                    .unwrap_or_else(ApiArgs::default_conf_file),
                access_token: args.access_token,
                client_id: args.client_id,
                client_secret: args.client_secret,
                token_url: args.token_url,
                base_url: args.base_url,
                precision: args.precision,
                daemon: args.daemon,
                on_pass_error: args.on_pass_error,
            },
        };

        let storage = match cli.sqlite_path {
            Some(path) => StorageConfig::Sqlite(expand_tilde(&path)),
            None => StorageConfig::Influx(InfluxConfig {
                url: cli.influxdb_url,
                database: cli.influxdb_database,
                username: cli.influxdb_username.filter(|u| !u.is_empty()),
                password: cli.influxdb_password.filter(|p| !p.is_empty()),
            }),
        };

        Ok(Self {
            owner: cli.username,
            since,
            source,
            storage,
            batch: BatchConfig {
                batch_size: cli.batch_size,
                flush_interval: Duration::from_secs(cli.batch_interval),
            },
            setup: DeadlineConfig {
                period: Duration::from_secs(cli.setup_retry_period),
                timeout: Duration::from_secs(cli.setup_retry_timeout),
            },
            log_level: cli.log_level,
        })
    }
}

/// Parse the first day to export.
///
/// Accepts:
/// - Calendar date: `"2019/06/01"` or `"2019-06-01"` (midnight local time)
/// - Lookback from `now`: `"48h"`, `"20d"`, `"90m"`, `"1h30m"`, rounded down
///   to midnight of the day it lands on
pub(crate) fn parse_starting_date(s: &str, now: DateTime<Local>) -> anyhow::Result<DateTime<Local>> {
    for format in ["%Y/%m/%d", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                if let Some(dt) = midnight.and_local_timezone(Local).earliest() {
                    return Ok(dt);
                }
            }
        }
    }
    if let Some(lookback) = parse_lookback(s) {
        let since = now
            .checked_sub_signed(lookback)
            .ok_or_else(|| anyhow::anyhow!("Lookback '{}' reaches before the supported date range", s))?;
        return Ok(start_of_day(since));
    }
    anyhow::bail!(
        "Cannot parse '{}' as a starting date. Expected a date (2019/06/01 or 2019-06-01) \
         or a lookback (48h, 20d, 90m)",
        s
    )
}

/// Sum of `<integer><unit>` segments with units `d`, `h`, `m` or `s`.
fn parse_lookback(s: &str) -> Option<chrono::Duration> {
    if s.is_empty() {
        return None;
    }
    let mut total = chrono::Duration::zero();
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits.parse().ok()?;
        digits.clear();
        let segment = match c {
            'd' => chrono::Duration::try_days(n)?,
            'h' => chrono::Duration::try_hours(n)?,
            'm' => chrono::Duration::try_minutes(n)?,
            's' => chrono::Duration::try_seconds(n)?,
            _ => return None,
        };
        total = total.checked_add(&segment)?;
    }
    // Trailing digits without a unit.
    if !digits.is_empty() {
        return None;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clap::Parser;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 20, 15, 30, 0).unwrap()
    }

    fn midnight(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Documents");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Documents"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(
            expand_tilde("/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            expand_tilde("relative/path"),
            PathBuf::from("relative/path")
        );
    }

    #[test]
    fn test_parse_slash_date() {
        assert_eq!(
            parse_starting_date("2019/06/01", now()).unwrap(),
            midnight(2019, 6, 1)
        );
    }

    #[test]
    fn test_parse_dash_date() {
        assert_eq!(
            parse_starting_date("2019-06-01", now()).unwrap(),
            midnight(2019, 6, 1)
        );
    }

    #[test]
    fn test_parse_lookback_floors_to_midnight() {
        assert_eq!(
            parse_starting_date("48h", now()).unwrap(),
            midnight(2024, 6, 18)
        );
        assert_eq!(
            parse_starting_date("20d", now()).unwrap(),
            midnight(2024, 5, 31)
        );
        // 15:30 - 16h lands on the previous day.
        assert_eq!(
            parse_starting_date("16h", now()).unwrap(),
            midnight(2024, 6, 19)
        );
        assert_eq!(
            parse_starting_date("1h30m", now()).unwrap(),
            midnight(2024, 6, 20)
        );
    }

    #[test]
    fn test_parse_invalid_starting_date() {
        assert!(parse_starting_date("not-a-date", now()).is_err());
        assert!(parse_starting_date("", now()).is_err());
        assert!(parse_starting_date("48", now()).is_err());
        assert!(parse_starting_date("h", now()).is_err());
        assert!(parse_starting_date("3w", now()).is_err());
    }

    #[test]
    fn test_parse_lookback_out_of_range_is_error() {
        let err = parse_starting_date("100000000000d", now()).unwrap_err();
        assert!(err.to_string().contains("supported date range"));
    }

    #[test]
    fn test_from_cli_requires_starting_date() {
        let cli = Cli::try_parse_from(["fde-rs", "offline", "--dir-path", "/data"]).unwrap();
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn test_from_cli_sqlite_wins_over_influx() {
        let cli = Cli::try_parse_from([
            "fde-rs",
            "--starting-date",
            "2019/06/01",
            "--sqlite-path",
            "/tmp/hr.db",
            "offline",
            "--dir-path",
            "/data",
        ])
        .unwrap();
        let cfg = Config::from_cli(cli).unwrap();
        assert!(matches!(cfg.storage, StorageConfig::Sqlite(ref p) if p == &PathBuf::from("/tmp/hr.db")));
        assert!(matches!(cfg.source, SourceConfig::Offline { ref dir } if dir == &PathBuf::from("/data")));
        assert_eq!(cfg.since, midnight(2019, 6, 1));
    }

    #[test]
    fn test_from_cli_influx_settings() {
        let cli = Cli::try_parse_from([
            "fde-rs",
            "api",
            "--starting-date",
            "2019-06-01",
            "--influxdb-url",
            "http://influx:8086",
            "--influxdb-username",
            "admin",
            "--batch-size",
            "50",
            "--conf-file",
            "/etc/fde/oauth2.json",
        ])
        .unwrap();
        let cfg = Config::from_cli(cli).unwrap();
        let StorageConfig::Influx(influx) = &cfg.storage else {
            panic!("expected InfluxDB storage");
        };
        assert_eq!(influx.url, "http://influx:8086");
        assert_eq!(influx.database, "fitbit-data");
        assert_eq!(influx.username.as_deref(), Some("admin"));
        assert_eq!(cfg.batch.batch_size, 50);
        assert_eq!(cfg.setup.timeout, Duration::from_secs(120));
        let SourceConfig::Api {
            conf_file,
            daemon,
            client_id,
            token_url,
            ..
        } = &cfg.source
        else {
            panic!("expected api source");
        };
        assert_eq!(conf_file, &PathBuf::from("/etc/fde/oauth2.json"));
        assert!(!daemon);
        assert!(client_id.is_none());
        assert_eq!(token_url, "https://api.fitbit.com/oauth2/token");
    }

    #[test]
    fn test_from_cli_rejects_zero_batch_size() {
        let cli = Cli::try_parse_from([
            "fde-rs",
            "offline",
            "--starting-date",
            "2019-06-01",
            "--batch-size",
            "0",
        ])
        .unwrap();
        assert!(Config::from_cli(cli).is_err());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Directives for the base log filter: `rust_log` when it is set and
    /// valid, otherwise this level.
    pub fn resolve_filter(self, rust_log: Option<&str>) -> String {
        rust_log
            .filter(|f| !f.is_empty() && tracing_subscriber::EnvFilter::try_new(f).is_ok())
            .map(str::to_string)
            .unwrap_or_else(|| self.as_filter().to_string())
    }
}

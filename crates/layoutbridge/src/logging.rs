use clap::{Args, ValueEnum};
use tracing::level_filters::LevelFilter;

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Stderr logging flags shared by every subcommand.
#[derive(Args, Debug, Clone, Copy)]
pub struct LogOptions {
    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        env = "LAYOUTBRIDGE_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    pub log_level: LogLevel,
}

impl LogOptions {
    /// Install the global subscriber. The bridge logs from several threads,
    /// so thread names are included.
    pub fn init(self) {
        let builder = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(LevelFilter::from(self.log_level))
            .with_ansi(false)
            .with_target(false)
            .with_thread_names(true);

        match self.log_format {
            LogFormat::Text => {
                let _ = builder.try_init();
            }
            LogFormat::Json => {
                let _ = builder.json().flatten_event(true).try_init();
            }
        }
    }
}

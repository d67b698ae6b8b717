//! Command-line surface, defined with `clap`'s derive API the same way the
//! donor binary's `Args` struct is.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Mirrors the upstream tool's level vocabulary so an operator porting a
/// config from it doesn't need to relearn level names; `SUCCESS` and
/// `CRITICAL` have no counterpart in `log::LevelFilter` and collapse onto
/// `Info`/`Error` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum LoggingLevel {
    Trace,
    Debug,
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

impl LoggingLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LoggingLevel::Trace => log::LevelFilter::Trace,
            LoggingLevel::Debug => log::LevelFilter::Debug,
            LoggingLevel::Info | LoggingLevel::Success => log::LevelFilter::Info,
            LoggingLevel::Warning => log::LevelFilter::Warn,
            LoggingLevel::Error | LoggingLevel::Critical => log::LevelFilter::Error,
        }
    }
}

/// Per-process traffic shaper: builds an HTB topology over `device` and
/// reconciles per-group port filters against the processes `config`
/// describes.
#[derive(Debug, Parser)]
#[command(name = "shaperctl", about, version)]
pub struct Args {
    /// Network interface to shape, e.g. eth0.
    pub device: String,

    /// Path to the YAML configuration document.
    pub config: PathBuf,

    /// Seconds between reconciliation ticks.
    #[arg(short = 'd', long = "delay", default_value_t = 1.0)]
    pub delay: f64,

    /// Minimum severity of log messages to emit.
    #[arg(short = 'l', long = "logging-level", value_enum, default_value = "INFO")]
    pub logging_level: LoggingLevel,

    /// Measure the link's actual speed and use it in place of configured
    /// global rates.
    #[arg(short = 's', long = "speed-test")]
    pub speed_test: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_required_positionals() {
        let args = Args::parse_from(["shaperctl", "eth0", "config.yaml"]);
        assert_eq!(args.device, "eth0");
        assert_eq!(args.delay, 1.0);
        assert_eq!(args.logging_level, LoggingLevel::Info);
        assert!(!args.speed_test);
    }

    #[test]
    fn parses_optional_flags() {
        let args = Args::parse_from([
            "shaperctl",
            "eth0",
            "config.yaml",
            "--delay",
            "2.5",
            "--logging-level",
            "DEBUG",
            "--speed-test",
        ]);
        assert_eq!(args.delay, 2.5);
        assert_eq!(args.logging_level, LoggingLevel::Debug);
        assert!(args.speed_test);
    }
}

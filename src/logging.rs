//! Logging initialization — wires the chosen `--logging-level` into
//! `pretty_env_logger`, the same formatter the donor binary initializes in
//! `main`.

use crate::cli::LoggingLevel;

pub fn init(level: LoggingLevel) {
    pretty_env_logger::formatted_builder()
        .filter_level(level.to_filter())
        .parse_default_env()
        .init();
}

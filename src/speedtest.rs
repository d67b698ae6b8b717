//! Speed-test integration — invokes whichever `speedtest` binary is on
//! `PATH` to measure the link's actual throughput, so the controller can
//! override configured global rates with a live measurement (spec §6).
//!
//! Two incompatible tools answer to the name `speedtest`: Ookla's official
//! CLI and the `sivel/speedtest-cli` Python reimplementation. They're told
//! apart the same way the donor Python tool does it — by sniffing the
//! first line of `speedtest --version` — since their JSON output shapes
//! and flags differ.

use crate::error::ShaperError;
use crate::runner::Runner;
use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Ookla,
    Sivel,
}

/// Measured link speeds, in bits per second.
#[derive(Debug, Clone, Copy)]
pub struct MeasuredSpeed {
    pub download_bps: f64,
    pub upload_bps: f64,
}

#[derive(Debug, Deserialize)]
struct OoklaResult {
    download: OoklaDirection,
    upload: OoklaDirection,
}

#[derive(Debug, Deserialize)]
struct OoklaDirection {
    bandwidth: f64,
}

#[derive(Debug, Deserialize)]
struct SivelResult {
    download: f64,
    upload: f64,
}

fn detect_flavor(runner: &Runner) -> Result<Flavor> {
    let out = runner
        .run("speedtest --version", true)
        .context("failed to run speedtest --version")?;
    let first_line = out.stdout.lines().next().unwrap_or_default();
    if first_line.starts_with("Speedtest by Ookla") {
        Ok(Flavor::Ookla)
    } else {
        Ok(Flavor::Sivel)
    }
}

/// Runs a speed test and returns the measured link speed. Any failure
/// (missing binary, unparseable output) is surfaced to the caller, which
/// falls back to the configured rates per spec §6.
pub fn measure(runner: &Runner) -> Result<MeasuredSpeed> {
    let flavor = detect_flavor(runner)?;

    match flavor {
        Flavor::Ookla => {
            let out = runner.run("speedtest --format=json --accept-license --accept-gdpr", true)?;
            let parsed: OoklaResult = serde_json::from_str(&out.stdout).map_err(|e| {
                ShaperError::DependencyOutputError {
                    command: "speedtest (Ookla)".to_string(),
                    detail: e.to_string(),
                }
            })?;
            // Ookla reports bandwidth in bytes/sec.
            Ok(MeasuredSpeed {
                download_bps: parsed.download.bandwidth * 8.0,
                upload_bps: parsed.upload.bandwidth * 8.0,
            })
        }
        Flavor::Sivel => {
            let out = runner.run("speedtest --json", true)?;
            let parsed: SivelResult = serde_json::from_str(&out.stdout).map_err(|e| {
                ShaperError::DependencyOutputError {
                    command: "speedtest-cli".to_string(),
                    detail: e.to_string(),
                }
            })?;
            // sivel/speedtest-cli already reports bits/sec.
            Ok(MeasuredSpeed {
                download_bps: parsed.download,
                upload_bps: parsed.upload,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ookla_version_line_is_detected() {
        let line = "Speedtest by Ookla 1.2.0.84 (Linux)";
        assert!(line.starts_with("Speedtest by Ookla"));
    }

    #[test]
    fn parses_ookla_json() {
        let doc = r#"{"download":{"bandwidth":12500000},"upload":{"bandwidth":1250000}}"#;
        let parsed: OoklaResult = serde_json::from_str(doc).unwrap();
        assert_eq!(parsed.download.bandwidth, 12_500_000.0);
    }

    #[test]
    fn parses_sivel_json() {
        let doc = r#"{"download":100000000.0,"upload":10000000.0}"#;
        let parsed: SivelResult = serde_json::from_str(doc).unwrap();
        assert_eq!(parsed.download, 100_000_000.0);
    }
}

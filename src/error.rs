//! Typed error taxonomy for the shaping controller.
//!
//! Leaf operations return `ShaperError` so the top-level handler can match on
//! kind (fatal vs. logged-and-continue); everything above that uses
//! `anyhow::Result` with `.context(...)` for call-site detail, the same
//! pairing `patronus-config` uses elsewhere in this stack.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShaperError {
    #[error("missing dependency: {hint}")]
    MissingDependency { hint: String },

    #[error("could not interpret output of {command}: {detail}")]
    DependencyOutputError { command: String, detail: String },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("kernel operation failed: {command} (exit {exit_code:?})")]
    KernelOpFailure { command: String, exit_code: Option<i32> },

    #[error("process {pid} vanished mid-evaluation")]
    RaceOnProcess { pid: i32 },
}

//! Error types for the probing pipeline.
//!
//! Only [`ProbeError::ConfigTemplate`] is fatal to a run, and only when it is
//! raised while loading the shared template. Every other variant is scoped to
//! a single domain: the scheduler logs it and moves on.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("proxy template is invalid: {0}")]
    ConfigTemplate(String),

    #[error("could not write proxy config {}: {source}", .path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no free port pair after {attempts} attempts")]
    PortExhaustion { attempts: u32 },

    #[error("could not launch proxy {}: {source}", .program.display())]
    ProcessLaunch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy did not open port {port} within {}ms", .waited.as_millis())]
    ReadinessTimeout { port: u16, waited: Duration },

    #[error("proxy exited before opening port {port}")]
    ProxyExited { port: u16 },

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("probe timed out after {}ms", .limit.as_millis())]
    ProbeTimeout { limit: Duration },

    #[error("probe got unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("could not append to result ledger: {0}")]
    LedgerWrite(#[from] std::io::Error),
}

impl ProbeError {
    pub fn template(reason: impl Into<String>) -> Self {
        Self::ConfigTemplate(reason.into())
    }

    /// Short tag printed in the progress table for a failed domain.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ConfigTemplate(_) => "template",
            Self::ConfigWrite { .. } => "config-write",
            Self::PortExhaustion { .. } => "no-ports",
            Self::ProcessLaunch { .. } => "launch",
            Self::ReadinessTimeout { .. } => "not-ready",
            Self::ProxyExited { .. } => "proxy-exited",
            Self::Probe(_) => "probe-failed",
            Self::ProbeTimeout { .. } => "timeout",
            Self::UnexpectedStatus(_) => "bad-status",
            Self::Panicked(_) => "panic",
            Self::LedgerWrite(_) => "ledger",
        }
    }
}

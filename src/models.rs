use crate::error::ProbeError;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingProfile {
    pub concurrency: usize,
    pub connect_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub ready_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainTask {
    pub domain: String,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub socks: u16,
    pub http: u16,
}

#[derive(Debug, Clone)]
pub struct ProxyConfigArtifact {
    pub path: PathBuf,
    pub domain: String,
    pub ports: PortPair,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Success { domain: String, latency_ms: u64 },
    Failure { domain: String, reason: ProbeError },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
    pub interrupted: bool,
    /// Failed domains counted per [`ProbeError::label`].
    pub failures: BTreeMap<&'static str, usize>,
}

impl RunSummary {
    pub fn count_failure(&mut self, reason: &ProbeError) {
        self.failed += 1;
        *self.failures.entry(reason.label()).or_default() += 1;
    }

    pub fn failures_labelled(&self, label: &str) -> usize {
        self.failures.get(label).copied().unwrap_or(0)
    }
}

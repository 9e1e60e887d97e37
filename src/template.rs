//! Per-domain proxy configuration rendering.
//!
//! The base template is parsed once and shared read-only between workers.
//! Each task renders a private copy with its own Host value and listener
//! ports and writes it to `config_<index>.json` inside the work directory.

use crate::error::{ProbeError, Result};
use crate::models::{DomainTask, PortPair, ProxyConfigArtifact};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_HOST_POINTER: &str =
    "/outbounds/0/streamSettings/tcpSettings/header/request/headers/Host";

/// Task index reserved for the preflight run.
pub const PREFLIGHT_INDEX: usize = usize::MAX;

#[derive(Debug)]
pub struct ProxyTemplate {
    document: Value,
    socks_inbound: usize,
    http_inbound: usize,
    host_parent: String,
    host_key: String,
}

impl ProxyTemplate {
    pub fn load(path: &Path, host_pointer: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            ProbeError::template(format!("cannot read {}: {error}", path.display()))
        })?;
        Self::parse(&raw, host_pointer)
    }

    pub fn parse(raw: &str, host_pointer: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(raw)
            .map_err(|error| ProbeError::template(format!("not valid JSON: {error}")))?;

        let inbounds = document
            .get("inbounds")
            .and_then(Value::as_array)
            .ok_or_else(|| ProbeError::template("missing `inbounds` array"))?;

        if inbounds.len() < 2 || !inbounds.iter().take(2).all(Value::is_object) {
            return Err(ProbeError::template(
                "`inbounds` needs a SOCKS and an HTTP listener entry",
            ));
        }

        let (socks_inbound, http_inbound) = resolve_listeners(inbounds);
        let (host_parent, host_key) = split_pointer(host_pointer)?;

        let parent_is_object = document
            .pointer(&host_parent)
            .map(Value::is_object)
            .unwrap_or(false);
        if !parent_is_object {
            return Err(ProbeError::template(format!(
                "no object at `{host_parent}` to hold the Host header"
            )));
        }

        Ok(Self {
            document,
            socks_inbound,
            http_inbound,
            host_parent,
            host_key,
        })
    }

    /// Deep copy of the template with the per-domain fields substituted.
    pub fn instantiate(&self, domain: &str, ports: PortPair) -> Value {
        let mut config = self.document.clone();

        if let Some(inbounds) = config.get_mut("inbounds").and_then(Value::as_array_mut) {
            inbounds[self.socks_inbound]["port"] = Value::from(ports.socks);
            inbounds[self.http_inbound]["port"] = Value::from(ports.http);
        }

        if let Some(Value::Object(headers)) = config.pointer_mut(&self.host_parent) {
            headers.insert(self.host_key.clone(), Value::from(domain));
        }

        config
    }
}

/// Picks listener entries by their `protocol` tag. An untagged side takes
/// the first object entry the other side did not claim.
fn resolve_listeners(inbounds: &[Value]) -> (usize, usize) {
    let tagged = |name: &str| {
        inbounds
            .iter()
            .position(|inbound| inbound.get("protocol").and_then(Value::as_str) == Some(name))
    };
    let unclaimed = |claimed: Option<usize>| {
        (0..inbounds.len())
            .find(|index| Some(*index) != claimed && inbounds[*index].is_object())
            .unwrap_or(0)
    };

    let socks_tag = tagged("socks");
    let http_tag = tagged("http");

    let socks = socks_tag.unwrap_or_else(|| unclaimed(http_tag));
    let http = http_tag.unwrap_or_else(|| unclaimed(Some(socks)));

    (socks, http)
}

fn split_pointer(pointer: &str) -> Result<(String, String)> {
    let (parent, key) = pointer
        .rsplit_once('/')
        .filter(|(_, key)| !key.is_empty())
        .ok_or_else(|| ProbeError::template(format!("invalid Host pointer `{pointer}`")))?;

    if !parent.is_empty() && !parent.starts_with('/') {
        return Err(ProbeError::template(format!(
            "Host pointer `{pointer}` must start with '/'"
        )));
    }

    Ok((parent.to_string(), key.replace("~1", "/").replace("~0", "~")))
}

#[derive(Debug)]
pub struct ConfigFactory {
    template: ProxyTemplate,
    work_dir: PathBuf,
}

impl ConfigFactory {
    pub fn new(template: ProxyTemplate, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            template,
            work_dir: work_dir.into(),
        }
    }

    pub fn artifact_path(&self, index: usize) -> PathBuf {
        if index == PREFLIGHT_INDEX {
            return self.work_dir.join("config_preflight.json");
        }
        self.work_dir.join(format!("config_{index}.json"))
    }

    pub async fn render(&self, task: &DomainTask, ports: PortPair) -> Result<ProxyConfigArtifact> {
        let path = self.artifact_path(task.index);
        let config = self.template.instantiate(&task.domain, ports);
        let body = serde_json::to_vec_pretty(&config).map_err(|error| ProbeError::ConfigWrite {
            path: path.clone(),
            source: error.into(),
        })?;

        tokio::fs::write(&path, body)
            .await
            .map_err(|source| ProbeError::ConfigWrite {
                path: path.clone(),
                source,
            })?;

        debug!(domain = %task.domain, path = %path.display(), "proxy config written");

        Ok(ProxyConfigArtifact {
            path,
            domain: task.domain.clone(),
            ports,
        })
    }

    pub async fn discard(&self, artifact: &ProxyConfigArtifact) {
        if let Err(error) = tokio::fs::remove_file(&artifact.path).await {
            debug!(path = %artifact.path.display(), %error, "could not remove proxy config");
        }
    }

    /// Removes whatever a task left at its artifact path. Used for tasks
    /// that were aborted before they could clean up after themselves.
    pub async fn sweep(&self, index: usize) {
        let path = self.artifact_path(index);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "stale proxy config removed"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => debug!(path = %path.display(), %error, "could not remove proxy config"),
        }
    }
}

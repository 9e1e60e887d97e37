use crate::error::{ProbeError, Result};
use reqwest::{Client, Proxy, StatusCode};
use std::time::{Duration, Instant};

pub const DEFAULT_PROBE_URL: &str = "https://www.gstatic.com/generate_204";

#[derive(Debug, Clone)]
pub struct LatencyProbe {
    url: String,
    connect_timeout: Duration,
    total_timeout: Duration,
}

impl LatencyProbe {
    pub fn new(url: impl Into<String>, connect_timeout: Duration, total_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            total_timeout,
        }
    }

    /// One GET through the local SOCKS listener. Returns the time to response
    /// headers in whole milliseconds; any failure disqualifies the domain.
    pub async fn measure(&self, socks_port: u16) -> Result<u64> {
        let proxy = Proxy::all(format!("socks5h://127.0.0.1:{socks_port}"))
            .map_err(|error| ProbeError::Probe(format!("bad proxy address: {error}")))?;

        let client = Client::builder()
            .proxy(proxy)
            .connect_timeout(self.connect_timeout)
            .timeout(self.total_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|error| ProbeError::Probe(format!("client setup failed: {error}")))?;

        let started = Instant::now();
        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|error| self.classify(&error))?;
        let elapsed = started.elapsed();

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(elapsed.as_millis() as u64),
            status => Err(ProbeError::UnexpectedStatus(status.as_u16())),
        }
    }

    fn classify(&self, error: &reqwest::Error) -> ProbeError {
        if error.is_timeout() {
            ProbeError::ProbeTimeout {
                limit: self.total_timeout,
            }
        } else if error.is_connect() {
            ProbeError::Probe(format!("connect failed: {error}"))
        } else {
            ProbeError::Probe(error.to_string())
        }
    }
}

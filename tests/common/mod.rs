#![allow(dead_code)]

use frontprobe::ledger::ResultLedger;
use frontprobe::probe::LatencyProbe;
use frontprobe::report::LiveReporter;
use frontprobe::scheduler::{Pipeline, Scheduler};
use frontprobe::supervisor::{ProcessSupervisor, ProxyCommand, SupervisorSettings};
use frontprobe::template::{ConfigFactory, ProxyTemplate, DEFAULT_HOST_POINTER};
use serde_json::{json, Value};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::AsyncWrite;

pub const PROBE_URL: &str = "http://probe.test/generate_204";

pub fn stub_path() -> &'static str {
    env!("CARGO_BIN_EXE_probe-stub")
}

pub fn domains(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// Scratch directory holding the template, work dir, pid files and ledger
/// for one scenario run against `probe-stub`.
pub struct Harness {
    pub dir: TempDir,
    pub work_dir: PathBuf,
    pub pid_dir: PathBuf,
    pub ledger_path: PathBuf,
    template: Value,
    pub ready_timeout: Duration,
    pub keep_configs: bool,
}

impl Harness {
    pub fn new(stub: Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("configs");
        let pid_dir = dir.path().join("pids");
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::create_dir_all(&pid_dir).unwrap();

        let mut stub = stub;
        stub["pid_dir"] = json!(pid_dir);

        let template = json!({
            "log": {"loglevel": "none"},
            "inbounds": [
                {"port": 0, "protocol": "socks"},
                {"port": 0, "protocol": "http"}
            ],
            "outbounds": [{
                "protocol": "freedom",
                "streamSettings": {"tcpSettings": {"header": {
                    "type": "http",
                    "request": {"headers": {"Host": ""}}
                }}}
            }],
            "stub": stub
        });

        Self {
            ledger_path: dir.path().join("result.csv"),
            dir,
            work_dir,
            pid_dir,
            template,
            ready_timeout: Duration::from_secs(3),
            keep_configs: false,
        }
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn keep_configs(mut self) -> Self {
        self.keep_configs = true;
        self
    }

    pub fn factory(&self) -> ConfigFactory {
        let template =
            ProxyTemplate::parse(&self.template.to_string(), DEFAULT_HOST_POINTER).unwrap();
        ConfigFactory::new(template, &self.work_dir)
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        let settings = SupervisorSettings {
            ready_timeout: self.ready_timeout,
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_millis(500),
        };
        ProcessSupervisor::new(ProxyCommand::new(stub_path()), settings)
    }

    pub async fn scheduler(&self, concurrency: usize) -> Scheduler {
        let ledger = ResultLedger::open(&self.ledger_path).await.unwrap();
        self.scheduler_with_ledger(concurrency, ledger)
    }

    pub fn scheduler_with_ledger(&self, concurrency: usize, ledger: ResultLedger) -> Scheduler {
        let pipeline = Pipeline::new(
            self.factory(),
            self.supervisor(),
            LatencyProbe::new(PROBE_URL, Duration::from_secs(1), Duration::from_secs(3)),
        )
        .keep_configs(self.keep_configs);

        Scheduler::new(pipeline, Arc::new(ledger), LiveReporter::new(false))
            .concurrency(concurrency)
    }

    pub fn ledger_text(&self) -> String {
        std::fs::read_to_string(&self.ledger_path).unwrap_or_default()
    }

    pub fn ledger_rows(&self) -> Vec<(String, u64)> {
        self.ledger_text()
            .lines()
            .skip(1)
            .map(|line| {
                let (domain, latency) = line.split_once(',').unwrap();
                (domain.to_string(), latency.parse().unwrap())
            })
            .collect()
    }

    pub fn pid_of(&self, host: &str) -> Option<u32> {
        let raw = std::fs::read_to_string(self.pid_dir.join(format!("{host}.pid"))).ok()?;
        raw.trim().parse().ok()
    }

    pub async fn wait_for_pid(&self, host: &str, limit: Duration) -> u32 {
        let started = Instant::now();
        loop {
            if let Some(pid) = self.pid_of(host) {
                return pid;
            }
            assert!(started.elapsed() < limit, "{host} never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// In-memory ledger sink that fails every line starting with `rejected`.
pub struct RejectingWriter {
    rejected: String,
    written: Arc<Mutex<Vec<u8>>>,
}

impl RejectingWriter {
    pub fn new(rejected: &str) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let writer = Self {
            rejected: rejected.to_string(),
            written: Arc::clone(&written),
        };
        (writer, written)
    }
}

impl AsyncWrite for RejectingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.starts_with(self.rejected.as_bytes()) {
            return Poll::Ready(Err(io::Error::other("disk quota exceeded")));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Whether `pid` is still a running process. Zombies count as terminated.
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Err(Errno::ESRCH) => false,
        _ => !is_zombie(pid),
    }
}

fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

pub async fn wait_until_dead(pid: u32, limit: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !process_alive(pid)
}

use crate::error::{ProbeError, Result};
use crate::ledger::ResultLedger;
use crate::models::{DomainTask, ProxyConfigArtifact, RunSummary, TaskOutcome};
use crate::ports::allocate_pair;
use crate::probe::LatencyProbe;
use crate::report::LiveReporter;
use crate::supervisor::ProcessSupervisor;
use crate::template::{ConfigFactory, PREFLIGHT_INDEX};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const MAX_CONCURRENCY: usize = 256;

pub fn clamp_concurrency(value: usize) -> usize {
    value.min(MAX_CONCURRENCY).max(1)
}

/// Config, proxy and probe stages for one domain.
#[derive(Debug)]
pub struct Pipeline {
    factory: ConfigFactory,
    supervisor: ProcessSupervisor,
    probe: LatencyProbe,
    keep_configs: bool,
}

impl Pipeline {
    pub fn new(
        factory: ConfigFactory,
        supervisor: ProcessSupervisor,
        probe: LatencyProbe,
    ) -> Self {
        Self {
            factory,
            supervisor,
            probe,
            keep_configs: false,
        }
    }

    pub fn keep_configs(mut self, keep: bool) -> Self {
        self.keep_configs = keep;
        self
    }

    pub async fn measure(&self, task: &DomainTask) -> Result<u64> {
        let ports = allocate_pair()?;
        let artifact = self.factory.render(task, ports).await?;
        let measured = self.measure_with(&artifact).await;

        if !self.keep_configs {
            self.factory.discard(&artifact).await;
        }

        measured
    }

    /// Clears the artifact of a task that was aborted mid-flight.
    pub async fn sweep(&self, index: usize) {
        if !self.keep_configs {
            self.factory.sweep(index).await;
        }
    }

    async fn measure_with(&self, artifact: &ProxyConfigArtifact) -> Result<u64> {
        let mut proxy = self.supervisor.launch(artifact)?;
        let measured = async {
            proxy.wait_ready().await?;
            proxy.mark_probing();
            self.probe.measure(artifact.ports.socks).await
        }
        .await;

        match proxy.shutdown().await {
            Ok(teardown) => debug!(domain = %artifact.domain, ?teardown, "proxy stopped"),
            Err(failure) => error!(
                domain = %artifact.domain,
                pid = proxy.pid(),
                %failure,
                "proxy teardown failed"
            ),
        }

        measured
    }
}

#[derive(Debug)]
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    ledger: Arc<ResultLedger>,
    reporter: LiveReporter,
    concurrency: usize,
    preflight_domain: Option<String>,
}

impl Scheduler {
    pub fn new(pipeline: Pipeline, ledger: Arc<ResultLedger>, reporter: LiveReporter) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            ledger,
            reporter,
            concurrency: 1,
            preflight_domain: None,
        }
    }

    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = clamp_concurrency(workers);
        self
    }

    pub fn preflight(mut self, domain: Option<String>) -> Self {
        self.preflight_domain = domain;
        self
    }

    /// Probes `domains[start_index..]` and returns once every task finished
    /// or `shutdown` resolved. On shutdown all workers are aborted and joined,
    /// which kills any proxy they still own.
    pub async fn run<S>(
        &self,
        domains: &[String],
        start_index: usize,
        shutdown: S,
    ) -> Result<RunSummary>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.ledger.ensure_header().await?;

        let jobs: Vec<DomainTask> = domains
            .iter()
            .enumerate()
            .skip(start_index)
            .map(|(index, domain)| DomainTask {
                domain: domain.clone(),
                index,
            })
            .collect();

        let mut summary = RunSummary {
            total: jobs.len(),
            ..RunSummary::default()
        };

        if let Some(domain) = &self.preflight_domain {
            tokio::select! {
                _ = self.run_preflight(domain) => {}
                _ = &mut shutdown => {
                    warn!("interrupted during preflight");
                    self.pipeline.sweep(PREFLIGHT_INDEX).await;
                    summary.interrupted = true;
                    self.reporter.summary(&summary);
                    return Ok(summary);
                }
            }
        }

        if jobs.is_empty() {
            info!(start_index, "nothing to probe");
            self.reporter.summary(&summary);
            return Ok(summary);
        }

        let worker_count = self.concurrency.min(jobs.len());
        info!(tasks = jobs.len(), workers = worker_count, "starting scan");
        self.reporter.table_header();

        let jobs = Arc::new(jobs);
        let job_cursor = Arc::new(AtomicUsize::new(0));
        let channel_capacity = worker_count.saturating_mul(4);
        let (tx, mut rx) = mpsc::channel::<(DomainTask, TaskOutcome)>(channel_capacity);

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let tx = tx.clone();
            let jobs = Arc::clone(&jobs);
            let job_cursor = Arc::clone(&job_cursor);
            let pipeline = Arc::clone(&self.pipeline);
            let ledger = Arc::clone(&self.ledger);

            workers.spawn(async move {
                loop {
                    let idx = job_cursor.fetch_add(1, Ordering::Relaxed);
                    if idx >= jobs.len() {
                        break;
                    }

                    let task = jobs[idx].clone();
                    let outcome = run_task(&pipeline, &ledger, &task).await;
                    if tx.send((task, outcome)).await.is_err() {
                        break;
                    }
                }
            });
        }

        drop(tx);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some((task, outcome)) => self.record(&task, outcome, &mut summary),
                    None => break,
                },
                _ = &mut shutdown => {
                    warn!(
                        completed = summary.succeeded + summary.failed,
                        "interrupted, stopping workers"
                    );
                    workers.shutdown().await;

                    let dispatched = job_cursor.load(Ordering::Relaxed).min(jobs.len());
                    for task in &jobs[..dispatched] {
                        self.pipeline.sweep(task.index).await;
                    }

                    summary.interrupted = true;
                    self.reporter.summary(&summary);
                    return Ok(summary);
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(failure) = joined {
                warn!(%failure, "scan worker aborted");
            }
        }

        self.reporter.summary(&summary);
        Ok(summary)
    }

    async fn run_preflight(&self, domain: &str) {
        let task = DomainTask {
            domain: domain.to_string(),
            index: PREFLIGHT_INDEX,
        };

        let result = guarded_measure(&self.pipeline, &task).await;
        match &result {
            Ok(latency_ms) => info!(domain, latency_ms, "preflight succeeded"),
            Err(reason) => warn!(domain, %reason, "preflight failed"),
        }
        self.reporter.preflight(domain, &result);
    }

    fn record(&self, task: &DomainTask, outcome: TaskOutcome, summary: &mut RunSummary) {
        match outcome {
            TaskOutcome::Success { domain, latency_ms } => {
                summary.succeeded += 1;
                self.reporter.on_success(task.index, &domain, latency_ms);
            }
            TaskOutcome::Failure { domain, reason } => {
                summary.count_failure(&reason);
                warn!(index = task.index, %domain, %reason, "domain skipped");
                self.reporter.on_failure(task.index, &domain, &reason);
            }
        }
    }
}

async fn run_task(pipeline: &Pipeline, ledger: &ResultLedger, task: &DomainTask) -> TaskOutcome {
    let domain = task.domain.clone();
    match guarded_measure(pipeline, task).await {
        Ok(latency_ms) => match ledger.append(&domain, latency_ms).await {
            Ok(()) => TaskOutcome::Success { domain, latency_ms },
            Err(reason) => TaskOutcome::Failure { domain, reason },
        },
        Err(reason) => TaskOutcome::Failure { domain, reason },
    }
}

/// A panic inside one task becomes that task's failure; the proxy handle is
/// dropped while unwinding, which kills the process.
async fn guarded_measure(pipeline: &Pipeline, task: &DomainTask) -> Result<u64> {
    match AssertUnwindSafe(pipeline.measure(task)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|text| text.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ProbeError::Panicked(message))
        }
    }
}

use anyhow::{bail, Context, Result};
use frontprobe::cli::parse_cli;
use frontprobe::config::{ensure_work_dir, load_domains, ProbeSettings};
use frontprobe::ledger::ResultLedger;
use frontprobe::probe::LatencyProbe;
use frontprobe::report::{paint, supports_color, LiveReporter};
use frontprobe::scheduler::{Pipeline, Scheduler};
use frontprobe::supervisor::{ProcessSupervisor, ProxyCommand};
use frontprobe::template::{ConfigFactory, ProxyTemplate};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("[!] Error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = parse_cli();
    init_tracing(&cli.log_level);

    let settings = ProbeSettings::from_cli(cli)?;
    let template = ProxyTemplate::load(&settings.template, &settings.host_pointer)
        .with_context(|| format!("Could not load template {}", settings.template.display()))?;
    let domains = load_domains(&settings.domains)?;

    if settings.start_index > domains.len() {
        bail!(
            "Start index {} is past the end of the domain list ({} entries)",
            settings.start_index,
            domains.len()
        );
    }

    ensure_work_dir(&settings.work_dir)?;
    let ledger = ResultLedger::open(&settings.output)
        .await
        .with_context(|| format!("Could not open results file {}", settings.output.display()))?;

    let command = ProxyCommand::new(&settings.proxy_bin).with_args(settings.proxy_args.clone());
    let pipeline = Pipeline::new(
        ConfigFactory::new(template, &settings.work_dir),
        ProcessSupervisor::new(command, settings.supervisor_settings()),
        LatencyProbe::new(
            settings.probe_url.clone(),
            settings.connect_timeout(),
            settings.probe_timeout(),
        ),
    )
    .keep_configs(settings.keep_configs);

    let colors_enabled = supports_color();
    let scheduler = Scheduler::new(pipeline, Arc::new(ledger), LiveReporter::new(colors_enabled))
        .concurrency(settings.timing.concurrency)
        .preflight(settings.preflight_domain.clone());

    println!(
        "{}: {} domain(s) from #{}, concurrency={}...",
        paint("Starting scan", "1;36", colors_enabled),
        domains.len() - settings.start_index,
        settings.start_index,
        settings.timing.concurrency
    );
    info!(
        work_dir = %settings.work_dir.display(),
        output = %settings.output.display(),
        "run configured"
    );

    let summary = scheduler
        .run(&domains, settings.start_index, shutdown_signal())
        .await
        .context("Scan aborted")?;

    if summary.interrupted {
        bail!("Interrupted; every proxy process was stopped");
    }

    println!("\n[+] Results saved to {}", settings.output.display());
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(_) => return wait_ctrl_c().await,
        };

        tokio::select! {
            _ = wait_ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    wait_ctrl_c().await;
}

async fn wait_ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

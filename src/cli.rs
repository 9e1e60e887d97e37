use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::models::TimingProfile;
use crate::probe::DEFAULT_PROBE_URL;
use crate::template::DEFAULT_HOST_POINTER;

#[derive(Parser, Debug)]
#[command(
    name = "frontprobe",
    version,
    about = "Measures latency of fronting domains through short-lived local proxy processes",
    next_line_help = true,
    after_help = "Notes:\n  - Each domain gets its own proxy process, config file and port pair.\n  - Rows are appended to the output CSV; an existing file is never rewritten.\n\nExamples:\n  frontprobe -d domains.txt -t main.json -x ./xray\n  frontprobe -d domains.txt -T T4 -c 48 -o result.csv\n  frontprobe -d domains.txt -s 1200 --preflight-domain www.example.com"
)]
pub struct Cli {
    /// Domain list, one per line
    #[arg(short = 'd', long = "domains", default_value = "./domains.txt")]
    pub domains: PathBuf,

    /// Base proxy config (JSON) used as the template for every domain
    #[arg(short = 't', long = "template", default_value = "./main.json")]
    pub template: PathBuf,

    /// Proxy executable
    #[arg(short = 'x', long = "proxy-bin", default_value = "./xray")]
    pub proxy_bin: PathBuf,

    /// Proxy argument; repeat for several. `{config}` is replaced by the config path
    #[arg(long = "proxy-arg", allow_hyphen_values = true)]
    pub proxy_args: Vec<String>,

    /// Result CSV (appended to)
    #[arg(short = 'o', long = "output", default_value = "./result.csv")]
    pub output: PathBuf,

    /// Index of the first domain to probe, for resuming an earlier run
    #[arg(short = 's', long = "start-index", default_value_t = 0)]
    pub start_index: usize,

    /// Timing template: T1..T5
    #[arg(short = 'T', long = "timing", default_value = "T3")]
    pub timing: String,

    /// Concurrent proxies (overrides the timing template)
    #[arg(short = 'c', long = "concurrency")]
    pub concurrency: Option<usize>,

    /// URL fetched through each proxy; must answer 200 or 204
    #[arg(long = "probe-url", default_value = DEFAULT_PROBE_URL)]
    pub probe_url: String,

    /// JSON pointer of the Host header field in the template
    #[arg(long = "host-pointer", default_value = DEFAULT_HOST_POINTER)]
    pub host_pointer: String,

    /// Known-good domain probed once before the run
    #[arg(long = "preflight-domain")]
    pub preflight_domain: Option<String>,

    /// Directory for per-domain proxy configs
    #[arg(long = "work-dir")]
    pub work_dir: Option<PathBuf>,

    /// Keep per-domain proxy configs after each probe
    #[arg(long = "keep-configs")]
    pub keep_configs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "warn")]
    pub log_level: String,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub fn parse_timing(value: &str) -> Result<TimingProfile> {
    let upper = value.trim().to_uppercase();

    let profile = match upper.as_str() {
        "T1" => TimingProfile {
            concurrency: 4,
            connect_timeout_ms: 3_000,
            probe_timeout_ms: 5_000,
            ready_timeout_ms: 10_000,
        },
        "T2" => TimingProfile {
            concurrency: 8,
            connect_timeout_ms: 2_000,
            probe_timeout_ms: 3_000,
            ready_timeout_ms: 8_000,
        },
        "T3" => TimingProfile {
            concurrency: 16,
            connect_timeout_ms: 1_000,
            probe_timeout_ms: 1_000,
            ready_timeout_ms: 5_000,
        },
        "T4" => TimingProfile {
            concurrency: 32,
            connect_timeout_ms: 800,
            probe_timeout_ms: 800,
            ready_timeout_ms: 4_000,
        },
        "T5" => TimingProfile {
            concurrency: 64,
            connect_timeout_ms: 500,
            probe_timeout_ms: 600,
            ready_timeout_ms: 3_000,
        },
        _ => bail!("Invalid timing '{}'. Allowed values: T1..T5", value),
    };

    Ok(profile)
}

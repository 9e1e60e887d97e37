use crate::cli::{parse_timing, Cli};
use crate::models::TimingProfile;
use crate::scheduler::clamp_concurrency;
use crate::supervisor::{SupervisorSettings, DEFAULT_PROXY_ARGS};
use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run configuration, fixed once parsed from the command line.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub domains: PathBuf,
    pub template: PathBuf,
    pub proxy_bin: PathBuf,
    pub proxy_args: Vec<String>,
    pub output: PathBuf,
    pub work_dir: PathBuf,
    pub start_index: usize,
    pub timing: TimingProfile,
    pub probe_url: String,
    pub host_pointer: String,
    pub preflight_domain: Option<String>,
    pub keep_configs: bool,
}

impl ProbeSettings {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut timing = parse_timing(&cli.timing)?;
        if let Some(concurrency) = cli.concurrency {
            timing.concurrency = concurrency;
        }
        timing.concurrency = clamp_concurrency(timing.concurrency);

        let work_dir = match cli.work_dir {
            Some(dir) => dir,
            None => default_work_dir()?,
        };

        let proxy_args = if cli.proxy_args.is_empty() {
            DEFAULT_PROXY_ARGS.iter().map(|arg| arg.to_string()).collect()
        } else {
            cli.proxy_args
        };

        Ok(Self {
            domains: cli.domains,
            template: cli.template,
            proxy_bin: cli.proxy_bin,
            proxy_args,
            output: cli.output,
            work_dir,
            start_index: cli.start_index,
            timing,
            probe_url: cli.probe_url,
            host_pointer: cli.host_pointer,
            preflight_domain: cli.preflight_domain,
            keep_configs: cli.keep_configs,
        })
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            ready_timeout: Duration::from_millis(self.timing.ready_timeout_ms),
            ..SupervisorSettings::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.probe_timeout_ms)
    }
}

pub fn default_work_dir() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "frontprobe")
        .ok_or_else(|| anyhow!("Could not determine the user cache directory"))?;

    Ok(project_dirs.cache_dir().join("configs"))
}

pub fn ensure_work_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Could not create config directory {}", path.display()))
}

/// Trimmed, non-empty lines of the domain list, in file order.
pub fn load_domains(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Could not read domain list {}", path.display()))?;

    Ok(parse_domains(&raw))
}

pub fn parse_domains(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn domain_list_skips_blank_lines_and_crlf() {
        let domains = parse_domains("a.com\r\n\r\n  b.com  \nc.com");
        assert_eq!(domains, ["a.com", "b.com", "c.com"]);
    }

    #[test]
    fn explicit_concurrency_overrides_timing_template() {
        let cli = Cli::try_parse_from([
            "frontprobe",
            "-T",
            "T1",
            "-c",
            "100000",
            "--work-dir",
            "/tmp/frontprobe-test",
        ])
        .unwrap();
        let settings = ProbeSettings::from_cli(cli).unwrap();

        assert_eq!(settings.timing.concurrency, crate::scheduler::MAX_CONCURRENCY);
        assert_eq!(settings.timing.ready_timeout_ms, 10_000);
        assert_eq!(settings.proxy_args, DEFAULT_PROXY_ARGS);
        assert_eq!(settings.supervisor_settings().ready_timeout, Duration::from_secs(10));
    }

    #[test]
    fn missing_domain_list_is_reported() {
        let error = load_domains(Path::new("/nonexistent/domains.txt")).unwrap_err();
        assert!(format!("{error:#}").contains("domain list"));
    }
}

use crate::error::ProbeError;
use crate::models::RunSummary;
use std::env;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct LiveReporter {
    colors_enabled: bool,
    started_at: Instant,
}

impl LiveReporter {
    pub fn new(colors_enabled: bool) -> Self {
        Self {
            colors_enabled,
            started_at: Instant::now(),
        }
    }

    pub fn table_header(&self) {
        println!(
            "\n{}",
            paint(
                "#      Elapsed   Domain                                   Latency",
                "1;37",
                self.colors_enabled
            )
        );
        println!("{}", paint(RULE, "2;37", self.colors_enabled));
    }

    pub fn on_success(&self, index: usize, domain: &str, latency_ms: u64) {
        let latency = paint(&format!("{latency_ms}ms"), "1;32", self.colors_enabled);
        println!(
            "{:>6} {:>9} {:<40} {}",
            index,
            format_elapsed(self.elapsed()),
            domain,
            latency
        );
    }

    pub fn on_failure(&self, index: usize, domain: &str, reason: &ProbeError) {
        let label = paint(reason.label(), "1;31", self.colors_enabled);
        println!(
            "{:>6} {:>9} {:<40} {}",
            index,
            format_elapsed(self.elapsed()),
            domain,
            label
        );
    }

    pub fn preflight(&self, domain: &str, result: &Result<u64, ProbeError>) {
        match result {
            Ok(latency_ms) => println!(
                "[+] Preflight through {domain}: {}",
                paint(&format!("{latency_ms}ms"), "1;32", self.colors_enabled)
            ),
            Err(error) => println!(
                "{} Preflight through {domain} failed: {error}. Continuing anyway.",
                paint("[!]", "1;33", self.colors_enabled)
            ),
        }
    }

    pub fn summary(&self, summary: &RunSummary) {
        println!("{}", paint(RULE, "2;37", self.colors_enabled));
        println!(
            "{}: {} measured, {} failed, {} domain(s) in {}.",
            paint("Summary", "1;33", self.colors_enabled),
            summary.succeeded,
            summary.failed,
            summary.total,
            format_elapsed(self.elapsed()).trim()
        );
        if !summary.failures.is_empty() {
            println!("         failures: {}", describe_failures(summary));
        }
        if summary.interrupted {
            let notice = "[!] Interrupted before every domain was probed.";
            println!("{}", paint(notice, "1;33", self.colors_enabled));
        }
    }

    fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

const RULE: &str =
    "------ --------- ---------------------------------------- --------";

pub fn supports_color() -> bool {
    std::io::stdout().is_terminal() && env::var_os("NO_COLOR").is_none()
}

pub fn paint(text: &str, ansi_code: &str, enabled: bool) -> String {
    if enabled {
        format!("\x1b[{ansi_code}m{text}\x1b[0m")
    } else {
        text.to_string()
    }
}

fn describe_failures(summary: &RunSummary) -> String {
    summary
        .failures
        .iter()
        .map(|(label, count)| format!("{label} {count}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn format_elapsed(duration: Duration) -> String {
    let total_millis = duration.as_millis();
    let seconds = total_millis / 1_000;
    let millis = total_millis % 1_000;
    format!("{seconds:>2}.{millis:03}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paint_is_noop_without_colors() {
        assert_eq!(paint("open", "1;32", false), "open");
        assert_eq!(paint("open", "1;32", true), "\x1b[1;32mopen\x1b[0m");
    }

    #[test]
    fn failures_are_listed_per_label() {
        let mut summary = RunSummary::default();
        summary.count_failure(&ProbeError::UnexpectedStatus(503));
        summary.count_failure(&ProbeError::ProxyExited { port: 1 });
        summary.count_failure(&ProbeError::UnexpectedStatus(502));

        assert_eq!(summary.failed, 3);
        assert_eq!(summary.failures_labelled("bad-status"), 2);
        assert_eq!(describe_failures(&summary), "bad-status 2, proxy-exited 1");
    }

    #[test]
    fn elapsed_keeps_millisecond_precision() {
        assert_eq!(format_elapsed(Duration::from_millis(1_234)), " 1.234s");
        assert_eq!(format_elapsed(Duration::from_millis(61_005)), "61.005s");
    }
}

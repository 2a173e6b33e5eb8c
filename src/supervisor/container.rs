//! Thin async wrapper over the container runtime CLI (docker or podman).

use std::io;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::debug;

/// Parsed `inspect` state for one container.
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn uptime_secs(&self) -> Option<u64> {
        if !self.is_running() {
            return None;
        }
        let started = self.started_at?;
        let elapsed = Utc::now().signed_duration_since(started);
        u64::try_from(elapsed.num_seconds()).ok()
    }
}

/// Point-in-time resource readings for a running container.
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ContainerCli {
    program: String,
}

impl ContainerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> io::Result<String> {
        debug!(program = %self.program, ?args, "container cli call");
        let output = Command::new(&self.program).args(args).output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(io::Error::other(stderr))
        }
    }

    pub async fn start(&self, id: &str) -> io::Result<()> {
        self.run(&["start", id]).await.map(|_| ())
    }

    pub async fn stop(&self, id: &str) -> io::Result<()> {
        self.run(&["stop", id]).await.map(|_| ())
    }

    /// Inspect a container's state. `Ok(None)` means the runtime does not
    /// know the container at all.
    pub async fn inspect(&self, id: &str) -> io::Result<Option<ContainerState>> {
        let result = self
            .run(&[
                "inspect",
                "--format",
                "{{.State.Status}}|{{.State.StartedAt}}",
                id,
            ])
            .await;
        match result {
            Ok(line) => Ok(Some(parse_inspect_line(&line))),
            Err(e) if e.to_string().contains("No such") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// One-shot resource readings. Only meaningful for running containers.
    pub async fn stats(&self, id: &str) -> io::Result<ContainerStats> {
        let line = self
            .run(&[
                "stats",
                "--no-stream",
                "--format",
                "{{.CPUPerc}}|{{.MemUsage}}",
                id,
            ])
            .await?;
        Ok(parse_stats_line(&line))
    }
}

fn parse_inspect_line(line: &str) -> ContainerState {
    let mut parts = line.splitn(2, '|');
    let status = parts.next().unwrap_or("unknown").trim().to_string();
    let started_at = parts
        .next()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc));
    ContainerState { status, started_at }
}

fn parse_stats_line(line: &str) -> ContainerStats {
    let mut parts = line.splitn(2, '|');
    let cpu_percent = parts.next().and_then(parse_cpu_percent);
    let memory_bytes = parts.next().and_then(parse_mem_usage);
    ContainerStats {
        cpu_percent,
        memory_bytes,
    }
}

/// Parse `docker stats` CPU output, e.g. `"0.15%"`.
fn parse_cpu_percent(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').parse().ok()
}

/// Parse the used side of `docker stats` memory output, e.g.
/// `"1.5MiB / 7.6GiB"`.
fn parse_mem_usage(raw: &str) -> Option<u64> {
    let used = raw.split('/').next()?.trim();
    let split = used.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let value: f64 = used[..split].parse().ok()?;
    let multiplier: f64 = match used[split..].trim() {
        "B" => 1.0,
        "kB" | "KB" => 1e3,
        "KiB" => 1024.0,
        "MB" => 1e6,
        "MiB" => 1024.0 * 1024.0,
        "GB" => 1e9,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_line_running() {
        let state = parse_inspect_line("running|2026-08-01T10:00:00.123456789Z");
        assert!(state.is_running());
        assert!(state.started_at.is_some());
    }

    #[test]
    fn inspect_line_exited() {
        let state = parse_inspect_line("exited|2026-08-01T10:00:00Z");
        assert!(!state.is_running());
        assert!(state.uptime_secs().is_none());
    }

    #[test]
    fn inspect_line_garbage_has_no_timestamp() {
        let state = parse_inspect_line("running|not-a-timestamp");
        assert!(state.is_running());
        assert!(state.started_at.is_none());
    }

    #[test]
    fn cpu_percent_parses() {
        assert_eq!(parse_cpu_percent("0.15%"), Some(0.15));
        assert_eq!(parse_cpu_percent(" 12.5% "), Some(12.5));
        assert_eq!(parse_cpu_percent("--"), None);
    }

    #[test]
    fn mem_usage_parses_binary_units() {
        assert_eq!(parse_mem_usage("1.5MiB / 7.6GiB"), Some(1_572_864));
        assert_eq!(parse_mem_usage("512KiB / 1GiB"), Some(524_288));
    }

    #[test]
    fn mem_usage_parses_decimal_units() {
        assert_eq!(parse_mem_usage("2MB / 8GB"), Some(2_000_000));
    }

    #[test]
    fn mem_usage_rejects_garbage() {
        assert_eq!(parse_mem_usage("n/a"), None);
        assert_eq!(parse_mem_usage(""), None);
    }

    #[test]
    fn stats_line_parses_both_fields() {
        let stats = parse_stats_line("3.04%|10MiB / 1GiB");
        assert_eq!(stats.cpu_percent, Some(3.04));
        assert_eq!(stats.memory_bytes, Some(10 * 1024 * 1024));
    }
}

//! Reachability probing through the system `ping`/`fping` binaries
//!
//! - `ping`: one process per host, run concurrently; exit code 0 = up
//! - `fping`: one process for all hosts; per-host summary lines parsed
//! A host whose probe could not even be started gets no observation at all,
//! so a missing binary never turns into a wave of false alarms.

use crate::config::ProbeConf;
use crate::models::Observation;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    #[default]
    Ping,
    Fping,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        source: std::io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout {
        program: &'static str,
        timeout: Duration,
    },
}

/// Per-host summary printed by `fping --count`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FpingStats {
    pub host: String,
    pub sent: u32,
    pub received: u32,
    pub loss_percent: f32,
    pub min_ms: Option<f32>,
    pub avg_ms: Option<f32>,
    pub max_ms: Option<f32>,
}

impl FpingStats {
    pub fn observation(&self) -> Observation {
        if self.received == 0 {
            Observation::Down
        } else {
            Observation::Up
        }
    }
}

/// Parses `host : xmt/rcv/%loss = 10/9/10%, min/avg/max = 0.1/0.2/0.3`.
pub fn parse_fping_line(line: &str) -> Option<FpingStats> {
    let (host, stats) = line.split_once(" : ")?;
    let mut parts = stats.split(',');

    let (_, counts) = parts.next()?.split_once('=')?;
    let mut counts = counts.trim().split('/');
    let sent = counts.next()?.trim().parse().ok()?;
    let received = counts.next()?.trim().parse().ok()?;
    let loss_percent = counts.next()?.trim().trim_end_matches('%').parse().ok()?;

    let rtt: Vec<f32> = parts
        .next()
        .and_then(|p| p.split_once('='))
        .map(|(_, v)| v.trim().split('/').filter_map(|x| x.trim().parse().ok()).collect())
        .unwrap_or_default();

    Some(FpingStats {
        host: host.trim().to_string(),
        sent,
        received,
        loss_percent,
        min_ms: rtt.first().copied(),
        avg_ms: rtt.get(1).copied(),
        max_ms: rtt.get(2).copied(),
    })
}

pub fn parse_fping_output(output: &str) -> Vec<FpingStats> {
    output.lines().filter_map(parse_fping_line).collect()
}

pub struct Prober {
    conf: ProbeConf,
}

impl Prober {
    pub fn new(conf: ProbeConf) -> Self {
        Self { conf }
    }

    /// Upper bound for one probe process, on top of what we ask the tool for.
    fn process_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.conf.timeout_secs) * u64::from(self.conf.count) + 5)
    }

    pub async fn probe(&self, hosts: &[String]) -> BTreeMap<String, Observation> {
        match self.conf.method {
            ProbeMethod::Ping => self.ping_all(hosts).await,
            ProbeMethod::Fping => match self.fping_all(hosts).await {
                Ok(observations) => observations,
                Err(e) => {
                    error!(error = %e, "fping probe failed, no host evaluated this run");
                    BTreeMap::new()
                }
            },
        }
    }

    async fn ping_all(&self, hosts: &[String]) -> BTreeMap<String, Observation> {
        let results = join_all(hosts.iter().map(|host| async move {
            (host.clone(), self.ping_host(host).await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(host, result)| match result {
                Ok(observation) => {
                    debug!(host = %host, ?observation, "ping done");
                    Some((host, observation))
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "ping failed, host skipped");
                    None
                }
            })
            .collect()
    }

    pub async fn ping_host(&self, host: &str) -> Result<Observation, ProbeError> {
        let mut cmd = Command::new("ping");
        cmd.arg("-W")
            .arg(self.conf.timeout_secs.to_string())
            .arg("-c")
            .arg(self.conf.count.to_string())
            .arg(host)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let timeout = self.process_timeout();
        let status = tokio::time::timeout(timeout, cmd.status())
            .await
            .map_err(|_| ProbeError::Timeout { program: "ping", timeout })?
            .map_err(|source| ProbeError::Spawn { program: "ping", source })?;

        // killed by a signal: no code, counts as unreachable
        Ok(Observation::from_exit_code(status.code().unwrap_or(-1)))
    }

    pub async fn fping_all(&self, hosts: &[String]) -> Result<BTreeMap<String, Observation>, ProbeError> {
        if hosts.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut cmd = Command::new("fping");
        cmd.arg("-q")
            .arg("--count")
            .arg(self.conf.count.to_string())
            .arg("--timeout")
            .arg((u64::from(self.conf.timeout_secs) * 1000).to_string())
            .args(hosts)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // fping exits non-zero as soon as one host is down; only the summaries matter
        let timeout = self.process_timeout() + Duration::from_secs(hosts.len() as u64);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout { program: "fping", timeout })?
            .map_err(|source| ProbeError::Spawn { program: "fping", source })?;

        let text = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let stats: BTreeMap<String, FpingStats> = parse_fping_output(&text)
            .into_iter()
            .map(|s| (s.host.clone(), s))
            .collect();

        Ok(hosts
            .iter()
            .map(|host| {
                let observation = match stats.get(host) {
                    Some(s) => {
                        debug!(host = %host, sent = s.sent, received = s.received, loss = s.loss_percent, "fping summary");
                        s.observation()
                    }
                    None => {
                        warn!(host = %host, "no fping summary, counting host as down");
                        Observation::Down
                    }
                };
                (host.clone(), observation)
            })
            .collect())
    }
}

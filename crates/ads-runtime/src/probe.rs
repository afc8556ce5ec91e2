// Availability prober
// Verifies each configured agent binary actually responds before the
// adapter is offered as ready.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;

use ads_protocol::AgentStatus;

use crate::runner::{run_capture, RunOptions};

const PROBE_ARGVS: [&[&str]; 4] = [&["--version"], &["-v"], &["version"], &["--help"]];

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ProbeRecord {
    pub ok: bool,
    pub detail: Option<String>,
}

pub struct AvailabilityProber {
    timeout: Duration,
    cache: RwLock<HashMap<String, ProbeRecord>>,
}

impl AvailabilityProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Probe `binary` for `agent_id`, serving cached results after the
    /// first call.
    pub async fn probe(&self, agent_id: &str, binary: &str) -> ProbeRecord {
        if let Some(record) = self.cache.read().await.get(agent_id) {
            return record.clone();
        }
        self.refresh(agent_id, binary).await
    }

    pub async fn refresh(&self, agent_id: &str, binary: &str) -> ProbeRecord {
        let record = self.run_probes(binary).await;
        self.cache
            .write()
            .await
            .insert(agent_id.to_string(), record.clone());
        if record.ok {
            tracing::debug!(agent = agent_id, binary, "agent binary probe ok");
        } else {
            tracing::warn!(
                agent = agent_id,
                binary,
                detail = record.detail.as_deref().unwrap_or("unknown"),
                "agent binary probe failed"
            );
        }
        record
    }

    async fn run_probes(&self, binary: &str) -> ProbeRecord {
        let mut last_detail = None;
        for argv in PROBE_ARGVS {
            let opts = RunOptions {
                binary: binary.to_string(),
                args: argv.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            };
            match run_capture(opts, Some(self.timeout)).await {
                Ok(outcome) if outcome.exit_code == Some(0) => {
                    return ProbeRecord {
                        ok: true,
                        detail: None,
                    };
                }
                Ok(outcome) => {
                    let snippet = if outcome.timed_out {
                        format!("probe timed out after {:?}", self.timeout)
                    } else {
                        let stderr = outcome.stderr.trim();
                        let head: String = stderr.chars().take(200).collect();
                        format!("exit {:?}: {}", outcome.exit_code, head)
                    };
                    last_detail = Some(snippet);
                }
                Err(err) => {
                    last_detail = Some(err.to_string());
                    // Spawn failures will not improve with a different argv.
                    break;
                }
            }
        }
        ProbeRecord {
            ok: false,
            detail: last_detail,
        }
    }

    /// Merge a cached probe result into an adapter-reported status. A status
    /// that is already not-ready wins; a failed probe overrides a ready one.
    pub async fn merge_status(&self, agent_id: &str, status: AgentStatus) -> AgentStatus {
        if !status.ready {
            return status;
        }
        match self.cache.read().await.get(agent_id) {
            Some(record) if !record.ok => AgentStatus {
                ready: false,
                streaming: status.streaming,
                error: record.detail.clone(),
            },
            _ => status,
        }
    }
}

impl Default for AvailabilityProber {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_succeeds_for_real_binary() {
        let prober = AvailabilityProber::default();
        // `sh --version` fails on some shells but one of the probe argvs
        // (`-v` / `--help`) answers on every platform we test on.
        let record = prober.probe("sh", "sh").await;
        assert!(record.ok, "detail: {:?}", record.detail);
    }

    #[tokio::test]
    async fn probe_fails_for_missing_binary() {
        let prober = AvailabilityProber::default();
        let record = prober.probe("ghost", "no-such-binary-ads-probe").await;
        assert!(!record.ok);
        assert!(record.detail.is_some());
    }

    #[tokio::test]
    async fn merge_keeps_not_ready_status() {
        let prober = AvailabilityProber::default();
        prober.refresh("ghost", "no-such-binary-ads-probe").await;
        let status = AgentStatus::unready("missing credentials");
        let merged = prober.merge_status("ghost", status).await;
        assert_eq!(merged.error.as_deref(), Some("missing credentials"));
    }

    #[tokio::test]
    async fn merge_overrides_ready_when_probe_failed() {
        let prober = AvailabilityProber::default();
        prober.refresh("ghost", "no-such-binary-ads-probe").await;
        let merged = prober.merge_status("ghost", AgentStatus::ready()).await;
        assert!(!merged.ready);
        assert!(merged.error.is_some());
    }

    #[tokio::test]
    async fn probe_results_are_cached() {
        let prober = AvailabilityProber::default();
        prober.refresh("sh", "sh").await;
        // A bogus binary for the same id is never spawned again.
        let record = prober.probe("sh", "no-such-binary-ads-probe").await;
        assert!(record.ok);
    }
}

use crate::checkpoint::Checkpoint;
use crate::config::ScanConfig;
use crate::probe::{Confirmation, TransportProbe};
use crate::types::{
    now_utc, AttemptOutcome, DiscoveredServer, HostReport, ServerIndex, Transport,
    VerificationAttempt, VerifiedServer,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use ::time::OffsetDateTime;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct VerificationOptions {
    pub max_concurrent: usize,
    /// Hard ceiling on one probe call, on top of the probe's own timeouts.
    pub attempt_deadline: Duration,
    /// Time in-flight hosts get to finish once cancellation is requested.
    pub cancel_grace: Duration,
}

impl VerificationOptions {
    pub fn from_config(cfg: &ScanConfig) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent_verifications,
            // handshake walk plus best-effort tool listing
            attempt_deadline: cfg.verification_timeout * 2 + Duration::from_secs(1),
            cancel_grace: cfg.cancel_grace,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerificationOutcome {
    pub verified: Vec<VerifiedServer>,
    /// One entry per probed host, in input order.
    pub host_reports: Vec<HostReport>,
    pub cancelled: bool,
    /// Hosts cut off after the cancellation grace period.
    pub abandoned: usize,
}

struct HostVerdict {
    idx: usize,
    report: HostReport,
    verified: Option<VerifiedServer>,
}

/// The transport attempt a host task is currently waiting on.
#[derive(Debug, Clone, Copy)]
struct Slot {
    transport: Transport,
    started_at: OffsetDateTime,
    started: Instant,
}

/// Progress of a running host task, kept so an abandoned host still reports
/// the attempts it finished.
#[derive(Debug, Default)]
struct HostProgress {
    attempts: Vec<VerificationAttempt>,
    current: Option<Slot>,
}

type InFlight = Arc<Mutex<BTreeMap<usize, HostProgress>>>;

/// Drives a [`TransportProbe`] over many hosts with a fixed number of probe slots.
pub struct VerificationEngine {
    probe: Arc<dyn TransportProbe>,
    options: VerificationOptions,
}

impl VerificationEngine {
    pub fn new(probe: Arc<dyn TransportProbe>, options: VerificationOptions) -> Self {
        Self { probe, options }
    }

    /// Verify hosts loaded from a checkpoint, without any re-discovery.
    pub async fn run_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        cancel: CancellationToken,
    ) -> VerificationOutcome {
        self.run_index(checkpoint.index(), cancel).await
    }

    pub async fn run(
        &self,
        servers: &[DiscoveredServer],
        cancel: CancellationToken,
    ) -> VerificationOutcome {
        self.run_index(ServerIndex::from_servers(servers.iter().cloned()), cancel)
            .await
    }

    async fn run_index(&self, index: ServerIndex, cancel: CancellationToken) -> VerificationOutcome {
        let servers = index.into_vec();
        info!(hosts = servers.len(), "starting verification");

        let sem = Arc::new(Semaphore::new(self.options.max_concurrent.clamp(1, 200)));
        let inflight: InFlight = Arc::new(Mutex::new(BTreeMap::new()));
        let mut set: JoinSet<HostVerdict> = JoinSet::new();
        let mut verdicts: Vec<HostVerdict> = Vec::with_capacity(servers.len());
        let mut cancelled = false;

        for (idx, server) in servers.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                p = sem.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let probe = self.probe.clone();
            let server = server.clone();
            let inflight = inflight.clone();
            let deadline = self.options.attempt_deadline;
            set.spawn(async move {
                let _permit = permit; // keep permit until task completes
                verify_host(probe.as_ref(), idx, &server, deadline, &inflight).await
            });
        }

        if !cancelled {
            loop {
                tokio::select! {
                    biased;
                    joined = set.join_next() => match joined {
                        Some(j) => collect(j, &mut verdicts),
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        let mut abandoned = 0;
        if cancelled {
            warn!(in_flight = set.len(), grace = ?self.options.cancel_grace, "verification cancelled");
            let grace_end = Instant::now() + self.options.cancel_grace;
            while let Ok(Some(j)) = time::timeout_at(grace_end, set.join_next()).await {
                collect(j, &mut verdicts);
            }
            set.abort_all();
            while let Some(j) = set.join_next().await {
                collect(j, &mut verdicts);
            }
            let leftover = std::mem::take(&mut *inflight.lock().await);
            for (idx, progress) in leftover {
                let server = &servers[idx];
                let mut attempts = progress.attempts;
                if let Some(slot) = progress.current {
                    attempts.push(VerificationAttempt {
                        transport: slot.transport,
                        started_at: slot.started_at,
                        outcome: AttemptOutcome::Timeout,
                        latency_ms: slot.started.elapsed().as_millis() as u64,
                        endpoint: None,
                        detail: Some("abandoned after cancellation".into()),
                    });
                }
                abandoned += 1;
                verdicts.push(HostVerdict {
                    idx,
                    report: HostReport {
                        host: server.host.clone(),
                        port: server.port,
                        verified: false,
                        attempts,
                    },
                    verified: None,
                });
            }
        }

        verdicts.sort_by_key(|v| v.idx);
        let mut outcome = VerificationOutcome {
            cancelled,
            abandoned,
            ..VerificationOutcome::default()
        };
        for v in verdicts {
            outcome.host_reports.push(v.report);
            if let Some(s) = v.verified {
                outcome.verified.push(s);
            }
        }
        info!(
            probed = outcome.host_reports.len(),
            verified = outcome.verified.len(),
            cancelled,
            "verification finished"
        );
        outcome
    }
}

fn collect(joined: Result<HostVerdict, JoinError>, verdicts: &mut Vec<HostVerdict>) {
    match joined {
        Ok(v) => verdicts.push(v),
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!(error = %e, "verification task failed"),
    }
}

/// Try transports in priority order, stopping at the first confirmation.
async fn verify_host(
    probe: &dyn TransportProbe,
    idx: usize,
    server: &DiscoveredServer,
    deadline: Duration,
    inflight: &InFlight,
) -> HostVerdict {
    let mut confirmed: Option<(Transport, Confirmation)> = None;
    inflight.lock().await.insert(idx, HostProgress::default());

    for transport in Transport::PRIORITY {
        let started_at = now_utc();
        let started = Instant::now();
        if let Some(p) = inflight.lock().await.get_mut(&idx) {
            p.current = Some(Slot {
                transport,
                started_at,
                started,
            });
        }
        let (attempt, confirmation) =
            match time::timeout(deadline, probe.probe(server, transport)).await {
                Ok(r) => (r.attempt, r.confirmation),
                Err(_) => (
                    VerificationAttempt {
                        transport,
                        started_at,
                        outcome: AttemptOutcome::Timeout,
                        latency_ms: started.elapsed().as_millis() as u64,
                        endpoint: None,
                        detail: Some(format!("probe exceeded {deadline:?}")),
                    },
                    None,
                ),
            };
        debug!(host = %server.host, port = server.port, %transport, outcome = %attempt.outcome, "attempt finished");
        if let Some(p) = inflight.lock().await.get_mut(&idx) {
            p.current = None;
            p.attempts.push(attempt);
        }
        if let Some(conf) = confirmation {
            confirmed = Some((transport, conf));
            break;
        }
    }

    // nothing awaits after this point
    let attempts = inflight
        .lock()
        .await
        .remove(&idx)
        .map(|p| p.attempts)
        .unwrap_or_default();

    let verified = confirmed.map(|(transport, conf)| VerifiedServer {
        host: server.host.clone(),
        port: server.port,
        tls: conf.url.starts_with("https://"),
        url: conf.url,
        hostnames: server.hostnames.clone(),
        confirmed_transport: transport,
        protocol_version: conf.protocol_version,
        server_info: conf.server_info,
        capabilities: conf.capabilities,
        tools: conf.tools,
        attempts: attempts.clone(),
        response_time_ms: conf.handshake_ms,
        verified_at: now_utc(),
    });
    if let Some(v) = &verified {
        info!(url = %v.url, transport = %v.confirmed_transport, tools = v.tools.len(), "server verified");
    }

    HostVerdict {
        idx,
        report: HostReport {
            host: server.host.clone(),
            port: server.port,
            verified: verified.is_some(),
            attempts,
        },
        verified,
    }
}

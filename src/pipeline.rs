//! Phase orchestration: discovery, checkpoint, verification, reports.
use crate::checkpoint::{Checkpoint, CHECKPOINT_FILE};
use crate::config::ScanConfig;
use crate::discovery::{DiscoveryEngine, DiscoveryOptions};
use crate::error::ScanError;
use crate::probe::{HttpProbe, ProbeSettings, TransportProbe};
use crate::report;
use crate::search::{SearchClient, ShodanClient};
use crate::types::{Filter, RunStatus, ScanResult};
use crate::verification::{VerificationEngine, VerificationOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Scan,
    Verify,
}

impl RunKind {
    fn as_str(self) -> &'static str {
        match self {
            RunKind::Scan => "scan",
            RunKind::Verify => "verify",
        }
    }
}

/// Short run identifier: the first 8 hex digits of a random UUID.
pub fn new_scan_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// `<output_dir>/<kind>_<id>_<YYYYmmdd_HHMMSS>`
pub fn run_dir(output_dir: &Path, kind: RunKind, scan_id: &str, at: OffsetDateTime) -> PathBuf {
    let stamp = at
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    output_dir.join(format!("{}_{scan_id}_{stamp}", kind.as_str()))
}

/// What a finished run left behind.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub dir: PathBuf,
    pub checkpoint: Option<PathBuf>,
    pub result: ScanResult,
}

impl RunOutput {
    pub fn cancelled(&self) -> bool {
        self.result.status == RunStatus::Cancelled
    }
}

pub struct Pipeline {
    config: ScanConfig,
    search: Option<Arc<dyn SearchClient>>,
    probe: Arc<dyn TransportProbe>,
}

impl Pipeline {
    pub fn new(
        config: ScanConfig,
        search: Option<Arc<dyn SearchClient>>,
        probe: Arc<dyn TransportProbe>,
    ) -> Self {
        Self {
            config,
            search,
            probe,
        }
    }

    /// Build the production collaborators. The search client is only
    /// created when an API key is configured.
    pub fn from_config(config: ScanConfig) -> Result<Self, ScanError> {
        config.validate()?;
        let search: Option<Arc<dyn SearchClient>> = if config.api_key.trim().is_empty() {
            None
        } else {
            Some(Arc::new(ShodanClient::new(
                config.api_key.clone(),
                &config.user_agent,
            )?))
        };
        let probe = Arc::new(HttpProbe::new(ProbeSettings::from_config(&config))?);
        Ok(Self::new(config, search, probe))
    }

    /// Discovery only: writes the checkpoint and the reports, skips probing.
    pub async fn discover(
        &self,
        filters: &[Filter],
        cancel: CancellationToken,
    ) -> Result<RunOutput, ScanError> {
        self.run_scan(filters, false, cancel).await
    }

    /// Full pipeline. Verification reads the same record set the checkpoint holds.
    pub async fn scan(
        &self,
        filters: &[Filter],
        cancel: CancellationToken,
    ) -> Result<RunOutput, ScanError> {
        self.run_scan(filters, true, cancel).await
    }

    async fn run_scan(
        &self,
        filters: &[Filter],
        verify: bool,
        cancel: CancellationToken,
    ) -> Result<RunOutput, ScanError> {
        self.config.validate_for_discovery()?;
        let Some(client) = self.search.clone() else {
            return Err(ScanError::Credential("no search backend configured".into()));
        };

        let scan_id = new_scan_id();
        let mut result = ScanResult::new(scan_id.clone());
        let dir = run_dir(&self.config.output_dir, RunKind::Scan, &scan_id, result.started_at);
        info!(scan_id = %scan_id, dir = %dir.display(), "scan started");

        let engine = DiscoveryEngine::new(client, DiscoveryOptions::from_config(&self.config));
        // credential failures return here, before anything is written
        let outcome = engine.run(filters, cancel.clone()).await?;

        let checkpoint = Checkpoint::from_outcome(scan_id.clone(), &outcome);
        let checkpoint_path = dir.join(CHECKPOINT_FILE);
        checkpoint.write_atomic(&checkpoint_path)?;

        result.status = outcome.status();
        result.filters_used = outcome.filters_used;
        result.filter_failures = outcome.failures;
        result.discovered = outcome.servers;

        if verify && !outcome.cancelled {
            // reload so verification sees exactly what was persisted
            let persisted = Checkpoint::read(&checkpoint_path)?;
            let engine = VerificationEngine::new(
                self.probe.clone(),
                VerificationOptions::from_config(&self.config),
            );
            let verified = engine.run_checkpoint(&persisted, cancel).await;
            if verified.cancelled {
                result.status = RunStatus::Cancelled;
            }
            result.verified = verified.verified;
            result.host_reports = verified.host_reports;
        } else if outcome.cancelled {
            warn!("discovery cancelled, skipping verification");
        }

        result.finish();
        report::write_all(&dir, &result)?;
        info!(
            scan_id = %scan_id,
            status = %result.status,
            discovered = result.discovered.len(),
            verified = result.verified.len(),
            "scan finished"
        );
        Ok(RunOutput {
            dir,
            checkpoint: Some(checkpoint_path),
            result,
        })
    }

    /// Verification only, from a checkpoint written by an earlier run.
    pub async fn verify(
        &self,
        checkpoint_path: &Path,
        cancel: CancellationToken,
    ) -> Result<RunOutput, ScanError> {
        self.config.validate()?;
        let checkpoint = Checkpoint::read(checkpoint_path)?;
        info!(
            path = %checkpoint_path.display(),
            source_scan = %checkpoint.scan_id,
            servers = checkpoint.servers.len(),
            "loaded checkpoint"
        );

        let scan_id = new_scan_id();
        let mut result = ScanResult::new(scan_id.clone());
        let dir = run_dir(&self.config.output_dir, RunKind::Verify, &scan_id, result.started_at);

        let engine = VerificationEngine::new(
            self.probe.clone(),
            VerificationOptions::from_config(&self.config),
        );
        let verified = engine.run_checkpoint(&checkpoint, cancel).await;

        result.status = if verified.cancelled {
            RunStatus::Cancelled
        } else if checkpoint.status == RunStatus::Complete {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        };
        result.filters_used = checkpoint.filters_used.clone();
        result.filter_failures = checkpoint.failures.clone();
        result.discovered = checkpoint.index().into_vec();
        result.verified = verified.verified;
        result.host_reports = verified.host_reports;
        result.finish();

        report::write_all(&dir, &result)?;
        info!(scan_id = %scan_id, status = %result.status, verified = result.verified.len(), "verification run finished");
        Ok(RunOutput {
            dir,
            checkpoint: None,
            result,
        })
    }
}

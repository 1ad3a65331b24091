//! Durable hand-off between discovery and verification.
use crate::discovery::DiscoveryOutcome;
use crate::error::CheckpointError;
use crate::types::{now_utc, DiscoveredServer, Filter, FilterFailure, RunStatus, ServerIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::info;

pub const CHECKPOINT_FILE: &str = "discovered_servers.json";
pub const FORMAT_VERSION: u32 = 1;

/// Discovery output plus the metadata needed to resume verification in another process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub format_version: u32,
    pub scan_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub filters_used: Vec<Filter>,
    #[serde(default)]
    pub failures: Vec<FilterFailure>,
    pub servers: Vec<DiscoveredServer>,
}

impl Checkpoint {
    pub fn from_outcome(scan_id: impl Into<String>, outcome: &DiscoveryOutcome) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            scan_id: scan_id.into(),
            created_at: now_utc(),
            status: outcome.status(),
            filters_used: outcome.filters_used.clone(),
            failures: outcome.failures.clone(),
            servers: outcome.servers.clone(),
        }
    }

    /// Parse checkpoint JSON. A bare array of server records is accepted too.
    pub fn parse_str(s: &str, path: &Path) -> Result<Self, CheckpointError> {
        let ser_err = |source| CheckpointError::Serialization {
            path: path.to_path_buf(),
            source,
        };
        let value: Value = serde_json::from_str(s).map_err(ser_err)?;
        if value.is_array() {
            let servers: Vec<DiscoveredServer> = serde_json::from_value(value).map_err(ser_err)?;
            return Ok(Self {
                format_version: FORMAT_VERSION,
                scan_id: String::from("imported"),
                created_at: now_utc(),
                status: RunStatus::Complete,
                filters_used: Vec::new(),
                failures: Vec::new(),
                servers,
            });
        }
        serde_json::from_value(value).map_err(ser_err)
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_str(&content, path)
    }

    /// Write all-or-nothing: the JSON goes to a temp file in the same
    /// directory which is then renamed over `path`. A failure leaves any
    /// previous file at `path` untouched.
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let io_err = |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(io_err)?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        {
            let mut w = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut w, self).map_err(|source| {
                CheckpointError::Serialization {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            w.flush().map_err(io_err)?;
        }
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        info!(path = %path.display(), servers = self.servers.len(), "checkpoint written");
        Ok(())
    }

    /// Rebuild the identity-keyed map discovery produced.
    pub fn index(&self) -> ServerIndex {
        ServerIndex::from_servers(self.servers.iter().cloned())
    }
}

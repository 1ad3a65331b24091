use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use time::OffsetDateTime;

/// One search-backend query, grouped under a named category.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub category: String,
    pub query: String,
}

impl Filter {
    pub fn new(category: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            query: query.into(),
        }
    }
}

/// Identity of a discovered host.
pub type ServerKey = (String, u16);

/// A candidate host reported by the search backend.
///
/// Every field except `matched_filters` is fixed by the first sighting.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiscoveredServer {
    #[serde(alias = "ip")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub matched_filters: BTreeSet<String>,
    #[serde(default)]
    pub first_seen_category: String,
    #[serde(default, alias = "shodan_data")]
    pub raw_metadata: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339", default = "now_utc")]
    pub discovered_at: OffsetDateTime,
}

impl DiscoveredServer {
    pub fn new(host: impl Into<String>, port: u16, filter: &Filter) -> Self {
        Self {
            host: host.into(),
            port,
            hostnames: Vec::new(),
            domains: Vec::new(),
            matched_filters: BTreeSet::from([filter.query.clone()]),
            first_seen_category: filter.category.clone(),
            raw_metadata: Map::new(),
            discovered_at: now_utc(),
        }
    }

    pub fn key(&self) -> ServerKey {
        (self.host.clone(), self.port)
    }

    /// Name used when building probe URLs: the first reported hostname, else the address.
    pub fn target_host(&self) -> &str {
        self.hostnames
            .iter()
            .map(String::as_str)
            .find(|h| !h.trim().is_empty())
            .unwrap_or(&self.host)
    }
}

/// Identity-keyed, insertion-ordered set of discovered servers.
///
/// This is the single merge point for discovery results and also what a
/// checkpoint is loaded back into.
#[derive(Debug, Clone, Default)]
pub struct ServerIndex {
    servers: Vec<DiscoveredServer>,
    by_key: HashMap<ServerKey, usize>,
}

impl ServerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_servers(servers: impl IntoIterator<Item = DiscoveredServer>) -> Self {
        let mut index = Self::new();
        for server in servers {
            index.merge(server);
        }
        index
    }

    /// Insert a sighting. Returns `true` when the identity was new.
    ///
    /// A repeat sighting only unions its `matched_filters` into the existing record.
    pub fn merge(&mut self, server: DiscoveredServer) -> bool {
        match self.by_key.get(&server.key()) {
            Some(&idx) => {
                self.servers[idx].matched_filters.extend(server.matched_filters);
                false
            }
            None => {
                self.by_key.insert(server.key(), self.servers.len());
                self.servers.push(server);
                true
            }
        }
    }

    pub fn get(&self, host: &str, port: u16) -> Option<&DiscoveredServer> {
        self.by_key
            .get(&(host.to_string(), port))
            .map(|&idx| &self.servers[idx])
    }

    pub fn contains(&self, host: &str, port: u16) -> bool {
        self.get(host, port).is_some()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn into_vec(self) -> Vec<DiscoveredServer> {
        self.servers
    }
}

/// The two delivery mechanisms a server may speak the protocol over.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Sse,
}

impl Transport {
    /// Probe order: request/response first.
    pub const PRIORITY: [Transport; 2] = [Transport::Http, Transport::Sse];

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Sse => "sse",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one transport attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    ProtocolConfirmed,
    ProtocolRejected,
    Timeout,
    ConnectionError,
}

impl AttemptOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, AttemptOutcome::ProtocolConfirmed)
    }

    /// How much an outcome tells us about the endpoint; used to pick the
    /// representative outcome when several endpoints fail.
    pub fn rank(&self) -> u8 {
        match self {
            AttemptOutcome::ProtocolConfirmed => 3,
            AttemptOutcome::ProtocolRejected => 2,
            AttemptOutcome::Timeout => 1,
            AttemptOutcome::ConnectionError => 0,
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptOutcome::ProtocolConfirmed => "protocol_confirmed",
            AttemptOutcome::ProtocolRejected => "protocol_rejected",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::ConnectionError => "connection_error",
        };
        f.write_str(s)
    }
}

/// Record of probing one host over one transport.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VerificationAttempt {
    pub transport: Transport,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    /// Endpoint that produced the outcome, when one was reached.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// A tool advertised by a confirmed server, in the server's declared order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object", alias = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// A host that completed the handshake on at least one transport.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VerifiedServer {
    pub host: String,
    pub port: u16,
    pub url: String,
    #[serde(default)]
    pub hostnames: Vec<String>,
    pub confirmed_transport: Transport,
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub server_info: ServerInfo,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    pub attempts: Vec<VerificationAttempt>,
    pub tls: bool,
    pub response_time_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub verified_at: OffsetDateTime,
}

/// Every attempt made against one host, verified or not.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HostReport {
    pub host: String,
    pub port: u16,
    pub verified: bool,
    pub attempts: Vec<VerificationAttempt>,
}

/// A filter whose search never produced results.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FilterFailure {
    pub category: String,
    pub query: String,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Complete,
    Partial,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Complete => "complete",
            RunStatus::Partial => "partial",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Aggregate of one run, handed to the report writers at the end.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScanResult {
    pub scan_id: String,
    pub status: RunStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub finished_at: Option<OffsetDateTime>,
    pub filters_used: Vec<Filter>,
    pub discovered: Vec<DiscoveredServer>,
    pub verified: Vec<VerifiedServer>,
    #[serde(default)]
    pub filter_failures: Vec<FilterFailure>,
    #[serde(default)]
    pub host_reports: Vec<HostReport>,
}

impl ScanResult {
    pub fn new(scan_id: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
            status: RunStatus::Complete,
            started_at: now_utc(),
            finished_at: None,
            filters_used: Vec::new(),
            discovered: Vec::new(),
            verified: Vec::new(),
            filter_failures: Vec::new(),
            host_reports: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(now_utc());
    }
}

pub(crate) fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

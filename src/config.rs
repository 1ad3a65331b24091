use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ENDPOINT_PATHS: &[&str] = &[
    "/mcp", "/sse", "/messages", "/v1/mcp", "/api/mcp", "/mcp/sse", "/rpc", "/jsonrpc", "/",
];

/// Plain configuration values for a run. Call [`ScanConfig::validate`] before starting a phase.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Search-backend credential. Only needed for discovery.
    pub api_key: String,
    pub max_results_per_filter: usize,
    pub max_concurrent_searches: usize,
    pub max_concurrent_verifications: usize,
    /// Upper bound for one transport attempt against one host.
    pub verification_timeout: Duration,
    pub verify_tls: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub user_agent: String,
    pub output_dir: PathBuf,
    /// Extra attempts for a filter after a rate-limit or transient failure.
    pub search_retries: u32,
    pub retry_base_delay: Duration,
    /// Time in-flight probes get to finish after cancellation.
    pub cancel_grace: Duration,
    pub schemes: Vec<String>,
    pub endpoint_paths: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results_per_filter: 100,
            max_concurrent_searches: 5,
            max_concurrent_verifications: 50,
            verification_timeout: Duration::from_secs(3),
            verify_tls: true,
            follow_redirects: true,
            max_redirects: 5,
            user_agent: format!(
                "mcp-scan-rs/{} (security research)",
                env!("CARGO_PKG_VERSION")
            ),
            output_dir: PathBuf::from("scan_results"),
            search_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            cancel_grace: Duration::from_secs(2),
            schemes: vec!["https".into(), "http".into()],
            endpoint_paths: DEFAULT_ENDPOINT_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl ScanConfig {
    /// Check every value used by verification.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_results_per_filter", self.max_results_per_filter, 1, 1000)?;
        check_range("max_concurrent_searches", self.max_concurrent_searches, 1, 50)?;
        check_range(
            "max_concurrent_verifications",
            self.max_concurrent_verifications,
            1,
            200,
        )?;
        check_range("max_redirects", self.max_redirects, 0, 20)?;
        if self.verification_timeout < Duration::from_millis(500)
            || self.verification_timeout > Duration::from_secs(60)
        {
            return Err(ConfigError::Timeout(self.verification_timeout));
        }
        if self.schemes.is_empty() {
            return Err(ConfigError::Empty("scheme"));
        }
        if let Some(bad) = self
            .schemes
            .iter()
            .find(|s| s.as_str() != "http" && s.as_str() != "https")
        {
            return Err(ConfigError::Scheme(bad.clone()));
        }
        if self.endpoint_paths.is_empty() {
            return Err(ConfigError::Empty("endpoint path"));
        }
        Ok(())
    }

    /// Like [`ScanConfig::validate`], additionally requiring the search credential.
    pub fn validate_for_discovery(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        self.validate()
    }
}

fn check_range(name: &'static str, value: usize, min: usize, max: usize) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            name,
            value: value as u64,
            min: min as u64,
            max: max as u64,
        });
    }
    Ok(())
}

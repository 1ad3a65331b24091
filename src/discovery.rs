use crate::config::ScanConfig;
use crate::error::{ScanError, SearchError};
use crate::search::{RawMatch, SearchClient};
use crate::types::{DiscoveredServer, Filter, FilterFailure, RunStatus, ServerIndex};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exponential backoff for retryable search failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), or `None` once retries are exhausted.
    pub fn delay(&self, retry: u32) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(retry);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub max_results_per_filter: usize,
    pub max_concurrent_searches: usize,
    pub retry: RetryPolicy,
}

impl DiscoveryOptions {
    pub fn from_config(cfg: &ScanConfig) -> Self {
        Self {
            max_results_per_filter: cfg.max_results_per_filter,
            max_concurrent_searches: cfg.max_concurrent_searches,
            retry: RetryPolicy {
                max_retries: cfg.search_retries,
                base_delay: cfg.retry_base_delay,
                ..RetryPolicy::default()
            },
        }
    }
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from_config(&ScanConfig::default())
    }
}

/// Deduplicated result of one discovery phase.
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub filters_used: Vec<Filter>,
    pub servers: Vec<DiscoveredServer>,
    pub failures: Vec<FilterFailure>,
    pub cancelled: bool,
}

impl DiscoveryOutcome {
    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Cancelled
        } else if !self.failures.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Complete
        }
    }
}

/// Result of one filter task after retries.
struct FilterRun {
    filter: Filter,
    attempts: u32,
    result: Result<Vec<RawMatch>, SearchError>,
}

/// Fans filters out to the search backend and merges the matches by host identity.
pub struct DiscoveryEngine {
    client: Arc<dyn SearchClient>,
    options: DiscoveryOptions,
}

impl DiscoveryEngine {
    pub fn new(client: Arc<dyn SearchClient>, options: DiscoveryOptions) -> Self {
        Self { client, options }
    }

    /// Run every filter with at most `max_concurrent_searches` calls in flight.
    ///
    /// A credential failure on any filter aborts the phase and discards all
    /// results. Other failures are retried, then recorded; the phase carries on
    /// with whatever succeeded. Cancellation stops dispatching, abandons
    /// in-flight searches and returns what was merged so far.
    pub async fn run(
        &self,
        filters: &[Filter],
        cancel: CancellationToken,
    ) -> Result<DiscoveryOutcome, ScanError> {
        info!(filters = filters.len(), "starting discovery");
        let sem = Arc::new(Semaphore::new(
            self.options.max_concurrent_searches.clamp(1, 50),
        ));
        let mut set: JoinSet<FilterRun> = JoinSet::new();
        let mut index = ServerIndex::new();
        let mut failures = Vec::new();
        let mut cancelled = false;

        let mut pending = filters.iter().cloned();
        let mut next = pending.next();

        while next.is_some() || !set.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(joined) = set.join_next(), if !set.is_empty() => {
                    merge_run(joined, &mut index, &mut failures)?;
                }
                permit = sem.clone().acquire_owned(), if next.is_some() => {
                    let Ok(permit) = permit else { break };
                    let Some(filter) = next.take() else { continue };
                    next = pending.next();

                    let client = self.client.clone();
                    let retry = self.options.retry.clone();
                    let limit = self.options.max_results_per_filter;
                    let cancel = cancel.clone();
                    set.spawn(async move {
                        let _permit = permit; // keep permit until task completes
                        let fallback = filter.clone();
                        // a panicking client fails its filter, not the phase
                        AssertUnwindSafe(search_with_retry(
                            client.as_ref(),
                            filter,
                            limit,
                            &retry,
                            &cancel,
                        ))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| FilterRun {
                            filter: fallback,
                            attempts: 1,
                            result: Err(SearchError::Transient("search task panicked".into())),
                        })
                    });
                }
            }
        }

        if cancelled {
            warn!(in_flight = set.len(), "discovery cancelled");
            set.abort_all();
        }

        let outcome = DiscoveryOutcome {
            filters_used: filters.to_vec(),
            servers: index.into_vec(),
            failures,
            cancelled,
        };
        info!(
            servers = outcome.servers.len(),
            failed_filters = outcome.failures.len(),
            status = %outcome.status(),
            "discovery finished"
        );
        Ok(outcome)
    }
}

/// Single mutation point for the shared server map.
fn merge_run(
    joined: Result<FilterRun, JoinError>,
    index: &mut ServerIndex,
    failures: &mut Vec<FilterFailure>,
) -> Result<(), ScanError> {
    let run = match joined {
        Ok(run) => run,
        Err(e) => {
            warn!(error = %e, "search task did not complete");
            return Ok(());
        }
    };
    match run.result {
        Ok(matches) => {
            let mut new = 0usize;
            for m in matches {
                if index.merge(to_discovered(m, &run.filter)) {
                    new += 1;
                }
            }
            debug!(query = %run.filter.query, new, total = index.len(), "merged filter results");
        }
        Err(SearchError::Auth(msg)) => return Err(ScanError::Credential(msg)),
        Err(e) => {
            warn!(query = %run.filter.query, attempts = run.attempts, error = %e, "filter failed");
            failures.push(FilterFailure {
                category: run.filter.category,
                query: run.filter.query,
                reason: e.to_string(),
                attempts: run.attempts,
            });
        }
    }
    Ok(())
}

fn to_discovered(m: RawMatch, filter: &Filter) -> DiscoveredServer {
    let mut server = DiscoveredServer::new(m.ip_str, m.port, filter);
    server.hostnames = m.hostnames;
    server.domains = m.domains;
    server.raw_metadata = m.raw;
    server
}

async fn search_with_retry(
    client: &dyn SearchClient,
    filter: Filter,
    limit: usize,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> FilterRun {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let result = client.search(&filter.query, limit).await;
        let err = match result {
            Ok(matches) => {
                return FilterRun {
                    filter,
                    attempts,
                    result: Ok(matches),
                }
            }
            Err(e) => e,
        };
        let delay = if err.is_retryable() {
            retry.delay(attempts - 1)
        } else {
            None
        };
        let Some(delay) = delay else {
            return FilterRun {
                filter,
                attempts,
                result: Err(err),
            };
        };
        debug!(query = %filter.query, ?delay, error = %err, "retrying search");
        tokio::select! {
            _ = cancel.cancelled() => {
                return FilterRun { filter, attempts, result: Err(err) };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

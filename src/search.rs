//! Search-backend boundary.
//!
//! [`SearchClient`] is the only thing discovery knows about the backend;
//! [`ShodanClient`] is the production implementation.
use crate::error::SearchError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

pub const SHODAN_API_URL: &str = "https://api.shodan.io";

/// Matches returned per backend page.
const PAGE_SIZE: usize = 100;

/// One host:port record from the backend, plus the untouched match object.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMatch {
    pub ip_str: String,
    pub port: u16,
    pub hostnames: Vec<String>,
    pub domains: Vec<String>,
    pub raw: Map<String, Value>,
}

impl RawMatch {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip_str: ip.into(),
            port,
            hostnames: Vec::new(),
            domains: Vec::new(),
            raw: Map::new(),
        }
    }

    /// Extract the fields discovery needs. Returns `None` for records without
    /// an address or a valid port.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(raw) = value else {
            return None;
        };
        let ip_str = raw.get("ip_str")?.as_str()?.to_string();
        let port = u16::try_from(raw.get("port")?.as_u64()?).ok()?;
        if ip_str.is_empty() || port == 0 {
            return None;
        }
        Some(Self {
            ip_str,
            port,
            hostnames: string_list(raw.get("hostnames")),
            domains: string_list(raw.get("domains")),
            raw,
        })
    }
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Run one query, returning at most `limit` matches.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawMatch>, SearchError>;
}

/// Credit balance reported by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountInfo {
    #[serde(default)]
    pub query_credits: i64,
    #[serde(default)]
    pub scan_credits: i64,
    #[serde(default)]
    pub plan: Option<String>,
}

/// Shodan host-search client.
#[derive(Debug, Clone)]
pub struct ShodanClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ShodanClient {
    pub fn new(api_key: impl Into<String>, user_agent: &str) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: SHODAN_API_URL.to_string(),
        })
    }

    /// Point the client at another deployment of the same API.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Validate the credential and read remaining credits.
    pub async fn account_info(&self) -> Result<AccountInfo, SearchError> {
        let body = self.get_json("/api-info", &[]).await?;
        serde_json::from_value(body)
            .map_err(|e| SearchError::Transient(format!("undecodable account info: {e}")))
    }

    async fn search_page(&self, query: &str, page: usize) -> Result<Vec<Value>, SearchError> {
        let page = page.to_string();
        let body = self
            .get_json(
                "/shodan/host/search",
                &[("query", query), ("page", page.as_str())],
            )
            .await?;
        match body.get("matches") {
            Some(Value::Array(matches)) => Ok(matches.clone()),
            Some(_) => Err(SearchError::Transient("`matches` is not an array".into())),
            None => Ok(Vec::new()),
        }
    }

    async fn get_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, SearchError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .query(&[("key", self.api_key.as_str())])
            .query(params)
            .send()
            .await
            .map_err(|e| SearchError::Transient(e.without_url().to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| SearchError::Transient(e.without_url().to_string()))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }
        // in-band errors on a 200 are backend faults unless they name the query
        if let Some(msg) = body.get("error").and_then(Value::as_str) {
            return Err(if is_query_error(msg) {
                SearchError::InvalidQuery(msg.to_string())
            } else {
                SearchError::Transient(msg.to_string())
            });
        }
        if body.is_null() {
            return Err(SearchError::Transient("response body is not JSON".into()));
        }
        Ok(body)
    }
}

#[async_trait]
impl SearchClient for ShodanClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawMatch>, SearchError> {
        let mut out = Vec::new();
        let mut page = 1;
        while out.len() < limit {
            let matches = self.search_page(query, page).await?;
            let fetched = matches.len();
            out.extend(matches.into_iter().filter_map(RawMatch::from_value));
            debug!(query, page, fetched, "search page");
            if fetched < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        out.truncate(limit);
        Ok(out)
    }
}

/// Map a failed backend response to the error taxonomy.
pub fn classify_failure(status: StatusCode, body: &Value) -> SearchError {
    let msg = body
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());

    if is_query_error(&msg) {
        return SearchError::InvalidQuery(msg);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SearchError::Auth(msg),
        StatusCode::TOO_MANY_REQUESTS => SearchError::RateLimited(msg),
        StatusCode::BAD_REQUEST => SearchError::InvalidQuery(msg),
        _ => SearchError::Transient(msg),
    }
}

fn is_query_error(msg: &str) -> bool {
    msg.to_lowercase().contains("invalid query")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_match_extracts_identity() {
        let m = RawMatch::from_value(json!({
            "ip_str": "10.0.0.1",
            "port": 443,
            "hostnames": ["a.example", 5],
            "org": "Example"
        }))
        .unwrap();
        assert_eq!(m.ip_str, "10.0.0.1");
        assert_eq!(m.port, 443);
        assert_eq!(m.hostnames, vec!["a.example".to_string()]);
        assert!(m.domains.is_empty());
        assert_eq!(m.raw["org"], "Example");
    }

    #[test]
    fn raw_match_rejects_bad_records() {
        assert!(RawMatch::from_value(json!({"ip_str": "10.0.0.1"})).is_none());
        assert!(RawMatch::from_value(json!({"ip_str": "10.0.0.1", "port": 70000})).is_none());
        assert!(RawMatch::from_value(json!({"ip_str": "", "port": 80})).is_none());
        assert!(RawMatch::from_value(json!([1, 2])).is_none());
    }

    #[test]
    fn status_classification() {
        let body = json!({"error": "Invalid API key"});
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, &body),
            SearchError::Auth(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, &Value::Null),
            SearchError::RateLimited(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, &Value::Null),
            SearchError::Transient(_)
        ));
        let body = json!({"error": "Invalid query: unbalanced quotes"});
        assert!(matches!(
            classify_failure(StatusCode::INTERNAL_SERVER_ERROR, &body),
            SearchError::InvalidQuery(_)
        ));
    }
}

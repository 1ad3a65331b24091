//! Handshake probing of a single host over one transport.
//!
//! Each candidate endpoint runs through a small state machine:
//!
//! ```text
//! Connecting -> HandshakeSent -> AwaitingResponse -> Confirmed
//!      \              \                 \----------> Rejected | TimedOut | ConnFailed
//!       \              \--------------------------> Rejected | TimedOut | ConnFailed
//!        \----------------------------------------> TimedOut | ConnFailed
//! ```
//!
//! A transport attempt walks the candidate endpoints in order under one
//! per-attempt timeout and stops at the first `Confirmed`. Tool listing runs
//! afterwards with its own budget and never changes the verdict.
use crate::config::ScanConfig;
use crate::protocol::{
    self, classify_greeting, classify_initialize, has_id, parse_tools_page, HandshakeReply,
    InitializeResult, SseBuffer, SseEvent, StreamGreeting, INITIALIZE_ID, TOOLS_LIST_ID,
};
use crate::types::{
    now_utc, AttemptOutcome, DiscoveredServer, ServerInfo, ToolDescriptor, Transport,
    VerificationAttempt,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::redirect::Policy;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::error::Error as _;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, trace};
use url::Url;

const SESSION_HEADER: &str = "Mcp-Session-Id";
const MAX_TOOL_PAGES: u64 = 10;

/// Probe one host over one transport.
#[async_trait]
pub trait TransportProbe: Send + Sync {
    async fn probe(&self, server: &DiscoveredServer, transport: Transport) -> ProbeReport;
}

/// Outcome of one transport attempt.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub attempt: VerificationAttempt,
    /// Present exactly when the attempt outcome is `protocol_confirmed`.
    pub confirmation: Option<Confirmation>,
}

/// What a confirmed endpoint told us about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Confirmation {
    pub url: String,
    pub protocol_version: Option<String>,
    pub server_info: ServerInfo,
    pub capabilities: BTreeSet<String>,
    pub tools: Vec<ToolDescriptor>,
    pub handshake_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Connecting,
    HandshakeSent,
    AwaitingResponse,
    Confirmed,
    Rejected,
    TimedOut,
    ConnFailed,
}

impl ProbeState {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            ProbeState::Connecting | ProbeState::HandshakeSent | ProbeState::AwaitingResponse
        )
    }

    pub fn can_advance_to(self, next: ProbeState) -> bool {
        use ProbeState::*;
        match (self, next) {
            (Connecting, HandshakeSent | TimedOut | ConnFailed) => true,
            (HandshakeSent, AwaitingResponse | Rejected | TimedOut | ConnFailed) => true,
            (AwaitingResponse, Confirmed | Rejected | TimedOut | ConnFailed) => true,
            _ => false,
        }
    }

    pub fn outcome(self) -> Option<AttemptOutcome> {
        match self {
            ProbeState::Confirmed => Some(AttemptOutcome::ProtocolConfirmed),
            ProbeState::Rejected => Some(AttemptOutcome::ProtocolRejected),
            ProbeState::TimedOut => Some(AttemptOutcome::Timeout),
            ProbeState::ConnFailed => Some(AttemptOutcome::ConnectionError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub verify_tls: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub user_agent: String,
    pub schemes: Vec<String>,
    pub endpoint_paths: Vec<String>,
}

impl ProbeSettings {
    pub fn from_config(cfg: &ScanConfig) -> Self {
        Self {
            timeout: cfg.verification_timeout,
            verify_tls: cfg.verify_tls,
            follow_redirects: cfg.follow_redirects,
            max_redirects: cfg.max_redirects,
            user_agent: cfg.user_agent.clone(),
            schemes: cfg.schemes.clone(),
            endpoint_paths: cfg.endpoint_paths.clone(),
        }
    }
}

/// Event-stream body reader.
struct SseReader {
    stream: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: SseBuffer,
    queued: VecDeque<SseEvent>,
}

impl SseReader {
    fn new(resp: reqwest::Response) -> Self {
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Self {
            stream,
            buffer: SseBuffer::default(),
            queued: VecDeque::new(),
        }
    }

    /// Next data-bearing event; `None` once the server closes the stream.
    async fn next_event(&mut self) -> reqwest::Result<Option<SseEvent>> {
        loop {
            if let Some(ev) = self.queued.pop_front() {
                return Ok(Some(ev));
            }
            match self.stream.next().await {
                Some(chunk) => self.queued.extend(self.buffer.push(&chunk?)),
                None => return Ok(None),
            }
        }
    }

    /// Skip events until the JSON-RPC response with `id` arrives.
    async fn next_response(&mut self, id: u64) -> reqwest::Result<Option<Value>> {
        while let Some(ev) = self.next_event().await? {
            if let Ok(v) = serde_json::from_str::<Value>(&ev.data) {
                if has_id(&v, id) {
                    return Ok(Some(v));
                }
            }
        }
        Ok(None)
    }
}

/// Work left after an endpoint confirmed.
enum Followup {
    Http { session_id: Option<String> },
    Sse { reader: SseReader, post_url: Url },
    Done,
}

struct EndpointResult {
    url: String,
    state: ProbeState,
    detail: Option<String>,
    elapsed: Duration,
    init: Option<InitializeResult>,
    followup: Followup,
}

/// Per-endpoint state tracker.
struct Handshake {
    url: String,
    state: ProbeState,
    started: Instant,
}

impl Handshake {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: ProbeState::Connecting,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: ProbeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(url = %self.url, from = ?self.state, to = ?next, "probe transition");
        self.state = next;
    }

    fn finish(mut self, terminal: ProbeState, detail: impl Into<String>) -> EndpointResult {
        self.advance(terminal);
        EndpointResult {
            elapsed: self.started.elapsed(),
            url: self.url,
            state: terminal,
            detail: Some(detail.into()),
            init: None,
            followup: Followup::Done,
        }
    }

    fn reject(mut self, detail: impl Into<String>) -> EndpointResult {
        if self.state == ProbeState::Connecting {
            self.advance(ProbeState::HandshakeSent);
        }
        self.finish(ProbeState::Rejected, detail)
    }

    fn transport_error(self, e: &reqwest::Error) -> EndpointResult {
        let state = if e.is_timeout() {
            ProbeState::TimedOut
        } else {
            ProbeState::ConnFailed
        };
        self.finish(state, error_chain(e))
    }

    fn confirm(mut self, init: Option<InitializeResult>, followup: Followup) -> EndpointResult {
        self.advance(ProbeState::Confirmed);
        EndpointResult {
            elapsed: self.started.elapsed(),
            url: self.url,
            state: ProbeState::Confirmed,
            detail: None,
            init,
            followup,
        }
    }
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

/// reqwest-backed implementation of both transports.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    settings: ProbeSettings,
}

impl HttpProbe {
    pub fn new(settings: ProbeSettings) -> Result<Self, reqwest::Error> {
        let redirect = if settings.follow_redirects {
            Policy::limited(settings.max_redirects)
        } else {
            Policy::none()
        };
        // No overall client timeout: event streams stay open past it. POSTs
        // carry their own per-request timeout. Hosts are probed once per run,
        // so finished connections are closed rather than pooled.
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(settings.timeout)
            .pool_max_idle_per_host(0)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .redirect(redirect)
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn candidate_urls(&self, server: &DiscoveredServer) -> Vec<String> {
        let host = server.target_host();
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let mut out = Vec::new();
        for scheme in &self.settings.schemes {
            for path in &self.settings.endpoint_paths {
                let path = if path.starts_with('/') {
                    path.clone()
                } else {
                    format!("/{path}")
                };
                out.push(format!("{scheme}://{host}:{}{path}", server.port));
            }
        }
        out
    }

    fn post(&self, url: &str, body: &Value, session_id: Option<&str>) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(url)
            .timeout(self.settings.timeout)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(sid) = session_id {
            req = req.header(SESSION_HEADER, sid);
        }
        req
    }

    async fn handshake_http(&self, url: &str) -> EndpointResult {
        let mut hs = Handshake::new(url);
        let body = protocol::initialize_request(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        hs.advance(ProbeState::HandshakeSent);
        let resp = match self.post(url, &body, None).send().await {
            Ok(r) => r,
            Err(e) => return hs.transport_error(&e),
        };
        hs.advance(ProbeState::AwaitingResponse);
        // record where redirects ended up
        hs.url = resp.url().to_string();
        let status = resp.status();
        if !status.is_success() {
            return hs.finish(ProbeState::Rejected, format!("HTTP {status}"));
        }
        let session_id = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let reply = match read_reply(resp, INITIALIZE_ID).await {
            Ok(Some(v)) => v,
            Ok(None) => return hs.finish(ProbeState::Rejected, "reply is not a JSON-RPC message"),
            Err(e) => return hs.transport_error(&e),
        };
        match classify_initialize(&reply) {
            HandshakeReply::WellFormed(init) => {
                hs.confirm(Some(init), Followup::Http { session_id })
            }
            HandshakeReply::SchemaViolation(m) | HandshakeReply::UnexpectedShape(m) => {
                hs.finish(ProbeState::Rejected, m)
            }
        }
    }

    async fn handshake_sse(&self, url: &str) -> EndpointResult {
        let mut hs = Handshake::new(url);
        let resp = match self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return hs.transport_error(&e),
        };
        let status = resp.status();
        if !status.is_success() {
            return hs.reject(format!("HTTP {status}"));
        }
        if !content_type(&resp).contains("text/event-stream") {
            return hs.reject("response is not an event stream");
        }
        hs.advance(ProbeState::HandshakeSent);
        let stream_url = resp.url().clone();
        hs.url = stream_url.to_string();
        let mut reader = SseReader::new(resp);
        hs.advance(ProbeState::AwaitingResponse);

        let first = match reader.next_event().await {
            Ok(Some(ev)) => ev,
            Ok(None) => return hs.finish(ProbeState::Rejected, "stream closed before any event"),
            Err(e) => return hs.transport_error(&e),
        };
        match classify_greeting(&first) {
            StreamGreeting::Endpoint(target) => match stream_url.join(&target) {
                Ok(post_url) => hs.confirm(None, Followup::Sse { reader, post_url }),
                Err(e) => hs.finish(ProbeState::Rejected, format!("bad endpoint URI: {e}")),
            },
            StreamGreeting::Message(_) => hs.confirm(None, Followup::Done),
            StreamGreeting::NotProtocol(m) => hs.finish(ProbeState::Rejected, m),
        }
    }

    async fn walk_endpoints(
        &self,
        transport: Transport,
        urls: &[String],
        best: &mut Option<EndpointResult>,
    ) {
        for url in urls {
            let r = match transport {
                Transport::Http => self.handshake_http(url).await,
                Transport::Sse => self.handshake_sse(url).await,
            };
            debug!(url = %r.url, %transport, state = ?r.state, detail = r.detail.as_deref().unwrap_or(""), "endpoint probed");
            let confirmed = r.state == ProbeState::Confirmed;
            if best.as_ref().map_or(true, |b| rank(r.state) > rank(b.state)) {
                *best = Some(r);
            }
            if confirmed {
                return;
            }
        }
    }

    /// Fill in handshake details and tools for a confirmed endpoint.
    async fn follow_up(&self, result: &mut EndpointResult, conf: &mut Confirmation) {
        match std::mem::replace(&mut result.followup, Followup::Done) {
            Followup::Http { session_id } => {
                let sid = session_id.as_deref();
                let _ = self
                    .post(&result.url, &protocol::initialized_notification(), sid)
                    .send()
                    .await;
                self.list_tools_http(&result.url, sid, &mut conf.tools).await;
            }
            Followup::Sse {
                mut reader,
                post_url,
            } => {
                let init_req =
                    protocol::initialize_request(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
                let reply = self
                    .sse_request(&mut reader, &post_url, &init_req, INITIALIZE_ID)
                    .await;
                let Some(HandshakeReply::WellFormed(init)) = reply.as_ref().map(classify_initialize)
                else {
                    debug!(url = %result.url, "stream confirmed but initialize went unanswered");
                    return;
                };
                apply_init(conf, &init);
                let _ = self
                    .post(post_url.as_str(), &protocol::initialized_notification(), None)
                    .send()
                    .await;
                let mut cursor: Option<String> = None;
                for page in 0..MAX_TOOL_PAGES {
                    let id = TOOLS_LIST_ID + page;
                    let req = protocol::tools_list_request(id, cursor.as_deref());
                    let Some(reply) = self.sse_request(&mut reader, &post_url, &req, id).await
                    else {
                        break;
                    };
                    let Some((batch, next)) = parse_tools_page(&reply) else {
                        break;
                    };
                    conf.tools.extend(batch);
                    match next {
                        Some(c) => cursor = Some(c),
                        None => break,
                    }
                }
            }
            Followup::Done => {}
        }
    }

    /// Pages are appended to `tools` as they arrive.
    async fn list_tools_http(
        &self,
        url: &str,
        session_id: Option<&str>,
        tools: &mut Vec<ToolDescriptor>,
    ) {
        let mut cursor: Option<String> = None;
        for page in 0..MAX_TOOL_PAGES {
            let id = TOOLS_LIST_ID + page;
            let req = protocol::tools_list_request(id, cursor.as_deref());
            let resp = match self.post(url, &req, session_id).send().await {
                Ok(r) if r.status().is_success() => r,
                _ => break,
            };
            let Ok(Some(reply)) = read_reply(resp, id).await else {
                break;
            };
            let Some((batch, next)) = parse_tools_page(&reply) else {
                break;
            };
            tools.extend(batch);
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
    }

    /// POST a request to an event-stream server and read its reply, either
    /// inline in the POST response or from the open stream.
    async fn sse_request(
        &self,
        reader: &mut SseReader,
        post_url: &Url,
        body: &Value,
        id: u64,
    ) -> Option<Value> {
        let resp = self.post(post_url.as_str(), body, None).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        if content_type(&resp).contains("application/json") {
            if let Ok(v) = resp.json::<Value>().await {
                if has_id(&v, id) {
                    return Some(v);
                }
            }
        }
        reader.next_response(id).await.ok().flatten()
    }
}

fn rank(state: ProbeState) -> u8 {
    state.outcome().map_or(0, |o| o.rank())
}

fn apply_init(conf: &mut Confirmation, init: &InitializeResult) {
    conf.protocol_version = Some(init.protocol_version.clone());
    conf.server_info = init.server_info.clone();
    conf.capabilities = init.capability_names().collect();
}

fn content_type(resp: &reqwest::Response) -> String {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Read a JSON-RPC reply from a JSON or event-stream body.
async fn read_reply(resp: reqwest::Response, id: u64) -> reqwest::Result<Option<Value>> {
    if content_type(&resp).contains("text/event-stream") {
        return SseReader::new(resp).next_response(id).await;
    }
    let text = resp.text().await?;
    Ok(serde_json::from_str::<Value>(&text).ok())
}

#[async_trait]
impl TransportProbe for HttpProbe {
    async fn probe(&self, server: &DiscoveredServer, transport: Transport) -> ProbeReport {
        let started_at = now_utc();
        let start = Instant::now();
        let urls = self.candidate_urls(server);

        let mut best: Option<EndpointResult> = None;
        let walked = time::timeout(
            self.settings.timeout,
            self.walk_endpoints(transport, &urls, &mut best),
        )
        .await;

        let mut result = match (walked, best) {
            (Ok(()), Some(r)) => r,
            (Ok(()), None) => EndpointResult {
                url: String::new(),
                state: ProbeState::ConnFailed,
                detail: Some("no candidate endpoints".into()),
                elapsed: start.elapsed(),
                init: None,
                followup: Followup::Done,
            },
            // a rejection seen before the deadline says more than the timeout
            (Err(_), Some(r)) if rank(r.state) >= rank(ProbeState::Rejected) => r,
            (Err(_), _) => EndpointResult {
                url: String::new(),
                state: ProbeState::TimedOut,
                detail: Some(format!("no handshake within {:?}", self.settings.timeout)),
                elapsed: start.elapsed(),
                init: None,
                followup: Followup::Done,
            },
        };
        let latency_ms = start.elapsed().as_millis() as u64;
        let outcome = result.state.outcome().unwrap_or(AttemptOutcome::ConnectionError);

        let confirmation = if outcome.is_confirmed() {
            let mut conf = Confirmation {
                url: result.url.clone(),
                handshake_ms: result.elapsed.as_millis() as u64,
                ..Confirmation::default()
            };
            if let Some(init) = result.init.take() {
                apply_init(&mut conf, &init);
            }
            // best effort; a slow listing keeps the pages gathered so far
            let _ = time::timeout(
                self.settings.timeout,
                self.follow_up(&mut result, &mut conf),
            )
            .await;
            Some(conf)
        } else {
            None
        };

        let attempt = VerificationAttempt {
            transport,
            started_at,
            outcome,
            latency_ms,
            endpoint: (!result.url.is_empty()).then(|| result.url.clone()),
            detail: result.detail,
        };
        ProbeReport {
            attempt,
            confirmation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Filter;

    #[test]
    fn transitions_follow_the_machine() {
        use ProbeState::*;
        assert!(Connecting.can_advance_to(HandshakeSent));
        assert!(HandshakeSent.can_advance_to(AwaitingResponse));
        assert!(AwaitingResponse.can_advance_to(Confirmed));
        assert!(!Connecting.can_advance_to(Confirmed));
        assert!(!Confirmed.can_advance_to(Rejected));
        assert!(Rejected.is_terminal() && !AwaitingResponse.is_terminal());
        assert_eq!(TimedOut.outcome(), Some(AttemptOutcome::Timeout));
        assert_eq!(HandshakeSent.outcome(), None);
    }

    #[test]
    fn candidate_urls_cover_schemes_and_paths() {
        let probe = HttpProbe::new(ProbeSettings {
            schemes: vec!["https".into(), "http".into()],
            endpoint_paths: vec!["/mcp".into(), "sse".into()],
            ..ProbeSettings::from_config(&ScanConfig::default())
        })
        .unwrap();
        let mut server = DiscoveredServer::new("10.0.0.1", 8443, &Filter::new("c", "q"));
        assert_eq!(
            probe.candidate_urls(&server),
            vec![
                "https://10.0.0.1:8443/mcp",
                "https://10.0.0.1:8443/sse",
                "http://10.0.0.1:8443/mcp",
                "http://10.0.0.1:8443/sse",
            ]
        );
        server.host = "2001:db8::1".into();
        assert!(probe.candidate_urls(&server)[0].starts_with("https://[2001:db8::1]:8443"));
    }

    #[tokio::test]
    async fn closed_port_is_a_connection_error() {
        // bind then drop to get a port with nothing listening
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let probe = HttpProbe::new(ProbeSettings {
            schemes: vec!["http".into()],
            endpoint_paths: vec!["/mcp".into()],
            timeout: Duration::from_secs(2),
            ..ProbeSettings::from_config(&ScanConfig::default())
        })
        .unwrap();
        let server = DiscoveredServer::new("127.0.0.1", port, &Filter::new("c", "q"));
        let report = probe.probe(&server, Transport::Http).await;
        assert_eq!(report.attempt.outcome, AttemptOutcome::ConnectionError);
        assert!(report.confirmation.is_none());
    }
}

//! In-process stub servers shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mcp_scan_rs::config::ScanConfig;
use mcp_scan_rs::error::SearchError;
use mcp_scan_rs::search::{RawMatch, SearchClient};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

pub async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Config pointed at local stubs: plain http, a few paths, short timeouts.
pub fn local_config(output_dir: &std::path::Path) -> ScanConfig {
    ScanConfig {
        api_key: "test-key".into(),
        verification_timeout: Duration::from_secs(2),
        max_concurrent_verifications: 4,
        retry_base_delay: Duration::from_millis(5),
        cancel_grace: Duration::from_millis(100),
        output_dir: output_dir.to_path_buf(),
        schemes: vec!["http".into()],
        endpoint_paths: vec!["/mcp".into(), "/sse".into(), "/messages".into()],
        ..ScanConfig::default()
    }
}

#[derive(Clone, Default)]
pub struct StubState {
    pub initialize_calls: Arc<AtomicUsize>,
    sessions: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>>,
    next_session: Arc<AtomicUsize>,
}

fn initialize_result(id: &Value, name: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": name, "version": "0.3.1"}
        }
    })
}

/// Two pages: `forecast`, `geocode`, then `alerts`.
fn tools_page(req: &Value) -> Value {
    let cursor = req["params"]["cursor"].as_str();
    let result = match cursor {
        None => json!({
            "tools": [
                {"name": "forecast", "description": "Weather forecast", "inputSchema": {"type": "object"}},
                {"name": "geocode"}
            ],
            "nextCursor": "page-2"
        }),
        Some(_) => json!({"tools": [{"name": "alerts", "description": "Active alerts"}]}),
    };
    json!({"jsonrpc": "2.0", "id": req["id"], "result": result})
}

/// Streamable-HTTP MCP server at `/mcp`.
pub fn http_mcp_server(state: StubState) -> Router {
    Router::new().route("/mcp", post(http_rpc)).with_state(state)
}

async fn http_rpc(State(state): State<StubState>, Json(req): Json<Value>) -> Response {
    match req["method"].as_str() {
        Some("initialize") => {
            state.initialize_calls.fetch_add(1, Ordering::SeqCst);
            (
                [("mcp-session-id", "sess-1")],
                Json(initialize_result(&req["id"], "weather-http")),
            )
                .into_response()
        }
        Some("tools/list") => Json(tools_page(&req)).into_response(),
        _ => StatusCode::ACCEPTED.into_response(),
    }
}

/// Legacy event-stream MCP server: `GET /sse` announces `/messages`,
/// replies to POSTed requests arrive on the stream.
pub fn sse_mcp_server(state: StubState) -> Router {
    Router::new()
        .route("/sse", get(sse_open))
        .route("/messages", post(sse_message))
        .with_state(state)
}

async fn sse_open(
    State(state): State<StubState>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let session = format!("s{}", state.next_session.fetch_add(1, Ordering::SeqCst));
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(
        Event::default()
            .event("endpoint")
            .data(format!("/messages?session_id={session}")),
    );
    state.sessions.lock().await.insert(session, tx);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|ev| (Ok::<_, Infallible>(ev), rx))
    });
    Sse::new(stream)
}

async fn sse_message(
    State(state): State<StubState>,
    Query(params): Query<HashMap<String, String>>,
    Json(req): Json<Value>,
) -> StatusCode {
    let sessions = state.sessions.lock().await;
    let Some(tx) = params.get("session_id").and_then(|s| sessions.get(s)) else {
        return StatusCode::BAD_REQUEST;
    };
    let reply = match req["method"].as_str() {
        Some("initialize") => {
            state.initialize_calls.fetch_add(1, Ordering::SeqCst);
            initialize_result(&req["id"], "weather-sse")
        }
        Some("tools/list") => tools_page(&req),
        _ => return StatusCode::ACCEPTED,
    };
    let _ = tx.send(Event::default().event("message").data(reply.to_string()));
    StatusCode::ACCEPTED
}

/// Answers `/mcp` only after `delay`.
pub fn slow_server(delay: Duration) -> Router {
    Router::new().route(
        "/mcp",
        post(move || async move {
            tokio::time::sleep(delay).await;
            StatusCode::OK
        })
        .get(move || async move {
            tokio::time::sleep(delay).await;
            StatusCode::OK
        }),
    )
}

/// Plain web server: HTML on every path, JSON-RPC error on `/rpc`.
pub fn not_mcp_server() -> Router {
    Router::new()
        .route(
            "/mcp",
            post(|| async { "<html><body>hello</body></html>" })
                .get(|| async { "<html><body>hello</body></html>" }),
        )
        .route(
            "/rpc",
            post(|| async {
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": {"code": -32601, "message": "Method not found"}
                }))
            }),
        )
}

/// `/mcp` answers `initialize` as an event stream sent in two chunks, cut
/// inside the multi-byte `é` of the server name.
pub fn split_utf8_server() -> Router {
    Router::new().route("/mcp", post(split_rpc))
}

async fn split_rpc(Json(req): Json<Value>) -> Response {
    match req["method"].as_str() {
        Some("initialize") => {
            let frame = format!(
                "event: message\ndata: {}\n\n",
                initialize_result(&req["id"], "café")
            )
            .into_bytes();
            let cut = frame.iter().position(|&b| b == 0xC3).map_or(frame.len(), |p| p + 1);
            let chunks = vec![frame[..cut].to_vec(), frame[cut..].to_vec()];
            let body = futures::stream::iter(chunks).then(|chunk| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, Infallible>(Bytes::from(chunk))
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(body),
            )
                .into_response()
        }
        Some("tools/list") => {
            Json(json!({"jsonrpc": "2.0", "id": req["id"], "result": {"tools": []}})).into_response()
        }
        _ => StatusCode::ACCEPTED.into_response(),
    }
}

/// `GET /mcp` opens an event stream that never emits anything.
pub fn silent_stream_server() -> Router {
    Router::new().route(
        "/mcp",
        get(|| async { Sse::new(futures::stream::pending::<Result<Event, Infallible>>()) }),
    )
}

/// Handshake and first tools page succeed; the second page never arrives.
pub fn stalled_listing_server() -> Router {
    Router::new().route("/mcp", post(stalled_rpc))
}

async fn stalled_rpc(Json(req): Json<Value>) -> Response {
    match req["method"].as_str() {
        Some("initialize") => Json(initialize_result(&req["id"], "stalled")).into_response(),
        Some("tools/list") => {
            if req["params"]["cursor"].is_string() {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Json(tools_page(&req)).into_response()
        }
        _ => StatusCode::ACCEPTED.into_response(),
    }
}

/// `/mcp` redirects (307) to an MCP endpoint at `/real`.
pub fn redirecting_server(state: StubState) -> Router {
    Router::new()
        .route("/mcp", post(|| async { Redirect::temporary("/real") }))
        .route("/real", post(http_rpc))
        .with_state(state)
}

/// Open and peak connection counts across keep-alive stubs.
#[derive(Default)]
pub struct ConnCounter {
    pub open: AtomicUsize,
    pub peak: AtomicUsize,
    pub accepted: AtomicUsize,
}

/// Hand-rolled HTTP/1.1 MCP endpoint that keeps every connection alive
/// until the client closes it.
pub async fn spawn_keepalive_mcp(counter: Arc<ConnCounter>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                counter.accepted.fetch_add(1, Ordering::SeqCst);
                let now = counter.open.fetch_add(1, Ordering::SeqCst) + 1;
                counter.peak.fetch_max(now, Ordering::SeqCst);
                serve_keepalive(stream).await;
                counter.open.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });
    addr
}

async fn serve_keepalive(mut stream: TcpStream) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < head_end + len {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let req: Value = serde_json::from_slice(&buf[head_end..head_end + len]).unwrap_or(Value::Null);
        buf.drain(..head_end + len);

        let reply = match req["method"].as_str() {
            Some("initialize") => Some(initialize_result(&req["id"], "keepalive")),
            Some("tools/list") => Some(json!({"jsonrpc": "2.0", "id": req["id"], "result": {"tools": []}})),
            _ => None,
        };
        let resp = match reply {
            Some(v) => {
                let body = v.to_string();
                format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                    body.len(),
                    body
                )
            }
            None => "HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n".to_string(),
        };
        if stream.write_all(resp.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// In-memory search backend keyed by query.
#[derive(Default)]
pub struct StaticSearch {
    pub results: HashMap<String, Result<Vec<RawMatch>, SearchError>>,
    pub calls: AtomicUsize,
}

impl StaticSearch {
    pub fn with(mut self, query: &str, result: Result<Vec<RawMatch>, SearchError>) -> Self {
        self.results.insert(query.to_string(), result);
        self
    }
}

#[async_trait]
impl SearchClient for StaticSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawMatch>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.results.get(query) {
            Some(Ok(matches)) => Ok(matches.iter().take(limit).cloned().collect()),
            Some(Err(e)) => Err(e.clone()),
            None => Ok(Vec::new()),
        }
    }
}

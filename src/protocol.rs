//! Wire shapes of the MCP handshake and the event-stream framing.
use crate::types::{ServerInfo, ToolDescriptor};
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Protocol revision offered in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const INITIALIZE_ID: u64 = 1;
/// First request id used for `tools/list`; subsequent pages count up.
pub const TOOLS_LIST_ID: u64 = 2;

pub fn initialize_request(client_name: &str, client_version: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": INITIALIZE_ID,
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": client_name, "version": client_version },
        },
    })
}

pub fn initialized_notification() -> Value {
    json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })
}

pub fn tools_list_request(id: u64, cursor: Option<&str>) -> Value {
    let params = match cursor {
        Some(c) => json!({ "cursor": c }),
        None => json!({}),
    };
    json!({ "jsonrpc": "2.0", "id": id, "method": "tools/list", "params": params })
}

/// The `result` of a successful `initialize`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Map<String, Value>,
    #[serde(rename = "serverInfo", default)]
    pub server_info: ServerInfo,
}

impl InitializeResult {
    pub fn capability_names(&self) -> impl Iterator<Item = String> + '_ {
        self.capabilities.keys().cloned()
    }
}

/// Classification of a reply to `initialize`.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeReply {
    /// JSON-RPC 2.0 response whose result matches the handshake schema.
    WellFormed(InitializeResult),
    /// JSON-RPC 2.0 envelope, but the payload is not a valid handshake
    /// (error reply, wrong id, bad result).
    SchemaViolation(String),
    /// Not a JSON-RPC 2.0 response at all.
    UnexpectedShape(String),
}

/// Whether `value` is a JSON-RPC response carrying `id` (numeric or numeric string).
pub fn has_id(value: &Value, id: u64) -> bool {
    match value.get("id") {
        Some(Value::Number(n)) => n.as_u64() == Some(id),
        Some(Value::String(s)) => s.parse::<u64>().ok() == Some(id),
        _ => false,
    }
}

fn is_jsonrpc(value: &Value) -> bool {
    value.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
}

pub fn classify_initialize(body: &Value) -> HandshakeReply {
    if !body.is_object() {
        return HandshakeReply::UnexpectedShape("reply is not a JSON object".into());
    }
    if !is_jsonrpc(body) {
        return HandshakeReply::UnexpectedShape("missing `jsonrpc: \"2.0\"` envelope".into());
    }
    if let Some(err) = body.get("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or_default();
        let msg = err.get("message").and_then(Value::as_str).unwrap_or("");
        return HandshakeReply::SchemaViolation(format!("error reply {code}: {msg}"));
    }
    if !has_id(body, INITIALIZE_ID) {
        return HandshakeReply::SchemaViolation("reply id does not match request".into());
    }
    let Some(result) = body.get("result") else {
        return HandshakeReply::SchemaViolation("reply has neither result nor error".into());
    };
    match InitializeResult::deserialize(result) {
        Ok(init) if init.protocol_version.trim().is_empty() => {
            HandshakeReply::SchemaViolation("empty protocolVersion".into())
        }
        Ok(init) => HandshakeReply::WellFormed(init),
        Err(e) => HandshakeReply::SchemaViolation(format!("invalid initialize result: {e}")),
    }
}

/// Tools from one `tools/list` reply plus the cursor for the next page.
///
/// Entries that are not valid tool objects are skipped; order is kept.
pub fn parse_tools_page(body: &Value) -> Option<(Vec<ToolDescriptor>, Option<String>)> {
    let result = body.get("result")?;
    let tools = result
        .get("tools")?
        .as_array()?
        .iter()
        .filter_map(|t| ToolDescriptor::deserialize(t).ok())
        .filter(|t| !t.name.is_empty())
        .collect();
    let next = result
        .get("nextCursor")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    Some((tools, next))
}

/// A parsed `text/event-stream` event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Parse one event block (the text between blank lines). Blocks without
/// `data:` lines (comments, keep-alives) yield `None`.
pub fn parse_sse_event(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut has_data = false;
    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(pos) => {
                let v = &line[pos + 1..];
                (&line[..pos], v.strip_prefix(' ').unwrap_or(v))
            }
            None => (line, ""),
        };
        match field {
            "id" => event.id = Some(value.to_string()),
            "event" => event.event = Some(value.to_string()),
            "data" => {
                if has_data {
                    event.data.push('\n');
                }
                event.data.push_str(value);
                has_data = true;
            }
            _ => {}
        }
    }
    has_data.then_some(event)
}

/// Accumulates raw stream chunks and yields complete events.
///
/// Line endings are normalized to `\n` as bytes arrive, so a `\r\n` pair
/// or a multi-byte character split across chunks is handled. Blocks are
/// decoded only once complete.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buf: Vec<u8>,
    after_cr: bool,
}

impl SseBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        for &b in chunk {
            match b {
                b'\r' => {
                    self.buf.push(b'\n');
                    self.after_cr = true;
                }
                b'\n' if self.after_cr => self.after_cr = false,
                _ => {
                    self.buf.push(b);
                    self.after_cr = false;
                }
            }
        }
        let mut out = Vec::new();
        while let Some(pos) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..pos + 2).collect();
            if let Some(ev) = parse_sse_event(&String::from_utf8_lossy(&block)) {
                out.push(ev);
            }
        }
        out
    }
}

/// What the first data-bearing event on a stream says about the server.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamGreeting {
    /// `endpoint` event naming where to POST requests.
    Endpoint(String),
    /// A JSON-RPC message delivered directly on the stream.
    Message(Value),
    NotProtocol(String),
}

pub fn classify_greeting(ev: &SseEvent) -> StreamGreeting {
    match ev.event.as_deref() {
        Some("endpoint") => {
            let data = ev.data.trim();
            let uri = if data.starts_with('{') {
                serde_json::from_str::<Value>(data)
                    .ok()
                    .and_then(|v| v.get("uri").and_then(Value::as_str).map(str::to_string))
            } else {
                Some(data.to_string())
            };
            match uri {
                Some(u) if !u.is_empty() => StreamGreeting::Endpoint(u),
                _ => StreamGreeting::NotProtocol("endpoint event without a URI".into()),
            }
        }
        Some("message") | None => match serde_json::from_str::<Value>(&ev.data) {
            Ok(v) if is_jsonrpc(&v) => StreamGreeting::Message(v),
            Ok(_) => StreamGreeting::NotProtocol("event data is not JSON-RPC".into()),
            Err(_) => StreamGreeting::NotProtocol("event data is not JSON".into()),
        },
        Some(other) => StreamGreeting::NotProtocol(format!("unexpected event type `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_reply() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}, "logging": {}},
                "serverInfo": {"name": "stub", "version": "0.1"}
            }
        })
    }

    #[test]
    fn well_formed_handshake() {
        match classify_initialize(&ok_reply()) {
            HandshakeReply::WellFormed(init) => {
                assert_eq!(init.protocol_version, "2024-11-05");
                assert_eq!(init.server_info.name.as_deref(), Some("stub"));
                let caps: Vec<_> = init.capability_names().collect();
                assert_eq!(caps, vec!["tools", "logging"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn string_id_is_accepted() {
        let mut reply = ok_reply();
        reply["id"] = json!("1");
        assert!(matches!(classify_initialize(&reply), HandshakeReply::WellFormed(_)));
    }

    #[test]
    fn error_reply_and_bad_result_are_schema_violations() {
        let err = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "nope"}});
        assert!(matches!(
            classify_initialize(&err),
            HandshakeReply::SchemaViolation(ref m) if m.contains("-32601")
        ));
        let bad = json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {}}});
        assert!(matches!(classify_initialize(&bad), HandshakeReply::SchemaViolation(_)));
        let wrong_id = json!({"jsonrpc": "2.0", "id": 9, "result": ok_reply()["result"]});
        assert!(matches!(classify_initialize(&wrong_id), HandshakeReply::SchemaViolation(_)));
    }

    #[test]
    fn non_jsonrpc_is_unexpected_shape() {
        assert!(matches!(
            classify_initialize(&json!({"status": "ok"})),
            HandshakeReply::UnexpectedShape(_)
        ));
        assert!(matches!(
            classify_initialize(&json!("hello")),
            HandshakeReply::UnexpectedShape(_)
        ));
    }

    #[test]
    fn tools_page_keeps_order_and_skips_junk() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {
                "tools": [
                    {"name": "b", "description": "second", "inputSchema": {"type": "object"}},
                    {"description": "no name"},
                    {"name": "a"}
                ],
                "nextCursor": "page-2"
            }
        });
        let (tools, next) = parse_tools_page(&body).unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(next.as_deref(), Some("page-2"));
        assert!(parse_tools_page(&json!({"jsonrpc": "2.0", "id": 2})).is_none());
    }

    #[test]
    fn sse_buffer_splits_across_chunks() {
        let mut buf = SseBuffer::default();
        assert!(buf.push(b"event: endpoint\r\ndata: /messages?session").is_empty());
        // CRLF pair split between chunks must not end the block early
        assert!(buf.push(b"Id=42\r").is_empty());
        let events = buf.push(b"\n\r\n: ping\n\ndata: {\"a\":1}\ndata: x\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?sessionId=42");
        assert_eq!(events[1].data, "{\"a\":1}\nx");
    }

    #[test]
    fn sse_buffer_keeps_multibyte_characters_split_across_chunks() {
        let bytes = "data: {\"name\":\"café\"}\n\n".as_bytes();
        let cut = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut buf = SseBuffer::default();
        assert!(buf.push(&bytes[..cut]).is_empty());
        let events = buf.push(&bytes[cut..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"name\":\"café\"}");
    }

    #[test]
    fn greetings() {
        let ep = SseEvent {
            event: Some("endpoint".into()),
            data: r#"{"uri": "/messages/abc"}"#.into(),
            ..SseEvent::default()
        };
        assert_eq!(classify_greeting(&ep), StreamGreeting::Endpoint("/messages/abc".into()));

        let msg = SseEvent {
            data: r#"{"jsonrpc":"2.0","method":"notifications/message"}"#.into(),
            ..SseEvent::default()
        };
        assert!(matches!(classify_greeting(&msg), StreamGreeting::Message(_)));

        let junk = SseEvent {
            event: Some("tick".into()),
            data: "1".into(),
            ..SseEvent::default()
        };
        assert!(matches!(classify_greeting(&junk), StreamGreeting::NotProtocol(_)));
    }
}

//! Library crate for mcp-scan-rs: finds candidate MCP servers through a
//! search backend and confirms them with a protocol handshake.
pub mod checkpoint;
pub mod config;
pub mod discovery;
pub mod error;
pub mod filters;
pub mod pipeline;
pub mod probe;
pub mod protocol;
pub mod report;
pub mod search;
pub mod types;
pub mod verification;

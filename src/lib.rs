//! MCP server over MQTT 5.0
//!
//! This crate serves Model Context Protocol (MCP) tools over an MQTT 5.0
//! broker: clients discover live servers through a retained presence message,
//! negotiate a session on a shared control topic, and then exchange JSON-RPC
//! 2.0 traffic on a per-client RPC topic. Dead peers are detected through
//! MQTT Last Will messages on presence topics.
//!
//! # Architecture
//!
//! - **[`protocol`]**: JSON-RPC 2.0 message types and MCP wire definitions
//! - **[`server`]**: the protocol engine: topic routing, session lifecycle,
//!   method dispatch and presence discipline
//! - **[`tools`]**: thread-safe tool registry with exception isolation
//! - **[`session`]**: per-client session records
//! - **[`topics`]**: the MCP topic grammar
//! - **[`transport`]**: the injected MQTT transport seam, with a rumqttc
//!   implementation and a broker-less in-memory one
//! - **[`error`]**: error handling at the embedder-facing seams
//!
//! # Protocol Flow
//!
//! ```text
//! Client                                    Server
//!   |                                          |
//!   |          $mcp-server/{id}/{name}         |
//!   |-- initialize --------------------------->|
//!   |                                          | subscribe RPC + presence
//!   |        $mcp-rpc/{client}/{id}/{name}     |
//!   |<-------------------- initialize result --|
//!   |-- notifications/initialized ------------>|
//!   |                                          |
//!   |-- tools/list --------------------------->|
//!   |<------------------------- tools list ----|
//!   |-- tools/call --------------------------->|
//!   |<------------------------- tool result ---|
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use mcp_mqtt_server::protocol::{ServerCapabilities, ServerInfo, Tool, ToolCallResult};
//! use mcp_mqtt_server::server::{McpServer, ServerConfig};
//! use mcp_mqtt_server::transport::InMemoryTransport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = McpServer::new();
//! server.configure(
//!     ServerInfo { name: "calculator".into(), version: "1.0.0".into() },
//!     ServerCapabilities::default(),
//! );
//! server.register_tool(Tool::new("add", "Add two numbers"), |args| {
//!     let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
//!     let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
//!     ToolCallResult::success((a + b).to_string())
//! });
//!
//! // Any MqttTransport works; production embedders use RumqttcTransport.
//! let transport = Arc::new(InMemoryTransport::new("mqtt-client-1"));
//! let config = ServerConfig {
//!     server_id: "srv-1".into(),
//!     server_name: "demo/calculator".into(),
//! };
//! assert!(server.start(transport, config).await);
//! # Ok(())
//! # }
//! ```
//!
//! The server never initiates connections and keeps no state across process
//! restarts. The MQTT connection itself (auth, TLS, keepalive, reconnect,
//! Last Will installation) stays with the embedder.

pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tools;
pub mod topics;
pub mod transport;

#[cfg(test)]
mod integration_tests;

pub use error::{Error, Result};
pub use protocol::{ServerCapabilities, ServerInfo, Tool, ToolCallResult};
pub use server::{McpServer, ServerConfig};
pub use transport::MqttTransport;

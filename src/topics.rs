//! MCP topic grammar
//!
//! All MCP traffic lives under three reserved prefixes; everything else on a
//! shared transport belongs to the embedder and is never touched.
//!
//! | Role | Topic | Retained |
//! |---|---|---|
//! | Server control (initialize target) | `$mcp-server/{serverId}/{serverName}` | no |
//! | Server presence | `$mcp-server/presence/{serverId}/{serverName}` | yes |
//! | Per-client RPC (bidirectional) | `$mcp-rpc/{mcpClientId}/{serverId}/{serverName}` | no |
//! | Client presence | `$mcp-client/presence/{mcpClientId}` | by client LWT |

pub const SERVER_PREFIX: &str = "$mcp-server/";
pub const CLIENT_PREFIX: &str = "$mcp-client/";
pub const RPC_PREFIX: &str = "$mcp-rpc/";
pub const CLIENT_PRESENCE_PREFIX: &str = "$mcp-client/presence/";

/// True when a topic falls under one of the reserved MCP prefixes
pub fn is_mcp_topic(topic: &str) -> bool {
    topic.starts_with(SERVER_PREFIX)
        || topic.starts_with(CLIENT_PREFIX)
        || topic.starts_with(RPC_PREFIX)
}

/// Control topic clients publish `initialize` requests to
pub fn control_topic(server_id: &str, server_name: &str) -> String {
    format!("{SERVER_PREFIX}{server_id}/{server_name}")
}

/// Retained presence topic for a server instance
pub fn server_presence_topic(server_id: &str, server_name: &str) -> String {
    format!("{SERVER_PREFIX}presence/{server_id}/{server_name}")
}

/// Bidirectional RPC topic for one client session
pub fn rpc_topic(mcp_client_id: &str, server_id: &str, server_name: &str) -> String {
    format!("{RPC_PREFIX}{mcp_client_id}/{server_id}/{server_name}")
}

/// Presence topic a client sets its LWT on
pub fn client_presence_topic(mcp_client_id: &str) -> String {
    format!("{CLIENT_PRESENCE_PREFIX}{mcp_client_id}")
}

/// Extract the client id from an RPC topic: the segment between the prefix
/// and the next `/`. Empty segments are rejected.
pub fn client_id_from_rpc_topic(topic: &str) -> Option<&str> {
    let rest = topic.strip_prefix(RPC_PREFIX)?;
    let client_id = rest.split('/').next()?;
    if client_id.is_empty() {
        return None;
    }
    Some(client_id)
}

/// Extract the client id from a client presence topic
pub fn client_id_from_presence_topic(topic: &str) -> Option<&str> {
    let client_id = topic.strip_prefix(CLIENT_PRESENCE_PREFIX)?;
    if client_id.is_empty() {
        return None;
    }
    Some(client_id)
}

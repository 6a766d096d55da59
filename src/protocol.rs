//! JSON-RPC 2.0 message types and MCP wire definitions
//!
//! This module provides the JSON-RPC 2.0 envelope used on every MCP topic,
//! plus the MCP-specific data model (server info, capabilities, tools and
//! tool results), compliant with MCP 2024-11-05.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// MCP protocol version supported by this implementation
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC protocol version carried in every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names dispatched by the server
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";

    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFICATION_DISCONNECTED: &str = "notifications/disconnected";
    pub const NOTIFICATION_SERVER_ONLINE: &str = "notifications/server/online";
}

/// Standard JSON-RPC error codes
pub mod error_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request - The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found - The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s)
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// MQTT 5.0 user property keys and values used on MCP topics
pub mod user_properties {
    pub const COMPONENT_TYPE: &str = "MCP-COMPONENT-TYPE";
    pub const MQTT_CLIENT_ID: &str = "MCP-MQTT-CLIENT-ID";
    pub const META: &str = "MCP-META";
    pub const SERVER_NAME: &str = "MCP-SERVER-NAME";

    pub const COMPONENT_TYPE_SERVER: &str = "mcp-server";
    pub const COMPONENT_TYPE_CLIENT: &str = "mcp-client";
}

/// Default request timeouts in milliseconds, advertised for client SDKs.
/// The server itself never times handlers out.
pub mod timeouts {
    pub const INITIALIZE_MS: u64 = 30_000;
    pub const PING_MS: u64 = 10_000;
    pub const TOOLS_LIST_MS: u64 = 30_000;
    pub const TOOLS_CALL_MS: u64 = 60_000;
}

/// JSON-RPC 2.0 request message
///
/// A request without an `id` (or with a `null` id) is a notification and
/// expects no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new request with a generated string id
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self::new_with_id(Value::String(Uuid::new_v4().to_string()), method, params)
    }

    /// Create a new request with a specific id
    pub fn new_with_id(id: Value, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    /// Parse a JSON value as a request, enforcing the `jsonrpc: "2.0"` marker
    /// and a string `method`. Returns `None` for anything else.
    ///
    /// An id outside the addressable types (string, integer, null) collapses
    /// to `null`, as if absent; it is never echoed back.
    pub fn from_value(value: &Value) -> Option<Self> {
        let mut request: JsonRpcRequest = serde_json::from_value(value.clone()).ok()?;
        if request.jsonrpc != JSONRPC_VERSION {
            return None;
        }
        if let Some(id) = &request.id {
            if !is_addressable_id(id) {
                request.id = Some(Value::Null);
            }
        }
        Some(request)
    }

    /// True when the request carries no usable id (absent or `null`)
    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }

    /// The id to echo in a response (`null` when the request had none)
    pub fn response_id(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }
}

/// JSON-RPC 2.0 response message; carries exactly one of `result` / `error`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a successful response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 notification message (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

fn is_addressable_id(id: &Value) -> bool {
    match id {
        Value::Null | Value::String(_) => true,
        Value::Number(n) => n.is_i64() || n.is_u64(),
        _ => false,
    }
}

/// Recover a usable response id from an arbitrary JSON payload.
///
/// Only string and integer ids are addressable; anything else means the
/// sender cannot be answered and the payload is dropped.
pub fn recoverable_id(value: &Value) -> Option<Value> {
    match value.get("id") {
        Some(id @ Value::String(_)) => Some(id.clone()),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => {
            Some(Value::Number(n.clone()))
        }
        _ => None,
    }
}

/// Server identity advertised in the initialize response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Client identity taken from the initialize request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Feature groups the server advertises during initialization.
///
/// Only the `tools` group is supported; `tools_list_changed` marks the
/// optional `notifications/tools/list_changed` capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub tools: bool,
    pub tools_list_changed: bool,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            tools: true,
            tools_list_changed: false,
        }
    }
}

impl ServerCapabilities {
    /// Wire form: `{"tools": {}}`, with `listChanged` inside when enabled
    pub fn to_json(&self) -> Value {
        let mut capabilities = serde_json::json!({});
        if self.tools {
            capabilities["tools"] = serde_json::json!({});
            if self.tools_list_changed {
                capabilities["tools"]["listChanged"] = Value::Bool(true);
            }
        }
        capabilities
    }
}

/// JSON-Schema-shaped description of a tool's arguments object.
///
/// The server advertises the schema verbatim and does not validate calls
/// against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default, skip_serializing_if = "properties_is_empty")]
    pub properties: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

// Both null and an explicit empty object stay off the wire.
fn properties_is_empty(value: &Value) -> bool {
    value.is_null() || value.as_object().is_some_and(|map| map.is_empty())
}

impl Default for ToolInputSchema {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: Value::Null,
            required: Vec::new(),
        }
    }
}

/// A named, described, schema-carrying function invokable via `tools/call`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub input_schema: ToolInputSchema,
}

impl Tool {
    /// Create a tool with an empty `object` input schema
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: ToolInputSchema::default(),
        }
    }

    /// Attach schema properties and required field names
    pub fn with_schema(mut self, properties: Value, required: &[&str]) -> Self {
        self.input_schema.properties = properties;
        self.input_schema.required = required.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// One typed part of a tool result; only text parts are produced here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

/// Outcome of a tool invocation.
///
/// `is_error` marks a tool-level failure: the handler ran and decided to
/// report failure. This is distinct from a JSON-RPC error, which means the
/// request itself was malformed or the server broke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ToolCallResult {
    /// A successful result with a single text part
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
        }
    }

    /// A tool-level failure with a single text part
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: true,
        }
    }
}

/// Params of the retained `notifications/server/online` presence message
#[derive(Debug, Clone, Default)]
pub struct ServerOnlineParams {
    pub description: String,
    pub meta: Option<Value>,
}

impl ServerOnlineParams {
    pub fn to_json(&self) -> Value {
        let mut params = serde_json::json!({ "description": self.description });
        if let Some(meta) = &self.meta {
            params["meta"] = meta.clone();
        }
        params
    }
}

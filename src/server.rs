//! The MCP server engine
//!
//! Owns the topic contract with the broker, the per-client session lifecycle
//! and the bidirectional JSON-RPC dispatch. The engine borrows a transport
//! for the duration of one `start … stop` cycle; everything it receives on
//! non-MCP topics is left untouched for the embedder.
//!
//! Lifecycle of one client:
//!
//! 1. client publishes `initialize` on the shared control topic;
//! 2. the engine subscribes to that client's RPC and presence topics, then
//!    answers on the RPC topic;
//! 3. requests and notifications flow over the RPC topic until the client
//!    says goodbye, its LWT fires, or the server stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::protocol::{
    self, error_codes, methods, user_properties, ClientInfo, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ServerInfo, ServerOnlineParams, Tool,
    ToolCallResult, MCP_PROTOCOL_VERSION,
};
use crate::session::{ClientSession, SessionTable};
use crate::tools::ToolRegistry;
use crate::topics;
use crate::transport::{ConnectionLostHandler, IncomingMessage, MessageHandler, MqttTransport};

/// Fired after a client completes the initialize handshake
pub type ClientConnectedCallback = Arc<dyn Fn(&str, &ClientInfo) + Send + Sync>;

/// Fired after a client session is destroyed
pub type ClientDisconnectedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Identity of one running server instance
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Unique per instance; used in topics and as user-property client id
    pub server_id: String,
    /// Hierarchical name shared by replicas, e.g. `demo/calculator`
    pub server_name: String,
}

#[derive(Default)]
struct EngineState {
    server_info: ServerInfo,
    capabilities: ServerCapabilities,
    online: ServerOnlineParams,
    server_id: String,
    server_name: String,
    transport: Option<Arc<dyn MqttTransport>>,
}

struct Callbacks {
    connected: Mutex<Option<ClientConnectedCallback>>,
    disconnected: Mutex<Option<ClientDisconnectedCallback>>,
}

/// Snapshot taken before any publish so no lock is held across an await
#[derive(Clone)]
struct PublishContext {
    transport: Arc<dyn MqttTransport>,
    server_id: String,
    server_name: String,
}

/// MCP server over an injected MQTT transport.
///
/// Cheap to clone; clones share all state. Tool registration and the
/// configuration setters may be called from connected/disconnected callbacks,
/// but `start` and `stop` may not.
#[derive(Clone)]
pub struct McpServer {
    tools: ToolRegistry,
    sessions: SessionTable,
    state: Arc<Mutex<EngineState>>,
    running: Arc<AtomicBool>,
    callbacks: Arc<Callbacks>,
}

impl McpServer {
    pub fn new() -> Self {
        Self {
            tools: ToolRegistry::new(),
            sessions: SessionTable::new(),
            state: Arc::new(Mutex::new(EngineState::default())),
            running: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(Callbacks {
                connected: Mutex::new(None),
                disconnected: Mutex::new(None),
            }),
        }
    }

    /// Set the identity and capabilities advertised in initialize responses.
    /// Idempotent; call before `start`.
    pub fn configure(&self, server_info: ServerInfo, capabilities: ServerCapabilities) {
        let mut state = self.state.lock().unwrap();
        info!(
            "Server configured: name={}, version={}",
            server_info.name, server_info.version
        );
        state.server_info = server_info;
        state.capabilities = capabilities;
    }

    /// Set the description published in the retained online notification.
    /// Call before `start`.
    pub fn set_service_description(&self, description: impl Into<String>, meta: Option<Value>) {
        let mut state = self.state.lock().unwrap();
        state.online = ServerOnlineParams {
            description: description.into(),
            meta,
        };
    }

    /// Start serving on the given transport.
    ///
    /// Fails when already running or when the transport does not report
    /// connected. On success the control topic is subscribed and the retained
    /// presence is published. Configuring the broker LWT is the embedder's
    /// job; whatever will it installs must clear the retained presence.
    pub async fn start(&self, transport: Arc<dyn MqttTransport>, config: ServerConfig) -> bool {
        if self.running.load(Ordering::SeqCst) {
            warn!("Server already running, ignoring start()");
            return false;
        }
        if !transport.is_connected() {
            error!("MQTT transport is not connected");
            return false;
        }

        info!(
            "Starting MCP server: serverId={}, serverName={}",
            config.server_id, config.server_name
        );
        {
            let mut state = self.state.lock().unwrap();
            state.server_id = config.server_id.clone();
            state.server_name = config.server_name.clone();
            state.transport = Some(transport.clone());
        }

        let engine = self.clone();
        let handler: MessageHandler = Arc::new(move |message| {
            let engine = engine.clone();
            Box::pin(async move { engine.handle_incoming(message).await })
        });
        transport.set_message_handler(handler);

        let running = self.running.clone();
        let lost: ConnectionLostHandler = Arc::new(move |reason| {
            error!("MQTT connection lost: {}", reason);
            running.store(false, Ordering::SeqCst);
        });
        transport.set_connection_lost_handler(lost);

        let control_topic = topics::control_topic(&config.server_id, &config.server_name);
        if !transport.subscribe(&control_topic, 1, false).await {
            warn!("Control topic subscription failed: {}", control_topic);
        }
        debug!("Subscribed to control topic: {}", control_topic);

        self.publish_presence().await;

        self.running.store(true, Ordering::SeqCst);
        info!("MCP server started");
        true
    }

    /// Stop serving: notify every live session on its own channel, clear the
    /// retained presence, release all subscriptions and drop the transport.
    /// Idempotent.
    pub async fn stop(&self) {
        let ctx = {
            let mut state = self.state.lock().unwrap();
            match state.transport.take() {
                Some(transport) => PublishContext {
                    transport,
                    server_id: state.server_id.clone(),
                    server_name: state.server_name.clone(),
                },
                None => return,
            }
        };

        info!("Stopping MCP server...");

        // Clients learn of the teardown on their own channel before the
        // presence disappears.
        let client_ids = self.sessions.client_ids();
        for client_id in &client_ids {
            debug!("Sending disconnect notification to client: {}", client_id);
            let notification = JsonRpcNotification::new(methods::NOTIFICATION_DISCONNECTED, None);
            self.send_notification(&ctx, client_id, &notification).await;
        }

        let presence_topic = topics::server_presence_topic(&ctx.server_id, &ctx.server_name);
        if !ctx.transport.publish(&presence_topic, &[], 1, true, &[]).await {
            warn!("Failed to clear presence on topic: {}", presence_topic);
        }
        debug!("Cleared presence on topic: {}", presence_topic);

        let control_topic = topics::control_topic(&ctx.server_id, &ctx.server_name);
        ctx.transport.unsubscribe(&control_topic).await;
        for client_id in &client_ids {
            ctx.transport
                .unsubscribe(&topics::rpc_topic(client_id, &ctx.server_id, &ctx.server_name))
                .await;
            ctx.transport
                .unsubscribe(&topics::client_presence_topic(client_id))
                .await;
        }

        self.sessions.clear();
        self.running.store(false, Ordering::SeqCst);
        info!("MCP server stopped ({} session(s) dropped)", client_ids.len());
    }

    /// True between a successful `start` and `stop`, while the transport
    /// still reports connected
    pub fn is_running(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.state.lock().unwrap();
        state
            .transport
            .as_ref()
            .map(|transport| transport.is_connected())
            .unwrap_or(false)
    }

    /// Register a tool. Returns `false` when the name is already taken.
    pub fn register_tool<F>(&self, tool: Tool, handler: F) -> bool
    where
        F: Fn(&Value) -> ToolCallResult + Send + Sync + 'static,
    {
        let name = tool.name.clone();
        let ok = self.tools.register(tool, Arc::new(handler));
        if ok {
            info!("Tool registered: {}", name);
        } else {
            warn!("Failed to register tool (already exists?): {}", name);
        }
        ok
    }

    /// Remove a tool; unknown names are a no-op
    pub fn unregister_tool(&self, name: &str) {
        self.tools.unregister(name);
        info!("Tool unregistered: {}", name);
    }

    /// Snapshot of the registered tool declarations
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.list()
    }

    pub fn set_client_connected_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &ClientInfo) + Send + Sync + 'static,
    {
        *self.callbacks.connected.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_client_disconnected_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.callbacks.disconnected.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn server_id(&self) -> String {
        self.state.lock().unwrap().server_id.clone()
    }

    pub fn server_name(&self) -> String {
        self.state.lock().unwrap().server_name.clone()
    }

    /// MCP client ids with a live session
    pub fn connected_clients(&self) -> Vec<String> {
        self.sessions.client_ids()
    }

    // ---- internal ----------------------------------------------------

    fn context(&self) -> Option<PublishContext> {
        let state = self.state.lock().unwrap();
        let transport = state.transport.clone()?;
        Some(PublishContext {
            transport,
            server_id: state.server_id.clone(),
            server_name: state.server_name.clone(),
        })
    }

    fn server_user_properties(ctx: &PublishContext) -> Vec<(String, String)> {
        vec![
            (
                user_properties::COMPONENT_TYPE.to_string(),
                user_properties::COMPONENT_TYPE_SERVER.to_string(),
            ),
            (
                user_properties::MQTT_CLIENT_ID.to_string(),
                ctx.server_id.clone(),
            ),
        ]
    }

    async fn publish_presence(&self) {
        let Some(ctx) = self.context() else { return };
        let params = self.state.lock().unwrap().online.to_json();
        let notification =
            JsonRpcNotification::new(methods::NOTIFICATION_SERVER_ONLINE, Some(params));
        let topic = topics::server_presence_topic(&ctx.server_id, &ctx.server_name);
        let payload = match serde_json::to_vec(&notification) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode presence notification: {}", e);
                return;
            }
        };
        let props = Self::server_user_properties(&ctx);
        if !ctx.transport.publish(&topic, &payload, 1, true, &props).await {
            warn!("Failed to publish presence on topic: {}", topic);
        } else {
            debug!("Published presence on topic: {}", topic);
        }
    }

    async fn handle_incoming(&self, message: IncomingMessage) {
        // The transport is shared; everything outside the reserved prefixes
        // belongs to the embedder.
        if !topics::is_mcp_topic(&message.topic) {
            return;
        }
        let Some(ctx) = self.context() else {
            // Stopped (or never started): late deliveries are dropped.
            return;
        };
        debug!(
            "Received MQTT message: topic={}, qos={}, retained={}",
            message.topic, message.qos, message.retained
        );

        if message.topic.starts_with(topics::RPC_PREFIX) {
            self.handle_rpc_message(&ctx, &message).await;
        } else if message.topic == topics::control_topic(&ctx.server_id, &ctx.server_name) {
            self.handle_control_message(&ctx, &message).await;
        } else if message.topic.starts_with(topics::CLIENT_PRESENCE_PREFIX) {
            self.handle_client_presence(&ctx, &message).await;
        } else {
            debug!("Unhandled MCP topic: {}", message.topic);
        }
    }

    async fn handle_control_message(&self, ctx: &PublishContext, message: &IncomingMessage) {
        let value: Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to parse control message JSON: {}", e);
                return;
            }
        };
        let Some(request) = JsonRpcRequest::from_value(&value) else {
            warn!("Invalid JSON-RPC request on control topic");
            return;
        };

        let mut client_id = message
            .user_property(user_properties::MQTT_CLIENT_ID)
            .unwrap_or_default()
            .to_string();
        if client_id.is_empty() {
            // Fallback for transports that strip user properties.
            if let Some(id) = request
                .params
                .as_ref()
                .and_then(|params| params.get("mcpClientId"))
                .and_then(Value::as_str)
            {
                client_id = id.to_string();
            }
        }

        if request.method == methods::INITIALIZE && !client_id.is_empty() {
            self.handle_initialize(ctx, &client_id, &request).await;
        } else {
            // No response channel exists for anything else on this topic.
            warn!(
                "Unhandled control method={} or empty clientId",
                request.method
            );
        }
    }

    async fn handle_initialize(
        &self,
        ctx: &PublishContext,
        client_id: &str,
        request: &JsonRpcRequest,
    ) {
        info!("Initializing client session: {}", client_id);
        let params = request.params.as_ref();

        let protocol_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(MCP_PROTOCOL_VERSION)
            .to_string();
        let client_info = params
            .and_then(|p| p.get("clientInfo"))
            .map(|ci| ClientInfo {
                name: ci
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                version: ci
                    .get("version")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
            .unwrap_or_default();
        let capabilities = params
            .and_then(|p| p.get("capabilities"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        // Both client topics must be live before the response goes out,
        // or a fast client's first publishes race the subscriptions.
        let rpc_topic = topics::rpc_topic(client_id, &ctx.server_id, &ctx.server_name);
        if !ctx.transport.subscribe(&rpc_topic, 1, true).await {
            warn!("RPC topic subscription failed: {}", rpc_topic);
        }
        let presence_topic = topics::client_presence_topic(client_id);
        if !ctx.transport.subscribe(&presence_topic, 1, false).await {
            warn!("Client presence subscription failed: {}", presence_topic);
        }

        self.sessions.insert(ClientSession {
            mcp_client_id: client_id.to_string(),
            protocol_version,
            client_info,
            capabilities,
            initialized: false,
        });

        let result = {
            let state = self.state.lock().unwrap();
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": state.capabilities.to_json(),
                "serverInfo": {
                    "name": state.server_info.name,
                    "version": state.server_info.version,
                },
            })
        };
        let response = JsonRpcResponse::success(request.response_id(), result);
        self.send_response(ctx, client_id, &response).await;
        info!("Initialize response sent to client: {}", client_id);
    }

    async fn handle_rpc_message(&self, ctx: &PublishContext, message: &IncomingMessage) {
        let Some(client_id) = topics::client_id_from_rpc_topic(&message.topic) else {
            warn!("Failed to parse client ID from RPC topic: {}", message.topic);
            return;
        };
        let client_id = client_id.to_string();

        if message.payload.is_empty() {
            warn!("Empty payload on RPC topic: {}", message.topic);
            return;
        }
        let value: Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(e) => {
                // MQTT has no error channel for unaddressed garbage.
                warn!("Failed to parse RPC message from client={}: {}", client_id, e);
                return;
            }
        };

        // Notification: method present, id absent (or null).
        if value.get("method").is_some()
            && matches!(value.get("id"), None | Some(Value::Null))
        {
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.handle_rpc_notification(ctx, &client_id, &method).await;
            return;
        }

        let Some(request) = JsonRpcRequest::from_value(&value) else {
            if let Some(id) = protocol::recoverable_id(&value) {
                let response = JsonRpcResponse::error(
                    id,
                    JsonRpcError::new(error_codes::INVALID_REQUEST, "Invalid JSON-RPC request"),
                );
                self.send_response(ctx, &client_id, &response).await;
            }
            return;
        };

        debug!(
            "RPC request: method={}, client={}",
            request.method, client_id
        );
        match request.method.as_str() {
            methods::PING => {
                let response = JsonRpcResponse::success(request.response_id(), json!({}));
                self.send_response(ctx, &client_id, &response).await;
            }
            methods::TOOLS_LIST => self.handle_tools_list(ctx, &client_id, &request).await,
            methods::TOOLS_CALL => self.handle_tools_call(ctx, &client_id, &request).await,
            other => {
                warn!("Method not found: {}, client={}", other, client_id);
                let response = JsonRpcResponse::error(
                    request.response_id(),
                    JsonRpcError::new(
                        error_codes::METHOD_NOT_FOUND,
                        format!("Method not found: {other}"),
                    ),
                );
                self.send_response(ctx, &client_id, &response).await;
            }
        }
    }

    async fn handle_rpc_notification(&self, ctx: &PublishContext, client_id: &str, method: &str) {
        match method {
            methods::NOTIFICATION_INITIALIZED => match self.sessions.mark_initialized(client_id) {
                Some((true, client_info)) => {
                    info!(
                        "Client session initialized: {} ({} v{})",
                        client_id, client_info.name, client_info.version
                    );
                    let callback = self.callbacks.connected.lock().unwrap().clone();
                    if let Some(callback) = callback {
                        callback(client_id, &client_info);
                    }
                }
                Some((false, _)) => {
                    debug!("Duplicate initialized notification from client: {}", client_id);
                }
                None => {
                    warn!(
                        "Received initialized notification for unknown client: {}",
                        client_id
                    );
                }
            },
            methods::NOTIFICATION_DISCONNECTED => {
                info!("Client disconnected: {}", client_id);
                self.destroy_session(ctx, client_id).await;
            }
            other => {
                debug!("Ignoring unknown notification: {}", other);
            }
        }
    }

    async fn handle_tools_list(
        &self,
        ctx: &PublishContext,
        client_id: &str,
        request: &JsonRpcRequest,
    ) {
        let tools = self.tools.list();
        debug!(
            "Sending tools list ({} tools) to client: {}",
            tools.len(),
            client_id
        );
        let response = JsonRpcResponse::success(request.response_id(), json!({ "tools": tools }));
        self.send_response(ctx, client_id, &response).await;
    }

    async fn handle_tools_call(
        &self,
        ctx: &PublishContext,
        client_id: &str,
        request: &JsonRpcRequest,
    ) {
        let params = request.params.as_ref();
        let Some(name) = params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
        else {
            error!("Tool call missing 'name' parameter, client={}", client_id);
            let response = JsonRpcResponse::error(
                request.response_id(),
                JsonRpcError::new(error_codes::INVALID_PARAMS, "Missing 'name' parameter"),
            );
            self.send_response(ctx, client_id, &response).await;
            return;
        };
        let arguments = params
            .and_then(|p| p.get("arguments"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        info!("Tool call: tool={}, client={}", name, client_id);
        let result = self.tools.call(name, &arguments);
        if result.is_error {
            warn!("Tool call failed: tool={}, client={}", name, client_id);
        }

        // Tool-level failure rides inside the result, never as a JSON-RPC
        // error: the request itself was well-formed.
        let result_json = serde_json::to_value(&result).unwrap_or(Value::Null);
        let response = JsonRpcResponse::success(request.response_id(), result_json);
        self.send_response(ctx, client_id, &response).await;
    }

    async fn handle_client_presence(&self, ctx: &PublishContext, message: &IncomingMessage) {
        let Some(client_id) = topics::client_id_from_presence_topic(&message.topic) else {
            warn!(
                "Failed to parse client ID from presence topic: {}",
                message.topic
            );
            return;
        };
        let client_id = client_id.to_string();

        if message.payload.is_empty() {
            // The client cleared its own retained presence; any session is
            // already gone or was never created.
            debug!("Empty presence payload (client offline): {}", client_id);
            return;
        }
        let Ok(value) = serde_json::from_slice::<Value>(&message.payload) else {
            return;
        };
        if value.get("method").and_then(Value::as_str)
            == Some(methods::NOTIFICATION_DISCONNECTED)
        {
            info!("Client disconnected via presence: {}", client_id);
            self.destroy_session(ctx, &client_id).await;
        }
    }

    async fn destroy_session(&self, ctx: &PublishContext, client_id: &str) {
        let removed = self.sessions.remove(client_id);

        // Unsubscribe even with no session record, to be safe against
        // missed inserts.
        ctx.transport
            .unsubscribe(&topics::rpc_topic(client_id, &ctx.server_id, &ctx.server_name))
            .await;
        ctx.transport
            .unsubscribe(&topics::client_presence_topic(client_id))
            .await;

        if removed.is_some() {
            debug!("Removed client session: {}", client_id);
            let callback = self.callbacks.disconnected.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(client_id);
            }
        } else {
            debug!("Client session not found for cleanup: {}", client_id);
        }
    }

    async fn send_response(
        &self,
        ctx: &PublishContext,
        client_id: &str,
        response: &JsonRpcResponse,
    ) {
        let payload = match serde_json::to_vec(response) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode response for client={}: {}", client_id, e);
                return;
            }
        };
        self.publish_to_client(ctx, client_id, payload).await;
    }

    async fn send_notification(
        &self,
        ctx: &PublishContext,
        client_id: &str,
        notification: &JsonRpcNotification,
    ) {
        let payload = match serde_json::to_vec(notification) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "Failed to encode notification for client={}: {}",
                    client_id, e
                );
                return;
            }
        };
        self.publish_to_client(ctx, client_id, payload).await;
    }

    async fn publish_to_client(&self, ctx: &PublishContext, client_id: &str, payload: Vec<u8>) {
        let topic = topics::rpc_topic(client_id, &ctx.server_id, &ctx.server_name);
        let props = Self::server_user_properties(ctx);
        if !ctx.transport.publish(&topic, &payload, 1, false, &props).await {
            warn!("Failed to publish to client={} on topic: {}", client_id, topic);
        }
    }
}

impl Default for McpServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;

    fn config() -> ServerConfig {
        ServerConfig {
            server_id: "s1".to_string(),
            server_name: "demo/calc".to_string(),
        }
    }

    #[tokio::test]
    async fn start_fails_when_transport_disconnected() {
        let transport = Arc::new(InMemoryTransport::new("mqtt-1"));
        transport.set_connected(false);

        let server = McpServer::new();
        assert!(!server.start(transport, config()).await);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let transport = Arc::new(InMemoryTransport::new("mqtt-1"));
        let server = McpServer::new();
        assert!(server.start(transport.clone(), config()).await);
        assert!(!server.start(transport, config()).await);
        assert!(server.is_running());
    }

    #[tokio::test]
    async fn is_running_tracks_transport_connectivity() {
        let transport = Arc::new(InMemoryTransport::new("mqtt-1"));
        let server = McpServer::new();
        assert!(server.start(transport.clone(), config()).await);
        assert!(server.is_running());

        transport.simulate_connection_lost("keepalive timeout");
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn identity_accessors_reflect_start_config() {
        let transport = Arc::new(InMemoryTransport::new("mqtt-1"));
        let server = McpServer::new();
        server.start(transport, config()).await;
        assert_eq!(server.server_id(), "s1");
        assert_eq!(server.server_name(), "demo/calc");
        assert!(server.connected_clients().is_empty());
    }
}

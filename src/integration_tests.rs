//! Integration tests for the MCP-over-MQTT protocol engine
//!
//! These drive the full engine through an in-memory transport: initialize
//! handshake, tool discovery and invocation, presence discipline, and
//! session teardown via client LWT.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value};

    use crate::protocol::{ServerCapabilities, ServerInfo, Tool, ToolCallResult};
    use crate::server::{McpServer, ServerConfig};
    use crate::topics;
    use crate::transport::{InMemoryTransport, TransportEvent};

    const SERVER_ID: &str = "s1";
    const SERVER_NAME: &str = "demo/calc";
    const CLIENT_ID: &str = "c1";

    fn number_arg(args: &Value, key: &str) -> f64 {
        args.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    async fn started_server() -> (McpServer, Arc<InMemoryTransport>) {
        let transport = Arc::new(InMemoryTransport::new("mqtt-s1"));
        let server = McpServer::new();
        server.configure(
            ServerInfo {
                name: "demo-calc".to_string(),
                version: "1.0.0".to_string(),
            },
            ServerCapabilities::default(),
        );
        server.set_service_description("Calculator tools over MQTT", None);

        server.register_tool(
            Tool::new("add", "Add two numbers together")
                .with_schema(json!({"a": {"type": "number"}, "b": {"type": "number"}}), &["a", "b"]),
            |args| {
                ToolCallResult::success(format!(
                    "{:.6}",
                    number_arg(args, "a") + number_arg(args, "b")
                ))
            },
        );
        server.register_tool(
            Tool::new("divide", "Divide first number by second")
                .with_schema(json!({"a": {"type": "number"}, "b": {"type": "number"}}), &["a", "b"]),
            |args| {
                let divisor = number_arg(args, "b");
                if divisor == 0.0 {
                    return ToolCallResult::error("Division by zero");
                }
                ToolCallResult::success(format!("{:.6}", number_arg(args, "a") / divisor))
            },
        );

        let started = server
            .start(
                transport.clone(),
                ServerConfig {
                    server_id: SERVER_ID.to_string(),
                    server_name: SERVER_NAME.to_string(),
                },
            )
            .await;
        assert!(started);
        (server, transport)
    }

    fn control_topic() -> String {
        topics::control_topic(SERVER_ID, SERVER_NAME)
    }

    fn rpc_topic(client_id: &str) -> String {
        topics::rpc_topic(client_id, SERVER_ID, SERVER_NAME)
    }

    fn presence_topic() -> String {
        topics::server_presence_topic(SERVER_ID, SERVER_NAME)
    }

    async fn initialize_client(transport: &InMemoryTransport, client_id: &str) {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "clientInfo": {"name": "cli", "version": "0.1"},
                "capabilities": {}
            }
        });
        transport
            .deliver(
                &control_topic(),
                payload.to_string().as_bytes(),
                &[("MCP-MQTT-CLIENT-ID".to_string(), client_id.to_string())],
            )
            .await;
    }

    async fn send_rpc(transport: &InMemoryTransport, client_id: &str, payload: Value) {
        transport
            .deliver(&rpc_topic(client_id), payload.to_string().as_bytes(), &[])
            .await;
    }

    fn last_rpc_response(transport: &InMemoryTransport, client_id: &str) -> Value {
        transport
            .published_to(&rpc_topic(client_id))
            .last()
            .expect("no message published on RPC topic")
            .payload_json()
            .expect("RPC payload is not JSON")
    }

    fn subscribe_index(events: &[TransportEvent], topic: &str) -> usize {
        events
            .iter()
            .position(|event| {
                matches!(event, TransportEvent::Subscribe { topic: t, .. } if t == topic)
            })
            .unwrap_or_else(|| panic!("no subscribe recorded for {topic}"))
    }

    fn first_publish_index(events: &[TransportEvent], topic: &str) -> usize {
        events
            .iter()
            .position(|event| {
                matches!(event, TransportEvent::Publish(message) if message.topic == topic)
            })
            .unwrap_or_else(|| panic!("no publish recorded for {topic}"))
    }

    #[tokio::test]
    async fn initialize_creates_session_and_responds() {
        let (server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["jsonrpc"], json!("2.0"));
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"]["protocolVersion"], json!("2024-11-05"));
        assert_eq!(response["result"]["capabilities"], json!({"tools": {}}));
        assert_eq!(response["result"]["serverInfo"]["name"], json!("demo-calc"));
        assert_eq!(response["result"]["serverInfo"]["version"], json!("1.0.0"));

        // The server now holds exactly this client's two subscriptions.
        assert_eq!(
            transport.subscription_no_local(&rpc_topic(CLIENT_ID)),
            Some(true)
        );
        assert_eq!(
            transport.subscription_no_local(&topics::client_presence_topic(CLIENT_ID)),
            Some(false)
        );
        assert_eq!(server.connected_clients(), vec![CLIENT_ID.to_string()]);

        // Subscriptions completed before the response went out, so a fast
        // client's follow-up publishes cannot be dropped.
        let events = transport.events();
        let response_at = first_publish_index(&events, &rpc_topic(CLIENT_ID));
        assert!(subscribe_index(&events, &rpc_topic(CLIENT_ID)) < response_at);
        assert!(
            subscribe_index(&events, &topics::client_presence_topic(CLIENT_ID)) < response_at
        );
    }

    #[tokio::test]
    async fn initialize_falls_back_to_client_id_in_params() {
        let (server, transport) = started_server().await;
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "mcpClientId": "c9",
                "capabilities": {}
            }
        });
        // No user properties at all: the transport stripped them.
        transport
            .deliver(&control_topic(), payload.to_string().as_bytes(), &[])
            .await;

        assert_eq!(server.connected_clients(), vec!["c9".to_string()]);
        let response = last_rpc_response(&transport, "c9");
        assert_eq!(response["id"], json!(1));
    }

    #[tokio::test]
    async fn initialize_without_client_id_is_ignored() {
        let (server, transport) = started_server().await;
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2024-11-05"}
        });
        let before = transport.published().len();
        transport
            .deliver(&control_topic(), payload.to_string().as_bytes(), &[])
            .await;

        assert!(server.connected_clients().is_empty());
        assert_eq!(transport.published().len(), before);
    }

    #[tokio::test]
    async fn tools_list_returns_registered_tools() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        )
        .await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["id"], json!(2));
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);

        let names: Vec<&str> = tools
            .iter()
            .map(|tool| tool["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"add"));
        assert!(names.contains(&"divide"));

        let add = tools.iter().find(|t| t["name"] == json!("add")).unwrap();
        assert_eq!(add["inputSchema"]["type"], json!("object"));
        assert_eq!(add["inputSchema"]["required"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn tools_call_success() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "add", "arguments": {"a": 2, "b": 3}}
            }),
        )
        .await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["id"], json!(3));
        assert_eq!(
            response["result"]["content"],
            json!([{"type": "text", "text": "5.000000"}])
        );
        assert!(response["result"].get("isError").is_none());
        assert!(response.get("error").is_none());
    }

    #[tokio::test]
    async fn tool_level_error_rides_in_a_success_envelope() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": {"name": "divide", "arguments": {"a": 1, "b": 0}}
            }),
        )
        .await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["id"], json!(4));
        assert!(response.get("error").is_none());
        assert_eq!(response["result"]["isError"], json!(true));
        assert_eq!(
            response["result"]["content"][0]["text"],
            json!("Division by zero")
        );
    }

    #[tokio::test]
    async fn missing_tool_name_is_invalid_params() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({
                "jsonrpc": "2.0",
                "id": 6,
                "method": "tools/call",
                "params": {"arguments": {"a": 1}}
            }),
        )
        .await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["error"]["code"], json!(-32602));
        assert_eq!(response["id"], json!(6));
    }

    #[tokio::test]
    async fn unknown_method_gets_method_not_found() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({"jsonrpc": "2.0", "id": 5, "method": "foo/bar"}),
        )
        .await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["error"]["code"], json!(-32601));
        assert_eq!(response["id"], json!(5));
        assert!(response.get("result").is_none());
    }

    #[tokio::test]
    async fn ping_answers_with_empty_object() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({"jsonrpc": "2.0", "id": "ping-1", "method": "ping"}),
        )
        .await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["id"], json!("ping-1"));
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn string_request_ids_are_echoed_verbatim() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({"jsonrpc": "2.0", "id": "abc-123", "method": "tools/list"}),
        )
        .await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["id"], json!("abc-123"));
    }

    #[tokio::test]
    async fn tools_work_before_initialized_notification() {
        // A client whose notifications/initialized got lost must not
        // deadlock; tools/* is intentionally not gated on the flag.
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "add", "arguments": {"a": 1, "b": 1}}
            }),
        )
        .await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["result"]["content"][0]["text"], json!("2.000000"));
    }

    #[tokio::test]
    async fn connected_callback_fires_once_per_session() {
        let (server, transport) = started_server().await;
        let connected = Arc::new(Mutex::new(Vec::new()));
        let sink = connected.clone();
        server.set_client_connected_callback(move |client_id, info| {
            sink.lock()
                .unwrap()
                .push((client_id.to_string(), info.name.clone()));
        });

        initialize_client(&transport, CLIENT_ID).await;
        let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        send_rpc(&transport, CLIENT_ID, initialized.clone()).await;
        send_rpc(&transport, CLIENT_ID, initialized.clone()).await;
        assert_eq!(
            connected.lock().unwrap().as_slice(),
            &[(CLIENT_ID.to_string(), "cli".to_string())]
        );

        // Re-initialize: the client restarted, a fresh session may fire again.
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(&transport, CLIENT_ID, initialized).await;
        assert_eq!(connected.lock().unwrap().len(), 2);
        assert_eq!(server.connected_clients().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_notification_destroys_session() {
        let (server, transport) = started_server().await;
        let disconnected = Arc::new(Mutex::new(Vec::new()));
        let sink = disconnected.clone();
        server.set_client_disconnected_callback(move |client_id| {
            sink.lock().unwrap().push(client_id.to_string());
        });

        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({"jsonrpc": "2.0", "method": "notifications/disconnected"}),
        )
        .await;

        assert!(server.connected_clients().is_empty());
        assert!(!transport.is_subscribed(&rpc_topic(CLIENT_ID)));
        assert!(!transport.is_subscribed(&topics::client_presence_topic(CLIENT_ID)));
        assert_eq!(disconnected.lock().unwrap().as_slice(), &[CLIENT_ID.to_string()]);
    }

    #[tokio::test]
    async fn client_lwt_destroys_session() {
        let (server, transport) = started_server().await;
        let disconnected = Arc::new(Mutex::new(Vec::new()));
        let sink = disconnected.clone();
        server.set_client_disconnected_callback(move |client_id| {
            sink.lock().unwrap().push(client_id.to_string());
        });

        initialize_client(&transport, CLIENT_ID).await;

        // The broker delivers the client's will on its presence topic.
        let lwt = json!({"jsonrpc": "2.0", "method": "notifications/disconnected"});
        transport
            .deliver(
                &topics::client_presence_topic(CLIENT_ID),
                lwt.to_string().as_bytes(),
                &[],
            )
            .await;

        assert!(server.connected_clients().is_empty());
        assert!(!transport.is_subscribed(&rpc_topic(CLIENT_ID)));
        assert!(!transport.is_subscribed(&topics::client_presence_topic(CLIENT_ID)));
        assert_eq!(disconnected.lock().unwrap().as_slice(), &[CLIENT_ID.to_string()]);
    }

    #[tokio::test]
    async fn empty_client_presence_is_informational() {
        let (server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;

        let before = transport.published().len();
        transport
            .deliver(&topics::client_presence_topic(CLIENT_ID), b"", &[])
            .await;

        // Session intact, nothing published.
        assert_eq!(server.connected_clients(), vec![CLIENT_ID.to_string()]);
        assert_eq!(transport.published().len(), before);
    }

    #[tokio::test]
    async fn presence_is_retained_while_running_and_cleared_on_stop() {
        let (server, transport) = started_server().await;

        let retained = transport.retained(&presence_topic()).expect("no presence");
        let online: Value = serde_json::from_slice(&retained).unwrap();
        assert_eq!(online["method"], json!("notifications/server/online"));
        assert_eq!(
            online["params"]["description"],
            json!("Calculator tools over MQTT")
        );

        server.stop().await;
        assert_eq!(transport.retained(&presence_topic()), None);

        let last_presence = transport.published_to(&presence_topic());
        let last = last_presence.last().unwrap();
        assert!(last.retained);
        assert!(last.payload.is_empty());
    }

    #[tokio::test]
    async fn stop_notifies_clients_then_clears_presence_and_unsubscribes() {
        let (server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;

        server.stop().await;

        let events = transport.events();
        let rpc = rpc_topic(CLIENT_ID);
        let goodbye_at = events
            .iter()
            .position(|event| match event {
                TransportEvent::Publish(message) if message.topic == rpc => message
                    .payload_json()
                    .map(|v| v["method"] == json!("notifications/disconnected"))
                    .unwrap_or(false),
                _ => false,
            })
            .expect("no disconnect notification sent");
        let presence_cleared_at = events
            .iter()
            .position(|event| match event {
                TransportEvent::Publish(message) => {
                    message.topic == presence_topic() && message.payload.is_empty()
                }
                _ => false,
            })
            .expect("presence never cleared");
        assert!(goodbye_at < presence_cleared_at);

        assert!(!transport.is_subscribed(&control_topic()));
        assert!(!transport.is_subscribed(&rpc));
        assert!(!transport.is_subscribed(&topics::client_presence_topic(CLIENT_ID)));
        assert!(server.connected_clients().is_empty());
        assert!(!server.is_running());

        // Idempotent: a second stop touches nothing.
        let events_before = transport.events().len();
        server.stop().await;
        assert_eq!(transport.events().len(), events_before);
    }

    #[tokio::test]
    async fn server_publishes_carry_identifying_user_properties() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
        )
        .await;

        let published = transport.published_to(&rpc_topic(CLIENT_ID));
        assert!(!published.is_empty());
        for message in published {
            assert!(message
                .user_properties
                .contains(&("MCP-COMPONENT-TYPE".to_string(), "mcp-server".to_string())));
            assert!(message
                .user_properties
                .contains(&("MCP-MQTT-CLIENT-ID".to_string(), SERVER_ID.to_string())));
        }
    }

    #[tokio::test]
    async fn non_mcp_topics_are_left_alone() {
        let (server, transport) = started_server().await;
        let before = transport.published().len();

        transport
            .deliver("sensors/temp", br#"{"value": 21.5}"#, &[])
            .await;

        assert_eq!(transport.published().len(), before);
        assert!(server.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn unparseable_rpc_payload_is_dropped_silently() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;

        let before = transport.published().len();
        transport
            .deliver(&rpc_topic(CLIENT_ID), b"{not json", &[])
            .await;
        transport.deliver(&rpc_topic(CLIENT_ID), b"", &[]).await;

        assert_eq!(transport.published().len(), before);
    }

    #[tokio::test]
    async fn invalid_request_with_recoverable_id_gets_invalid_request() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;

        // No jsonrpc marker, but the id is addressable.
        send_rpc(&transport, CLIENT_ID, json!({"id": 7, "method": "ping"})).await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["error"]["code"], json!(-32600));
        assert_eq!(response["id"], json!(7));
    }

    #[tokio::test]
    async fn unknown_notifications_are_accepted_and_ignored() {
        let (server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;

        let before = transport.published().len();
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"done": 1}}),
        )
        .await;

        assert_eq!(transport.published().len(), before);
        assert_eq!(server.connected_clients(), vec![CLIENT_ID.to_string()]);
    }

    #[tokio::test]
    async fn unregistered_tool_reports_not_found_result() {
        let (_server, transport) = started_server().await;
        initialize_client(&transport, CLIENT_ID).await;
        send_rpc(
            &transport,
            CLIENT_ID,
            json!({
                "jsonrpc": "2.0",
                "id": 8,
                "method": "tools/call",
                "params": {"name": "nope"}
            }),
        )
        .await;

        let response = last_rpc_response(&transport, CLIENT_ID);
        assert_eq!(response["result"]["isError"], json!(true));
        assert_eq!(
            response["result"]["content"][0]["text"],
            json!("Tool not found: nope")
        );
    }
}

//! Demo MCP server exposing calculator tools over an MQTT broker

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mcp_mqtt_server::protocol::{ServerCapabilities, ServerInfo, Tool, ToolCallResult};
use mcp_mqtt_server::server::{McpServer, ServerConfig};
use mcp_mqtt_server::transport::{MqttSettings, MqttWill, RumqttcTransport};

#[derive(Parser)]
#[command(name = "mcp-mqtt-server")]
#[command(about = "A demo MCP server exposing calculator tools over MQTT")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    broker_port: u16,

    /// Unique server instance id (generated when omitted)
    #[arg(long)]
    server_id: Option<String>,

    /// Hierarchical server name shared by replicas
    #[arg(long, default_value = "demo/calculator")]
    server_name: String,

    /// Broker username
    #[arg(long)]
    username: Option<String>,

    /// Broker password
    #[arg(long)]
    password: Option<String>,

    /// Log filter
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn number_arg(args: &Value, key: &str) -> f64 {
    args.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn calculator_tool(name: &str, description: &str) -> Tool {
    Tool::new(name, description).with_schema(
        json!({
            "a": {"type": "number", "description": "First operand"},
            "b": {"type": "number", "description": "Second operand"},
        }),
        &["a", "b"],
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    let server_id = args
        .server_id
        .clone()
        .unwrap_or_else(|| format!("demo-server-{}", Uuid::new_v4()));

    info!("Broker: {}:{}", args.broker_host, args.broker_port);
    info!("Server ID: {}", server_id);
    info!("Server Name: {}", args.server_name);

    // The will clears the retained presence if this process dies without a
    // clean stop, so clients see the server disappear.
    let settings = MqttSettings {
        host: args.broker_host.clone(),
        port: args.broker_port,
        client_id: server_id.clone(),
        username: args.username.clone(),
        password: args.password.clone(),
        will: Some(MqttWill::presence_clear(&server_id, &args.server_name)),
        ..MqttSettings::default()
    };
    let transport = Arc::new(RumqttcTransport::connect(settings)?);
    if !transport.wait_connected(Duration::from_secs(10)).await {
        bail!("timed out waiting for MQTT broker connection");
    }
    info!("Connected to MQTT broker");

    let server = McpServer::new();
    server.configure(
        ServerInfo {
            name: "DemoCalculatorServer".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        ServerCapabilities::default(),
    );
    server.set_service_description(
        "A demo MCP server providing calculator tools (add, subtract, multiply, divide).",
        None,
    );

    server.register_tool(
        calculator_tool("add", "Add two numbers together"),
        |args| {
            ToolCallResult::success(format!(
                "{:.6}",
                number_arg(args, "a") + number_arg(args, "b")
            ))
        },
    );
    server.register_tool(
        calculator_tool("subtract", "Subtract second number from first"),
        |args| {
            ToolCallResult::success(format!(
                "{:.6}",
                number_arg(args, "a") - number_arg(args, "b")
            ))
        },
    );
    server.register_tool(
        calculator_tool("multiply", "Multiply two numbers"),
        |args| {
            ToolCallResult::success(format!(
                "{:.6}",
                number_arg(args, "a") * number_arg(args, "b")
            ))
        },
    );
    server.register_tool(
        calculator_tool("divide", "Divide first number by second"),
        |args| {
            let divisor = number_arg(args, "b");
            if divisor == 0.0 {
                return ToolCallResult::error("Division by zero");
            }
            ToolCallResult::success(format!("{:.6}", number_arg(args, "a") / divisor))
        },
    );

    server.set_client_connected_callback(|client_id, client_info| {
        info!(
            "Client connected: {} ({} v{})",
            client_id, client_info.name, client_info.version
        );
    });
    server.set_client_disconnected_callback(|client_id| {
        info!("Client disconnected: {}", client_id);
    });

    let config = ServerConfig {
        server_id,
        server_name: args.server_name.clone(),
    };
    if !server.start(transport.clone(), config).await {
        bail!("failed to start MCP server");
    }
    info!("MCP server running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down...");

    server.stop().await;
    transport.disconnect().await;
    Ok(())
}

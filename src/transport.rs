//! Transport layer for MCP-over-MQTT communication
//!
//! The engine depends on a narrow duplex MQTT 5.0 capability set and never
//! owns the connection: connect, reconnect, TLS, broker auth and keepalive
//! stay with the embedder. Two implementations ship here:
//!
//! - [`RumqttcTransport`]: production transport on rumqttc's MQTT 5 client
//! - [`InMemoryTransport`]: broker-less transport for tests and local use
//!
//! A transport must hand *every* inbound message to the registered handler,
//! including retained messages received on subscribe; the engine filters MCP
//! topics itself, so the same connection can carry unrelated traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rumqttc::v5::mqttbytes::v5::{Filter, LastWill, Packet, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::topics;

/// One inbound MQTT message as delivered to the engine
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
    pub user_properties: Vec<(String, String)>,
}

impl IncomingMessage {
    /// Look up an MQTT 5.0 user property by key
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Single inbound sink registered by the engine.
///
/// A transport that awaits the returned future before delivering the next
/// message preserves the broker's per-client publish order.
pub type MessageHandler = Arc<dyn Fn(IncomingMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked with a reason string when the broker connection drops
pub type ConnectionLostHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Abstract duplex MQTT 5.0 channel the engine drives.
///
/// `subscribe` must honor the No-Local option: the engine relies on it to
/// suppress its own outbound RPC messages from being re-delivered. Publish
/// and subscribe report failure as `false`; retrying is the transport's
/// concern, never the engine's.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Snapshot connectivity query; not authoritative for ordering
    fn is_connected(&self) -> bool;

    /// MQTT client id of the underlying connection
    fn client_id(&self) -> String;

    async fn subscribe(&self, topic: &str, qos: u8, no_local: bool) -> bool;

    async fn unsubscribe(&self, topic: &str) -> bool;

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
        user_properties: &[(String, String)],
    ) -> bool;

    /// Register the single inbound sink
    fn set_message_handler(&self, handler: MessageHandler);

    fn set_connection_lost_handler(&self, handler: ConnectionLostHandler);
}

/// Last-Will message registered with the broker at connect time.
///
/// The engine never configures the will itself; the embedder installs one
/// that clears the retained server presence when the connection dies.
#[derive(Debug, Clone)]
pub struct MqttWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl MqttWill {
    /// The will every MCP server embedder wants: an empty retained payload
    /// on the server presence topic, so subscribers see the server vanish.
    pub fn presence_clear(server_id: &str, server_name: &str) -> Self {
        Self {
            topic: topics::server_presence_topic(server_id, server_name),
            payload: Vec::new(),
            qos: 1,
            retain: true,
        }
    }
}

/// Connection settings for [`RumqttcTransport`]
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_start: bool,
    pub will: Option<MqttWill>,
    pub channel_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            clean_start: true,
            will: None,
            channel_capacity: 16,
        }
    }
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn from_qos(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// MQTT 5.0 transport on top of rumqttc's async client.
///
/// The event loop runs in a background task for the life of the process;
/// rumqttc reconnects on the next poll after an error, so a connection drop
/// flips [`MqttTransport::is_connected`] until the next CONNACK.
pub struct RumqttcTransport {
    client: AsyncClient,
    client_id: String,
    connected: Arc<AtomicBool>,
    handler: Arc<Mutex<Option<MessageHandler>>>,
    connection_lost: Arc<Mutex<Option<ConnectionLostHandler>>>,
}

impl RumqttcTransport {
    /// Create the client and spawn its event loop. The connection is
    /// established in the background; use [`Self::wait_connected`] before
    /// starting a server on it.
    pub fn connect(settings: MqttSettings) -> Result<Self> {
        if settings.client_id.is_empty() {
            return Err(Error::configuration("MQTT client id must not be empty"));
        }
        if settings.host.is_empty() {
            return Err(Error::configuration("MQTT broker host must not be empty"));
        }

        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_start(settings.clean_start);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        if let Some(will) = &settings.will {
            options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                to_qos(will.qos),
                will.retain,
                None,
            ));
        }

        let (client, event_loop) = AsyncClient::new(options, settings.channel_capacity);
        let connected = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(Mutex::new(None));
        let connection_lost = Arc::new(Mutex::new(None));

        spawn_event_loop(
            event_loop,
            connected.clone(),
            handler.clone(),
            connection_lost.clone(),
        );

        Ok(Self {
            client,
            client_id: settings.client_id,
            connected,
            handler,
            connection_lost,
        })
    }

    /// Wait until the broker has acknowledged the connection
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.connected.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.connected.load(Ordering::SeqCst)
    }

    /// Cleanly disconnect from the broker (the will is not triggered)
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("MQTT disconnect failed: {:?}", e);
        }
    }
}

fn spawn_event_loop(
    mut event_loop: EventLoop,
    connected: Arc<AtomicBool>,
    handler: Arc<Mutex<Option<MessageHandler>>>,
    connection_lost: Arc<Mutex<Option<ConnectionLostHandler>>>,
) {
    tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    debug!("MQTT connection acknowledged");
                    connected.store(true, Ordering::SeqCst);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let handler = handler.lock().unwrap().clone();
                    if let Some(handler) = handler {
                        let message = IncomingMessage {
                            topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                            payload: publish.payload.to_vec(),
                            qos: from_qos(publish.qos),
                            retained: publish.retain,
                            user_properties: publish
                                .properties
                                .as_ref()
                                .map(|p| p.user_properties.clone())
                                .unwrap_or_default(),
                        };
                        // Awaited, not spawned: deliveries stay in broker order.
                        handler(message).await;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect(_))) => {
                    connected.store(false, Ordering::SeqCst);
                    notify_connection_lost(&connection_lost, "broker sent DISCONNECT");
                }
                Ok(_) => {}
                Err(e) => {
                    if connected.swap(false, Ordering::SeqCst) {
                        error!("MQTT event loop error: {:?}", e);
                        notify_connection_lost(&connection_lost, &format!("{e:?}"));
                    }
                    // rumqttc reconnects on the next poll; don't spin.
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });
}

fn notify_connection_lost(
    connection_lost: &Arc<Mutex<Option<ConnectionLostHandler>>>,
    reason: &str,
) {
    let callback = connection_lost.lock().unwrap().clone();
    if let Some(callback) = callback {
        callback(reason.to_string());
    }
}

#[async_trait]
impl MqttTransport for RumqttcTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    async fn subscribe(&self, topic: &str, qos: u8, no_local: bool) -> bool {
        let mut filter = Filter::new(topic, to_qos(qos));
        filter.nolocal = no_local;
        match self.client.subscribe_many([filter]).await {
            Ok(()) => true,
            Err(e) => {
                error!("MQTT subscribe failed for {}: {:?}", topic, e);
                false
            }
        }
    }

    async fn unsubscribe(&self, topic: &str) -> bool {
        match self.client.unsubscribe(topic).await {
            Ok(()) => true,
            Err(e) => {
                error!("MQTT unsubscribe failed for {}: {:?}", topic, e);
                false
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
        user_properties: &[(String, String)],
    ) -> bool {
        let properties = PublishProperties {
            user_properties: user_properties.to_vec(),
            ..Default::default()
        };
        match self
            .client
            .publish_with_properties(topic, to_qos(qos), retain, payload.to_vec(), properties)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("MQTT publish failed for {}: {:?}", topic, e);
                false
            }
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn set_connection_lost_handler(&self, handler: ConnectionLostHandler) {
        *self.connection_lost.lock().unwrap() = Some(handler);
    }
}

/// One publish recorded by [`InMemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
    pub user_properties: Vec<(String, String)>,
}

impl PublishedMessage {
    /// Decode the payload as JSON (test convenience)
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Everything an [`InMemoryTransport`] observed, in order
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Subscribe {
        topic: String,
        qos: u8,
        no_local: bool,
    },
    Unsubscribe {
        topic: String,
    },
    Publish(PublishedMessage),
}

#[derive(Default)]
struct InMemoryState {
    events: Vec<TransportEvent>,
    subscriptions: HashMap<String, bool>,
    retained: HashMap<String, Vec<u8>>,
}

/// Broker-less transport for tests and local embedding.
///
/// Records every subscribe/unsubscribe/publish in order, tracks the retained
/// payload per topic, and lets the caller inject inbound traffic with
/// [`Self::deliver`]. It does not loop publishes back to subscriptions; a
/// retained payload is re-delivered on subscribe, as a broker would.
pub struct InMemoryTransport {
    client_id: String,
    connected: AtomicBool,
    state: Mutex<InMemoryState>,
    handler: Mutex<Option<MessageHandler>>,
    connection_lost: Mutex<Option<ConnectionLostHandler>>,
}

impl InMemoryTransport {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            connected: AtomicBool::new(true),
            state: Mutex::new(InMemoryState::default()),
            handler: Mutex::new(None),
            connection_lost: Mutex::new(None),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Inject an inbound message, as if published by a peer (QoS 1)
    pub async fn deliver(&self, topic: &str, payload: &[u8], user_properties: &[(String, String)]) {
        let handler = self.handler.lock().unwrap().clone();
        let Some(handler) = handler else { return };
        handler(IncomingMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: 1,
            retained: false,
            user_properties: user_properties.to_vec(),
        })
        .await;
    }

    /// Drop the connection and fire the registered connection-lost handler
    pub fn simulate_connection_lost(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let callback = self.connection_lost.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(reason.to_string());
        }
    }

    /// Ordered log of everything this transport was asked to do
    pub fn events(&self) -> Vec<TransportEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// All publishes, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Publish(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Publishes addressed to one topic, in order
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.lock().unwrap().subscriptions.contains_key(topic)
    }

    /// No-Local flag of an active subscription
    pub fn subscription_no_local(&self, topic: &str) -> Option<bool> {
        self.state.lock().unwrap().subscriptions.get(topic).copied()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    /// Current retained payload on a topic, if any
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().retained.get(topic).cloned()
    }
}

#[async_trait]
impl MqttTransport for InMemoryTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn client_id(&self) -> String {
        self.client_id.clone()
    }

    async fn subscribe(&self, topic: &str, qos: u8, no_local: bool) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let retained = {
            let mut state = self.state.lock().unwrap();
            state.events.push(TransportEvent::Subscribe {
                topic: topic.to_string(),
                qos,
                no_local,
            });
            state.subscriptions.insert(topic.to_string(), no_local);
            state.retained.get(topic).cloned()
        };
        if let Some(payload) = retained {
            let handler = self.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(IncomingMessage {
                    topic: topic.to_string(),
                    payload,
                    qos,
                    retained: true,
                    user_properties: Vec::new(),
                })
                .await;
            }
        }
        true
    }

    async fn unsubscribe(&self, topic: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        state.events.push(TransportEvent::Unsubscribe {
            topic: topic.to_string(),
        });
        state.subscriptions.remove(topic);
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
        user_properties: &[(String, String)],
    ) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.to_vec());
            }
        }
        state.events.push(TransportEvent::Publish(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retained: retain,
            user_properties: user_properties.to_vec(),
        }));
        true
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn set_connection_lost_handler(&self, handler: ConnectionLostHandler) {
        *self.connection_lost.lock().unwrap() = Some(handler);
    }
}

//! Message bus connector.
//!
//! Owns the MQTT session (rumqttc `AsyncClient` + polled event loop), builds
//! msgbus topic names, publishes JSON-encoded updates at QoS 1 and emits a
//! periodic liveness heartbeat while connected. Reconnection is handled by
//! re-polling the event loop; the bridge never re-dials by itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::EventSink;
use crate::models::{NodeStatus, StatusUpdate, TriggerEvent};

const MSGBUS_SELF: &str = "msgbus";
const MSGBUS_VERSION: &str = "v2";
const MSGBUS_DEST_BROADCAST: &str = "broadcast";
const MSGBUS_UPDATE: &str = "Update";

/// `dataId` used for heartbeat publishes.
pub const STATUS_DATA_ID: &str = "Status";

/// Window for the event loop to flush the final publishes on close.
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Backoff after a failed poll before rumqttc re-dials.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// Capacity of the rumqttc request channel.
const CLIENT_REQUEST_CAP: usize = 10;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("broker connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("broker request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("connector already connected")]
    AlreadyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Connector settings, immutable after construction.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub server: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive_secs: u64,
    /// First segment of every topic this node publishes to.
    pub domain: String,
    pub nodename: String,
    pub status_interval_secs: u64,
}

impl ConnectorConfig {
    /// Topic for an update publish:
    /// `<domain>/msgbus/v2/broadcast/<nodename>/<dataId>.Update`.
    pub fn update_topic(&self, data_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}.{}",
            self.domain,
            MSGBUS_SELF,
            MSGBUS_VERSION,
            MSGBUS_DEST_BROADCAST,
            self.nodename,
            data_id,
            MSGBUS_UPDATE
        )
    }
}

/// State and node-change hooks, injected into the connector at construction.
///
/// All methods default to no-ops; implementors override what they need.
pub trait BridgeCallbacks: Send + Sync {
    /// Fired when the broker session is established or lost.
    fn on_state_change(&self, _connected: bool) {}

    /// Fired for each heartbeat this node publishes.
    fn on_node_change(&self, _nodename: &str, _status: NodeStatus, _uptime: i64) {}

    /// Inbound-message hook. This node does not subscribe, so it only fires
    /// for unsolicited traffic. A panicking hook is caught and swallowed.
    fn on_message(&self, _topic: &str, _payload: &[u8]) {}
}

/// The raw publish path. Split out from the connector so the heartbeat and
/// close paths can be exercised without a live broker.
#[async_trait]
trait UpdateTransport: Send + Sync {
    async fn publish(&self, topic: String, body: Vec<u8>) -> Result<(), ConnectorError>;
}

struct MqttTransport {
    client: AsyncClient,
}

#[async_trait]
impl UpdateTransport for MqttTransport {
    async fn publish(&self, topic: String, body: Vec<u8>) -> Result<(), ConnectorError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .await?;
        Ok(())
    }
}

struct Inner {
    client: AsyncClient,
    transport: Arc<dyn UpdateTransport>,
    config: ConnectorConfig,
    start_time: Instant,
    state: RwLock<ConnectionState>,
    callbacks: Arc<dyn BridgeCallbacks>,
}

impl Inner {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    fn uptime_secs(&self) -> i64 {
        self.start_time.elapsed().as_secs() as i64
    }

    async fn publish_update<T: Serialize + ?Sized>(
        &self,
        data_id: &str,
        payload: &T,
    ) -> Result<(), ConnectorError> {
        let topic = self.config.update_topic(data_id);
        let body = serde_json::to_vec(payload)?;
        debug!(%topic, "publishing update");
        self.transport.publish(topic, body).await
    }

    fn fire_node_change(&self, status: NodeStatus) {
        self.callbacks
            .on_node_change(&self.config.nodename, status, self.uptime_secs());
    }

    fn handle_message(&self, topic: &str, payload: &[u8]) {
        let hook = catch_unwind(AssertUnwindSafe(|| {
            self.callbacks.on_message(topic, payload);
        }));
        if hook.is_err() {
            warn!(%topic, "inbound message hook panicked");
        }
    }
}

pub struct MsgbusConnector {
    inner: Arc<Inner>,
    eventloop: std::sync::Mutex<Option<EventLoop>>,
    shutdown: CancellationToken,
    /// Stops the ticker ahead of the rest so the offline heartbeat is the
    /// last status this node publishes.
    heartbeat_shutdown: CancellationToken,
}

impl MsgbusConnector {
    pub fn new(config: ConnectorConfig, callbacks: Arc<dyn BridgeCallbacks>) -> Self {
        let (client, eventloop) = Self::client(&config);
        let transport = Arc::new(MqttTransport {
            client: client.clone(),
        });
        Self::build(config, callbacks, client, eventloop, transport)
    }

    fn client(config: &ConnectorConfig) -> (AsyncClient, EventLoop) {
        let mut opts = MqttOptions::new(
            config.client_id.clone(),
            config.server.clone(),
            config.port,
        );
        opts.set_clean_session(true);
        opts.set_keep_alive(Duration::from_secs(config.keepalive_secs));

        AsyncClient::new(opts, CLIENT_REQUEST_CAP)
    }

    fn build(
        config: ConnectorConfig,
        callbacks: Arc<dyn BridgeCallbacks>,
        client: AsyncClient,
        eventloop: EventLoop,
        transport: Arc<dyn UpdateTransport>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let heartbeat_shutdown = shutdown.child_token();

        Self {
            inner: Arc::new(Inner {
                client,
                transport,
                config,
                start_time: Instant::now(),
                state: RwLock::new(ConnectionState::Disconnected),
                callbacks,
            }),
            eventloop: std::sync::Mutex::new(Some(eventloop)),
            shutdown,
            heartbeat_shutdown,
        }
    }

    #[cfg(test)]
    fn with_transport(
        config: ConnectorConfig,
        callbacks: Arc<dyn BridgeCallbacks>,
        transport: Arc<dyn UpdateTransport>,
    ) -> Self {
        let (client, eventloop) = Self::client(&config);
        Self::build(config, callbacks, client, eventloop, transport)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.state().await
    }

    /// Dial the broker and wait for the initial handshake.
    ///
    /// A refused or failed handshake is returned to the caller; nothing is
    /// published before this succeeds. On success the event-loop task and
    /// the heartbeat ticker are spawned.
    pub async fn connect(&mut self) -> Result<(), ConnectorError> {
        let mut eventloop = self
            .eventloop
            .lock()
            .unwrap()
            .take()
            .ok_or(ConnectorError::AlreadyConnected)?;

        self.inner.set_state(ConnectionState::Connecting).await;

        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    self.inner.set_state(ConnectionState::Disconnected).await;
                    return Err(ConnectorError::Refused(format!("{:?}", ack.code)));
                }
                Ok(_) => continue,
                Err(e) => {
                    self.inner.set_state(ConnectionState::Disconnected).await;
                    return Err(ConnectorError::Connection(e));
                }
            }
        }

        self.inner.set_state(ConnectionState::Connected).await;
        self.inner.callbacks.on_state_change(true);
        info!(
            server = %self.inner.config.server,
            port = self.inner.config.port,
            client_id = %self.inner.config.client_id,
            "connected to message bus broker"
        );

        self.spawn_event_loop(eventloop);
        self.spawn_heartbeat();

        Ok(())
    }

    /// Serialize `payload` and publish it at QoS 1 under `dataId`.
    ///
    /// Ack tracking and retransmission are rumqttc's responsibility; a
    /// returned error means the request never reached the session.
    pub async fn publish_update<T: Serialize + ?Sized>(
        &self,
        data_id: &str,
        payload: &T,
    ) -> Result<(), ConnectorError> {
        self.inner.publish_update(data_id, payload).await
    }

    /// Publish a final offline heartbeat best-effort, then disconnect with a
    /// short grace period and stop the connector tasks.
    pub async fn close(&self) {
        debug!("closing connector");

        // stop the ticker first; no online heartbeat may follow the offline one
        self.heartbeat_shutdown.cancel();

        let update = StatusUpdate {
            status: NodeStatus::Offline,
            uptime: self.inner.uptime_secs(),
        };
        if let Err(e) = self.inner.publish_update(STATUS_DATA_ID, &update).await {
            warn!("offline heartbeat failed: {e}");
        }
        self.inner.fire_node_change(NodeStatus::Offline);

        if let Err(e) = self.inner.client.disconnect().await {
            debug!("disconnect request failed: {e}");
        }

        tokio::time::sleep(DISCONNECT_GRACE).await;
        self.shutdown.cancel();
        self.inner.set_state(ConnectionState::Closed).await;
    }

    fn spawn_event_loop(&self, mut eventloop: EventLoop) {
        let inner = self.inner.clone();
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("connector event loop stopped");
                        break;
                    }
                    ev = eventloop.poll() => match ev {
                        Ok(MqttEvent::Incoming(Packet::ConnAck(ack)))
                            if ack.code == ConnectReturnCode::Success =>
                        {
                            inner.set_state(ConnectionState::Connected).await;
                            inner.callbacks.on_state_change(true);
                            info!("broker session re-established");
                        }
                        Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                            inner.handle_message(&publish.topic, &publish.payload);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if token.is_cancelled() {
                                break;
                            }
                            if inner.state().await == ConnectionState::Connected {
                                inner.callbacks.on_state_change(false);
                            }
                            inner.set_state(ConnectionState::Disconnected).await;
                            warn!("broker connection lost: {e}");
                            // the next poll re-dials; don't spin while the
                            // broker stays down
                            tokio::time::sleep(RECONNECT_BACKOFF).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_heartbeat(&self) {
        let inner = self.inner.clone();
        let token = self.heartbeat_shutdown.clone();
        let interval = Duration::from_secs(inner.config.status_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("heartbeat ticker stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let update = StatusUpdate {
                            status: NodeStatus::Online,
                            uptime: inner.uptime_secs(),
                        };
                        if let Err(e) = inner.publish_update(STATUS_DATA_ID, &update).await {
                            warn!("heartbeat publish failed: {e}");
                        }
                        inner.fire_node_change(NodeStatus::Online);
                    }
                }
            }
        });
    }
}

#[async_trait]
impl EventSink for MsgbusConnector {
    async fn publish_update(&self, data_id: &str, payload: &TriggerEvent) -> anyhow::Result<()> {
        self.inner.publish_update(data_id, payload).await?;
        Ok(())
    }
}

//! Dispatch loop and bridge wiring.
//!
//! A single task consumes the intake channel and forwards each event to the
//! connector, which serializes all webhook-driven publishes and gives them
//! FIFO order. Publish failures are logged, never escalated: the webhook
//! caller has no channel to receive a delayed failure.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::connector::{BridgeCallbacks, MsgbusConnector};
use crate::intake::{ApiKeySet, IntakeServer, IntakeState};
use crate::models::{Event, NodeStatus, TriggerEvent};

/// Where accepted events end up. The seam between the dispatch loop and the
/// connector; test doubles implement it to observe the publish stream.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish_update(&self, data_id: &str, payload: &TriggerEvent) -> Result<()>;
}

/// Default connector hooks: log the transitions, nothing else.
struct LogCallbacks;

impl BridgeCallbacks for LogCallbacks {
    fn on_state_change(&self, connected: bool) {
        debug!(connected, "broker state change");
    }

    fn on_node_change(&self, nodename: &str, status: NodeStatus, uptime: i64) {
        debug!(nodename, ?status, uptime, "node heartbeat");
    }
}

pub struct Dispatcher {
    rx: mpsc::Receiver<Event>,
    sink: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        rx: mpsc::Receiver<Event>,
        sink: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { rx, sink, shutdown }
    }

    /// Run until shutdown or until every intake sender is gone.
    ///
    /// Events still queued when shutdown fires are dropped; the bridge makes
    /// no durability promise for events that never reached the connector.
    pub async fn run(mut self) {
        debug!("dispatch loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("dispatch loop: shutdown requested");
                    break;
                }
                event = self.rx.recv() => match event {
                    Some(event) => {
                        debug!(data_id = %event.data_id, "dispatching event");
                        if let Err(e) = self
                            .sink
                            .publish_update(&event.data_id, &event.payload)
                            .await
                        {
                            warn!(data_id = %event.data_id, "publish failed: {e:#}");
                        }
                    }
                    None => {
                        debug!("intake channel closed");
                        break;
                    }
                }
            }
        }

        debug!("dispatch loop ended");
    }
}

/// Wire up connector, intake server and dispatch loop, then run until the
/// shutdown token fires.
///
/// Broker connect and listener bind failures are fatal; after the loop exits
/// the listener is drained gracefully and the connector publishes its final
/// offline heartbeat.
pub async fn run_bridge(config: BridgeConfig, shutdown: CancellationToken) -> Result<()> {
    let callbacks: Arc<dyn BridgeCallbacks> = Arc::new(LogCallbacks);
    let mut connector = MsgbusConnector::new(config.connector_config(), callbacks);
    connector
        .connect()
        .await
        .context("connecting to message bus broker")?;
    let connector = Arc::new(connector);

    let (tx, rx) = mpsc::channel(config.dispatch.queue_capacity);
    let state = Arc::new(IntakeState::new(ApiKeySet::new(config.apikeys.clone()), tx));

    let server = IntakeServer::bind(config.intake_config())
        .await
        .context("binding intake listener")?;
    let server_task = tokio::spawn(server.serve(state, shutdown.child_token()));

    Dispatcher::new(rx, connector.clone(), shutdown.clone())
        .run()
        .await;

    connector.close().await;
    server_task
        .await
        .context("joining intake server task")?
        .context("intake server failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingSink {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingSink {
        fn new(fail: bool) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish_update(&self, data_id: &str, _payload: &TriggerEvent) -> Result<()> {
            self.seen.lock().unwrap().push(data_id.to_string());
            if self.fail {
                anyhow::bail!("broker unavailable");
            }
            Ok(())
        }
    }

    fn event(data_id: &str) -> Event {
        Event {
            data_id: data_id.to_string(),
            payload: TriggerEvent {
                who: "alice".into(),
                area: "hall".into(),
                kind: "enter".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_events_are_dispatched_in_fifo_order() {
        let (tx, rx) = mpsc::channel(8);
        let sink = Arc::new(RecordingSink::new(false));

        for id in ["first", "second", "third"] {
            tx.send(event(id)).await.unwrap();
        }
        drop(tx); // loop exits once the channel drains

        Dispatcher::new(rx, sink.clone(), CancellationToken::new())
            .run()
            .await;

        assert_eq!(
            *sink.seen.lock().unwrap(),
            vec!["first", "second", "third"]
        );
    }

    #[tokio::test]
    async fn test_publish_failures_do_not_stop_the_loop() {
        let (tx, rx) = mpsc::channel(8);
        let sink = Arc::new(RecordingSink::new(true));

        tx.send(event("a")).await.unwrap();
        tx.send(event("b")).await.unwrap();
        drop(tx);

        Dispatcher::new(rx, sink.clone(), CancellationToken::new())
            .run()
            .await;

        // both events were attempted despite every publish failing
        assert_eq!(*sink.seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let (tx, rx) = mpsc::channel(8);
        let sink = Arc::new(RecordingSink::new(false));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(Dispatcher::new(rx, sink, shutdown.clone()).run());
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatch loop did not exit on shutdown")
            .unwrap();

        // sender side stays usable until dropped; events after shutdown are
        // simply never consumed
        drop(tx);
    }
}

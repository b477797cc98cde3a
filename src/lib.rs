//! hookbus: a webhook-to-message-bus bridge.
//!
//! Accepts IFTTT-style HTTP callbacks, authenticates them by an API key in
//! the URL path, decodes the JSON body and republishes the result as a
//! msgbus update event over MQTT. This node only publishes; it never
//! subscribes.
//!
//! Pipeline: intake (validate + decode) -> dispatch channel -> dispatch
//! loop -> connector -> broker.

pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod intake;
pub mod models;

pub use config::{BridgeConfig, ConfigError};
pub use connector::{
    BridgeCallbacks, ConnectionState, ConnectorConfig, ConnectorError, MsgbusConnector,
};
pub use dispatcher::{run_bridge, Dispatcher, EventSink};
pub use intake::{ApiKeySet, IntakeConfig, IntakeServer, IntakeState};
pub use models::{Event, NodeStatus, StatusUpdate, TriggerEvent};

//! Wire types shared by the intake server and the message bus connector.

use serde::{Deserialize, Serialize};

/// Payload of an inbound webhook call.
///
/// Missing fields decode to empty strings and unknown fields are ignored,
/// so callers only need to send what they know. A body that is not a JSON
/// object is a decode error and gets the request rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(default)]
    pub who: String,
    #[serde(default)]
    pub area: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A validated, decoded webhook call on its way to the bus.
///
/// `data_id` comes from the URL path and selects the publish topic; it is
/// never part of the published payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub data_id: String,
    pub payload: TriggerEvent,
}

/// Node liveness as carried by heartbeat publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Heartbeat payload published under `dataId = "Status"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: NodeStatus,
    /// Whole seconds since the connector was constructed.
    pub uptime: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_event_decodes_full_body() {
        let ev: TriggerEvent =
            serde_json::from_str(r#"{"who":"alice","area":"garden","type":"enter"}"#).unwrap();
        assert_eq!(ev.who, "alice");
        assert_eq!(ev.area, "garden");
        assert_eq!(ev.kind, "enter");
    }

    #[test]
    fn test_trigger_event_tolerates_missing_and_unknown_fields() {
        let ev: TriggerEvent = serde_json::from_str(r#"{"who":"bob","extra":1}"#).unwrap();
        assert_eq!(ev.who, "bob");
        assert_eq!(ev.area, "");
        assert_eq!(ev.kind, "");
    }

    #[test]
    fn test_trigger_event_rejects_non_object_body() {
        assert!(serde_json::from_str::<TriggerEvent>(r#""just a string""#).is_err());
        assert!(serde_json::from_str::<TriggerEvent>("not json at all").is_err());
    }

    #[test]
    fn test_trigger_event_round_trips_type_field_name() {
        let ev = TriggerEvent {
            who: "alice".into(),
            area: "kitchen".into(),
            kind: "exit".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "exit");
        assert!(json.get("kind").is_none());
    }

    #[test]
    fn test_status_update_wire_shape() {
        let json = serde_json::to_value(StatusUpdate {
            status: NodeStatus::Online,
            uptime: 42,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"status": "online", "uptime": 42}));

        let json = serde_json::to_value(StatusUpdate {
            status: NodeStatus::Offline,
            uptime: 7,
        })
        .unwrap();
        assert_eq!(json["status"], "offline");
    }
}

//! Coordination channel vocabulary.
//!
//! Pages talk to the background engine with [`ClientMessage`] values and are
//! notified through [`ServerMessage`] values. Both serialize as JSON objects
//! tagged by a `type` field, e.g. `{ "type": "PROMOTE_NOW" }`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Foreground → background messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Promote the waiting generation immediately.
    #[serde(alias = "SKIP_WAITING")]
    PromoteNow,
    /// Re-read the generation definition and install it if it is new.
    CheckForUpdate,
}

/// Background → foreground notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// A new generation finished installing and is waiting for promotion.
    UpdateReady { generation: String },
    /// A generation became active. `forced` is true when the cutover was
    /// requested with `PROMOTE_NOW` rather than by the last old page closing.
    Activated { generation: String, forced: bool },
}

impl ServerMessage {
    /// SSE event name for this message.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::UpdateReady { .. } => "update-ready",
            ServerMessage::Activated { .. } => "activated",
        }
    }
}

/// Reply to a posted [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    /// Identifier of the handled message, for log correlation.
    pub id: Uuid,
    /// What the engine did with the message.
    pub outcome: AckOutcome,
    /// Active generation after handling the message.
    pub active: Option<String>,
    /// Waiting generation after handling the message.
    pub waiting: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Promoted,
    NothingWaiting,
    Installed,
    UpToDate,
    InstallFailed,
}

/// Engine status as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub active: Option<String>,
    pub waiting: Option<String>,
    pub pending_update: bool,
    pub clients: usize,
    pub regions: Vec<RegionStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionStatus {
    pub name: String,
    pub entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_now_uses_type_tag() {
        let json = serde_json::to_string(&ClientMessage::PromoteNow).expect("serialize");
        assert_eq!(json, r#"{"type":"PROMOTE_NOW"}"#);
    }

    #[test]
    fn skip_waiting_is_accepted_as_promote() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).expect("deserialize");
        assert_eq!(message, ClientMessage::PromoteNow);
    }

    #[test]
    fn check_for_update_parses() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"type":"CHECK_FOR_UPDATE"}"#).expect("deserialize");
        assert_eq!(message, ClientMessage::CheckForUpdate);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"SHOW_NOTIFICATION"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn update_ready_carries_generation() {
        let message = ServerMessage::UpdateReady {
            generation: "v2".to_string(),
        };
        let json = serde_json::to_value(&message).expect("serialize");
        assert_eq!(json["type"], "UPDATE_READY");
        assert_eq!(json["generation"], "v2");
        assert_eq!(message.event_name(), "update-ready");
    }
}

//! Server → Client frames

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, ConversationId};

/// Frames pushed by the backend over the realtime socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    // Authoritative count push
    UnreadCountUpdate {
        #[serde(alias = "unread_count")]
        count: u64,
    },

    // "Something changed, re-fetch" notifications
    NewMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<ChatMessage>,
    },
    ConversationUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },

    // Auth handshake replies
    AuthSuccess,
    AuthError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Any frame type this client does not know about yet.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// Whether this frame should trigger a re-fetch of the unread count.
    pub fn invalidates_unread_count(&self) -> bool {
        matches!(
            self,
            ServerFrame::NewMessage { .. } | ServerFrame::ConversationUpdate { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unread_count_update() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"unread_count_update","count":7}"#).unwrap();
        assert_eq!(frame, ServerFrame::UnreadCountUpdate { count: 7 });
    }

    #[test]
    fn accepts_unread_count_alias() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"unread_count_update","unread_count":3}"#).unwrap();
        assert_eq!(frame, ServerFrame::UnreadCountUpdate { count: 3 });
    }

    #[test]
    fn unknown_types_are_tolerated() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"typing_indicator","user":4}"#).unwrap();
        assert_eq!(frame, ServerFrame::Unknown);
        assert!(!frame.invalidates_unread_count());
    }

    #[test]
    fn message_notifications_invalidate_the_count() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"new_message","conversation_id":12}"#).unwrap();
        assert!(frame.invalidates_unread_count());

        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"conversation_update","conversation_id":"c-9"}"#)
                .unwrap();
        assert_eq!(
            frame,
            ServerFrame::ConversationUpdate {
                conversation_id: Some(ConversationId::Text("c-9".into())),
            }
        );
    }
}

use chrono::{SecondsFormat, Utc};
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// One server entry as carried inside a `LEADER_ANNOUNCEMENT`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub server_id: String,
    pub ip: String,
    pub port: u16,
    pub is_leader: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    UserJoined,
    UserLeft,
    LeaderChanged,
    ServerJoined,
    ServerLeft,
}

/// Every message that crosses the wire, keyed by its `type` tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Body {
    DiscoveryAnnounce {
        server_id: String,
        ip: String,
        port: u16,
    },
    Election {
        candidate_id: String,
        originator_id: String,
        hop_count: u32,
    },
    LeaderAnnouncement {
        leader_id: String,
        ring_topology: Vec<PeerInfo>,
    },
    Heartbeat {
        server_id: String,
        is_leader: bool,
    },
    ClientJoin {
        client_id: String,
        username: String,
    },
    ClientLeave {
        client_id: String,
        username: String,
    },
    ChatMessage {
        username: String,
        content: String,
        client_id: String,
    },
    ForwardMessage {
        original_message: Box<Record>,
        origin_server_id: String,
    },
    Notification {
        notification_type: NotificationKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        leader_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    MessageHistory {
        messages: Vec<Record>,
    },
    Welcome {
        message: String,
        server_id: String,
    },
}

impl Body {
    /// The wire spelling of the `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Body::DiscoveryAnnounce { .. } => "DISCOVERY_ANNOUNCE",
            Body::Election { .. } => "ELECTION",
            Body::LeaderAnnouncement { .. } => "LEADER_ANNOUNCEMENT",
            Body::Heartbeat { .. } => "HEARTBEAT",
            Body::ClientJoin { .. } => "CLIENT_JOIN",
            Body::ClientLeave { .. } => "CLIENT_LEAVE",
            Body::ChatMessage { .. } => "CHAT_MESSAGE",
            Body::ForwardMessage { .. } => "FORWARD_MESSAGE",
            Body::Notification { .. } => "NOTIFICATION",
            Body::MessageHistory { .. } => "MESSAGE_HISTORY",
            Body::Welcome { .. } => "WELCOME",
        }
    }
}

/// A framed record: the shared envelope plus one typed body.
///
/// `message_id` and `timestamp` are stamped once at creation and never
/// rewritten, so a record forwarded through the cluster keeps its identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub message_id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub body: Body,
}

impl Record {
    pub fn new(body: Body) -> Record {
        Record {
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            body,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame;

    fn round_trip(record: &Record) -> Record {
        let data = frame::encode_datagram(record).unwrap();
        frame::decode_datagram(&data).unwrap()
    }

    #[test]
    fn test_chat_message_round_trip() {
        let record = Record::new(Body::ChatMessage {
            username: "alice".to_string(),
            content: "hello ring".to_string(),
            client_id: "client-1".to_string(),
        });
        assert_eq!(record, round_trip(&record));
    }

    #[test]
    fn test_election_round_trip() {
        let record = Record::new(Body::Election {
            candidate_id: "server-8002".to_string(),
            originator_id: "server-8001".to_string(),
            hop_count: 3,
        });
        assert_eq!(record, round_trip(&record));
    }

    #[test]
    fn test_leader_announcement_round_trip() {
        let record = Record::new(Body::LeaderAnnouncement {
            leader_id: "server-8003".to_string(),
            ring_topology: vec![
                PeerInfo {
                    server_id: "server-8001".to_string(),
                    ip: "10.0.0.1".to_string(),
                    port: 8001,
                    is_leader: false,
                },
                PeerInfo {
                    server_id: "server-8003".to_string(),
                    ip: "10.0.0.3".to_string(),
                    port: 8003,
                    is_leader: true,
                },
            ],
        });
        assert_eq!(record, round_trip(&record));
    }

    #[test]
    fn test_forward_message_nests_original() {
        let chat = Record::new(Body::ChatMessage {
            username: "bob".to_string(),
            content: "nested".to_string(),
            client_id: "client-2".to_string(),
        });
        let record = Record::new(Body::ForwardMessage {
            original_message: Box::new(chat.clone()),
            origin_server_id: "server-8001".to_string(),
        });
        let decoded = round_trip(&record);
        match decoded.body {
            Body::ForwardMessage {
                original_message, ..
            } => assert_eq!(*original_message, chat),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_notification_skips_absent_fields() {
        let record = Record::new(Body::Notification {
            notification_type: NotificationKind::UserJoined,
            username: Some("carol".to_string()),
            leader_id: None,
            message: Some("carol joined the chat".to_string()),
        });
        let data = frame::encode_datagram(&record).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["type"], "NOTIFICATION");
        assert_eq!(value["notification_type"], "USER_JOINED");
        assert!(value.get("leader_id").is_none());
        assert_eq!(record, round_trip(&record));
    }

    #[test]
    fn test_wire_tags() {
        let record = Record::new(Body::Heartbeat {
            server_id: "server-8001".to_string(),
            is_leader: true,
        });
        let data = frame::encode_datagram(&record).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["type"], "HEARTBEAT");
        assert_eq!(value["server_id"], "server-8001");
        assert_eq!(value["is_leader"], true);
        assert!(value["message_id"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_message_history_round_trip() {
        let messages = vec![
            Record::new(Body::ChatMessage {
                username: "a".to_string(),
                content: "hello".to_string(),
                client_id: "c1".to_string(),
            }),
            Record::new(Body::ChatMessage {
                username: "b".to_string(),
                content: "hi".to_string(),
                client_id: "c2".to_string(),
            }),
        ];
        let record = Record::new(Body::MessageHistory {
            messages: messages.clone(),
        });
        match round_trip(&record).body {
            Body::MessageHistory { messages: decoded } => assert_eq!(decoded, messages),
            other => panic!("unexpected body: {:?}", other),
        }
    }
}

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata for an open conversation (the backend calls these "chats").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(rename = "chat_id", alias = "id")]
    pub id: String,

    pub name: String,

    #[serde(rename = "chat_type", default)]
    pub kind: ConversationKind,

    #[serde(
        default,
        with = "timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    #[default]
    Direct,
    Group,
    Branch,
    /// Catch-all for kinds this client does not know yet
    #[serde(other)]
    Unknown,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
            ConversationKind::Branch => "branch",
            ConversationKind::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(ConversationKind::Direct),
            "group" => Ok(ConversationKind::Group),
            "branch" => Ok(ConversationKind::Branch),
            _ => Err(format!("Invalid conversation kind: {}", s)),
        }
    }
}

/// One question/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "response_id", alias = "id")]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(rename = "message_type", default)]
    pub kind: ContentKind,

    #[serde(
        default,
        with = "timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,

    /// Ids of branches forked from this message.
    #[serde(default)]
    pub branches: Vec<String>,
}

impl Message {
    /// A message must carry a non-empty question or response.
    pub fn is_valid(&self) -> bool {
        let populated = |s: &Option<String>| s.as_deref().is_some_and(|s| !s.trim().is_empty());
        !self.id.is_empty() && (populated(&self.question) || populated(&self.response))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Text,
    Code,
    Link,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Code => "code",
            ContentKind::Link => "link",
        }
    }
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(ContentKind::Text),
            "code" => Ok(ContentKind::Code),
            "link" => Ok(ContentKind::Link),
            _ => Err(format!("Invalid content kind: {}", s)),
        }
    }
}

/// A child conversation forked from a message of its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub name: String,
    pub parent_conversation_id: String,
    pub parent_message_id: String,
    #[serde(
        default,
        with = "timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

/// Branch id paired with the name to show for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchLink {
    pub id: String,
    pub name: String,
}

/// Inbound push frame as it arrives on the WebSocket.
///
/// `data` stays untyped until `type` is known so that unrecognized frame
/// kinds can be skipped without failing to parse.
#[derive(Debug, Clone, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub data: Value,
}

impl PushFrame {
    pub const MESSAGE: &'static str = "message";
}

/// Outbound frame for sending a message over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub content: String,
    pub message_type: String,
    pub timestamp: String,
}

impl OutboundFrame {
    pub fn new(content: &str, kind: ContentKind, at: DateTime<Utc>) -> Self {
        Self {
            content: content.to_string(),
            message_type: kind.as_str().to_string(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Timestamps from the backend are either RFC 3339 or naive ISO-8601
/// (no offset), which is read as UTC.
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|n| n.and_utc())
            })
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(t) => serializer.serialize_str(&t.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| parse(&s).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {s}"))))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn message_accepts_backend_field_names() {
        let json = r#"{
            "question": "hi",
            "response": "hello",
            "response_id": "m1",
            "timestamp": "2024-03-01T10:15:30.123456",
            "branches": ["b1"]
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.question.as_deref(), Some("hi"));
        assert_eq!(msg.kind, ContentKind::Text);
        assert_eq!(msg.branches, vec!["b1".to_string()]);
        assert_eq!(
            msg.timestamp.unwrap().timestamp(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap().timestamp()
        );
    }

    #[test]
    fn message_accepts_plain_id_and_missing_fields() {
        let msg: Message = serde_json::from_str(r#"{"id": "m2", "question": "next?"}"#).unwrap();
        assert_eq!(msg.id, "m2");
        assert!(msg.response.is_none());
        assert!(msg.timestamp.is_none());
        assert!(msg.branches.is_empty());
        assert!(msg.is_valid());
    }

    #[test]
    fn message_with_offset_timestamp() {
        let msg: Message = serde_json::from_str(
            r#"{"id": "m3", "response": "ok", "timestamp": "2024-03-01T10:15:30+02:00"}"#,
        )
        .unwrap();
        assert_eq!(
            msg.timestamp.unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 15, 30).unwrap()
        );
    }

    #[test]
    fn bad_timestamp_is_an_error() {
        let res: Result<Message, _> =
            serde_json::from_str(r#"{"id": "m", "question": "q", "timestamp": "yesterday"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn empty_message_is_invalid() {
        let empty: Message = serde_json::from_str(r#"{"id": "m"}"#).unwrap();
        assert!(!empty.is_valid());

        let blank: Message =
            serde_json::from_str(r#"{"id": "m", "question": "", "response": ""}"#).unwrap();
        assert!(!blank.is_valid());

        let no_id: Message = serde_json::from_str(r#"{"id": "", "question": "q"}"#).unwrap();
        assert!(!no_id.is_valid());
    }

    #[test]
    fn content_kind_wire_names() {
        let msg: Message =
            serde_json::from_str(r#"{"id": "m", "question": "fn main", "message_type": "code"}"#)
                .unwrap();
        assert_eq!(msg.kind, ContentKind::Code);
        assert_eq!("LINK".parse::<ContentKind>().unwrap(), ContentKind::Link);
        assert!("video".parse::<ContentKind>().is_err());
    }

    #[test]
    fn conversation_kind_is_extensible() {
        let convo: Conversation = serde_json::from_str(
            r#"{"chat_id": "c1", "name": "Trip", "chat_type": "broadcast", "created_at": "2024-01-01T00:00:00"}"#,
        )
        .unwrap();
        assert_eq!(convo.id, "c1");
        assert_eq!(convo.kind, ConversationKind::Unknown);
        assert!(convo.created_at.is_some());
    }

    #[test]
    fn push_frame_keeps_unknown_payloads() {
        let frame: PushFrame = serde_json::from_str(
            r#"{"type": "notification", "data": {"message": "A user has left the chat"}}"#,
        )
        .unwrap();
        assert_eq!(frame.frame_type, "notification");
        assert!(frame.data.get("message").is_some());
    }

    #[test]
    fn outbound_frame_uses_iso_millis() {
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let frame = OutboundFrame::new("hello", ContentKind::Link, at);
        let json: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["content"], "hello");
        assert_eq!(json["message_type"], "link");
        assert_eq!(json["timestamp"], "2024-05-06T07:08:09.000Z");
    }
}

use chrono::{ SecondsFormat, Utc };
use serde::{ Deserialize, Serialize };
use serde_json::{ Map, Value };
use uuid::Uuid;

/// Fields this crate does not interpret. Kept verbatim so a message
/// serializes back exactly as it arrived.
pub type ExtraFields = Map<String, Value>;

/// Current time in the RFC 3339 form used for `createdAt`.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextKind {
    #[serde(rename = "text")]
    Text,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    #[serde(rename = "type")]
    pub kind: TextKind,
    pub text: String,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

/// One content part of a message. Parts of any other type are carried
/// through untouched so a conversation can be echoed back unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePart {
    Text(TextPart),
    Other(Value),
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text(TextPart {
            kind: TextKind::Text,
            text: text.into(),
            extra: ExtraFields::new(),
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessagePart::Text(part) => Some(part.text.as_str()),
            MessagePart::Other(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    /// Stored as sent; offsets and sub-second precision are not normalized.
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), role, text)
    }

    pub fn with_id(id: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            parts: vec![MessagePart::text(text)],
            created_at: Some(timestamp_now()),
            extra: ExtraFields::new(),
        }
    }

    /// Concatenation of every text part; other part types are skipped.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(MessagePart::as_text)
            .collect()
    }

    pub fn has_visible_text(&self) -> bool {
        self.parts
            .iter()
            .filter_map(MessagePart::as_text)
            .any(|t| !t.is_empty())
    }

    /// Appends a delta to the trailing text part, opening one if needed.
    pub fn push_text(&mut self, delta: &str) {
        if let Some(MessagePart::Text(part)) = self.parts.last_mut() {
            part.text.push_str(delta);
            return;
        }
        self.parts.push(MessagePart::text(delta));
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_parts_survive_a_round_trip() {
        let raw = json!({
            "id": "m1",
            "role": "assistant",
            "parts": [
                { "type": "step-start" },
                { "type": "text", "text": "Bonjour" },
                { "type": "reasoning", "text": "hidden" }
            ]
        });
        let message: Message = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(message.text(), "Bonjour");
        assert_eq!(serde_json::to_value(&message).unwrap(), raw);
    }

    #[test]
    fn unknown_fields_and_timestamps_are_kept_verbatim() {
        let raw = json!({
            "id": "welcome",
            "role": "assistant",
            "createdAt": "2025-01-01T10:00:00.000+02:00",
            "metadata": { "source": "seed" },
            "parts": [
                { "type": "text", "text": "Welcome", "state": "done", "providerMetadata": { "k": 1 } }
            ]
        });
        let message: Message = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(message.text(), "Welcome");
        assert!(matches!(message.parts[0], MessagePart::Text(_)));
        assert_eq!(serde_json::to_value(&message).unwrap(), raw);
    }

    #[test]
    fn missing_parts_is_rejected() {
        let raw = json!({ "id": "m4", "role": "user" });
        assert!(serde_json::from_value::<Message>(raw).is_err());
    }

    #[test]
    fn message_without_text_is_not_visible() {
        let raw = json!({ "id": "m2", "role": "assistant", "parts": [{ "type": "file", "url": "x" }] });
        let message: Message = serde_json::from_value(raw).unwrap();
        assert!(!message.has_visible_text());
        assert_eq!(message.text(), "");
    }

    #[test]
    fn push_text_extends_last_text_part() {
        let mut message = Message::with_id("a", Role::Assistant, "");
        for chunk in ["Wel", "come", " to Chronos"] {
            message.push_text(chunk);
        }
        assert_eq!(message.parts.len(), 1);
        assert_eq!(message.text(), "Welcome to Chronos");
    }

    #[test]
    fn rejects_unknown_role() {
        let raw = json!({ "id": "m3", "role": "system", "parts": [] });
        assert!(serde_json::from_value::<Message>(raw).is_err());
    }
}

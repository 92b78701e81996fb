use serde::{ Serialize, Deserialize };

use super::chat::Message;

/// Payload of the `data:` line closing every relay stream.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "start")] Start {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "text-delta")] TextDelta {
        delta: String,
    },
    #[serde(rename = "error")] Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
    #[serde(rename = "finish")] Finish {
        messages: Vec<Message>,
    },
}

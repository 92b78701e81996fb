use log::{ debug, warn };
use serde::Serialize;
use uuid::Uuid;

use crate::models::chat::{ timestamp_now, ExtraFields, Message, Role };
use crate::models::stream::StreamEvent;

pub const WELCOME_MESSAGE_ID: &str = "welcome";
pub const WELCOME_TEXT: &str =
    "Welcome to Chronos Voyages. I'm your temporal concierge. How may I assist you with your journey through time?";

pub const QUICK_REPLIES: [&str; 3] = [
    "Which era is best for a first trip?",
    "What should I pack?",
    "Tell me about safety protocols",
];

/// Lifecycle of the single exchange a conversation may have in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Idle,
    Submitted,
    Streaming,
    Error,
}

impl ChatStatus {
    pub fn is_busy(self) -> bool {
        matches!(self, ChatStatus::Submitted | ChatStatus::Streaming)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatSnapshot {
    pub status: ChatStatus,
    pub messages: Vec<Message>,
    pub error: Option<String>,
}

impl ChatSnapshot {
    pub fn visible_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.has_visible_text())
    }
}

/// Conversation plus request lifecycle, folded from user actions and relay
/// events. Transitions:
///
/// ```text
/// idle|error --submit--> submitted --first event--> streaming --finish--> idle
///                         submitted|streaming --error/abort/truncation--> error
/// ```
///
/// Messages are only ever appended; the one exception is the assistant reply
/// currently streaming, whose text grows with each delta.
#[derive(Clone, Debug)]
pub struct ChatState {
    messages: Vec<Message>,
    status: ChatStatus,
    last_error: Option<String>,
    streaming_id: Option<String>,
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatState {
    pub fn new() -> Self {
        Self::with_messages(vec![Message::with_id(WELCOME_MESSAGE_ID, Role::Assistant, WELCOME_TEXT)])
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            status: ChatStatus::Idle,
            last_error: None,
            streaming_id: None,
        }
    }

    pub fn status(&self) -> ChatStatus {
        self.status
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            status: self.status,
            messages: self.messages.clone(),
            error: self.last_error.clone(),
        }
    }

    /// Canned prompts, offered only while the conversation is the seeded
    /// welcome alone.
    pub fn quick_replies(&self) -> &'static [&'static str] {
        let only_welcome = matches!(self.messages.as_slice(), [m] if m.id == WELCOME_MESSAGE_ID);
        if only_welcome && !self.status.is_busy() {
            &QUICK_REPLIES
        } else {
            &[]
        }
    }

    /// True while waiting for the first token of a reply.
    pub fn is_thinking(&self) -> bool {
        self.status.is_busy() && self.messages.last().is_some_and(|m| m.role == Role::User)
    }

    /// Accepts a user message unless it is blank or an exchange is already
    /// in flight. Returns the conversation to send to the relay.
    pub fn submit(&mut self, text: &str) -> Option<Vec<Message>> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if self.status.is_busy() {
            debug!("Ignoring send while {:?}", self.status);
            return None;
        }

        self.messages.push(Message::new(Role::User, text));
        self.status = ChatStatus::Submitted;
        self.last_error = None;
        self.streaming_id = None;
        Some(self.messages.clone())
    }

    /// Folds one relay event into the state. Returns whether anything changed.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        if !self.status.is_busy() {
            debug!("Ignoring relay event while {:?}", self.status);
            return false;
        }

        match event {
            StreamEvent::Start { message_id } => {
                if self.status == ChatStatus::Streaming {
                    warn!("Duplicate start event for {}", message_id);
                    return false;
                }
                self.begin_reply(message_id);
                true
            }
            StreamEvent::TextDelta { delta } => {
                if self.status == ChatStatus::Submitted {
                    self.begin_reply(Uuid::new_v4().to_string());
                }
                if let Some(reply) = self.streaming_reply_mut() {
                    reply.push_text(&delta);
                }
                true
            }
            StreamEvent::Finish { messages } => {
                self.reconcile(messages);
                self.status = ChatStatus::Idle;
                self.streaming_id = None;
                true
            }
            StreamEvent::Error { error_text } => self.fail(error_text),
        }
    }

    /// Marks the in-flight exchange as failed. Partial reply text is kept.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if !self.status.is_busy() {
            return false;
        }
        self.status = ChatStatus::Error;
        self.last_error = Some(reason.into());
        self.streaming_id = None;
        true
    }

    fn begin_reply(&mut self, message_id: String) {
        self.messages.push(Message {
            id: message_id.clone(),
            role: Role::Assistant,
            parts: Vec::new(),
            created_at: Some(timestamp_now()),
            extra: ExtraFields::new(),
        });
        self.streaming_id = Some(message_id);
        self.status = ChatStatus::Streaming;
    }

    fn streaming_reply_mut(&mut self) -> Option<&mut Message> {
        let id = self.streaming_id.as_deref()?;
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }

    /// Adopts the relay's echoed conversation when it is the local one plus
    /// at most the reply; anything else keeps the local list.
    fn reconcile(&mut self, echoed: Vec<Message>) {
        let local = &self.messages;
        let prefix_matches = echoed.len() >= local.len()
            && echoed.len() - local.len() <= 1
            && local.iter().zip(echoed.iter()).all(|(a, b)| a.id == b.id);
        let extra_is_reply = echoed.len() == local.len()
            || echoed.last().is_some_and(|m| m.role == Role::Assistant);

        if prefix_matches && extra_is_reply {
            self.messages = echoed;
        } else {
            warn!(
                "Echoed conversation ({} messages) does not match local history ({}); keeping local",
                echoed.len(),
                local.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::MessagePart;

    fn start(id: &str) -> StreamEvent {
        StreamEvent::Start { message_id: id.to_string() }
    }

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::TextDelta { delta: text.to_string() }
    }

    fn finish_for(state: &ChatState) -> StreamEvent {
        StreamEvent::Finish { messages: state.messages().to_vec() }
    }

    #[test]
    fn starts_with_the_welcome_message_and_quick_replies() {
        let state = ChatState::new();
        assert_eq!(state.status(), ChatStatus::Idle);
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].id, WELCOME_MESSAGE_ID);
        assert_eq!(state.messages()[0].text(), WELCOME_TEXT);
        assert_eq!(state.quick_replies(), &QUICK_REPLIES);
    }

    #[test]
    fn blank_input_is_a_no_op() {
        let mut state = ChatState::new();
        for text in ["", "   ", "\n\t "] {
            assert!(state.submit(text).is_none());
        }
        assert_eq!(state.status(), ChatStatus::Idle);
        assert_eq!(state.messages().len(), 1);
    }

    #[test]
    fn send_while_busy_is_a_no_op() {
        let mut state = ChatState::new();
        assert!(state.submit("Hello").is_some());
        let before = state.messages().to_vec();
        assert!(state.submit("Again").is_none());
        assert_eq!(state.status(), ChatStatus::Submitted);

        state.apply(start("a1"));
        assert!(state.submit("Again").is_none());
        assert_eq!(state.status(), ChatStatus::Streaming);
        assert_eq!(state.messages().len(), before.len() + 1);
    }

    #[test]
    fn full_exchange_walks_the_lifecycle() {
        let mut state = ChatState::new();
        let payload = state.submit("  What should I pack?  ").unwrap();
        assert_eq!(state.status(), ChatStatus::Submitted);
        assert!(state.is_thinking());
        assert_eq!(payload.len(), 2);
        assert_eq!(payload[1].text(), "What should I pack?");

        assert!(state.apply(start("a1")));
        assert_eq!(state.status(), ChatStatus::Streaming);
        assert!(!state.is_thinking());

        state.apply(delta("A linen suit"));
        state.apply(delta(" and patience."));
        let finish = finish_for(&state);
        assert!(state.apply(finish));

        assert_eq!(state.status(), ChatStatus::Idle);
        let messages = state.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text(), WELCOME_TEXT);
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[2].text(), "A linen suit and patience.");
    }

    #[test]
    fn reply_text_is_independent_of_chunk_boundaries() {
        let splits: [&[&str]; 3] = [
            &["Wel", "come", " to Chronos"],
            &["Welcome to Chronos"],
            &["W", "e", "l", "come to", " ", "Chronos"],
        ];
        for chunks in splits {
            let mut state = ChatState::new();
            state.submit("Hi");
            state.apply(start("a1"));
            for chunk in chunks {
                state.apply(delta(chunk));
            }
            let finish = finish_for(&state);
            state.apply(finish);
            assert_eq!(state.messages().last().unwrap().text(), "Welcome to Chronos");
        }
    }

    #[test]
    fn error_keeps_partial_reply_and_user_message() {
        let mut state = ChatState::new();
        state.submit("Tell me about safety protocols");
        state.apply(start("a1"));
        state.apply(delta("Our chrono-shields"));
        assert!(state.apply(StreamEvent::Error { error_text: "upstream timed out".into() }));

        assert_eq!(state.status(), ChatStatus::Error);
        assert_eq!(state.last_error(), Some("upstream timed out"));
        assert_eq!(state.messages().len(), 3);
        assert_eq!(state.messages()[2].text(), "Our chrono-shields");
    }

    #[test]
    fn auth_failure_appends_no_assistant_message() {
        let mut state = ChatState::new();
        state.submit("Hello");
        state.apply(StreamEvent::Error { error_text: "Provider rejected the credentials (401)".into() });

        assert_eq!(state.status(), ChatStatus::Error);
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[1].role, Role::User);
        assert_eq!(state.messages()[1].text(), "Hello");
    }

    #[test]
    fn error_state_accepts_the_next_send() {
        let mut state = ChatState::new();
        state.submit("Hello");
        state.fail("aborted");
        assert!(state.submit("Hello again").is_some());
        assert_eq!(state.status(), ChatStatus::Submitted);
        assert_eq!(state.last_error(), None);
    }

    #[test]
    fn quick_replies_vanish_for_good_once_an_exchange_begins() {
        let mut state = ChatState::new();
        state.submit(QUICK_REPLIES[1]);
        assert!(state.quick_replies().is_empty());
        state.fail("boom");
        assert!(state.quick_replies().is_empty());
    }

    #[test]
    fn events_are_ignored_when_nothing_is_in_flight() {
        let mut state = ChatState::new();
        assert!(!state.apply(delta("stray")));
        state.submit("Hi");
        state.fail("aborted");
        assert!(!state.apply(delta("late")));
        assert_eq!(state.messages().len(), 2);
    }

    #[test]
    fn delta_without_start_opens_a_reply() {
        let mut state = ChatState::new();
        state.submit("Hi");
        state.apply(delta("Bonjour"));
        assert_eq!(state.status(), ChatStatus::Streaming);
        assert_eq!(state.messages().last().unwrap().text(), "Bonjour");
    }

    #[test]
    fn mismatched_echo_keeps_local_history() {
        let mut state = ChatState::new();
        state.submit("Hi");
        state.apply(start("a1"));
        state.apply(delta("Salve"));
        let local = state.messages().to_vec();
        state.apply(StreamEvent::Finish {
            messages: vec![Message::with_id("other", Role::User, "???")],
        });
        assert_eq!(state.status(), ChatStatus::Idle);
        assert_eq!(state.messages(), &local[..]);
    }

    #[test]
    fn echoed_reply_is_adopted() {
        let mut state = ChatState::new();
        state.submit("Hi");
        state.apply(start("a1"));
        state.apply(delta("Sal"));
        let mut echoed = state.messages().to_vec();
        echoed[2].parts = vec![MessagePart::text("Salve")];
        state.apply(StreamEvent::Finish { messages: echoed.clone() });
        assert_eq!(state.messages(), &echoed[..]);
    }

    #[test]
    fn quick_replies_need_the_seeded_welcome() {
        let resumed = ChatState::with_messages(vec![Message::with_id("u0", Role::User, "Hello")]);
        assert!(resumed.quick_replies().is_empty());

        let reseeded = ChatState::with_messages(
            vec![Message::with_id(WELCOME_MESSAGE_ID, Role::Assistant, WELCOME_TEXT)]
        );
        assert_eq!(reseeded.quick_replies(), &QUICK_REPLIES);
    }

    #[test]
    fn snapshot_hides_textless_messages() {
        let mut state = ChatState::new();
        state.submit("Hi");
        state.apply(start("a1"));
        let snapshot = state.snapshot();
        assert_eq!(snapshot.messages.len(), 3);
        assert_eq!(snapshot.visible_messages().count(), 2);
    }
}

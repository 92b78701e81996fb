//! The producer side of a relayed exchange.
//!
//! One task per request reads the provider stream and pushes
//! [`StreamEvent`]s into a bounded channel that backs the SSE body. The task
//! ends when the provider finishes, fails, exceeds the maximum duration, or
//! the body is dropped because the client went away.

use futures::StreamExt;
use log::{ info, warn };
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::RelayError;
use crate::llm::chat::{ ChatClient, CompletionRequest, ProviderError, ProviderMessage };
use crate::models::chat::{ timestamp_now, ExtraFields, Message, MessagePart, Role };
use crate::models::stream::StreamEvent;

const EVENT_BUFFER: usize = 32;

pub fn validate_conversation(messages: &[Message]) -> Result<(), RelayError> {
    if messages.is_empty() {
        return Err(RelayError::InvalidRequest("conversation has no messages".to_string()));
    }
    let mut seen = HashSet::with_capacity(messages.len());
    for message in messages {
        if message.id.trim().is_empty() {
            return Err(RelayError::InvalidRequest("message id must not be empty".to_string()));
        }
        if !seen.insert(message.id.as_str()) {
            return Err(RelayError::InvalidRequest(format!("duplicate message id '{}'", message.id)));
        }
    }
    Ok(())
}

/// Maps the conversation to plain role-tagged text behind the persona's
/// system prompt. Messages with no text content are left out.
pub fn build_completion_request(system_prompt: &str, messages: &[Message]) -> CompletionRequest {
    CompletionRequest {
        system: system_prompt.to_string(),
        messages: messages
            .iter()
            .filter(|m| m.has_visible_text())
            .map(|m| ProviderMessage::new(m.role.as_str(), m.text()))
            .collect(),
    }
}

pub fn spawn_relay(
    client: Arc<dyn ChatClient>,
    request: CompletionRequest,
    original: Vec<Message>,
    max_duration: Duration,
    cancel: CancellationToken
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(async move {
        pump(client, request, original, max_duration, cancel, tx).await;
    });
    rx
}

async fn pump(
    client: Arc<dyn ChatClient>,
    request: CompletionRequest,
    original: Vec<Message>,
    max_duration: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<StreamEvent>
) {
    let message_id = Uuid::new_v4().to_string();
    let upstream = cancel.child_token();
    let mut reply = String::new();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        res = tokio::time::timeout(
            max_duration,
            forward(client.as_ref(), request, &message_id, &mut reply, &tx, upstream.clone())
        ) => res.unwrap_or(Err(ProviderError::Timeout(max_duration))),
    };
    upstream.cancel();

    match outcome {
        Ok(()) => {
            info!("Relayed {} chars from {} as message {}", reply.len(), client.get_model(), message_id);
            let assistant = Message {
                id: message_id,
                role: Role::Assistant,
                parts: vec![MessagePart::text(reply)],
                created_at: Some(timestamp_now()),
                extra: ExtraFields::new(),
            };
            let mut messages = original;
            messages.push(assistant);
            let _ = tx.send(StreamEvent::Finish { messages }).await;
        }
        Err(ProviderError::Cancelled) => {
            info!("Client abandoned the exchange after {} chars; upstream call dropped", reply.len());
        }
        Err(e) => {
            warn!("Relay failed after {} chars: {}", reply.len(), e);
            let _ = tx.send(StreamEvent::Error { error_text: e.to_string() }).await;
        }
    }
}

async fn forward(
    client: &dyn ChatClient,
    request: CompletionRequest,
    message_id: &str,
    reply: &mut String,
    tx: &mpsc::Sender<StreamEvent>,
    upstream: CancellationToken
) -> Result<(), ProviderError> {
    let mut stream = client.stream_chat(request, upstream).await?;

    // `start` waits for the first successful provider result so a request
    // rejected upstream never announces an assistant message.
    let mut started = false;
    while let Some(item) = stream.next().await {
        let delta = item?;
        if !started {
            emit(tx, StreamEvent::Start { message_id: message_id.to_string() }).await?;
            started = true;
        }
        reply.push_str(&delta);
        emit(tx, StreamEvent::TextDelta { delta }).await?;
    }
    if !started {
        emit(tx, StreamEvent::Start { message_id: message_id.to_string() }).await?;
    }
    Ok(())
}

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<(), ProviderError> {
    tx.send(event).await.map_err(|_| ProviderError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::scripted::ScriptedChatClient;

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn wait_for_cancel(client: &ScriptedChatClient) -> bool {
        for _ in 0..50 {
            if client.was_cancelled() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn conversation() -> Vec<Message> {
        vec![
            Message::with_id("welcome", Role::Assistant, "Welcome to Chronos Voyages."),
            Message::with_id("u1", Role::User, "What should I pack?")
        ]
    }

    #[test]
    fn rejects_empty_and_duplicate_conversations() {
        assert!(matches!(validate_conversation(&[]), Err(RelayError::InvalidRequest(_))));

        let mut messages = conversation();
        messages.push(Message::with_id("u1", Role::User, "again"));
        assert!(matches!(validate_conversation(&messages), Err(RelayError::InvalidRequest(_))));
        assert!(validate_conversation(&conversation()).is_ok());
    }

    #[test]
    fn completion_request_skips_textless_messages() {
        let mut messages = conversation();
        messages.push(Message {
            id: "blank".to_string(),
            role: Role::Assistant,
            parts: vec![],
            created_at: None,
            extra: ExtraFields::new(),
        });
        let request = build_completion_request("Be elegant.", &messages);
        assert_eq!(request.system, "Be elegant.");
        assert_eq!(
            request.messages,
            vec![
                ProviderMessage::new("assistant", "Welcome to Chronos Voyages."),
                ProviderMessage::new("user", "What should I pack?")
            ]
        );
    }

    #[tokio::test]
    async fn streams_start_deltas_and_finish() {
        let client = Arc::new(ScriptedChatClient::new(["Wel", "come", " to Chronos"]));
        let original = conversation();
        let rx = spawn_relay(
            client,
            build_completion_request("sys", &original),
            original.clone(),
            Duration::from_secs(30),
            CancellationToken::new()
        );
        let events = collect(rx).await;

        assert_eq!(events.len(), 5);
        let StreamEvent::Start { message_id } = &events[0] else { panic!("expected start") };
        assert_eq!(events[1], StreamEvent::TextDelta { delta: "Wel".into() });
        let StreamEvent::Finish { messages } = &events[4] else { panic!("expected finish") };
        assert_eq!(messages.len(), original.len() + 1);
        assert_eq!(&messages[..original.len()], &original[..]);
        let reply = &messages[original.len()];
        assert_eq!(&reply.id, message_id);
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.text(), "Welcome to Chronos");
    }

    #[tokio::test]
    async fn upstream_failure_before_text_emits_only_an_error() {
        let client = Arc::new(
            ScriptedChatClient::failing(ProviderError::Auth { status: 401, body: "bad key".into() })
        );
        let rx = spawn_relay(
            client,
            build_completion_request("sys", &conversation()),
            conversation(),
            Duration::from_secs(30),
            CancellationToken::new()
        );
        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { error_text } if error_text.contains("401")));
    }

    #[tokio::test(start_paused = true)]
    async fn maximum_duration_abandons_the_upstream_call() {
        let client = Arc::new(ScriptedChatClient::new(["Par"]).then_stall());
        let rx = spawn_relay(
            client.clone(),
            build_completion_request("sys", &conversation()),
            conversation(),
            Duration::from_secs(30),
            CancellationToken::new()
        );
        let events = collect(rx).await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[1], StreamEvent::TextDelta { delta: "Par".into() });
        assert!(matches!(&events[2], StreamEvent::Error { error_text } if error_text.contains("30s")));
        assert!(wait_for_cancel(&client).await);
    }

    #[tokio::test]
    async fn cancellation_reaches_the_provider() {
        let client = Arc::new(ScriptedChatClient::new(["Par"]).then_stall());
        let cancel = CancellationToken::new();
        let mut rx = spawn_relay(
            client.clone(),
            build_completion_request("sys", &conversation()),
            conversation(),
            Duration::from_secs(30),
            cancel.clone()
        );
        assert!(matches!(rx.recv().await, Some(StreamEvent::Start { .. })));
        assert!(matches!(rx.recv().await, Some(StreamEvent::TextDelta { .. })));

        cancel.cancel();
        assert_eq!(rx.recv().await, None);
        assert!(wait_for_cancel(&client).await);
    }
}

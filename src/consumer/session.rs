use futures::StreamExt;
use log::{ info, warn };
use std::sync::Arc;
use tokio::sync::{ watch, Mutex };
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::{ ChatSnapshot, ChatState };
use super::transport::{ ChatTransport, TransportError };
use crate::models::chat::Message;

struct Core {
    state: ChatState,
    inflight: Option<CancellationToken>,
}

struct Shared<T> {
    core: Mutex<Core>,
    transport: T,
    updates: watch::Sender<ChatSnapshot>,
}

/// A live conversation bound to a transport.
///
/// Each accepted send runs its exchange on a spawned task that folds relay
/// events into the [`ChatState`] and publishes a snapshot after every change.
pub struct ChatSession<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ChatSession<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: ChatTransport> ChatSession<T> {
    pub fn new(transport: T) -> Self {
        Self::with_state(transport, ChatState::new())
    }

    pub fn with_state(transport: T, state: ChatState) -> Self {
        let (updates, _) = watch::channel(state.snapshot());
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core { state, inflight: None }),
                transport,
                updates,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.shared.updates.subscribe()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.shared.updates.borrow().clone()
    }

    pub async fn quick_replies(&self) -> &'static [&'static str] {
        self.shared.core.lock().await.state.quick_replies()
    }

    /// Sends a user message. Returns `None` without touching the
    /// conversation when the text is blank or an exchange is in flight.
    pub async fn send(&self, text: &str) -> Option<JoinHandle<()>> {
        let mut core = self.shared.core.lock().await;
        let payload = core.state.submit(text)?;
        let cancel = CancellationToken::new();
        core.inflight = Some(cancel.clone());
        self.shared.publish(&core.state);
        drop(core);

        let shared = Arc::clone(&self.shared);
        Some(
            tokio::spawn(async move {
                shared.exchange(payload, cancel).await;
            })
        )
    }

    pub async fn send_quick_reply(&self, index: usize) -> Option<JoinHandle<()>> {
        let reply = self.quick_replies().await.get(index).copied()?;
        self.send(reply).await
    }

    /// Abandons the exchange in flight, if any.
    pub async fn stop(&self) -> bool {
        let mut core = self.shared.core.lock().await;
        match core.inflight.take() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }
}

impl<T: ChatTransport> Shared<T> {
    fn publish(&self, state: &ChatState) {
        self.updates.send_replace(state.snapshot());
    }

    async fn exchange(&self, payload: Vec<Message>, cancel: CancellationToken) {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Aborted),
            res = self.drive(&payload) => res,
        };

        let mut core = self.core.lock().await;
        match outcome {
            Ok(()) => info!("Exchange finished with status {:?}", core.state.status()),
            Err(e) => {
                warn!("Exchange failed: {}", e);
                if core.state.fail(e.to_string()) {
                    self.publish(&core.state);
                }
            }
        }
        core.inflight = None;
    }

    async fn drive(&self, payload: &[Message]) -> Result<(), TransportError> {
        let mut events = self.transport.open(payload).await?;

        while let Some(event) = events.next().await {
            let event = event?;
            let mut core = self.core.lock().await;
            if core.state.apply(event) {
                self.publish(&core.state);
            }
            if !core.state.status().is_busy() {
                return Ok(());
            }
        }

        let core = self.core.lock().await;
        if core.state.status().is_busy() {
            return Err(TransportError::Truncated);
        }
        Ok(())
    }
}

use async_trait::async_trait;
use futures::{ Stream, StreamExt };
use log::{ debug, warn };
use reqwest::Client as HttpClient;
use serde::Deserialize;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::models::chat::{ ChatRequest, Message };
use crate::models::stream::{ StreamEvent, DONE_MARKER };
use crate::sse::SseDecoder;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Could not reach the concierge: {0}")]
    Request(String),
    #[error("Concierge answered {status}: {message}")]
    Status {
        status: u16,
        message: String,
    },
    #[error("Concierge sent an unreadable event: {0}")]
    Decode(String),
    #[error("The reply stream ended unexpectedly")]
    Truncated,
    #[error("Request aborted")]
    Aborted,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TransportError>> + Send>>;

/// Opens one relay exchange for a conversation. Dropping the returned stream
/// abandons the exchange.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    async fn open(&self, messages: &[Message]) -> Result<EventStream, TransportError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { http: HttpClient::new(), url: url.into() }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, messages: &[Message]) -> Result<EventStream, TransportError> {
        let body = ChatRequest { messages: messages.to_vec() };
        let resp = self.http
            .post(&self.url)
            .json(&body)
            .send().await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json
                ::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            return Err(TransportError::Status { status: status.as_u16(), message });
        }

        let (tx, rx) = mpsc::channel(32);
        let mut bytes = resp.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            loop {
                let chunk = tokio::select! {
                    _ = tx.closed() => {
                        debug!("Reply stream dropped; closing relay connection");
                        return;
                    }
                    chunk = bytes.next() => chunk,
                };
                let buf = match chunk {
                    Some(Ok(buf)) => buf,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(TransportError::Request(e.to_string()))).await;
                        return;
                    }
                    None => {
                        if decoder.has_pending() {
                            warn!("Relay stream closed mid-event");
                        }
                        return;
                    }
                };

                for data in decoder.push(&buf) {
                    if data == DONE_MARKER {
                        return;
                    }
                    let event = serde_json
                        ::from_str::<StreamEvent>(&data)
                        .map_err(|e| TransportError::Decode(format!("{}: {}", e, data)));
                    let failed = event.is_err();
                    if tx.send(event).await.is_err() || failed {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use async_trait::async_trait;
use super::{
    check_status,
    create_streaming_response,
    ChatClient,
    ChatStream,
    CompletionRequest,
    ProviderError,
    ProviderMessage,
};
use crate::llm::{ LlmConfig, LlmType };
use futures::StreamExt;
use log::debug;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    completion_model: String,
}

#[derive(Serialize)]
struct ChatRequestBody {
    model: String,
    messages: Vec<ProviderMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: String,
}

/// Splits newline-delimited JSON, carrying partial lines between chunks.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

impl OllamaClient {
    pub fn new(base_url: Option<String>, completion_model: String) -> Self {
        let url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into());

        Self {
            http: HttpClient::new(),
            base_url: url,
            completion_model,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ProviderError> {
        if config.llm_type != LlmType::Ollama {
            return Err(ProviderError::Config("Invalid config type for OllamaClient".into()));
        }

        Ok(Self::new(config.base_url.clone(), config.completion_model.clone()))
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    async fn stream_chat(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken
    ) -> Result<ChatStream, ProviderError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = ChatRequestBody {
            model: self.completion_model.clone(),
            messages: request.to_role_messages(),
            stream: true,
        };
        let pending = self.http.post(&url).json(&body);

        Ok(
            create_streaming_response(move |tx| async move {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = pending.send() => sent,
                };
                let resp = match sent {
                    Ok(resp) => resp,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::from(e))).await;
                        return;
                    }
                };
                let resp = match check_status(resp).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                let mut bytes = resp.bytes_stream();
                let mut lines = LineBuffer::default();
                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("Ollama stream cancelled");
                            return;
                        }
                        chunk = bytes.next() => chunk,
                    };
                    let buf = match chunk {
                        Some(Ok(buf)) => buf,
                        Some(Err(e)) => {
                            let _ = tx.send(Err(ProviderError::from(e))).await;
                            return;
                        }
                        None => {
                            let _ = tx.send(
                                Err(ProviderError::Network("stream ended before completion".to_string()))
                            ).await;
                            return;
                        }
                    };

                    for line in lines.push(&buf) {
                        let parsed = match serde_json::from_str::<StreamResponse>(&line) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                let _ = tx.send(Err(ProviderError::Decode(e.to_string()))).await;
                                return;
                            }
                        };
                        if let Some(error) = parsed.error {
                            let _ = tx.send(Err(ProviderError::Upstream(error))).await;
                            return;
                        }
                        if let Some(message) = parsed.message {
                            if !message.content.is_empty() && tx.send(Ok(message.content)).await.is_err() {
                                return;
                            }
                        }
                        if parsed.done {
                            return;
                        }
                    }
                }
            })
        )
    }

    fn get_model(&self) -> String {
        self.completion_model.clone()
    }

    fn get_llm_type(&self) -> LlmType {
        LlmType::Ollama
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_carries_partial_lines() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(br#"{"message":{"content":"Ci"#).is_empty());
        let out = lines.push(b"ao\"},\"done\":false}\n{\"done\":true}\n");
        assert_eq!(out, vec![r#"{"message":{"content":"Ciao"},"done":false}"#, r#"{"done":true}"#]);
    }

    #[test]
    fn parses_stream_lines() {
        let parsed: StreamResponse = serde_json::from_str(
            r#"{"model":"llama3","message":{"role":"assistant","content":"Hi"},"done":false}"#
        ).unwrap();
        assert_eq!(parsed.message.unwrap().content, "Hi");
        assert!(!parsed.done);

        let parsed: StreamResponse = serde_json::from_str(r#"{"error":"model not found"}"#).unwrap();
        assert_eq!(parsed.error.as_deref(), Some("model not found"));
    }

    #[tokio::test]
    async fn stream_without_done_line_is_an_error() {
        use axum::{ routing::post, Router };

        let app = Router::new().route(
            "/api/chat",
            post(|| async { "{\"message\":{\"role\":\"assistant\",\"content\":\"Ci\"},\"done\":false}\n" })
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = OllamaClient::new(Some(format!("http://{}", addr)), "llama3".into());
        let request = CompletionRequest {
            system: String::new(),
            messages: vec![ProviderMessage::new("user", "Ciao")],
        };
        let items: Vec<_> = client
            .stream_chat(request, CancellationToken::new()).await
            .unwrap()
            .collect().await;
        assert_eq!(items[0], Ok("Ci".to_string()));
        assert!(matches!(&items[1], Err(ProviderError::Network(_))));
        assert_eq!(items.len(), 2);
    }
}

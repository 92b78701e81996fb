use async_trait::async_trait;
use futures::StreamExt;
use log::{ debug, warn };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use tokio_util::sync::CancellationToken;

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
use crate::models::stream::DONE_MARKER;
use crate::sse::SseDecoder;

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Client for any endpoint speaking the OpenAI chat-completions protocol.
pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    url: String,
    llm_type: LlmType,
}

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<ProviderMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    error: Option<OpenAIStreamError>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: Option<OpenAIDelta>,
    #[serde(rename = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIStreamError {
    message: String,
}

enum Parsed {
    Deltas(Vec<String>, bool),
    Failed(ProviderError),
}

/// Pulls the text deltas out of one `data:` payload. The flag reports a
/// terminal `finish_reason`.
fn parse_stream_payload(data: &str) -> Parsed {
    let resp = match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(resp) => resp,
        Err(e) => {
            return Parsed::Failed(ProviderError::Decode(format!("{}: {}", e, data)));
        }
    };
    if let Some(error) = resp.error {
        return Parsed::Failed(ProviderError::Upstream(error.message));
    }

    let mut deltas = Vec::new();
    let mut finished = false;
    for choice in resp.choices {
        if let Some(content) = choice.delta.and_then(|d| d.content) {
            if !content.is_empty() {
                deltas.push(content);
            }
        }
        if choice.finish_reason.is_some() {
            finished = true;
        }
    }
    Parsed::Deltas(deltas, finished)
}

fn completions_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{}/chat/completions", trimmed)
    }
}

impl OpenAIChatClient {
    pub fn new(
        api_key: &str,
        model: String,
        base_url: &str,
        llm_type: LlmType
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                ProviderError::Config(format!("Invalid API key format: {}", e))
            )?
        );

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        Ok(Self {
            http,
            model,
            url: completions_url(base_url),
            llm_type,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingApiKey(config.llm_type.to_string()))?;

        Self::new(
            api_key,
            config.completion_model.clone(),
            config.base_url.as_deref().unwrap_or(OPENAI_API_URL),
            config.llm_type
        )
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream_chat(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken
    ) -> Result<ChatStream, ProviderError> {
        let req = OpenAIChatRequest {
            model: self.model.clone(),
            messages: request.to_role_messages(),
            stream: true,
        };
        let pending = self.http.post(&self.url).json(&req);
        let provider = self.llm_type;

        Ok(
            create_streaming_response(move |tx| async move {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("{} request cancelled before response", provider);
                        return;
                    }
                    sent = pending.send() => sent,
                };
                let resp = match sent.map_err(ProviderError::from) {
                    Ok(resp) => resp,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
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

                let mut stream = resp.bytes_stream();
                let mut decoder = SseDecoder::new();

                loop {
                    let chunk_result = tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("{} stream cancelled, dropping upstream connection", provider);
                            return;
                        }
                        chunk = stream.next() => chunk,
                    };

                    let chunk = match chunk_result {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(e)) => {
                            let _ = tx.send(Err(ProviderError::from(e))).await;
                            return;
                        }
                        None => {
                            if decoder.has_pending() {
                                warn!("{} stream ended with an incomplete event", provider);
                            }
                            // A clean close without `[DONE]` or a finish reason is a cut-off reply.
                            let _ = tx.send(
                                Err(ProviderError::Network("stream ended before completion".to_string()))
                            ).await;
                            return;
                        }
                    };

                    for data in decoder.push(&chunk) {
                        if data == DONE_MARKER {
                            return;
                        }
                        match parse_stream_payload(&data) {
                            Parsed::Deltas(deltas, finished) => {
                                for delta in deltas {
                                    if tx.send(Ok(delta)).await.is_err() {
                                        return;
                                    }
                                }
                                if finished {
                                    return;
                                }
                            }
                            Parsed::Failed(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    }
                }
            })
        )
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_llm_type(&self) -> LlmType {
        self.llm_type
    }
}

pub mod mistral;
pub mod ollama;
pub mod openai;
pub mod scripted;

use async_trait::async_trait;
use futures::{ Future, Stream };
use log::debug;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use super::{ LlmConfig, LlmType };
use self::mistral::MistralChatClient;
use self::ollama::OllamaClient;
use self::openai::OpenAIChatClient;
use self::scripted::ScriptedChatClient;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const MAX_ERROR_BODY_LEN: usize = 512;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("Missing API key for {0}")]
    MissingApiKey(String),
    #[error("Invalid provider configuration: {0}")]
    Config(String),
    #[error("Provider rejected the credentials ({status}): {body}")]
    Auth {
        status: u16,
        body: String,
    },
    #[error("Provider rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("Provider returned status {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("Provider reported an error: {0}")]
    Upstream(String),
    #[error("Provider request failed: {0}")]
    Network(String),
    #[error("Provider sent an unreadable payload: {0}")]
    Decode(String),
    #[error("Provider did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProviderError::Network(format!("timed out: {}", err));
        }
        if err.is_decode() {
            return ProviderError::Decode(err.to_string());
        }
        ProviderError::Network(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderMessage {
    pub role: String,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self { role: role.to_string(), content: content.into() }
    }
}

/// A system instruction plus the role-tagged conversation that follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ProviderMessage>,
}

impl CompletionRequest {
    /// Flattens into the `[system, ...conversation]` list chat APIs expect.
    pub fn to_role_messages(&self) -> Vec<ProviderMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !self.system.is_empty() {
            out.push(ProviderMessage::new("system", self.system.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Starts a completion and yields text deltas in provider order.
    ///
    /// Transport and status failures are delivered through the stream so the
    /// caller observes every outcome in one place. Once `cancel` fires the
    /// provider stops reading and drops its upstream connection.
    async fn stream_chat(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken
    ) -> Result<ChatStream, ProviderError>;

    fn get_model(&self) -> String;
    fn get_llm_type(&self) -> LlmType;
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> ChatStream
    where
        F: FnOnce(mpsc::Sender<Result<String, ProviderError>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Maps a non-2xx provider response onto the error taxonomy.
pub async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY_LEN {
        let mut cut = MAX_ERROR_BODY_LEN;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    debug!("Provider responded with {}: {}", status, body);

    Err(match status.as_u16() {
        401 | 403 => ProviderError::Auth { status: status.as_u16(), body },
        429 => ProviderError::RateLimited(body),
        code => ProviderError::Status { status: code, body },
    })
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, ProviderError> {
    if config.llm_type.requires_api_key() {
        let has_key = config.api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
        if !has_key {
            return Err(ProviderError::MissingApiKey(config.llm_type.to_string()));
        }
    }

    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::Mistral => {
            let specific_client = MistralChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::Ollama => {
            let specific_client = OllamaClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::Scripted => Arc::new(ScriptedChatClient::echo()),
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(llm_type: LlmType, api_key: Option<&str>) -> LlmConfig {
        LlmConfig {
            llm_type,
            api_key: api_key.map(str::to_string),
            completion_model: "mistral-small-latest".to_string(),
            base_url: None,
        }
    }

    #[test]
    fn hosted_providers_require_a_key() {
        for llm_type in [LlmType::Mistral, LlmType::OpenAI] {
            let err = new_client(&config(llm_type, None)).err().unwrap();
            assert_eq!(err, ProviderError::MissingApiKey(llm_type.to_string()));
            assert!(new_client(&config(llm_type, Some("  "))).is_err());
        }
    }

    #[test]
    fn local_providers_need_no_key() {
        let client = new_client(&config(LlmType::Ollama, None)).unwrap();
        assert_eq!(client.get_llm_type(), LlmType::Ollama);
        assert_eq!(client.get_model(), "mistral-small-latest");
        assert!(new_client(&config(LlmType::Scripted, None)).is_ok());
    }

    #[test]
    fn system_instruction_leads_the_message_list() {
        let request = CompletionRequest {
            system: "Be elegant.".to_string(),
            messages: vec![ProviderMessage::new("user", "Hi")],
        };
        let messages = request.to_role_messages();
        assert_eq!(messages[0], ProviderMessage::new("system", "Be elegant."));
        assert_eq!(messages[1], ProviderMessage::new("user", "Hi"));
    }
}

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::openai::OpenAIChatClient;
use super::{ ChatClient, ChatStream, CompletionRequest, ProviderError };
use crate::llm::{ LlmConfig, LlmType };

pub const MISTRAL_API_URL: &str = "https://api.mistral.ai/v1";

/// Mistral's La Plateforme speaks the chat-completions dialect, so this only
/// pins the endpoint and provider identity.
pub struct MistralChatClient {
    inner: OpenAIChatClient,
}

impl MistralChatClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ProviderError> {
        if config.llm_type != LlmType::Mistral {
            return Err(ProviderError::Config("Invalid config type for MistralChatClient".into()));
        }
        let api_key = config.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingApiKey(config.llm_type.to_string()))?;

        let inner = OpenAIChatClient::new(
            api_key,
            config.completion_model.clone(),
            config.base_url.as_deref().unwrap_or(MISTRAL_API_URL),
            LlmType::Mistral
        )?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl ChatClient for MistralChatClient {
    async fn stream_chat(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken
    ) -> Result<ChatStream, ProviderError> {
        self.inner.stream_chat(request, cancel).await
    }

    fn get_model(&self) -> String {
        self.inner.get_model()
    }

    fn get_llm_type(&self) -> LlmType {
        LlmType::Mistral
    }
}

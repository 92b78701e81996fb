use log::debug;
use std::sync::Arc;

use super::error::RelayError;
use crate::llm::chat::{ new_client, ChatClient };
use crate::llm::{ LlmConfig, LlmType };

/// Hands the relay a provider client for one request.
pub trait ProviderSource: Send + Sync {
    fn client(&self) -> Result<Arc<dyn ChatClient>, RelayError>;
    fn llm_type(&self) -> LlmType;
    fn model(&self) -> String;
}

/// Builds a client per request, reading the credential from the process
/// environment each time so a rotated or removed key takes effect at once.
#[derive(Debug, Clone)]
pub struct EnvProviderSource {
    pub llm_type: LlmType,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: String,
}

impl EnvProviderSource {
    fn read_api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.trim().is_empty())
    }
}

impl ProviderSource for EnvProviderSource {
    fn client(&self) -> Result<Arc<dyn ChatClient>, RelayError> {
        let api_key = self.read_api_key();
        if api_key.is_none() && self.llm_type.requires_api_key() {
            return Err(
                RelayError::Configuration(
                    format!("{} is not set; cannot reach {}", self.api_key_env, self.llm_type)
                )
            );
        }
        debug!("Creating {} client for model {}", self.llm_type, self.model);

        let config = LlmConfig {
            llm_type: self.llm_type,
            api_key,
            completion_model: self.model.clone(),
            base_url: self.base_url.clone(),
        };
        Ok(new_client(&config)?)
    }

    fn llm_type(&self) -> LlmType {
        self.llm_type
    }

    fn model(&self) -> String {
        self.model.clone()
    }
}

/// Always returns the same client.
#[derive(Clone)]
pub struct FixedProviderSource {
    client: Arc<dyn ChatClient>,
}

impl FixedProviderSource {
    pub fn new(client: Arc<dyn ChatClient>) -> Self {
        Self { client }
    }
}

impl ProviderSource for FixedProviderSource {
    fn client(&self) -> Result<Arc<dyn ChatClient>, RelayError> {
        Ok(Arc::clone(&self.client))
    }

    fn llm_type(&self) -> LlmType {
        self.client.get_llm_type()
    }

    fn model(&self) -> String {
        self.client.get_model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_is_a_configuration_error() {
        let source = EnvProviderSource {
            llm_type: LlmType::Mistral,
            model: "mistral-small-latest".to_string(),
            base_url: None,
            api_key_env: "CHRONOS_UNIT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
        };
        match source.client() {
            Err(RelayError::Configuration(msg)) => {
                assert!(msg.contains("CHRONOS_UNIT_TEST_KEY_THAT_IS_NEVER_SET"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("client created without a credential"),
        }
    }

    #[test]
    fn scripted_provider_needs_no_credential() {
        let source = EnvProviderSource {
            llm_type: LlmType::Scripted,
            model: "scripted".to_string(),
            base_url: None,
            api_key_env: "CHRONOS_UNIT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
        };
        assert_eq!(source.client().ok().map(|c| c.get_llm_type()), Some(LlmType::Scripted));
    }
}

//! A deterministic in-process provider for offline development and tests.

use async_trait::async_trait;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex, PoisonError };
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{ create_streaming_response, ChatClient, ChatStream, CompletionRequest, ProviderError };
use crate::llm::LlmType;

#[derive(Debug, Clone)]
enum Script {
    /// Replies "You said: <last user message>", one word per chunk.
    Echo,
    Chunks(Vec<String>),
}

#[derive(Debug, Clone)]
enum Ending {
    Complete,
    Fail(ProviderError),
    /// Keeps the stream open until the request is cancelled.
    Stall,
}

#[derive(Debug, Clone)]
pub struct ScriptedChatClient {
    script: Script,
    ending: Ending,
    delay: Duration,
    model: String,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedChatClient {
    fn with_script(script: Script, ending: Ending) -> Self {
        Self {
            script,
            ending,
            delay: Duration::ZERO,
            model: "scripted".to_string(),
            requests: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn echo() -> Self {
        Self::with_script(Script::Echo, Ending::Complete).with_delay(Duration::from_millis(40))
    }

    pub fn new<I, S>(chunks: I) -> Self where I: IntoIterator<Item = S>, S: Into<String> {
        Self::with_script(Script::Chunks(chunks.into_iter().map(Into::into).collect()), Ending::Complete)
    }

    /// Fails before producing any text, like a rejected credential.
    pub fn failing(err: ProviderError) -> Self {
        Self::with_script(Script::Chunks(Vec::new()), Ending::Fail(err))
    }

    pub fn then_fail(mut self, err: ProviderError) -> Self {
        self.ending = Ending::Fail(err);
        self
    }

    pub fn then_stall(mut self) -> Self {
        self.ending = Ending::Stall;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// True once a stream of this client observed cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn chunks_for(&self, request: &CompletionRequest) -> Vec<String> {
        match &self.script {
            Script::Chunks(chunks) => chunks.clone(),
            Script::Echo => {
                let last_user = request.messages
                    .iter()
                    .rev()
                    .find(|m| m.role == "user")
                    .map(|m| m.content.as_str())
                    .unwrap_or("nothing");
                format!("You said: {}", last_user)
                    .split_inclusive(' ')
                    .map(str::to_string)
                    .collect()
            }
        }
    }
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    async fn stream_chat(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken
    ) -> Result<ChatStream, ProviderError> {
        let chunks = self.chunks_for(&request);
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).push(request);

        let ending = self.ending.clone();
        let delay = self.delay;
        let cancelled = Arc::clone(&self.cancelled);

        Ok(
            create_streaming_response(move |tx| async move {
                for chunk in chunks {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                cancelled.store(true, Ordering::SeqCst);
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }

                match ending {
                    Ending::Complete => {}
                    Ending::Fail(err) => {
                        let _ = tx.send(Err(err)).await;
                    }
                    Ending::Stall => {
                        cancel.cancelled().await;
                        cancelled.store(true, Ordering::SeqCst);
                    }
                }
            })
        )
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_llm_type(&self) -> LlmType {
        LlmType::Scripted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::ProviderMessage;
    use futures::StreamExt;

    fn request(text: &str) -> CompletionRequest {
        CompletionRequest {
            system: "sys".to_string(),
            messages: vec![ProviderMessage::new("user", text)],
        }
    }

    #[tokio::test]
    async fn echo_repeats_the_last_user_message() {
        let client = ScriptedChatClient::echo().with_delay(Duration::ZERO);
        let stream = client.stream_chat(request("Paris please"), CancellationToken::new()).await.unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["You ", "said: ", "Paris ", "please"]);
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn failure_follows_the_scripted_chunks() {
        let client = ScriptedChatClient::new(["a", "b"]).then_fail(ProviderError::RateLimited("slow down".into()));
        let items: Vec<_> = client
            .stream_chat(request("x"), CancellationToken::new()).await
            .unwrap()
            .collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[2], Err(ProviderError::RateLimited("slow down".into())));
    }

    #[tokio::test]
    async fn stall_ends_on_cancel() {
        let client = ScriptedChatClient::new(["a"]).then_stall();
        let cancel = CancellationToken::new();
        let mut stream = client.stream_chat(request("x"), cancel.clone()).await.unwrap();
        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        cancel.cancel();
        assert_eq!(stream.next().await, None);
        assert!(client.was_cancelled());
    }
}

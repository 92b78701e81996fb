use std::convert::Infallible;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ Context, Poll };
use std::time::Duration;

use axum::{
    extract::{ rejection::JsonRejection, State },
    response::{ sse::{ Event, KeepAlive, Sse }, IntoResponse, Response },
    routing::{ get, post },
    Json,
    Router,
};
use futures::stream::{ self, BoxStream, Stream, StreamExt };
use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use log::{ info, warn };
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{ CancellationToken, DropGuard };
use tower_http::cors::{ Any, CorsLayer };

use super::error::RelayError;
use super::provider::ProviderSource;
use super::relay;
use crate::config::persona::Persona;
use crate::models::chat::ChatRequest;
use crate::models::stream::{ StreamEvent, DONE_MARKER };

pub const CHAT_ROUTE: &str = "/api/chat";
pub const HEALTH_ROUTE: &str = "/api/health";

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared, read-only relay configuration. Cloned into every request.
#[derive(Clone)]
pub struct AppState {
    persona: Arc<Persona>,
    system_prompt: Arc<str>,
    provider: Arc<dyn ProviderSource>,
    max_duration: Duration,
    limiter: Option<Arc<DirectLimiter>>,
}

impl AppState {
    pub fn new(persona: Arc<Persona>, provider: Arc<dyn ProviderSource>, max_duration: Duration) -> Self {
        let system_prompt: Arc<str> = persona.system_prompt().into();
        Self {
            persona,
            system_prompt,
            provider,
            max_duration,
            limiter: None,
        }
    }

    /// Caps accepted chat requests per second across all callers; zero
    /// disables the cap.
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.limiter = NonZeroU32::new(per_second).map(|n|
            Arc::new(RateLimiter::direct(Quota::per_second(n)))
        );
        self
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }
}

pub fn build_router(state: AppState, enable_cors: bool) -> Router {
    let router = Router::new()
        .route(CHAT_ROUTE, post(chat_handler))
        .route(HEALTH_ROUTE, get(health_handler));

    let router = if enable_cors {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
        router.layer(cors)
    } else {
        router
    };

    router.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    persona: String,
    provider: String,
    model: String,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        persona: state.persona.name.clone(),
        provider: state.provider.llm_type().to_string(),
        model: state.provider.model(),
    })
}

async fn chat_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>
) -> Result<Response, RelayError> {
    if let Some(limiter) = &state.limiter {
        if limiter.check().is_err() {
            warn!("Chat rate limit exceeded; rejecting request");
            return Err(RelayError::RateLimited);
        }
    }

    let Json(request) = payload.map_err(|e| RelayError::InvalidRequest(e.body_text()))?;
    relay::validate_conversation(&request.messages)?;

    let client = state.provider.client()?;
    let completion = relay::build_completion_request(&state.system_prompt, &request.messages);
    info!(
        "Relaying {} messages ({} with text) to {} model {}",
        request.messages.len(),
        completion.messages.len(),
        client.get_llm_type(),
        client.get_model()
    );

    let cancel = CancellationToken::new();
    let events = relay::spawn_relay(
        client,
        completion,
        request.messages,
        state.max_duration,
        cancel.clone()
    );

    Ok(event_stream_response(events, cancel.drop_guard()))
}

fn to_sse_event(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            warn!("Failed to serialize stream event: {}", e);
            Event::default().data(r#"{"type":"error","errorText":"internal serialization failure"}"#)
        }
    }
}

fn event_stream_response(
    events: tokio::sync::mpsc::Receiver<StreamEvent>,
    guard: DropGuard
) -> Response {
    let body = ReceiverStream::new(events)
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)))
        .chain(stream::iter([Ok(Event::default().data(DONE_MARKER))]))
        .boxed();

    Sse::new(CancelOnDrop { inner: body, _guard: guard })
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Response body that cancels the relay when hyper drops it, which happens
/// as soon as the client disconnects.
struct CancelOnDrop<T> {
    inner: BoxStream<'static, T>,
    _guard: DropGuard,
}

impl<T> Stream for CancelOnDrop<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

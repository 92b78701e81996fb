pub mod api;
pub mod error;
pub mod provider;
pub mod relay;

use log::{ error, info };
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::ServeArgs;
use crate::config::persona::resolve_persona;
use api::{ build_router, AppState };
use provider::EnvProviderSource;

pub struct Server {
    args: ServeArgs,
    state: AppState,
}

impl Server {
    pub fn from_args(args: ServeArgs) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let persona = resolve_persona(args.persona_path.as_deref())?;
        let model = args.chat_model.clone().unwrap_or_else(|| persona.model.clone());

        let provider = EnvProviderSource {
            llm_type: args.chat_llm_type,
            model,
            base_url: args.chat_base_url.clone(),
            api_key_env: args.api_key_env.clone(),
        };
        let state = AppState::new(
            persona,
            Arc::new(provider),
            Duration::from_secs(args.max_duration_secs)
        ).with_rate_limit(args.rate_limit);

        Ok(Self { args, state })
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let addr = self.args.server_addr.parse::<SocketAddr>()?;
        info!(
            "Persona '{}' offering {} destinations",
            self.state.persona().name,
            self.state.persona().destinations.len()
        );
        let app = build_router(self.state.clone(), !self.args.disable_cors);

        if self.args.enable_tls {
            let (cert_path, key_path) = match (&self.args.tls_cert_path, &self.args.tls_key_path) {
                (Some(cert), Some(key)) => (cert, key),
                _ => {
                    error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                    return Err("TLS enabled without certificate and key paths".into());
                }
            };
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;

            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(5)));
            });

            info!("HTTPS server listening on: https://{}", addr);
            axum_server
                ::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service()).await?;
        } else {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                e
            })?;
            info!("HTTP server listening on: http://{}", addr);
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown_signal()).await?;
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

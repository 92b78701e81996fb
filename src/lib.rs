pub mod cli;
pub mod config;
pub mod consumer;
pub mod llm;
pub mod models;
pub mod server;
pub mod sse;

use cli::{ Args, Command };
use log::info;
use server::Server;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    match args.command {
        Command::Serve(serve) => {
            info!("--- Core Configuration ---");
            info!("Server Address: {}", serve.server_addr);
            info!("Chat LLM Type: {}", serve.chat_llm_type);
            info!("Chat Model Override: {}", serve.chat_model.as_deref().unwrap_or("(persona default)"));
            info!("API Key Variable: {}", serve.api_key_env);
            info!("Persona Path: {}", serve.persona_path.as_deref().unwrap_or("(built-in)"));
            info!("Max Reply Duration: {}s", serve.max_duration_secs);
            info!("Rate Limit: {}/s", serve.rate_limit);
            info!("CORS Enabled: {}", !serve.disable_cors);
            info!("TLS Enabled: {}", serve.enable_tls);
            info!("-------------------------");

            let server = Server::from_args(serve)?;
            server.run().await
        }
        Command::Chat(chat) => {
            info!("Connecting to relay at {}", chat.url);
            consumer::terminal::run(chat).await
        }
    }
}

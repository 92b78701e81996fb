use clap::{ Parser, Subcommand };

use crate::llm::LlmType;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the streaming relay endpoint.
    Serve(ServeArgs),
    /// Chat with a running relay from the terminal.
    Chat(ChatArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host address and port for the server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:3000")]
    pub server_addr: String,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (mistral, openai, ollama, scripted)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "mistral")]
    pub chat_llm_type: LlmType,

    /// Base URL for the Chat LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// Model name for chat completion. Overrides the persona's model when set.
    #[arg(long, env = "CHAT_MODEL")]
    pub chat_model: Option<String>,

    /// Name of the environment variable holding the provider API key. Read on every request.
    #[arg(long, env = "CHAT_API_KEY_VAR", default_value = "MISTRAL_API_KEY")]
    pub api_key_env: String,

    // --- Relay Args ---
    /// Optional path to a persona file (JSON). The built-in concierge is used when unset.
    #[arg(long, env = "PERSONA_PATH")]
    pub persona_path: Option<String>,

    /// Upper bound in seconds on one provider reply before the stream is cut off.
    #[arg(long, env = "MAX_DURATION_SECS", default_value = "30")]
    pub max_duration_secs: u64,

    /// Chat requests accepted per second across all clients. 0 disables the limit.
    #[arg(long, env = "RATE_LIMIT_PER_SECOND", default_value = "10")]
    pub rate_limit: u32,

    /// Do not attach permissive CORS headers to responses.
    #[arg(long, env = "DISABLE_CORS", default_value = "false")]
    pub disable_cors: bool,

    /// Optional path to the TLS certificate file (PEM format) for enabling HTTPS. Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling HTTPS. Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ChatArgs {
    /// Full URL of the relay's chat endpoint.
    #[arg(long, env = "CHAT_RELAY_URL", default_value = "http://127.0.0.1:3000/api/chat")]
    pub url: String,
}

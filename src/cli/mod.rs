use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Backend API Args ---
    /// Base URL of the chat backend REST API.
    #[arg(long, env = "API_HOST", default_value = "http://127.0.0.1:8080")]
    pub api_host: String,

    /// Email of the portal user to act as (resolved to a user id on startup).
    #[arg(long, env = "USER_EMAIL")]
    pub user_email: String,

    // --- Agent Host Args ---
    /// Bearer token presented to the agent host.
    #[arg(long, env = "AGENT_TOKEN", default_value = "123")]
    pub agent_token: String,

    /// Identifier of the agent whose host URL is resolved on startup.
    #[arg(long, env = "AGENT_ID", default_value = "0")]
    pub agent_id: i64,

    /// Delay in milliseconds between agent dispatch and opening the reply
    /// stream (gives the agent time to begin producing output).
    #[arg(long, env = "STREAM_DELAY_MS", default_value = "1000")]
    pub stream_delay_ms: u64,

    /// Delay in milliseconds between stream completion and the
    /// reconciliation fetch of out-of-band messages.
    #[arg(long, env = "RECONCILE_DELAY_MS", default_value = "1000")]
    pub reconcile_delay_ms: u64,

    // --- Polling Args ---
    /// Interval in seconds between unread-message polls for the selected
    /// conversation.
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "10")]
    pub poll_interval_secs: u64,

    // --- Local Cache Args ---
    /// Directory for the local sled cache (conversation snapshots, settings).
    #[arg(long, env = "CACHE_DIR", default_value = ".agent-chat")]
    pub cache_dir: String,
}

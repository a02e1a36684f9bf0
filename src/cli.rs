use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "codepod")]
#[command(about = "Multi-tenant code execution service on Kubernetes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the execution API server
    Serve {
        /// Listen address (overrides BIND_ADDR)
        #[arg(long)]
        addr: Option<String>,
    },

    /// Check cluster, KV store, and configuration
    Check,

    /// Manage API keys through the admin API (requires MASTER_API_KEY)
    Keys {
        /// Base URL of a running codepod server
        #[arg(long, default_value = "http://localhost:8000")]
        api_url: String,

        #[command(subcommand)]
        action: KeysAction,
    },

    /// Display application version
    Version,
}

#[derive(Subcommand)]
pub enum KeysAction {
    /// Create a new API key
    Create {
        /// Human-readable name for the key
        name: String,
        #[arg(long)]
        per_second: Option<u32>,
        #[arg(long)]
        per_minute: Option<u32>,
        #[arg(long)]
        hourly: Option<u32>,
        #[arg(long)]
        daily: Option<u32>,
        #[arg(long)]
        monthly: Option<u32>,
    },

    /// List all keys
    List,

    /// Show one key by display prefix (e.g. sk-abc12345)
    Show { prefix: String },

    /// Revoke a key by display prefix
    Revoke { prefix: String },

    /// Update a key by display prefix
    Update {
        prefix: String,
        /// Enable or disable the key
        #[arg(long)]
        enabled: Option<bool>,
        /// New name
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        per_minute: Option<u32>,
        #[arg(long)]
        hourly: Option<u32>,
        #[arg(long)]
        daily: Option<u32>,
    },

    /// Show current usage and rate-limit windows for a key
    Usage { prefix: String },
}

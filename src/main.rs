use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use parley_llm::{BackendConfig, OllamaBackend};
use parley_relay::RelayConfig;
use parley_server::ServerConfig;
use parley_store::Database;
use parley_telemetry::{init_telemetry, TelemetryConfig};

/// Chat server relaying conversations between browser clients and a
/// locally hosted model.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9090, env = "PARLEY_PORT")]
    port: u16,

    /// Path to the SQLite database. Defaults to ~/.parley/parley.db.
    #[arg(long, env = "PARLEY_DB")]
    db: Option<PathBuf>,

    /// Base URL of the inference backend.
    #[arg(long, default_value = "http://localhost:11434", env = "OLLAMA_URL")]
    backend_url: String,

    /// Model name requested from the backend.
    #[arg(long, default_value = "llama3.2", env = "OLLAMA_MODEL")]
    model: String,

    /// How many recent messages accompany each prompt.
    #[arg(long, default_value_t = 20, env = "PARLEY_HISTORY_WINDOW")]
    history_window: usize,

    /// System instruction sent with every backend request.
    #[arg(long, env = "PARLEY_SYSTEM_PROMPT")]
    system_prompt: Option<String>,

    /// Disable the SQLite sink for warn-level logs.
    #[arg(long, env = "PARLEY_NO_LOG_DB")]
    no_log_db: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let data_dir = args
        .db
        .as_ref()
        .and_then(|p| p.parent().map(PathBuf::from))
        .unwrap_or_else(|| home_dir().join(".parley"));
    std::fs::create_dir_all(&data_dir).expect("failed to create data directory");

    let _telemetry = init_telemetry(TelemetryConfig {
        log_to_sqlite: !args.no_log_db,
        log_db_path: data_dir.join("logs.db"),
        ..Default::default()
    });

    tracing::info!("starting parley server");

    let db_path = args.db.unwrap_or_else(|| data_dir.join("parley.db"));
    let db = Database::open(&db_path).expect("failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    let mut backend_config = BackendConfig {
        base_url: args.backend_url,
        model: args.model,
        ..Default::default()
    };
    if let Some(system_prompt) = args.system_prompt {
        backend_config.system_prompt = system_prompt;
    }
    tracing::info!(
        base_url = %backend_config.base_url,
        model = %backend_config.model,
        "inference backend configured"
    );
    let backend = Arc::new(OllamaBackend::new(backend_config));

    let config = ServerConfig {
        port: args.port,
        relay: RelayConfig {
            history_window: args.history_window,
        },
        ..Default::default()
    };
    let handle = parley_server::start(config, db, backend)
        .await
        .expect("failed to start server");

    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

use std::sync::Arc;
use tracing::{error, info, warn};

use gradebook::config::Config;
use gradebook::grade::engine::GradeEngine;
use gradebook::web::server::WebServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gradebook=info,tower_http=info".into()),
        )
        .init();

    info!("📚 gradebook v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gradebook.toml".to_string());

    if !std::path::Path::new(&config_path).exists() {
        warn!("{} not found, using built-in defaults", config_path);
    }
    let config = Config::load_or_default(&config_path)?;
    info!(
        "Config loaded from {} (floor threshold {}, max penalty {})",
        config_path, config.grading.floor_threshold, config.grading.max_penalty
    );

    let config = Arc::new(config);

    // Initialize engine (store, journal, mailer, metrics)
    let engine = Arc::new(GradeEngine::new(config.clone())?);

    // Background snapshot writer
    tokio::spawn(engine.clone().run_persist_loop());

    let web = WebServer::new(engine.clone(), config);
    let result = web.run().await;

    // Flush whatever the saver has not written yet
    if let Err(e) = engine.save_now() {
        error!("Final snapshot save failed: {}", e);
    }
    result
}

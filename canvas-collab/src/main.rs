//! Canvas server binary. Configuration comes from `CANVAS_*` environment
//! variables, logging from `RUST_LOG` (default `info`).

use canvas_collab::{CanvasServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };

    log::info!("Starting canvas server on {}...", config.bind_addr());
    let server = CanvasServer::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }

    if let Some(stats) = server.close().await {
        log::info!(
            "Persisted {} pixels, {} snapshots ({} failures)",
            stats.appended,
            stats.snapshots,
            stats.failures
        );
    }
    Ok(())
}

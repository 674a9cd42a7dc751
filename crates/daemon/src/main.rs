use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use drivedeck_core::config::{self as settings_config, ENV_CONFIG_PATH};
use drivedeck_core::logging::{LogFormat, init_logging};
use drivedeck_core::{DriveClient, DriveCredentials};

mod routes;
#[cfg(test)]
mod tests;

#[derive(Parser, Debug)]
#[command(name = "drivedeckd", version, about = "Upload relay for Google Drive")]
struct Args {
    /// Settings file (TOML). Missing file means defaults.
    #[arg(long, env = ENV_CONFIG_PATH)]
    config: Option<PathBuf>,

    /// Overrides `server.bind`.
    #[arg(long, env = "DRIVEDECK_BIND")]
    bind: Option<String>,

    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let format = if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::from_env_or(LogFormat::Text)
    };
    init_logging(format);

    let config_path = args
        .config
        .unwrap_or_else(settings_config::default_config_path);
    let mut settings = settings_config::load_relay_settings(&config_path)?;
    if let Some(bind) = args.bind {
        settings.server.bind = bind;
    }

    let credentials = DriveCredentials::from_env();
    if !credentials.is_complete() {
        tracing::warn!(
            event = "relay.credentials_missing",
            "relay.credentials_missing"
        );
    }

    let drive = Arc::new(DriveClient::new(settings.drive.clone(), credentials)?);
    let app = routes::router(routes::AppState::new(drive, settings.clone()));

    let listener = tokio::net::TcpListener::bind(&settings.server.bind).await?;
    tracing::info!(
        event = "relay.listening",
        addr = %listener.local_addr()?,
        config = %config_path.display(),
        folder_id = settings.drive.folder_id.as_deref().unwrap_or("-"),
        "relay.listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(event = "relay.stopped", "relay.stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(event = "relay.signal_failed", error = %e, "relay.signal_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!(event = "relay.shutdown_requested", "relay.shutdown_requested");
}

mod error;
mod fetch;
mod serve;
mod transcode;
mod upstream;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::net::TcpListener;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    error::ApiError,
    fetch::Fetcher,
    transcode::TranscodeCache,
    upstream::{DOWNLOAD_TIMEOUT, FtpTransfer, UpstreamClient},
};

const DEFAULT_PORT: u16 = 5005;
const DEFAULT_FTP_HOST: &str = "public.sos.noaa.gov";

#[derive(Clone)]
pub struct AppState {
    pub fetcher: Arc<Fetcher>,
    pub transcodes: Arc<TranscodeCache>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "sos_gateway=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        if let Some(cause) = error.cause {
            eprintln!("Caused by: {cause}");
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let scratch_dir = root.join("tmp");
    let cache_dir = root.join("cache");
    let public_dir = root.join("public");

    // Scratch holds per-request temp files and process-lifetime binary
    // downloads; it starts empty on every boot. The transcode cache survives
    // restarts on purpose.
    reset_scratch_dir(&scratch_dir).await;
    tokio::fs::create_dir_all(&cache_dir).await.map_err(|error| {
        ApiError::internal(format!("could not create the transcode cache dir: {error}"))
    })?;

    let ftp_host = resolve_ftp_host();
    let upstream = UpstreamClient::spawn(
        FtpTransfer::new(ftp_host.clone(), DOWNLOAD_TIMEOUT),
        DOWNLOAD_TIMEOUT,
    );

    let encoder = transcode::detect_encoder().await;
    info!(?encoder, "selected H.264 encoder");

    let state = AppState {
        fetcher: Arc::new(Fetcher::new(upstream, scratch_dir.clone())),
        transcodes: Arc::new(TranscodeCache::new(cache_dir, encoder)),
    };

    let app = serve::router(state)
        .fallback_service(ServeDir::new(public_dir))
        .layer(TraceLayer::new_for_http());

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("could not bind {addr}: {error}")))?;

    info!("gateway listening on http://{addr}, proxying ftp://{ftp_host}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))?;

    // Same teardown on every exit path; best-effort so shutdown never hangs.
    reset_scratch_dir(&scratch_dir).await;

    Ok(())
}

/// Remove and recreate the scratch directory, swallowing errors.
async fn reset_scratch_dir(dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(dir).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!("could not clear the scratch dir {:?}: {error}", dir);
    }
    if let Err(error) = tokio::fs::create_dir_all(dir).await {
        warn!("could not recreate the scratch dir {:?}: {error}", dir);
    }
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("could not install the interrupt handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("could not install the SIGTERM handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("interrupt received, shutting down"),
        _ = terminate => info!("termination signal received, shutting down"),
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("0.0.0.0:{port}")
}

fn resolve_ftp_host() -> String {
    std::env::var("FTP_HOST")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
        .unwrap_or_else(|| DEFAULT_FTP_HOST.to_string())
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scratch_reset_purges_stale_files_and_recreates_the_dir() {
        let parent = tempfile::tempdir().unwrap();
        let scratch = parent.path().join("tmp");
        tokio::fs::create_dir_all(&scratch).await.unwrap();
        tokio::fs::write(scratch.join("stale"), b"leftover")
            .await
            .unwrap();

        reset_scratch_dir(&scratch).await;

        assert!(tokio::fs::try_exists(&scratch).await.unwrap());
        let mut entries = tokio::fs::read_dir(&scratch).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scratch_reset_tolerates_a_missing_dir() {
        let parent = tempfile::tempdir().unwrap();
        let scratch = parent.path().join("never-created");

        reset_scratch_dir(&scratch).await;
        assert!(tokio::fs::try_exists(&scratch).await.unwrap());
    }
}

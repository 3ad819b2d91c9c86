use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::upstream::{UpstreamClient, UpstreamError};

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("filesystem error on {path}: {reason}")]
    Filesystem { path: String, reason: String },
}

type BinaryJob = Shared<BoxFuture<'static, Result<PathBuf, FetchError>>>;

/// Downloads remote files through the serialized archive worker. Binary
/// assets are cached on disk for the lifetime of the process, keyed by their
/// remote path; concurrent first-time requests for one key share a single
/// download. Text files only ever touch a short-lived temp file.
pub struct Fetcher {
    upstream: UpstreamClient,
    scratch_dir: PathBuf,
    cache: Mutex<HashMap<String, PathBuf>>,
    in_flight: Mutex<HashMap<String, BinaryJob>>,
}

impl Fetcher {
    pub fn new(upstream: UpstreamClient, scratch_dir: PathBuf) -> Self {
        Self {
            upstream,
            scratch_dir,
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Download a small control file and return its content as text. The
    /// backing temp file is removed before this returns, success or failure.
    pub async fn fetch_text(&self, remote_path: &str) -> Result<String, FetchError> {
        let temp = self.scratch_dir.join(Uuid::new_v4().to_string());
        let result = self.download_and_read(remote_path, &temp).await;

        if let Err(error) = tokio::fs::remove_file(&temp).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("could not remove temp file {:?}: {error}", temp);
        }

        result
    }

    async fn download_and_read(&self, remote_path: &str, temp: &Path) -> Result<String, FetchError> {
        self.upstream.download(remote_path, temp).await?;
        let bytes = tokio::fs::read(temp)
            .await
            .map_err(|error| FetchError::Filesystem {
                path: remote_path.to_string(),
                reason: error.to_string(),
            })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Return a local copy of a binary asset, downloading it at most once.
    /// The on-disk re-check protects against cache files deleted externally
    /// between requests.
    pub async fn fetch_binary_cached(self: &Arc<Self>, remote_path: &str) -> Result<PathBuf, FetchError> {
        if let Some(cached) = self.cache.lock().await.get(remote_path).cloned() {
            if tokio::fs::try_exists(&cached).await.unwrap_or(false) {
                debug!(path = %remote_path, "binary cache hit");
                return Ok(cached);
            }
            warn!(path = %remote_path, "cached file vanished, downloading again");
        }

        let job = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(remote_path) {
                Some(job) => job.clone(),
                None => {
                    let fetcher = Arc::clone(self);
                    let path = remote_path.to_string();
                    let job = async move { fetcher.download_binary(&path).await }
                        .boxed()
                        .shared();
                    in_flight.insert(remote_path.to_string(), job.clone());
                    job
                }
            }
        };

        let result = job.await;
        self.in_flight.lock().await.remove(remote_path);
        result
    }

    async fn download_binary(&self, remote_path: &str) -> Result<PathBuf, FetchError> {
        let file_name = match Path::new(remote_path).extension().and_then(|ext| ext.to_str()) {
            Some(extension) => format!("{}.{extension}", Uuid::new_v4()),
            None => Uuid::new_v4().to_string(),
        };
        let local = self.scratch_dir.join(file_name);

        self.upstream.download(remote_path, &local).await?;
        self.cache
            .lock()
            .await
            .insert(remote_path.to_string(), local.clone());

        Ok(local)
    }
}

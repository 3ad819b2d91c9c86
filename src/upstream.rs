use std::{
    net::ToSocketAddrs,
    path::{Path, PathBuf},
    time::Duration,
};

use suppaftp::{FtpStream, types::FileType};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tracing::{debug, warn};

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);
const FTP_PORT: u16 = 21;
const JOB_QUEUE_DEPTH: usize = 64;
const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "anonymous@";

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("could not connect to the archive: {0}")]
    Connect(String),
    #[error("download of {path} timed out after {seconds}s")]
    Timeout { path: String, seconds: u64 },
    #[error("transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },
    #[error("the archive worker has shut down")]
    WorkerGone,
}

/// One download against the remote archive. The production implementation
/// speaks FTP; tests substitute in-memory fixtures.
pub trait Transfer: Send + 'static {
    fn download(&mut self, remote_path: &str, dest: &Path) -> Result<(), UpstreamError>;
}

/// FTP backend with a fresh session per operation: connect, login, RETR,
/// quit. A transient network fault can therefore never leave a half-broken
/// session behind for the next request.
pub struct FtpTransfer {
    host: String,
    timeout: Duration,
}

impl FtpTransfer {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }

    fn retr_to_file(
        &self,
        session: &mut FtpStream,
        remote_path: &str,
        dest: &Path,
    ) -> Result<(), UpstreamError> {
        let transfer_error = |reason: String| UpstreamError::Transfer {
            path: remote_path.to_string(),
            reason,
        };

        session
            .transfer_type(FileType::Binary)
            .map_err(|error| transfer_error(error.to_string()))?;

        let mut reader = session
            .retr_as_stream(remote_path)
            .map_err(|error| transfer_error(error.to_string()))?;
        let mut file =
            std::fs::File::create(dest).map_err(|error| transfer_error(error.to_string()))?;
        std::io::copy(&mut reader, &mut file)
            .map_err(|error| transfer_error(error.to_string()))?;
        session
            .finalize_retr_stream(reader)
            .map_err(|error| transfer_error(error.to_string()))?;

        Ok(())
    }
}

impl Transfer for FtpTransfer {
    fn download(&mut self, remote_path: &str, dest: &Path) -> Result<(), UpstreamError> {
        let addr = format!("{}:{FTP_PORT}", self.host)
            .to_socket_addrs()
            .map_err(|error| UpstreamError::Connect(error.to_string()))?
            .next()
            .ok_or_else(|| {
                UpstreamError::Connect(format!("{} did not resolve to any address", self.host))
            })?;

        let mut session = FtpStream::connect_timeout(addr, self.timeout)
            .map_err(|error| UpstreamError::Connect(error.to_string()))?;
        if let Err(error) = session.get_ref().set_read_timeout(Some(self.timeout)) {
            warn!("could not set read timeout on the archive socket: {error}");
        }
        session
            .login(ANONYMOUS_USER, ANONYMOUS_PASSWORD)
            .map_err(|error| UpstreamError::Connect(error.to_string()))?;

        let result = self.retr_to_file(&mut session, remote_path, dest);

        if let Err(error) = session.quit() {
            debug!("archive session did not close cleanly: {error}");
        }

        result
    }
}

struct Job {
    remote_path: String,
    dest: PathBuf,
    reply: oneshot::Sender<Result<(), UpstreamError>>,
}

/// Handle to the single archive worker. All downloads are funneled through
/// one queue and executed strictly in submission order, because the archive
/// does not tolerate overlapping commands.
#[derive(Clone)]
pub struct UpstreamClient {
    tx: mpsc::Sender<Job>,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn spawn(mut transfer: impl Transfer, timeout: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(JOB_QUEUE_DEPTH);

        tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                let result = transfer.download(&job.remote_path, &job.dest);
                if job.reply.send(result).is_err() {
                    debug!(
                        path = %job.remote_path,
                        "download finished after the requester gave up"
                    );
                }
            }
        });

        Self { tx, timeout }
    }

    /// Download `remote_path` into `dest`. The operation is queued behind any
    /// in-flight downloads and bounded by the client timeout; on expiry the
    /// queue itself keeps draining regardless of how the stuck operation ends.
    pub async fn download(&self, remote_path: &str, dest: &Path) -> Result<(), UpstreamError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                remote_path: remote_path.to_string(),
                dest: dest.to_path_buf(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| UpstreamError::WorkerGone)?;

        match timeout(self.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpstreamError::WorkerGone),
            Err(_) => Err(UpstreamError::Timeout {
                path: remote_path.to_string(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    /// In-memory archive for tests: serves fixture bytes, counts downloads,
    /// and optionally sleeps per path to simulate a slow transfer.
    pub(crate) struct FixtureTransfer {
        files: HashMap<String, Vec<u8>>,
        downloads: Arc<AtomicUsize>,
        delays: HashMap<String, Duration>,
    }

    impl FixtureTransfer {
        pub(crate) fn new<'a>(
            files: impl IntoIterator<Item = (&'a str, &'a [u8])>,
            downloads: Arc<AtomicUsize>,
        ) -> Self {
            Self {
                files: files
                    .into_iter()
                    .map(|(path, bytes)| (path.to_string(), bytes.to_vec()))
                    .collect(),
                downloads,
                delays: HashMap::new(),
            }
        }

        pub(crate) fn with_delay(mut self, remote_path: &str, delay: Duration) -> Self {
            self.delays.insert(remote_path.to_string(), delay);
            self
        }
    }

    impl Transfer for FixtureTransfer {
        fn download(&mut self, remote_path: &str, dest: &Path) -> Result<(), UpstreamError> {
            if let Some(delay) = self.delays.get(remote_path) {
                std::thread::sleep(*delay);
            }
            self.downloads.fetch_add(1, Ordering::SeqCst);

            match self.files.get(remote_path) {
                Some(bytes) => {
                    std::fs::write(dest, bytes).map_err(|error| UpstreamError::Transfer {
                        path: remote_path.to_string(),
                        reason: error.to_string(),
                    })
                }
                None => Err(UpstreamError::Transfer {
                    path: remote_path.to_string(),
                    reason: "550 no such file".to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixtureTransfer;
    use super::*;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    struct RecordingTransfer {
        order: Arc<Mutex<Vec<String>>>,
    }

    impl Transfer for RecordingTransfer {
        fn download(&mut self, remote_path: &str, dest: &Path) -> Result<(), UpstreamError> {
            self.order.lock().unwrap().push(remote_path.to_string());
            std::fs::write(dest, b"x").map_err(|error| UpstreamError::Transfer {
                path: remote_path.to_string(),
                reason: error.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn downloads_run_in_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let client = UpstreamClient::spawn(
            RecordingTransfer {
                order: Arc::clone(&order),
            },
            Duration::from_secs(5),
        );

        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");
        let path_c = dir.path().join("c");
        let (a, b, c) = tokio::join!(
            client.download("/a.txt", &path_a),
            client.download("/b.txt", &path_b),
            client.download("/c.txt", &path_c),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["/a.txt", "/b.txt", "/c.txt"]);
    }

    #[tokio::test]
    async fn slow_download_times_out_with_the_remote_path() {
        let downloads = Arc::new(AtomicUsize::new(0));
        let transfer = FixtureTransfer::new([("/slow.mp4", b"data".as_slice())], downloads)
            .with_delay("/slow.mp4", Duration::from_millis(200));
        let client = UpstreamClient::spawn(transfer, Duration::from_millis(50));

        let dir = tempfile::tempdir().unwrap();
        let error = client
            .download("/slow.mp4", &dir.path().join("slow"))
            .await
            .unwrap_err();

        match error {
            UpstreamError::Timeout { path, .. } => assert_eq!(path, "/slow.mp4"),
            other => panic!("expected a timeout, got {other:?}"),
        }

        // Let the worker finish writing before the temp dir is torn down.
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    #[tokio::test]
    async fn failed_download_does_not_poison_the_queue() {
        let downloads = Arc::new(AtomicUsize::new(0));
        let transfer = FixtureTransfer::new(
            [("/present.txt", b"hello".as_slice())],
            Arc::clone(&downloads),
        );
        let client = UpstreamClient::spawn(transfer, Duration::from_secs(5));

        let dir = tempfile::tempdir().unwrap();
        let missing = client
            .download("/missing.txt", &dir.path().join("missing"))
            .await;
        assert!(matches!(missing, Err(UpstreamError::Transfer { .. })));

        let dest = dir.path().join("present");
        client.download("/present.txt", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
        assert_eq!(downloads.load(Ordering::SeqCst), 2);
    }
}

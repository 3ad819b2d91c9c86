use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::{
    process::Command,
    sync::{Mutex, Semaphore},
    time::timeout,
};
use tracing::{info, warn};

const PROBE_TIMEOUT_SECONDS: u64 = 30;
const ENCODE_TIMEOUT_SECONDS: u64 = 600;
const OUTPUT_SUFFIX: &str = "_h264.mp4";

#[derive(Debug, Clone, Error)]
pub enum TranscodeError {
    #[error("{tool} is not installed")]
    MissingTool { tool: &'static str },
    #[error("{tool} timed out on {path}")]
    ToolTimeout { tool: &'static str, path: String },
    #[error("{tool} failed on {path}: {reason}")]
    ToolFailed {
        tool: &'static str,
        path: String,
        reason: String,
    },
    #[error("filesystem error during transcode: {0}")]
    Filesystem(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    Nvenc,
    Software,
}

impl Encoder {
    fn codec_args(self) -> [&'static str; 4] {
        match self {
            Encoder::Nvenc => ["-c:v", "h264_nvenc", "-preset", "p4"],
            Encoder::Software => ["-c:v", "libx264", "-preset", "ultrafast"],
        }
    }
}

/// Pick the H.264 encoder once at startup: hardware when the installed
/// ffmpeg advertises NVENC, software otherwise.
pub async fn detect_encoder() -> Encoder {
    let listing = Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .output()
        .await;

    match listing {
        Ok(output) if output.status.success() => {
            encoder_from_listing(&String::from_utf8_lossy(&output.stdout))
        }
        _ => Encoder::Software,
    }
}

fn encoder_from_listing(listing: &str) -> Encoder {
    if listing.lines().any(|line| line.contains("h264_nvenc")) {
        Encoder::Nvenc
    } else {
        Encoder::Software
    }
}

/// Deterministic cache filename for a remote path: leading separators
/// stripped, remaining separators and whitespace runs replaced with `_`.
pub fn cache_file_name(remote_path: &str) -> String {
    let trimmed = remote_path.trim_start_matches(['/', '\\']);
    let mut base = String::with_capacity(trimmed.len());
    let mut in_whitespace = false;

    for ch in trimmed.chars() {
        if ch == '/' || ch == '\\' {
            base.push('_');
            in_whitespace = false;
        } else if ch.is_whitespace() {
            if !in_whitespace {
                base.push('_');
            }
            in_whitespace = true;
        } else {
            base.push(ch);
            in_whitespace = false;
        }
    }

    base.push_str(OUTPUT_SUFFIX);
    base
}

type TranscodeJob = Shared<BoxFuture<'static, Result<PathBuf, TranscodeError>>>;

/// Maps remote video paths to durable, browser-playable H.264 files under
/// the cache directory. The file on disk is the source of truth; the job map
/// only exists so concurrent requests for one key share a single encode. A
/// global admission limit of one keeps the encoder from thrashing when many
/// distinct videos are requested at once.
pub struct TranscodeCache {
    cache_dir: PathBuf,
    encoder: Encoder,
    jobs: Mutex<HashMap<String, TranscodeJob>>,
    gate: Semaphore,
}

impl TranscodeCache {
    pub fn new(cache_dir: PathBuf, encoder: Encoder) -> Self {
        Self {
            cache_dir,
            encoder,
            jobs: Mutex::new(HashMap::new()),
            gate: Semaphore::new(1),
        }
    }

    /// Final destination for a remote path, whether or not it exists yet.
    pub fn cached_output(&self, remote_path: &str) -> PathBuf {
        self.cache_dir.join(cache_file_name(remote_path))
    }

    /// Return a browser-playable copy of `raw`, converting it at most once.
    /// The remote path is trusted as a stable identity: an existing output
    /// file short-circuits with no re-probe, even if the remote file changed.
    pub async fn ensure_browser_playable(
        self: &Arc<Self>,
        raw: &Path,
        remote_path: &str,
    ) -> Result<PathBuf, TranscodeError> {
        let dst = self.cached_output(remote_path);
        if tokio::fs::try_exists(&dst).await.unwrap_or(false) {
            return Ok(dst);
        }

        let job = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get(remote_path) {
                Some(job) => job.clone(),
                None => {
                    let cache = Arc::clone(self);
                    let raw = raw.to_path_buf();
                    let dst = dst.clone();
                    let path = remote_path.to_string();
                    let job = async move {
                        let _permit = cache.gate.acquire().await.map_err(|_| {
                            TranscodeError::Filesystem("transcode gate closed".to_string())
                        })?;
                        cache.convert(&raw, &dst, &path).await
                    }
                    .boxed()
                    .shared();
                    jobs.insert(remote_path.to_string(), job.clone());
                    job
                }
            }
        };

        let result = job.await;
        self.jobs.lock().await.remove(remote_path);
        result
    }

    async fn convert(
        &self,
        src: &Path,
        dst: &Path,
        remote_path: &str,
    ) -> Result<PathBuf, TranscodeError> {
        let codec = probe_video_codec(src, remote_path).await?;
        let stream_copy = codec.as_deref() == Some("h264");

        // Encode into a sibling .part file and rename on success, so a failed
        // or interrupted encode never leaves a partial file at the final path.
        let part = dst.with_extension("part");

        let mut command = Command::new("ffmpeg");
        command
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(src);
        if stream_copy {
            command.args(["-c:v", "copy"]);
        } else {
            command.args(self.encoder.codec_args());
        }
        command
            .args(["-an", "-movflags", "+faststart", "-f", "mp4"])
            .arg(&part);

        info!(
            path = %remote_path,
            codec = codec.as_deref().unwrap_or("unknown"),
            stream_copy,
            "converting video"
        );

        if let Err(error) =
            run_tool("ffmpeg", &mut command, ENCODE_TIMEOUT_SECONDS, remote_path).await
        {
            if let Err(remove_error) = tokio::fs::remove_file(&part).await
                && remove_error.kind() != ErrorKind::NotFound
            {
                warn!("could not remove partial output {:?}: {remove_error}", part);
            }
            return Err(error);
        }

        tokio::fs::rename(&part, dst)
            .await
            .map_err(|error| TranscodeError::Filesystem(error.to_string()))?;

        Ok(dst.to_path_buf())
    }
}

/// Codec name of the first video stream, or `None` when the container has no
/// video stream at all.
async fn probe_video_codec(
    src: &Path,
    remote_path: &str,
) -> Result<Option<String>, TranscodeError> {
    let mut command = Command::new("ffprobe");
    command
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=codec_name",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(src);

    let output = run_tool("ffprobe", &mut command, PROBE_TIMEOUT_SECONDS, remote_path).await?;
    let codec = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToString::to_string);

    Ok(codec)
}

async fn run_tool(
    tool: &'static str,
    command: &mut Command,
    timeout_secs: u64,
    remote_path: &str,
) -> Result<std::process::Output, TranscodeError> {
    let output = timeout(Duration::from_secs(timeout_secs), command.output())
        .await
        .map_err(|_| TranscodeError::ToolTimeout {
            tool,
            path: remote_path.to_string(),
        })?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                TranscodeError::MissingTool { tool }
            } else {
                TranscodeError::ToolFailed {
                    tool,
                    path: remote_path.to_string(),
                    reason: error.to_string(),
                }
            }
        })?;

    if !output.status.success() {
        return Err(TranscodeError::ToolFailed {
            tool,
            path: remote_path.to_string(),
            reason: last_stderr_line(&output.stderr),
        });
    }

    Ok(output)
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("tool exited with a failure status")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_file_name_sanitizes_separators_and_whitespace() {
        assert_eq!(
            cache_file_name("/rt/noaa/ocean currents/movie.mp4"),
            "rt_noaa_ocean_currents_movie.mp4_h264.mp4"
        );
        assert_eq!(
            cache_file_name("//double//slash.mp4"),
            "double__slash.mp4_h264.mp4"
        );
        assert_eq!(
            cache_file_name("\\win\\style  name.mp4"),
            "win_style_name.mp4_h264.mp4"
        );
        assert_eq!(cache_file_name("plain.mp4"), "plain.mp4_h264.mp4");
    }

    #[test]
    fn encoder_detection_prefers_nvenc_when_listed() {
        let listing = " V....D h264_nvenc           NVIDIA NVENC H.264 encoder\n";
        assert_eq!(encoder_from_listing(listing), Encoder::Nvenc);
        assert_eq!(
            encoder_from_listing(" V..... libx264              H.264\n"),
            Encoder::Software
        );
    }

    #[tokio::test]
    async fn existing_output_short_circuits_without_touching_the_source() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(TranscodeCache::new(
            cache_dir.path().to_path_buf(),
            Encoder::Software,
        ));

        let dst = cache.cached_output("/videos/clip.mp4");
        tokio::fs::write(&dst, b"already transcoded").await.unwrap();

        // The raw path does not exist; any probe attempt would fail loudly.
        let resolved = cache
            .ensure_browser_playable(Path::new("/nonexistent/raw.mp4"), "/videos/clip.mp4")
            .await
            .unwrap();
        assert_eq!(resolved, dst);

        // Idempotent: a second call short-circuits the same way.
        let again = cache
            .ensure_browser_playable(Path::new("/nonexistent/raw.mp4"), "/videos/clip.mp4")
            .await
            .unwrap();
        assert_eq!(again, dst);
    }

    #[tokio::test]
    async fn failed_job_propagates_to_all_awaiters_and_allows_retry() {
        let cache_dir = tempfile::tempdir().unwrap();
        let raw_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(TranscodeCache::new(
            cache_dir.path().to_path_buf(),
            Encoder::Software,
        ));

        let raw = raw_dir.path().join("garbage.mp4");
        tokio::fs::write(&raw, b"this is not a video").await.unwrap();

        let (a, b) = tokio::join!(
            cache.ensure_browser_playable(&raw, "/videos/garbage.mp4"),
            cache.ensure_browser_playable(&raw, "/videos/garbage.mp4"),
        );
        assert!(a.is_err());
        assert!(b.is_err());

        // The failed job was removed, so a retry starts fresh and fails the
        // same way instead of replaying a stale shared result forever.
        assert!(cache.jobs.lock().await.is_empty());
        assert!(
            cache
                .ensure_browser_playable(&raw, "/videos/garbage.mp4")
                .await
                .is_err()
        );

        // No partial output may be left at the destination.
        let dst = cache.cached_output("/videos/garbage.mp4");
        assert!(!tokio::fs::try_exists(&dst).await.unwrap());
    }
}

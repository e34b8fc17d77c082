//! Streaming artifact download.
//!
//! Every artifact is fetched to a sibling `*.tmp.{suffix}` file while a
//! SHA-256 digest is computed over the stream.  The digest is what the
//! verify phase compares against the manifest; a corrupted download is never
//! resumed, only restarted.

use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use kiln_types::{Artifact, CoreError};

use crate::layout::CacheLayout;
use crate::progress::ProgressSender;

/// A downloaded-but-not-yet-verified artifact.
#[derive(Debug)]
pub struct FetchedArtifact {
    /// The `*.tmp.*` file holding the bytes.
    pub tmp_path: PathBuf,
    /// Final destination within the version directory.
    pub final_path: PathBuf,
    /// Lowercase hex digest computed over the download stream.
    pub digest: String,
}

/// HTTP fetcher for manifest artifacts.
#[derive(Clone)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
    base_url: String,
    retry_count: usize,
    retry_delay: Duration,
}

impl ArtifactFetcher {
    pub fn new(base_url: impl Into<String>, retry_count: usize, retry_delay: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("kiln-fetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            retry_count,
            retry_delay,
        }
    }

    /// Build the download URL for an artifact's relative path.
    pub fn artifact_url(&self, artifact: &Artifact) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            artifact.path.trim_start_matches('/')
        )
    }

    /// Download one artifact to a tmp file, retrying transport failures.
    ///
    /// `base_received` is the byte count of previously completed artifacts so
    /// the progress stream reports install-wide totals.  Cancellation is
    /// observed between chunks.
    pub async fn fetch(
        &self,
        artifact: &Artifact,
        version_dir: &Path,
        base_received: u64,
        progress: &mut ProgressSender,
        cancel: &watch::Receiver<bool>,
    ) -> Result<FetchedArtifact, CoreError> {
        let mut last_err = CoreError::download_failed(format!(
            "artifact '{}' could not be fetched",
            artifact.name
        ));
        for attempt in 0..self.retry_count.max(1) {
            match self
                .fetch_once(artifact, version_dir, base_received, progress, cancel)
                .await
            {
                Ok(fetched) => return Ok(fetched),
                Err(err) if !err.retriable() || err.code == kiln_types::ErrorCode::TaskCancelled => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        artifact = %artifact.name,
                        attempt,
                        error = %err,
                        "artifact fetch attempt failed"
                    );
                    last_err = err;
                    if attempt + 1 < self.retry_count.max(1) {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn fetch_once(
        &self,
        artifact: &Artifact,
        version_dir: &Path,
        base_received: u64,
        progress: &mut ProgressSender,
        cancel: &watch::Receiver<bool>,
    ) -> Result<FetchedArtifact, CoreError> {
        let url = self.artifact_url(artifact);
        let final_path = version_dir.join(&artifact.path);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::from_io("creating artifact directory", &e))?;
        }
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let tmp_path = CacheLayout::tmp_path(&final_path, &suffix);

        debug!(artifact = %artifact.name, url = %url, "fetching artifact");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                CoreError::download_failed(format!("GET {url} failed: {e}"))
            })?;

        let mut hasher = Sha256::new();
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| CoreError::from_io("creating tmp file", &e))?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        let result: Result<(), CoreError> = async {
            while let Some(chunk) = stream.next().await {
                if *cancel.borrow() {
                    return Err(CoreError::task_cancelled());
                }
                let chunk = chunk
                    .map_err(|e| CoreError::download_failed(format!("stream error: {e}")))?;
                hasher.update(&chunk);
                file.write_all(&chunk)
                    .await
                    .map_err(|e| CoreError::from_io("writing artifact bytes", &e))?;
                received += chunk.len() as u64;
                progress.on_bytes(base_received + received);
            }
            file.flush()
                .await
                .map_err(|e| CoreError::from_io("flushing artifact file", &e))?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        let digest = hasher.finalize();
        let digest = hex_encode(&digest[..]);
        Ok(FetchedArtifact {
            tmp_path,
            final_path,
            digest,
        })
    }
}

/// Streaming SHA-256 of a file on disk, as lowercase hex.
///
/// Synchronous; call from `spawn_blocking` on async paths.
pub(crate) fn sha256_hex_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(hex_encode(&digest[..]))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

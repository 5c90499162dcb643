use anyhow::{Context, Result, anyhow, bail};
use embedded_cassandra_core::{CassandraError, Version};
use futures::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{Client, Response, Url};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info};

/// Redirect hops followed before a candidate is given up
pub const MAX_REDIRECTS: usize = 10;

/// Sends a GET for `url`, following 3xx responses through their `Location`
/// header. Statuses from 400 up fail the request.
pub(crate) async fn open(client: &Client, url: Url) -> Result<Response> {
    let mut url = url;
    for _ in 0..=MAX_REDIRECTS {
        let response = client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to connect to {url}"))?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| anyhow!("HTTP ({status}) status for URL ({url}) has no Location"))?;
            let next = url
                .join(location)
                .with_context(|| format!("Invalid redirect location ({location}) from ({url})"))?;
            debug!(from = %url, to = %next, "Following redirect");
            url = next;
            continue;
        }
        if status.as_u16() >= 400 {
            bail!("HTTP ({status}) status for URL ({url}) is invalid");
        }
        return Ok(response);
    }
    bail!("Too many redirects (more than {MAX_REDIRECTS}), last location ({url})")
}

/// Last path segment of `url`.
pub fn file_name(url: &Url) -> Result<String, CassandraError> {
    url.path()
        .rsplit('/')
        .next()
        .filter(|name| !name.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            CassandraError::InvalidArgument(format!(
                "There is no way to determine a file name from ({url})"
            ))
        })
}

/// Streams the body of `response` into `file`. Returns the number of bytes
/// written.
pub(crate) async fn download(
    response: Response,
    version: &Version,
    file: &Path,
    progress_interval: Duration,
) -> Result<u64> {
    let url = response.url().clone();
    let total = response.content_length();
    let mut output = tokio::fs::File::create(file)
        .await
        .with_context(|| format!("Failed to create {}", file.display()))?;

    info!("Downloading Apache Cassandra ({version}) from ({url}).");
    let started = Instant::now();
    let progress = ProgressReporter::start(total, progress_interval);

    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.with_context(|| format!("Failed to read from ({url})"))?;
        output
            .write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", file.display()))?;
        written += chunk.len() as u64;
        progress.advance(chunk.len() as u64);
    }
    output.flush().await?;
    drop(progress);

    if written == 0 {
        bail!("Empty response body from ({url})");
    }
    info!(
        "Apache Cassandra ({version}) has been downloaded ({} ms)",
        started.elapsed().as_millis()
    );
    Ok(written)
}

/// Logs download progress at a fixed interval until dropped. Nothing is
/// reported when the total length is unknown.
struct ProgressReporter {
    downloaded: Arc<AtomicU64>,
    cancel: CancellationToken,
    /// Resolves to the number of progress lines logged
    task: Option<JoinHandle<u64>>,
}

impl ProgressReporter {
    fn start(total: Option<u64>, interval: Duration) -> Self {
        let downloaded = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let task = total.filter(|total| *total > 0).map(|total| {
            let downloaded = downloaded.clone();
            let cancel = cancel.clone();
            tokio::spawn(
                async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    let mut reports = 0u64;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {
                                let current = downloaded.load(Ordering::Relaxed);
                                info!("Downloaded {current} / {total}  {}%", current * 100 / total);
                                reports += 1;
                            }
                        }
                    }
                    reports
                }
                .in_current_span(),
            )
        });
        Self {
            downloaded,
            cancel,
            task,
        }
    }

    fn advance(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Per-download scratch directory, removed on drop unless kept.
pub(crate) struct Scratch {
    directory: PathBuf,
    keep: bool,
}

impl Scratch {
    pub(crate) async fn create(root: &Path) -> Result<Self> {
        let directory = root.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("Failed to create {}", directory.display()))?;
        Ok(Self {
            directory,
            keep: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.directory
    }

    pub(crate) fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = std::fs::remove_dir_all(&self.directory) {
                debug!("Could not remove {}: {e}", self.directory.display());
            }
        }
    }
}

//! Download and local caching of Apache Cassandra distributions.

mod remote;

pub use remote::{MAX_REDIRECTS, file_name};

use anyhow::Context;
use embedded_cassandra_core::{ArtifactRequest, CassandraError, ResolutionAttempt, Version};
use remote::Scratch;
use reqwest::{Client, Url, redirect};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A distribution archive available on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub version: Version,
    pub path: PathBuf,
}

/// Resolves an [`ArtifactRequest`] to a local archive, downloading it from
/// the first candidate URL that works.
///
/// A file already present in the target directory under the derived name is
/// trusted as a finished download. Concurrent resolutions of the same version
/// into the same directory are not locked against each other; the last
/// rename wins.
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    scratch: PathBuf,
    progress_interval: Duration,
}

impl Default for ArtifactResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactResolver {
    pub fn new() -> Self {
        Self {
            scratch: std::env::temp_dir().join("embedded-cassandra"),
            progress_interval: Duration::from_secs(3),
        }
    }

    /// Directory holding the per-download scratch directories
    pub fn with_scratch_directory(mut self, scratch: impl Into<PathBuf>) -> Self {
        self.scratch = scratch.into();
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub async fn resolve(
        &self,
        request: &ArtifactRequest,
    ) -> Result<CachedArtifact, CassandraError> {
        let client = build_client(request)?;
        let directory = std::path::absolute(&request.directory)?;

        let mut attempts = Vec::new();
        for candidate in request.candidate_urls() {
            match self
                .resolve_candidate(&client, request, &directory, &candidate)
                .await
            {
                Ok(path) => {
                    return Ok(CachedArtifact {
                        version: request.version.clone(),
                        path,
                    });
                }
                Err(e) => {
                    warn!(
                        "Could not resolve Apache Cassandra ({}) from ({candidate}): {e:#}",
                        request.version
                    );
                    attempts.push(ResolutionAttempt {
                        url: candidate,
                        cause: format!("{e:#}"),
                    });
                }
            }
        }

        Err(CassandraError::Resolution {
            version: request.version.clone(),
            attempts,
        })
    }

    async fn resolve_candidate(
        &self,
        client: &Client,
        request: &ArtifactRequest,
        directory: &Path,
        candidate: &str,
    ) -> anyhow::Result<PathBuf> {
        let url = Url::parse(candidate).with_context(|| format!("Invalid URL ({candidate})"))?;

        // Cache hit by the candidate's own name needs no network round trip
        if let Some(cached) = cached_file(directory, &url).await {
            return Ok(cached);
        }

        let response = remote::open(client, url).await?;
        let name = file_name(response.url())?;
        let target = directory.join(&name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            debug!("Using cached artifact {}", target.display());
            return Ok(target);
        }

        let mut scratch = Scratch::create(&self.scratch).await?;
        let temporary = scratch.path().join(&name);
        remote::download(response, &request.version, &temporary, self.progress_interval).await?;

        match cache(&temporary, &target).await {
            Ok(()) => Ok(target),
            Err(e) => {
                warn!(
                    "Could not rename ({}) as ({}): {e:#}",
                    temporary.display(),
                    target.display()
                );
                scratch.keep();
                Ok(temporary)
            }
        }
    }
}

async fn cached_file(directory: &Path, url: &Url) -> Option<PathBuf> {
    let name = file_name(url).ok()?;
    let file = directory.join(name);
    tokio::fs::try_exists(&file)
        .await
        .unwrap_or(false)
        .then(|| {
            debug!("Using cached artifact {}", file.display());
            file
        })
}

async fn cache(temporary: &Path, target: &Path) -> anyhow::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(temporary, target).await?;
    info!("Cached artifact at {}", target.display());
    Ok(())
}

fn build_client(request: &ArtifactRequest) -> Result<Client, CassandraError> {
    let mut builder = Client::builder().redirect(redirect::Policy::none());

    if let Some(timeout) = request.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(timeout) = request.read_timeout {
        builder = builder.read_timeout(timeout);
    }
    builder = match &request.proxy {
        Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| {
            CassandraError::InvalidArgument(format!("Proxy ({proxy}) is invalid: {e}"))
        })?),
        None => builder.no_proxy(),
    };

    builder.build().map_err(|e| {
        CassandraError::Other(anyhow::Error::new(e).context("Failed to build HTTP client"))
    })
}

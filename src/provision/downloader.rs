//! Mirror-aware archive downloads.
//!
//! Redirects are walked by hand (the client is built with redirects disabled)
//! so every hop is logged and counted, and so a cap can be configured when a
//! mirror misbehaves. A download only counts as successful once the file on
//! disk is at least the configured minimum size; anything smaller is almost
//! always an HTML error page served with a 200.

use futures_util::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{StatusCode, Url};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::config::DownloadConfig;
use crate::events::EventSink;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("invalid download URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to download, HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("redirect from {url} has no usable Location header")]
    BadRedirect { url: String },

    #[error("gave up on {url} after {limit} redirects")]
    TooManyRedirects { url: String, limit: usize },

    #[error("file from {url} is too small ({size} bytes, need {minimum}); likely an error page")]
    Undersized { url: String, size: u64, minimum: u64 },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no download sources configured")]
    NoCandidates,

    #[error("all {attempts} download sources failed; last error: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<DownloadError>,
    },
}

impl DownloadError {
    /// True when the bytes arrived but cannot be trusted
    pub fn is_integrity(&self) -> bool {
        match self {
            DownloadError::Undersized { .. } => true,
            DownloadError::Exhausted { last, .. } => last.is_integrity(),
            _ => false,
        }
    }
}

/// One archive to fetch from an ordered list of mirrors
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub candidates: Vec<String>,
    pub destination: PathBuf,
    pub min_size_bytes: u64,
}

/// Where a successful download actually came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    /// Index into `DownloadTask::candidates` of the mirror that worked
    pub candidate_index: usize,
    /// URL the body was finally served from
    pub final_url: String,
    pub redirects: usize,
    pub bytes: u64,
}

pub struct Downloader {
    client: reqwest::Client,
    max_redirects: Option<usize>,
}

impl Downloader {
    pub fn new(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(DownloadError::Client)?;

        Ok(Self {
            client,
            max_redirects: config.max_redirects,
        })
    }

    /// Fetch `task` into its destination, falling back through the mirrors in order.
    ///
    /// The destination never survives a failed attempt.
    #[instrument(skip_all, fields(dest = %task.destination.display()))]
    pub async fn fetch(
        &self,
        task: &DownloadTask,
        events: &EventSink,
    ) -> Result<DownloadReport, DownloadError> {
        if task.candidates.is_empty() {
            return Err(DownloadError::NoCandidates);
        }

        if let Some(parent) = task.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DownloadError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let mut last_error = None;
        for (index, url) in task.candidates.iter().enumerate() {
            let status = if index == 0 {
                "Connecting to primary server..."
            } else {
                "Trying fallback mirror..."
            };
            events.status(Some(0.0), status);

            match self
                .fetch_one(url, &task.destination, task.min_size_bytes, events)
                .await
            {
                Ok(mut report) => {
                    report.candidate_index = index;
                    info!(
                        url = %report.final_url,
                        bytes = report.bytes,
                        redirects = report.redirects,
                        "Download complete"
                    );
                    return Ok(report);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Download source failed");
                    discard(&task.destination).await;
                    last_error = Some(e);
                }
            }
        }

        Err(DownloadError::Exhausted {
            attempts: task.candidates.len(),
            last: Box::new(last_error.unwrap_or(DownloadError::NoCandidates)),
        })
    }

    async fn fetch_one(
        &self,
        url: &str,
        destination: &Path,
        min_size: u64,
        events: &EventSink,
    ) -> Result<DownloadReport, DownloadError> {
        let (response, final_url, redirects) = self.resolve(url).await?;
        let total = response.content_length().filter(|len| *len > 0);

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|source| write_error(destination, source))?;

        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| DownloadError::Network {
                url: final_url.clone(),
                source,
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|source| write_error(destination, source))?;
            received += chunk.len() as u64;

            if let Some(total) = total {
                events.progress(received, total, "Downloading...");
            }
        }
        file.flush()
            .await
            .map_err(|source| write_error(destination, source))?;
        drop(file);

        let size = tokio::fs::metadata(destination)
            .await
            .map_err(|source| write_error(destination, source))?
            .len();
        if size < min_size {
            return Err(DownloadError::Undersized {
                url: final_url,
                size,
                minimum: min_size,
            });
        }

        Ok(DownloadReport {
            candidate_index: 0,
            final_url,
            redirects,
            bytes: size,
        })
    }

    /// Issue GETs, following 301/302/303/307/308 until a final response arrives
    async fn resolve(
        &self,
        url: &str,
    ) -> Result<(reqwest::Response, String, usize), DownloadError> {
        let mut current = Url::parse(url).map_err(|e| DownloadError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let mut redirects = 0;

        loop {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|source| DownloadError::Network {
                    url: current.to_string(),
                    source,
                })?;
            let status = response.status();

            if is_followed_redirect(status) {
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|location| current.join(location).ok())
                    .ok_or_else(|| DownloadError::BadRedirect {
                        url: current.to_string(),
                    })?;

                redirects += 1;
                if let Some(limit) = self.max_redirects {
                    if redirects > limit {
                        return Err(DownloadError::TooManyRedirects {
                            url: url.to_string(),
                            limit,
                        });
                    }
                }

                debug!(from = %current, to = %next, status = status.as_u16(), "Following redirect");
                current = next;
                continue;
            }

            if status != StatusCode::OK {
                return Err(DownloadError::Status {
                    url: current.to_string(),
                    status: status.as_u16(),
                });
            }

            return Ok((response, current.to_string(), redirects));
        }
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn write_error(path: &Path, source: io::Error) -> DownloadError {
    DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Remove a partial or rejected download, ignoring a missing file
async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove rejected download");
        }
    }
}

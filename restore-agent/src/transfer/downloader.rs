//! HTTP artifact store: retrying downloads and HEAD probes.

use super::progress::{format_bytes, format_duration, format_speed, ProgressTracker};
use super::progress_stream::ProgressStream;
use crate::config::DownloadConfig;
use crate::utils::{RestoreError, Result};
use futures_util::StreamExt;
use reqwest::StatusCode;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often a running download logs its progress
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Result of probing the store for an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present { size: Option<u64> },
    Absent,
}

/// Remote store holding backup archives.
pub trait ArtifactStore: Send + Sync {
    /// Probe for `url` without transferring it. A missing artifact is
    /// [`Presence::Absent`], not an error.
    fn exists(&self, url: &str) -> impl Future<Output = Result<Presence>> + Send;

    /// Fetch `url` into `dest`, returning the size of the staged file.
    ///
    /// Does nothing when `dest` already exists.
    fn download(&self, url: &str, dest: &Path) -> impl Future<Output = Result<u64>> + Send;
}

/// [`ArtifactStore`] backed by plain HTTP GET/HEAD requests
pub struct HttpDownloader {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl HttpDownloader {
    pub fn new(config: &DownloadConfig, cancel: CancellationToken) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            timeout: config.timeout(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            cancel,
        })
    }

    /// One GET, streamed straight into `dest`.
    async fn attempt(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RestoreError::http(format!("GET {}", url), self.timeout, e))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(RestoreError::Connection(format!(
                "GET {} returned status {}",
                url, status
            )));
        }

        let total = response.content_length().unwrap_or(0);
        info!(url, dest = %dest.display(), size = %format_bytes(total), "Starting download");

        let tracker = Arc::new(ProgressTracker::new(total));
        let progress_tracker = Arc::clone(&tracker);
        let mut stream = ProgressStream::new(
            response.bytes_stream(),
            PROGRESS_INTERVAL,
            Arc::new(move |transferred| {
                let progress = progress_tracker.snapshot(transferred);
                info!(
                    percent = progress.percent_complete.unwrap_or(0.0),
                    transferred = %format_bytes(progress.transferred_bytes),
                    total = %format_bytes(progress.total_bytes),
                    speed = %format_speed(progress.bytes_per_second),
                    eta_secs = progress.eta_seconds,
                    "Download progress"
                );
            }),
        );

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RestoreError::http(format!("GET {}", url), self.timeout, e))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let written = stream.bytes_transferred();
        info!(
            dest = %dest.display(),
            size = %format_bytes(written),
            elapsed = %format_duration(tracker.elapsed()),
            "Download complete"
        );
        Ok(written)
    }
}

impl ArtifactStore for HttpDownloader {
    async fn exists(&self, url: &str) -> Result<Presence> {
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(RestoreError::Cancelled(format!("HEAD {}", url)));
            }
            response = self.client.head(url).send() => {
                response.map_err(|e| RestoreError::http(format!("HEAD {}", url), self.timeout, e))?
            }
        };

        match response.status() {
            StatusCode::OK => {
                // HEAD responses carry no body, so read the header directly
                let size = response
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                debug!(url, ?size, "Artifact present");
                Ok(Presence::Present { size })
            }
            StatusCode::NOT_FOUND => Ok(Presence::Absent),
            status => Err(RestoreError::Connection(format!(
                "HEAD {} returned status {}",
                url, status
            ))),
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Ok(metadata) = tokio::fs::metadata(dest).await {
            info!(
                dest = %dest.display(),
                size = %format_bytes(metadata.len()),
                "File already staged, skipping download"
            );
            return Ok(metadata.len());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    Err(RestoreError::Cancelled(format!("download of {}", url)))
                }
                result = self.attempt(url, dest) => result,
            };

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    // Never leave a truncated archive behind: the next run
                    // would short-circuit on it.
                    let _ = tokio::fs::remove_file(dest).await;
                    if e.is_cancelled() {
                        return Err(e);
                    }
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Download attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < self.max_retries {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        return Err(RestoreError::Cancelled(format!("download of {}", url)));
                    }
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        let source = last_error
            .unwrap_or_else(|| RestoreError::Config("download.max_retries must be at least 1".to_string()));
        Err(RestoreError::DownloadExhausted {
            attempts: self.max_retries,
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn downloader(max_retries: u32) -> HttpDownloader {
        let config = DownloadConfig {
            max_retries,
            retry_delay_secs: 0,
            timeout_secs: 10,
        };
        HttpDownloader::new(&config, CancellationToken::new()).unwrap()
    }

    #[tokio::test]
    async fn test_exists_reports_size() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("HEAD", "/emsau_iotdb-0_20240101123501.tar.gz")
            .with_status(200)
            .with_header("content-length", "4096")
            .create_async()
            .await;

        let url = format!("{}/emsau_iotdb-0_20240101123501.tar.gz", server.url());
        let presence = downloader(1).exists(&url).await.unwrap();

        assert_eq!(presence, Presence::Present { size: Some(4096) });
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_exists_maps_404_to_absent() {
        let mut server = mockito::Server::new_async().await;
        server.mock("HEAD", "/missing.tar.gz").with_status(404).create_async().await;

        let url = format!("{}/missing.tar.gz", server.url());
        assert_eq!(downloader(1).exists(&url).await.unwrap(), Presence::Absent);
    }

    #[tokio::test]
    async fn test_exists_rejects_other_statuses() {
        let mut server = mockito::Server::new_async().await;
        server.mock("HEAD", "/forbidden.tar.gz").with_status(403).create_async().await;

        let url = format!("{}/forbidden.tar.gz", server.url());
        let err = downloader(1).exists(&url).await.unwrap_err();
        assert!(matches!(err, RestoreError::Connection(ref msg) if msg.contains("403")));
    }

    #[tokio::test]
    async fn test_download_writes_body() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![7u8; 100_000];
        server
            .mock("GET", "/backup.tar.gz")
            .with_status(200)
            .with_body(body.clone())
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested").join("backup.tar.gz");
        let url = format!("{}/backup.tar.gz", server.url());

        let size = downloader(3).download(&url, &dest).await.unwrap();

        assert_eq!(size, 100_000);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_download_skips_existing_destination() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/backup.tar.gz").expect(0).create_async().await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("backup.tar.gz");
        std::fs::write(&dest, b"stale but present").unwrap();
        let url = format!("{}/backup.tar.gz", server.url());

        let size = downloader(3).download(&url, &dest).await.unwrap();

        assert_eq!(size, 17);
        assert_eq!(std::fs::read(&dest).unwrap(), b"stale but present");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_retries_then_wraps_last_cause() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/backup.tar.gz")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("backup.tar.gz");
        let url = format!("{}/backup.tar.gz", server.url());

        let err = downloader(3).download(&url, &dest).await.unwrap_err();

        match err {
            RestoreError::DownloadExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("503"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!dest.exists());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_recovers_on_later_attempt() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/backup.tar.gz")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;
        let healthy = server
            .mock("GET", "/backup.tar.gz")
            .with_status(200)
            .with_body("archive")
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("backup.tar.gz");
        let url = format!("{}/backup.tar.gz", server.url());

        let size = downloader(3).download(&url, &dest).await.unwrap();

        assert_eq!(size, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive");
        failing.assert_async().await;
        healthy.assert_async().await;
    }

    /// Accepts connections and never answers them.
    async fn silent_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_exists_deadline_is_a_timeout() {
        let config = DownloadConfig {
            max_retries: 1,
            retry_delay_secs: 0,
            timeout_secs: 1,
        };
        let store = HttpDownloader::new(&config, CancellationToken::new()).unwrap();
        let url = format!("{}/backup.tar.gz", silent_server().await);

        let err = store.exists(&url).await.unwrap_err();

        assert!(err.is_timeout(), "{err:?}");
    }

    #[tokio::test]
    async fn test_download_deadline_is_the_wrapped_cause() {
        let config = DownloadConfig {
            max_retries: 1,
            retry_delay_secs: 0,
            timeout_secs: 1,
        };
        let store = HttpDownloader::new(&config, CancellationToken::new()).unwrap();
        let dir = TempDir::new().unwrap();
        let url = format!("{}/backup.tar.gz", silent_server().await);

        let err = store.download(&url, &dir.path().join("backup.tar.gz")).await.unwrap_err();

        match err {
            RestoreError::DownloadExhausted { source, .. } => assert!(source.is_timeout(), "{source:?}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_download_cancelled_before_start() {
        let server = mockito::Server::new_async().await;
        let cancel = CancellationToken::new();
        let config = DownloadConfig {
            max_retries: 3,
            retry_delay_secs: 0,
            timeout_secs: 10,
        };
        let store = HttpDownloader::new(&config, cancel.clone()).unwrap();
        cancel.cancel();

        let dir = TempDir::new().unwrap();
        let url = format!("{}/backup.tar.gz", server.url());
        let err = store.download(&url, &dir.path().join("backup.tar.gz")).await.unwrap_err();

        assert!(err.is_cancelled());
    }
}

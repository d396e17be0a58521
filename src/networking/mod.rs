use std::path::Path;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::header::HeaderMap;
use reqwest::{Client, Url};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::config::Settings;
use crate::error::{Result, SyncError};
use crate::util::{backoff_delay, format_speed};

pub mod table;
pub mod update_server;

pub use table::{BackendClient, TableQuery};
pub use update_server::UpdateServer;

const USER_AGENT: &str = concat!("lobby-sync/", env!("CARGO_PKG_VERSION"));

/// HTTP plumbing shared by every remote: short-lived checks and long downloads
/// use separate clients so a stalled transfer never holds a check hostage.
#[derive(Clone)]
pub struct NetworkClient {
    client: Client,
    download_client: Client,
}

impl NetworkClient {
    pub fn new(settings: &Settings) -> Self {
        let client = Client::builder()
            .timeout(settings.check_timeout())
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        // Downloads are bounded per read, not in total: videos take minutes.
        let download_client = Client::builder()
            .connect_timeout(settings.download_timeout())
            .read_timeout(settings.download_timeout())
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default download client ({err})");
                Client::new()
            });
        Self {
            client,
            download_client,
        }
    }

    pub async fn get_json(&self, url: Url, headers: HeaderMap) -> Result<Value> {
        let response = self
            .client
            .get(url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("GET {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| SyncError::transient(format!("GET {url} bad status: {e}")))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| SyncError::transient(format!("GET {url} returned malformed JSON: {e}")))
    }

    pub async fn post(&self, url: Url) -> Result<()> {
        self.client
            .post(url.clone())
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("POST {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| SyncError::transient(format!("POST {url} bad status: {e}")))?;
        Ok(())
    }

    pub async fn patch_json(&self, url: Url, headers: HeaderMap, body: &Value) -> Result<()> {
        self.client
            .patch(url.clone())
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("PATCH {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| SyncError::transient(format!("PATCH {url} bad status: {e}")))?;
        Ok(())
    }

    /// Stream `url` into `dest` chunk by chunk and return the byte count.
    /// `dest` is created or truncated; the caller decides where it lives.
    pub async fn download_to_path(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self
            .download_client
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("download request failed: {e}")))?
            .error_for_status()
            .map_err(|e| SyncError::transient(format!("download status error: {e}")))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(dest).await?;

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let started = Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SyncError::transient(format!("stream error: {e}")))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        let elapsed = started.elapsed().max(Duration::from_millis(1)).as_secs_f32();
        debug!(
            "download: {} bytes from {url} at {}",
            downloaded,
            format_speed(downloaded as f32 / elapsed)
        );

        if let Some(total) = total
            && downloaded < total
        {
            return Err(SyncError::transient(format!(
                "download incomplete: received {downloaded} of {total} bytes"
            )));
        }
        Ok(downloaded)
    }

    /// `download_to_path` with bounded retry and linear backoff. Partial
    /// output is removed after every failed attempt.
    pub async fn download_with_retry(
        &self,
        url: &str,
        dest: &Path,
        attempts: u32,
        backoff: Duration,
    ) -> Result<u64> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.download_to_path(url, dest).await {
                Ok(bytes) if bytes > 0 => return Ok(bytes),
                Ok(_) => {
                    let _ = tokio::fs::remove_file(dest).await;
                    if attempt >= attempts {
                        return Err(SyncError::validation(dest, "empty download"));
                    }
                }
                Err(err) => {
                    let _ = tokio::fs::remove_file(dest).await;
                    if attempt >= attempts {
                        return Err(err);
                    }
                    warn!("download: attempt {attempt}/{attempts} for {url} failed: {err}");
                }
            }
            tokio::time::sleep(backoff_delay(backoff, attempt)).await;
            attempt += 1;
        }
    }
}

/// Public object-storage URL for `key` inside `bucket`.
pub fn object_url(bucket: &str, region: &str, prefix: &str, key: &str) -> String {
    format!("https://{bucket}.s3.{region}.amazonaws.com/{prefix}{key}")
}

/// Join `segments` onto `base`, percent-encoding each one.
pub fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| SyncError::Config(format!("invalid base URL {base:?}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| SyncError::Config(format!("base URL {base:?} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{Value, json};

use crate::archive;
use crate::config::{FeedSpec, ScreenConfig, SourceSpec};
use crate::engine::models::{Fetched, RemoteManifest, VersionToken};
use crate::env::AppPaths;
use crate::error::{Result, SyncError};
use crate::networking::{BackendClient, TableQuery, UpdateServer};
use crate::util::sha256_hex;

/// Name of the manifest shipped inside a content bundle.
pub const BUNDLE_MANIFEST: &str = "update.json";

/// Where a feed's manifest and version token come from.
pub trait ManifestSource {
    /// Ask the remote for the feed's manifest. `Fetched::Current` means the
    /// remote token does not supersede `local`.
    async fn fetch(&self, feed: &FeedSpec, local: Option<&VersionToken>) -> Result<Fetched>;

    /// Acknowledge a persisted version, for sources that track installs.
    async fn confirm(&self, feed: &FeedSpec, token: &VersionToken) -> Result<()>;
}

/// The document entries are read from, given what was last published.
pub fn document_of(feed: &FeedSpec, published: &Value) -> Option<Value> {
    match &feed.source {
        SourceSpec::TableSnapshot { publish_key, .. } => published.get(publish_key).cloned(),
        _ => Some(published.clone()),
    }
}

pub struct BackendSource {
    server: UpdateServer,
    backend: BackendClient,
    paths: AppPaths,
    screen: ScreenConfig,
    attempts: u32,
    backoff: Duration,
}

impl BackendSource {
    pub fn new(
        server: UpdateServer,
        backend: BackendClient,
        paths: AppPaths,
        screen: ScreenConfig,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            server,
            backend,
            paths,
            screen,
            attempts,
            backoff,
        }
    }

    async fn fetch_bundle(&self, feed: &FeedSpec, local: Option<&VersionToken>) -> Result<Fetched> {
        let current = match local {
            Some(VersionToken::Number(n)) => *n,
            _ => feed.baseline,
        };
        let check = self.server.check_update(self.screen.client_id, current).await?;
        let Some((version, url)) = check.release()? else {
            debug!("feed[{}]: update server reports nothing newer than v{current}", feed.name);
            return Ok(Fetched::Current);
        };
        let token = VersionToken::Number(version);
        if !token.supersedes(local) {
            return Ok(Fetched::Current);
        }
        info!("feed[{}]: bundle v{version} available (local v{current})", feed.name);

        let zip_path = self.paths.cache_file(&format!("update_{version}.zip"));
        let staging = self.paths.staging_dir(&feed.name);
        let result = self.unpack_bundle(url, &zip_path, &staging).await;
        let _ = tokio::fs::remove_file(&zip_path).await;
        let document = match result {
            Ok(document) => document,
            Err(err) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(err);
            }
        };
        Ok(Fetched::Manifest(RemoteManifest {
            token,
            published: document.clone(),
            document,
            bundle: Some(staging),
        }))
    }

    async fn unpack_bundle(&self, url: &str, zip_path: &Path, staging: &Path) -> Result<Value> {
        self.server
            .net()
            .download_with_retry(url, zip_path, self.attempts, self.backoff)
            .await?;
        let (archive_path, dest): (PathBuf, PathBuf) = (zip_path.to_path_buf(), staging.to_path_buf());
        tokio::task::spawn_blocking(move || archive::extract_zip(&archive_path, &dest))
            .await
            .map_err(|e| SyncError::transient(format!("extract task failed: {e}")))??;

        let manifest_path = staging.join(BUNDLE_MANIFEST);
        // Without the manifest every local asset would look orphaned.
        let bytes = tokio::fs::read(&manifest_path)
            .await
            .map_err(|_| SyncError::validation(&manifest_path, "bundle has no update.json"))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::validation(&manifest_path, format!("malformed manifest: {e}")))
    }

    async fn fetch_latest_row(
        &self,
        feed: &FeedSpec,
        local: Option<&VersionToken>,
        table: &str,
        version_column: &str,
        payload_column: &str,
    ) -> Result<Fetched> {
        let query = TableQuery::new(table)
            .select([version_column, payload_column])
            .order(version_column, true)
            .limit(1);
        let rows = self.backend.select(&query).await?;
        let Some(row) = rows.first() else {
            return Ok(Fetched::Empty);
        };
        let version = row.get(version_column).and_then(integer).ok_or_else(|| {
            SyncError::transient(format!("{table}: row without a numeric {version_column}"))
        })?;
        let token = VersionToken::Number(version);
        if !token.supersedes(local) {
            debug!("feed[{}]: {table} still at v{version}", feed.name);
            return Ok(Fetched::Current);
        }
        info!("feed[{}]: {table} row v{version} is new", feed.name);
        let document = payload(row, payload_column)?;
        Ok(Fetched::Manifest(RemoteManifest {
            token,
            published: document.clone(),
            document,
            bundle: None,
        }))
    }

    async fn fetch_snapshot(
        &self,
        local: Option<&VersionToken>,
        spec: SnapshotColumns<'_>,
    ) -> Result<Fetched> {
        let query = TableQuery::new(spec.table)
            .select([spec.payload_column, spec.timestamp_column])
            .eq(spec.filter_column, spec.filter_value)
            .limit(1);
        let rows = self.backend.select(&query).await?;
        let Some(row) = rows.first() else {
            return Ok(Fetched::Empty);
        };
        let stamp = row.get(spec.timestamp_column).and_then(text).ok_or_else(|| {
            SyncError::transient(format!("{}: row without {}", spec.table, spec.timestamp_column))
        })?;
        let token = VersionToken::Timestamp(stamp.clone());
        if !token.supersedes(local) {
            return Ok(Fetched::Current);
        }
        let document = payload(row, spec.payload_column)?;
        let mut published = serde_json::Map::new();
        published.insert(spec.publish_key.to_owned(), document.clone());
        published.insert("atualizado_em".to_owned(), Value::String(stamp));
        Ok(Fetched::Manifest(RemoteManifest {
            token,
            document,
            published: Value::Object(published),
            bundle: None,
        }))
    }

    async fn fetch_cameras(&self, local: Option<&VersionToken>, table: &str) -> Result<Fetched> {
        let query = TableQuery::new(table)
            .select(["url", "data_criacao"])
            .eq("cliente_id", self.screen.client_id)
            .order("data_criacao", true);
        let rows = self.backend.select(&query).await?;
        let Some(newest) = rows.first() else {
            return Ok(Fetched::Empty);
        };
        let created = newest.get("data_criacao").and_then(text).unwrap_or_default();
        let token = VersionToken::Timestamp(created.clone());
        if !token.supersedes(local) {
            return Ok(Fetched::Current);
        }
        let urls: Vec<Value> = rows
            .iter()
            .filter_map(|row| row.get("url").and_then(Value::as_str))
            .map(|url| Value::String(url.to_owned()))
            .collect();
        let published = json!({
            "url": urls.first().cloned().unwrap_or(Value::Null),
            "urls": urls,
            "data_criacao": created,
        });
        Ok(Fetched::Manifest(RemoteManifest {
            token,
            document: published.clone(),
            published,
            bundle: None,
        }))
    }

    async fn fetch_weather(&self, local: Option<&VersionToken>) -> Result<Fetched> {
        let payload = self.server.weather(self.screen.client_id).await?;
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| SyncError::transient(format!("weather payload not encodable: {e}")))?;
        let token = VersionToken::Fingerprint(sha256_hex(&bytes));
        if !token.supersedes(local) {
            return Ok(Fetched::Current);
        }
        Ok(Fetched::Manifest(RemoteManifest {
            token,
            document: payload.clone(),
            published: payload,
            bundle: None,
        }))
    }
}

struct SnapshotColumns<'a> {
    table: &'a str,
    filter_column: &'a str,
    filter_value: &'a str,
    payload_column: &'a str,
    timestamp_column: &'a str,
    publish_key: &'a str,
}

impl ManifestSource for BackendSource {
    async fn fetch(&self, feed: &FeedSpec, local: Option<&VersionToken>) -> Result<Fetched> {
        match &feed.source {
            SourceSpec::UpdateBundle => self.fetch_bundle(feed, local).await,
            SourceSpec::TableLatest {
                table,
                version_column,
                payload_column,
            } => {
                self.fetch_latest_row(feed, local, table, version_column, payload_column)
                    .await
            }
            SourceSpec::TableSnapshot {
                table,
                filter_column,
                filter_value,
                payload_column,
                timestamp_column,
                publish_key,
            } => {
                let columns = SnapshotColumns {
                    table,
                    filter_column,
                    filter_value,
                    payload_column,
                    timestamp_column,
                    publish_key,
                };
                self.fetch_snapshot(local, columns).await
            }
            SourceSpec::CameraRegistry { table } => self.fetch_cameras(local, table).await,
            SourceSpec::Weather => self.fetch_weather(local).await,
        }
    }

    async fn confirm(&self, feed: &FeedSpec, token: &VersionToken) -> Result<()> {
        if feed.source != SourceSpec::UpdateBundle {
            return Ok(());
        }
        self.server.confirm_update(self.screen.client_id).await?;
        info!("feed[{}]: confirmed {token} to the update server", feed.name);
        Ok(())
    }
}

fn integer(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Payload columns are stored either as JSON or as JSON-encoded text.
fn payload(row: &Value, column: &str) -> Result<Value> {
    match row.get(column) {
        Some(Value::String(raw)) => serde_json::from_str(raw).map_err(|e| {
            warn!("backend: {column} holds text that is not JSON");
            SyncError::transient(format!("{column} is not valid JSON: {e}"))
        }),
        Some(Value::Null) | None => Err(SyncError::transient(format!("row has no {column}"))),
        Some(value) => Ok(value.clone()),
    }
}

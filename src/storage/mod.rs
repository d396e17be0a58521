use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde_json::Value;
use tokio::fs;
use walkdir::WalkDir;

use crate::config::{FeedSpec, SourceSpec};
use crate::engine::models::{VersionRecord, VersionToken};
use crate::env::AppPaths;
use crate::error::Result;

/// Suffix of in-flight downloads and manifest writes.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Per-feed cache state: version records, published manifests and asset trees.
#[derive(Clone, Debug)]
pub struct StorageManager {
    cache_dir: PathBuf,
}

impl StorageManager {
    pub fn new(paths: &AppPaths) -> Self {
        Self {
            cache_dir: paths.cache_dir(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn version_path(&self, feed: &FeedSpec) -> PathBuf {
        self.cache_dir.join(&feed.version_file)
    }

    pub fn manifest_path(&self, feed: &FeedSpec) -> PathBuf {
        self.cache_dir.join(&feed.manifest_file)
    }

    pub fn asset_root(&self, feed: &FeedSpec) -> Option<PathBuf> {
        feed.asset_root.as_deref().map(|root| self.cache_dir.join(root))
    }

    /// The feed's "never synced" marker when nothing usable is on disk.
    pub fn baseline(feed: &FeedSpec) -> Option<VersionToken> {
        match feed.source {
            SourceSpec::UpdateBundle | SourceSpec::TableLatest { .. } => {
                Some(VersionToken::Number(feed.baseline))
            }
            _ => None,
        }
    }

    /// Read failures and absence both mean "never synced"; this never errors.
    pub async fn read_version(&self, feed: &FeedSpec) -> Option<VersionToken> {
        let path = self.version_path(feed);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(_) => return Self::baseline(feed),
        };
        match serde_json::from_slice::<VersionRecord>(&bytes) {
            Ok(record) => Some(record.into()),
            Err(err) => {
                warn!(
                    "storage: unreadable version record {} ({err}); treating as baseline",
                    path.display()
                );
                Self::baseline(feed)
            }
        }
    }

    pub async fn write_version(&self, feed: &FeedSpec, token: &VersionToken) -> Result<()> {
        let record = VersionRecord::from(token);
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| std::io::Error::other(format!("unable to encode version: {e}")))?;
        write_atomic(&self.version_path(feed), &bytes).await
    }

    /// Write the manifest the display app reads. Returns false when the file
    /// already held identical content, so readers are not woken for nothing.
    pub async fn publish_manifest(&self, feed: &FeedSpec, document: &Value) -> Result<bool> {
        let path = self.manifest_path(feed);
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| std::io::Error::other(format!("unable to encode manifest: {e}")))?;
        if let Ok(existing) = fs::read(&path).await
            && existing == bytes
        {
            debug!("storage: {} unchanged", path.display());
            return Ok(false);
        }
        write_atomic(&path, &bytes).await?;
        Ok(true)
    }

    pub async fn read_published(&self, feed: &FeedSpec) -> Option<Value> {
        let bytes = fs::read(self.manifest_path(feed)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// Replace `path` by writing a sibling temp file and renaming it over.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = partial_path(path);
    fs::write(&tmp, bytes).await?;
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Every regular file under `root`, as `/`-separated relative paths.
pub fn local_snapshot(root: &Path) -> Result<BTreeSet<String>> {
    let mut files = BTreeSet::new();
    if !root.exists() {
        return Ok(files);
    }
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        files.insert(parts.join("/"));
    }
    Ok(files)
}

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

const EMBEDDED_FEEDS: &str = include_str!("../../feeds.json");

/// Where a feed's manifest comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// `check-update` on the update server, answered with a ZIP bundle.
    UpdateBundle,
    /// Newest row of a versioned table.
    TableLatest {
        table: String,
        version_column: String,
        payload_column: String,
    },
    /// Single row selected by a filter, versioned by its timestamp column.
    TableSnapshot {
        table: String,
        filter_column: String,
        filter_value: String,
        payload_column: String,
        timestamp_column: String,
        publish_key: String,
    },
    /// Camera rows registered for this screen, newest first.
    CameraRegistry { table: String },
    /// Weather payload from the update server, versioned by content hash.
    Weather,
}

/// Where the binary assets listed in a manifest come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetSpec {
    ObjectStorage { bucket: String, prefix: String },
    Bundle,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validation {
    #[default]
    NonEmpty,
    Image,
}

/// One row of the declarative feed table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedSpec {
    pub name: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub assets: Option<AssetSpec>,
    #[serde(default)]
    pub asset_root: Option<String>,
    /// Manifest category to the entry field holding the asset path.
    /// The category `*` matches every top-level list.
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
    pub manifest_file: String,
    pub version_file: String,
    #[serde(default)]
    pub baseline: i64,
    #[serde(default)]
    pub validation: Validation,
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl FeedSpec {
    pub fn interval(&self, default: Duration) -> Duration {
        self.interval_secs.map(Duration::from_secs).unwrap_or(default)
    }

    pub fn has_assets(&self) -> bool {
        self.assets.is_some() && self.asset_root.is_some()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedTable {
    pub feeds: Vec<FeedSpec>,
}

impl FeedTable {
    /// Prefer a `feeds.json` next to the install, otherwise the embedded table.
    pub fn load(path: &Path) -> Result<Self> {
        let table = match fs::read_to_string(path) {
            Ok(contents) => {
                info!("feeds: using {}", path.display());
                Self::parse(&contents)?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::embedded()?,
            Err(err) => {
                warn!("feeds: failed to read {} ({err}); using embedded table", path.display());
                Self::embedded()?
            }
        };
        Ok(table)
    }

    pub fn embedded() -> Result<Self> {
        Self::parse(EMBEDDED_FEEDS)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let table: FeedTable = serde_json::from_str(contents)
            .map_err(|e| SyncError::Config(format!("feeds.json parse error: {e}")))?;
        table.validate()?;
        Ok(table)
    }

    pub fn get(&self, name: &str) -> Option<&FeedSpec> {
        self.feeds.iter().find(|feed| feed.name == name)
    }

    /// Every feed must own its files exclusively.
    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut owned = HashSet::new();
        for feed in &self.feeds {
            if !names.insert(feed.name.as_str()) {
                return Err(SyncError::Config(format!("duplicate feed {}", feed.name)));
            }
            let mut files = vec![feed.manifest_file.as_str(), feed.version_file.as_str()];
            if let Some(root) = feed.asset_root.as_deref() {
                files.push(root);
            }
            for file in files {
                if !owned.insert(file) {
                    return Err(SyncError::Config(format!(
                        "feed {} shares {file} with another feed",
                        feed.name
                    )));
                }
            }
            if feed.assets.is_some() != feed.asset_root.is_some() {
                return Err(SyncError::Config(format!(
                    "feed {} needs both assets and asset_root, or neither",
                    feed.name
                )));
            }
            if feed.assets.is_some() && feed.categories.is_empty() {
                return Err(SyncError::Config(format!(
                    "feed {} has assets but no categories",
                    feed.name
                )));
            }
        }
        Ok(())
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Deleted,
}

/// One remote asset listed in a manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub category: String,
    /// Path relative to the feed's asset root, always `/`-separated.
    pub remote_path: String,
    pub status: EntryStatus,
    pub metadata: Value,
}

impl Entry {
    pub fn local_path(&self, asset_root: &Path) -> PathBuf {
        asset_root.join(&self.remote_path)
    }

    pub fn is_deleted(&self) -> bool {
        self.status == EntryStatus::Deleted
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    pub entries: Vec<Entry>,
}

impl Manifest {
    /// Collect entries from a manifest document using a category to field map.
    /// Items without a usable path are skipped; they have nothing to sync.
    pub fn from_document(document: &Value, categories: &BTreeMap<String, String>) -> Self {
        let mut entries = Vec::new();
        let Some(object) = document.as_object() else {
            return Self { entries };
        };
        for (category, field) in categories {
            let lists: Vec<(&String, &Value)> = if category == "*" {
                object.iter().filter(|(_, v)| v.is_array()).collect()
            } else {
                object.get_key_value(category).into_iter().collect()
            };
            for (name, list) in lists {
                let Some(items) = list.as_array() else {
                    continue;
                };
                for item in items {
                    let Some(raw) = item.get(field).and_then(Value::as_str) else {
                        continue;
                    };
                    let Some(remote_path) = normalize_relative(raw) else {
                        continue;
                    };
                    let status = match item.get("status").and_then(Value::as_str) {
                        Some("deleted") => EntryStatus::Deleted,
                        _ => EntryStatus::Active,
                    };
                    entries.push(Entry {
                        category: name.clone(),
                        remote_path,
                        status,
                        metadata: item.clone(),
                    });
                }
            }
        }
        Self { entries }
    }

    pub fn active(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| !e.is_deleted())
    }

    pub fn deleted(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| e.is_deleted())
    }
}

/// Clean a manifest path into a relative `/`-separated form. Absolute paths
/// and parent components are refused so entries stay inside their root.
pub fn normalize_relative(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    let mut parts = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// The progress marker of a feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionToken {
    Number(i64),
    Timestamp(String),
    Fingerprint(String),
}

impl VersionToken {
    /// Whether a remote token warrants a sync against the local one.
    pub fn supersedes(&self, local: Option<&VersionToken>) -> bool {
        match (self, local) {
            (_, None) => true,
            (Self::Number(remote), Some(Self::Number(local))) => remote > local,
            (Self::Timestamp(remote), Some(Self::Timestamp(local)))
            | (Self::Fingerprint(remote), Some(Self::Fingerprint(local))) => remote != local,
            // The token kind changed under us; resync.
            _ => true,
        }
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "v{n}"),
            Self::Timestamp(ts) => write!(f, "{ts}"),
            Self::Fingerprint(hash) => write!(f, "sha256:{}", hash.get(..12).unwrap_or(hash)),
        }
    }
}

/// On-disk shape of a version record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionRecord {
    Number { versao: i64 },
    Timestamp { atualizado_em: String },
    Fingerprint { sha256: String },
}

impl From<VersionRecord> for VersionToken {
    fn from(record: VersionRecord) -> Self {
        match record {
            VersionRecord::Number { versao } => Self::Number(versao),
            VersionRecord::Timestamp { atualizado_em } => Self::Timestamp(atualizado_em),
            VersionRecord::Fingerprint { sha256 } => Self::Fingerprint(sha256),
        }
    }
}

impl From<&VersionToken> for VersionRecord {
    fn from(token: &VersionToken) -> Self {
        match token {
            VersionToken::Number(versao) => Self::Number { versao: *versao },
            VersionToken::Timestamp(ts) => Self::Timestamp {
                atualizado_em: ts.clone(),
            },
            VersionToken::Fingerprint(hash) => Self::Fingerprint {
                sha256: hash.clone(),
            },
        }
    }
}

/// A manifest as fetched from the remote side.
#[derive(Clone, Debug)]
pub struct RemoteManifest {
    pub token: VersionToken,
    /// Document the entries are read from.
    pub document: Value,
    /// Document written to the cache for the display app.
    pub published: Value,
    /// Extracted bundle root when the assets arrived in an archive.
    pub bundle: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub enum Fetched {
    /// The remote has nothing newer; reconcile against what was last published.
    Current,
    /// Nothing is published remotely for this screen.
    Empty,
    Manifest(RemoteManifest),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub feed: String,
    pub has_update: bool,
    pub downloaded: usize,
    pub failed: usize,
    pub deleted: usize,
    pub deferred: usize,
    pub published: bool,
    pub persisted: Option<VersionToken>,
}

impl CycleReport {
    pub fn new(feed: &str) -> Self {
        Self {
            feed: feed.to_owned(),
            ..Default::default()
        }
    }

    pub fn touched_files(&self) -> bool {
        self.downloaded > 0 || self.deleted > 0
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "update={} downloaded={} failed={} deleted={} deferred={}",
            self.has_update, self.downloaded, self.failed, self.deleted, self.deferred
        )?;
        if let Some(token) = &self.persisted {
            write!(f, " version={token}")?;
        }
        Ok(())
    }
}

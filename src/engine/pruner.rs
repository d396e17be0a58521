use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::engine::differ::Candidate;
use crate::error::Result;
use crate::storage::write_atomic;

/// Whether the presentation layer may still hold `path` open.
pub trait InUse {
    fn in_use(&self, path: &Path) -> bool;
}

impl InUse for HashSet<PathBuf> {
    fn in_use(&self, path: &Path) -> bool {
        self.contains(path)
    }
}

#[derive(Debug, Deserialize)]
struct NowPlayingMarker {
    atualizado_em: String,
    #[serde(default)]
    arquivos: Vec<String>,
}

/// Reads the display app's `em_uso.json` heartbeat on every query. While the
/// heartbeat is fresh its file list is authoritative. A stale or absent
/// heartbeat holds nothing; the [`DeletionWindow`] covers that case.
#[derive(Clone, Debug)]
pub struct NowPlaying {
    marker: PathBuf,
    cache_dir: PathBuf,
    ttl: Duration,
}

impl NowPlaying {
    pub fn new(marker: PathBuf, cache_dir: PathBuf, ttl: Duration) -> Self {
        Self {
            marker,
            cache_dir,
            ttl,
        }
    }

    fn fresh_marker(&self, now: DateTime<Utc>) -> Option<NowPlayingMarker> {
        let bytes = fs::read(&self.marker).ok()?;
        let marker: NowPlayingMarker = match serde_json::from_slice(&bytes) {
            Ok(marker) => marker,
            Err(err) => {
                debug!("prune: ignoring unreadable {} ({err})", self.marker.display());
                return None;
            }
        };
        let beat = DateTime::parse_from_rfc3339(&marker.atualizado_em).ok()?;
        let age = now.signed_duration_since(beat.with_timezone(&Utc));
        if age > chrono_span(self.ttl) {
            debug!("prune: now-playing heartbeat is {}s old", age.num_seconds());
            return None;
        }
        Some(marker)
    }

    fn relative_to_cache(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.cache_dir).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn check(&self, path: &Path, now: DateTime<Utc>) -> bool {
        let Some(marker) = self.fresh_marker(now) else {
            return false;
        };
        let Some(relative) = self.relative_to_cache(path) else {
            return false;
        };
        marker
            .arquivos
            .iter()
            .any(|listed| listed.replace('\\', "/").trim_start_matches("./") == relative)
    }
}

impl InUse for NowPlaying {
    fn in_use(&self, path: &Path) -> bool {
        self.check(path, Utc::now())
    }
}

fn chrono_span(span: Duration) -> chrono::Duration {
    chrono::Duration::from_std(span).unwrap_or(chrono::Duration::MAX)
}

/// feed name -> relative path -> RFC 3339 time it first became a candidate.
type Ledger = BTreeMap<String, BTreeMap<String, String>>;

/// Candidates split by whether their grace period has run out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Settled {
    pub due: Vec<Candidate>,
    pub waiting: usize,
}

/// Deletion candidates and when each was first seen, kept in `pendentes.json`.
///
/// The clock starts when a path first shows up as a candidate, not when the
/// file was written, so an old asset dropped while on screen still gets the
/// full `grace` before it goes. A path that stops being a candidate (listed
/// again, or already gone) is forgotten and starts over if dropped later.
#[derive(Clone, Debug)]
pub struct DeletionWindow {
    ledger: PathBuf,
    grace: Duration,
}

impl DeletionWindow {
    pub fn new(ledger: PathBuf, grace: Duration) -> Self {
        Self { ledger, grace }
    }

    /// Record this cycle's candidates for `feed` and return the ones due.
    pub async fn settle(&self, feed: &str, candidates: &[Candidate], now: DateTime<Utc>) -> Result<Settled> {
        if self.grace.is_zero() {
            return Ok(Settled {
                due: candidates.to_vec(),
                waiting: 0,
            });
        }

        let mut ledger = self.load().await;
        let previous = ledger.remove(feed).unwrap_or_default();
        let grace = chrono_span(self.grace);
        let mut current = BTreeMap::new();
        let mut settled = Settled::default();
        for candidate in candidates {
            let first_seen = previous
                .get(&candidate.relative)
                .and_then(|stamp| DateTime::parse_from_rfc3339(stamp).ok())
                .map(|stamp| stamp.with_timezone(&Utc))
                // A stamp from the future means the clock moved; start over.
                .filter(|stamp| *stamp <= now)
                .unwrap_or(now);
            if now.signed_duration_since(first_seen) >= grace {
                settled.due.push(candidate.clone());
            } else {
                settled.waiting += 1;
            }
            current.insert(candidate.relative.clone(), first_seen.to_rfc3339());
        }
        if settled.waiting > 0 {
            debug!("prune[{feed}]: {} candidate(s) inside the grace window", settled.waiting);
        }

        if current != previous {
            if !current.is_empty() {
                ledger.insert(feed.to_owned(), current);
            }
            self.save(&ledger).await?;
        }
        Ok(settled)
    }

    async fn load(&self) -> Ledger {
        let bytes = match tokio::fs::read(&self.ledger).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ledger::new(),
            Err(err) => {
                warn!("prune: cannot read {} ({err}); starting a new window", self.ledger.display());
                return Ledger::new();
            }
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            warn!("prune: discarding malformed {} ({err})", self.ledger.display());
            Ledger::new()
        })
    }

    async fn save(&self, ledger: &Ledger) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(ledger).map_err(io::Error::other)?;
        write_atomic(&self.ledger, &bytes).await
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub deleted: usize,
    pub deferred: usize,
}

/// Delete candidates under `root`, skipping anything the display holds.
/// Deferred files stay on disk and show up again in the next diff.
pub fn prune<U: InUse + ?Sized>(root: &Path, candidates: &[Candidate], in_use: &U) -> PruneOutcome {
    let mut outcome = PruneOutcome::default();
    for candidate in candidates {
        let path = root.join(&candidate.relative);
        if !path.exists() {
            continue;
        }
        if in_use.in_use(&path) {
            info!("prune: {} is in use, deferring", candidate.relative);
            outcome.deferred += 1;
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("prune: removed {} ({:?})", candidate.relative, candidate.reason);
                outcome.deleted += 1;
                remove_empty_parents(&path, root);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!("prune: could not remove {} ({err}); retrying next cycle", candidate.relative);
                outcome.deferred += 1;
            }
        }
    }
    outcome
}

fn remove_empty_parents(path: &Path, root: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Fails on non-empty directories, which ends the walk.
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::differ::Removal;
    use serde_json::{Value, json};

    fn orphan(path: &str) -> Candidate {
        Candidate {
            relative: path.into(),
            reason: Removal::Orphan,
        }
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn removes_files_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Entretenimento");
        touch(&root.join("pets").join("dog.mp4"));
        touch(&root.join("keep.mp4"));
        let outcome = prune(&root, &[orphan("pets/dog.mp4"), orphan("gone.mp4")], &HashSet::new());
        assert_eq!(outcome, PruneOutcome { deleted: 1, deferred: 0 });
        assert!(!root.join("pets").exists());
        assert!(root.join("keep.mp4").exists());
    }

    #[test]
    fn skips_files_held_by_the_display() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("sistema");
        let playing = root.join("Propagandas").join("promo.mp4");
        touch(&playing);
        let held: HashSet<PathBuf> = [playing.clone()].into_iter().collect();
        let outcome = prune(&root, &[orphan("Propagandas/promo.mp4")], &held);
        assert_eq!(outcome, PruneOutcome { deleted: 0, deferred: 1 });
        assert!(playing.exists());
    }

    fn now_playing(cache: &Path) -> NowPlaying {
        NowPlaying::new(
            cache.join("em_uso.json"),
            cache.to_path_buf(),
            Duration::from_secs(120),
        )
    }

    #[test]
    fn fresh_heartbeat_is_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path();
        let playing = cache.join("News").join("a.jpg");
        let idle = cache.join("News").join("b.jpg");
        touch(&playing);
        touch(&idle);
        let marker = json!({"atualizado_em": Utc::now().to_rfc3339(), "arquivos": ["News/a.jpg"]});
        fs::write(cache.join("em_uso.json"), marker.to_string()).unwrap();
        let predicate = now_playing(cache);
        assert!(predicate.in_use(&playing));
        assert!(!predicate.in_use(&idle));
    }

    #[test]
    fn stale_or_missing_heartbeat_holds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path();
        let file = cache.join("News").join("a.jpg");
        touch(&file);
        assert!(!now_playing(cache).in_use(&file));

        let old = Utc::now() - chrono::Duration::minutes(10);
        let marker = json!({"atualizado_em": old.to_rfc3339(), "arquivos": ["News/a.jpg"]});
        fs::write(cache.join("em_uso.json"), marker.to_string()).unwrap();
        assert!(!now_playing(cache).in_use(&file));
    }

    fn window(dir: &Path, grace_secs: u64) -> DeletionWindow {
        DeletionWindow::new(dir.join("pendentes.json"), Duration::from_secs(grace_secs))
    }

    #[tokio::test]
    async fn candidates_wait_out_the_grace_window() {
        let dir = tempfile::tempdir().unwrap();
        let window = window(dir.path(), 60);
        let t0 = Utc::now();
        let candidates = [orphan("promo.mp4")];

        let first = window.settle("entertainment", &candidates, t0).await.unwrap();
        assert_eq!(first, Settled { due: vec![], waiting: 1 });
        let early = window
            .settle("entertainment", &candidates, t0 + chrono::Duration::seconds(59))
            .await
            .unwrap();
        assert_eq!(early.waiting, 1);
        let late = window
            .settle("entertainment", &candidates, t0 + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(late, Settled { due: candidates.to_vec(), waiting: 0 });
    }

    #[tokio::test]
    async fn relisted_paths_restart_their_window() {
        let dir = tempfile::tempdir().unwrap();
        let window = window(dir.path(), 60);
        let t0 = Utc::now();
        let candidates = [orphan("promo.mp4")];

        window.settle("entertainment", &candidates, t0).await.unwrap();
        // Listed again, so no longer a candidate.
        window
            .settle("entertainment", &[], t0 + chrono::Duration::seconds(30))
            .await
            .unwrap();
        let ledger: Value =
            serde_json::from_slice(&fs::read(dir.path().join("pendentes.json")).unwrap()).unwrap();
        assert_eq!(ledger, json!({}));

        let dropped_again = window
            .settle("entertainment", &candidates, t0 + chrono::Duration::seconds(90))
            .await
            .unwrap();
        assert_eq!(dropped_again.waiting, 1);
    }

    #[tokio::test]
    async fn feeds_keep_separate_windows() {
        let dir = tempfile::tempdir().unwrap();
        let window = window(dir.path(), 60);
        let t0 = Utc::now();
        window.settle("news", &[orphan("a.jpg")], t0).await.unwrap();
        window.settle("entertainment", &[orphan("a.mp4")], t0).await.unwrap();
        let later = t0 + chrono::Duration::seconds(61);
        let news = window.settle("news", &[orphan("a.jpg")], later).await.unwrap();
        assert_eq!(news.due.len(), 1);
        let ledger: Value =
            serde_json::from_slice(&fs::read(dir.path().join("pendentes.json")).unwrap()).unwrap();
        assert!(ledger["entertainment"]["a.mp4"].is_string());
    }

    #[tokio::test]
    async fn zero_grace_passes_everything_through() {
        let dir = tempfile::tempdir().unwrap();
        let settled = window(dir.path(), 0)
            .settle("news", &[orphan("a.jpg")], Utc::now())
            .await
            .unwrap();
        assert_eq!(settled.due.len(), 1);
        assert!(!dir.path().join("pendentes.json").exists());
    }
}

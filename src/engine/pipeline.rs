use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::config::FeedSpec;
use crate::engine::differ;
use crate::engine::downloader::{AssetFetcher, Downloader};
use crate::engine::models::{CycleReport, Entry, Fetched, Manifest, RemoteManifest};
use crate::engine::pruner::{self, DeletionWindow, InUse};
use crate::engine::source::{ManifestSource, document_of};
use crate::engine::state::{CycleStage, SyncEvent};
use crate::error::Result;
use crate::storage::{StorageManager, local_snapshot};

/// One parameterized fetch/diff/download/publish/prune/persist pass, shared
/// by every feed. Feeds differ only by their row in the feed table.
pub struct Pipeline<S, A, U> {
    source: S,
    fetcher: A,
    in_use: U,
    window: DeletionWindow,
    storage: StorageManager,
    attempts: u32,
    backoff: Duration,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl<S, A, U> Pipeline<S, A, U>
where
    S: ManifestSource,
    A: AssetFetcher,
    U: InUse,
{
    pub fn new(
        source: S,
        fetcher: A,
        in_use: U,
        window: DeletionWindow,
        storage: StorageManager,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            source,
            fetcher,
            in_use,
            window,
            storage,
            attempts,
            backoff,
            events: None,
        }
    }

    /// Route progress events to `updates` from now on.
    pub fn watch(&mut self, updates: mpsc::UnboundedSender<SyncEvent>) {
        self.events = Some(updates);
    }

    pub fn unwatch(&mut self) {
        self.events = None;
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn stage(&self, feed: &FeedSpec, stage: CycleStage) {
        debug!("feed[{}]: {stage}", feed.name);
        self.emit(SyncEvent::Stage {
            feed: feed.name.clone(),
            stage,
        });
    }

    /// Run one cycle. The version record is written last and only when every
    /// wanted asset is in place, so any abort leaves it at its old value.
    pub async fn run_cycle(&self, feed: &FeedSpec) -> Result<CycleReport> {
        let result = self.cycle(feed).await;
        match &result {
            Ok(report) => self.emit(SyncEvent::Finished(report.clone())),
            Err(err) => self.emit(SyncEvent::Failed {
                feed: feed.name.clone(),
                error: err.to_string(),
            }),
        }
        result
    }

    async fn cycle(&self, feed: &FeedSpec) -> Result<CycleReport> {
        self.stage(feed, CycleStage::Fetch);
        let local = self.storage.read_version(feed).await;
        let remote = match self.source.fetch(feed, local.as_ref()).await? {
            Fetched::Empty => {
                info!("feed[{}]: nothing published remotely", feed.name);
                return Ok(CycleReport::new(&feed.name));
            }
            Fetched::Current => None,
            Fetched::Manifest(remote) => Some(remote),
        };

        let bundle = remote.as_ref().and_then(|r| r.bundle.clone());
        let result = self.reconcile(feed, remote).await;
        if let Some(staging) = bundle
            && let Err(err) = tokio::fs::remove_dir_all(&staging).await
        {
            warn!("feed[{}]: could not clear {} ({err})", feed.name, staging.display());
        }
        result
    }

    async fn reconcile(&self, feed: &FeedSpec, remote: Option<RemoteManifest>) -> Result<CycleReport> {
        let mut report = CycleReport::new(&feed.name);
        report.has_update = remote.is_some();

        let document = match &remote {
            Some(remote) => Some(remote.document.clone()),
            None => self
                .storage
                .read_published(feed)
                .await
                .and_then(|published| document_of(feed, &published)),
        };

        let mut removals = None;
        if let (Some(root), Some(document)) = (self.storage.asset_root(feed), document.as_ref()) {
            self.stage(feed, CycleStage::Diff);
            let manifest = Manifest::from_document(document, &feed.categories);
            let local = local_snapshot(&root)?;
            let diff = differ::diff(&manifest, &local);
            debug!(
                "feed[{}]: {} missing, {} to remove",
                feed.name,
                diff.missing.len(),
                diff.removals.len()
            );
            removals = Some(diff.removals);

            if !diff.missing.is_empty() {
                self.stage(feed, CycleStage::Download);
                self.emit(SyncEvent::Planned {
                    feed: feed.name.clone(),
                    missing: diff.missing.len(),
                });
                let bundle = remote.as_ref().and_then(|r| r.bundle.as_deref());
                let downloader = Downloader::new(&self.fetcher, self.attempts, self.backoff);
                let outcome = downloader
                    .download_all(feed, &diff.missing, &root, bundle, &mut |entry: &Entry| {
                        self.emit(SyncEvent::Synced {
                            feed: feed.name.clone(),
                            path: entry.remote_path.clone(),
                        })
                    })
                    .await;
                report.downloaded = outcome.synced;
                report.failed = outcome.failed;
            }
        } else if feed.has_assets() {
            debug!("feed[{}]: no manifest to reconcile against yet", feed.name);
        }

        // A new manifest with missing items stays unpublished, and so does its
        // pruning: the display keeps the previous list, whose files are intact.
        let complete = report.failed == 0;
        if let Some(remote) = &remote {
            if complete {
                self.stage(feed, CycleStage::Publish);
                report.published = self.storage.publish_manifest(feed, &remote.published).await?;
            } else {
                warn!(
                    "feed[{}]: keeping the previously published manifest until every item is in place",
                    feed.name
                );
            }
        }

        if let (Some(root), Some(removals)) = (self.storage.asset_root(feed), removals)
            && (complete || remote.is_none())
        {
            let settled = self.window.settle(&feed.name, &removals, Utc::now()).await?;
            report.deferred = settled.waiting;
            if !settled.due.is_empty() {
                self.stage(feed, CycleStage::Prune);
                let outcome = pruner::prune(&root, &settled.due, &self.in_use);
                report.deleted = outcome.deleted;
                report.deferred += outcome.deferred;
            }
        }

        if let Some(remote) = remote {
            if report.failed > 0 {
                warn!(
                    "feed[{}]: {} item(s) failed; keeping version record for a retry",
                    feed.name, report.failed
                );
            } else {
                self.stage(feed, CycleStage::Persist);
                self.storage.write_version(feed, &remote.token).await?;
                if let Err(err) = self.source.confirm(feed, &remote.token).await {
                    warn!("feed[{}]: confirmation failed: {err}", feed.name);
                }
                report.persisted = Some(remote.token);
            }
        }

        if report.has_update || report.touched_files() || report.failed > 0 {
            info!("feed[{}]: {report}", feed.name);
        } else {
            debug!("feed[{}]: {report}", feed.name);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedTable;
    use crate::engine::downloader::tests::FakeAssets;
    use crate::engine::models::VersionToken;
    use crate::engine::source::tests::FakeSource;
    use crate::env::AppPaths;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::SystemTime;

    type TestPipeline = Pipeline<FakeSource, FakeAssets, HashSet<PathBuf>>;

    fn pipeline(base: &Path) -> TestPipeline {
        Pipeline::new(
            FakeSource::default(),
            FakeAssets::default(),
            HashSet::new(),
            DeletionWindow::new(ledger_path(base), Duration::ZERO),
            StorageManager::new(&AppPaths::new(base)),
            3,
            Duration::from_secs(3),
        )
    }

    fn feed(name: &str) -> FeedSpec {
        FeedTable::embedded().unwrap().get(name).unwrap().clone()
    }

    fn entertainment(version: i64, items: Value) -> Fetched {
        let document = json!({ "entretenimento": items });
        Fetched::Manifest(RemoteManifest {
            token: VersionToken::Number(version),
            published: document.clone(),
            document,
            bundle: None,
        })
    }

    fn ledger_path(base: &Path) -> PathBuf {
        base.join("cache").join("pendentes.json")
    }

    fn asset_root(base: &Path) -> PathBuf {
        base.join("cache").join("Entretenimento")
    }

    fn put(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"local").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn version_bump_downloads_new_and_removes_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let feed = feed("entertainment");
        pipeline
            .storage
            .write_version(&feed, &VersionToken::Number(3))
            .await
            .unwrap();
        let root = asset_root(dir.path());
        put(&root, "old.mp4");
        put(&root, "kept.mp4");
        pipeline.source.push(
            "entertainment",
            Ok(entertainment(
                4,
                json!([
                    {"video": "kept.mp4"},
                    {"video": "new/a.mp4"},
                    {"video": "new/b.mp4"},
                    {"video": "old.mp4", "status": "deleted"}
                ]),
            )),
        );
        pipeline.fetcher.serve("new/a.mp4", b"a");
        pipeline.fetcher.serve("new/b.mp4", b"b");

        let report = pipeline.run_cycle(&feed).await.unwrap();

        assert_eq!(report.downloaded, 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.persisted, Some(VersionToken::Number(4)));
        assert!(root.join("new").join("a.mp4").exists());
        assert!(root.join("new").join("b.mp4").exists());
        assert!(!root.join("old.mp4").exists());
        assert!(root.join("kept.mp4").exists());
        assert_eq!(
            pipeline.storage.read_version(&feed).await,
            Some(VersionToken::Number(4))
        );
        assert!(report.published);
    }

    #[tokio::test(start_paused = true)]
    async fn second_cycle_without_changes_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let feed = feed("entertainment");
        pipeline.source.push(
            "entertainment",
            Ok(entertainment(1, json!([{"video": "a.mp4"}]))),
        );
        pipeline.source.push("entertainment", Ok(Fetched::Current));
        pipeline.fetcher.serve("a.mp4", b"a");

        let first = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!(first.downloaded, 1);
        let second = pipeline.run_cycle(&feed).await.unwrap();
        assert!(!second.has_update);
        assert_eq!((second.downloaded, second.deleted), (0, 0));
        assert_eq!(pipeline.fetcher.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn orphans_are_removed_once_and_wanted_files_stay() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let feed = feed("entertainment");
        let root = asset_root(dir.path());
        put(&root, "listed.mp4");
        put(&root, "stray/orphan.mp4");
        put(&root, "half.mp4.part");
        pipeline.source.push(
            "entertainment",
            Ok(entertainment(1, json!([{"video": "listed.mp4"}]))),
        );
        pipeline.source.push("entertainment", Ok(Fetched::Current));

        let first = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!(first.deleted, 2);
        assert!(root.join("listed.mp4").exists());
        assert!(!root.join("stray").exists());
        assert!(!root.join("half.mp4.part").exists());

        let second = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!(second.deleted, 0);
        assert!(root.join("listed.mp4").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_entries_are_never_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let feed = feed("entertainment");
        pipeline.source.push(
            "entertainment",
            Ok(entertainment(
                1,
                json!([{"video": "gone.mp4", "status": "deleted"}]),
            )),
        );
        pipeline.fetcher.serve("gone.mp4", b"should not be fetched");

        let report = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!(report.downloaded, 0);
        assert_eq!(pipeline.fetcher.call_count(), 0);
        assert!(!asset_root(dir.path()).join("gone.mp4").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_after_crash_before_persist() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let feed = feed("entertainment");
        let root = asset_root(dir.path());
        // A previous run downloaded everything but died before persisting v2.
        put(&root, "a.mp4");
        put(&root, "b.mp4");
        pipeline.source.push(
            "entertainment",
            Ok(entertainment(2, json!([{"video": "a.mp4"}, {"video": "b.mp4"}]))),
        );

        let report = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.deleted, 0);
        assert_eq!(pipeline.fetcher.call_count(), 0);
        assert_eq!(report.persisted, Some(VersionToken::Number(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let feed = feed("entertainment");
        pipeline
            .storage
            .write_version(&feed, &VersionToken::Number(3))
            .await
            .unwrap();
        let root = asset_root(dir.path());
        put(&root, "orphan.mp4");

        let err = pipeline.run_cycle(&feed).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            pipeline.storage.read_version(&feed).await,
            Some(VersionToken::Number(3))
        );
        assert!(root.join("orphan.mp4").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_items_keep_the_old_version() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let feed = feed("entertainment");
        pipeline.source.push(
            "entertainment",
            Ok(entertainment(5, json!([{"video": "ok.mp4"}, {"video": "broken.mp4"}]))),
        );
        pipeline.fetcher.serve("ok.mp4", b"ok");

        let report = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!((report.downloaded, report.failed), (1, 1));
        assert_eq!(report.persisted, None);
        assert_eq!(
            pipeline.storage.read_version(&feed).await,
            Some(VersionToken::Number(0))
        );
        assert!(pipeline.source.confirmed.lock().unwrap().is_empty());
        assert!(!report.published);
        assert_eq!(pipeline.storage.read_published(&feed).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_update_keeps_previous_manifest_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let feed = feed("entertainment");
        let root = asset_root(dir.path());
        pipeline.source.push(
            "entertainment",
            Ok(entertainment(1, json!([{"video": "a.mp4"}]))),
        );
        pipeline.source.push(
            "entertainment",
            Ok(entertainment(2, json!([{"video": "b.mp4"}, {"video": "broken.mp4"}]))),
        );
        pipeline.fetcher.serve("a.mp4", b"a");
        pipeline.fetcher.serve("b.mp4", b"b");
        pipeline.run_cycle(&feed).await.unwrap();

        let report = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!((report.downloaded, report.failed, report.deleted), (1, 1, 0));
        assert!(!report.published);
        assert_eq!(
            pipeline.storage.read_published(&feed).await,
            Some(json!({"entretenimento": [{"video": "a.mp4"}]}))
        );
        assert!(root.join("a.mp4").exists());
        assert!(!root.join("broken.mp4").exists());
        assert_eq!(
            pipeline.storage.read_version(&feed).await,
            Some(VersionToken::Number(1))
        );
    }

    #[tokio::test]
    async fn dropped_file_outlives_the_grace_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        pipeline.window = DeletionWindow::new(ledger_path(dir.path()), Duration::from_secs(60));
        let feed = feed("entertainment");
        let root = asset_root(dir.path());
        put(&root, "playing.mp4");
        // Downloaded an hour ago; its age says nothing about playback.
        fs::File::options()
            .write(true)
            .open(root.join("playing.mp4"))
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        pipeline.source.push(
            "entertainment",
            Ok(entertainment(1, json!([{"video": "playing.mp4", "status": "deleted"}]))),
        );
        pipeline.source.push("entertainment", Ok(Fetched::Current));

        let first = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!((first.deleted, first.deferred), (0, 1));
        assert!(root.join("playing.mp4").exists());

        let long_ago = (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
        fs::write(
            ledger_path(dir.path()),
            json!({"entertainment": {"playing.mp4": long_ago}}).to_string(),
        )
        .unwrap();
        let second = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!((second.deleted, second.deferred), (1, 0));
        assert!(!root.join("playing.mp4").exists());
    }

    #[tokio::test]
    async fn held_files_are_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        let feed = feed("entertainment");
        let root = asset_root(dir.path());
        put(&root, "playing.mp4");
        pipeline.in_use.insert(root.join("playing.mp4"));
        pipeline.source.push("entertainment", Ok(entertainment(1, json!([]))));

        let report = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!((report.deleted, report.deferred), (0, 1));
        assert!(root.join("playing.mp4").exists());
    }

    #[tokio::test]
    async fn snapshot_feed_publishes_and_reconciles_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let feed = feed("quotes");
        pipeline.source.push(
            "quotes",
            Ok(Fetched::Manifest(RemoteManifest {
                token: VersionToken::Timestamp("2025-06-01T12:00:00".into()),
                document: json!({"USD": 5.4}),
                published: json!({"cotacao": {"USD": 5.4}, "atualizado_em": "2025-06-01T12:00:00"}),
                bundle: None,
            })),
        );
        let report = pipeline.run_cycle(&feed).await.unwrap();
        assert!(report.published);
        let written: Value =
            serde_json::from_slice(&fs::read(dir.path().join("cache").join("cotacao.json")).unwrap())
                .unwrap();
        assert_eq!(written["cotacao"]["USD"], json!(5.4));
        assert_eq!(
            pipeline.storage.read_version(&feed).await,
            Some(VersionToken::Timestamp("2025-06-01T12:00:00".into()))
        );
    }

    #[tokio::test]
    async fn bundle_cycle_confirms_and_clears_staging() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let feed = feed("general");
        let staging = AppPaths::new(dir.path()).staging_dir("general");
        fs::create_dir_all(&staging).unwrap();
        pipeline.source.push(
            "general",
            Ok(Fetched::Manifest(RemoteManifest {
                token: VersionToken::Number(2),
                document: json!({"Banners": []}),
                published: json!({"Banners": []}),
                bundle: Some(staging.clone()),
            })),
        );

        let report = pipeline.run_cycle(&feed).await.unwrap();
        assert_eq!(report.persisted, Some(VersionToken::Number(2)));
        assert!(!staging.exists());
        assert_eq!(
            pipeline.source.confirmed.lock().unwrap().as_slice(),
            [("general".to_owned(), VersionToken::Number(2))]
        );
    }

    #[tokio::test]
    async fn progress_events_follow_each_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        pipeline.watch(tx);
        let feed = feed("entertainment");
        pipeline.source.push(
            "entertainment",
            Ok(entertainment(1, json!([{"video": "a.mp4"}, {"video": "b.mp4"}]))),
        );
        pipeline.fetcher.serve("a.mp4", b"a");
        pipeline.fetcher.serve("b.mp4", b"b");
        pipeline.run_cycle(&feed).await.unwrap();
        pipeline.unwatch();

        let mut planned = 0;
        let mut synced = Vec::new();
        let mut finished = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SyncEvent::Planned { missing, .. } => planned += missing,
                SyncEvent::Synced { path, .. } => synced.push(path),
                SyncEvent::Finished(_) => finished = true,
                SyncEvent::Failed { .. } => panic!("cycle should not fail"),
                SyncEvent::Stage { .. } => {}
            }
        }
        assert_eq!(planned, 2);
        assert_eq!(synced, ["a.mp4", "b.mp4"]);
        assert!(finished);
    }
}

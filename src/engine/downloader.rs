use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::fs;

use crate::config::{AssetSpec, FeedSpec, Validation};
use crate::engine::models::Entry;
use crate::error::{Result, SyncError};
use crate::networking::{NetworkClient, object_url};
use crate::storage::partial_path;
use crate::util::backoff_delay;

/// Everything a fetcher needs to locate one asset.
pub struct AssetRequest<'a> {
    pub feed: &'a FeedSpec,
    pub entry: &'a Entry,
    /// Extracted bundle root for feeds whose assets ship inside an archive.
    pub bundle: Option<&'a Path>,
}

/// Transfer one asset to `dest`, returning the byte count.
pub trait AssetFetcher {
    async fn fetch(&self, request: &AssetRequest<'_>, dest: &Path) -> Result<u64>;
}

/// Production fetcher: object storage over HTTP, or a copy out of the bundle.
#[derive(Clone)]
pub struct AssetRouter {
    net: NetworkClient,
    region: String,
}

impl AssetRouter {
    pub fn new(net: NetworkClient, region: impl Into<String>) -> Self {
        Self {
            net,
            region: region.into(),
        }
    }
}

impl AssetFetcher for AssetRouter {
    async fn fetch(&self, request: &AssetRequest<'_>, dest: &Path) -> Result<u64> {
        match &request.feed.assets {
            Some(AssetSpec::ObjectStorage { bucket, prefix }) => {
                let url = object_url(bucket, &self.region, prefix, &request.entry.remote_path);
                self.net.download_to_path(&url, dest).await
            }
            Some(AssetSpec::Bundle) => copy_from_bundle(request, dest).await,
            None => Err(SyncError::Config(format!(
                "feed {} lists assets but has no asset source",
                request.feed.name
            ))),
        }
    }
}

async fn copy_from_bundle(request: &AssetRequest<'_>, dest: &Path) -> Result<u64> {
    let Some(bundle) = request.bundle else {
        return Err(SyncError::transient(format!(
            "{} is missing and no bundle was delivered this cycle",
            request.entry.remote_path
        )));
    };
    let source = request.entry.local_path(bundle);
    if !fs::try_exists(&source).await.unwrap_or(false) {
        return Err(SyncError::validation(source, "listed in the manifest but absent from the bundle"));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(fs::copy(&source, dest).await?)
}

/// Outcome of a batch of downloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub synced: usize,
    pub failed: usize,
}

/// Sequential downloader with bounded per-item retry. Transfers land on a
/// `.part` sibling and are renamed into place only after validation, so
/// readers never observe a partial asset under its final name.
pub struct Downloader<'a, F> {
    fetcher: &'a F,
    attempts: u32,
    backoff: Duration,
}

impl<'a, F: AssetFetcher> Downloader<'a, F> {
    pub fn new(fetcher: &'a F, attempts: u32, backoff: Duration) -> Self {
        Self {
            fetcher,
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Download every entry under `root`. `on_synced` runs exactly once per
    /// entry that ends up in place.
    pub async fn download_all<P>(
        &self,
        feed: &FeedSpec,
        entries: &[Entry],
        root: &Path,
        bundle: Option<&Path>,
        on_synced: &mut P,
    ) -> DownloadOutcome
    where
        P: FnMut(&Entry) + ?Sized,
    {
        let mut outcome = DownloadOutcome::default();
        // Bundled files are either in the archive or not; retrying cannot help.
        let attempts = match feed.assets {
            Some(AssetSpec::Bundle) => 1,
            _ => self.attempts,
        };
        for entry in entries {
            let request = AssetRequest {
                feed,
                entry,
                bundle,
            };
            match self.download(&request, root, attempts).await {
                Ok(bytes) => {
                    debug!("feed[{}]: synced {} ({bytes} bytes)", feed.name, entry.remote_path);
                    outcome.synced += 1;
                    on_synced(entry);
                }
                Err(err) => {
                    warn!(
                        "feed[{}]: giving up on {} for this cycle: {err}",
                        feed.name, entry.remote_path
                    );
                    outcome.failed += 1;
                }
            }
        }
        if outcome.synced > 0 || outcome.failed > 0 {
            info!(
                "feed[{}]: downloads done ({} synced, {} failed)",
                feed.name, outcome.synced, outcome.failed
            );
        }
        outcome
    }

    async fn download(&self, request: &AssetRequest<'_>, root: &Path, attempts: u32) -> Result<u64> {
        let dest = request.entry.local_path(root);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.attempt(request, &dest).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    debug!(
                        "feed[{}]: attempt {attempt}/{attempts} for {} failed: {err}",
                        request.feed.name, request.entry.remote_path
                    );
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(backoff_delay(self.backoff, attempt)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SyncError::transient("no download attempts made")))
    }

    async fn attempt(&self, request: &AssetRequest<'_>, dest: &Path) -> Result<u64> {
        let staging = partial_path(dest);
        let result = async {
            let bytes = self.fetcher.fetch(request, &staging).await?;
            validate(&staging, request.feed.validation).await?;
            fs::rename(&staging, dest).await?;
            Ok(bytes)
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&staging).await;
        }
        result
    }
}

/// A transfer counts only when the file exists, is non-empty and, for
/// images, decodes.
pub async fn validate(path: &Path, validation: Validation) -> Result<()> {
    let len = match fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => return Err(SyncError::validation(path, "file missing after transfer")),
    };
    if len == 0 {
        return Err(SyncError::validation(path, "empty file"));
    }
    if validation == Validation::Image {
        let owned: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || decode_image(&owned))
            .await
            .map_err(|e| SyncError::validation(path, format!("decoder task failed: {e}")))??;
    }
    Ok(())
}

fn decode_image(path: &Path) -> Result<()> {
    image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map(|_| ())
        .map_err(|e| SyncError::validation(path, format!("not a decodable image: {e}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::FeedTable;
    use crate::engine::models::EntryStatus;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves bytes per path; an entry of `None` fails, a missing key fails.
    /// Each request consumes the next scripted response for that path.
    #[derive(Default)]
    pub(crate) struct FakeAssets {
        scripts: Mutex<HashMap<String, Vec<Option<Vec<u8>>>>>,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl FakeAssets {
        pub(crate) fn serve(&self, path: &str, bytes: &[u8]) {
            self.script(path, vec![Some(bytes.to_vec())]);
        }

        pub(crate) fn script(&self, path: &str, responses: Vec<Option<Vec<u8>>>) {
            self.scripts.lock().unwrap().insert(path.to_owned(), responses);
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl AssetFetcher for FakeAssets {
        async fn fetch(&self, request: &AssetRequest<'_>, dest: &Path) -> Result<u64> {
            let path = request.entry.remote_path.clone();
            self.calls.lock().unwrap().push(path.clone());
            let next = {
                let mut scripts = self.scripts.lock().unwrap();
                match scripts.get_mut(&path) {
                    Some(queue) if queue.len() > 1 => queue.remove(0),
                    Some(queue) => queue.first().cloned().flatten(),
                    None => None,
                }
            };
            let Some(bytes) = next else {
                return Err(SyncError::transient(format!("{path}: connection reset")));
            };
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(dest, &bytes).await?;
            Ok(bytes.len() as u64)
        }
    }

    pub(crate) fn active(path: &str) -> Entry {
        Entry {
            category: "entretenimento".into(),
            remote_path: path.into(),
            status: EntryStatus::Active,
            metadata: Value::Null,
        }
    }

    fn feed(name: &str) -> FeedSpec {
        FeedTable::embedded().unwrap().get(name).unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeAssets::default();
        fetcher.script("clip.mp4", vec![None, Some(Vec::new()), Some(b"video".to_vec())]);
        let downloader = Downloader::new(&fetcher, 3, Duration::from_secs(3));
        let mut synced = Vec::new();
        let outcome = downloader
            .download_all(
                &feed("entertainment"),
                &[active("clip.mp4")],
                dir.path(),
                None,
                &mut |e: &Entry| synced.push(e.remote_path.clone()),
            )
            .await;
        assert_eq!(outcome, DownloadOutcome { synced: 1, failed: 0 });
        assert_eq!(synced, ["clip.mp4"]);
        assert_eq!(fetcher.call_count(), 3);
        assert_eq!(std::fs::read(dir.path().join("clip.mp4")).unwrap(), b"video");
        assert!(!dir.path().join("clip.mp4.part").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_leave_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeAssets::default();
        fetcher.serve("empty.mp4", b"");
        let downloader = Downloader::new(&fetcher, 3, Duration::from_secs(3));
        let mut callbacks = 0;
        let outcome = downloader
            .download_all(
                &feed("entertainment"),
                &[active("empty.mp4")],
                dir.path(),
                None,
                &mut |_: &Entry| callbacks += 1,
            )
            .await;
        assert_eq!(outcome, DownloadOutcome { synced: 0, failed: 1 });
        assert_eq!(callbacks, 0);
        assert_eq!(fetcher.call_count(), 3);
        assert!(!dir.path().join("empty.mp4").exists());
        assert!(!dir.path().join("empty.mp4.part").exists());
    }

    #[tokio::test]
    async fn image_feeds_reject_undecodable_files() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeAssets::default();
        fetcher.serve("broken.jpg", b"<html>not an image</html>");
        let downloader = Downloader::new(&fetcher, 1, Duration::ZERO);
        let outcome = downloader
            .download_all(&feed("news"), &[active("broken.jpg")], dir.path(), None, &mut |_: &Entry| {})
            .await;
        assert_eq!(outcome.failed, 1);
        assert!(!dir.path().join("broken.jpg").exists());
    }

    #[tokio::test]
    async fn image_feeds_accept_real_images() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("source.png");
        image::RgbImage::new(2, 2).save(&png).unwrap();
        let fetcher = FakeAssets::default();
        fetcher.serve("ok.png", &std::fs::read(&png).unwrap());
        let root = dir.path().join("News");
        let downloader = Downloader::new(&fetcher, 1, Duration::ZERO);
        let outcome = downloader
            .download_all(&feed("news"), &[active("ok.png")], &root, None, &mut |_: &Entry| {})
            .await;
        assert_eq!(outcome.synced, 1);
        assert!(root.join("ok.png").exists());
    }

    #[tokio::test]
    async fn bundle_assets_copy_from_staging_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        std::fs::create_dir_all(bundle.join("Banners")).unwrap();
        std::fs::write(bundle.join("Banners").join("a.png"), b"png").unwrap();
        let root = dir.path().join("sistema");
        let router = AssetRouter::new(
            NetworkClient::new(&crate::config::Settings::default()),
            "sa-east-1",
        );
        let downloader = Downloader::new(&router, 3, Duration::from_secs(60));
        let outcome = downloader
            .download_all(
                &feed("general"),
                &[active("Banners/a.png"), active("Banners/missing.png")],
                &root,
                Some(&bundle),
                &mut |_: &Entry| {},
            )
            .await;
        assert_eq!(outcome, DownloadOutcome { synced: 1, failed: 1 });
        assert_eq!(std::fs::read(root.join("Banners").join("a.png")).unwrap(), b"png");
    }
}

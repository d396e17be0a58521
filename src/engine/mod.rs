use std::future::Future;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::config::{FeedSpec, FeedTable, ScreenConfig, Settings};
use crate::env::AppPaths;
use crate::error::{Result, SyncError};
use crate::networking::{BackendClient, NetworkClient, UpdateServer};
use crate::storage::StorageManager;

pub mod differ;
pub mod downloader;
pub mod models;
pub mod pipeline;
pub mod pruner;
pub mod scheduler;
pub mod source;
pub mod state;

use downloader::AssetRouter;
use models::CycleReport;
use pipeline::Pipeline;
use pruner::{DeletionWindow, NowPlaying};
use scheduler::Scheduler;
use source::BackendSource;
use state::SyncEvent;

pub type LivePipeline = Pipeline<BackendSource, AssetRouter, NowPlaying>;

/// The content updater: every feed of the table, wired to the live remotes.
pub struct SyncEngine {
    pipeline: LivePipeline,
    scheduler: Scheduler,
    feeds: FeedTable,
}

impl SyncEngine {
    pub fn new(paths: &AppPaths, settings: &Settings, screen: ScreenConfig, feeds: FeedTable) -> Self {
        let net = NetworkClient::new(settings);
        let server = UpdateServer::new(net.clone(), settings.update_server.clone());
        let backend = BackendClient::new(
            net.clone(),
            settings.backend_url.clone(),
            settings.backend_key.clone(),
        );
        let source = BackendSource::new(
            server,
            backend,
            paths.clone(),
            screen,
            settings.download_attempts,
            settings.retry_backoff(),
        );
        let fetcher = AssetRouter::new(net, settings.storage_region.clone());
        let in_use = NowPlaying::new(paths.in_use_path(), paths.cache_dir(), settings.in_use_ttl());
        let window = DeletionWindow::new(paths.pending_deletions_path(), settings.deletion_grace());
        let pipeline = Pipeline::new(
            source,
            fetcher,
            in_use,
            window,
            StorageManager::new(paths),
            settings.download_attempts,
            settings.retry_backoff(),
        );
        info!(
            "engine: client {} with {} feeds",
            screen.client_id,
            feeds.feeds.len()
        );
        Self {
            pipeline,
            scheduler: Scheduler::new(settings.interval(), settings.retry_delay()),
            feeds,
        }
    }

    pub fn watch(&mut self, updates: mpsc::UnboundedSender<SyncEvent>) {
        self.pipeline.watch(updates);
    }

    pub fn unwatch(&mut self) {
        self.pipeline.unwatch();
    }

    /// Poll every feed until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        self.scheduler
            .run(&self.pipeline, &self.feeds.feeds, shutdown)
            .await;
    }

    /// One cycle of the named feed, or of every feed in table order.
    pub async fn run_once(&self, only: Option<&str>) -> Result<Vec<(String, Result<CycleReport>)>> {
        let selected: Vec<&FeedSpec> = match only {
            Some(name) => {
                let feed = self
                    .feeds
                    .get(name)
                    .ok_or_else(|| SyncError::Config(format!("unknown feed {name:?}")))?;
                vec![feed]
            }
            None => self.feeds.feeds.iter().collect(),
        };
        let mut results = Vec::with_capacity(selected.len());
        for feed in selected {
            let outcome = self.pipeline.run_cycle(feed).await;
            if let Err(err) = &outcome {
                warn!("feed[{}]: cycle failed: {err}", feed.name);
            }
            results.push((feed.name.clone(), outcome));
        }
        Ok(results)
    }
}

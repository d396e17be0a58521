use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use tokio::sync::mpsc;

use crate::config::{FeedTable, Settings, parse_screen_id};
use crate::engine::SyncEngine;
use crate::engine::models::CycleReport;
use crate::engine::state::SyncEvent;
use crate::env::AppPaths;
use crate::error::Result;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// What first-run provisioning achieved across every feed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub feeds_ok: usize,
    pub feeds_failed: Vec<String>,
    pub planned: usize,
    pub synced: usize,
    pub failed: usize,
}

impl ProvisionSummary {
    /// Partial or empty downloads never count as a finished install.
    pub fn is_success(&self) -> bool {
        self.feeds_failed.is_empty() && self.failed == 0 && (self.planned == 0 || self.synced > 0)
    }
}

pub fn summarize(results: &[(String, Result<CycleReport>)], planned: usize) -> ProvisionSummary {
    let mut summary = ProvisionSummary {
        planned,
        ..Default::default()
    };
    for (name, outcome) in results {
        match outcome {
            Ok(report) => {
                summary.feeds_ok += 1;
                summary.synced += report.downloaded;
                summary.failed += report.failed;
            }
            Err(_) => summary.feeds_failed.push(name.clone()),
        }
    }
    summary
}

/// Record the screen id, then run one cycle of every feed with a progress bar.
pub async fn provision(
    paths: &AppPaths,
    settings: &Settings,
    screen_id: &str,
    feeds: FeedTable,
) -> Result<ProvisionSummary> {
    let screen = parse_screen_id(screen_id)?;
    paths.ensure_base_dirs()?;
    screen.save(&paths.config_path())?;
    info!(
        "provision: screen {} (model {}) written to {}",
        screen.client_id,
        screen.model,
        paths.config_path().display()
    );

    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.enable_steady_tick(Duration::from_millis(120));

    let (tx, rx) = mpsc::unbounded_channel();
    let watcher = tokio::spawn(follow(bar.clone(), rx));

    let mut engine = SyncEngine::new(paths, settings, screen, feeds);
    engine.watch(tx);
    let results = engine.run_once(None).await?;
    engine.unwatch();
    let planned = watcher.await.unwrap_or_default();

    let summary = summarize(&results, planned);
    if summary.is_success() {
        bar.finish_with_message("done");
        info!("provision: {} item(s) synced", summary.synced);
    } else {
        bar.abandon_with_message("failed");
        error!(
            "provision: incomplete ({} synced of {} planned, {} failed, feeds failed: {:?})",
            summary.synced, summary.planned, summary.failed, summary.feeds_failed
        );
    }
    Ok(summary)
}

/// Drive the bar from pipeline events; returns the total planned.
async fn follow(bar: ProgressBar, mut events: mpsc::UnboundedReceiver<SyncEvent>) -> usize {
    let mut planned = 0;
    while let Some(event) = events.recv().await {
        planned += apply(&bar, &event);
    }
    planned
}

fn apply(bar: &ProgressBar, event: &SyncEvent) -> usize {
    match event {
        SyncEvent::Stage { feed, stage } => {
            bar.set_message(format!("{feed}: {stage}"));
            0
        }
        SyncEvent::Planned { missing, .. } => {
            bar.inc_length(*missing as u64);
            *missing
        }
        SyncEvent::Synced { path, .. } => {
            bar.inc(1);
            bar.set_message(path.clone());
            0
        }
        SyncEvent::Finished(report) => {
            bar.println(format!("{}: {report}", report.feed));
            0
        }
        SyncEvent::Failed { feed, error } => {
            bar.println(format!("{feed}: FAILED ({error})"));
            0
        }
    }
}

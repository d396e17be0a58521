use std::fmt::Write;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::{Client, Url};
use serde::Serialize;
use std::env::consts as os_consts;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{FeedSpec, FeedTable, ScreenConfig, Settings};
use crate::engine::differ;
use crate::engine::models::Manifest;
use crate::engine::source::document_of;
use crate::env::AppPaths;
use crate::error::Result;
use crate::lock;
use crate::storage::{StorageManager, local_snapshot};
use crate::updater::read_software_version;

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub platform: PlatformInfo,
    pub connectivity: ConnectivityInfo,
    pub feeds: Vec<FeedStatus>,
    pub locks: Vec<LockStatus>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub sync_version: String,
    pub base_dir: String,
    pub client_id: i64,
    pub software_version: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ConnectivityInfo {
    pub update_server: bool,
    pub backend: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct FeedStatus {
    pub name: String,
    pub version: Option<String>,
    pub published: bool,
    pub assets: Option<usize>,
    pub missing: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct LockStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub alive: bool,
}

pub struct Diagnostics {
    client: Client,
    paths: AppPaths,
    settings: Settings,
    screen: ScreenConfig,
    feeds: FeedTable,
}

impl Diagnostics {
    pub fn new(paths: AppPaths, settings: Settings, screen: ScreenConfig, feeds: FeedTable) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("lobby-sync-diagnostics/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|err| {
                warn!("diagnostics: default HTTP client in use ({err})");
                Client::new()
            });
        Self {
            client,
            paths,
            settings,
            screen,
            feeds,
        }
    }

    pub async fn run(&self) -> DiagnosticReport {
        DiagnosticReport {
            platform: self.platform_info().await,
            connectivity: self.check_connectivity().await,
            feeds: self.feed_statuses().await,
            locks: self.lock_statuses(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn save_report(&self, report: &DiagnosticReport) -> Result<PathBuf> {
        info!("diagnostics: saving report");
        let logs = self.paths.logs_dir();
        fs::create_dir_all(&logs)?;

        let filename = format!(
            "diagnostic_{}.txt",
            report
                .timestamp
                .replace(':', "-")
                .replace(' ', "_")
                .replace('.', "-")
        );
        let path = logs.join(filename);
        fs::write(&path, format_report(report))?;
        info!("diagnostics: report written to {}", path.display());
        Ok(path)
    }

    async fn platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            os: os_consts::OS.into(),
            arch: os_consts::ARCH.into(),
            sync_version: env!("CARGO_PKG_VERSION").into(),
            base_dir: self.paths.base_dir().display().to_string(),
            client_id: self.screen.client_id,
            software_version: read_software_version(&self.paths.cache_file("versao_software.json"))
                .await,
        }
    }

    async fn feed_statuses(&self) -> Vec<FeedStatus> {
        let storage = StorageManager::new(&self.paths);
        let mut statuses = Vec::with_capacity(self.feeds.feeds.len());
        for feed in &self.feeds.feeds {
            statuses.push(feed_status(&storage, feed).await);
        }
        statuses
    }

    fn lock_statuses(&self) -> Vec<LockStatus> {
        [
            ("updater", self.paths.updater_lock()),
            ("watchdog", self.paths.watchdog_lock()),
        ]
        .into_iter()
        .map(|(name, path)| {
            let holder = lock::holder(&path);
            LockStatus {
                name: name.into(),
                pid: holder.map(|(pid, _)| pid),
                alive: holder.is_some_and(|(_, alive)| alive),
            }
        })
        .collect()
    }

    async fn check_connectivity(&self) -> ConnectivityInfo {
        info!("diagnostics: checking connectivity");
        let mut info = ConnectivityInfo {
            update_server: self.endpoint_ok(&self.settings.update_server).await,
            backend: self.endpoint_ok(&self.settings.backend_url).await,
            ..Default::default()
        };
        if Url::parse(&self.settings.update_server).is_err() {
            info.error = Some(format!(
                "update_server is not a URL: {}",
                self.settings.update_server
            ));
        }
        info
    }

    async fn endpoint_ok(&self, url: &str) -> bool {
        if self.http_probe(url).await {
            return true;
        }

        // Any answer at all proves reachability; fall back to a bare TCP connect.
        if let Some((host, port)) = host_and_port(url) {
            return tcp_probe(&host, port).await;
        }

        false
    }

    async fn http_probe(&self, url: &str) -> bool {
        debug!("diagnostics: HTTP probe {url}");
        let ok = self
            .client
            .get(url)
            .header("Accept", "*/*")
            .send()
            .await
            .is_ok();
        if !ok {
            warn!("diagnostics: {url} HTTP probe failed");
        }
        ok
    }
}

/// Local view of one feed: version, published manifest and asset coverage.
pub async fn feed_status(storage: &StorageManager, feed: &FeedSpec) -> FeedStatus {
    let published = storage.read_published(feed).await;
    let mut status = FeedStatus {
        name: feed.name.clone(),
        version: storage.read_version(feed).await.map(|token| token.to_string()),
        published: published.is_some(),
        ..Default::default()
    };
    let Some(root) = storage.asset_root(feed) else {
        return status;
    };
    let local = local_snapshot(&root).unwrap_or_default();
    status.assets = Some(local.len());
    if let Some(document) = published.as_ref().and_then(|p| document_of(feed, p)) {
        let manifest = Manifest::from_document(&document, &feed.categories);
        status.missing = Some(differ::diff(&manifest, &local).missing.len());
    }
    status
}

fn host_and_port(url: &str) -> Option<(String, u16)> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_owned();
    let port = parsed.port_or_known_default()?;
    Some((host, port))
}

async fn tcp_probe(host: &str, port: u16) -> bool {
    let connect = TcpStream::connect(format!("{host}:{port}"));
    let ok = matches!(timeout(Duration::from_secs(5), connect).await, Ok(Ok(_)));
    if ok {
        debug!("diagnostics: TCP probe {host}:{port} ok");
    } else {
        warn!("diagnostics: TCP probe {host}:{port} failed");
    }
    ok
}

pub fn format_report(report: &DiagnosticReport) -> String {
    let mut output = String::new();

    let yes_no = |value| if value { "yes" } else { "no" };
    let status = |value| if value { "OK" } else { "FAILED" };
    let count = |value: Option<usize>| value.map_or_else(|| "-".to_owned(), |n| n.to_string());

    let missing: usize = report.feeds.iter().filter_map(|f| f.missing).sum();
    let reachable = report.connectivity.update_server && report.connectivity.backend;

    let _ = writeln!(&mut output, "lobby-sync Diagnostic Report");
    let _ = writeln!(&mut output, "Generated: {}", report.timestamp);
    let _ = writeln!(
        &mut output,
        "Summary: connectivity={} | client={} | missing assets={}",
        status(reachable),
        report.platform.client_id,
        missing
    );

    let _ = writeln!(&mut output, "\n=== PLATFORM ===");
    let _ = writeln!(&mut output, "OS: {}", report.platform.os);
    let _ = writeln!(&mut output, "Arch: {}", report.platform.arch);
    let _ = writeln!(&mut output, "Sync Version: {}", report.platform.sync_version);
    let _ = writeln!(&mut output, "Base Dir: {}", report.platform.base_dir);
    let _ = writeln!(
        &mut output,
        "Installed Software: v{}",
        report.platform.software_version
    );

    let _ = writeln!(&mut output, "\n=== CONNECTIVITY ===");
    let _ = writeln!(
        &mut output,
        "Update Server: {}",
        status(report.connectivity.update_server)
    );
    let _ = writeln!(&mut output, "Backend: {}", status(report.connectivity.backend));
    if let Some(err) = &report.connectivity.error {
        let _ = writeln!(&mut output, "Notes: {err}");
    }

    let _ = writeln!(&mut output, "\n=== FEEDS ===");
    for feed in &report.feeds {
        let _ = writeln!(
            &mut output,
            "{}: version={} published={} assets={} missing={}",
            feed.name,
            feed.version.as_deref().unwrap_or("never synced"),
            yes_no(feed.published),
            count(feed.assets),
            count(feed.missing),
        );
    }

    let _ = writeln!(&mut output, "\n=== LOCKS ===");
    for lock in &report.locks {
        let holder = match lock.pid {
            Some(pid) if lock.alive => format!("held by pid {pid}"),
            Some(pid) => format!("stale record of pid {pid}"),
            None => "free".to_owned(),
        };
        let _ = writeln!(&mut output, "{}: {holder}", lock.name);
    }

    output
}

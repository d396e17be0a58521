use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{Value, json};

use crate::archive;
use crate::engine::models::VersionRecord;
use crate::env::AppPaths;
use crate::error::{Result, SyncError};
use crate::networking::{BackendClient, NetworkClient, TableQuery};
use crate::process::AppControl;
use crate::storage::write_atomic;
use crate::util::backoff_delay;

const SOFTWARE_TABLE: &str = "sistema_update";
const SOFTWARE_VERSION_FILE: &str = "versao_software.json";
const SOFTWARE_BASELINE: i64 = 1;
const RELAUNCH_ATTEMPTS: u32 = 3;
const RELAUNCH_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Release {
    pub version: i64,
    pub url: String,
}

/// Where application releases are announced and acknowledged.
pub trait ReleaseChannel {
    async fn latest(&self) -> Result<Option<Release>>;
    async fn download(&self, release: &Release, dest: &Path) -> Result<u64>;
    async fn confirm_installed(&self, version: i64) -> Result<()>;
}

/// Releases published per screen in the backend's `sistema_update` table.
pub struct BackendChannel {
    backend: BackendClient,
    net: NetworkClient,
    client_id: i64,
    attempts: u32,
    backoff: Duration,
}

impl BackendChannel {
    pub fn new(
        backend: BackendClient,
        net: NetworkClient,
        client_id: i64,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            backend,
            net,
            client_id,
            attempts,
            backoff,
        }
    }

    fn query(&self) -> TableQuery {
        TableQuery::new(SOFTWARE_TABLE).eq("cliente_id", self.client_id)
    }
}

impl ReleaseChannel for BackendChannel {
    async fn latest(&self) -> Result<Option<Release>> {
        let query = self
            .query()
            .select(["versao_disponivel", "download_url"])
            .limit(1);
        let rows = self.backend.select(&query).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        parse_release(row)
    }

    async fn download(&self, release: &Release, dest: &Path) -> Result<u64> {
        self.net
            .download_with_retry(&release.url, dest, self.attempts, self.backoff)
            .await
    }

    async fn confirm_installed(&self, version: i64) -> Result<()> {
        let body = json!({"versao_instalada": version, "atualizado": true});
        self.backend.update(&self.query(), &body).await
    }
}

fn parse_release(row: &Value) -> Result<Option<Release>> {
    let Some(version) = row.get("versao_disponivel").and_then(Value::as_i64) else {
        return Ok(None);
    };
    match row.get("download_url").and_then(Value::as_str) {
        Some(url) if !url.trim().is_empty() => Ok(Some(Release {
            version,
            url: url.trim().to_owned(),
        })),
        _ => Err(SyncError::transient(format!(
            "release v{version} has no download_url"
        ))),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    UpToDate { local: i64 },
    /// The new build is installed and running; the watchdog must exit.
    Relaunched { version: i64 },
    /// The new build is installed and the old app stopped, but it would not start.
    AppDown { version: i64 },
}

/// CHECK, DOWNLOAD_BUNDLE, EXTRACT, PERSIST_VERSION, TERMINATE_OLD, RELAUNCH.
pub struct SelfUpdater<C, A> {
    channel: C,
    app: A,
    paths: AppPaths,
}

impl<C: ReleaseChannel, A: AppControl> SelfUpdater<C, A> {
    pub fn new(channel: C, app: A, paths: AppPaths) -> Self {
        Self { channel, app, paths }
    }

    fn version_path(&self) -> PathBuf {
        self.paths.cache_file(SOFTWARE_VERSION_FILE)
    }

    pub async fn local_version(&self) -> i64 {
        read_software_version(&self.version_path()).await
    }

    /// One pass of the state machine.
    pub async fn check(&self) -> Result<WatchOutcome> {
        let local = self.local_version().await;
        let release = match self.channel.latest().await? {
            Some(release) if release.version > local => release,
            other => {
                debug!(
                    "watchdog: local v{local}, remote {:?}",
                    other.map(|r| r.version)
                );
                return Ok(WatchOutcome::UpToDate { local });
            }
        };
        info!("watchdog: v{} available (installed v{local})", release.version);

        let bundle = self
            .paths
            .cache_file(&format!("software_v{}.zip", release.version));
        let staging = self.paths.staging_dir("software");
        let installed = self.install(&release, &bundle, &staging).await;
        let _ = tokio::fs::remove_file(&bundle).await;
        let _ = tokio::fs::remove_dir_all(&staging).await;
        installed?;

        let record = VersionRecord::Number {
            versao: release.version,
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| SyncError::lifecycle(format!("unable to encode version: {e}")))?;
        write_atomic(&self.version_path(), &bytes).await?;
        info!("watchdog: recorded v{}", release.version);
        if let Err(err) = self.channel.confirm_installed(release.version).await {
            warn!("watchdog: could not report v{} as installed: {err}", release.version);
        }

        let stopped = self.app.stop().await?;
        debug!("watchdog: stopped {stopped} instance(s)");
        match self.relaunch().await {
            Ok(()) => Ok(WatchOutcome::Relaunched {
                version: release.version,
            }),
            Err(err) => {
                error!("watchdog: v{} installed but the app is down: {err}", release.version);
                Ok(WatchOutcome::AppDown {
                    version: release.version,
                })
            }
        }
    }

    /// Start the app, retrying a few times before giving up.
    async fn relaunch(&self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.app.launch() {
                Ok(()) => return Ok(()),
                Err(err) if attempt < RELAUNCH_ATTEMPTS => {
                    let delay = backoff_delay(RELAUNCH_BACKOFF, attempt);
                    warn!(
                        "watchdog: launch attempt {attempt}/{RELAUNCH_ATTEMPTS} failed: {err}; retrying in {}s",
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn install(&self, release: &Release, bundle: &Path, staging: &Path) -> Result<()> {
        self.channel.download(release, bundle).await?;
        let (archive_path, staging_dir, base_dir) = (
            bundle.to_path_buf(),
            staging.to_path_buf(),
            self.paths.base_dir().to_path_buf(),
        );
        let copied = tokio::task::spawn_blocking(move || -> Result<usize> {
            archive::extract_zip(&archive_path, &staging_dir)?;
            archive::copy_tree(&staging_dir, &base_dir)
        })
        .await
        .map_err(|e| SyncError::lifecycle(format!("install task failed: {e}")))?
        .map_err(|e| SyncError::lifecycle(format!("bundle v{} not installed: {e}", release.version)))?;
        info!("watchdog: installed {copied} files from v{}", release.version);
        Ok(())
    }

    /// Poll until a release is installed and running, or `shutdown` resolves.
    /// Once an install leaves the app down, only relaunches are attempted.
    pub async fn run(
        &self,
        interval: Duration,
        retry_delay: Duration,
        shutdown: impl Future<Output = ()>,
    ) -> Option<i64> {
        tokio::pin!(shutdown);
        let mut down = None;
        loop {
            let delay = if let Some(version) = down {
                match self.relaunch().await {
                    Ok(()) => {
                        info!("watchdog: v{version} started");
                        return Some(version);
                    }
                    Err(err) => {
                        error!(
                            "watchdog: v{version} still down: {err}; retrying in {}s",
                            retry_delay.as_secs()
                        );
                        retry_delay
                    }
                }
            } else {
                match self.check().await {
                    Ok(WatchOutcome::Relaunched { version }) => return Some(version),
                    Ok(WatchOutcome::AppDown { version }) => {
                        down = Some(version);
                        retry_delay
                    }
                    Ok(WatchOutcome::UpToDate { .. }) => interval,
                    Err(err) => {
                        error!("watchdog: update aborted: {err}; retrying in {}s", retry_delay.as_secs());
                        retry_delay
                    }
                }
            };
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("watchdog: shutdown requested");
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

pub async fn read_software_version(path: &Path) -> i64 {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return SOFTWARE_BASELINE;
    };
    match serde_json::from_slice::<VersionRecord>(&bytes) {
        Ok(VersionRecord::Number { versao }) => versao,
        _ => {
            warn!("watchdog: unreadable {}; assuming v{SOFTWARE_BASELINE}", path.display());
            SOFTWARE_BASELINE
        }
    }
}

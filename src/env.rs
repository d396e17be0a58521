use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "lobby-signage";

/// Returns the root directory used when `--base-dir` is not given.
pub fn default_app_dir() -> PathBuf {
    if let Some(dir) = env::var_os("LOBBY_SYNC_HOME") {
        return PathBuf::from(dir);
    }
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".local").join("share")),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR_NAME)
}

/// On-disk layout shared by the updater, the watchdog and the display app.
#[derive(Clone, Debug)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }

    pub fn cache_file(&self, name: &str) -> PathBuf {
        self.cache_dir().join(name)
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.base_dir.join("settings.json")
    }

    pub fn feeds_path(&self) -> PathBuf {
        self.base_dir.join("feeds.json")
    }

    pub fn updater_lock(&self) -> PathBuf {
        self.cache_file("atualizador.lock")
    }

    pub fn watchdog_lock(&self) -> PathBuf {
        self.cache_file("software_updater.lock")
    }

    pub fn in_use_path(&self) -> PathBuf {
        self.cache_file("em_uso.json")
    }

    pub fn pending_deletions_path(&self) -> PathBuf {
        self.cache_file("pendentes.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn staging_dir(&self, label: &str) -> PathBuf {
        self.cache_dir().join(".staging").join(label)
    }

    /// Create the folder layout every process expects.
    pub fn ensure_base_dirs(&self) -> std::io::Result<()> {
        for dir in [self.base_dir.clone(), self.cache_dir()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockfiles_live_in_the_cache_dir() {
        let paths = AppPaths::new("/srv/kiosk");
        assert_eq!(
            paths.updater_lock(),
            PathBuf::from("/srv/kiosk/cache/atualizador.lock")
        );
        assert_eq!(
            paths.watchdog_lock(),
            PathBuf::from("/srv/kiosk/cache/software_updater.lock")
        );
        assert_eq!(paths.config_path(), PathBuf::from("/srv/kiosk/config.json"));
    }

    #[test]
    fn creates_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path().join("app"));
        paths.ensure_base_dirs().unwrap();
        assert!(paths.cache_dir().is_dir());
    }
}

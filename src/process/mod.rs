use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use log::{debug, info, warn};
use sysinfo::{
    Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind,
};
use tokio::time::{Instant, sleep};

use crate::config::Settings;
use crate::error::{Result, SyncError};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Stop and start the display application.
pub trait AppControl {
    /// Terminate every running instance; returns how many were found.
    async fn stop(&self) -> Result<usize>;
    fn launch(&self) -> Result<()>;
}

/// Finds the display app by command line and relaunches it from the
/// install directory.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    base_dir: PathBuf,
    app_match: String,
    command: Vec<String>,
    terminate_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(base_dir: PathBuf, settings: &Settings) -> Self {
        Self {
            base_dir,
            app_match: settings.app_match.clone(),
            command: settings.app_command.clone(),
            terminate_timeout: settings.terminate_timeout(),
        }
    }

    fn running(&self, system: &mut System) -> Vec<Pid> {
        // Command lines are not loaded by the default refresh.
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        let own = sysinfo::get_current_pid().ok();
        system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != own)
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            .filter(|(_, process)| command_matches(process.cmd(), &self.app_match))
            .map(|(pid, _)| *pid)
            .collect()
    }
}

impl AppControl for ProcessLauncher {
    async fn stop(&self) -> Result<usize> {
        let mut system = System::new();
        let targets = self.running(&mut system);
        if targets.is_empty() {
            info!("process: no running instance matches {:?}", self.app_match);
            return Ok(0);
        }
        for pid in &targets {
            if let Some(process) = system.process(*pid) {
                info!("process: terminating pid {pid}");
                // Platforms without SIGTERM only offer the hard kill.
                if process.kill_with(Signal::Term).is_none() {
                    process.kill();
                }
            }
        }

        let deadline = Instant::now() + self.terminate_timeout;
        loop {
            let remaining: Vec<Pid> = self
                .running(&mut system)
                .into_iter()
                .filter(|pid| targets.contains(pid))
                .collect();
            if remaining.is_empty() {
                debug!("process: all {} instance(s) exited", targets.len());
                return Ok(targets.len());
            }
            if Instant::now() >= deadline {
                for pid in &remaining {
                    warn!("process: pid {pid} ignored terminate, killing");
                    if let Some(process) = system.process(*pid) {
                        process.kill();
                    }
                }
                return Ok(targets.len());
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    fn launch(&self) -> Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(SyncError::Config("app_command is empty".into()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.base_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            // CREATE_NO_WINDOW | DETACHED_PROCESS
            cmd.creation_flags(0x08000000 | 0x00000008);
        }

        let child = cmd
            .spawn()
            .map_err(|e| SyncError::lifecycle(format!("failed to start {program}: {e}")))?;
        info!("process: relaunched {} as pid {}", self.command.join(" "), child.id());
        Ok(())
    }
}

fn command_matches(cmd: &[OsString], needle: &str) -> bool {
    !needle.is_empty()
        && cmd
            .iter()
            .any(|arg| arg.to_string_lossy().contains(needle))
}

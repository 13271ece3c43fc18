use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};
use sysinfo::{Pid, System};

use crate::config::get_data_dir;

/// Pid-file based single-instance control for the agent.
pub struct DaemonControl {
    pid_file: PathBuf,
}

impl DaemonControl {
    /// Control backed by the default pid file.
    ///
    /// # Errors
    ///
    /// Returns an error if the local data directory cannot be determined.
    pub fn new() -> Result<Self> {
        Ok(Self::with_pid_file(Self::default_pid_path()?))
    }

    #[must_use]
    pub fn with_pid_file(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
        }
    }

    /// Get default PID file path
    ///
    /// # Errors
    ///
    /// Returns an error if the local data directory cannot be determined.
    pub fn default_pid_path() -> Result<PathBuf> {
        Ok(get_data_dir()?.join("focusgate.pid"))
    }

    #[must_use]
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// PID recorded in the pid file, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn get_pid(&self) -> Result<Option<u32>> {
        if !self.pid_file.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.pid_file)
            .with_context(|| format!("Failed to read {}", self.pid_file.display()))?;
        let pid = contents
            .trim()
            .parse::<u32>()
            .with_context(|| format!("Invalid pid file {}", self.pid_file.display()))?;
        Ok(Some(pid))
    }

    /// PID of another live agent owning the pid file.
    #[must_use]
    pub fn running_pid(&self) -> Option<u32> {
        let pid = self.get_pid().ok().flatten()?;
        if pid == std::process::id() {
            return None;
        }
        let mut sys = System::new();
        sys.refresh_process(Pid::from_u32(pid)).then_some(pid)
    }

    /// Claim the pid file for this process.
    ///
    /// A stale file left by a dead agent is replaced. The returned guard
    /// removes the file when dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if another agent is running or the file cannot be written.
    pub fn acquire(self) -> Result<InstanceGuard> {
        if let Some(pid) = self.running_pid() {
            anyhow::bail!("focusgate is already running (PID: {pid})");
        }
        if self.pid_file.exists() {
            log::warn!("Removing stale PID file.");
        }
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.pid_file, std::process::id().to_string())
            .with_context(|| format!("Failed to write {}", self.pid_file.display()))?;
        Ok(InstanceGuard { control: self })
    }

    /// Remove PID file
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove_pid(&self) -> Result<()> {
        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file)?;
        }
        Ok(())
    }
}

/// Holds the pid file for the lifetime of the agent.
pub struct InstanceGuard {
    control: DaemonControl,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        // Leave the file alone if another instance has since claimed it.
        if self.control.get_pid().ok().flatten() != Some(std::process::id()) {
            return;
        }
        if let Err(e) = self.control.remove_pid() {
            log::warn!("Failed to remove PID file: {e}");
        }
    }
}

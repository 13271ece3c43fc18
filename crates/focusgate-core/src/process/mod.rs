use anyhow::Result;
use std::{
    collections::{BTreeSet, HashSet},
    fmt,
};
use thiserror::Error;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(unix)]
pub mod unix;

#[cfg(not(any(unix, target_os = "windows")))]
compile_error!("focusgate supports Windows and Unix hosts only");

/// A running process instance. Two instances of the same executable are
/// distinct records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
}

impl ProcessRecord {
    #[must_use]
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }
}

impl fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.name, self.pid)
    }
}

/// Ordered by pid.
pub type ProcessSet = BTreeSet<ProcessRecord>;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no processes found in session {0}")]
    NoProcesses(u32),
    #[error("no instances of {name} found in session {session}")]
    NotFound { name: String, session: u32 },
    #[error("failed to snapshot the process table: {0}")]
    Snapshot(String),
    #[error("{operation} failed for pid {pid}: {reason}")]
    Os {
        operation: &'static str,
        pid: u32,
        reason: String,
    },
}

/// An opened process instance that can be suspended and resumed.
pub trait InstanceHandle: Send + fmt::Debug {
    fn pid(&self) -> u32;
}

/// Session-scoped view of the process table.
///
/// Every listing and handle is restricted to the session the agent itself runs
/// in; implementations never return a process from another session.
pub trait ProcessDirectory: Send + Sync {
    type Handle: InstanceHandle;

    /// Session the directory is bound to
    fn session_id(&self) -> u32;

    /// Every process in the session
    fn list_session_processes(&self) -> Result<ProcessSet, ProcessError>;

    /// One handle per running instance of `name` in the session
    fn handles_in_session(&self, name: &str) -> Result<Vec<Self::Handle>, ProcessError>;

    /// Freeze every thread of the instance
    fn suspend(&self, handle: &Self::Handle) -> Result<(), ProcessError>;

    /// Thaw every thread of the instance
    fn resume(&self, handle: &Self::Handle) -> Result<(), ProcessError>;
}

/// Records in `have` whose executable name is in `want`.
#[must_use]
pub fn intersect(have: &ProcessSet, want: &BTreeSet<String>) -> ProcessSet {
    have.iter()
        .filter(|record| want.contains(&record.name))
        .cloned()
        .collect()
}

/// Whether both sets target exactly the same pids.
#[must_use]
pub fn pid_set_equals(a: &ProcessSet, b: &ProcessSet) -> bool {
    let pids = |set: &ProcessSet| set.iter().map(|r| r.pid).collect::<HashSet<_>>();
    a.len() == b.len() && pids(a) == pids(b)
}

/// Distinct executable names in a set.
#[must_use]
pub fn names_of(set: &ProcessSet) -> BTreeSet<String> {
    set.iter().map(|record| record.name.clone()).collect()
}

#[cfg(target_os = "windows")]
pub type PlatformDirectory = self::windows::WindowsDirectory;

#[cfg(unix)]
pub type PlatformDirectory = self::unix::UnixDirectory;

/// Create the directory for the current platform, bound to the caller's session.
///
/// # Errors
///
/// Returns an error if the caller's session cannot be determined.
pub fn create_directory() -> Result<PlatformDirectory> {
    PlatformDirectory::new()
}

use anyhow::{Context, Result};
use std::{
    io,
    sync::{Mutex, PoisonError},
};
use sysinfo::System;

use super::{InstanceHandle, ProcessDirectory, ProcessError, ProcessRecord, ProcessSet};

/// Session of `pid`, or `None` if it no longer exists or cannot be queried.
fn session_of(pid: libc::pid_t) -> Option<u32> {
    // SAFETY: getsid only reads kernel state for the given pid.
    let sid = unsafe { libc::getsid(pid) };
    u32::try_from(sid).ok()
}

fn to_pid_t(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok()
}

#[derive(Debug)]
pub struct UnixHandle {
    pid: u32,
}

impl InstanceHandle for UnixHandle {
    fn pid(&self) -> u32 {
        self.pid
    }
}

/// Process directory backed by `/proc` (through `sysinfo`) and job-control
/// signals. The session is the POSIX session of the agent process.
pub struct UnixDirectory {
    session_id: u32,
    system: Mutex<System>,
}

impl UnixDirectory {
    /// Bind to the caller's session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session of the current process cannot be read.
    pub fn new() -> Result<Self> {
        let session_id = session_of(0)
            .ok_or_else(io::Error::last_os_error)
            .context("Failed to resolve the current session id")?;
        log::debug!("Process directory bound to session {session_id}");
        Ok(Self {
            session_id,
            system: Mutex::new(System::new()),
        })
    }

    fn snapshot(&self) -> Vec<ProcessRecord> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes();
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessRecord::new(pid.as_u32(), process.name()))
            .filter(|record| {
                to_pid_t(record.pid).and_then(session_of) == Some(self.session_id)
            })
            .collect()
    }

    fn signal(
        &self,
        handle: &UnixHandle,
        signal: libc::c_int,
        operation: &'static str,
    ) -> Result<(), ProcessError> {
        let os_error = |reason: String| ProcessError::Os {
            operation,
            pid: handle.pid,
            reason,
        };
        let pid =
            to_pid_t(handle.pid).ok_or_else(|| os_error(String::from("pid out of range")))?;
        // The pid may have been recycled since the handle was taken.
        if session_of(pid) != Some(self.session_id) {
            return Err(os_error(format!("no longer in session {}", self.session_id)));
        }
        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid, signal) } == 0 {
            Ok(())
        } else {
            Err(os_error(io::Error::last_os_error().to_string()))
        }
    }
}

impl ProcessDirectory for UnixDirectory {
    type Handle = UnixHandle;

    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn list_session_processes(&self) -> Result<ProcessSet, ProcessError> {
        let records: ProcessSet = self.snapshot().into_iter().collect();
        if records.is_empty() {
            return Err(ProcessError::NoProcesses(self.session_id));
        }
        Ok(records)
    }

    fn handles_in_session(&self, name: &str) -> Result<Vec<UnixHandle>, ProcessError> {
        let handles: Vec<UnixHandle> = self
            .snapshot()
            .into_iter()
            .filter(|record| record.name == name)
            .map(|record| UnixHandle { pid: record.pid })
            .collect();
        if handles.is_empty() {
            return Err(ProcessError::NotFound {
                name: name.to_string(),
                session: self.session_id,
            });
        }
        Ok(handles)
    }

    fn suspend(&self, handle: &UnixHandle) -> Result<(), ProcessError> {
        self.signal(handle, libc::SIGSTOP, "SIGSTOP")
    }

    fn resume(&self, handle: &UnixHandle) -> Result<(), ProcessError> {
        self.signal(handle, libc::SIGCONT, "SIGCONT")
    }
}

use anyhow::{Context, Result};
use ::windows::{
    core::{w, PCWSTR},
    Win32::{
        Foundation::{CloseHandle, HANDLE, LUID},
        Security::{
            AdjustTokenPrivileges, LookupPrivilegeValueW, LUID_AND_ATTRIBUTES,
            SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
        },
        System::{
            Diagnostics::ToolHelp::{
                CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
                TH32CS_SNAPPROCESS,
            },
            RemoteDesktop::ProcessIdToSessionId,
            Threading::{
                GetCurrentProcess, GetCurrentProcessId, OpenProcess, OpenProcessToken,
                PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SUSPEND_RESUME,
            },
        },
    },
};

use super::{InstanceHandle, ProcessDirectory, ProcessError, ProcessRecord, ProcessSet};

// Undocumented but stable ntdll exports; both return an NTSTATUS.
#[link(name = "ntdll")]
extern "system" {
    fn NtSuspendProcess(process: HANDLE) -> i32;
    fn NtResumeProcess(process: HANDLE) -> i32;
}

/// Close an owned handle, logging a failure. Returns whether it closed.
fn close_handle(raw: HANDLE, what: &str) -> bool {
    // SAFETY: callers pass a handle they own and never use it again.
    match unsafe { CloseHandle(raw) } {
        Ok(()) => true,
        Err(e) => {
            log::debug!("CloseHandle failed for {what}: {e}");
            false
        }
    }
}

/// Handle opened with suspend/resume rights, closed on drop.
#[derive(Debug)]
pub struct WindowsHandle {
    pid: u32,
    raw: HANDLE,
}

impl InstanceHandle for WindowsHandle {
    fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for WindowsHandle {
    fn drop(&mut self) {
        close_handle(self.raw, &format!("pid {}", self.pid));
    }
}

struct Snapshot(HANDLE);

impl Drop for Snapshot {
    fn drop(&mut self) {
        close_handle(self.0, "process snapshot");
    }
}

fn session_of(pid: u32) -> Option<u32> {
    let mut session = 0u32;
    // SAFETY: `session` outlives the call.
    unsafe { ProcessIdToSessionId(pid, &mut session) }
        .ok()
        .map(|()| session)
}

fn exe_name(raw: &[u16]) -> String {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..len])
}

fn snapshot_entries() -> Result<Vec<ProcessRecord>, ProcessError> {
    // SAFETY: plain FFI call; the returned handle is owned by `Snapshot`.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
        .map(Snapshot)
        .map_err(|e| ProcessError::Snapshot(e.to_string()))?;

    #[allow(clippy::cast_possible_truncation)]
    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };

    let mut records = Vec::new();
    // SAFETY: `entry` is a properly sized PROCESSENTRY32W for both calls.
    let mut more = unsafe { Process32FirstW(snapshot.0, &mut entry) }.is_ok();
    while more {
        records.push(ProcessRecord::new(
            entry.th32ProcessID,
            exe_name(&entry.szExeFile),
        ));
        more = unsafe { Process32NextW(snapshot.0, &mut entry) }.is_ok();
    }
    Ok(records)
}

/// Enable `SeDebugPrivilege` so handles to elevated processes of the same
/// session can be opened.
///
/// # Errors
///
/// Returns an error if the token cannot be opened or adjusted.
pub fn enable_debug_privilege() -> Result<()> {
    let mut token = HANDLE::default();
    // SAFETY: `token` receives an owned handle that is closed below.
    unsafe {
        OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        )
    }
    .context("OpenProcessToken failed")?;

    let mut luid = LUID::default();
    let adjusted =
        unsafe { LookupPrivilegeValueW(PCWSTR::null(), w!("SeDebugPrivilege"), &mut luid) }
            .context("LookupPrivilegeValueW failed")
            .and_then(|()| {
                let privileges = TOKEN_PRIVILEGES {
                    PrivilegeCount: 1,
                    Privileges: [LUID_AND_ATTRIBUTES {
                        Luid: luid,
                        Attributes: SE_PRIVILEGE_ENABLED,
                    }],
                };
                unsafe {
                    AdjustTokenPrivileges(
                        token,
                        false,
                        Some(std::ptr::from_ref(&privileges)),
                        0,
                        None,
                        None,
                    )
                }
                .context("AdjustTokenPrivileges failed")
            });

    close_handle(token, "process token");
    adjusted
}

/// Process directory backed by ToolHelp snapshots and the ntdll
/// suspend/resume primitives.
pub struct WindowsDirectory {
    session_id: u32,
}

impl WindowsDirectory {
    /// Bind to the caller's session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session of the current process cannot be read.
    pub fn new() -> Result<Self> {
        // SAFETY: no preconditions.
        let own_pid = unsafe { GetCurrentProcessId() };
        let session_id =
            session_of(own_pid).context("Failed to resolve the current session id")?;
        if let Err(e) = enable_debug_privilege() {
            log::warn!("Could not enable SeDebugPrivilege: {e:#}");
        }
        log::debug!("Process directory bound to session {session_id}");
        Ok(Self { session_id })
    }

    fn session_records(&self) -> Result<Vec<ProcessRecord>, ProcessError> {
        Ok(snapshot_entries()?
            .into_iter()
            .filter(|record| session_of(record.pid) == Some(self.session_id))
            .collect())
    }

    fn check_status(
        handle: &WindowsHandle,
        operation: &'static str,
        status: i32,
    ) -> Result<(), ProcessError> {
        // NT_SUCCESS: every non-negative NTSTATUS is a success code.
        if status >= 0 {
            Ok(())
        } else {
            Err(ProcessError::Os {
                operation,
                pid: handle.pid,
                reason: format!("NTSTATUS {status:#010x}"),
            })
        }
    }
}

impl ProcessDirectory for WindowsDirectory {
    type Handle = WindowsHandle;

    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn list_session_processes(&self) -> Result<ProcessSet, ProcessError> {
        let records: ProcessSet = self.session_records()?.into_iter().collect();
        if records.is_empty() {
            return Err(ProcessError::NoProcesses(self.session_id));
        }
        Ok(records)
    }

    fn handles_in_session(&self, name: &str) -> Result<Vec<WindowsHandle>, ProcessError> {
        let mut handles = Vec::new();
        let mut last_error = None;

        for record in self
            .session_records()?
            .into_iter()
            .filter(|record| record.name == name)
        {
            // SAFETY: plain FFI call; the handle is owned by WindowsHandle.
            match unsafe {
                OpenProcess(
                    PROCESS_SUSPEND_RESUME | PROCESS_QUERY_LIMITED_INFORMATION,
                    false,
                    record.pid,
                )
            } {
                Ok(raw) => handles.push(WindowsHandle {
                    pid: record.pid,
                    raw,
                }),
                Err(e) => {
                    log::warn!("OpenProcess failed for {record}: {e}");
                    last_error = Some(ProcessError::Os {
                        operation: "OpenProcess",
                        pid: record.pid,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if handles.is_empty() {
            return Err(last_error.unwrap_or_else(|| ProcessError::NotFound {
                name: name.to_string(),
                session: self.session_id,
            }));
        }
        Ok(handles)
    }

    fn suspend(&self, handle: &WindowsHandle) -> Result<(), ProcessError> {
        // SAFETY: the handle carries PROCESS_SUSPEND_RESUME.
        let status = unsafe { NtSuspendProcess(handle.raw) };
        Self::check_status(handle, "NtSuspendProcess", status)
    }

    fn resume(&self, handle: &WindowsHandle) -> Result<(), ProcessError> {
        // SAFETY: the handle carries PROCESS_SUSPEND_RESUME.
        let status = unsafe { NtResumeProcess(handle.raw) };
        Self::check_status(handle, "NtResumeProcess", status)
    }
}

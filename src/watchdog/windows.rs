//! Handle-based liveness probing.

use std::mem;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};

use windows_sys::Win32::Foundation::{FILETIME, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentProcessId, GetProcessTimes, OpenProcess, WaitForSingleObject,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE,
};

use super::LivenessProbe;
use crate::error::{PhoenixError, Result};

/// Holds a synchronisation handle to the watched process; the handle becomes
/// signalled when that process exits.
#[derive(Debug)]
pub struct HandleProbe {
    pid: u32,
    handle: OwnedHandle,
}

fn last_error(what: &str) -> PhoenixError {
    PhoenixError::Watchdog(format!("{}: {}", what, std::io::Error::last_os_error()))
}

fn creation_time(handle: HANDLE) -> Option<u64> {
    let mut created: FILETIME = unsafe { mem::zeroed() };
    let mut exited: FILETIME = unsafe { mem::zeroed() };
    let mut kernel: FILETIME = unsafe { mem::zeroed() };
    let mut user: FILETIME = unsafe { mem::zeroed() };
    let ok = unsafe {
        GetProcessTimes(
            handle,
            &mut created,
            &mut exited,
            &mut kernel,
            &mut user,
        )
    };
    (ok != 0).then(|| ((created.dwHighDateTime as u64) << 32) | created.dwLowDateTime as u64)
}

fn parent_pid() -> Result<u32> {
    let me = unsafe { GetCurrentProcessId() };
    let raw = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if raw == INVALID_HANDLE_VALUE {
        return Err(last_error("process snapshot failed"));
    }
    let snapshot = unsafe { OwnedHandle::from_raw_handle(raw) };

    let mut entry: PROCESSENTRY32W = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<PROCESSENTRY32W>() as u32;
    let mut more = unsafe { Process32FirstW(snapshot.as_raw_handle(), &mut entry) } != 0;
    while more {
        if entry.th32ProcessID == me {
            return Ok(entry.th32ParentProcessID);
        }
        more = unsafe { Process32NextW(snapshot.as_raw_handle(), &mut entry) } != 0;
    }
    Err(PhoenixError::Watchdog("current process not in snapshot".into()))
}

impl HandleProbe {
    /// Capture the current parent.
    ///
    /// Windows does not reparent, so a parent pid that was already recycled
    /// is detected by comparing creation times.
    pub fn parent() -> Result<Self> {
        let probe = Self::new(parent_pid()?)?;
        let ours = creation_time(unsafe { GetCurrentProcess() });

        match (creation_time(probe.handle.as_raw_handle()), ours) {
            (Some(parent), Some(ours)) if parent > ours => Err(PhoenixError::Watchdog(format!(
                "parent {} exited before the watchdog started",
                probe.pid
            ))),
            _ => Ok(probe),
        }
    }

    pub fn new(pid: u32) -> Result<Self> {
        let raw = unsafe {
            OpenProcess(
                PROCESS_SYNCHRONIZE | PROCESS_QUERY_LIMITED_INFORMATION,
                0,
                pid,
            )
        };
        if raw.is_null() {
            return Err(last_error(&format!("cannot open process {}", pid)));
        }
        Ok(Self {
            pid,
            handle: unsafe { OwnedHandle::from_raw_handle(raw) },
        })
    }
}

impl LivenessProbe for HandleProbe {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        unsafe { WaitForSingleObject(self.handle.as_raw_handle(), 0) == WAIT_TIMEOUT }
    }
}

//! Win32 implementation of the process boundary.
//!
//! Wraps the virtual-memory syscalls (`ReadProcessMemory`, `VirtualAllocEx`,
//! `VirtualQueryEx`, ...) and the Toolhelp32 enumeration APIs behind
//! [`WindowsProcess`]. All failures are converted into the crate error
//! taxonomy so callers never see raw `windows::core::Error` values.

use std::collections::HashMap;
use std::ffi::c_void;

use tracing::{debug, warn};
use windows::Win32::Foundation::{CloseHandle, HANDLE, STILL_ACTIVE, WAIT_OBJECT_0};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, Module32NextW, PROCESSENTRY32W,
    Process32FirstW, Process32NextW, TH32CS_SNAPMODULE, TH32CS_SNAPPROCESS, TH32CS_SNAPTHREAD,
    THREADENTRY32, Thread32First, Thread32Next,
};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_READONLY, PAGE_READWRITE,
    PAGE_WRITECOPY, VirtualAllocEx, VirtualFreeEx, VirtualQueryEx,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, GetExitCodeThread, LPTHREAD_START_ROUTINE, OpenProcess, OpenThread,
    PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION, PROCESS_SYNCHRONIZE, PROCESS_VM_OPERATION,
    PROCESS_VM_READ, PROCESS_VM_WRITE, ResumeThread, SuspendThread, THREAD_SUSPEND_RESUME,
    WaitForSingleObject,
};

use crate::error::{Error, Result};
use crate::process::{MemoryRegion, ProcessMemory, Protection};

/// Remote-thread wait granularity, so a dying target is noticed quickly.
const THREAD_WAIT_SLICE_MS: u32 = 100;

fn wide_to_string(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}

/// An opened target process.
///
/// The handle is closed on drop. Cloning is intentionally not offered; one
/// controller owns one process.
#[derive(Debug)]
pub struct WindowsProcess {
    handle: HANDLE,
    pid: u32,
}

// SAFETY: the process handle is a kernel object reference; the Win32 memory
// APIs used here are documented as callable from any thread.
unsafe impl Send for WindowsProcess {}
unsafe impl Sync for WindowsProcess {}

impl WindowsProcess {
    /// Open `pid` with the access set needed for instrumentation
    /// (read/write/allocate/remote threads).
    pub fn open(pid: u32) -> Result<Self> {
        // SAFETY: OpenProcess has no memory-safety preconditions; a failed
        // open returns an error instead of a handle.
        let handle = unsafe {
            OpenProcess(
                PROCESS_QUERY_INFORMATION
                    | PROCESS_CREATE_THREAD
                    | PROCESS_VM_OPERATION
                    | PROCESS_VM_READ
                    | PROCESS_VM_WRITE
                    | PROCESS_SYNCHRONIZE,
                false,
                pid,
            )
        }
        .map_err(|e| Error::ProcessOpenFailed(format!("pid {pid}: {e}")))?;

        debug!("Opened process {} (handle {:?})", pid, handle);
        Ok(Self { handle, pid })
    }

    /// Find a process by executable name and open it.
    pub fn open_by_name(name: &str) -> Result<Self> {
        let pid = pid_by_name(name)?.ok_or_else(|| Error::ProcessNotFound(name.to_string()))?;
        Self::open(pid)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        let mut code = 0u32;
        // SAFETY: handle is valid for the lifetime of self.
        match unsafe { GetExitCodeProcess(self.handle, &mut code) } {
            Ok(()) => code == STILL_ACTIVE.0 as u32,
            Err(_) => false,
        }
    }

    /// Map of loaded module names to their base addresses.
    pub fn modules(&self) -> Result<HashMap<String, u64>> {
        let mut result = HashMap::new();

        // SAFETY: snapshot handle is closed below on every path.
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE, self.pid) }
            .map_err(|e| Error::ProcessOpenFailed(format!("module snapshot: {e}")))?;

        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };

        // SAFETY: entry.dwSize is set; the loop stops when the API reports
        // the end of the snapshot.
        unsafe {
            if Module32FirstW(snapshot, &mut entry).is_ok() {
                loop {
                    result.insert(
                        wide_to_string(&entry.szModule),
                        entry.modBaseAddr as u64,
                    );
                    if Module32NextW(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }
            let _ = CloseHandle(snapshot);
        }

        Ok(result)
    }

    /// Thread ids belonging to this process.
    pub fn thread_ids(&self) -> Result<Vec<u32>> {
        let mut result = Vec::new();

        // SAFETY: snapshot handle is closed below on every path.
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, self.pid) }
            .map_err(|e| Error::ProcessOpenFailed(format!("thread snapshot: {e}")))?;

        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };

        // SAFETY: entry.dwSize is set before the first call.
        unsafe {
            if Thread32First(snapshot, &mut entry).is_ok() {
                loop {
                    if entry.th32OwnerProcessID == self.pid {
                        result.push(entry.th32ThreadID);
                    }
                    if Thread32Next(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }
            let _ = CloseHandle(snapshot);
        }

        Ok(result)
    }

    /// Suspend one thread by id.
    pub fn suspend_thread(&self, tid: u32) -> Result<()> {
        with_thread(tid, |h| {
            // SAFETY: h is a valid thread handle with SUSPEND_RESUME access.
            if unsafe { SuspendThread(h) } == u32::MAX {
                Err(windows::core::Error::from_win32())
            } else {
                Ok(())
            }
        })
        .map_err(|e| Error::ProcessOpenFailed(format!("suspend thread {tid}: {e}")))
    }

    /// Resume one thread by id.
    pub fn resume_thread(&self, tid: u32) -> Result<()> {
        with_thread(tid, |h| {
            // SAFETY: h is a valid thread handle with SUSPEND_RESUME access.
            if unsafe { ResumeThread(h) } == u32::MAX {
                Err(windows::core::Error::from_win32())
            } else {
                Ok(())
            }
        })
        .map_err(|e| Error::ProcessOpenFailed(format!("resume thread {tid}: {e}")))
    }

    /// Suspend every thread of the target. Failures on individual threads
    /// (already exited) are logged and skipped.
    pub fn suspend_all_threads(&self) -> Result<()> {
        for tid in self.thread_ids()? {
            if let Err(e) = self.suspend_thread(tid) {
                warn!("Failed to suspend thread {}: {}", tid, e);
            }
        }
        Ok(())
    }

    /// Resume every thread of the target.
    pub fn resume_all_threads(&self) -> Result<()> {
        for tid in self.thread_ids()? {
            if let Err(e) = self.resume_thread(tid) {
                warn!("Failed to resume thread {}: {}", tid, e);
            }
        }
        Ok(())
    }

    /// Run code at `address` on a fresh remote thread. With `wait`, blocks
    /// until the thread finishes (or the process dies) and returns its exit
    /// code.
    pub fn create_remote_thread(
        &self,
        address: u64,
        parameter: Option<u64>,
        wait: bool,
    ) -> Result<Option<u32>> {
        use windows::Win32::System::Threading::CreateRemoteThread;

        // SAFETY: the start routine is a code address inside the target; it
        // is never called in this process. The transmute only reinterprets
        // the integer as the FFI function-pointer type.
        let start: LPTHREAD_START_ROUTINE =
            unsafe { std::mem::transmute::<usize, LPTHREAD_START_ROUTINE>(address as usize) };

        let mut thread_id = 0u32;
        // SAFETY: handle is valid; parameter is passed through untouched.
        let thread = unsafe {
            CreateRemoteThread(
                self.handle,
                None,
                0,
                start,
                parameter.map(|p| p as *const c_void),
                0,
                Some(&mut thread_id),
            )
        }
        .map_err(|e| Error::MemoryWriteFailed {
            address,
            message: format!("CreateRemoteThread: {e}"),
        })?;

        let mut exit_code = None;
        if wait {
            // SAFETY: thread handle is valid until closed below.
            unsafe {
                loop {
                    if WaitForSingleObject(thread, THREAD_WAIT_SLICE_MS) == WAIT_OBJECT_0 {
                        break;
                    }
                    // Give up waiting if the whole process went away.
                    if !self.is_running() {
                        break;
                    }
                }
                let mut code = 0u32;
                if GetExitCodeThread(thread, &mut code).is_ok() {
                    exit_code = Some(code);
                }
            }
        }

        // SAFETY: thread was returned by CreateRemoteThread above.
        unsafe {
            let _ = CloseHandle(thread);
        }
        Ok(exit_code)
    }
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        // SAFETY: handle was returned by OpenProcess and not closed elsewhere.
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl ProcessMemory for WindowsProcess {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        let mut read = 0usize;

        // SAFETY: buffer outlives the call and is at least `size` bytes.
        unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buffer.as_mut_ptr().cast(),
                size,
                Some(&mut read),
            )
        }
        .map_err(|e| Error::MemoryReadFailed {
            address,
            message: e.to_string(),
        })?;

        buffer.truncate(read);
        Ok(buffer)
    }

    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut written = 0usize;

        // SAFETY: data outlives the call; the kernel copies out of it.
        unsafe {
            WriteProcessMemory(
                self.handle,
                address as *const c_void,
                data.as_ptr().cast(),
                data.len(),
                Some(&mut written),
            )
        }
        .map_err(|e| Error::MemoryWriteFailed {
            address,
            message: e.to_string(),
        })?;

        if written != data.len() {
            return Err(Error::MemoryWriteFailed {
                address,
                message: format!("short write: {} of {} bytes", written, data.len()),
            });
        }
        Ok(())
    }

    fn allocate(&self, size: usize, address: Option<u64>, protection: Protection) -> Result<u64> {
        let protect = match protection {
            Protection::ReadOnly => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ExecuteRead => PAGE_EXECUTE_READ,
            Protection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
        };

        // SAFETY: allocation in a foreign process; no aliasing in ours.
        let base = unsafe {
            VirtualAllocEx(
                self.handle,
                address.map(|a| a as *const c_void),
                size,
                MEM_COMMIT | MEM_RESERVE,
                protect,
            )
        };

        if base.is_null() {
            return Err(Error::AllocationFailed {
                size,
                message: windows::core::Error::from_win32().to_string(),
            });
        }
        Ok(base as u64)
    }

    fn free(&self, address: u64) -> Result<()> {
        // SAFETY: address came from VirtualAllocEx on the same handle;
        // MEM_RELEASE requires size 0.
        unsafe { VirtualFreeEx(self.handle, address as *mut c_void, 0, MEM_RELEASE) }.map_err(
            |e| Error::FreeFailed {
                address,
                message: e.to_string(),
            },
        )
    }

    fn query_region(&self, address: u64) -> Option<MemoryRegion> {
        let mut info = MEMORY_BASIC_INFORMATION::default();

        // SAFETY: info is a plain output struct of the documented size.
        let written = unsafe {
            VirtualQueryEx(
                self.handle,
                Some(address as *const c_void),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return None;
        }

        let protect = info.Protect.0;
        let readable_mask = PAGE_READONLY.0
            | PAGE_READWRITE.0
            | PAGE_EXECUTE_READ.0
            | PAGE_EXECUTE_READWRITE.0
            | PAGE_WRITECOPY.0
            | PAGE_EXECUTE_WRITECOPY.0;
        let readable = protect & PAGE_GUARD.0 == 0 && protect & readable_mask != 0;

        Some(MemoryRegion {
            base: info.BaseAddress as u64,
            size: info.RegionSize as u64,
            committed: info.State == MEM_COMMIT,
            readable,
        })
    }
}

/// Enumerate processes and return the pid of the first one whose
/// executable name matches (case-insensitive).
pub fn pid_by_name(name: &str) -> Result<Option<u32>> {
    // SAFETY: snapshot handle is closed below on every path.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
        .map_err(|e| Error::ProcessOpenFailed(format!("process snapshot: {e}")))?;

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };

    let mut found = None;
    // SAFETY: entry.dwSize is set before the first call.
    unsafe {
        if Process32FirstW(snapshot, &mut entry).is_ok() {
            loop {
                if wide_to_string(&entry.szExeFile).eq_ignore_ascii_case(name) {
                    found = Some(entry.th32ProcessID);
                    break;
                }
                if Process32NextW(snapshot, &mut entry).is_err() {
                    break;
                }
            }
        }
        let _ = CloseHandle(snapshot);
    }

    Ok(found)
}

fn with_thread(
    tid: u32,
    f: impl FnOnce(HANDLE) -> std::result::Result<(), windows::core::Error>,
) -> std::result::Result<(), windows::core::Error> {
    // SAFETY: handle is closed after the closure regardless of its result.
    unsafe {
        let handle = OpenThread(THREAD_SUSPEND_RESUME, false, tid)?;
        let result = f(handle);
        let _ = CloseHandle(handle);
        result
    }
}

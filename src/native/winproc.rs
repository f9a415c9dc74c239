//! Shared Win32 process plumbing for the ConPTY and WinPTY backends:
//! session process enumeration, best-effort termination and the OS release
//! lookup used for backend selection.

use windows::Wdk::System::SystemServices::RtlGetVersion;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::SystemInformation::OSVERSIONINFOW;
use windows::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, TerminateProcess, PROCESS_TERMINATE,
};

/// `major.minor.build` of the running OS.
pub(crate) fn os_release() -> String {
    let mut info = OSVERSIONINFOW {
        dwOSVersionInfoSize: std::mem::size_of::<OSVERSIONINFOW>() as u32,
        ..Default::default()
    };
    // SAFETY: RtlGetVersion fills the struct we own.
    let status = unsafe { RtlGetVersion(&mut info) };
    if status.is_err() {
        return String::from("0.0.0");
    }
    format!(
        "{}.{}.{}",
        info.dwMajorVersion, info.dwMinorVersion, info.dwBuildNumber
    )
}

/// All pids in the tree rooted at `root`, root first, via a Toolhelp
/// snapshot walk.
pub(crate) fn process_tree(root: i32) -> Vec<i32> {
    let mut parents: Vec<(u32, u32)> = Vec::new();
    unsafe {
        let snapshot = match CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) {
            Ok(handle) => handle,
            Err(_) => return vec![root],
        };
        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };
        if Process32FirstW(snapshot, &mut entry).is_ok() {
            loop {
                parents.push((entry.th32ProcessID, entry.th32ParentProcessID));
                if Process32NextW(snapshot, &mut entry).is_err() {
                    break;
                }
            }
        }
        let _ = CloseHandle(snapshot);
    }

    let mut tree = vec![root];
    let mut cursor = 0;
    while cursor < tree.len() {
        let parent = tree[cursor] as u32;
        for (pid, ppid) in &parents {
            let pid = *pid as i32;
            if *ppid == parent && !tree.contains(&pid) {
                tree.push(pid);
            }
        }
        cursor += 1;
    }
    tree
}

/// Terminate one process. Failure (already gone, access denied) is not an
/// error.
pub(crate) fn terminate(pid: i32) -> bool {
    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_TERMINATE, false, pid as u32) else {
            return false;
        };
        let ok = TerminateProcess(handle, 1).is_ok();
        let _ = CloseHandle(handle);
        ok
    }
}

/// Exit code of a process handle; `None` while it is still running.
pub(crate) fn exit_code(handle: HANDLE) -> Option<i32> {
    const STILL_ACTIVE: u32 = 259;
    let mut code: u32 = 0;
    unsafe {
        if GetExitCodeProcess(handle, &mut code).is_err() {
            return None;
        }
    }
    if code == STILL_ACTIVE {
        None
    } else {
        Some(code as i32)
    }
}

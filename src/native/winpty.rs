//! Default WinPTY backend: runtime binding to `winpty.dll`.
//!
//! WinPTY ships as a third-party dll plus an agent executable, so the
//! entry points are resolved with LoadLibrary/GetProcAddress when the
//! backend is first requested. A missing or incomplete dll surfaces as a
//! load error to every caller; nothing falls back silently.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::windows::io::FromRawHandle;
use std::sync::Mutex;

use tracing::debug;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_NONE, OPEN_EXISTING,
};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
use windows::Win32::System::Threading::GetProcessId;

use crate::error::{PtyError, Result};
use crate::native::{winproc, ExitCallback, WinptyNative, WinptyStart};

// winpty.h constants.
const WINPTY_SPAWN_FLAG_AUTO_SHUTDOWN: u64 = 1;

type WinptyErrorPtr = *mut std::ffi::c_void;
type WinptyConfigPtr = *mut std::ffi::c_void;
type WinptyPtr = *mut std::ffi::c_void;
type WinptySpawnConfigPtr = *mut std::ffi::c_void;

type ConfigNewFn = unsafe extern "C" fn(u64, *mut WinptyErrorPtr) -> WinptyConfigPtr;
type ConfigSetInitialSizeFn = unsafe extern "C" fn(WinptyConfigPtr, i32, i32);
type ConfigFreeFn = unsafe extern "C" fn(WinptyConfigPtr);
type OpenFn = unsafe extern "C" fn(WinptyConfigPtr, *mut WinptyErrorPtr) -> WinptyPtr;
type ConinNameFn = unsafe extern "C" fn(WinptyPtr) -> *const u16;
type ConoutNameFn = unsafe extern "C" fn(WinptyPtr) -> *const u16;
type AgentProcessFn = unsafe extern "C" fn(WinptyPtr) -> HANDLE;
type SpawnConfigNewFn = unsafe extern "C" fn(
    u64,
    *const u16,
    *const u16,
    *const u16,
    *const u16,
    *mut WinptyErrorPtr,
) -> WinptySpawnConfigPtr;
type SpawnConfigFreeFn = unsafe extern "C" fn(WinptySpawnConfigPtr);
type SpawnFn = unsafe extern "C" fn(
    WinptyPtr,
    WinptySpawnConfigPtr,
    *mut HANDLE,
    *mut HANDLE,
    *mut u32,
    *mut WinptyErrorPtr,
) -> i32;
type SetSizeFn = unsafe extern "C" fn(WinptyPtr, i32, i32, *mut WinptyErrorPtr) -> i32;
type FreeFn = unsafe extern "C" fn(WinptyPtr);

struct Api {
    config_new: ConfigNewFn,
    config_set_initial_size: ConfigSetInitialSizeFn,
    config_free: ConfigFreeFn,
    open: OpenFn,
    conin_name: ConinNameFn,
    conout_name: ConoutNameFn,
    agent_process: AgentProcessFn,
    spawn_config_new: SpawnConfigNewFn,
    spawn_config_free: SpawnConfigFreeFn,
    spawn: SpawnFn,
    set_size: SetSizeFn,
    free: FreeFn,
}

struct WinptySession {
    pty: WinptyPtr,
    process: HANDLE,
}

// SAFETY: winpty handles are only used under the registry lock; the dll
// documents its API as thread-safe per pty.
unsafe impl Send for WinptySession {}

pub(crate) struct WinptyApi {
    api: Api,
    /// Sessions keyed by the outer (agent) pid, which is how resize and
    /// kill address them.
    sessions: Mutex<HashMap<i32, WinptySession>>,
    next_pty_id: Mutex<i32>,
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn wide_from_ptr(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
        String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
    }
}

macro_rules! resolve {
    ($module:expr, $name:literal, $ty:ty) => {{
        let symbol = unsafe { GetProcAddress($module, windows::core::s!($name)) };
        match symbol {
            Some(addr) => unsafe { std::mem::transmute::<_, $ty>(addr) },
            None => {
                return Err(format!("winpty.dll is missing `{}`", $name));
            }
        }
    }};
}

impl WinptyApi {
    /// Resolve every entry point once; a failure is final for the process.
    pub fn load() -> std::result::Result<Self, String> {
        let module = unsafe { LoadLibraryW(PCWSTR(wide("winpty.dll").as_ptr())) }
            .map_err(|e| format!("failed to load winpty.dll: {e}"))?;
        let api = Api {
            config_new: resolve!(module, "winpty_config_new", ConfigNewFn),
            config_set_initial_size: resolve!(
                module,
                "winpty_config_set_initial_size",
                ConfigSetInitialSizeFn
            ),
            config_free: resolve!(module, "winpty_config_free", ConfigFreeFn),
            open: resolve!(module, "winpty_open", OpenFn),
            conin_name: resolve!(module, "winpty_conin_name", ConinNameFn),
            conout_name: resolve!(module, "winpty_conout_name", ConoutNameFn),
            agent_process: resolve!(module, "winpty_agent_process", AgentProcessFn),
            spawn_config_new: resolve!(module, "winpty_spawn_config_new", SpawnConfigNewFn),
            spawn_config_free: resolve!(module, "winpty_spawn_config_free", SpawnConfigFreeFn),
            spawn: resolve!(module, "winpty_spawn", SpawnFn),
            set_size: resolve!(module, "winpty_set_size", SetSizeFn),
            free: resolve!(module, "winpty_free", FreeFn),
        };
        Ok(Self {
            api,
            sessions: Mutex::new(HashMap::new()),
            next_pty_id: Mutex::new(1),
        })
    }
}

fn open_pipe(name: &str, write: bool) -> Result<HANDLE> {
    let name_wide = wide(name);
    let access = if write { GENERIC_WRITE } else { GENERIC_READ };
    unsafe {
        CreateFileW(
            PCWSTR(name_wide.as_ptr()),
            access.0,
            FILE_SHARE_NONE,
            None,
            OPEN_EXISTING,
            FILE_FLAGS_AND_ATTRIBUTES(0),
            HANDLE::default(),
        )
        .map_err(|e| {
            PtyError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("failed to open winpty pipe {name}: {e}"),
            ))
        })
    }
}

impl WinptyNative for WinptyApi {
    fn start_process(
        &self,
        file: &str,
        command_line: &str,
        env: &[String],
        cwd: &str,
        cols: u16,
        rows: u16,
        _debug: bool,
    ) -> Result<WinptyStart> {
        let spawn_err = |message: String| PtyError::Spawn {
            file: file.to_string(),
            source: io::Error::new(io::ErrorKind::Other, message),
        };

        unsafe {
            let mut error: WinptyErrorPtr = std::ptr::null_mut();
            let config = (self.api.config_new)(0, &mut error);
            if config.is_null() {
                return Err(spawn_err("winpty_config_new failed".to_string()));
            }
            (self.api.config_set_initial_size)(config, cols as i32, rows as i32);

            let pty = (self.api.open)(config, &mut error);
            (self.api.config_free)(config);
            if pty.is_null() {
                return Err(spawn_err("winpty_open failed".to_string()));
            }

            let conin_name = wide_from_ptr((self.api.conin_name)(pty));
            let conout_name = wide_from_ptr((self.api.conout_name)(pty));
            let conin_handle = open_pipe(&conin_name, true)?;
            let conout_handle = open_pipe(&conout_name, false)?;

            // env block: KEY=VALUE pairs joined by NULs, double-NUL end.
            let mut env_text = String::new();
            for pair in env {
                env_text.push_str(pair);
                env_text.push('\0');
            }
            let env_wide: Vec<u16> = env_text
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();

            let cmdline_wide = wide(command_line);
            let cwd_wide = wide(cwd);
            let spawn_config = (self.api.spawn_config_new)(
                WINPTY_SPAWN_FLAG_AUTO_SHUTDOWN,
                std::ptr::null(),
                cmdline_wide.as_ptr(),
                cwd_wide.as_ptr(),
                env_wide.as_ptr(),
                &mut error,
            );
            if spawn_config.is_null() {
                (self.api.free)(pty);
                return Err(spawn_err("winpty_spawn_config_new failed".to_string()));
            }

            let mut process = HANDLE::default();
            let mut thread = HANDLE::default();
            let mut create_error: u32 = 0;
            let spawned = (self.api.spawn)(
                pty,
                spawn_config,
                &mut process,
                &mut thread,
                &mut create_error,
                &mut error,
            );
            (self.api.spawn_config_free)(spawn_config);
            if spawned == 0 {
                (self.api.free)(pty);
                return Err(spawn_err(format!(
                    "winpty_spawn failed (create error {create_error})"
                )));
            }
            if !thread.is_invalid() {
                let _ = CloseHandle(thread);
            }

            let agent = (self.api.agent_process)(pty);
            let pid = GetProcessId(agent) as i32;
            let inner_pid = GetProcessId(process) as i32;
            debug!(pid, inner_pid, file, "winpty session started");

            let pty_id = {
                let mut next = self.next_pty_id.lock().unwrap();
                let id = *next;
                *next += 1;
                id
            };
            self.sessions
                .lock()
                .unwrap()
                .insert(pid, WinptySession { pty, process });

            Ok(WinptyStart {
                pid,
                inner_pid,
                inner_pid_handle: process.0 as isize,
                fd: -1,
                pty_id,
                conin: Box::new(File::from_raw_handle(conin_handle.0 as _)),
                conout: Box::new(File::from_raw_handle(conout_handle.0 as _)),
            })
        }
    }

    fn resize(&self, pid: i32, cols: u16, rows: u16) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&pid).ok_or_else(|| {
            PtyError::NativeUnavailable(format!("no winpty session for pid {pid}"))
        })?;
        let mut error: WinptyErrorPtr = std::ptr::null_mut();
        let ok = unsafe { (self.api.set_size)(session.pty, cols as i32, rows as i32, &mut error) };
        if ok == 0 {
            return Err(PtyError::Io(io::Error::new(
                io::ErrorKind::Other,
                "winpty_set_size failed",
            )));
        }
        Ok(())
    }

    fn kill(&self, pid: i32, inner_pid_handle: isize) -> Result<()> {
        let session = self.sessions.lock().unwrap().remove(&pid);
        if let Some(session) = session {
            unsafe {
                (self.api.free)(session.pty);
                let handle = HANDLE(inner_pid_handle as _);
                let _ = windows::Win32::System::Threading::TerminateProcess(handle, 1);
                let _ = CloseHandle(session.process);
            }
        }
        Ok(())
    }

    fn process_list(&self, pid: i32) -> Vec<i32> {
        winproc::process_tree(pid)
    }

    fn exit_code(&self, inner_pid_handle: isize) -> Option<i32> {
        winproc::exit_code(HANDLE(inner_pid_handle as _))
    }

    fn terminate_process(&self, pid: i32) -> bool {
        winproc::terminate(pid)
    }
}

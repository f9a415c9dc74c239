//! Default ConPTY backend via the Windows pseudoconsole API.
//!
//! `start_process` creates the pipe pair and the pseudoconsole;
//! `connect` attaches the requested command line to it with the
//! pseudoconsole proc-thread attribute and starts a waiter thread that
//! reports the exit code. Sessions are tracked in a registry keyed by the
//! pty id handed back from `start_process`.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::windows::io::FromRawHandle;
use std::sync::Mutex;
use std::thread;

use tracing::debug;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, InitializeProcThreadAttributeList,
    TerminateProcess, UpdateProcThreadAttribute, WaitForSingleObject,
    CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT, INFINITE,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION, STARTUPINFOEXW,
};

use crate::error::{PtyError, Result};
use crate::native::{winproc, ConptyNative, ConptyStart, ExitCallback};

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

struct ConptySession {
    hpc: HPCON,
    process: Option<PROCESS_INFORMATION>,
}

// SAFETY: the raw console and process handles are only touched under the
// registry lock.
unsafe impl Send for ConptySession {}

pub(crate) struct ConptyApi {
    sessions: Mutex<HashMap<i32, ConptySession>>,
    next_id: Mutex<i32>,
}

impl ConptyApi {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    fn allocate_id(&self) -> i32 {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// `VAR=VALUE\0...\0\0` block in UTF-16.
fn environment_block(env: &[String]) -> Vec<u16> {
    let mut block: Vec<u16> = Vec::new();
    for pair in env {
        block.extend(pair.encode_utf16());
        block.push(0);
    }
    block.push(0);
    block
}

fn win_err(context: &str, error: windows::core::Error) -> PtyError {
    PtyError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("{context}: {error}"),
    ))
}

impl ConptyNative for ConptyApi {
    fn start_process(
        &self,
        _file: &str,
        cols: u16,
        rows: u16,
        _debug: bool,
        pipe_name: &str,
        _inherit_cursor: bool,
    ) -> Result<ConptyStart> {
        let mut pty_input_read = HANDLE::default();
        let mut pty_input_write = HANDLE::default();
        let mut pty_output_read = HANDLE::default();
        let mut pty_output_write = HANDLE::default();

        unsafe {
            // Input pipe (we write, the console reads).
            CreatePipe(&mut pty_input_read, &mut pty_input_write, None, 0)
                .map_err(|e| win_err("failed to create conin pipe", e))?;
            // Output pipe (the console writes, we read).
            CreatePipe(&mut pty_output_read, &mut pty_output_write, None, 0)
                .map_err(|e| win_err("failed to create conout pipe", e))?;

            let size = COORD {
                X: cols as i16,
                Y: rows as i16,
            };
            let hpc = CreatePseudoConsole(size, pty_input_read, pty_output_write, 0)
                .map_err(|e| win_err("failed to create pseudo console", e))?;

            // The console owns its ends now.
            let _ = CloseHandle(pty_input_read);
            let _ = CloseHandle(pty_output_write);

            let pty_id = self.allocate_id();
            self.sessions.lock().unwrap().insert(
                pty_id,
                ConptySession {
                    hpc,
                    process: None,
                },
            );

            let conin = File::from_raw_handle(pty_input_write.0 as _);
            let conout = File::from_raw_handle(pty_output_read.0 as _);
            Ok(ConptyStart {
                pty_id,
                fd: -1,
                conin_name: format!("{pipe_name}-in"),
                conout_name: format!("{pipe_name}-out"),
                conin: Box::new(conin),
                conout: Box::new(conout),
            })
        }
    }

    fn connect(
        &self,
        pty_id: i32,
        command_line: &str,
        cwd: &str,
        env: &[String],
        on_exit: ExitCallback,
    ) -> Result<i32> {
        let hpc = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions.get(&pty_id).ok_or_else(|| {
                PtyError::NativeUnavailable(format!("no conpty session with id {pty_id}"))
            })?;
            session.hpc
        };

        let mut cmd_wide = wide(command_line);
        let cwd_wide = wide(cwd);
        let env_block = environment_block(env);

        unsafe {
            let mut attr_list_size: usize = 0;
            let _ = InitializeProcThreadAttributeList(
                LPPROC_THREAD_ATTRIBUTE_LIST::default(),
                1,
                0,
                &mut attr_list_size,
            );
            let mut attr_list_buffer = vec![0u8; attr_list_size];
            let attr_list = LPPROC_THREAD_ATTRIBUTE_LIST(attr_list_buffer.as_mut_ptr() as *mut _);
            InitializeProcThreadAttributeList(attr_list, 1, 0, &mut attr_list_size)
                .map_err(|e| win_err("failed to initialize attribute list", e))?;

            UpdateProcThreadAttribute(
                attr_list,
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                Some(hpc.0 as *const _),
                std::mem::size_of::<HPCON>(),
                None,
                None,
            )
            .map_err(|e| win_err("failed to attach pseudo console", e))?;

            let mut startup_info = STARTUPINFOEXW {
                StartupInfo: std::mem::zeroed(),
                lpAttributeList: attr_list,
            };
            startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;

            let mut process_info = PROCESS_INFORMATION::default();
            let spawn_result = CreateProcessW(
                PCWSTR::null(),
                PWSTR(cmd_wide.as_mut_ptr()),
                None,
                None,
                false,
                EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
                Some(env_block.as_ptr() as *const _),
                PCWSTR(cwd_wide.as_ptr()),
                &startup_info.StartupInfo,
                &mut process_info,
            );
            DeleteProcThreadAttributeList(attr_list);
            spawn_result.map_err(|e| PtyError::Spawn {
                file: command_line.to_string(),
                source: io::Error::new(io::ErrorKind::Other, format!("{e}")),
            })?;

            let pid = process_info.dwProcessId as i32;
            let process_handle = process_info.hProcess;
            let _ = CloseHandle(process_info.hThread);

            if let Some(session) = self.sessions.lock().unwrap().get_mut(&pty_id) {
                session.process = Some(process_info);
            }

            // Waiter thread delivers the exit code exactly once.
            let wait_handle = process_handle.0 as isize;
            thread::spawn(move || {
                let handle = HANDLE(wait_handle as _);
                // SAFETY: the handle stays open until `kill` closes it,
                // after the wait has returned.
                let waited = unsafe { WaitForSingleObject(handle, INFINITE) };
                let code = if waited == WAIT_OBJECT_0 {
                    winproc::exit_code(handle).unwrap_or(0)
                } else {
                    0
                };
                debug!(pid, code, "conpty process exited");
                on_exit(code, None);
            });

            Ok(pid)
        }
    }

    fn resize(&self, pty_id: i32, cols: u16, rows: u16) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&pty_id).ok_or_else(|| {
            PtyError::NativeUnavailable(format!("no conpty session with id {pty_id}"))
        })?;
        let size = COORD {
            X: cols as i16,
            Y: rows as i16,
        };
        unsafe {
            ResizePseudoConsole(session.hpc, size)
                .map_err(|e| win_err("failed to resize pseudo console", e))
        }
    }

    fn kill(&self, pty_id: i32) -> Result<()> {
        let session = self.sessions.lock().unwrap().remove(&pty_id);
        if let Some(session) = session {
            unsafe {
                ClosePseudoConsole(session.hpc);
                if let Some(process) = session.process {
                    let _ = TerminateProcess(process.hProcess, 1);
                    let _ = CloseHandle(process.hProcess);
                }
            }
        }
        Ok(())
    }

    fn console_process_list(&self, pid: i32) -> Vec<i32> {
        winproc::process_tree(pid)
    }

    fn terminate_process(&self, pid: i32) -> bool {
        winproc::terminate(pid)
    }
}

impl Drop for ConptyApi {
    fn drop(&mut self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (_, session) in sessions.drain() {
            unsafe {
                ClosePseudoConsole(session.hpc);
                if let Some(process) = session.process {
                    let _ = CloseHandle(process.hProcess);
                }
            }
        }
    }
}

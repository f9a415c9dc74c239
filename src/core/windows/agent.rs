//! Windows pty agent: one surface over ConPTY and WinPTY.
//!
//! The backend is picked once at construction (ConPTY on builds that ship
//! a usable pseudoconsole, WinPTY otherwise or when the caller forbids
//! ConPTY) and hidden behind the [`ConsoleBackend`] capability trait, so
//! the rest of the session machinery never branches on the backend again.
//!
//! The two backends differ in every lifecycle corner this module has to
//! reconcile: ConPTY delivers its exit code asynchronously (buffered here
//! behind a short flush window so trailing output wins the race), while
//! WinPTY is queried by process handle; ConPTY kill enumerates the console
//! process list, WinPTY kill must sweep the whole session tree afterwards
//! because handle release does not take detached children with it.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::channel::{ErrorPolicy, PtyChannel};
use crate::core::cmdline::args_to_command_line;
use crate::core::notify::ExitLatch;
use crate::core::terminal::ExitRecord;
use crate::core::timer::QuietTimer;
use crate::error::{PtyError, Result};
use crate::native::{ConptyNative, WinptyNative};
use crate::options::{CommandArgs, PtyOptions};

/// First Windows build whose ConPTY is complete enough to prefer.
pub const CONPTY_MINIMUM_BUILD: u32 = 18309;

/// Quiet window between the native exit callback and channel teardown;
/// every data event restarts it so trailing output is flushed to the
/// caller first. Pragmatic; not derived from any OS guarantee.
pub const CONPTY_EXIT_FLUSH_WINDOW: Duration = Duration::from_millis(20);

/// Bound on the console process-list lookup during `kill`; past it the
/// kill degrades to terminating just the inner pid.
pub const PROCESS_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Third dot-separated numeric component of the OS release string.
pub(crate) fn parse_build_number(release: &str) -> u32 {
    release
        .split('.')
        .nth(2)
        .and_then(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
        .unwrap_or(0)
}

/// Backend choice for a session. `use_conpty: Some(false)` always forces
/// WinPTY; `Some(true)` forces ConPTY; otherwise the build number decides.
pub(crate) fn use_conpty(override_flag: Option<bool>, os_release: &str) -> bool {
    match override_flag {
        Some(forced) => forced,
        None => parse_build_number(os_release) >= CONPTY_MINIMUM_BUILD,
    }
}

/// What every Windows backend can do after start-up.
pub(crate) trait ConsoleBackend: Send + Sync {
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;
    fn kill(&self) -> Result<()>;
    fn exit_code(&self) -> Option<i32>;
}

struct ConptyBackend {
    native: Arc<dyn ConptyNative>,
    pty_id: i32,
    inner_pid: i32,
    exit_code: Arc<Mutex<Option<i32>>>,
    process_list_timeout: Duration,
}

impl ConsoleBackend for ConptyBackend {
    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.exit_code.lock().unwrap().is_some() {
            return Err(PtyError::AlreadyExited);
        }
        self.native.resize(self.pty_id, cols, rows)
    }

    fn kill(&self) -> Result<()> {
        // The console process list comes from a bounded worker; an
        // unresponsive lookup degrades to the inner pid alone rather than
        // hanging the kill.
        let (tx, rx) = mpsc::channel();
        {
            let native = self.native.clone();
            let inner_pid = self.inner_pid;
            thread::spawn(move || {
                let _ = tx.send(native.console_process_list(inner_pid));
            });
        }
        let pids = match rx.recv_timeout(self.process_list_timeout) {
            Ok(pids) => pids,
            Err(_) => {
                warn!(
                    pid = self.inner_pid,
                    "console process list timed out; killing inner pid only"
                );
                vec![self.inner_pid]
            }
        };
        for pid in pids {
            self.native.terminate_process(pid);
        }
        self.native.kill(self.pty_id)
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }
}

struct WinptyBackend {
    native: Arc<dyn WinptyNative>,
    pid: i32,
    inner_pid_handle: isize,
}

impl ConsoleBackend for WinptyBackend {
    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.native.resize(self.pid, cols, rows)
    }

    fn kill(&self) -> Result<()> {
        self.native.kill(self.pid, self.inner_pid_handle)?;
        // Handle release does not guarantee subtree death on this backend;
        // sweep whatever the session still lists.
        for pid in self.native.process_list(self.pid) {
            self.native.terminate_process(pid);
        }
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        self.native.exit_code(self.inner_pid_handle)
    }
}

/// Natives available to a Windows session, injected so tests can script
/// them.
pub(crate) struct WindowsNatives {
    pub conpty: Result<Arc<dyn ConptyNative>>,
    pub winpty: Result<Arc<dyn WinptyNative>>,
    pub os_release: String,
}

static PIPE_SERIAL: AtomicI32 = AtomicI32::new(0);

/// Per-session pipe name; unique within and across processes.
fn generate_pipe_name() -> String {
    let serial = PIPE_SERIAL.fetch_add(1, Ordering::SeqCst);
    let clock = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!(
        "\\\\.\\pipe\\ptyspawn-{}-{}-{}",
        std::process::id(),
        serial,
        clock
    )
}

/// The per-session Windows agent: owns the native handles and both pipe
/// channels.
pub(crate) struct WindowsPtyAgent {
    backend: Box<dyn ConsoleBackend>,
    pub conin: PtyChannel,
    pub conout: PtyChannel,
    pub pid: i32,
    pub inner_pid: i32,
    pub pty_id: String,
    pub uses_conpty: bool,
    flush: Arc<Mutex<Option<QuietTimer>>>,
}

impl WindowsPtyAgent {
    pub fn new(file: &str, args: &CommandArgs, options: &PtyOptions, natives: WindowsNatives) -> Result<Self> {
        Self::with_flush_window(file, args, options, natives, CONPTY_EXIT_FLUSH_WINDOW, PROCESS_LIST_TIMEOUT)
    }

    pub(crate) fn with_flush_window(
        file: &str,
        args: &CommandArgs,
        options: &PtyOptions,
        natives: WindowsNatives,
        flush_window: Duration,
        process_list_timeout: Duration,
    ) -> Result<Self> {
        let command_line = args_to_command_line(file, args);
        let cwd = options
            .cwd
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
            .to_string_lossy()
            .into_owned();
        let env_pairs: Vec<String> = options
            .env
            .as_ref()
            .map(|env| {
                let sorted: std::collections::BTreeMap<_, _> = env.iter().collect();
                sorted.iter().map(|(k, v)| format!("{k}={v}")).collect()
            })
            .unwrap_or_else(|| std::env::vars().map(|(k, v)| format!("{k}={v}")).collect());

        let conpty_selected = use_conpty(options.use_conpty, &natives.os_release);
        info!(
            backend = if conpty_selected { "conpty" } else { "winpty" },
            release = %natives.os_release,
            file,
            "starting windows pty"
        );

        if conpty_selected {
            let native = natives.conpty?;
            let pipe_name = generate_pipe_name();
            let start = native.start_process(
                file,
                options.cols,
                options.rows,
                false,
                &pipe_name,
                options.conpty_inherit_cursor,
            )?;

            let latch = Arc::new(ExitLatch::new());
            let on_exit = {
                let latch = latch.clone();
                Box::new(move |exit_code: i32, signal: Option<i32>| {
                    latch.fire(ExitRecord { exit_code, signal });
                })
            };
            let inner_pid = native.connect(start.pty_id, &command_line, &cwd, &env_pairs, on_exit)?;

            let conout = PtyChannel::new(Some(start.conout), None, ErrorPolicy::default());
            let conin = PtyChannel::new(None, Some(start.conin), ErrorPolicy::default());

            let exit_code = Arc::new(Mutex::new(None));
            let flush: Arc<Mutex<Option<QuietTimer>>> = Arc::new(Mutex::new(None));

            // Trailing output restarts the flush window.
            {
                let flush = flush.clone();
                let _sub = conout.on_data(move |_chunk: &Vec<u8>| {
                    if let Some(timer) = flush.lock().unwrap().as_ref() {
                        timer.poke();
                    }
                });
            }

            // Native exit: record the code, then tear the channels down
            // only after the output has gone quiet.
            {
                let exit_code = exit_code.clone();
                let flush = flush.clone();
                let conout = conout.clone();
                let conin = conin.clone();
                latch.set_handler(move |record| {
                    debug!(inner_pid, code = record.exit_code, "conpty process exited");
                    *exit_code.lock().unwrap() = Some(record.exit_code);
                    let timer = QuietTimer::start(flush_window, move || {
                        conout.shut_io();
                        conin.shut_io();
                        conout.destroy();
                    });
                    *flush.lock().unwrap() = Some(timer);
                });
            }

            let backend = ConptyBackend {
                native,
                pty_id: start.pty_id,
                inner_pid,
                exit_code,
                process_list_timeout,
            };
            Ok(Self {
                backend: Box::new(backend),
                conin,
                conout,
                pid: inner_pid,
                inner_pid,
                pty_id: pipe_name,
                uses_conpty: true,
                flush,
            })
        } else {
            let native = natives.winpty?;
            let start = native.start_process(
                file,
                &command_line,
                &env_pairs,
                &cwd,
                options.cols,
                options.rows,
                false,
            )?;

            let conout = PtyChannel::new(Some(start.conout), None, ErrorPolicy::default());
            let conin = PtyChannel::new(None, Some(start.conin), ErrorPolicy::default());

            let backend = WinptyBackend {
                native,
                pid: start.pid,
                inner_pid_handle: start.inner_pid_handle,
            };
            Ok(Self {
                backend: Box::new(backend),
                conin,
                conout,
                pid: start.pid,
                inner_pid: start.inner_pid,
                pty_id: start.pty_id.to_string(),
                uses_conpty: false,
                flush: Arc::new(Mutex::new(None)),
            })
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.conin.write(data).map_err(PtyError::Io)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.backend.resize(cols, rows)
    }

    pub fn kill(&self) -> Result<()> {
        self.backend.kill()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.backend.exit_code()
    }

    /// Tear down both channels; the pending flush timer, if any, has
    /// nothing left to do.
    pub fn shutdown(&self) {
        if let Some(timer) = self.flush.lock().unwrap().take() {
            timer.cancel();
        }
        self.conin.destroy();
        self.conout.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build_number() {
        assert_eq!(parse_build_number("10.0.18362"), 18362);
        assert_eq!(parse_build_number("10.0.17763-rc1"), 17763);
        assert_eq!(parse_build_number("10.0"), 0);
        assert_eq!(parse_build_number("garbage"), 0);
    }

    #[test]
    fn test_backend_selection_by_build() {
        assert!(!use_conpty(None, "10.0.18308"));
        assert!(use_conpty(None, "10.0.18309"));
        assert!(use_conpty(None, "10.0.22621"));
    }

    #[test]
    fn test_use_conpty_false_always_wins() {
        assert!(!use_conpty(Some(false), "10.0.18309"));
        assert!(!use_conpty(Some(false), "10.0.99999"));
        assert!(use_conpty(Some(true), "10.0.10586"));
    }
}

//! The native collaborator boundary.
//!
//! Everything that actually forks a process or allocates a
//! pseudoconsole lives behind the traits in this module. The crate ships a
//! default implementation per platform: `posix` (openpty/fork), `conpty`
//! (Windows pseudoconsole) and `winpty` (the legacy `winpty.dll`), each
//! reachable through a lazily-initialized, process-lifetime singleton. A
//! backend that does not exist on the running host, or whose library fails
//! to load, reports [`PtyError::NativeUnavailable`] instead of silently
//! falling back.
//!
//! Agents hold the traits as `Arc<dyn ...>`, which is also what lets the
//! session machinery be exercised against scripted fakes in tests.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::error::{PtyError, Result};

#[cfg(unix)]
mod posix;

#[cfg(windows)]
mod conpty;
#[cfg(windows)]
mod winpty;
#[cfg(windows)]
mod winproc;

/// Exit callback handed to the native layer: `(exit_code, signal)`.
pub type ExitCallback = Box<dyn FnOnce(i32, Option<i32>) + Send>;

/// Everything the POSIX fork primitive needs.
pub struct ForkRequest {
    pub file: String,
    /// Full argv including `argv[0]`.
    pub argv: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub utf8: bool,
}

/// A forked pty: ids for addressing plus the bound I/O endpoints.
pub struct ForkHandle {
    pub pid: i32,
    pub fd: i32,
    /// Slave device name, e.g. `/dev/pts/3`.
    pub pty: String,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// An opened master/slave pair with no process attached.
pub struct OpenHandle {
    pub master_fd: i32,
    pub slave_fd: i32,
    pub pty: String,
    pub master_reader: Box<dyn Read + Send>,
    pub master_writer: Box<dyn Write + Send>,
    pub slave_reader: Box<dyn Read + Send>,
    pub slave_writer: Box<dyn Write + Send>,
}

/// POSIX pty primitive.
pub trait UnixNative: Send + Sync {
    /// Fork a process onto a fresh pty. `on_exit` fires once when the
    /// child is reaped.
    fn fork(&self, request: ForkRequest, on_exit: ExitCallback) -> Result<ForkHandle>;

    /// Allocate a pty without forking.
    fn open(&self, cols: u16, rows: u16) -> Result<OpenHandle>;

    /// Change the window size of the pty addressed by `fd`.
    fn resize(&self, fd: i32, cols: u16, rows: u16) -> Result<()>;

    /// Name of the foreground process on the pty, when discoverable.
    fn process_name(&self, fd: i32) -> Option<String>;

    /// Send `signal` to `pid`.
    fn kill(&self, pid: i32, signal: i32) -> Result<()>;
}

/// Result of starting a ConPTY session (before a process is connected).
pub struct ConptyStart {
    pub pty_id: i32,
    pub fd: i32,
    pub conin_name: String,
    pub conout_name: String,
    pub conin: Box<dyn Write + Send>,
    pub conout: Box<dyn Read + Send>,
}

/// Windows pseudoconsole primitive.
pub trait ConptyNative: Send + Sync {
    fn start_process(
        &self,
        file: &str,
        cols: u16,
        rows: u16,
        debug: bool,
        pipe_name: &str,
        inherit_cursor: bool,
    ) -> Result<ConptyStart>;

    /// Attach the command line to the pseudoconsole; returns the inner
    /// process id. `on_exit` fires once with the process exit code.
    fn connect(
        &self,
        pty_id: i32,
        command_line: &str,
        cwd: &str,
        env: &[String],
        on_exit: ExitCallback,
    ) -> Result<i32>;

    fn resize(&self, pty_id: i32, cols: u16, rows: u16) -> Result<()>;

    fn kill(&self, pty_id: i32) -> Result<()>;

    /// Pids attached to the console of `pid`, including `pid` itself.
    fn console_process_list(&self, pid: i32) -> Vec<i32>;

    /// Best-effort termination of one process.
    fn terminate_process(&self, pid: i32) -> bool;
}

/// Result of starting a WinPTY session.
pub struct WinptyStart {
    pub pid: i32,
    pub inner_pid: i32,
    /// Opaque process-handle token for exit-code queries and kill.
    pub inner_pid_handle: isize,
    pub fd: i32,
    pub pty_id: i32,
    pub conin: Box<dyn Write + Send>,
    pub conout: Box<dyn Read + Send>,
}

/// Legacy WinPTY primitive.
pub trait WinptyNative: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn start_process(
        &self,
        file: &str,
        command_line: &str,
        env: &[String],
        cwd: &str,
        cols: u16,
        rows: u16,
        debug: bool,
    ) -> Result<WinptyStart>;

    fn resize(&self, pid: i32, cols: u16, rows: u16) -> Result<()>;

    fn kill(&self, pid: i32, inner_pid_handle: isize) -> Result<()>;

    /// All pids belonging to the session rooted at `pid`.
    fn process_list(&self, pid: i32) -> Vec<i32>;

    fn exit_code(&self, inner_pid_handle: isize) -> Option<i32>;

    /// Best-effort termination of one process.
    fn terminate_process(&self, pid: i32) -> bool;
}

/// The POSIX backend for this process.
pub fn unix() -> Result<Arc<dyn UnixNative>> {
    #[cfg(unix)]
    {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<Arc<posix::PosixNative>> = OnceLock::new();
        let native = INSTANCE.get_or_init(|| Arc::new(posix::PosixNative::new()));
        Ok(native.clone())
    }
    #[cfg(not(unix))]
    {
        Err(PtyError::NativeUnavailable(
            "the posix pty backend requires a unix host".to_string(),
        ))
    }
}

/// The ConPTY backend for this process.
pub fn conpty() -> Result<Arc<dyn ConptyNative>> {
    #[cfg(windows)]
    {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<Arc<conpty::ConptyApi>> = OnceLock::new();
        let native = INSTANCE.get_or_init(|| Arc::new(conpty::ConptyApi::new()));
        Ok(native.clone())
    }
    #[cfg(not(windows))]
    {
        Err(PtyError::NativeUnavailable(
            "the conpty backend requires a windows host".to_string(),
        ))
    }
}

/// The WinPTY backend for this process. Loading `winpty.dll` happens once;
/// a load failure is sticky and reported to every caller.
pub fn winpty() -> Result<Arc<dyn WinptyNative>> {
    #[cfg(windows)]
    {
        use std::sync::OnceLock;
        static INSTANCE: OnceLock<std::result::Result<Arc<winpty::WinptyApi>, String>> =
            OnceLock::new();
        let loaded = INSTANCE.get_or_init(|| winpty::WinptyApi::load().map(Arc::new));
        match loaded {
            Ok(native) => Ok(native.clone() as Arc<dyn WinptyNative>),
            Err(message) => Err(PtyError::NativeUnavailable(message.clone())),
        }
    }
    #[cfg(not(windows))]
    {
        Err(PtyError::NativeUnavailable(
            "the winpty backend requires a windows host".to_string(),
        ))
    }
}

/// OS release string, `major.minor.build` on Windows.
pub fn os_release() -> String {
    #[cfg(windows)]
    {
        winproc::os_release()
    }
    #[cfg(not(windows))]
    {
        String::from("0.0.0")
    }
}

//! ptyspawn - spawn processes on a pseudoterminal, on any desktop OS.
//!
//! One session contract over three incompatible native backends: POSIX
//! fork+openpty, the modern Windows pseudoconsole (ConPTY) and the legacy
//! WinPTY emulation layer. Callers get an object with `write`, `resize`,
//! `kill`, `destroy` and `data`/`exit`/`close` notifications, and never
//! branch on the platform themselves.
//!
//! # Quick Start
//!
//! ```no_run
//! use ptyspawn::{spawn, PtyOptions};
//!
//! let options = PtyOptions {
//!     name: Some("xterm-256color".to_string()),
//!     cols: 120,
//!     rows: 40,
//!     ..Default::default()
//! };
//! let terminal = spawn("bash", ["-l"], &options)?;
//!
//! let _sub = terminal.on_data(Box::new(|chunk| {
//!     print!("{}", String::from_utf8_lossy(chunk));
//! }));
//! terminal.write(b"echo hello\r")?;
//! terminal.resize(100, 30)?;
//! # Ok::<(), ptyspawn::PtyError>(())
//! ```
//!
//! # Backends
//!
//! | Backend | Selected when |
//! |---------|---------------|
//! | POSIX   | any unix host |
//! | ConPTY  | Windows build ≥ 18309, unless `use_conpty = Some(false)` |
//! | WinPTY  | older Windows builds, or when ConPTY is forbidden |
//!
//! Backend quirks are reconciled inside the library: Windows sessions queue
//! every call issued before the pipe delivers its first byte and replay
//! them in order; ConPTY's asynchronous exit code is held back briefly so
//! trailing output reaches `data` listeners before `exit`; POSIX exits wait
//! for the stream to drain, bounded by a safety timer.

mod core;
mod error;
mod options;
pub mod native;

pub use crate::core::cmdline::args_to_command_line;
pub use crate::core::notify::{Notifier, Subscription};
pub use crate::core::terminal::{ExitRecord, Terminal};
pub use crate::core::unix::{UnixPtyPair, UnixTerminal, POSIX_EXIT_FLUSH_TIMEOUT, SIGHUP};
pub use crate::core::windows::agent::{
    CONPTY_EXIT_FLUSH_WINDOW, CONPTY_MINIMUM_BUILD, PROCESS_LIST_TIMEOUT,
};
pub use crate::core::windows::WindowsTerminal;
pub use crate::error::{PtyError, Result};
pub use crate::options::{
    CommandArgs, PtyOptions, DEFAULT_COLS, DEFAULT_ROWS, FLOW_CONTROL_PAUSE, FLOW_CONTROL_RESUME,
};

/// Spawn `file` on the platform's native pty backend.
///
/// Synchronous from the caller's point of view: the native pty exists and
/// the process is started when this returns. I/O and exit notifications
/// arrive through the listeners on the returned [`Terminal`].
pub fn spawn(
    file: &str,
    args: impl Into<CommandArgs>,
    options: &PtyOptions,
) -> Result<Box<dyn Terminal>> {
    #[cfg(unix)]
    {
        Ok(Box::new(UnixTerminal::spawn(file, args, options)?))
    }
    #[cfg(windows)]
    {
        Ok(Box::new(WindowsTerminal::spawn(file, args, options)?))
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, args, options);
        Err(PtyError::UnsupportedPlatform("spawning a pty process"))
    }
}

/// Allocate a master/slave pty pair without forking. POSIX only.
pub fn open(options: &PtyOptions) -> Result<UnixPtyPair> {
    #[cfg(unix)]
    {
        UnixPtyPair::open(options)
    }
    #[cfg(not(unix))]
    {
        let _ = options;
        Err(PtyError::UnsupportedPlatform("opening a raw pty pair"))
    }
}

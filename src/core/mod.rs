//! Core session machinery.
//!
//! This module contains the platform-independent terminal layer:
//!
//! - **terminal**: the public session contract and shared base state
//! - **channel**: the duplex byte channel over a native I/O endpoint
//! - **notify**: typed publish/subscribe for `data`/`exit`/`close`
//! - **timer**: cancellable timers for exit-race reconciliation
//! - **cmdline**: Win32 command-line escaping
//! - **unix**: the POSIX agent (fork and open modes)
//! - **windows**: the Windows agent and its deferred-call front end
//!
//! # Architecture
//!
//! ```text
//! spawn()
//! ├── UnixTerminal ──── PtyChannel ──── native::unix()
//! └── WindowsTerminal
//!     └── WindowsPtyAgent
//!         ├── ConsoleBackend (ConPTY | WinPTY)
//!         └── conin / conout PtyChannels ── native::conpty()/winpty()
//! ```

pub mod channel;
pub mod cmdline;
pub mod notify;
pub mod terminal;
pub mod timer;
pub mod unix;
pub mod windows;

#[cfg(test)]
pub(crate) mod testutil;

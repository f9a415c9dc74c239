//! The platform-independent session contract.
//!
//! [`Terminal`] is the one surface callers see regardless of backend.
//! [`TerminalBase`] carries what every platform shares: session identity,
//! geometry, the exit notifier with its once-guard, the closed flag that
//! turns post-teardown writes into no-ops, and flow-control interception.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::notify::{Notifier, Subscription};
use crate::error::Result;
use crate::options::PtyOptions;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub exit_code: i32,
    /// Terminating POSIX signal, when the process did not exit normally.
    pub signal: Option<i32>,
}

/// A live pty session.
///
/// `write` after `destroy` or `kill` is a safe no-op; `exit` and `close`
/// each fire at most once per session.
pub trait Terminal: Send + Sync {
    /// Outer process id. On Windows this may be the pty agent rather than
    /// the requested program.
    fn pid(&self) -> i32;

    /// Id of the actually-spawned process. Equal to [`pid`](Self::pid) on
    /// POSIX.
    fn inner_pid(&self) -> i32;

    /// Opaque per-session pty handle/name.
    fn pty_id(&self) -> String;

    /// Name of the process currently attached to the pty, falling back to
    /// the spawned file.
    fn process(&self) -> String;

    fn cols(&self) -> u16;
    fn rows(&self) -> u16;
    fn readable(&self) -> bool;
    fn writable(&self) -> bool;

    /// Send input to the process. With flow control enabled, a payload
    /// equal to a configured sentinel toggles pause/resume instead of
    /// being forwarded.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Change the pty geometry. Both values must be non-zero.
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Terminate the process. `signal` defaults to SIGHUP on POSIX and is
    /// unsupported on Windows.
    fn kill(&self, signal: Option<i32>) -> Result<()>;

    /// Tear the session down. Safe to call repeatedly.
    fn destroy(&self);

    /// Close the write side while output continues to drain.
    fn end(&self);

    /// Suspend output delivery.
    fn pause(&self);

    /// Resume output delivery.
    fn resume(&self);

    /// Switch output decoding: `Some("utf8")` aligns data events to
    /// character boundaries, `None` delivers raw bytes.
    fn set_encoding(&self, encoding: Option<&str>) -> Result<()>;

    /// Register an output listener. Runs on the session's reader thread.
    fn on_data(&self, listener: Box<dyn FnMut(&[u8]) + Send>) -> Subscription;

    /// Register an exit listener. Fires at most once.
    fn on_exit(&self, listener: Box<dyn FnMut(&ExitRecord) + Send>) -> Subscription;

    /// Register a close listener. Fires at most once, after the output
    /// channel shuts down; a listener added later runs immediately.
    fn on_close(&self, listener: Box<dyn FnOnce() + Send>) -> Subscription;
}

/// What `write` should do with a payload under flow control.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FlowAction {
    Forward,
    Pause,
    Resume,
}

struct FlowSentinels {
    pause: Vec<u8>,
    resume: Vec<u8>,
}

/// State shared by every platform terminal.
pub(crate) struct TerminalBase {
    pub pid: i32,
    pub inner_pid: i32,
    pub pty_id: String,
    pub file: String,
    pub name: String,
    geometry: Mutex<(u16, u16)>,
    exit: Notifier<ExitRecord>,
    exit_emitted: AtomicBool,
    closed: AtomicBool,
    flow: Option<FlowSentinels>,
}

impl TerminalBase {
    pub fn new(
        pid: i32,
        inner_pid: i32,
        pty_id: String,
        file: String,
        name: String,
        options: &PtyOptions,
    ) -> Self {
        let flow = if options.handle_flow_control {
            Some(FlowSentinels {
                pause: options.flow_control_pause.as_bytes().to_vec(),
                resume: options.flow_control_resume.as_bytes().to_vec(),
            })
        } else {
            None
        };
        Self {
            pid,
            inner_pid,
            pty_id,
            file,
            name,
            geometry: Mutex::new((options.cols, options.rows)),
            exit: Notifier::new(),
            exit_emitted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            flow,
        }
    }

    /// Classify a write payload. Sentinel comparison is exact equality,
    /// never prefix or substring.
    pub fn flow_action(&self, data: &[u8]) -> FlowAction {
        match &self.flow {
            Some(sentinels) if data == sentinels.pause.as_slice() => FlowAction::Pause,
            Some(sentinels) if data == sentinels.resume.as_slice() => FlowAction::Resume,
            _ => FlowAction::Forward,
        }
    }

    pub fn geometry(&self) -> (u16, u16) {
        *self.geometry.lock().unwrap()
    }

    pub fn set_geometry(&self, cols: u16, rows: u16) {
        *self.geometry.lock().unwrap() = (cols, rows);
    }

    /// Flip the session non-readable/non-writable. Only the first call has
    /// an effect; afterwards `write` and `end` become no-ops.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Publish the exit record. At most one emission per session.
    pub fn emit_exit(&self, record: ExitRecord) {
        if !self.exit_emitted.swap(true, Ordering::SeqCst) {
            self.exit.fire(&record);
        }
    }

    pub fn on_exit(&self, listener: Box<dyn FnMut(&ExitRecord) + Send>) -> Subscription {
        self.exit.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn base_with_flow(pause: &str, resume: &str) -> TerminalBase {
        let options = PtyOptions {
            handle_flow_control: true,
            flow_control_pause: pause.to_string(),
            flow_control_resume: resume.to_string(),
            ..Default::default()
        };
        TerminalBase::new(1, 1, "pty-1".into(), "sh".into(), "xterm".into(), &options)
    }

    #[test]
    fn test_flow_action_exact_match_only() {
        let base = base_with_flow("PAUSE", "RESUME");
        assert_eq!(base.flow_action(b"PAUSE"), FlowAction::Pause);
        assert_eq!(base.flow_action(b"RESUME"), FlowAction::Resume);
        assert_eq!(base.flow_action(b"PAUSE "), FlowAction::Forward);
        assert_eq!(base.flow_action(b"xPAUSE"), FlowAction::Forward);
        assert_eq!(base.flow_action(b"PAUS"), FlowAction::Forward);
    }

    #[test]
    fn test_flow_disabled_forwards_everything() {
        let base = TerminalBase::new(
            1,
            1,
            "pty-1".into(),
            "sh".into(),
            "xterm".into(),
            &PtyOptions::default(),
        );
        assert_eq!(base.flow_action(b"\x13"), FlowAction::Forward);
    }

    #[test]
    fn test_exit_emits_once() {
        let base = base_with_flow("p", "r");
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let _sub = base.on_exit(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        base.emit_exit(ExitRecord {
            exit_code: 0,
            signal: None,
        });
        base.emit_exit(ExitRecord {
            exit_code: 1,
            signal: None,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mark_closed_once() {
        let base = base_with_flow("p", "r");
        assert!(base.mark_closed());
        assert!(!base.mark_closed());
        assert!(base.is_closed());
    }
}

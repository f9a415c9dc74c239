//! POSIX terminal agent.
//!
//! Wraps the native fork/open primitives and reconciles the race between
//! process exit and stream close: the kernel may report the child gone
//! while the last output bytes are still in flight through the master fd,
//! so `exit` is held until the channel's own close, bounded by a safety
//! timer that force-destroys the channel rather than waiting forever.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::core::channel::{ErrorPolicy, PtyChannel};
use crate::core::notify::{ExitLatch, Subscription};
use crate::core::terminal::{ExitRecord, FlowAction, Terminal, TerminalBase};
use crate::core::timer::OneShotTimer;
use crate::error::{PtyError, Result};
use crate::native::{self, ForkRequest, UnixNative};
use crate::options::{validate_args, validate_file, CommandArgs, PtyOptions};

/// How long to wait, after the native layer reports process exit, for the
/// channel to deliver its close before force-destroying it. Pragmatic; not
/// derived from any OS guarantee.
pub const POSIX_EXIT_FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

/// Default signal for `kill` and the guaranteed post-destroy kill.
pub const SIGHUP: i32 = 1;

const DEFAULT_NAME: &str = "xterm";

/// A session spawned on a real POSIX pty.
pub struct UnixTerminal {
    base: Arc<TerminalBase>,
    channel: PtyChannel,
    native: Arc<dyn UnixNative>,
    fd: i32,
    destroy_called: AtomicBool,
}

impl std::fmt::Debug for UnixTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixTerminal")
            .field("fd", &self.fd)
            .field("destroy_called", &self.destroy_called)
            .finish_non_exhaustive()
    }
}

impl UnixTerminal {
    /// Fork `file` onto a fresh pty.
    pub fn spawn(file: &str, args: impl Into<CommandArgs>, options: &PtyOptions) -> Result<Self> {
        Self::with_native(native::unix()?, file, &args.into(), options)
    }

    pub(crate) fn with_native(
        native: Arc<dyn UnixNative>,
        file: &str,
        args: &CommandArgs,
        options: &PtyOptions,
    ) -> Result<Self> {
        options.validate()?;
        validate_file(file)?;
        validate_args(args)?;
        let args = match args {
            CommandArgs::Args(list) => list.clone(),
            CommandArgs::CommandLine(_) => {
                return Err(PtyError::InvalidOption {
                    field: "args",
                    expected: "an argument list on posix",
                    actual: "a pre-escaped command line".to_string(),
                })
            }
        };

        let name = options
            .name
            .clone()
            .or_else(|| std::env::var("TERM").ok())
            .unwrap_or_else(|| DEFAULT_NAME.to_string());
        let cwd = options
            .cwd
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
            .to_string_lossy()
            .into_owned();

        // Deterministic pair order; TERM always reflects the session name.
        let mut env: BTreeMap<String, String> = match &options.env {
            Some(env) => env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => std::env::vars().collect(),
        };
        env.insert("TERM".to_string(), name.clone());
        let env_pairs: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(file.to_string());
        argv.extend(args);

        let utf8 = options
            .encoding
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case("utf8") || e.eq_ignore_ascii_case("utf-8"));

        let latch = Arc::new(ExitLatch::new());
        let on_exit = {
            let latch = latch.clone();
            Box::new(move |exit_code: i32, signal: Option<i32>| {
                latch.fire(ExitRecord { exit_code, signal });
            })
        };

        let request = ForkRequest {
            file: file.to_string(),
            argv,
            env: env_pairs,
            cwd,
            cols: options.cols,
            rows: options.rows,
            uid: options.uid,
            gid: options.gid,
            utf8,
        };
        let handle = native.fork(request, on_exit)?;
        info!(pid = handle.pid, pty = %handle.pty, file, "spawned pty process");

        // Bind the fd endpoints as an explicitly pipe-typed channel.
        let channel = PtyChannel::new(
            Some(handle.reader),
            Some(handle.writer),
            ErrorPolicy::posix(),
        );
        if utf8 {
            channel.set_utf8(true);
        }

        let base = Arc::new(TerminalBase::new(
            handle.pid,
            handle.pid,
            handle.pty,
            file.to_string(),
            name,
            options,
        ));

        // The session goes non-readable/non-writable with its channel.
        {
            let base = base.clone();
            let _sub = channel.once_close(move || {
                base.mark_closed();
            });
        }

        // Exit reconciliation: hold `exit` until the channel has closed, or
        // force the close after the safety timeout.
        {
            let base = base.clone();
            let channel = channel.clone();
            latch.set_handler(move |record| {
                if channel.is_closed() {
                    base.emit_exit(record);
                    return;
                }
                debug!(pid = base.pid, "process exited before channel close");
                let timer = {
                    let channel = channel.clone();
                    OneShotTimer::start(POSIX_EXIT_FLUSH_TIMEOUT, move || {
                        channel.destroy();
                    })
                };
                let _sub = channel.once_close(move || {
                    timer.cancel();
                    base.emit_exit(record);
                });
            });
        }

        Ok(Self {
            base,
            channel,
            native,
            fd: handle.fd,
            destroy_called: AtomicBool::new(false),
        })
    }

    fn write_raw(&self, data: &[u8]) -> Result<()> {
        self.channel.write(data).map_err(PtyError::Io)
    }
}

impl Terminal for UnixTerminal {
    fn pid(&self) -> i32 {
        self.base.pid
    }

    fn inner_pid(&self) -> i32 {
        self.base.inner_pid
    }

    fn pty_id(&self) -> String {
        self.base.pty_id.clone()
    }

    fn process(&self) -> String {
        self.native
            .process_name(self.fd)
            .unwrap_or_else(|| self.base.file.clone())
    }

    fn cols(&self) -> u16 {
        self.base.geometry().0
    }

    fn rows(&self) -> u16 {
        self.base.geometry().1
    }

    fn readable(&self) -> bool {
        self.channel.readable()
    }

    fn writable(&self) -> bool {
        self.channel.writable()
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.base.is_closed() {
            return Ok(());
        }
        match self.base.flow_action(data) {
            FlowAction::Pause => {
                self.pause();
                Ok(())
            }
            FlowAction::Resume => {
                self.resume();
                Ok(())
            }
            FlowAction::Forward => self.write_raw(data),
        }
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidGeometry { cols, rows });
        }
        if self.base.is_closed() {
            return Ok(());
        }
        self.native.resize(self.fd, cols, rows)?;
        self.base.set_geometry(cols, rows);
        Ok(())
    }

    fn kill(&self, signal: Option<i32>) -> Result<()> {
        let signal = signal.unwrap_or(SIGHUP);
        // The process may already be gone; that is not an error.
        if let Err(e) = self.native.kill(self.base.pid, signal) {
            debug!(pid = self.base.pid, signal, "kill skipped: {e}");
        }
        Ok(())
    }

    fn destroy(&self) {
        if self.destroy_called.swap(true, Ordering::SeqCst) {
            return;
        }
        // SIGHUP is guaranteed once the channel confirms closure.
        let native = self.native.clone();
        let pid = self.base.pid;
        let _sub = self.channel.once_close(move || {
            if let Err(e) = native.kill(pid, SIGHUP) {
                debug!(pid, "post-destroy kill skipped: {e}");
            }
        });
        self.channel.destroy();
    }

    fn end(&self) {
        if !self.base.is_closed() {
            self.channel.end();
        }
    }

    fn pause(&self) {
        self.channel.pause();
    }

    fn resume(&self) {
        self.channel.resume();
    }

    fn set_encoding(&self, encoding: Option<&str>) -> Result<()> {
        match encoding {
            None => {
                self.channel.set_utf8(false);
                Ok(())
            }
            Some(codec)
                if codec.eq_ignore_ascii_case("utf8") || codec.eq_ignore_ascii_case("utf-8") =>
            {
                self.channel.set_utf8(true);
                Ok(())
            }
            Some(other) => Err(PtyError::InvalidOption {
                field: "encoding",
                expected: "\"utf8\" or no encoding",
                actual: format!("{other:?}"),
            }),
        }
    }

    fn on_data(&self, mut listener: Box<dyn FnMut(&[u8]) + Send>) -> Subscription {
        self.channel.on_data(move |chunk: &Vec<u8>| listener(chunk))
    }

    fn on_exit(&self, listener: Box<dyn FnMut(&ExitRecord) + Send>) -> Subscription {
        self.base.on_exit(listener)
    }

    fn on_close(&self, listener: Box<dyn FnOnce() + Send>) -> Subscription {
        self.channel.once_close(listener)
    }
}

/// A master/slave pty pair with no process attached, for callers that
/// manage the child themselves.
pub struct UnixPtyPair {
    pub master: PtyChannel,
    pub slave: PtyChannel,
    pty: String,
    master_fd: i32,
    native: Arc<dyn UnixNative>,
}

impl UnixPtyPair {
    /// Allocate a pty without forking.
    pub fn open(options: &PtyOptions) -> Result<Self> {
        Self::with_native(native::unix()?, options)
    }

    pub(crate) fn with_native(native: Arc<dyn UnixNative>, options: &PtyOptions) -> Result<Self> {
        options.validate()?;
        let handle = native.open(options.cols, options.rows)?;
        info!(pty = %handle.pty, "opened pty pair");
        let master = PtyChannel::new(
            Some(handle.master_reader),
            Some(handle.master_writer),
            ErrorPolicy::posix(),
        );
        let slave = PtyChannel::new(
            Some(handle.slave_reader),
            Some(handle.slave_writer),
            ErrorPolicy::posix(),
        );
        Ok(Self {
            master,
            slave,
            pty: handle.pty,
            master_fd: handle.master_fd,
            native,
        })
    }

    /// Slave device name.
    pub fn pty(&self) -> &str {
        &self.pty
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidGeometry { cols, rows });
        }
        self.native.resize(self.master_fd, cols, rows)
    }

    pub fn destroy(&self) {
        self.master.destroy();
        self.slave.destroy();
    }
}

//! Windows terminal: a deferred-call front end over the pty agent.
//!
//! Construction returns before the native side is actually servicing I/O,
//! so every mutating call issued early is captured as a tagged command in a
//! FIFO and replayed, in issue order, the first time a *data* event arrives
//! on the output channel. Connect is not readiness, since the pipe can be
//! connected while the agent is still warming up; that is why the data
//! event is the trigger. Once drained the queue is retired for good.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, warn};

use crate::core::notify::Subscription;
use crate::core::terminal::{ExitRecord, FlowAction, Terminal, TerminalBase};
use crate::core::windows::agent::{WindowsNatives, WindowsPtyAgent};
use crate::error::{PtyError, Result};
use crate::native;
use crate::options::{validate_args, validate_file, CommandArgs, PtyOptions};

const DEFAULT_NAME: &str = "Windows Shell";

/// A mutating call captured before readiness.
#[derive(Debug)]
pub(crate) enum DeferredCall {
    Write(Vec<u8>),
    Resize(u16, u16),
    Kill,
    Destroy,
}

struct DeferredState {
    ready: bool,
    queue: VecDeque<DeferredCall>,
}

struct Inner {
    base: TerminalBase,
    agent: WindowsPtyAgent,
    deferred: Mutex<DeferredState>,
    destroy_called: AtomicBool,
}

impl Inner {
    /// Run `call` now when ready, otherwise enqueue it for replay.
    fn defer(&self, call: DeferredCall) -> Result<()> {
        {
            let mut state = self.deferred.lock().unwrap();
            if !state.ready {
                state.queue.push_back(call);
                return Ok(());
            }
        }
        self.dispatch(call)
    }

    fn dispatch(&self, call: DeferredCall) -> Result<()> {
        match call {
            DeferredCall::Write(data) => self.agent.write(&data),
            DeferredCall::Resize(cols, rows) => {
                self.agent.resize(cols, rows)?;
                self.base.set_geometry(cols, rows);
                Ok(())
            }
            DeferredCall::Kill => {
                if let Err(e) = self.agent.kill() {
                    warn!(pid = self.base.pid, "kill failed: {e}");
                }
                Ok(())
            }
            DeferredCall::Destroy => {
                self.do_destroy();
                Ok(())
            }
        }
    }

    /// First data event: flip ready and replay the queue in issue order.
    fn mark_ready(&self) {
        let drained = {
            let mut state = self.deferred.lock().unwrap();
            if state.ready {
                return;
            }
            state.ready = true;
            std::mem::take(&mut state.queue)
        };
        for call in drained {
            if let Err(e) = self.dispatch(call) {
                warn!("deferred call failed: {e}");
            }
        }
    }

    fn do_destroy(&self) {
        if self.destroy_called.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.agent.kill() {
            warn!(pid = self.base.pid, "kill during destroy failed: {e}");
        }
        self.agent.shutdown();
        self.base.mark_closed();
    }
}

/// A session running behind ConPTY or WinPTY.
pub struct WindowsTerminal {
    inner: Arc<Inner>,
}

impl WindowsTerminal {
    /// Start `file` on the preferred Windows backend.
    pub fn spawn(file: &str, args: impl Into<CommandArgs>, options: &PtyOptions) -> Result<Self> {
        let natives = WindowsNatives {
            conpty: native::conpty(),
            winpty: native::winpty(),
            os_release: native::os_release(),
        };
        Self::with_natives(file, &args.into(), options, natives)
    }

    pub(crate) fn with_natives(
        file: &str,
        args: &CommandArgs,
        options: &PtyOptions,
        natives: WindowsNatives,
    ) -> Result<Self> {
        options.validate()?;
        validate_file(file)?;
        validate_args(args)?;
        if options.encoding.is_some() {
            warn!("`encoding` is ignored on Windows; output is delivered as raw bytes");
        }

        let agent = WindowsPtyAgent::new(file, args, options, natives)?;
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_NAME.to_string());
        let base = TerminalBase::new(
            agent.pid,
            agent.inner_pid,
            agent.pty_id.clone(),
            file.to_string(),
            name,
            options,
        );

        let inner = Arc::new(Inner {
            base,
            agent,
            deferred: Mutex::new(DeferredState {
                ready: false,
                queue: VecDeque::new(),
            }),
            destroy_called: AtomicBool::new(false),
        });

        // Readiness is the first data event, never connect.
        {
            let inner_for_ready = inner.clone();
            let _sub = inner
                .agent
                .conout
                .on_data(move |_chunk: &Vec<u8>| inner_for_ready.mark_ready());
        }

        // Channel close delivers the recorded exit code, then tears down.
        {
            let inner_for_close = inner.clone();
            let _sub = inner.agent.conout.once_close(move || {
                let exit_code = inner_for_close.agent.exit_code().unwrap_or(0);
                inner_for_close.base.emit_exit(ExitRecord {
                    exit_code,
                    signal: None,
                });
                inner_for_close.do_destroy();
            });
        }

        // Channel errors tear the session down; surfaced in the log when
        // nobody external is listening.
        {
            let inner_for_error = inner.clone();
            let _sub = inner.agent.conout.on_error(move |e: &std::io::Error| {
                if inner_for_error.agent.conout.error_listener_count() < 2 {
                    error!(pid = inner_for_error.base.pid, "pty channel error: {e}");
                }
                inner_for_error.do_destroy();
            });
        }

        Ok(Self { inner })
    }

    /// Whether the session runs on ConPTY (as opposed to WinPTY).
    pub fn uses_conpty(&self) -> bool {
        self.inner.agent.uses_conpty
    }
}

impl Terminal for WindowsTerminal {
    fn pid(&self) -> i32 {
        self.inner.base.pid
    }

    fn inner_pid(&self) -> i32 {
        self.inner.base.inner_pid
    }

    fn pty_id(&self) -> String {
        self.inner.base.pty_id.clone()
    }

    fn process(&self) -> String {
        self.inner.base.name.clone()
    }

    fn cols(&self) -> u16 {
        self.inner.base.geometry().0
    }

    fn rows(&self) -> u16 {
        self.inner.base.geometry().1
    }

    fn readable(&self) -> bool {
        self.inner.agent.conout.readable()
    }

    fn writable(&self) -> bool {
        self.inner.agent.conin.writable()
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.inner.base.is_closed() {
            return Ok(());
        }
        match self.inner.base.flow_action(data) {
            FlowAction::Pause => {
                self.pause();
                Ok(())
            }
            FlowAction::Resume => {
                self.resume();
                Ok(())
            }
            FlowAction::Forward => self.inner.defer(DeferredCall::Write(data.to_vec())),
        }
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidGeometry { cols, rows });
        }
        self.inner.defer(DeferredCall::Resize(cols, rows))
    }

    fn kill(&self, signal: Option<i32>) -> Result<()> {
        if signal.is_some() {
            // The backend has no signal concept.
            return Err(PtyError::UnsupportedPlatform(
                "sending a signal to a pty process",
            ));
        }
        self.inner.defer(DeferredCall::Kill)
    }

    fn destroy(&self) {
        let _ = self.inner.defer(DeferredCall::Destroy);
    }

    fn end(&self) {
        self.inner.agent.conin.end();
    }

    fn pause(&self) {
        self.inner.agent.conout.pause();
    }

    fn resume(&self) {
        self.inner.agent.conout.resume();
    }

    fn set_encoding(&self, encoding: Option<&str>) -> Result<()> {
        if encoding.is_some() {
            warn!("`encoding` is ignored on Windows; output is delivered as raw bytes");
        }
        Ok(())
    }

    fn on_data(&self, mut listener: Box<dyn FnMut(&[u8]) + Send>) -> Subscription {
        self.inner
            .agent
            .conout
            .on_data(move |chunk: &Vec<u8>| listener(chunk))
    }

    fn on_exit(&self, listener: Box<dyn FnMut(&ExitRecord) + Send>) -> Subscription {
        self.inner.base.on_exit(listener)
    }

    fn on_close(&self, listener: Box<dyn FnOnce() + Send>) -> Subscription {
        self.inner.agent.conout.once_close(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::{FakeConptyNative, FakeWinptyNative};
    use crate::core::windows::agent::CONPTY_EXIT_FLUSH_WINDOW;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn conpty_natives(fake: &Arc<FakeConptyNative>) -> WindowsNatives {
        WindowsNatives {
            conpty: Ok(fake.clone() as Arc<dyn crate::native::ConptyNative>),
            winpty: Err(PtyError::NativeUnavailable("not in this test".into())),
            os_release: "10.0.19045".to_string(),
        }
    }

    fn winpty_natives(fake: &Arc<FakeWinptyNative>) -> WindowsNatives {
        WindowsNatives {
            conpty: Err(PtyError::NativeUnavailable("not in this test".into())),
            winpty: Ok(fake.clone() as Arc<dyn crate::native::WinptyNative>),
            os_release: "10.0.17763".to_string(),
        }
    }

    fn spawn_conpty(options: &PtyOptions) -> (Arc<FakeConptyNative>, WindowsTerminal) {
        let fake = Arc::new(FakeConptyNative::new());
        let terminal = WindowsTerminal::with_natives(
            "cmd.exe",
            &CommandArgs::default(),
            options,
            conpty_natives(&fake),
        )
        .unwrap();
        (fake, terminal)
    }

    #[test]
    fn test_selects_conpty_on_new_builds() {
        let (_fake, terminal) = spawn_conpty(&PtyOptions::default());
        assert!(terminal.uses_conpty());
    }

    #[test]
    fn test_forced_winpty_ignores_build_number() {
        let fake = Arc::new(FakeWinptyNative::new());
        let mut natives = winpty_natives(&fake);
        natives.os_release = "10.0.99999".to_string();
        let options = PtyOptions {
            use_conpty: Some(false),
            ..Default::default()
        };
        let terminal = WindowsTerminal::with_natives(
            "cmd.exe",
            &CommandArgs::default(),
            &options,
            natives,
        )
        .unwrap();
        assert!(!terminal.uses_conpty());
        assert_eq!(terminal.pid(), 4000);
        assert_eq!(terminal.inner_pid(), 4001);
    }

    #[test]
    fn test_old_build_selects_winpty() {
        let fake = Arc::new(FakeWinptyNative::new());
        let mut natives = winpty_natives(&fake);
        natives.os_release = "10.0.18308".to_string();
        let terminal = WindowsTerminal::with_natives(
            "cmd.exe",
            &CommandArgs::default(),
            &PtyOptions::default(),
            natives,
        )
        .unwrap();
        assert!(!terminal.uses_conpty());
    }

    #[test]
    fn test_deferred_writes_replay_in_order() {
        let (fake, terminal) = spawn_conpty(&PtyOptions::default());

        terminal.write(b"first ").unwrap();
        terminal.write(b"second ").unwrap();
        terminal.write(b"third").unwrap();

        // Nothing reaches the pipe before readiness.
        thread::sleep(Duration::from_millis(40));
        assert_eq!(fake.written(), b"");

        // The first data event flips readiness and drains the queue.
        fake.feed_output(b"ready");
        wait_until(|| fake.written() == b"first second third");

        // Later calls run immediately.
        terminal.write(b"!").unwrap();
        wait_until(|| fake.written() == b"first second third!");
    }

    #[test]
    fn test_deferred_resize_and_kill_replay() {
        let (fake, terminal) = spawn_conpty(&PtyOptions::default());
        terminal.resize(100, 50).unwrap();
        terminal.kill(None).unwrap();
        assert!(fake.resizes().is_empty());

        fake.feed_output(b"go");
        wait_until(|| !fake.resizes().is_empty());
        assert_eq!(fake.resizes(), vec![(1, 100, 50)]);
        wait_until(|| !fake.terminated().is_empty());
        assert_eq!((terminal.cols(), terminal.rows()), (100, 50));
    }

    #[test]
    fn test_signal_kill_is_unsupported() {
        let (_fake, terminal) = spawn_conpty(&PtyOptions::default());
        assert!(matches!(
            terminal.kill(Some(15)),
            Err(PtyError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_resize_validates_before_deferring() {
        let (_fake, terminal) = spawn_conpty(&PtyOptions::default());
        assert!(matches!(
            terminal.resize(0, 10),
            Err(PtyError::InvalidGeometry { .. })
        ));
        assert_eq!((terminal.cols(), terminal.rows()), (80, 24));
    }

    #[test]
    fn test_conpty_resize_after_exit_errors() {
        let (fake, terminal) = spawn_conpty(&PtyOptions::default());
        fake.feed_output(b"ready");
        wait_until(|| {
            let s = terminal.inner.deferred.lock().unwrap();
            s.ready
        });

        fake.report_exit(0);
        wait_until(|| terminal.inner.agent.exit_code().is_some());
        assert!(matches!(
            terminal.resize(90, 30),
            Err(PtyError::AlreadyExited)
        ));
    }

    #[test]
    fn test_exit_flush_waits_for_quiescence() {
        let (fake, terminal) = spawn_conpty(&PtyOptions::default());
        let data: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let exits = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let data_at_close: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));

        {
            let sink = data.clone();
            let _sub = terminal.on_data(Box::new(move |chunk| {
                sink.lock().unwrap().extend_from_slice(chunk);
            }));
        }
        {
            let sink = exits.clone();
            let _sub = terminal.on_exit(Box::new(move |record| {
                sink.lock().unwrap().push(*record);
            }));
        }
        {
            let flag = closed.clone();
            let seen = data.clone();
            let at_close = data_at_close.clone();
            let _sub = terminal.on_close(Box::new(move || {
                *at_close.lock().unwrap() = seen.lock().unwrap().len();
                flag.store(true, Ordering::SeqCst);
            }));
        }

        fake.feed_output(b"early ");
        wait_until(|| data.lock().unwrap().len() == 6);

        // Exit lands while output is still trickling in: each chunk must
        // push the teardown out.
        fake.report_exit(42);
        fake.feed_output(b"trail1 ");
        thread::sleep(CONPTY_EXIT_FLUSH_WINDOW / 2);
        fake.feed_output(b"trail2");
        assert!(exits.lock().unwrap().is_empty());

        wait_until(|| closed.load(Ordering::SeqCst));
        assert_eq!(exits.lock().unwrap().len(), 1);
        assert_eq!(exits.lock().unwrap()[0].exit_code, 42);
        // Every byte produced before death was observed before close.
        assert_eq!(*data_at_close.lock().unwrap(), b"early trail1 trail2".len());
    }

    #[test]
    fn test_destroy_twice_fires_exit_and_close_once() {
        let (fake, terminal) = spawn_conpty(&PtyOptions::default());
        let exits = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let counter = exits.clone();
            let _sub = terminal.on_exit(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let counter = closes.clone();
            let _sub = terminal.on_close(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        fake.feed_output(b"ready");
        wait_until(|| fake.written().is_empty()); // queue drained (empty queue)

        terminal.destroy();
        terminal.destroy();
        wait_until(|| closes.load(Ordering::SeqCst) == 1);
        assert_eq!(exits.load(Ordering::SeqCst), 1);

        // Writing after destroy is a safe no-op.
        terminal.write(b"late").unwrap();
        assert_eq!(fake.written(), b"");
    }

    #[test]
    fn test_conpty_kill_enumerates_console_processes() {
        let (fake, terminal) = spawn_conpty(&PtyOptions::default());
        fake.set_console_process_list(vec![3000, 3001, 3002]);
        fake.feed_output(b"ready");
        terminal.kill(None).unwrap();
        wait_until(|| fake.terminated().len() == 3);
        assert_eq!(fake.terminated(), vec![3000, 3001, 3002]);
        assert!(fake.killed_ptys().contains(&1));
    }

    #[test]
    fn test_winpty_kill_sweeps_process_list() {
        let fake = Arc::new(FakeWinptyNative::new());
        let terminal = WindowsTerminal::with_natives(
            "cmd.exe",
            &CommandArgs::default(),
            &PtyOptions {
                use_conpty: Some(false),
                ..Default::default()
            },
            winpty_natives(&fake),
        )
        .unwrap();
        fake.set_process_list(vec![4001, 4002]);
        fake.feed_output(b"ready");
        terminal.kill(None).unwrap();
        wait_until(|| fake.terminated().len() == 2);
        assert_eq!(fake.kills(), vec![(4000, 77)]);
    }

    #[test]
    fn test_connect_receives_escaped_command_line() {
        let fake = Arc::new(FakeConptyNative::new());
        let args = CommandArgs::Args(vec!["/c".to_string(), "echo hi".to_string()]);
        let _terminal = WindowsTerminal::with_natives(
            "cmd.exe",
            &args,
            &PtyOptions {
                cwd: Some("C:\\work".into()),
                env: Some(std::collections::HashMap::from([(
                    "FOO".to_string(),
                    "bar".to_string(),
                )])),
                ..Default::default()
            },
            conpty_natives(&fake),
        )
        .unwrap();

        let (command_line, cwd, env) = fake.connect_args.lock().unwrap().clone().unwrap();
        assert_eq!(command_line, "cmd.exe /c \"echo hi\"");
        assert_eq!(cwd, "C:\\work");
        assert_eq!(env, vec!["FOO=bar".to_string()]);
    }

    #[test]
    fn test_winpty_write_and_resize_once_ready() {
        let fake = Arc::new(FakeWinptyNative::new());
        let terminal = WindowsTerminal::with_natives(
            "cmd.exe",
            &CommandArgs::default(),
            &PtyOptions {
                use_conpty: Some(false),
                ..Default::default()
            },
            winpty_natives(&fake),
        )
        .unwrap();

        terminal.write(b"dir\r").unwrap();
        terminal.resize(90, 35).unwrap();
        fake.feed_output(b"Microsoft Windows");
        wait_until(|| fake.written() == b"dir\r");
        // WinPTY resizes are addressed by the outer pid.
        wait_until(|| fake.resizes() == vec![(4000, 90, 35)]);
    }

    #[test]
    fn test_winpty_exit_code_comes_from_handle() {
        let fake = Arc::new(FakeWinptyNative::new());
        let terminal = WindowsTerminal::with_natives(
            "cmd.exe",
            &CommandArgs::default(),
            &PtyOptions {
                use_conpty: Some(false),
                ..Default::default()
            },
            winpty_natives(&fake),
        )
        .unwrap();
        let exits = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = exits.clone();
            let _sub = terminal.on_exit(Box::new(move |record| {
                sink.lock().unwrap().push(*record);
            }));
        }

        fake.set_exit_code(9);
        fake.close_output();
        wait_until(|| !exits.lock().unwrap().is_empty());
        assert_eq!(exits.lock().unwrap()[0].exit_code, 9);
    }
}

//! Scripted fakes for exercising the session machinery without an OS pty.
//!
//! `FakePipe` plays the native read endpoint: tests feed it chunks, inject
//! errors, or close it to simulate end-of-stream. `SharedSink` captures
//! everything the session writes. The fake natives wire those into the
//! collaborator traits and record every call so tests can assert on what
//! reached the native layer.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::native::{
    ConptyNative, ConptyStart, ExitCallback, ForkHandle, ForkRequest, OpenHandle, UnixNative,
    WinptyNative, WinptyStart,
};

enum PipeMessage {
    Data(Vec<u8>),
    Error(io::Error),
}

/// Feedable read endpoint.
#[derive(Clone)]
pub(crate) struct FakePipe {
    tx: Arc<Mutex<Option<Sender<PipeMessage>>>>,
    rx: Arc<Mutex<Option<Receiver<PipeMessage>>>>,
}

impl FakePipe {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// Take the `Read` end. May be taken once.
    pub fn reader(&self) -> Box<dyn Read + Send> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("fake pipe reader already taken");
        Box::new(PipeReader {
            rx,
            pending: VecDeque::new(),
        })
    }

    pub fn feed(&self, data: &[u8]) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(PipeMessage::Data(data.to_vec()));
        }
    }

    pub fn fail(&self, error: io::Error) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(PipeMessage::Error(error));
        }
    }

    /// Simulate end-of-stream.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

struct PipeReader {
    rx: Receiver<PipeMessage>,
    pending: VecDeque<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(PipeMessage::Data(data)) => self.pending.extend(data),
                Ok(PipeMessage::Error(error)) => return Err(error),
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        for (i, byte) in self.pending.drain(..n).enumerate() {
            buf[i] = byte;
        }
        Ok(n)
    }
}

/// Write endpoint that records everything.
#[derive(Clone)]
pub(crate) struct SharedSink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn writer(&self) -> Box<dyn Write + Send> {
        Box::new(SinkWriter {
            buffer: self.buffer.clone(),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().unwrap().clone()
    }
}

struct SinkWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Recorded copy of a fork request (without the callback).
#[derive(Clone)]
pub(crate) struct RecordedFork {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub utf8: bool,
}

/// Scripted POSIX native. One fork per instance.
pub(crate) struct FakeUnixNative {
    output: FakePipe,
    sink: SharedSink,
    exit_cb: Mutex<Option<ExitCallback>>,
    last_request: Mutex<Option<RecordedFork>>,
    resizes: Mutex<Vec<(i32, u16, u16)>>,
    kills: Mutex<Vec<(i32, i32)>>,
}

impl FakeUnixNative {
    pub fn new() -> Self {
        Self {
            output: FakePipe::new(),
            sink: SharedSink::new(),
            exit_cb: Mutex::new(None),
            last_request: Mutex::new(None),
            resizes: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
        }
    }

    /// Simulate process output.
    pub fn feed_output(&self, data: &[u8]) {
        self.output.feed(data);
    }

    /// Simulate the master fd reaching end-of-stream.
    pub fn close_output(&self) {
        self.output.close();
    }

    /// Fire the native exit callback.
    pub fn report_exit(&self, exit_code: i32, signal: Option<i32>) {
        if let Some(cb) = self.exit_cb.lock().unwrap().take() {
            cb(exit_code, signal);
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.sink.contents()
    }

    pub fn last_request(&self) -> RecordedFork {
        self.last_request.lock().unwrap().clone().expect("no fork recorded")
    }

    pub fn resizes(&self) -> Vec<(i32, u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn kills(&self) -> Vec<(i32, i32)> {
        self.kills.lock().unwrap().clone()
    }
}

impl UnixNative for FakeUnixNative {
    fn fork(&self, request: ForkRequest, on_exit: ExitCallback) -> Result<ForkHandle> {
        *self.last_request.lock().unwrap() = Some(RecordedFork {
            argv: request.argv,
            env: request.env,
            cwd: request.cwd,
            cols: request.cols,
            rows: request.rows,
            utf8: request.utf8,
        });
        *self.exit_cb.lock().unwrap() = Some(on_exit);
        Ok(ForkHandle {
            pid: 1000,
            fd: 3,
            pty: "/dev/pts/7".to_string(),
            reader: self.output.reader(),
            writer: self.sink.writer(),
        })
    }

    fn open(&self, _cols: u16, _rows: u16) -> Result<OpenHandle> {
        let master = FakePipe::new();
        let slave = FakePipe::new();
        Ok(OpenHandle {
            master_fd: 10,
            slave_fd: 11,
            pty: "/dev/pts/9".to_string(),
            master_reader: master.reader(),
            master_writer: self.sink.writer(),
            slave_reader: slave.reader(),
            slave_writer: SharedSink::new().writer(),
        })
    }

    fn resize(&self, fd: i32, cols: u16, rows: u16) -> Result<()> {
        self.resizes.lock().unwrap().push((fd, cols, rows));
        Ok(())
    }

    fn process_name(&self, _fd: i32) -> Option<String> {
        None
    }

    fn kill(&self, pid: i32, signal: i32) -> Result<()> {
        self.kills.lock().unwrap().push((pid, signal));
        Ok(())
    }
}

/// Scripted ConPTY native. One session per instance; `pty_id` is 1 and the
/// connected inner pid is 2000.
pub(crate) struct FakeConptyNative {
    output: FakePipe,
    sink: SharedSink,
    exit_cb: Mutex<Option<ExitCallback>>,
    resizes: Mutex<Vec<(i32, u16, u16)>>,
    killed_ptys: Mutex<Vec<i32>>,
    terminated: Mutex<Vec<i32>>,
    process_list: Mutex<Vec<i32>>,
    pub connect_args: Mutex<Option<(String, String, Vec<String>)>>,
}

impl FakeConptyNative {
    pub fn new() -> Self {
        Self {
            output: FakePipe::new(),
            sink: SharedSink::new(),
            exit_cb: Mutex::new(None),
            resizes: Mutex::new(Vec::new()),
            killed_ptys: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            process_list: Mutex::new(vec![2000]),
            connect_args: Mutex::new(None),
        }
    }

    pub fn feed_output(&self, data: &[u8]) {
        self.output.feed(data);
    }

    pub fn report_exit(&self, exit_code: i32) {
        if let Some(cb) = self.exit_cb.lock().unwrap().take() {
            cb(exit_code, None);
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.sink.contents()
    }

    pub fn resizes(&self) -> Vec<(i32, u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn killed_ptys(&self) -> Vec<i32> {
        self.killed_ptys.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<i32> {
        self.terminated.lock().unwrap().clone()
    }

    pub fn set_console_process_list(&self, pids: Vec<i32>) {
        *self.process_list.lock().unwrap() = pids;
    }
}

impl ConptyNative for FakeConptyNative {
    fn start_process(
        &self,
        _file: &str,
        _cols: u16,
        _rows: u16,
        _debug: bool,
        pipe_name: &str,
        _inherit_cursor: bool,
    ) -> Result<ConptyStart> {
        Ok(ConptyStart {
            pty_id: 1,
            fd: -1,
            conin_name: format!("{pipe_name}-in"),
            conout_name: format!("{pipe_name}-out"),
            conin: self.sink.writer(),
            conout: self.output.reader(),
        })
    }

    fn connect(
        &self,
        _pty_id: i32,
        command_line: &str,
        cwd: &str,
        env: &[String],
        on_exit: ExitCallback,
    ) -> Result<i32> {
        *self.connect_args.lock().unwrap() =
            Some((command_line.to_string(), cwd.to_string(), env.to_vec()));
        *self.exit_cb.lock().unwrap() = Some(on_exit);
        Ok(2000)
    }

    fn resize(&self, pty_id: i32, cols: u16, rows: u16) -> Result<()> {
        self.resizes.lock().unwrap().push((pty_id, cols, rows));
        Ok(())
    }

    fn kill(&self, pty_id: i32) -> Result<()> {
        self.killed_ptys.lock().unwrap().push(pty_id);
        Ok(())
    }

    fn console_process_list(&self, _pid: i32) -> Vec<i32> {
        self.process_list.lock().unwrap().clone()
    }

    fn terminate_process(&self, pid: i32) -> bool {
        self.terminated.lock().unwrap().push(pid);
        true
    }
}

/// Scripted WinPTY native. Outer pid 4000, inner pid 4001, handle token
/// 77, pty id 5.
pub(crate) struct FakeWinptyNative {
    output: FakePipe,
    sink: SharedSink,
    exit_code: Mutex<Option<i32>>,
    resizes: Mutex<Vec<(i32, u16, u16)>>,
    kills: Mutex<Vec<(i32, isize)>>,
    terminated: Mutex<Vec<i32>>,
    process_list: Mutex<Vec<i32>>,
}

impl FakeWinptyNative {
    pub fn new() -> Self {
        Self {
            output: FakePipe::new(),
            sink: SharedSink::new(),
            exit_code: Mutex::new(None),
            resizes: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            process_list: Mutex::new(vec![4001]),
        }
    }

    pub fn feed_output(&self, data: &[u8]) {
        self.output.feed(data);
    }

    pub fn close_output(&self) {
        self.output.close();
    }

    pub fn set_exit_code(&self, code: i32) {
        *self.exit_code.lock().unwrap() = Some(code);
    }

    pub fn set_process_list(&self, pids: Vec<i32>) {
        *self.process_list.lock().unwrap() = pids;
    }

    pub fn written(&self) -> Vec<u8> {
        self.sink.contents()
    }

    pub fn resizes(&self) -> Vec<(i32, u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn kills(&self) -> Vec<(i32, isize)> {
        self.kills.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<i32> {
        self.terminated.lock().unwrap().clone()
    }
}

impl WinptyNative for FakeWinptyNative {
    fn start_process(
        &self,
        _file: &str,
        _command_line: &str,
        _env: &[String],
        _cwd: &str,
        _cols: u16,
        _rows: u16,
        _debug: bool,
    ) -> Result<WinptyStart> {
        Ok(WinptyStart {
            pid: 4000,
            inner_pid: 4001,
            inner_pid_handle: 77,
            fd: -1,
            pty_id: 5,
            conin: self.sink.writer(),
            conout: self.output.reader(),
        })
    }

    fn resize(&self, pid: i32, cols: u16, rows: u16) -> Result<()> {
        self.resizes.lock().unwrap().push((pid, cols, rows));
        Ok(())
    }

    fn kill(&self, pid: i32, inner_pid_handle: isize) -> Result<()> {
        self.kills.lock().unwrap().push((pid, inner_pid_handle));
        Ok(())
    }

    fn process_list(&self, _pid: i32) -> Vec<i32> {
        self.process_list.lock().unwrap().clone()
    }

    fn exit_code(&self, _inner_pid_handle: isize) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    fn terminate_process(&self, pid: i32) -> bool {
        self.terminated.lock().unwrap().push(pid);
        true
    }
}

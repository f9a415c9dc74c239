//! The duplex byte channel bound to a native pty endpoint.
//!
//! A `PtyChannel` owns one direction-pair of a session: a reader endpoint
//! drained by a dedicated thread that publishes `data` events, and an
//! optional writer endpoint. Either side may be absent (Windows binds conin
//! write-only and conout read-only). The reader thread honours a
//! pause/resume gate, decodes on UTF-8 boundaries when an encoding is set,
//! and applies the benign-error policy the owning agent configured:
//! EAGAIN-class errors are transient and swallowed, and on a POSIX pty an
//! EIO after the last process exits is the normal close signature.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, error};

use crate::core::notify::{CloseEvent, Notifier, Subscription};

const READ_BUFFER_SIZE: usize = 8192;

/// How the reader loop treats errors from the native endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorPolicy {
    /// Treat errno 5 (EIO) as end-of-stream rather than a failure; on a
    /// POSIX pty master it means the last slave-side process is gone.
    pub eio_is_close: bool,
}

impl ErrorPolicy {
    pub fn posix() -> Self {
        Self { eio_is_close: true }
    }
}

struct PauseGate {
    paused: Mutex<bool>,
    unpaused: Condvar,
}

struct ChannelShared {
    data: Notifier<Vec<u8>>,
    error: Notifier<io::Error>,
    close: CloseEvent,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    gate: PauseGate,
    destroyed: AtomicBool,
    readable: AtomicBool,
    writable: AtomicBool,
    utf8: AtomicBool,
    policy: ErrorPolicy,
}

/// One bound I/O stream of a session. Cheap to clone; all clones address
/// the same underlying endpoint.
#[derive(Clone)]
pub struct PtyChannel {
    shared: Arc<ChannelShared>,
}

impl PtyChannel {
    /// Bind a channel over native endpoints. A `reader` starts the reader
    /// thread immediately; its absence makes the channel write-only.
    pub fn new(
        reader: Option<Box<dyn Read + Send>>,
        writer: Option<Box<dyn Write + Send>>,
        policy: ErrorPolicy,
    ) -> Self {
        let shared = Arc::new(ChannelShared {
            data: Notifier::new(),
            error: Notifier::new(),
            close: CloseEvent::new(),
            writable: AtomicBool::new(writer.is_some()),
            writer: Mutex::new(writer),
            gate: PauseGate {
                paused: Mutex::new(false),
                unpaused: Condvar::new(),
            },
            destroyed: AtomicBool::new(false),
            readable: AtomicBool::new(reader.is_some()),
            utf8: AtomicBool::new(false),
            policy,
        });

        if let Some(reader) = reader {
            let loop_shared = shared.clone();
            thread::spawn(move || reader_loop(reader, loop_shared));
        }

        Self { shared }
    }

    /// Write bytes to the native endpoint. A no-op once the channel is no
    /// longer writable.
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        if !self.shared.writable.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.shared.writer.lock().unwrap();
        match writer.as_mut() {
            Some(writer) => {
                writer.write_all(data)?;
                writer.flush()
            }
            None => Ok(()),
        }
    }

    /// Close the write side, leaving reads running until end-of-stream.
    pub fn end(&self) {
        self.shared.writable.store(false, Ordering::SeqCst);
        self.shared.writer.lock().unwrap().take();
    }

    /// Stop the reader thread from delivering further data.
    pub fn pause(&self) {
        *self.shared.gate.paused.lock().unwrap() = true;
    }

    /// Resume data delivery.
    pub fn resume(&self) {
        let mut paused = self.shared.gate.paused.lock().unwrap();
        *paused = false;
        self.shared.gate.unpaused.notify_all();
    }

    /// Align data events to UTF-8 character boundaries (`true`) or deliver
    /// raw bytes as they arrive (`false`).
    pub fn set_utf8(&self, utf8: bool) {
        self.shared.utf8.store(utf8, Ordering::SeqCst);
    }

    /// Tear the channel down. Emits `close` exactly once; later calls are
    /// no-ops.
    pub fn destroy(&self) {
        self.shared.destroyed.store(true, Ordering::SeqCst);
        self.end();
        // Wake a paused reader so its thread can exit.
        self.resume();
        self.shared.readable.store(false, Ordering::SeqCst);
        self.shared.close.emit();
    }

    /// Flip the channel to neither readable nor writable without emitting
    /// `close`; the ConPTY flush path uses this before destroying conout.
    pub fn shut_io(&self) {
        self.shared.readable.store(false, Ordering::SeqCst);
        self.shared.writable.store(false, Ordering::SeqCst);
    }

    pub fn on_data(&self, listener: impl FnMut(&Vec<u8>) + Send + 'static) -> Subscription {
        self.shared.data.subscribe(listener)
    }

    pub fn on_error(&self, listener: impl FnMut(&io::Error) + Send + 'static) -> Subscription {
        self.shared.error.subscribe(listener)
    }

    /// One-shot close listener; runs immediately when already closed.
    pub fn once_close(&self, listener: impl FnOnce() + Send + 'static) -> Subscription {
        self.shared.close.subscribe(listener)
    }

    pub fn error_listener_count(&self) -> usize {
        self.shared.error.listener_count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close.has_emitted()
    }

    pub fn readable(&self) -> bool {
        self.shared.readable.load(Ordering::SeqCst)
    }

    pub fn writable(&self) -> bool {
        self.shared.writable.load(Ordering::SeqCst)
    }
}

fn reader_loop(mut reader: Box<dyn Read + Send>, shared: Arc<ChannelShared>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut pending: VecDeque<u8> = VecDeque::new();

    loop {
        if shared.destroyed.load(Ordering::SeqCst) {
            return;
        }

        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend(&buf[..n]);
                // The gate sits between read and delivery: a paused channel
                // parks here holding at most one chunk, and OS backpressure
                // does the rest.
                {
                    let mut paused = shared.gate.paused.lock().unwrap();
                    while *paused && !shared.destroyed.load(Ordering::SeqCst) {
                        paused = shared.gate.unpaused.wait(paused).unwrap();
                    }
                }
                if shared.destroyed.load(Ordering::SeqCst) {
                    return;
                }
                deliver(&shared, &mut pending);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // EAGAIN-class: expected transiently at stream start.
                thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if shared.policy.eio_is_close && e.raw_os_error() == Some(5) => {
                // errno 5 (EIO): the pty's last process exited.
                debug!("pty channel closed by EIO");
                break;
            }
            Err(e) => {
                if shared.error.listener_count() == 0 {
                    error!("unexpected pty channel error: {e}");
                } else {
                    shared.error.fire(&e);
                }
                break;
            }
        }
    }

    // Hand over whatever an encoding boundary held back.
    if !pending.is_empty() {
        let tail: Vec<u8> = pending.drain(..).collect();
        shared.data.fire(&tail);
    }

    if !shared.destroyed.load(Ordering::SeqCst) {
        shared.readable.store(false, Ordering::SeqCst);
        shared.writable.store(false, Ordering::SeqCst);
        shared.close.emit();
    }
}

fn deliver(shared: &ChannelShared, pending: &mut VecDeque<u8>) {
    let take = if shared.utf8.load(Ordering::SeqCst) {
        let bytes = pending.make_contiguous();
        complete_utf8_len(bytes)
    } else {
        pending.len()
    };
    if take == 0 {
        return;
    }
    let chunk: Vec<u8> = pending.drain(..take).collect();
    shared.data.fire(&chunk);
}

/// Length of the longest prefix that ends on a UTF-8 character boundary.
///
/// At most the last three bytes can belong to an incomplete sequence, so
/// the scan walks back from the end until it sees an ASCII byte or a lead
/// byte whose sequence either fits or must be held back.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    let mut i = len;
    while i > 0 && len - i < 4 {
        i -= 1;
        let b = bytes[i];
        if b & 0x80 == 0 {
            return len;
        }
        if b & 0xC0 == 0xC0 {
            let need = if b & 0xE0 == 0xC0 {
                2
            } else if b & 0xF0 == 0xE0 {
                3
            } else if b & 0xF8 == 0xF0 {
                4
            } else {
                1
            };
            return if len - i < need { i } else { len };
        }
        // Continuation byte; keep walking.
    }
    len
}

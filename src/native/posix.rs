//! Default POSIX backend: openpty + fork + execvp via `nix`/`libc`.
//!
//! The child half of `fork` is kept to async-signal-safe territory: every
//! string it needs is converted to a `CString` before the fork, and error
//! paths call `_exit` so a failed child can never return into the parent's
//! code. A detached waiter thread reaps the child and fires the exit
//! callback.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::thread;

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::debug;

use crate::error::{PtyError, Result};
use crate::native::{ExitCallback, ForkHandle, ForkRequest, OpenHandle, UnixNative};

pub(crate) struct PosixNative;

impl PosixNative {
    pub fn new() -> Self {
        Self
    }
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn to_cstring(field: &'static str, value: &str) -> Result<CString> {
    CString::new(value.as_bytes()).map_err(|_| PtyError::InvalidOption {
        field,
        expected: "a string without NUL bytes",
        actual: format!("{value:?}"),
    })
}

/// Split a master fd into a reading `File` (which owns the fd) and an
/// independent writing dup.
fn split_master(master: OwnedFd) -> io::Result<(File, File, i32)> {
    let raw = master.as_raw_fd();
    let dup = unsafe { libc::dup(raw) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    let writer = unsafe { File::from_raw_fd(dup) };
    let reader = unsafe { File::from_raw_fd(master.into_raw_fd()) };
    Ok((reader, writer, raw))
}

fn slave_name(slave: &OwnedFd) -> String {
    nix::unistd::ttyname(slave)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Flag UTF-8 input processing on the pty line discipline.
fn set_iutf8<Fd: std::os::fd::AsFd + Copy>(fd: Fd) {
    use nix::sys::termios::{tcgetattr, tcsetattr, InputFlags, SetArg};
    if let Ok(mut termios) = tcgetattr(fd) {
        termios.input_flags |= InputFlags::IUTF8;
        let _ = tcsetattr(fd, SetArg::TCSANOW, &termios);
    }
}

impl UnixNative for PosixNative {
    fn fork(&self, request: ForkRequest, on_exit: ExitCallback) -> Result<ForkHandle> {
        // Everything the child touches is prepared before the fork.
        let file_c = to_cstring("file", &request.file)?;
        let argv_c: Vec<CString> = request
            .argv
            .iter()
            .map(|arg| to_cstring("args", arg))
            .collect::<Result<_>>()?;
        let env_c: Vec<CString> = request
            .env
            .iter()
            .map(|pair| to_cstring("env", pair))
            .collect::<Result<_>>()?;
        let cwd_c = to_cstring("cwd", &request.cwd)?;

        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv_c.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut env_ptrs: Vec<*const libc::c_char> = env_c.iter().map(|e| e.as_ptr()).collect();
        env_ptrs.push(std::ptr::null());

        let pty = openpty(Some(&winsize(request.cols, request.rows)), None)
            .map_err(|e| PtyError::Spawn {
                file: request.file.clone(),
                source: io::Error::from(e),
            })?;
        if request.utf8 {
            set_iutf8(&pty.master);
        }
        let pty_name = slave_name(&pty.slave);
        let master_raw = pty.master.as_raw_fd();
        let slave_raw = pty.slave.as_raw_fd();

        // SAFETY: the child performs only async-signal-safe calls (setsid,
        // ioctl, dup2, close, chdir, setgid/setuid, execvp) on
        // pre-allocated data, and `_exit`s on every failure path.
        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => unsafe {
                libc::close(master_raw);
                if libc::setsid() < 0 {
                    libc::_exit(1);
                }
                if libc::ioctl(slave_raw, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
                    // Some systems grant the controlling tty via setsid
                    // alone; keep going.
                }
                if libc::dup2(slave_raw, libc::STDIN_FILENO) < 0
                    || libc::dup2(slave_raw, libc::STDOUT_FILENO) < 0
                    || libc::dup2(slave_raw, libc::STDERR_FILENO) < 0
                {
                    libc::_exit(1);
                }
                if slave_raw > libc::STDERR_FILENO {
                    libc::close(slave_raw);
                }
                if libc::chdir(cwd_c.as_ptr()) < 0 {
                    libc::_exit(1);
                }
                if let Some(gid) = request.gid {
                    if libc::setgid(gid) < 0 {
                        libc::_exit(1);
                    }
                }
                if let Some(uid) = request.uid {
                    if libc::setuid(uid) < 0 {
                        libc::_exit(1);
                    }
                }
                environ_assign(env_ptrs.as_ptr());
                libc::execvp(file_c.as_ptr(), argv_ptrs.as_ptr());
                // 127: command not found convention.
                libc::_exit(127)
            },
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => {
                return Err(PtyError::Spawn {
                    file: request.file.clone(),
                    source: io::Error::from(e),
                })
            }
        };

        drop(pty.slave);
        let (reader, writer, fd) = split_master(pty.master).map_err(|source| PtyError::Spawn {
            file: request.file.clone(),
            source,
        })?;

        // Reap the child and report how it died.
        thread::spawn(move || {
            let record = wait_for_exit(child);
            on_exit(record.0, record.1);
        });

        Ok(ForkHandle {
            pid: child.as_raw(),
            fd,
            pty: pty_name,
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    fn open(&self, cols: u16, rows: u16) -> Result<OpenHandle> {
        let pty = openpty(Some(&winsize(cols, rows)), None).map_err(|e| {
            PtyError::Io(io::Error::from(e))
        })?;
        let pty_name = slave_name(&pty.slave);
        let (master_reader, master_writer, master_fd) =
            split_master(pty.master).map_err(PtyError::Io)?;
        let (slave_reader, slave_writer, slave_fd) =
            split_master(pty.slave).map_err(PtyError::Io)?;
        Ok(OpenHandle {
            master_fd,
            slave_fd,
            pty: pty_name,
            master_reader: Box::new(master_reader),
            master_writer: Box::new(master_writer),
            slave_reader: Box::new(slave_reader),
            slave_writer: Box::new(slave_writer),
        })
    }

    fn resize(&self, fd: i32, cols: u16, rows: u16) -> Result<()> {
        let size = winsize(cols, rows);
        // SAFETY: TIOCSWINSZ reads a winsize struct from our stack.
        let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &size) };
        if rc < 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn process_name(&self, fd: i32) -> Option<String> {
        #[cfg(target_os = "linux")]
        {
            let pgrp = unsafe { libc::tcgetpgrp(fd) };
            if pgrp <= 0 {
                return None;
            }
            let cmdline = std::fs::read(format!("/proc/{pgrp}/cmdline")).ok()?;
            let first = cmdline.split(|b| *b == 0).next()?;
            if first.is_empty() {
                return None;
            }
            Some(String::from_utf8_lossy(first).into_owned())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = fd;
            None
        }
    }

    fn kill(&self, pid: i32, signal: i32) -> Result<()> {
        let signal = Signal::try_from(signal)
            .map_err(|e| PtyError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        kill(Pid::from_raw(pid), signal).map_err(|e| PtyError::Io(io::Error::from(e)))
    }
}

/// Point the child's `environ` at the prepared pair list.
///
/// # Safety contract
/// Called only between `fork` and `execvp`, where the pointers outlive the
/// child address space.
unsafe fn environ_assign(env: *const *const libc::c_char) {
    extern "C" {
        static mut environ: *const *const libc::c_char;
    }
    environ = env;
}

fn wait_for_exit(pid: Pid) -> (i32, Option<i32>) {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return (code, None),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                debug!(pid = pid.as_raw(), ?signal, "process killed by signal");
                return (0, Some(signal as i32));
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                debug!(pid = pid.as_raw(), "waitpid failed: {e}");
                return (0, None);
            }
        }
    }
}

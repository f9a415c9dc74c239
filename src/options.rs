//! Session options and value validation.
//!
//! `PtyOptions` carries everything a caller can configure about a session:
//! terminal name, geometry, working directory, environment, output encoding,
//! POSIX identity, flow-control sentinels and the Windows backend switches.
//! Rust's types already rule out the wrong-primitive cases, so validation
//! concentrates on the value constraints that remain: NUL bytes cannot cross
//! the exec boundary, env keys cannot contain `=`, geometry cannot be zero
//! and the encoding must name a supported codec.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PtyError, Result};

/// Default terminal width in columns.
pub const DEFAULT_COLS: u16 = 80;
/// Default terminal height in rows.
pub const DEFAULT_ROWS: u16 = 24;

/// Default flow-control pause sentinel (XOFF, DC3).
pub const FLOW_CONTROL_PAUSE: &str = "\x13";
/// Default flow-control resume sentinel (XON, DC1).
pub const FLOW_CONTROL_RESUME: &str = "\x11";

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyOptions {
    /// Reported terminal type; exported as `TERM` to the child on POSIX.
    pub name: Option<String>,
    /// Initial width in columns.
    pub cols: u16,
    /// Initial height in rows.
    pub rows: u16,
    /// Working directory for the spawned process. Defaults to the current
    /// directory of the calling process.
    pub cwd: Option<PathBuf>,
    /// Environment for the spawned process. `None` inherits the parent
    /// environment.
    pub env: Option<HashMap<String, String>>,
    /// Text decoding applied to output. POSIX only; ignored with a warning
    /// on Windows. The only supported codec is `"utf8"`.
    pub encoding: Option<String>,
    /// POSIX user id for the child.
    pub uid: Option<u32>,
    /// POSIX group id for the child.
    pub gid: Option<u32>,
    /// Enables in-band pause/resume interception on `write`.
    pub handle_flow_control: bool,
    /// Payload that pauses output delivery when written verbatim.
    pub flow_control_pause: String,
    /// Payload that resumes output delivery when written verbatim.
    pub flow_control_resume: String,
    /// `Some(false)` forbids the ConPTY backend; `Some(true)` forces it;
    /// `None` selects by OS build number.
    pub use_conpty: Option<bool>,
    /// ConPTY cursor-inheritance flag.
    pub conpty_inherit_cursor: bool,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            name: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            cwd: None,
            env: None,
            encoding: None,
            uid: None,
            gid: None,
            handle_flow_control: false,
            flow_control_pause: FLOW_CONTROL_PAUSE.to_string(),
            flow_control_resume: FLOW_CONTROL_RESUME.to_string(),
            use_conpty: None,
            conpty_inherit_cursor: false,
        }
    }
}

impl PtyOptions {
    /// Validate option values. Returns the first violation, naming the
    /// offending field.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            check_no_nul("name", name)?;
        }
        if self.cols == 0 || self.rows == 0 {
            return Err(PtyError::InvalidGeometry {
                cols: self.cols,
                rows: self.rows,
            });
        }
        if let Some(cwd) = &self.cwd {
            let text = cwd.to_string_lossy();
            check_no_nul("cwd", &text)?;
        }
        if let Some(env) = &self.env {
            for (key, value) in env {
                check_no_nul("env", key)?;
                check_no_nul("env", value)?;
                if key.contains('=') {
                    return Err(PtyError::InvalidOption {
                        field: "env",
                        expected: "keys without `=`",
                        actual: format!("key `{key}`"),
                    });
                }
            }
        }
        if let Some(encoding) = &self.encoding {
            if !encoding.eq_ignore_ascii_case("utf8") && !encoding.eq_ignore_ascii_case("utf-8") {
                return Err(PtyError::InvalidOption {
                    field: "encoding",
                    expected: "\"utf8\" or no encoding",
                    actual: format!("{encoding:?}"),
                });
            }
        }
        Ok(())
    }
}

/// Program arguments: either a list escaped per-platform by the library, or
/// a single pre-escaped Win32 command line handed through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandArgs {
    /// Individual arguments, quoted by the library where required.
    Args(Vec<String>),
    /// A pre-escaped command line. Windows only.
    CommandLine(String),
}

impl Default for CommandArgs {
    fn default() -> Self {
        CommandArgs::Args(Vec::new())
    }
}

impl From<Vec<String>> for CommandArgs {
    fn from(args: Vec<String>) -> Self {
        CommandArgs::Args(args)
    }
}

impl From<&[&str]> for CommandArgs {
    fn from(args: &[&str]) -> Self {
        CommandArgs::Args(args.iter().map(|a| a.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for CommandArgs {
    fn from(args: [&str; N]) -> Self {
        CommandArgs::Args(args.iter().map(|a| a.to_string()).collect())
    }
}

/// Validate every element of the argument list individually.
pub(crate) fn validate_args(args: &CommandArgs) -> Result<()> {
    match args {
        CommandArgs::Args(list) => {
            for arg in list {
                check_no_nul("args", arg)?;
            }
            Ok(())
        }
        CommandArgs::CommandLine(line) => check_no_nul("args", line),
    }
}

/// Validate the program path.
pub(crate) fn validate_file(file: &str) -> Result<()> {
    if file.is_empty() {
        return Err(PtyError::InvalidOption {
            field: "file",
            expected: "a non-empty program path",
            actual: "an empty string".to_string(),
        });
    }
    check_no_nul("file", file)
}

fn check_no_nul(field: &'static str, value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(PtyError::InvalidOption {
            field,
            expected: "a string without NUL bytes",
            actual: format!("{value:?}"),
        });
    }
    Ok(())
}

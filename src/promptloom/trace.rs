//! Append-only session trace streams.
//!
//! A [`Trace`] is a human-readable, newline-delimited log with 80-`#`
//! separator lines. Each session owns two of them: a *compilation* trace
//! recording synthesis outcomes (prompts, responses, skills, invocation
//! snippets) and an *execution* trace recording runtime progress. Writes are
//! flushed immediately so that a crashed session still leaves usable traces
//! behind.
//!
//! The handle is cheaply cloneable (`Arc` inside) so that the harness, the
//! traced LM clients, and the streaming-routine producer can all append to
//! the same stream. An optional hook receives every entry as it is written,
//! which is how external front ends relay trace lines live.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::promptloom::error::HarnessError;

/// Number of `#` characters in a separator line.
const SEPARATOR_WIDTH: usize = 80;

/// Callback invoked with every entry appended to a [`Trace`].
pub type TraceHook = Box<dyn Fn(&str) + Send + Sync>;

struct TraceInner {
    file: Option<std::fs::File>,
    copy_into_stdout: bool,
    hook: Option<TraceHook>,
}

/// A cloneable, append-only, flush-on-write text sink.
#[derive(Clone)]
pub struct Trace {
    inner: Arc<Mutex<TraceInner>>,
}

impl Trace {
    /// A trace that discards everything. Useful as a default and in tests.
    pub fn disabled() -> Self {
        Self::build(None, false)
    }

    /// A trace appending to the given file, creating parent directories as
    /// needed.
    pub fn to_file<P: AsRef<Path>>(path: P) -> Result<Self, HarnessError> {
        Ok(Self::build(Some(Self::open_file(path.as_ref())?), false))
    }

    /// A trace writing to standard output only.
    pub fn stdout() -> Self {
        Self::build(None, true)
    }

    /// A trace writing to both the given file and standard output.
    pub fn file_and_stdout<P: AsRef<Path>>(path: P) -> Result<Self, HarnessError> {
        Ok(Self::build(Some(Self::open_file(path.as_ref())?), true))
    }

    fn open_file(path: &Path) -> Result<std::fs::File, HarnessError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(file)
    }

    fn build(file: Option<std::fs::File>, copy_into_stdout: bool) -> Self {
        Trace {
            inner: Arc::new(Mutex::new(TraceInner {
                file,
                copy_into_stdout,
                hook: None,
            })),
        }
    }

    /// Register a hook receiving every appended entry.
    pub fn set_hook(&self, hook: TraceHook) {
        self.inner.lock().unwrap().hook = Some(hook);
    }

    /// Append one entry, flushing the underlying file immediately.
    ///
    /// Write failures are logged and swallowed: a broken trace sink must not
    /// take the session down with it.
    pub fn write(&self, entry: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.as_mut() {
            if let Err(err) = writeln!(file, "{}", entry).and_then(|_| file.flush()) {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("Trace::write: dropping entry after i/o error: {}", err);
                }
            }
        }
        if inner.copy_into_stdout {
            println!("{}", entry);
        }
        if let Some(hook) = inner.hook.as_ref() {
            hook(entry);
        }
    }

    /// Append a separator line of 80 `#` characters.
    pub fn write_separator(&self) {
        self.write(&"#".repeat(SEPARATOR_WIDTH));
    }

    /// Whether this trace forwards entries anywhere at all.
    pub fn is_enabled(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.file.is_some() || inner.copy_into_stdout || inner.hook.is_some()
    }
}

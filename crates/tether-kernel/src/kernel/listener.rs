//! Step output stream.
//!
//! [TaskListener] is the user-facing log of a step. Diagnostics for operators go through
//! the `log` facade instead.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Line-oriented sink for the human-readable output of a step.
pub struct TaskListener {
    out: Mutex<Box<dyn Write + Send>>,
}

impl TaskListener {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    /// Listener that discards everything.
    pub fn null() -> Self {
        Self::new(io::sink())
    }

    /// Listener backed by an in-memory buffer; the returned [MemoryLog] reads it back.
    pub fn in_memory() -> (Self, MemoryLog) {
        let log = MemoryLog::default();
        (Self::new(log.clone()), log)
    }

    /// Writes one line. Output errors are reported through `log` and otherwise ignored:
    /// a broken step log must not fail the step.
    pub fn println(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            log::warn!("failed to write step output line {:?}: {}", line, e);
        }
    }
}

impl fmt::Debug for TaskListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskListener").finish_non_exhaustive()
    }
}

/// Shared in-memory buffer usable as a [TaskListener] sink.
#[derive(Clone, Debug, Default)]
pub struct MemoryLog {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemoryLog {
    pub fn contents(&self) -> String {
        let buf = match self.buf.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for MemoryLog {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory log lock poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

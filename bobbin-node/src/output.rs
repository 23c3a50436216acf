//! The append-only output log.
//!
//! One event per line: `b <n>` on broadcast, `d <sender> <n>` on delivery,
//! or a decided value set. Buffered; flushed on shutdown. Write failures
//! on the hot path are logged and ignored - the only user-visible
//! guarantee is the file contents after a clean flush.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use bobbin_core::host::HostId;

pub struct OutputLog<W = BufWriter<File>> {
    inner: Mutex<W>,
}

impl OutputLog {
    /// Create (truncating) the output file.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the file cannot be created. Fatal
    /// at startup.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(OutputLog::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> OutputLog<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// `b <n>` - the application handed message `n` to the stack.
    pub fn record_broadcast(&self, n: u64) {
        self.write_line(format_args!("b {n}"));
    }

    /// `d <sender> <text>` - the stack delivered `text` from `sender`.
    pub fn record_delivery(&self, sender: HostId, text: &str) {
        self.write_line(format_args!("d {sender} {text}"));
    }

    /// One decided round: the set elements separated by single spaces.
    pub fn record_decision(&self, values: &BTreeSet<i32>) {
        let mut line = String::new();
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            let _ = write!(line, "{value}");
        }
        self.write_line(format_args!("{line}"));
    }

    /// # Errors
    ///
    /// Returns the underlying error if flushing fails.
    pub fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }

    fn write_line(&self, line: std::fmt::Arguments<'_>) {
        if let Err(e) = writeln!(self.lock(), "{line}") {
            warn!(error = %e, "output write failed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, W> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

//! Log output plumbing: a reopenable file writer for SIGUSR1-driven
//! rotation, with an optional per-worker line prefix.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

enum Sink {
    Stderr,
    File(File),
}

struct Inner {
    path: Option<PathBuf>,
    sink: Mutex<Sink>,
    prefix: Option<String>,
}

/// Cheaply cloneable writer handle usable as a `tracing` `MakeWriter`.
#[derive(Clone)]
pub struct LogWriter {
    inner: Arc<Inner>,
}

impl LogWriter {
    pub fn stderr() -> Self {
        LogWriter {
            inner: Arc::new(Inner {
                path: None,
                sink: Mutex::new(Sink::Stderr),
                prefix: None,
            }),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = open_log(&path)?;
        Ok(LogWriter {
            inner: Arc::new(Inner {
                path: Some(path),
                sink: Mutex::new(Sink::File(file)),
                prefix: None,
            }),
        })
    }

    /// Stamp every write with `[worker N] ` so interleaved worker output
    /// stays attributable.
    pub fn with_worker_prefix(self, worker_id: u32) -> Self {
        LogWriter {
            inner: Arc::new(Inner {
                path: self.inner.path.clone(),
                sink: Mutex::new(match &*self.inner.sink.lock().expect("log sink lock") {
                    Sink::Stderr => Sink::Stderr,
                    Sink::File(f) => match f.try_clone() {
                        Ok(f) => Sink::File(f),
                        Err(_) => Sink::Stderr,
                    },
                }),
                prefix: Some(format!("[worker {worker_id}] ")),
            }),
        }
    }

    pub fn is_file(&self) -> bool {
        self.inner.path.is_some()
    }

    /// Close and reopen the log file path (no-op for stderr).
    pub fn reopen(&self) -> io::Result<()> {
        let Some(path) = self.inner.path.as_ref() else {
            return Ok(());
        };
        let file = open_log(path)?;
        *self.inner.sink.lock().expect("log sink lock") = Sink::File(file);
        Ok(())
    }
}

fn open_log(path: &PathBuf) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sink = self.inner.sink.lock().expect("log sink lock");
        if let Some(prefix) = self.inner.prefix.as_deref() {
            match &mut *sink {
                Sink::Stderr => io::stderr().write_all(prefix.as_bytes())?,
                Sink::File(f) => f.write_all(prefix.as_bytes())?,
            }
        }
        match &mut *sink {
            Sink::Stderr => {
                io::stderr().write_all(buf)?;
                Ok(buf.len())
            }
            Sink::File(f) => {
                f.write_all(buf)?;
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.inner.sink.lock().expect("log sink lock") {
            Sink::Stderr => io::stderr().flush(),
            Sink::File(f) => f.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

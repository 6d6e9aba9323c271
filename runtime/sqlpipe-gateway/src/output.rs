//! Output multiplexer: many producers, one writer thread, two streams.

use std::fmt;
use std::io::{self, BufWriter, Write};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::protocol::error_line;

const BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Normal,
    Error,
    Diagnostic,
}

impl Tag {
    pub fn prefix(self) -> &'static str {
        match self {
            Tag::Normal => "o:",
            Tag::Error => "e:",
            Tag::Diagnostic => "i:",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub tag: Tag,
    pub payload: String,
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.tag.prefix(), self.payload)
    }
}

/// Producer side of the output queue. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct OutputSink {
    tx: Sender<OutputLine>,
}

impl OutputSink {
    pub fn normal(&self, payload: impl Into<String>) {
        self.push(Tag::Normal, payload.into());
    }

    pub fn error(&self, payload: impl Into<String>) {
        self.push(Tag::Error, payload.into());
    }

    pub fn diagnostic(&self, payload: impl Into<String>) {
        self.push(Tag::Diagnostic, payload.into());
    }

    fn push(&self, tag: Tag, payload: String) {
        if self.tx.send(OutputLine { tag, payload }).is_err() {
            tracing::debug!("output queue closed, dropping line");
        }
    }
}

pub fn channel() -> (OutputSink, Receiver<OutputLine>) {
    let (tx, rx) = unbounded();
    (OutputSink { tx }, rx)
}

/// Single consumer writing queued lines to the normal and error streams.
///
/// Writes are buffered; a stream is flushed only once the queue has been
/// observed empty, so bursts coalesce into few writes.
pub struct Multiplexer<O: Write, E: Write> {
    out: BufWriter<O>,
    err: BufWriter<E>,
    out_dirty: bool,
    err_dirty: bool,
}

impl<O: Write, E: Write> Multiplexer<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self {
            out: BufWriter::with_capacity(BUFFER_SIZE, out),
            err: BufWriter::with_capacity(BUFFER_SIZE, err),
            out_dirty: false,
            err_dirty: false,
        }
    }

    pub fn write_line(&mut self, line: &OutputLine) -> io::Result<()> {
        match line.tag {
            Tag::Normal => {
                writeln!(self.out, "{}", line.payload)?;
                self.out_dirty = true;
            }
            Tag::Error | Tag::Diagnostic => {
                writeln!(self.err, "{}", line.payload)?;
                self.err_dirty = true;
            }
        }
        Ok(())
    }

    /// Flush policy: dirty streams are flushed once the queue is drained.
    pub fn settle(&mut self, queue_empty: bool) -> io::Result<()> {
        if !queue_empty {
            return Ok(());
        }
        if self.err_dirty {
            self.err.flush()?;
            self.err_dirty = false;
        }
        if self.out_dirty {
            self.out.flush()?;
            self.out_dirty = false;
        }
        Ok(())
    }

    /// Drains `rx` until every sender is gone or a write fails.
    pub fn run(mut self, rx: Receiver<OutputLine>) {
        let result = self.pump(&rx);
        match result {
            Ok(written) => tracing::info!(lines = written, "output loop exiting"),
            Err(err) => {
                tracing::error!(error = %err, "output loop failed");
                let notice = error_line(None, None, &format!("exiting output loop: {err}"));
                let _ = writeln!(self.err, "\n{notice}");
                let _ = self.err.flush();
            }
        }
    }

    fn pump(&mut self, rx: &Receiver<OutputLine>) -> io::Result<u64> {
        let mut written = 0u64;
        while let Ok(line) = rx.recv() {
            self.write_line(&line)?;
            written += 1;
            self.settle(rx.is_empty())?;
        }
        self.settle(true)?;
        Ok(written)
    }
}

#[cfg(test)]
impl<O: Write, E: Write> Multiplexer<O, E> {
    fn is_dirty(&self) -> bool {
        self.out_dirty || self.err_dirty
    }

    fn get_ref(&self) -> (&O, &E) {
        (self.out.get_ref(), self.err.get_ref())
    }
}

/// Starts the writer thread bound to the process's stdout and stderr.
pub fn spawn_stdio(rx: Receiver<OutputLine>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("sqlpipe-output".to_string())
        .spawn(move || Multiplexer::new(io::stdout(), io::stderr()).run(rx))
}

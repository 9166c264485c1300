use std::{
    io::Write,
    sync::{Arc, Mutex},
};

/// A sink over the process's stdout/stderr. Tasks never write to the
/// underlying writers directly; they go through an `OutputClient` so lines
/// from concurrent tasks cannot interleave mid-line.
pub struct OutputSink<W> {
    writers: Arc<Mutex<SinkWriters<W>>>,
}

struct SinkWriters<W> {
    out: W,
    err: W,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputClientBehavior {
    /// Lines are forwarded to the sink as they arrive.
    Passthrough,
    /// Lines are held and written contiguously when the client finishes.
    Grouped,
    /// Lines are held and written only if the client finishes with an error.
    InMemoryBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    Stdout,
    Stderr,
}

type SinkBytes = (Destination, Vec<u8>);

/// Per-task handle onto the sink.
pub struct OutputClient<W> {
    behavior: OutputClientBehavior,
    // Populated for Grouped and InMemoryBuffer
    buffer: Option<Mutex<Vec<SinkBytes>>>,
    writers: Arc<Mutex<SinkWriters<W>>>,
}

/// Line-buffered writer handed to whatever is producing task output.
pub struct OutputWriter<'a, W> {
    client: &'a OutputClient<W>,
    destination: Destination,
    buffer: Vec<u8>,
}

impl<W: Write> OutputSink<W> {
    pub fn new(out: W, err: W) -> Self {
        Self {
            writers: Arc::new(Mutex::new(SinkWriters { out, err })),
        }
    }

    pub fn logger(&self, behavior: OutputClientBehavior) -> OutputClient<W> {
        let buffer = match behavior {
            OutputClientBehavior::Passthrough => None,
            OutputClientBehavior::Grouped | OutputClientBehavior::InMemoryBuffer => {
                Some(Mutex::new(Vec::new()))
            }
        };
        OutputClient {
            behavior,
            buffer,
            writers: self.writers.clone(),
        }
    }
}

impl<W: Write> OutputClient<W> {
    pub fn stdout(&self) -> OutputWriter<'_, W> {
        OutputWriter {
            client: self,
            destination: Destination::Stdout,
            buffer: Vec::new(),
        }
    }

    pub fn stderr(&self) -> OutputWriter<'_, W> {
        OutputWriter {
            client: self,
            destination: Destination::Stderr,
            buffer: Vec::new(),
        }
    }

    /// Flushes any held lines according to the client's behavior and returns
    /// the captured bytes, if this client was capturing.
    pub fn finish(self, use_error: bool) -> std::io::Result<Option<Vec<u8>>> {
        let Self {
            behavior,
            buffer,
            writers,
        } = self;
        let Some(buffer) = buffer else {
            // Passthrough clients have already written everything.
            return Ok(None);
        };
        let buffer = buffer.into_inner().expect("output client mutex poisoned");

        let should_write = match behavior {
            OutputClientBehavior::Passthrough => unreachable!("passthrough clients don't buffer"),
            OutputClientBehavior::Grouped => true,
            OutputClientBehavior::InMemoryBuffer => use_error,
        };
        if should_write {
            let mut writers = writers.lock().expect("output sink mutex poisoned");
            for (destination, bytes) in &buffer {
                match destination {
                    Destination::Stdout => writers.out.write_all(bytes)?,
                    Destination::Stderr => writers.err.write_all(bytes)?,
                }
            }
        }

        let mut logs = Vec::new();
        for (_, bytes) in buffer {
            logs.extend(bytes);
        }
        Ok(Some(logs))
    }

    fn handle_bytes(&self, destination: Destination, bytes: Vec<u8>) -> std::io::Result<()> {
        if let Some(buffer) = &self.buffer {
            buffer
                .lock()
                .expect("output client mutex poisoned")
                .push((destination, bytes));
            Ok(())
        } else {
            let mut writers = self.writers.lock().expect("output sink mutex poisoned");
            match destination {
                Destination::Stdout => writers.out.write_all(&bytes),
                Destination::Stderr => writers.err.write_all(&bytes),
            }
        }
    }
}

impl<W: Write> Write for OutputWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for byte in buf {
            self.buffer.push(*byte);
            if *byte == b'\n' {
                self.client
                    .handle_bytes(self.destination, std::mem::take(&mut self.buffer))?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            self.client
                .handle_bytes(self.destination, std::mem::take(&mut self.buffer))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_passthrough_writes_immediately() -> std::io::Result<()> {
        let out = SharedBuffer::default();
        let sink = OutputSink::new(out.clone(), SharedBuffer::default());
        let client = sink.logger(OutputClientBehavior::Passthrough);
        let mut writer = client.stdout();
        writeln!(writer, "hello")?;
        assert_eq!(out.0.lock().unwrap().as_slice(), b"hello\n");
        assert!(client.finish(false)?.is_none());
        Ok(())
    }

    #[test]
    fn test_grouped_writes_contiguously() -> std::io::Result<()> {
        let out = SharedBuffer::default();
        let sink = OutputSink::new(out.clone(), SharedBuffer::default());

        let a = sink.logger(OutputClientBehavior::Grouped);
        let b = sink.logger(OutputClientBehavior::Grouped);
        writeln!(a.stdout(), "a one")?;
        writeln!(b.stdout(), "b one")?;
        writeln!(a.stdout(), "a two")?;

        assert!(out.0.lock().unwrap().is_empty());
        let a_logs = a.finish(false)?.unwrap();
        assert_eq!(a_logs, b"a one\na two\n");
        assert_eq!(out.0.lock().unwrap().as_slice(), b"a one\na two\n");
        b.finish(false)?;
        assert_eq!(out.0.lock().unwrap().as_slice(), b"a one\na two\nb one\n");
        Ok(())
    }

    #[test]
    fn test_in_memory_buffer_only_emits_on_error() -> std::io::Result<()> {
        let out = SharedBuffer::default();
        let sink = OutputSink::new(out.clone(), SharedBuffer::default());

        let quiet = sink.logger(OutputClientBehavior::InMemoryBuffer);
        writeln!(quiet.stdout(), "hidden")?;
        let logs = quiet.finish(false)?.unwrap();
        assert_eq!(logs, b"hidden\n");
        assert!(out.0.lock().unwrap().is_empty());

        let loud = sink.logger(OutputClientBehavior::InMemoryBuffer);
        writeln!(loud.stdout(), "shown")?;
        loud.finish(true)?;
        assert_eq!(out.0.lock().unwrap().as_slice(), b"shown\n");
        Ok(())
    }
}

use std::{fmt::Display, io::Write};

use console::StyledObject;

use crate::UI;

/// Writes messages with a fixed, usually colored, prefix per stream. Used for
/// the per-task status lines (cache hits, warnings, errors) as opposed to raw
/// command output, which goes through `PrefixedWriter`.
pub struct PrefixedUI<W> {
    ui: UI,
    output_prefix: Option<StyledObject<String>>,
    warn_prefix: Option<StyledObject<String>>,
    error_prefix: Option<StyledObject<String>>,
    out: W,
    err: W,
}

impl<W: Write> PrefixedUI<W> {
    pub fn new(ui: UI, out: W, err: W) -> Self {
        Self {
            ui,
            out,
            err,
            output_prefix: None,
            warn_prefix: None,
            error_prefix: None,
        }
    }

    pub fn with_output_prefix(mut self, output_prefix: StyledObject<String>) -> Self {
        self.output_prefix = Some(output_prefix);
        self
    }

    pub fn with_warn_prefix(mut self, warn_prefix: StyledObject<String>) -> Self {
        self.warn_prefix = Some(warn_prefix);
        self
    }

    pub fn with_error_prefix(mut self, error_prefix: StyledObject<String>) -> Self {
        self.error_prefix = Some(error_prefix);
        self
    }

    pub fn output(&mut self, message: impl Display) {
        self.write_line(message, Command::Output)
    }

    pub fn warn(&mut self, message: impl Display) {
        self.write_line(message, Command::Warn)
    }

    pub fn error(&mut self, message: impl Display) {
        self.write_line(message, Command::Error)
    }

    fn write_line(&mut self, message: impl Display, command: Command) {
        let prefix = match command {
            Command::Output => &self.output_prefix,
            Command::Warn => &self.warn_prefix,
            Command::Error => &self.error_prefix,
        }
        .as_ref()
        .map(|prefix| self.ui.apply(prefix.clone()))
        .unwrap_or_default();
        let writer = match command {
            Command::Output => &mut self.out,
            Command::Warn | Command::Error => &mut self.err,
        };

        // There's no reasonable way to propagate a failure to write a status
        // line, the sink is stdio.
        if writeln!(writer, "{prefix}{message}").is_err() {
            // Matches the behavior of println! on a broken pipe.
        }
    }

    /// A raw writer that applies the output prefix to each line. Used to
    /// replay cached logs through the same formatting as live output.
    pub fn output_prefixed_writer(&mut self) -> PrefixedWriter<&mut W> {
        PrefixedWriter::new(
            self.ui,
            self.output_prefix.clone().unwrap_or_else(|| {
                console::Style::new().apply_to(String::new())
            }),
            &mut self.out,
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Output,
    Warn,
    Error,
}

/// An `io::Write` adapter that inserts a prefix at the start of every line.
pub struct PrefixedWriter<W> {
    prefix: String,
    writer: W,
    at_line_start: bool,
}

impl<W: Write> PrefixedWriter<W> {
    pub fn new(ui: UI, prefix: StyledObject<String>, writer: W) -> Self {
        Self {
            prefix: ui.apply(prefix),
            writer,
            at_line_start: true,
        }
    }
}

impl<W: Write> Write for PrefixedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for line in buf.split_inclusive(|byte| *byte == b'\n') {
            if self.at_line_start {
                self.writer.write_all(self.prefix.as_bytes())?;
            }
            self.writer.write_all(line)?;
            self.at_line_start = line.ends_with(b"\n");
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

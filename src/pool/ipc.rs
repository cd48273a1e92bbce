//! Buffered line I/O for worker pipes.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Buffered line reader.
pub struct LineReader<R> {
    reader: BufReader<R>,
    line_buffer: String,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, inner),
            line_buffer: String::with_capacity(4096),
        }
    }

    /// Read a line without its terminator, borrowing the internal buffer.
    /// Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        // read_line retries EINTR itself
        if self.reader.read_line(&mut self.line_buffer)? == 0 {
            return Ok(None);
        }
        let trimmed = self.line_buffer.trim_end_matches(['\n', '\r']);
        Ok(Some(trimmed))
    }
}

/// Buffered line writer; every line is flushed immediately.
pub struct LineWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, inner),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reader_strips_terminators() {
        let mut reader = LineReader::new(Cursor::new(b"hello\nworld\r\n\nlast".to_vec()));
        assert_eq!(reader.read_line().unwrap(), Some("hello"));
        assert_eq!(reader.read_line().unwrap(), Some("world"));
        assert_eq!(reader.read_line().unwrap(), Some(""));
        // final line without newline is still delivered
        assert_eq!(reader.read_line().unwrap(), Some("last"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_writer_appends_newline_once() {
        let mut out = Vec::new();
        {
            let mut writer = LineWriter::new(&mut out);
            writer.write_line("a").unwrap();
            writer.write_line("b\n").unwrap();
        }
        assert_eq!(out, b"a\nb\n");
    }

    #[test]
    fn test_over_os_pipe() {
        let (read_end, write_end) = std::io::pipe().expect("Failed to create pipe");
        let mut reader = LineReader::new(read_end);
        let mut writer = LineWriter::new(write_end);

        writer.write_line(r#"{"type":"close"}"#).unwrap();
        drop(writer);

        assert_eq!(reader.read_line().unwrap(), Some(r#"{"type":"close"}"#));
        assert_eq!(reader.read_line().unwrap(), None);
    }
}

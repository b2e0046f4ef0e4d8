use std::io::{self, BufRead, Read, Write};

use thiserror::Error;

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("frame exceeds the maximum size of {0} bytes")]
    FrameTooLarge(usize),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("transport closed")]
    Closed,
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Source of whole text frames.
pub trait FrameRead: Send {
    /// Next frame, or `None` once the peer has closed the connection.
    fn read_frame(&mut self) -> Result<Option<String>, TransportError>;
}

/// Sink for whole text frames.
pub trait FrameWrite: Send + 'static {
    fn write_frame(&mut self, frame: &str) -> Result<(), TransportError>;
}

/// Newline-delimited frames over a byte stream.
///
/// Each frame is one line of JSON. Serialized JSON never contains a raw newline, so the line
/// terminator is an unambiguous frame boundary. Blank lines are skipped.
pub struct ProtocolTransport<T> {
    stream: T,
    max_frame_size: usize,
    buf: Vec<u8>,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self::with_max_frame_size(stream, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(stream: T, max_frame_size: usize) -> Self {
        Self {
            stream,
            max_frame_size,
            buf: Vec::new(),
        }
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T: BufRead + Send> FrameRead for ProtocolTransport<T> {
    fn read_frame(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            self.buf.clear();
            let limit = self.max_frame_size as u64 + 2;
            let read = (&mut self.stream)
                .take(limit)
                .read_until(b'\n', &mut self.buf)?;
            if read == 0 {
                return Ok(None);
            }

            let terminated = self.buf.last() == Some(&b'\n');
            while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
                self.buf.pop();
            }
            if self.buf.len() > self.max_frame_size {
                return Err(TransportError::FrameTooLarge(self.max_frame_size));
            }
            if self.buf.is_empty() {
                if terminated {
                    continue;
                }
                return Ok(None);
            }

            let frame = String::from_utf8(std::mem::take(&mut self.buf))
                .map_err(|_| TransportError::InvalidUtf8)?;
            return Ok(Some(frame));
        }
    }
}

impl<T: Write + Send + 'static> FrameWrite for ProtocolTransport<T> {
    fn write_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        self.stream.write_all(frame.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use super::*;

    #[test]
    fn read_write_frames() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport.write_frame(r#"{"type":"hello"}"#).unwrap();
        transport.write_frame(r#"{"type":"hello_ok"}"#).unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        assert_eq!(
            transport.read_frame().unwrap().as_deref(),
            Some(r#"{"type":"hello"}"#)
        );
        assert_eq!(
            transport.read_frame().unwrap().as_deref(),
            Some(r#"{"type":"hello_ok"}"#)
        );
        assert_eq!(transport.read_frame().unwrap(), None);
    }

    #[test]
    fn skips_blank_lines_and_carriage_returns() {
        let stream = Cursor::new(b"\n\r\n{\"a\":1}\r\n{\"b\":2}".to_vec());
        let mut transport = ProtocolTransport::new(stream);

        assert_eq!(transport.read_frame().unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(transport.read_frame().unwrap().as_deref(), Some("{\"b\":2}"));
        assert_eq!(transport.read_frame().unwrap(), None);
    }

    #[test]
    fn rejects_oversized_frames() {
        let stream = Cursor::new(b"0123456789\n".to_vec());
        let mut transport = ProtocolTransport::with_max_frame_size(stream, 4);

        assert!(matches!(
            transport.read_frame(),
            Err(TransportError::FrameTooLarge(4))
        ));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let stream = Cursor::new(vec![0xff, 0xfe, b'\n']);
        let mut transport = ProtocolTransport::new(stream);

        assert!(matches!(
            transport.read_frame(),
            Err(TransportError::InvalidUtf8)
        ));
    }
}

//! Line extraction for tailed files.
//!
//! Works on raw bytes and decodes a line only once its terminator has been
//! seen, so multi-byte sequences are never split by a read boundary. A line
//! ends at LF, CR or CRLF; the partial bytes of an unterminated line stay in
//! the caller's buffer and prepend whatever the file grows next.

use std::io::{self, Read};

use encoding_rs::Encoding;

/// One-byte push-back over any reader, for CRLF look-ahead.
struct LookaheadReader<R> {
    inner: R,
    pushed_back: Option<u8>,
}

impl<R: Read> LookaheadReader<R> {
    fn new(inner: R) -> Self {
        LookaheadReader {
            inner,
            pushed_back: None,
        }
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if let Some(byte) = self.pushed_back.take() {
            return Ok(Some(byte));
        }
        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn push_back(&mut self, byte: u8) {
        debug_assert!(self.pushed_back.is_none());
        self.pushed_back = Some(byte);
    }
}

/// Reads terminator-completed lines and keeps count of the bytes consumed
/// from the underlying file, so the caller can persist an exact resume
/// offset.
pub(crate) struct TailReader<R> {
    reader: LookaheadReader<R>,
    encoding: &'static Encoding,
    consumed: u64,
}

impl<R: Read> TailReader<R> {
    pub(crate) fn new(inner: R, encoding: &'static Encoding) -> Self {
        TailReader {
            reader: LookaheadReader::new(inner),
            encoding,
            consumed: 0,
        }
    }

    /// Bytes consumed since construction, including any partial line left in
    /// the caller's buffer.
    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Reads one line only if it is terminated by LF, CR or CRLF. The
    /// terminator is consumed but not part of the line; the line may be
    /// empty. Returns `None` on end-of-file; the bytes accumulated so far
    /// remain in `buf` for the next attempt.
    pub(crate) fn read_complete_line(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<String>> {
        while let Some(byte) = self.next_byte()? {
            if byte == b'\n' || byte == b'\r' {
                self.maybe_skip_lf(byte)?;
                let (line, _) = self.encoding.decode_without_bom_handling(buf);
                let line = line.into_owned();
                buf.clear();
                return Ok(Some(line));
            }
            buf.push(byte);
        }
        Ok(None)
    }

    /// Consumes bytes until just past the next terminator. `false` means
    /// end-of-file came first.
    pub(crate) fn find_next_line(&mut self) -> io::Result<bool> {
        while let Some(byte) = self.next_byte()? {
            if byte == b'\n' || byte == b'\r' {
                self.maybe_skip_lf(byte)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        let byte = self.reader.read_byte()?;
        if byte.is_some() {
            self.consumed += 1;
        }
        Ok(byte)
    }

    // an LF right after a CR belongs to the same terminator
    fn maybe_skip_lf(&mut self, byte: u8) -> io::Result<()> {
        if byte == b'\r' {
            if let Some(next) = self.next_byte()? {
                if next != b'\n' {
                    self.reader.push_back(next);
                    self.consumed -= 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{UTF_8, WINDOWS_1252};
    use std::io::Cursor;

    fn reader(bytes: &[u8]) -> TailReader<Cursor<Vec<u8>>> {
        TailReader::new(Cursor::new(bytes.to_vec()), UTF_8)
    }

    #[test]
    fn test_lf_cr_and_crlf_all_terminate() {
        let mut tail = reader(b"one\ntwo\rthree\r\nfour\n");
        let mut buf = Vec::new();
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some("one"));
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some("two"));
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some("three"));
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some("four"));
        assert_eq!(tail.read_complete_line(&mut buf).unwrap(), None);
        assert_eq!(tail.consumed(), 20);
    }

    #[test]
    fn test_empty_lines() {
        let mut tail = reader(b"\n\r\n\r");
        let mut buf = Vec::new();
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some(""));
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some(""));
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some(""));
        assert_eq!(tail.read_complete_line(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_cr_followed_by_data_pushes_back() {
        let mut tail = reader(b"a\rb\n");
        let mut buf = Vec::new();
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some("a"));
        assert_eq!(tail.consumed(), 2);
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some("b"));
        assert_eq!(tail.consumed(), 4);
    }

    #[test]
    fn test_partial_line_retained_across_readers() {
        let mut buf = Vec::new();

        let mut first = reader(b"abc");
        assert_eq!(first.read_complete_line(&mut buf).unwrap(), None);
        assert_eq!(buf, b"abc");
        assert_eq!(first.consumed(), 3);

        // the file grew; a new reader picks up where the offset left off
        let mut second = reader(b"def\n");
        assert_eq!(
            second.read_complete_line(&mut buf).unwrap().as_deref(),
            Some("abcdef")
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_long_line_is_read_whole() {
        let mut data = vec![b'x'; 100_000];
        data.push(b'\n');
        let mut tail = reader(&data);
        let mut buf = Vec::new();
        let line = tail.read_complete_line(&mut buf).unwrap().unwrap();
        assert_eq!(line.len(), 100_000);
    }

    #[test]
    fn test_find_next_line_skips_past_terminator() {
        let mut tail = reader(b"tail\r\nrest\n");
        assert!(tail.find_next_line().unwrap());
        assert_eq!(tail.consumed(), 6);

        let mut buf = Vec::new();
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some("rest"));
    }

    #[test]
    fn test_find_next_line_hits_eof() {
        let mut tail = reader(b"no terminator");
        assert!(!tail.find_next_line().unwrap());
    }

    #[test]
    fn test_decodes_with_configured_encoding() {
        let mut tail = TailReader::new(Cursor::new(b"caf\xe9\n".to_vec()), WINDOWS_1252);
        let mut buf = Vec::new();
        assert_eq!(tail.read_complete_line(&mut buf).unwrap().as_deref(), Some("café"));
    }

    #[test]
    fn test_malformed_bytes_use_replacement() {
        let mut tail = reader(b"a\xff\xfeb\n");
        let mut buf = Vec::new();
        let line = tail.read_complete_line(&mut buf).unwrap().unwrap();
        assert_eq!(line, "a\u{fffd}\u{fffd}b");
    }
}

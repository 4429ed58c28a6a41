//! Newline framing for watch bodies. Chunks arrive split at arbitrary points.

use bytes::BytesMut;

#[derive(Default)]
pub(crate) struct LineSplitter {
    buf: BytesMut,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line (without the trailing `\n`), if one is buffered.
    pub(crate) fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line = self.buf.split_to(pos);
        let _ = self.buf.split_to(1); // drop '\n'
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Unterminated tail left when the stream ends.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunks_and_flushes_tail() {
        let mut s = LineSplitter::default();
        let mut out = Vec::new();
        for chunk in [&b"hello\nwor"[..], b"ld\n", b"tail"] {
            s.push(chunk);
            while let Some(l) = s.next_line() { out.push(l); }
        }
        out.extend(s.finish());
        assert_eq!(out, vec!["hello", "world", "tail"]);
        assert!(s.finish().is_none());
    }
}

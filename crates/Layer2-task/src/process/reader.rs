//! Bounded line reader for child pipes
//!
//! Agent output can contain single JSON lines of several megabytes. Lines up
//! to `max_line_bytes` are returned whole; a longer line is skipped up to its
//! newline while the pipe keeps draining, so the child never blocks on a full
//! pipe and memory stays bounded.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Reads `\n`-terminated lines with a hard length cap
pub struct LineReader<R> {
    reader: R,
    max_line_bytes: usize,
    buf: Vec<u8>,
    discarding: bool,
    dropped: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            max_line_bytes,
            buf: Vec::new(),
            discarding: false,
            dropped: 0,
        }
    }

    /// Number of oversized lines skipped so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Next complete line without its terminator, or `None` at EOF
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let (consumed, line_done) = {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    // EOF: flush a trailing unterminated line
                    if self.discarding || self.buf.is_empty() {
                        self.discarding = false;
                        self.buf.clear();
                        return Ok(None);
                    }
                    return Ok(Some(take_line(&mut self.buf)));
                }

                match available.iter().position(|b| *b == b'\n') {
                    Some(idx) => {
                        append_bounded(
                            &mut self.buf,
                            &mut self.discarding,
                            &mut self.dropped,
                            self.max_line_bytes,
                            &available[..idx],
                        );
                        (idx + 1, true)
                    }
                    None => {
                        append_bounded(
                            &mut self.buf,
                            &mut self.discarding,
                            &mut self.dropped,
                            self.max_line_bytes,
                            available,
                        );
                        (available.len(), false)
                    }
                }
            };
            self.reader.consume(consumed);

            if line_done {
                if self.discarding {
                    // End of an oversized line; start fresh
                    self.discarding = false;
                    self.buf.clear();
                    continue;
                }
                return Ok(Some(take_line(&mut self.buf)));
            }
        }
    }
}

fn append_bounded(
    buf: &mut Vec<u8>,
    discarding: &mut bool,
    dropped: &mut usize,
    max: usize,
    chunk: &[u8],
) {
    if *discarding {
        return;
    }
    if buf.len() + chunk.len() > max {
        *discarding = true;
        *dropped += 1;
        buf.clear();
        buf.shrink_to_fit();
        return;
    }
    buf.extend_from_slice(chunk);
}

fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}

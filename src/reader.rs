use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, warn};

use crate::error::DisconnectReason;

/// 512 bytes of message plus room for tags.
const MAX_LINE_LENGTH: usize = 8704;

/// Splits one connection's byte stream into trimmed protocol lines.
///
/// A reader belongs to exactly one connection. Once it reports the end of
/// the stream it stays finished; reconnecting creates a fresh reader.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    /// Inside an oversized line; bytes are thrown away up to its newline.
    discarding: bool,
    finished: Option<DisconnectReason>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            inner: BufReader::new(stream),
            buf: Vec::with_capacity(512),
            discarding: false,
            finished: None,
        }
    }

    /// Next non-empty line, or `None` once the stream closed or failed.
    pub async fn next_line(&mut self) -> Option<String> {
        if self.finished.is_some() {
            return None;
        }

        let limit = MAX_LINE_LENGTH as u64 + 1;
        loop {
            self.buf.clear();
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await;
            match read {
                Ok(0) => {
                    debug!("Stream closed by peer");
                    self.finished = Some(DisconnectReason::ServerClosed);
                    return None;
                }
                Ok(n) if self.discarding => {
                    if self.buf.last() == Some(&b'\n') {
                        self.discarding = false;
                    }
                    debug!("Discarded {} more bytes of an oversized line", n);
                }
                Ok(n) if n > MAX_LINE_LENGTH => {
                    warn!("Dropping oversized line (over {} bytes)", MAX_LINE_LENGTH);
                    self.discarding = self.buf.last() != Some(&b'\n');
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&self.buf);
                    let line = line.trim();
                    if !line.is_empty() {
                        return Some(line.to_string());
                    }
                }
                Err(e) => {
                    warn!("Read failed: {}", e);
                    self.finished = Some(DisconnectReason::ReadError(e.to_string()));
                    return None;
                }
            }
        }
    }

    /// Why the stream ended; `None` while it is still open.
    pub fn finish_reason(&self) -> Option<&DisconnectReason> {
        self.finished.as_ref()
    }
}

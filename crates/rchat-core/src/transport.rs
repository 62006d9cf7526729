//! Async line transport over any tokio byte stream.
//!
//! Both the server sessions and the client use these to move frames over a
//! `TcpStream` half (or an in-memory duplex in tests).

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::codec::{frame_line, LineDecoder};
use crate::error::ChatResult;

/// Read buffer size for a single `read` call.
const READ_CHUNK: usize = 16 * 1024;

/// Reads newline-delimited frames from an async byte stream.
pub struct LineReader<R> {
    inner: R,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: LineDecoder::new(),
            ready: VecDeque::new(),
            buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Next complete line, or `None` at end of stream.
    ///
    /// A partial line left at end of stream is discarded.
    pub async fn next_line(&mut self) -> ChatResult<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.ready.extend(self.decoder.feed(&self.buf[..n])?);
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Write one frame (a newline is appended) and flush.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> ChatResult<()> {
    writer.write_all(frame_line(text).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write queued frames until every sender is dropped, then shut the
/// writer down. Stops at the first write error.
pub async fn drain_lines<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::Receiver<String>,
) -> ChatResult<()> {
    while let Some(line) = outbound.recv().await {
        write_line(&mut writer, &line).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_lines_across_writes() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = LineReader::new(b);

        tokio::spawn(async move {
            a.write_all(b"hel").await.unwrap();
            a.write_all(b"lo\nwor").await.unwrap();
            a.write_all(b"ld\n").await.unwrap();
        });

        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("world"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_line_appends_newline() {
        let (mut a, b) = tokio::io::duplex(64);
        write_line(&mut a, "AUTH_SUCCESS").await.unwrap();
        drop(a);
        let mut reader = LineReader::new(b);
        assert_eq!(
            reader.next_line().await.unwrap().as_deref(),
            Some("AUTH_SUCCESS")
        );
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn drain_lines_writes_queue_then_closes() {
        let (a, b) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(drain_lines(a, rx));
        tx.send("one".to_string()).await.unwrap();
        tx.send("two".to_string()).await.unwrap();
        drop(tx);

        let mut reader = LineReader::new(b);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(reader.next_line().await.unwrap(), None);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn trailing_partial_line_dropped_at_eof() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(b"complete\npartial").await.unwrap();
        drop(a);
        let mut reader = LineReader::new(b);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("complete"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }
}

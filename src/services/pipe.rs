//! Bounded in-process byte pipe.
//!
//! Connects a producing task to a consuming reader: the writer pushes
//! `Bytes` frames, the reader implements [`AsyncRead`]. Closing either side
//! is observable by the other: dropping the reader fails the writer's next
//! send, and the writer can close the stream cleanly or with an error that
//! the reader surfaces on its next read.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Create a connected pipe able to buffer up to `capacity` in-flight frames.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: Bytes::new(),
        },
    )
}

pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Push one frame, waiting for buffer space. Fails with `BrokenPipe`
    /// once the reader is gone.
    pub async fn write(&self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))
    }

    /// Close the pipe with an error the reader will observe. Dropping the
    /// writer instead closes it cleanly (EOF).
    pub async fn close_with_error(self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}

pub struct PipeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.remaining());
                buf.put_slice(&self.current[..n]);
                self.current.advance(n);
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.current = chunk;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (writer, mut reader) = pipe(4);
        tokio::spawn(async move {
            writer.write(Bytes::from_static(b"hello ")).await.unwrap();
            writer.write(Bytes::from_static(b"world")).await.unwrap();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn writer_error_reaches_reader() {
        let (writer, mut reader) = pipe(4);
        tokio::spawn(async move {
            writer.write(Bytes::from_static(b"partial")).await.unwrap();
            writer
                .close_with_error(io::Error::other("fetch failed"))
                .await;
        });

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(out, b"partial");
        assert_eq!(err.to_string(), "fetch failed");
    }

    #[tokio::test]
    async fn dropped_reader_fails_the_writer() {
        let (writer, reader) = pipe(1);
        drop(reader);
        // the first send may land in the buffered slot or fail immediately;
        // a closed channel must fail no later than the second send
        let first = writer.write(Bytes::from_static(b"a")).await;
        if first.is_ok() {
            let second = writer.write(Bytes::from_static(b"b")).await;
            assert_eq!(second.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        } else {
            assert_eq!(first.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        }
    }
}

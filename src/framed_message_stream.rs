//! Datagrams carried over a byte stream, each prefixed with its length as a
//! big-endian u16.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::async_stream::{
    AsyncFlushMessage, AsyncMessageStream, AsyncReadMessage, AsyncShutdownMessage,
    AsyncWriteMessage,
};
use crate::buffer_pool::MAX_DATAGRAM_SIZE;

pub struct FramedMessageStream<S> {
    inner: Framed<S, LengthDelimitedCodec>,
}

impl<S> FramedMessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(2)
            .max_frame_length(MAX_DATAGRAM_SIZE)
            .big_endian()
            .new_codec();
        Self {
            inner: Framed::new(stream, codec),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

impl<S> AsyncReadMessage for FramedMessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_read_message(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(frame)) => {
                if buf.remaining() < frame.len() {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!(
                            "message of {} bytes does not fit in {} byte buffer",
                            frame.len(),
                            buf.remaining()
                        ),
                    )));
                }
                buf.put_slice(&frame);
                Poll::Ready(Ok(()))
            }
            Some(Err(e)) => Poll::Ready(Err(e)),
            None => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "message stream closed",
            ))),
        }
    }
}

impl<S> AsyncWriteMessage for FramedMessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_write_message(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<()>> {
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "message size too large",
            )));
        }
        let this = self.get_mut();
        ready!(Sink::<Bytes>::poll_ready(Pin::new(&mut this.inner), cx))?;
        Sink::<Bytes>::start_send(Pin::new(&mut this.inner), Bytes::copy_from_slice(buf))?;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncFlushMessage for FramedMessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_flush_message(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Sink::<Bytes>::poll_flush(Pin::new(&mut self.get_mut().inner), cx)
    }
}

impl<S> AsyncShutdownMessage for FramedMessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_shutdown_message(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Sink::<Bytes>::poll_close(Pin::new(&mut self.get_mut().inner), cx)
    }
}

impl<S> AsyncMessageStream for FramedMessageStream<S> where S: AsyncRead + AsyncWrite + Unpin + Send {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::poll_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn read_message<S: AsyncMessageStream>(stream: &mut S) -> std::io::Result<Vec<u8>> {
        let mut storage = [0u8; 256];
        let mut buf = ReadBuf::new(&mut storage);
        poll_fn(|cx| Pin::new(&mut *stream).poll_read_message(cx, &mut buf)).await?;
        Ok(buf.filled().to_vec())
    }

    async fn write_message<S: AsyncMessageStream>(stream: &mut S, data: &[u8]) -> std::io::Result<()> {
        poll_fn(|cx| Pin::new(&mut *stream).poll_write_message(cx, data)).await?;
        poll_fn(|cx| Pin::new(&mut *stream).poll_flush_message(cx)).await
    }

    #[tokio::test]
    async fn test_frames_are_length_prefixed() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut stream = FramedMessageStream::new(a);
        write_message(&mut stream, b"hello").await.unwrap();

        let mut raw = [0u8; 7];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw, b"\x00\x05hello");
    }

    #[tokio::test]
    async fn test_reads_split_and_coalesced_frames() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut stream = FramedMessageStream::new(a);

        // Two frames in one write, then one frame split over two writes.
        b.write_all(b"\x00\x02hi\x00\x00").await.unwrap();
        b.write_all(b"\x00\x03o").await.unwrap();
        b.write_all(b"ne").await.unwrap();

        assert_eq!(read_message(&mut stream).await.unwrap(), b"hi");
        assert_eq!(read_message(&mut stream).await.unwrap(), b"");
        assert_eq!(read_message(&mut stream).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_eof_is_reported_as_unexpected_eof() {
        let (a, b) = tokio::io::duplex(1024);
        let mut stream = FramedMessageStream::new(a);
        drop(b);
        let err = read_message(&mut stream).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut stream = FramedMessageStream::new(a);
        let big = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let err = write_message(&mut stream, &big).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}

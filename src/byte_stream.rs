use std::{pin::Pin, task::{Context, Poll}};

use tokio::io::AsyncRead;
use bytes::{Bytes, BytesMut, BufMut};
use futures::{Stream, stream, StreamExt};
use pin_project_lite::pin_project;
use tokio_util::io::StreamReader;

pin_project! {
    /// Stream of bytes.
    ///
    /// The common currency between the KV backends, the driver's readers and
    /// the HTTP bodies they are fed from.
    pub struct ByteStream {
        size_hint: Option<u64>,
        #[pin]
        inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static>>,
    }
}

impl ByteStream {
    /// Create a new `ByteStream` by wrapping a `futures` stream.
    pub fn new<S>(stream: S) -> ByteStream
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    {
        ByteStream {
            size_hint: None,
            inner: Box::pin(stream),
        }
    }

    /// A stream that yields no bytes at all.
    pub fn empty() -> ByteStream {
        ByteStream {
            size_hint: Some(0),
            inner: Box::pin(stream::empty()),
        }
    }

    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    /// Adapt the stream into an `AsyncRead`.
    pub fn into_async_read(self) -> impl AsyncRead + Send + 'static {
        StreamReader::new(self)
    }

    /// Read the whole stream into one contiguous buffer.
    pub async fn collect_bytes(mut self) -> Result<Bytes, std::io::Error> {
        let mut buff = BytesMut::new();
        while let Some(bytes) = self.next().await {
            buff.put(bytes?);
        }
        Ok(buff.freeze())
    }
}

impl From<Vec<u8>> for ByteStream {
    fn from(buf: Vec<u8>) -> ByteStream {
        ByteStream {
            size_hint: Some(buf.len() as u64),
            inner: Box::pin(stream::once(async move { Ok(Bytes::from(buf)) })),
        }
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<ByteStream size_hint={:?}>", self.size_hint)
    }
}

impl Stream for ByteStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        this.inner.poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        let data = ByteStream::empty().collect_bytes().await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn vec_roundtrips_through_stream() {
        let stream = ByteStream::from(b"some bytes".to_vec());
        assert_eq!(stream.size_hint(), Some(10));

        let data = stream.collect_bytes().await.unwrap();
        assert_eq!(&data[..], b"some bytes");
    }

    #[tokio::test]
    async fn into_async_read_reads_all_chunks() {
        use tokio::io::AsyncReadExt;

        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);

        let mut reader = ByteStream::new(chunks).into_async_read();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn into_async_read_surfaces_stream_errors() {
        use tokio::io::AsyncReadExt;

        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "upstream died")),
        ]);

        let mut reader = ByteStream::new(chunks).into_async_read();
        let mut buf = Vec::new();
        let err = reader.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
    }
}

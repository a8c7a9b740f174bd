//! Framed transport: a byte connection carrying length-prefixed values.
//!
//! Each frame is a 4-byte big-endian length followed by the encoded value.
//! An [`Endpoint`] wraps any `AsyncRead + AsyncWrite` pair, so the same code
//! runs over TCP and over in-memory pipes.

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tether_types::codec::{CodecError, Read, Write};
use tether_types::error::ServiceError;
use tether_types::service::ServiceId;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Errors from the transport and handshake layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Unknown service: {0}")]
    UnknownService(ServiceId),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Not connected")]
    NotConnected,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
}

impl From<WireError> for ServiceError {
    fn from(e: WireError) -> Self {
        use std::io::ErrorKind;
        match e {
            WireError::Io(e) => ServiceError::Io(e),
            WireError::Codec(e) => ServiceError::Io(e.into()),
            WireError::ConnectionClosed => ServiceError::io(ErrorKind::UnexpectedEof, "Connection closed"),
            WireError::NotConnected => ServiceError::io(ErrorKind::NotConnected, "Not connected"),
            other => ServiceError::io(ErrorKind::ConnectionAborted, other.to_string()),
        }
    }
}

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of an endpoint.
pub struct EndpointReader {
    inner: BoxReader,
}

impl EndpointReader {
    /// Reads one frame body. A clean end of stream before the header is
    /// reported as [`WireError::ConnectionClosed`].
    pub async fn read_frame(&mut self) -> Result<Bytes, WireError> {
        let mut header = [0u8; 4];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WireError::ConnectionClosed);
            }
            Err(e) => return Err(WireError::Io(e)),
        }

        let len = u32::from_be_bytes(header);
        if len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut body = vec![0u8; len as usize];
        self.inner.read_exact(&mut body).await?;
        Ok(Bytes::from(body))
    }

    /// Reads one frame and decodes it as `T`.
    pub async fn read<T: Read>(&mut self) -> Result<T, WireError> {
        let frame = self.read_frame().await?;
        Ok(T::decode(frame)?)
    }
}

/// Write half of an endpoint.
pub struct EndpointWriter {
    inner: BoxWriter,
}

impl EndpointWriter {
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), WireError> {
        let len = u32::try_from(body.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_SIZE)
            .ok_or(WireError::FrameTooLarge {
                size: u32::try_from(body.len()).unwrap_or(u32::MAX),
                max: MAX_FRAME_SIZE,
            })?;
        let mut bytes = Vec::with_capacity(4 + body.len());
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(body);
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encodes `value` and writes it as one frame.
    pub async fn write<T: Write>(&mut self, value: &T) -> Result<(), WireError> {
        self.write_frame(&value.encode()).await
    }

    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// A framed, bidirectional connection.
pub struct Endpoint {
    reader: EndpointReader,
    writer: EndpointWriter,
    peer_addr: Option<SocketAddr>,
}

impl Endpoint {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: EndpointReader {
                inner: Box::new(reader),
            },
            writer: EndpointWriter {
                inner: Box::new(writer),
            },
            peer_addr: None,
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            peer_addr,
            ..Self::new(reader, writer)
        }
    }

    /// Opens a TCP connection to `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_tcp(stream))
    }

    /// Two endpoints joined by an in-memory pipe.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Self::new(a_read, a_write), Self::new(b_read, b_write))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub async fn read<T: Read>(&mut self) -> Result<T, WireError> {
        self.reader.read().await
    }

    pub async fn write<T: Write>(&mut self, value: &T) -> Result<(), WireError> {
        self.writer.write(value).await
    }

    pub fn into_split(self) -> (EndpointReader, EndpointWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use tokio_test::io::Builder;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let mock = Builder::new().read(&frame(b"hello")).build();
        let mut reader = EndpointReader {
            inner: Box::new(mock),
        };
        assert_eq!(&reader.read_frame().await.unwrap()[..], b"hello");
        assert!(matches!(
            reader.read_frame().await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_frame_prefixes_length() {
        let mock = Builder::new().write(&frame(b"abc")).build();
        let mut writer = EndpointWriter {
            inner: Box::new(mock),
        };
        writer.write_frame(b"abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mock = Builder::new().read(&header).build();
        let mut reader = EndpointReader {
            inner: Box::new(mock),
        };
        assert!(matches!(
            reader.read_frame().await,
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_is_io_error() {
        let mut bytes = frame(b"full body");
        bytes.truncate(7);
        let mock = Builder::new().read(&bytes).build();
        let mut reader = EndpointReader {
            inner: Box::new(mock),
        };
        assert!(matches!(reader.read_frame().await, Err(WireError::Io(_))));
    }

    #[tokio::test]
    async fn test_pair_carries_messages() {
        let (mut a, mut b) = Endpoint::pair();
        let mut request = Message::request(4);
        request.put(&ServiceId::ENTITY);
        a.write(&request).await.unwrap();

        let mut received: Message = b.read().await.unwrap();
        assert_eq!(received.uid(), request.uid());
        assert_eq!(received.get::<ServiceId>().unwrap(), ServiceId::ENTITY);
    }

    #[tokio::test]
    async fn test_garbage_frame_is_codec_error() {
        let (mut a, mut b) = Endpoint::pair();
        a.writer.write_frame(&[9, 9]).await.unwrap();
        assert!(matches!(b.read::<Message>().await, Err(WireError::Codec(_))));
    }

    #[test]
    fn test_wire_errors_map_to_io() {
        use tether_types::error::ErrorKind;
        let err: ServiceError = WireError::NotConnected.into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.to_string(), "IO error: Not connected");
        let err: ServiceError = WireError::Codec(CodecError::EndOfBuffer).into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}

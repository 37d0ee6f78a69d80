//! The connected byte stream handed over to the protocol client.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use async_net::TcpStream;
use futures::{
    io::{ReadHalf, WriteHalf},
    AsyncRead, AsyncReadExt, AsyncWrite,
};

/// Duplex stream accepted from the server which dialed back.
#[derive(Debug)]
pub struct DuplexStream {
    inner: TcpStream,
    peer_addr: SocketAddr,
}

impl DuplexStream {
    pub(crate) fn new(inner: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { inner, peer_addr }
    }

    /// Address of the server side of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Splits the stream into independent read and write channels.
    pub fn into_transport(self) -> Transport {
        let (reader, writer) = self.split();
        Transport { reader, writer }
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

/// Reader and writer pair consumed by the protocol client.
#[derive(Debug)]
pub struct Transport {
    /// Messages from the server.
    pub reader: ReadHalf<DuplexStream>,
    /// Messages to the server.
    pub writer: WriteHalf<DuplexStream>,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::net::Ipv4Addr;

    use async_net::{TcpListener, TcpStream};
    use futures::{executor::block_on, AsyncReadExt, AsyncWriteExt};

    use super::DuplexStream;

    #[test]
    fn test_transport_halves_are_independent() {
        block_on(async {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let address = listener.local_addr().unwrap();

            let mut peer = TcpStream::connect(address).await.unwrap();
            let (accepted, peer_addr) = listener.accept().await.unwrap();
            let stream = DuplexStream::new(accepted, peer_addr);
            assert_eq!(stream.peer_addr(), peer.local_addr().unwrap());

            let mut transport = stream.into_transport();

            transport.writer.write_all(b"ping").await.unwrap();
            transport.writer.flush().await.unwrap();
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");

            peer.write_all(b"pong").await.unwrap();
            transport.reader.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });
    }
}

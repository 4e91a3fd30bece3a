use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Sink, Stream};
use log::debug;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, UdpSocket};
use tokio_util::codec::Framed;

use crate::endpoint::Endpoint;
use crate::message::Message;
use crate::transport::{
    BoxedFramedConnection, Codec, FramedConnection, FramedItem, Transport, TransportError,
};

/// Default CoAP transport as originally defined in RFC 7252.  Likely this is what you want if
/// the server does not require DTLS.
pub struct UdpTransport {
    endpoint: Endpoint,
}

impl UdpTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&self) -> Result<BoxedFramedConnection, TransportError> {
        let (socket, peer) = connect_socket(&self.endpoint).await?;
        debug!("Connected UDP socket {:?} to {peer}", socket.local_addr());
        let connection = DatagramConnection::new(DatagramStream::new(socket), peer);
        Ok(Box::pin(connection))
    }
}

/// Resolves the endpoint and returns a socket connected to the first address that accepts it.
pub(crate) async fn connect_socket(
    endpoint: &Endpoint,
) -> Result<(UdpSocket, SocketAddr), TransportError> {
    let authority = endpoint.authority();
    let addresses: Vec<SocketAddr> = lookup_host(authority.as_str())
        .await
        .map_err(|e| TransportError::Resolve(format!("{authority}: {e}")))?
        .collect();
    if addresses.is_empty() {
        return Err(TransportError::Resolve(authority));
    }

    let mut last_err = None;
    for peer in addresses {
        let local: SocketAddr = match peer {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let attempt = async {
            let socket = UdpSocket::bind(local).await?;
            socket.connect(peer).await?;
            Ok::<_, io::Error>(socket)
        };
        match attempt.await {
            Ok(socket) => return Ok((socket, peer)),
            Err(e) => {
                debug!("Unable to connect to {peer}: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.map_or_else(|| TransportError::Resolve(authority), TransportError::Io))
}

/// Presents a connected UDP socket as a byte stream where every read yields exactly one
/// datagram and every write sends exactly one datagram.  This is what lets both the plain
/// codec and the DTLS record layer sit on top of the socket.
pub(crate) struct DatagramStream {
    socket: UdpSocket,
}

impl DatagramStream {
    pub(crate) fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl AsyncRead for DatagramStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let before = buf.filled().len();
            match self.socket.poll_recv(cx, buf) {
                // A zero length read would be mistaken for EOF; skip empty datagrams.
                Poll::Ready(Ok(())) if buf.filled().len() == before => continue,
                // ICMP port unreachable surfaces here on a connected socket; the peer may
                // simply not be up yet and retransmission will deal with it.
                Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!("Ignoring {e} on connected socket");
                    continue;
                }
                other => return other,
            }
        }
    }
}

impl AsyncWrite for DatagramStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Framed CoAP connection over any datagram-preserving byte stream.
#[pin_project]
pub(crate) struct DatagramConnection<S> {
    #[pin]
    framed: Framed<S, Codec>,
    peer: SocketAddr,
}

impl<S: AsyncRead + AsyncWrite> DatagramConnection<S> {
    pub(crate) fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            framed: Framed::new(stream, Codec),
            peer,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send> FramedConnection for DatagramConnection<S> {
    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

impl<S: AsyncRead + AsyncWrite> Stream for DatagramConnection<S> {
    type Item = Result<FramedItem, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().framed.poll_next(cx)
    }
}

impl<S: AsyncRead + AsyncWrite> Sink<Message> for DatagramConnection<S> {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.project().framed.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_lite::{MessageClass, MessageType, RequestType, ResponseType};
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn test_exchange_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let transport = UdpTransport::new(Endpoint::new("127.0.0.1", port));
        let mut connection = transport.connect().await.unwrap();

        let mut request = Message::request(RequestType::Get, "/hello");
        request.message_id = 42;
        connection.send(request.clone()).await.unwrap();

        let mut buf = [0u8; 1500];
        let (len, client_addr) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(Message::decode(&buf[..len]), Ok(request));

        // Garbage first, then a valid reply: the stream must survive the malformed datagram.
        server.send_to(&[0x40], client_addr).await.unwrap();
        let mut reply = Message::new(
            MessageType::Acknowledgement,
            MessageClass::Response(ResponseType::Content),
        );
        reply.message_id = 42;
        reply.payload = b"world".to_vec();
        server
            .send_to(&reply.encode().unwrap(), client_addr)
            .await
            .unwrap();

        let first = connection.next().await.unwrap().unwrap();
        assert!(first.is_err());
        let second = connection.next().await.unwrap().unwrap();
        assert_eq!(second, Ok(reply));

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_failure() {
        let transport = UdpTransport::new(Endpoint::new("no-such-host.invalid", 5683));
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Resolve(_))
        ));
    }
}

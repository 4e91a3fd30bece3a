//! In-memory transport for exercising the client without sockets.

use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Sink, Stream};
use pin_project::pin_project;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::message::Message;
use crate::transport::{
    BoxedFramedConnection, FramedConnection, FramedItem, Transport, TransportError,
};

pub(crate) struct MockTransport {
    pending: Mutex<Option<MockConnection>>,
    fail_with: Option<String>,
}

/// The server side of a [`MockTransport`].
pub(crate) struct MockPeer {
    to_client: Option<UnboundedSender<Vec<u8>>>,
    from_client: UnboundedReceiver<Message>,
}

#[pin_project]
struct MockConnection {
    #[pin]
    inbound: UnboundedReceiverStream<Vec<u8>>,
    outbound: UnboundedSender<Message>,
}

impl MockTransport {
    pub(crate) fn new() -> (Self, MockPeer) {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let transport = Self {
            pending: Mutex::new(Some(MockConnection {
                inbound: UnboundedReceiverStream::new(inbound),
                outbound,
            })),
            fail_with: None,
        };
        let peer = MockPeer {
            to_client: Some(to_client),
            from_client,
        };
        (transport, peer)
    }

    /// Transport whose every connect attempt fails to resolve.
    pub(crate) fn unreachable(host: &str) -> Self {
        Self {
            pending: Mutex::new(None),
            fail_with: Some(host.to_string()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<BoxedFramedConnection, TransportError> {
        if let Some(host) = &self.fail_with {
            return Err(TransportError::Resolve(host.clone()));
        }
        let connection = self
            .pending
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Unspecified("mock already connected".to_string()))?;
        Ok(Box::pin(connection))
    }
}

impl MockPeer {
    pub(crate) fn send(&self, message: Message) {
        self.send_raw(&message.encode().unwrap());
    }

    pub(crate) fn send_raw(&self, datagram: &[u8]) {
        self.to_client
            .as_ref()
            .expect("peer disconnected")
            .send(datagram.to_vec())
            .unwrap();
    }

    pub(crate) async fn recv(&mut self) -> Message {
        self.from_client.recv().await.expect("client hung up")
    }

    pub(crate) fn try_recv(&mut self) -> Option<Message> {
        self.from_client.try_recv().ok()
    }

    /// Resolves once the client has released its end of the connection.
    pub(crate) async fn wait_closed(&mut self) {
        while self.from_client.recv().await.is_some() {}
    }

    /// Simulates the transport failing underneath the client.
    pub(crate) fn disconnect(&mut self) {
        self.to_client = None;
    }
}

impl FramedConnection for MockConnection {
    fn peer(&self) -> String {
        "mock".to_string()
    }
}

impl Stream for MockConnection {
    type Item = Result<FramedItem, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .inbound
            .poll_next(cx)
            .map(|datagram| datagram.map(|bytes| Ok(Message::decode(&bytes))))
    }
}

impl Sink<Message> for MockConnection {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        let bytes = item.encode()?;
        let message = Message::decode(&bytes)
            .map_err(|e| TransportError::Unspecified(e.to_string()))?;
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Io(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

use std::fmt;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{Sink, Stream};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{DecodeError, EncodeError, Message};

/// Generalization of the underlying CoAP transport so that plain UDP and DTLS (and in-memory
/// transports in tests) can sit behind the same client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve the peer, open the socket and complete any security handshake.  On error every
    /// resource acquired along the way has already been released.
    async fn connect(&self) -> Result<BoxedFramedConnection, TransportError>;
}

pub type BoxedFramedConnection = Pin<Box<dyn FramedConnection>>;

/// Connected datagram link to a single peer, exposed as both a stream of inbound messages and a
/// sink of outbound ones.  Closing the sink tears down any security session and releases the
/// socket.
pub trait FramedConnection:
    Send
    + Stream<Item = Result<FramedItem, TransportError>>
    + Sink<Message, Error = TransportError>
{
    /// Human readable peer description for logging.
    fn peer(&self) -> String;
}

/// One inbound datagram.  A malformed datagram is reported in-band so that it never terminates
/// the stream.
pub type FramedItem = Result<Message, DecodeError>;

/// Generalized errors indicating a range of transport-related issues such as being unable to
/// resolve the peer, handshake failures, or socket errors after the fact.
#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    Resolve(String),
    Handshake(String),
    HandshakeTimeout,
    InvalidCredentials(String),
    MalformedOutbound(EncodeError),
    Unspecified(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Resolve(host) => write!(f, "unable to resolve {host}"),
            Self::Handshake(err) => write!(f, "DTLS handshake failed: {err}"),
            Self::HandshakeTimeout => write!(f, "DTLS handshake timed out"),
            Self::InvalidCredentials(err) => write!(f, "invalid credentials: {err}"),
            Self::MalformedOutbound(err) => write!(f, "cannot encode outbound message: {err}"),
            Self::Unspecified(err) => write!(f, "unspecified: {err}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::MalformedOutbound(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(x: io::Error) -> Self {
        Self::Io(x)
    }
}

impl From<EncodeError> for TransportError {
    fn from(x: EncodeError) -> Self {
        Self::MalformedOutbound(x)
    }
}

/// Datagram codec: each read from the underlying stream is exactly one datagram, so every
/// decode consumes the whole buffer.
#[derive(Default)]
pub(crate) struct Codec;

impl Decoder for Codec {
    type Item = FramedItem;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FramedItem>, TransportError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let result = Message::decode(&buf[..]);
        buf.clear();
        Ok(Some(result))
    }
}

impl Encoder<Message> for Codec {
    type Error = TransportError;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), TransportError> {
        message.encode_into(buf)?;
        Ok(())
    }
}

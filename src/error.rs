use std::time::Duration;

use thiserror::Error;

use crate::content_format::UnknownContentFormat;
use crate::exchange::ExchangeError;
use crate::message::EncodeError;
use crate::transport::TransportError;

/// Errors surfaced to callers of [`crate::CoapClient`].  Retransmissions and stray datagrams are
/// handled internally and never show up here.
#[derive(Error, Debug)]
pub enum ClientError {
    /// DNS, socket or handshake failure while connecting.
    #[error("connect failed: {0}")]
    Connect(#[source] TransportError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// No response within the caller supplied timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The retransmission budget ran out before the caller's timeout did.
    #[error("no reply after {0} transmissions")]
    NoReply(usize),

    /// The server answered with Reset.
    #[error("request rejected by server")]
    Rejected,

    #[error("client is not connected")]
    NotConnected,

    /// Terminated by `close()`.
    #[error("cancelled by client close")]
    Cancelled,

    /// The connection failed after it was established.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invalid content format: {0}")]
    InvalidContentFormat(String),

    /// The server answered the registering GET without accepting the observation.
    #[error("server refused observation (code {})", crate::message::code_string(.code.to_owned()))]
    ObservationRefused { code: u8 },

    #[error("invalid client state: {0}")]
    InvalidState(&'static str),

    /// Programmer error within this crate, file a bug!
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<ExchangeError> for ClientError {
    fn from(src: ExchangeError) -> Self {
        match src {
            ExchangeError::NoReply(attempts) => Self::NoReply(attempts),
            ExchangeError::Reset => Self::Rejected,
            ExchangeError::Cancelled => Self::Cancelled,
            ExchangeError::TransportClosed(reason) => Self::Transport(reason),
            ExchangeError::Encode(e) => Self::Encode(e),
            ExchangeError::InternalError(reason) => Self::InternalError(reason),
        }
    }
}

impl From<UnknownContentFormat> for ClientError {
    fn from(src: UnknownContentFormat) -> Self {
        Self::InvalidContentFormat(src.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_errors_map() {
        assert!(matches!(
            ClientError::from(ExchangeError::Reset),
            ClientError::Rejected
        ));
        assert!(matches!(
            ClientError::from(ExchangeError::NoReply(5)),
            ClientError::NoReply(5)
        ));
        assert!(matches!(
            ClientError::from(ExchangeError::Cancelled),
            ClientError::Cancelled
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ClientError::ObservationRefused { code: 132 }.to_string(),
            "server refused observation (code 4.04)"
        );
        assert_eq!(
            ClientError::from(UnknownContentFormat("text/fancy".to_string())).to_string(),
            "invalid content format: text/fancy"
        );
    }
}

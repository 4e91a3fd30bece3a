//! Robust async CoAP client over UDP or DTLS, with RFC 7641 Observe support.
//!
//! ```no_run
//! use std::time::Duration;
//! use coap_client::{ClientConfig, CoapClient, Endpoint};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let endpoint: Endpoint = "coap.me:5683".parse()?;
//! let client = CoapClient::new(endpoint, ClientConfig::new());
//! client.connect().await?;
//! let response = client.get("/hello", Duration::from_secs(5)).await?;
//! println!("{}: {}", response.code_string(), String::from_utf8_lossy(&response.body));
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub use client::{CoapClient, ConnectionState, Response};
pub use config::ClientConfig;
pub use content_format::ContentFormat;
pub use dtls::DtlsTransport;
pub use endpoint::{Endpoint, Security};
pub use error::ClientError;
pub use exchange::TransmissionParameters;
pub use message::Message;
pub use observe::{CallbackFailure, Notification, ObservationHandle};
pub use transport::{Transport, TransportError};
pub use udp::UdpTransport;

pub mod client;
pub mod config;
pub mod content_format;
mod dispatch;
pub mod dtls;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod message;
pub mod observe;
#[cfg(test)]
mod testing;
pub mod transport;
pub mod u24;
pub mod udp;

//! DTLS 1.2 over UDP, secured with either a pre-shared key or an ECDSA certificate.

use std::ffi::CString;
use std::pin::Pin;

use async_trait::async_trait;
use log::debug;
use openssl::error::ErrorStack;
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslOptions, SslVerifyMode};
use tokio::time;
use tokio_openssl::SslStream;

use crate::config::ClientConfig;
use crate::endpoint::{Endpoint, Security};
use crate::transport::{BoxedFramedConnection, Transport, TransportError};
use crate::udp::{connect_socket, DatagramConnection, DatagramStream};

const PSK_CIPHERS: &str =
    "PSK-AES128-CBC-SHA256:PSK-AES128-GCM-SHA256:PSK-AES128-CCM8:PSK-AES128-CCM";

// Only ECDSA keys are supported in certificate mode.
const ECDSA_CIPHERS: &str =
    "ECDHE-ECDSA-AES128-CCM:ECDHE-ECDSA-AES128-CCM8:ECDHE-ECDSA-AES128-GCM-SHA256";

/// CoAP over DTLS ("coaps") as defined in RFC 7252 §9.
pub struct DtlsTransport {
    endpoint: Endpoint,
    config: ClientConfig,
}

impl DtlsTransport {
    pub fn new(endpoint: Endpoint, config: ClientConfig) -> Self {
        Self { endpoint, config }
    }
}

#[async_trait]
impl Transport for DtlsTransport {
    async fn connect(&self) -> Result<BoxedFramedConnection, TransportError> {
        let connector = build_connector(&self.endpoint, &self.config)?;
        let handshake = async {
            let (socket, peer) = connect_socket(&self.endpoint).await?;
            let mut ssl = connector
                .configure()?
                .verify_hostname(self.config.verify_peer)
                .into_ssl(self.endpoint.host())?;
            ssl.set_mtu(self.config.mtu)?;
            let mut stream = SslStream::new(ssl, DatagramStream::new(socket))?;
            Pin::new(&mut stream)
                .connect()
                .await
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            debug!("DTLS session established with {peer}");
            Ok::<_, TransportError>(DatagramConnection::new(stream, peer))
        };
        let connection = time::timeout(self.config.handshake_timeout, handshake)
            .await
            .map_err(|_| TransportError::HandshakeTimeout)??;
        Ok(Box::pin(connection))
    }
}

fn build_connector(
    endpoint: &Endpoint,
    config: &ClientConfig,
) -> Result<SslConnector, TransportError> {
    let mut builder = SslConnector::builder(SslMethod::dtls())?;
    // The socket is wrapped in a stream BIO so openssl cannot discover the path MTU itself.
    builder.set_options(SslOptions::NO_QUERY_MTU);

    match endpoint.security() {
        Security::None => {
            return Err(TransportError::InvalidCredentials(
                "DTLS requires a PSK or certificate".to_string(),
            ))
        }
        Security::Psk { identity, key } => {
            builder.set_cipher_list(PSK_CIPHERS)?;
            let identity = CString::new(identity.as_bytes()).map_err(|_| {
                TransportError::InvalidCredentials("PSK identity contains NUL".to_string())
            })?;
            let key = key.clone();
            builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
                let identity = identity.as_bytes_with_nul();
                if identity.len() > identity_out.len() || key.len() > psk_out.len() {
                    return Err(ErrorStack::get());
                }
                identity_out[..identity.len()].copy_from_slice(identity);
                psk_out[..key.len()].copy_from_slice(&key);
                Ok(key.len())
            });
        }
        Security::Certificate { cert, key } => {
            let invalid = |e: ErrorStack| TransportError::InvalidCredentials(e.to_string());
            builder.set_cipher_list(ECDSA_CIPHERS)?;
            builder.set_certificate_chain_file(cert).map_err(invalid)?;
            builder
                .set_private_key_file(key, SslFiletype::PEM)
                .map_err(invalid)?;
            builder.check_private_key().map_err(invalid)?;
        }
    }

    if let Some(ca_file) = &config.ca_file {
        builder
            .set_ca_file(ca_file)
            .map_err(|e| TransportError::InvalidCredentials(e.to_string()))?;
    }
    if !config.verify_peer {
        builder.set_verify(SslVerifyMode::NONE);
    }
    Ok(builder.build())
}

impl From<ErrorStack> for TransportError {
    fn from(x: ErrorStack) -> Self {
        Self::Handshake(x.to_string())
    }
}

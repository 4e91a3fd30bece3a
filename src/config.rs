use std::path::PathBuf;
use std::time::Duration;

use crate::exchange::TransmissionParameters;

/// Taken from RFC 7252
pub const DEFAULT_MTU: u32 = 1152;

/// EXCHANGE_LIFETIME derived from the default transmission parameters of RFC 7252 §4.8.2.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(247);

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-client tunables.  Defaults follow the CoAP RFC.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) transmission: TransmissionParameters,
    pub(crate) handshake_timeout: Duration,
    pub(crate) mtu: u32,
    pub(crate) verify_peer: bool,
    pub(crate) ca_file: Option<PathBuf>,
    pub(crate) duplicate_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transmission: TransmissionParameters::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            mtu: DEFAULT_MTU,
            verify_peer: true,
            ca_file: None,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Override the ack timeout, random factor and retransmission budget applied to every
    /// Confirmable request.
    pub fn transmission(mut self, parameters: TransmissionParameters) -> Self {
        self.transmission = parameters;
        self
    }

    /// Upper bound on the DTLS handshake, including socket setup.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Manually set the link MTU used to size DTLS records.
    pub fn set_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Skip verification of the server certificate.  Only meaningful for certificate mode.
    pub fn disable_peer_verification(mut self) -> Self {
        self.verify_peer = false;
        self
    }

    /// PEM bundle of trusted roots used instead of the system default store.
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// How long inbound message IDs are remembered to suppress duplicates.
    pub fn duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = window;
        self
    }

    pub fn transmission_parameters(&self) -> TransmissionParameters {
        self.transmission
    }
}

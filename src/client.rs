use std::mem;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use coap_lite::{MessageClass, RequestType, ResponseType};
use log::{debug, error, info};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::ClientConfig;
use crate::content_format::ContentFormat;
use crate::dispatch::Dispatcher;
use crate::dtls::DtlsTransport;
use crate::endpoint::Endpoint;
use crate::error::ClientError;
use crate::exchange::ExchangeManager;
use crate::message::{code_string, is_success_code, Message};
use crate::observe::{CallbackFailure, Notification, ObservationHandle, ObservationRegistry};
use crate::transport::Transport;
use crate::u24::u24;
use crate::udp::UdpTransport;

/// Primary client API: connect to one CoAP server, issue requests and observe resources.
///
/// All requests share a single socket (and DTLS session, when secured) owned by a background
/// dispatch task started by [`CoapClient::connect`].
pub struct CoapClient {
    endpoint: Endpoint,
    config: ClientConfig,
    transport: Box<dyn Transport>,
    state: Mutex<ClientState>,
    failures_tx: UnboundedSender<CallbackFailure>,
    failures_rx: Mutex<Option<UnboundedReceiver<CallbackFailure>>>,
}

/// Lifecycle of a [`CoapClient`].  Only [`CoapClient::connect`] moves into `Connected`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

enum ClientState {
    Disconnected,
    Connecting,
    Connected(Connection),
    Closing,
    Closed,
}

struct Connection {
    session: Session,
    shutdown_tx: oneshot::Sender<()>,
    dispatch: JoinHandle<()>,
}

/// Handles shared with in-flight requests.
#[derive(Clone)]
struct Session {
    exchanges: Arc<Mutex<ExchangeManager>>,
    observations: Arc<Mutex<ObservationRegistry>>,
    outbound_tx: UnboundedSender<Message>,
}

/// Final response to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u8,
    pub body: Vec<u8>,
    pub content_format: Option<u16>,
}

impl Response {
    fn from_message(message: Message) -> Self {
        Self {
            code: message.code,
            content_format: message.content_format(),
            body: message.payload,
        }
    }

    /// Dotted form of the code, e.g. `2.05`.
    pub fn code_string(&self) -> String {
        code_string(self.code)
    }

    pub fn response_type(&self) -> Option<ResponseType> {
        match MessageClass::from(self.code) {
            MessageClass::Response(response_type) => Some(response_type),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        is_success_code(self.code)
    }
}

impl CoapClient {
    /// Client for `endpoint` using plain UDP, or DTLS when the endpoint carries credentials.
    pub fn new(endpoint: Endpoint, config: ClientConfig) -> Self {
        let transport: Box<dyn Transport> = if endpoint.is_secure() {
            Box::new(DtlsTransport::new(endpoint.clone(), config.clone()))
        } else {
            Box::new(UdpTransport::new(endpoint.clone()))
        };
        Self::with_transport(endpoint, config, transport)
    }

    /// Client over a caller supplied transport.
    pub fn with_transport(
        endpoint: Endpoint,
        config: ClientConfig,
        transport: Box<dyn Transport>,
    ) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            config,
            transport,
            state: Mutex::new(ClientState::Disconnected),
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn state(&self) -> ConnectionState {
        match &*self.state.lock().await {
            ClientState::Disconnected => ConnectionState::Disconnected,
            ClientState::Connecting => ConnectionState::Connecting,
            ClientState::Connected(_) => ConnectionState::Connected,
            ClientState::Closing => ConnectionState::Closing,
            ClientState::Closed => ConnectionState::Closed,
        }
    }

    /// Receiver for observation callback failures.  Only the first call gets it.
    pub async fn callback_errors(&self) -> Option<UnboundedReceiver<CallbackFailure>> {
        self.failures_rx.lock().await.take()
    }

    /// Opens the socket, completes the DTLS handshake if secured, and starts dispatch.  On
    /// failure the client stays `Disconnected` and may be connected again.
    pub async fn connect(&self) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock().await;
            match &*state {
                ClientState::Disconnected => *state = ClientState::Connecting,
                ClientState::Connected(_) => return Ok(()),
                ClientState::Connecting => {
                    return Err(ClientError::InvalidState("connect already in progress"))
                }
                ClientState::Closing | ClientState::Closed => {
                    return Err(ClientError::InvalidState("client is closed"))
                }
            }
        }

        let result = self.transport.connect().await;

        let mut state = self.state.lock().await;
        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                if matches!(*state, ClientState::Connecting) {
                    *state = ClientState::Disconnected;
                }
                return Err(ClientError::Connect(e));
            }
        };
        if !matches!(*state, ClientState::Connecting) {
            debug!("Client closed while connecting to {}", self.endpoint);
            return Err(ClientError::Cancelled);
        }

        let mut exchanges = ExchangeManager::new(self.config.transmission_parameters());
        exchanges.set_duplicate_window(self.config.duplicate_window);
        let observations = ObservationRegistry::new(Some(self.failures_tx.clone()));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let session = Session {
            exchanges: Arc::new(Mutex::new(exchanges)),
            observations: Arc::new(Mutex::new(observations)),
            outbound_tx,
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let dispatcher = Dispatcher::new(
            connection,
            session.exchanges.clone(),
            session.observations.clone(),
            outbound_rx,
            shutdown_rx,
        );
        let dispatch = tokio::spawn(dispatcher.run());

        info!("Connected to {}", self.endpoint);
        *state = ClientState::Connected(Connection {
            session,
            shutdown_tx,
            dispatch,
        });
        Ok(())
    }

    async fn session(&self) -> Result<Session, ClientError> {
        match &*self.state.lock().await {
            ClientState::Connected(connection) => Ok(connection.session.clone()),
            _ => Err(ClientError::NotConnected),
        }
    }

    pub async fn get(&self, path: &str, timeout: Duration) -> Result<Response, ClientError> {
        let request = Message::request(RequestType::Get, path);
        self.request(request, timeout).await
    }

    /// POST `body` tagged with `content_format`, given as a media type (`application/json`)
    /// or a registered number.
    pub async fn post(
        &self,
        path: &str,
        content_format: &str,
        body: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let request = Self::request_with_body(RequestType::Post, path, content_format, body)?;
        self.request(request, timeout).await
    }

    pub async fn put(
        &self,
        path: &str,
        content_format: &str,
        body: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let request = Self::request_with_body(RequestType::Put, path, content_format, body)?;
        self.request(request, timeout).await
    }

    pub async fn delete(&self, path: &str, timeout: Duration) -> Result<Response, ClientError> {
        let request = Message::request(RequestType::Delete, path);
        self.request(request, timeout).await
    }

    fn request_with_body(
        method: RequestType,
        path: &str,
        content_format: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Message, ClientError> {
        let content_format = ContentFormat::from_str(content_format)?;
        let mut request = Message::request(method, path);
        request.set_content_format(content_format.0);
        request.payload = body.into();
        Ok(request)
    }

    async fn request(&self, request: Message, timeout: Duration) -> Result<Response, ClientError> {
        let session = self.session().await?;
        let reply = Self::execute(&session, request, timeout).await?;
        Ok(Response::from_message(reply))
    }

    /// Runs one Confirmable exchange bounded by `timeout`.  Whichever of the caller's timeout
    /// and the retransmission budget runs out first decides the error.
    async fn execute(
        session: &Session,
        request: Message,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let pending = session
            .exchanges
            .lock()
            .await
            .send_reliably(request, session.outbound_tx.clone())?;
        let token = pending.token().to_vec();
        let result = time::timeout(timeout, pending.into_future()).await;
        session.exchanges.lock().await.forget(&token);
        match result {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }

    /// Subscribes to `path` for `timeout`.  `callback` sees every fresh notification, starting
    /// with the response to the registering GET.  The observation is passively cancelled once
    /// `timeout` has elapsed since this call, unless the handle is cancelled, the client is
    /// closed or the server ends it first.
    pub async fn observe<F>(
        &self,
        path: &str,
        timeout: Duration,
        callback: F,
    ) -> Result<ObservationHandle, ClientError>
    where
        F: FnMut(Notification) -> anyhow::Result<()> + Send + 'static,
    {
        let started = time::Instant::now();
        let session = self.session().await?;
        let token = session.exchanges.lock().await.generate_token();

        // Registered before the GET goes out so the first response cannot be missed.
        let registered = session.observations.lock().await.register(
            token.clone(),
            path.to_string(),
            Box::new(callback),
        );
        if !registered {
            return Err(ClientError::Cancelled);
        }

        let mut request = Message::request(RequestType::Get, path);
        request.token = token.clone();
        request.set_observe(u24::MIN);

        let response = match Self::execute(&session, request, timeout).await {
            Ok(response) => response,
            Err(e) => {
                session.observations.lock().await.cancel(&token);
                return Err(e);
            }
        };
        if !is_success_code(response.code) || response.observe().is_none() {
            session.observations.lock().await.cancel(&token);
            return Err(ClientError::ObservationRefused {
                code: response.code,
            });
        }

        let handle = ObservationHandle::new(token, path.to_string(), &session.observations);
        let lifetime = timeout.saturating_sub(started.elapsed());
        drop(handle.clone().cancel_after(lifetime));
        Ok(handle)
    }

    /// Cancels every outstanding exchange and observation, then releases the transport.  Safe
    /// to call in any state; closing a closed client does nothing.
    pub async fn close(&self) -> Result<(), ClientError> {
        let connection = {
            let mut state = self.state.lock().await;
            match mem::replace(&mut *state, ClientState::Closing) {
                ClientState::Connected(connection) => connection,
                ClientState::Closing => return Ok(()),
                ClientState::Disconnected | ClientState::Connecting | ClientState::Closed => {
                    *state = ClientState::Closed;
                    return Ok(());
                }
            }
        };

        let Connection {
            session,
            shutdown_tx,
            dispatch,
        } = connection;
        session.exchanges.lock().await.close_all();
        session.observations.lock().await.clear();
        let _ = shutdown_tx.send(());
        let result = dispatch.await;

        *self.state.lock().await = ClientState::Closed;
        info!("Closed connection to {}", self.endpoint);
        result.map_err(|e| {
            error!("Dispatch task failed: {e}");
            ClientError::InternalError(e.to_string())
        })
    }
}

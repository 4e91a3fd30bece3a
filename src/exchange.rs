use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::anyhow;
use coap_lite::MessageType;
use log::{debug, warn};
use rand::{Rng, RngCore};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::config::DEFAULT_DUPLICATE_WINDOW;
use crate::message::{EncodeError, Message, MessageId, MAX_TOKEN_LEN};

pub type Token = Vec<u8>;

/// Tracks outstanding Confirmable requests, matches replies to them by message ID and token,
/// and remembers recently received message IDs so that peer retransmissions are not dispatched
/// twice.
pub struct ExchangeManager {
    next_message_id: MessageId,
    exchanges: HashMap<Token, ExchangeEntry>,
    tokens_by_message_id: HashMap<MessageId, Token>,
    recent_inbound: HashMap<MessageId, RecentInbound>,
    duplicate_window: Duration,
    parameters: TransmissionParameters,
    shutdown: Option<ExchangeEvent>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransmissionParameters {
    ack_timeout: Duration,
    ack_random_factor: f32,
    max_retransmit: usize,
}

struct ExchangeEntry {
    message_id: MessageId,
    reply_tx: watch::Sender<ExchangeEvent>,
}

struct RecentInbound {
    received_at: Instant,
    reply: Option<Message>,
}

/// Result of checking an inbound Confirmable/Non-confirmable message against recently seen
/// message IDs.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundStatus {
    New,
    /// Seen before within the duplicate window.  Carries whatever was sent back the first time
    /// so that it can be repeated without processing the message again.
    Duplicate(Option<Message>),
}

#[derive(Debug, Clone)]
enum ExchangeEvent {
    Pending,
    /// Empty ACK received: stop retransmitting and wait for the separate response.
    Acknowledged,
    Completed(Message),
    Rejected,
    Cancelled,
    TransportClosed(String),
}

impl ExchangeManager {
    pub fn new(parameters: TransmissionParameters) -> Self {
        Self {
            next_message_id: rand::thread_rng().gen(),
            exchanges: HashMap::new(),
            tokens_by_message_id: HashMap::new(),
            recent_inbound: HashMap::new(),
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
            parameters,
            shutdown: None,
        }
    }

    pub fn set_duplicate_window(&mut self, window: Duration) {
        self.duplicate_window = window;
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn contains(&self, token: &[u8]) -> bool {
        self.exchanges.contains_key(token)
    }

    /// Fresh random token that no outstanding exchange is using.
    pub fn generate_token(&self) -> Token {
        let mut rng = rand::thread_rng();
        loop {
            let mut token = vec![0u8; MAX_TOKEN_LEN];
            rng.fill_bytes(&mut token);
            if !self.exchanges.contains_key(&token) {
                return token;
            }
        }
    }

    /// Registers `message` as a new Confirmable exchange and returns the future that drives its
    /// retransmission.  The message type and ID are overwritten and, if the message carries no
    /// token, a fresh one is allocated.
    pub fn send_reliably(
        &mut self,
        mut message: Message,
        packet_tx: UnboundedSender<Message>,
    ) -> Result<PendingExchange, ExchangeError> {
        match &self.shutdown {
            Some(ExchangeEvent::TransportClosed(reason)) => {
                return Err(ExchangeError::TransportClosed(reason.clone()))
            }
            Some(_) => return Err(ExchangeError::Cancelled),
            None => {}
        }
        message.validate()?;

        if message.token.is_empty() {
            message.token = self.generate_token();
        } else if self.exchanges.contains_key(&message.token) {
            return Err(ExchangeError::InternalError(format!(
                "token {:02x?} is already in use",
                message.token
            )));
        }
        message.message_type = MessageType::Confirmable;
        message.message_id = self.allocate_message_id();

        let (reply_tx, reply_rx) = watch::channel(ExchangeEvent::Pending);
        self.tokens_by_message_id
            .insert(message.message_id, message.token.clone());
        self.exchanges.insert(
            message.token.clone(),
            ExchangeEntry {
                message_id: message.message_id,
                reply_tx,
            },
        );

        Ok(PendingExchange {
            message,
            packet_tx,
            parameters: self.parameters,
            reply_rx,
        })
    }

    fn allocate_message_id(&mut self) -> MessageId {
        loop {
            let message_id = self.next_message_id;
            self.next_message_id = self.next_message_id.wrapping_add(1);
            if !self.tokens_by_message_id.contains_key(&message_id) {
                return message_id;
            }
        }
    }

    /// Attempts to resolve an outstanding exchange with `message`.  Hands the message back if
    /// it does not belong to any exchange (unknown token or message ID, or a request from the
    /// peer).
    pub fn maybe_handle_reply(&mut self, message: Message) -> Result<(), Message> {
        match message.message_type {
            MessageType::Acknowledgement | MessageType::Reset => self.handle_ack_or_reset(message),
            MessageType::Confirmable | MessageType::NonConfirmable if message.is_response() => {
                match self.exchanges.remove(&message.token) {
                    Some(entry) => {
                        self.tokens_by_message_id.remove(&entry.message_id);
                        let _ = entry.reply_tx.send(ExchangeEvent::Completed(message));
                        Ok(())
                    }
                    None => Err(message),
                }
            }
            _ => Err(message),
        }
    }

    fn handle_ack_or_reset(&mut self, message: Message) -> Result<(), Message> {
        let token = match self.tokens_by_message_id.remove(&message.message_id) {
            Some(token) => token,
            None => return Err(message),
        };

        if message.message_type == MessageType::Reset {
            if let Some(entry) = self.exchanges.remove(&token) {
                let _ = entry.reply_tx.send(ExchangeEvent::Rejected);
            }
            return Ok(());
        }

        if message.is_empty() {
            if let Some(entry) = self.exchanges.get(&token) {
                let _ = entry.reply_tx.send(ExchangeEvent::Acknowledged);
            }
            return Ok(());
        }

        if message.token != token {
            warn!(
                "Piggybacked response for message ID {} carries token {:02x?}, expected {token:02x?}",
                message.message_id, message.token
            );
            if let Some(entry) = self.exchanges.get(&token) {
                let _ = entry.reply_tx.send(ExchangeEvent::Acknowledged);
            }
            return Ok(());
        }

        if let Some(entry) = self.exchanges.remove(&token) {
            let _ = entry.reply_tx.send(ExchangeEvent::Completed(message));
        }
        Ok(())
    }

    /// Records an inbound Confirmable/Non-confirmable message ID and reports whether the same ID
    /// was already seen within the duplicate window.
    pub fn check_inbound(&mut self, message_id: MessageId) -> InboundStatus {
        let now = Instant::now();
        let window = self.duplicate_window;
        self.recent_inbound
            .retain(|_, seen| now.saturating_duration_since(seen.received_at) < window);
        if let Some(seen) = self.recent_inbound.get(&message_id) {
            return InboundStatus::Duplicate(seen.reply.clone());
        }
        self.recent_inbound.insert(
            message_id,
            RecentInbound {
                received_at: now,
                reply: None,
            },
        );
        InboundStatus::New
    }

    /// Remembers the ACK or RST sent for an inbound message so a retransmission of it gets the
    /// same answer.
    pub fn record_reply(&mut self, message_id: MessageId, reply: &Message) {
        if let Some(seen) = self.recent_inbound.get_mut(&message_id) {
            seen.reply = Some(reply.clone());
        }
    }

    /// Drops an exchange whose caller has stopped waiting (timed out or resolved).  Any later
    /// reply for it is treated as unknown.  Idempotent.
    pub fn forget(&mut self, token: &[u8]) -> bool {
        match self.exchanges.remove(token) {
            Some(entry) => {
                self.tokens_by_message_id.remove(&entry.message_id);
                debug!("Abandoned exchange for token {token:02x?}");
                true
            }
            None => false,
        }
    }

    /// Resolves every outstanding exchange with `Cancelled` and refuses new ones.
    pub fn close_all(&mut self) {
        self.shutdown_with(ExchangeEvent::Cancelled);
    }

    /// Fails every outstanding exchange because the connection is gone.
    pub fn fail_all(&mut self, reason: String) {
        self.shutdown_with(ExchangeEvent::TransportClosed(reason));
    }

    fn shutdown_with(&mut self, event: ExchangeEvent) {
        if self.shutdown.is_some() {
            return;
        }
        for (_, entry) in self.exchanges.drain() {
            let _ = entry.reply_tx.send(event.clone());
        }
        self.tokens_by_message_id.clear();
        self.shutdown = Some(event);
    }
}

/// Default values come from the
/// [CoAP RFC](https://datatracker.ietf.org/doc/html/rfc7252#section-4.8.2).
impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

impl TransmissionParameters {
    pub fn new(
        ack_timeout: Duration,
        ack_random_factor: f32,
        max_retransmit: usize,
    ) -> anyhow::Result<Self> {
        if ack_random_factor < 1.0 {
            return Err(anyhow!("Invalid ack_random_factor={ack_random_factor}"));
        }
        if ack_timeout.is_zero() {
            return Err(anyhow!("Invalid ack_timeout={ack_timeout:?}"));
        }
        Ok(Self {
            ack_timeout,
            ack_random_factor,
            max_retransmit,
        })
    }

    pub fn ack_timeout_range(&self) -> RangeInclusive<Duration> {
        let timeout_low = self.ack_timeout;
        if self.ack_random_factor != 1.0 {
            let timeout_high = timeout_low.mul_f32(self.ack_random_factor);
            timeout_low..=timeout_high
        } else {
            timeout_low..=timeout_low
        }
    }

    pub fn max_retransmit(&self) -> usize {
        self.max_retransmit
    }
}

/// One Confirmable request in flight.  Owns the retransmission schedule; resolution arrives
/// through the [`ExchangeManager`] that created it.
#[must_use = "don't forget to call into_future() and await it!"]
pub struct PendingExchange {
    message: Message,
    packet_tx: UnboundedSender<Message>,
    parameters: TransmissionParameters,
    reply_rx: watch::Receiver<ExchangeEvent>,
}

enum Step {
    Wait,
    Acknowledged,
    Done(Result<Message, ExchangeError>),
}

impl PendingExchange {
    pub fn message_id(&self) -> MessageId {
        self.message.message_id
    }

    pub fn token(&self) -> &[u8] {
        &self.message.token
    }

    /// Sends the request, retransmitting with exponential backoff until it is acknowledged or
    /// the retransmission budget runs out, then waits for the response.
    pub async fn into_future(self) -> Result<Message, ExchangeError> {
        let Self {
            message,
            packet_tx,
            parameters,
            mut reply_rx,
        } = self;

        let mut next_timeout = rand::thread_rng().gen_range(parameters.ack_timeout_range());
        for attempt in 0..=parameters.max_retransmit {
            if attempt > 0 {
                let message_id = message.message_id;
                debug!("Attempting retransmission #{attempt} of message ID {message_id}");
            }
            packet_tx.send(message.clone()).map_err(|_| {
                ExchangeError::TransportClosed("dispatch loop has stopped".to_string())
            })?;
            let timeout = time::sleep(next_timeout);
            tokio::pin!(timeout);
            next_timeout *= 2;
            loop {
                tokio::select! {
                    changed = reply_rx.changed() => {
                        if changed.is_err() {
                            return Err(ExchangeError::Cancelled);
                        }
                        let event = reply_rx.borrow().clone();
                        match Self::step(event) {
                            Step::Wait => {}
                            Step::Acknowledged => return Self::await_separate_response(reply_rx).await,
                            Step::Done(result) => return result,
                        }
                    }
                    _ = &mut timeout => break,
                }
            }
        }
        Err(ExchangeError::NoReply(parameters.max_retransmit + 1))
    }

    async fn await_separate_response(
        mut reply_rx: watch::Receiver<ExchangeEvent>,
    ) -> Result<Message, ExchangeError> {
        loop {
            if reply_rx.changed().await.is_err() {
                return Err(ExchangeError::Cancelled);
            }
            let event = reply_rx.borrow().clone();
            if let Step::Done(result) = Self::step(event) {
                return result;
            }
        }
    }

    fn step(event: ExchangeEvent) -> Step {
        match event {
            ExchangeEvent::Pending => Step::Wait,
            ExchangeEvent::Acknowledged => Step::Acknowledged,
            ExchangeEvent::Completed(message) => Step::Done(Ok(message)),
            ExchangeEvent::Rejected => Step::Done(Err(ExchangeError::Reset)),
            ExchangeEvent::Cancelled => Step::Done(Err(ExchangeError::Cancelled)),
            ExchangeEvent::TransportClosed(reason) => {
                Step::Done(Err(ExchangeError::TransportClosed(reason)))
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("no remote reply after {0} attempts")]
    NoReply(usize),

    #[error("reset message received")]
    Reset,

    #[error("exchange cancelled")]
    Cancelled,

    #[error("connection closed: {0}")]
    TransportClosed(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("internal error: {0}")]
    InternalError(String),
}

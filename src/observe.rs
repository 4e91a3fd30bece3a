//! Client side of Observe (RFC 7641).
//!
//! Long-lived subscriptions are kept here keyed by token.  The dispatch loop offers every
//! inbound response to the registry, which filters out stale or repeated notifications and
//! runs the owning callback.  Callbacks are invoked on the dispatch task while the registry is
//! locked, so once [`ObservationHandle::cancel`] returns no further invocation can happen.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use coap_lite::MessageType;
use log::{debug, error, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::exchange::Token;
use crate::message::{is_success_code, Message};
use crate::u24::u24;

/// After this long without a notification any sequence number is accepted again (RFC 7641
/// §3.4).
const FRESHNESS_INTERVAL: Duration = Duration::from_secs(128);

/// How far behind the highest delivered sequence number a late notification may still be
/// delivered.
const REORDER_WINDOW: u32 = 1 << 16;

/// Number of recently delivered sequence numbers remembered to suppress repeats.
const RECENT_CAPACITY: usize = 32;

pub type NotificationCallback = Box<dyn FnMut(Notification) -> anyhow::Result<()> + Send>;

/// One notification as handed to an observation callback.  The first one is the response to
/// the registering GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub code: u8,
    pub body: Vec<u8>,
    pub sequence: Option<u24>,
    pub content_format: Option<u16>,
}

/// Reported on the side channel whenever a callback returns an error or panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFailure {
    pub path: String,
    pub token: Token,
    pub reason: String,
}

pub struct ObservationRegistry {
    observations: HashMap<Token, Observation>,
    failures_tx: Option<UnboundedSender<CallbackFailure>>,
    closed: bool,
}

struct Observation {
    path: String,
    callback: NotificationCallback,
    freshness: Option<Freshness>,
}

struct Freshness {
    floor: u24,
    highest: u24,
    recent: VecDeque<u24>,
    last_delivery: Instant,
}

impl Freshness {
    fn new(sequence: u24) -> Self {
        Self {
            floor: sequence,
            highest: sequence,
            recent: VecDeque::from([sequence]),
            last_delivery: Instant::now(),
        }
    }

    fn accept(&mut self, sequence: u24) -> bool {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_delivery) > FRESHNESS_INTERVAL {
            *self = Self::new(sequence);
            return true;
        }
        if sequence != self.floor && !sequence.is_fresher_than(self.floor) {
            return false;
        }
        if self.recent.contains(&sequence) {
            return false;
        }

        if sequence.is_fresher_than(self.highest) {
            self.highest = sequence;
            if u32::from(self.highest.wrapping_sub(self.floor)) > REORDER_WINDOW {
                self.floor = self
                    .highest
                    .wrapping_sub(u24::try_from(REORDER_WINDOW).unwrap_or(u24::MAX));
            }
        }
        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(sequence);
        self.last_delivery = now;
        true
    }
}

impl ObservationRegistry {
    pub fn new(failures_tx: Option<UnboundedSender<CallbackFailure>>) -> Self {
        Self {
            observations: HashMap::new(),
            failures_tx,
            closed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn contains(&self, token: &[u8]) -> bool {
        self.observations.contains_key(token)
    }

    /// Adds a subscription.  Returns false once the registry has been closed.
    pub fn register(&mut self, token: Token, path: String, callback: NotificationCallback) -> bool {
        if self.closed {
            return false;
        }
        debug!("Registered observation of {path} with token {token:02x?}");
        self.observations.insert(
            token,
            Observation {
                path,
                callback,
                freshness: None,
            },
        );
        true
    }

    /// Offers an inbound message to the registry.  Returns true if the token belongs to an
    /// active observation, whether or not the notification was fresh enough to deliver.
    pub fn maybe_notify(&mut self, message: &Message) -> bool {
        if message.message_type == MessageType::Reset || !message.is_response() {
            return false;
        }
        let observation = match self.observations.get_mut(&message.token) {
            Some(observation) => observation,
            None => return false,
        };

        let sequence = message.observe();
        let established = observation.freshness.is_some();
        let terminal = !is_success_code(message.code) || sequence.is_none();

        if let (false, Some(sequence)) = (terminal, sequence) {
            match &mut observation.freshness {
                Some(freshness) => {
                    if !freshness.accept(sequence) {
                        debug!(
                            "Dropping stale notification #{sequence} for {}",
                            observation.path
                        );
                        return true;
                    }
                }
                None => observation.freshness = Some(Freshness::new(sequence)),
            }
        }

        let notification = Notification {
            code: message.code,
            body: message.payload.clone(),
            sequence,
            content_format: message.content_format(),
        };
        self.invoke(&message.token, notification);

        if terminal {
            if let Some(observation) = self.observations.remove(&message.token) {
                let code = message.code;
                if established {
                    debug!(
                        "Observation of {} ended by server (code {})",
                        observation.path,
                        crate::message::code_string(code)
                    );
                } else {
                    warn!(
                        "Server declined to observe {} (code {})",
                        observation.path,
                        crate::message::code_string(code)
                    );
                }
            }
        }
        true
    }

    fn invoke(&mut self, token: &[u8], notification: Notification) {
        let observation = match self.observations.get_mut(token) {
            Some(observation) => observation,
            None => return,
        };
        let callback = &mut observation.callback;
        let reason = match panic::catch_unwind(AssertUnwindSafe(|| callback(notification))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => panic_message(panic),
        };
        error!(
            "Observation callback for {} failed: {reason}",
            observation.path
        );
        if let Some(failures_tx) = &self.failures_tx {
            let _ = failures_tx.send(CallbackFailure {
                path: observation.path.clone(),
                token: token.to_vec(),
                reason,
            });
        }
    }

    /// Removes the subscription.  Nothing is sent to the server; later notifications for the
    /// token are treated as unknown.
    pub fn cancel(&mut self, token: &[u8]) -> bool {
        match self.observations.remove(token) {
            Some(observation) => {
                debug!("Cancelled observation of {}", observation.path);
                true
            }
            None => false,
        }
    }

    /// Drops every subscription and refuses new ones.
    pub fn clear(&mut self) {
        self.closed = true;
        self.observations.clear();
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Returned by `observe`.  Dropping the handle leaves the subscription running; call
/// [`ObservationHandle::cancel`] to end it.
#[derive(Clone)]
pub struct ObservationHandle {
    token: Token,
    path: String,
    registry: Weak<Mutex<ObservationRegistry>>,
}

impl ObservationHandle {
    pub(crate) fn new(token: Token, path: String, registry: &Arc<Mutex<ObservationRegistry>>) -> Self {
        Self {
            token,
            path,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn is_active(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.lock().await.contains(&self.token),
            None => false,
        }
    }

    /// Ends the subscription.  Returns false if it had already ended.
    pub async fn cancel(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.lock().await.cancel(&self.token),
            None => false,
        }
    }

    /// Cancels the subscription once `lifetime` has elapsed.
    pub fn cancel_after(self, lifetime: Duration) -> JoinHandle<bool> {
        tokio::spawn(async move {
            time::sleep(lifetime).await;
            self.cancel().await
        })
    }
}

impl fmt::Debug for ObservationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationHandle")
            .field("token", &self.token)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use coap_lite::{MessageClass, ResponseType};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    const TOKEN: [u8; 4] = [1, 2, 3, 4];

    fn notification(sequence: Option<u32>, code: ResponseType) -> Message {
        let mut message = Message::new(MessageType::NonConfirmable, MessageClass::Response(code));
        message.token = TOKEN.to_vec();
        if let Some(sequence) = sequence {
            message.set_observe(u24::try_from(sequence).unwrap());
        }
        message.payload = format!("{sequence:?}").into_bytes();
        message
    }

    fn recording_registry() -> (ObservationRegistry, Arc<StdMutex<Vec<u32>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let mut registry = ObservationRegistry::new(None);
        let sink = seen.clone();
        registry.register(
            TOKEN.to_vec(),
            "/obs".to_string(),
            Box::new(move |n: Notification| {
                sink.lock().unwrap().push(n.sequence.map(u32::from).unwrap_or(u32::MAX));
                Ok(())
            }),
        );
        (registry, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_notification_dropped() {
        let (mut registry, seen) = recording_registry();
        for sequence in [3, 1, 5, 4] {
            assert!(registry.maybe_notify(&notification(Some(sequence), ResponseType::Content)));
        }
        assert_eq!(*seen.lock().unwrap(), vec![3, 5, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_suppressed() {
        let (mut registry, seen) = recording_registry();
        for sequence in [7, 8, 8, 7, 9] {
            registry.maybe_notify(&notification(Some(sequence), ResponseType::Content));
        }
        assert_eq!(*seen.lock().unwrap(), vec![7, 8, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_is_fresh() {
        let (mut registry, seen) = recording_registry();
        for sequence in [0xfffffe, 0xffffff, 0, 1] {
            registry.maybe_notify(&notification(Some(sequence), ResponseType::Content));
        }
        assert_eq!(*seen.lock().unwrap(), vec![0xfffffe, 0xffffff, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_sequence_accepted_after_quiet_period() {
        let (mut registry, seen) = recording_registry();
        registry.maybe_notify(&notification(Some(100), ResponseType::Content));
        time::sleep(FRESHNESS_INTERVAL + Duration::from_secs(1)).await;
        registry.maybe_notify(&notification(Some(2), ResponseType::Content));
        assert_eq!(*seen.lock().unwrap(), vec![100, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_code_ends_observation() {
        let (mut registry, seen) = recording_registry();
        registry.maybe_notify(&notification(Some(1), ResponseType::Content));
        registry.maybe_notify(&notification(None, ResponseType::NotFound));
        assert!(!registry.contains(&TOKEN));
        assert!(!registry.maybe_notify(&notification(Some(2), ResponseType::Content)));
        assert_eq!(*seen.lock().unwrap(), vec![1, u32::MAX]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_response_without_observe_delivered_then_removed() {
        let (mut registry, seen) = recording_registry();
        assert!(registry.maybe_notify(&notification(None, ResponseType::Content)));
        assert!(!registry.contains(&TOKEN));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_delivery() {
        let (mut registry, seen) = recording_registry();
        registry.maybe_notify(&notification(Some(1), ResponseType::Content));
        assert!(registry.cancel(&TOKEN));
        assert!(!registry.cancel(&TOKEN));
        assert!(!registry.maybe_notify(&notification(Some(2), ResponseType::Content)));
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_failures_isolated() {
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let mut registry = ObservationRegistry::new(Some(failures_tx));
        let calls = Arc::new(StdMutex::new(0));
        let counter = calls.clone();
        registry.register(
            TOKEN.to_vec(),
            "/flaky".to_string(),
            Box::new(move |n: Notification| {
                *counter.lock().unwrap() += 1;
                match n.sequence.map(u32::from) {
                    Some(1) => Err(anyhow!("bad payload")),
                    Some(2) => panic!("boom"),
                    _ => Ok(()),
                }
            }),
        );
        for sequence in [1, 2, 3] {
            registry.maybe_notify(&notification(Some(sequence), ResponseType::Content));
        }

        assert_eq!(*calls.lock().unwrap(), 3);
        assert!(registry.contains(&TOKEN));
        let first = failures_rx.recv().await.unwrap();
        assert_eq!(first.path, "/flaky");
        assert_eq!(first.reason, "bad payload");
        let second = failures_rx.recv().await.unwrap();
        assert_eq!(second.reason, "panicked: boom");
        assert!(failures_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_cancel_after() {
        let (registry, seen) = recording_registry();
        let registry = Arc::new(Mutex::new(registry));
        let handle = ObservationHandle::new(TOKEN.to_vec(), "/obs".to_string(), &registry);
        assert!(handle.is_active().await);

        let task = handle.clone().cancel_after(Duration::from_secs(30));
        registry
            .lock()
            .await
            .maybe_notify(&notification(Some(1), ResponseType::Content));
        assert!(task.await.unwrap());
        assert!(!handle.is_active().await);
        assert!(!handle.cancel().await);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_closed_registry_refuses() {
        let mut registry = ObservationRegistry::new(None);
        registry.clear();
        assert!(!registry.register(TOKEN.to_vec(), "/x".to_string(), Box::new(|_| Ok(()))));
    }
}

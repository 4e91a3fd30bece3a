use std::sync::Arc;

use coap_lite::MessageType;
use futures::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, Mutex};

use crate::exchange::{ExchangeManager, InboundStatus};
use crate::message::Message;
use crate::observe::ObservationRegistry;
use crate::transport::{BoxedFramedConnection, FramedItem, TransportError};

/// Single task owning the connection.  Outbound messages arrive over a channel from exchanges
/// and the client; inbound messages are matched against observations and exchanges.  Runs
/// until told to shut down or the connection fails.
pub(crate) struct Dispatcher {
    connection: BoxedFramedConnection,
    exchanges: Arc<Mutex<ExchangeManager>>,
    observations: Arc<Mutex<ObservationRegistry>>,
    outbound_rx: UnboundedReceiver<Message>,
    shutdown_rx: oneshot::Receiver<()>,
    peer: String,
}

impl Dispatcher {
    pub(crate) fn new(
        connection: BoxedFramedConnection,
        exchanges: Arc<Mutex<ExchangeManager>>,
        observations: Arc<Mutex<ObservationRegistry>>,
        outbound_rx: UnboundedReceiver<Message>,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Self {
        let peer = connection.peer();
        Self {
            connection,
            exchanges,
            observations,
            outbound_rx,
            shutdown_rx,
            peer,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    debug!("Dispatch for {} shutting down", self.peer);
                    break;
                }
                Some(message) = self.outbound_rx.recv() => {
                    self.send(message).await;
                }
                item = self.connection.next() => {
                    if !self.handle_rx_event(item).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.connection.close().await {
            debug!("Error closing connection to {}: {e}", self.peer);
        }
    }

    /// Returns false once the connection is no longer usable.
    async fn handle_rx_event(&mut self, item: Option<Result<FramedItem, TransportError>>) -> bool {
        match item {
            Some(Ok(Ok(message))) => {
                trace!("Incoming message from {}: {message:?}", self.peer);
                self.handle_message(message).await;
                true
            }
            Some(Ok(Err(e))) => {
                warn!("Dropping malformed datagram from {}: {e}", self.peer);
                true
            }
            Some(Err(e)) => {
                error!("Connection to {} failed: {e}", self.peer);
                self.exchanges.lock().await.fail_all(e.to_string());
                false
            }
            None => {
                warn!("Connection to {} closed by transport", self.peer);
                self.exchanges
                    .lock()
                    .await
                    .fail_all("connection closed".to_string());
                false
            }
        }
    }

    async fn handle_message(&mut self, message: Message) {
        let message_id = message.message_id;
        let confirmable = message.message_type == MessageType::Confirmable;

        if matches!(
            message.message_type,
            MessageType::Confirmable | MessageType::NonConfirmable
        ) {
            let status = self.exchanges.lock().await.check_inbound(message_id);
            if let InboundStatus::Duplicate(reply) = status {
                debug!("Duplicate message ID {message_id} from {}", self.peer);
                if let Some(reply) = reply {
                    self.send(reply).await;
                }
                return;
            }
        }

        let observed = self.observations.lock().await.maybe_notify(&message);
        let matched = match self.exchanges.lock().await.maybe_handle_reply(message) {
            Ok(()) => true,
            Err(unmatched) => {
                if !observed {
                    debug!("Ignoring unexpected message from {}: {unmatched:?}", self.peer);
                }
                false
            }
        };

        if confirmable {
            let reply = if observed || matched {
                Message::ack_for(message_id)
            } else {
                Message::reset_for(message_id)
            };
            self.exchanges
                .lock()
                .await
                .record_reply(message_id, &reply);
            self.send(reply).await;
        }
    }

    async fn send(&mut self, message: Message) {
        trace!("Outgoing message to {}: {message:?}", self.peer);
        if let Err(e) = self.connection.send(message).await {
            // Lost datagrams are recovered by retransmission.
            warn!("Error sending to {}: {e}", self.peer);
        }
    }
}

use std::time::Duration;

use futures_channel::{mpsc, oneshot};
use futures_util::SinkExt;

use crate::errors::OrtcError;

/// How many events each stream buffers before the driver blocks on it.
///
/// A consumer that stops reading a stream back-pressures the driver once the
/// buffer fills; dropping the stream disables it instead.
const EVENT_QUEUE_CAPACITY: usize = 16;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Tunables for one client instance.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on the WebSocket dial.
    pub connection_timeout: Duration,
    /// Silence threshold after which the watchdog drops the connection.
    pub heartbeat_timeout: Duration,
    /// Wait between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Optional system channel announced in the validate command.
    pub announcement_subchannel: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            announcement_subchannel: None,
        }
    }
}

/// The connection descriptor, kept verbatim for the reconnect loop.
#[derive(Debug, Clone)]
pub(crate) struct ConnectRequest {
    pub application_key: String,
    pub authentication_token: String,
    pub metadata: String,
    /// Cluster (balancer) URL when `is_cluster`, direct service URL otherwise.
    pub url: String,
    pub is_cluster: bool,
    #[allow(dead_code)]
    pub needs_authentication: bool,
}

/// Work submitted by the façade to the driver.
pub(crate) enum Instruction {
    Connect(ConnectRequest),
    Disconnect,
    Subscribe {
        channel: String,
        resubscribe_on_reconnect: bool,
        sink: mpsc::UnboundedSender<ChannelMessage>,
    },
    Unsubscribe { channel: String },
    Send { channel: String, message: String },
    Url { reply: oneshot::Sender<Option<String>> },
}

/// Connection lifecycle. Only `Connected` accepts send / subscribe /
/// unsubscribe, and only `Connected` arms the heartbeat watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Idle,
    Resolving,
    Dialing,
    AwaitingValidate,
    Connected,
    Reconnecting,
    Disconnecting,
}

/// The receiving half of the event dispatch contract: eight independent
/// bounded streams, one per event kind.
///
/// The driver is the single producer and emits in its own temporal order.
/// Consume promptly (a full stream blocks the driver), or drop the streams
/// you do not care about.
pub struct EventStreams {
    /// First successful validation after a user connect
    pub connected: mpsc::Receiver<()>,
    /// Socket closed, by the user or by a fault
    pub disconnected: mpsc::Receiver<()>,
    /// Entering the reconnect wait
    pub reconnecting: mpsc::Receiver<()>,
    /// Successful validation after a drop
    pub reconnected: mpsc::Receiver<()>,
    /// Subscription acknowledged; carries the channel
    pub subscribed: mpsc::Receiver<String>,
    /// Unsubscription acknowledged; carries the channel
    pub unsubscribed: mpsc::Receiver<String>,
    /// Complete (reassembled) messages on every subscribed channel
    pub messages: mpsc::Receiver<ChannelMessage>,
    /// Validation failures, transport faults and server-reported errors
    pub exceptions: mpsc::Receiver<OrtcError>,
}

/// The driver-side sending half of [`EventStreams`].
pub(crate) struct EventSinks {
    connected: mpsc::Sender<()>,
    disconnected: mpsc::Sender<()>,
    reconnecting: mpsc::Sender<()>,
    reconnected: mpsc::Sender<()>,
    subscribed: mpsc::Sender<String>,
    unsubscribed: mpsc::Sender<String>,
    messages: mpsc::Sender<ChannelMessage>,
    exceptions: mpsc::Sender<OrtcError>,
}

impl EventSinks {
    pub(crate) fn new() -> (EventSinks, EventStreams) {
        let (connected_tx, connected_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (disconnected_tx, disconnected_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (reconnecting_tx, reconnecting_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (reconnected_tx, reconnected_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (subscribed_tx, subscribed_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (unsubscribed_tx, unsubscribed_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (messages_tx, messages_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (exceptions_tx, exceptions_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        (
            EventSinks {
                connected: connected_tx,
                disconnected: disconnected_tx,
                reconnecting: reconnecting_tx,
                reconnected: reconnected_tx,
                subscribed: subscribed_tx,
                unsubscribed: unsubscribed_tx,
                messages: messages_tx,
                exceptions: exceptions_tx,
            },
            EventStreams {
                connected: connected_rx,
                disconnected: disconnected_rx,
                reconnecting: reconnecting_rx,
                reconnected: reconnected_rx,
                subscribed: subscribed_rx,
                unsubscribed: unsubscribed_rx,
                messages: messages_rx,
                exceptions: exceptions_rx,
            },
        )
    }

    // A dropped receiver disables its stream; send errors are ignored.
    pub(crate) async fn connected(&mut self) {
        let _ = self.connected.send(()).await;
    }

    pub(crate) async fn disconnected(&mut self) {
        let _ = self.disconnected.send(()).await;
    }

    pub(crate) async fn reconnecting(&mut self) {
        let _ = self.reconnecting.send(()).await;
    }

    pub(crate) async fn reconnected(&mut self) {
        let _ = self.reconnected.send(()).await;
    }

    pub(crate) async fn subscribed(&mut self, channel: String) {
        let _ = self.subscribed.send(channel).await;
    }

    pub(crate) async fn unsubscribed(&mut self, channel: String) {
        let _ = self.unsubscribed.send(channel).await;
    }

    pub(crate) async fn message(&mut self, message: ChannelMessage) {
        let _ = self.messages.send(message).await;
    }

    pub(crate) async fn exception(&mut self, error: OrtcError) {
        tracing::debug!(%error, "raising exception");
        let _ = self.exceptions.send(error).await;
    }
}

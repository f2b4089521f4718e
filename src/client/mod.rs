mod backend;
mod manager;
mod registry;
mod types;

use futures_channel::{mpsc, oneshot};

use manager::Driver;
pub use types::{ChannelMessage, ClientOptions, EventStreams};
use types::{ConnectRequest, Instruction};

/// Handle to one realtime messaging client.
///
/// Creating a client spawns its connection driver; the handle is cheap to
/// clone and every operation is non-blocking. Work is enqueued to the
/// driver, and outcomes (including validation failures) are reported on the
/// [`EventStreams`] returned by [`OrtcClient::new`].
///
/// ```no_run
/// use futures_util::StreamExt;
/// use ortc::OrtcClient;
///
/// # async fn run() {
/// let (client, mut events) = OrtcClient::new();
/// client.connect(
///     "YOUR_APPLICATION_KEY",
///     "myToken",
///     "RustApp",
///     "http://ortc-developers.realtime.co/server/2.1",
///     true,
///     false,
/// );
/// events.connected.next().await;
///
/// let mut my_channel = client.subscribe("my_channel", true);
/// client.send("my_channel", "Hello World!");
/// if let Some(message) = my_channel.next().await {
///     println!("{}: {}", message.channel, message.payload);
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct OrtcClient {
    instructions: mpsc::UnboundedSender<Instruction>,
}

impl OrtcClient {
    /// Creates a client with default timeouts and spawns its driver. Must be
    /// called from within a tokio runtime.
    pub fn new() -> (OrtcClient, EventStreams) {
        Self::with_options(ClientOptions::default())
    }

    /// Creates a client with explicit [`ClientOptions`].
    pub fn with_options(options: ClientOptions) -> (OrtcClient, EventStreams) {
        let (instructions_tx, instructions_rx) = mpsc::unbounded();
        let (sinks, streams) = types::EventSinks::new();
        Driver::new(options, instructions_rx, sinks).spawn();
        (OrtcClient { instructions: instructions_tx }, streams)
    }

    /// Connects to the service named by `url`: the balancer endpoint when
    /// `is_cluster`, a service node otherwise. Returns immediately; watch
    /// the `connected` and `exceptions` streams for the outcome.
    pub fn connect(
        &self,
        application_key: &str,
        authentication_token: &str,
        metadata: &str,
        url: &str,
        is_cluster: bool,
        needs_authentication: bool,
    ) {
        self.instruct(Instruction::Connect(ConnectRequest {
            application_key: application_key.to_string(),
            authentication_token: authentication_token.to_string(),
            metadata: metadata.to_string(),
            url: url.to_string(),
            is_cluster,
            needs_authentication,
        }));
    }

    /// Closes the current connection and stops any reconnect loop.
    pub fn disconnect(&self) {
        self.instruct(Instruction::Disconnect);
    }

    /// Subscribes `channel` and returns its message stream. The stream ends
    /// without ever yielding if the subscription is rejected (watch the
    /// exception stream for the reason).
    pub fn subscribe(
        &self,
        channel: &str,
        resubscribe_on_reconnect: bool,
    ) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (sink, stream) = mpsc::unbounded();
        self.instruct(Instruction::Subscribe {
            channel: channel.to_string(),
            resubscribe_on_reconnect,
            sink,
        });
        stream
    }

    /// Stops receiving messages on `channel`.
    pub fn unsubscribe(&self, channel: &str) {
        self.instruct(Instruction::Unsubscribe { channel: channel.to_string() });
    }

    /// Publishes `message` to `channel`, fragmenting it as needed.
    pub fn send(&self, channel: &str, message: &str) {
        self.instruct(Instruction::Send {
            channel: channel.to_string(),
            message: message.to_string(),
        });
    }

    /// The URL this client connects through: the cluster URL when clustered,
    /// the service URL otherwise. `None` before the first connect.
    pub async fn url(&self) -> Option<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.instruct(Instruction::Url { reply: reply_tx });
        reply_rx.await.ok().flatten()
    }

    // failure means the driver is gone, which only happens at shutdown
    fn instruct(&self, instruction: Instruction) {
        let _ = self.instructions.unbounded_send(instruction);
    }
}

impl std::fmt::Debug for OrtcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtcClient").finish_non_exhaustive()
    }
}

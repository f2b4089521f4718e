use futures_channel::mpsc;
use futures_util::{select_biased, FutureExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use url::Url;

use super::{
    backend::{BackendHandle, WsBackend},
    registry::{ChannelSubscription, PermissionCache, SubscriptionRegistry},
    types::{ChannelMessage, ClientOptions, ConnectRequest, ConnectionState, EventSinks, Instruction},
};
use crate::{
    errors::OrtcError,
    protocol::{
        frame::{self, Frame, Operation, ServerErrorOperation},
        multipart::{self, MultiPartBuffer},
    },
    rest::balancer,
    utils,
};

const MAX_CHANNEL_SIZE: usize = 100;
const MAX_CONNECTION_METADATA_SIZE: usize = 256;

const DIAL_FAILURE: &str = "Could not connect. Check if the server is running correctly";

/// The connection driver. Exactly one per client; owns the socket backend,
/// the subscription registry, the permission cache and the reassembly
/// buffer, and is the single producer of every event stream.
///
/// The façade talks to it over an unbounded instruction channel; the driver
/// drops when the last façade clone does.
pub(crate) struct Driver {
    options: ClientOptions,
    instructions: mpsc::UnboundedReceiver<Instruction>,
    events: EventSinks,

    state: ConnectionState,
    // the current attempt belongs to the reconnect loop
    reconnecting: bool,
    // original connect parameters, kept for reconnects
    conn: Option<ConnectRequest>,
    // service URL after balancer resolution
    server_url: Option<String>,

    backend: Option<BackendHandle>,
    registry: SubscriptionRegistry,
    permissions: PermissionCache,
    buffer: MultiPartBuffer,
    last_heartbeat: Instant,
}

// What woke the driver up in an active step.
enum Wake {
    Frame(String),
    BackendGone,
    Watchdog,
    Instruction(Option<Instruction>),
}

impl Driver {
    pub(crate) fn new(
        options: ClientOptions,
        instructions: mpsc::UnboundedReceiver<Instruction>,
        events: EventSinks,
    ) -> Self {
        Self {
            options,
            instructions,
            events,
            state: ConnectionState::Idle,
            reconnecting: false,
            conn: None,
            server_url: None,
            backend: None,
            registry: SubscriptionRegistry::default(),
            permissions: PermissionCache::default(),
            buffer: MultiPartBuffer::default(),
            last_heartbeat: Instant::now(),
        }
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        loop {
            let keep_going = if self.backend.is_some() {
                self.step_active().await
            } else if self.state == ConnectionState::Reconnecting {
                self.step_reconnect_wait().await
            } else {
                match self.instructions.next().await {
                    Some(instruction) => {
                        self.handle_instruction(instruction).await;
                        true
                    }
                    None => false,
                }
            };
            if !keep_going {
                break;
            }
        }
        debug!("all client handles dropped, driver exiting");
        if let Some(backend) = self.backend.take() {
            backend.shutdown();
        }
    }

    /// One step with a live socket: frames first, then faults, then the
    /// watchdog, then new instructions.
    async fn step_active(&mut self) -> bool {
        let connected = self.state == ConnectionState::Connected;
        let deadline = self.last_heartbeat + self.options.heartbeat_timeout;
        let wake = {
            let Some(backend) = self.backend.as_mut() else { return true };
            let watchdog = async move {
                if connected {
                    tokio::time::sleep_until(deadline).await
                } else {
                    futures_util::future::pending::<()>().await
                }
            }
            .fuse();
            futures_util::pin_mut!(watchdog);
            select_biased! {
                frame = backend.frames.next() => match frame {
                    Some(frame) => Wake::Frame(frame),
                    None => Wake::BackendGone,
                },
                _ = &mut backend.error => Wake::BackendGone,
                _ = watchdog => Wake::Watchdog,
                instruction = self.instructions.next() => Wake::Instruction(instruction),
            }
        };

        match wake {
            Wake::Frame(frame) => {
                self.handle_frame(&frame).await;
                true
            }
            Wake::BackendGone => {
                self.socket_dropped().await;
                true
            }
            Wake::Watchdog => {
                if self.last_heartbeat.elapsed() >= self.options.heartbeat_timeout {
                    warn!("heartbeat timeout, dropping the connection");
                    self.socket_dropped().await;
                }
                true
            }
            Wake::Instruction(Some(instruction)) => {
                self.handle_instruction(instruction).await;
                true
            }
            Wake::Instruction(None) => false,
        }
    }

    /// One step of the reconnect loop: wait out the interval, then emit
    /// `Reconnecting` and retry. Instructions (notably disconnect) abort the
    /// wait.
    async fn step_reconnect_wait(&mut self) -> bool {
        let wake = {
            let delay = tokio::time::sleep(self.options.reconnect_interval).fuse();
            futures_util::pin_mut!(delay);
            select_biased! {
                _ = delay => None,
                instruction = self.instructions.next() => Some(instruction),
            }
        };

        match wake {
            None => {
                self.events.reconnecting().await;
                self.establish().await;
                true
            }
            Some(Some(instruction)) => {
                self.handle_instruction(instruction).await;
                true
            }
            Some(None) => false,
        }
    }

    async fn handle_instruction(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::Connect(request) => self.handle_connect(request).await,
            Instruction::Disconnect => self.handle_disconnect().await,
            Instruction::Subscribe { channel, resubscribe_on_reconnect, sink } => {
                self.handle_subscribe(channel, resubscribe_on_reconnect, sink).await
            }
            Instruction::Unsubscribe { channel } => self.handle_unsubscribe(channel).await,
            Instruction::Send { channel, message } => self.handle_send(channel, message).await,
            Instruction::Url { reply } => {
                let _ = reply.send(self.current_url());
            }
        }
    }

    async fn handle_connect(&mut self, request: ConnectRequest) {
        if self.state == ConnectionState::Connected {
            self.events.exception(OrtcError::AlreadyConnected).await;
            return;
        }
        if request.url.is_empty() {
            self.events.exception(OrtcError::EmptyField("URL")).await;
            self.events.exception(OrtcError::EmptyField("Cluster URL")).await;
            return;
        }
        if request.application_key.is_empty() {
            self.events.exception(OrtcError::EmptyField("Application key")).await;
            return;
        }
        if request.authentication_token.is_empty() {
            self.events.exception(OrtcError::EmptyField("Authentication key")).await;
            return;
        }
        if !request.is_cluster && !utils::is_valid_url(&request.url) {
            self.events.exception(OrtcError::InvalidCharacters("URL")).await;
            return;
        }
        if request.is_cluster && !utils::is_valid_url(&request.url) {
            self.events.exception(OrtcError::InvalidCharacters("Cluster URL")).await;
            return;
        }
        if !utils::is_valid_input(&request.application_key) {
            self.events.exception(OrtcError::InvalidCharacters("Application key")).await;
            return;
        }
        if !utils::is_valid_input(&request.authentication_token) {
            self.events.exception(OrtcError::InvalidCharacters("Authentication token")).await;
            return;
        }
        if let Some(subchannel) = &self.options.announcement_subchannel {
            if !subchannel.is_empty() && !utils::is_valid_input(subchannel) {
                self.events.exception(OrtcError::InvalidCharacters("Announcement Subchannel")).await;
                return;
            }
        }
        if request.metadata.len() > MAX_CONNECTION_METADATA_SIZE {
            self.events
                .exception(OrtcError::MaxLength("Connection metadata", MAX_CONNECTION_METADATA_SIZE))
                .await;
            return;
        }
        if self.state != ConnectionState::Idle {
            self.events
                .exception(OrtcError::NotConnected("Already trying to connect".to_string()))
                .await;
            return;
        }

        self.conn = Some(request);
        self.reconnecting = false;
        self.establish().await;
    }

    /// One connection attempt: balancer resolution, then the dial. Runs for
    /// both user connects and reconnect retries.
    async fn establish(&mut self) {
        let Some(request) = self.conn.clone() else {
            self.state = ConnectionState::Idle;
            return;
        };

        self.state = ConnectionState::Resolving;
        let server_url = if request.is_cluster {
            match balancer::resolve(&request.url, &request.application_key).await {
                Ok(url) => url,
                Err(err) => {
                    error!(err = %err, "balancer lookup failed");
                    self.events.exception(err).await;
                    self.attempt_failed();
                    return;
                }
            }
        } else {
            request.url.clone()
        };

        let connection_url = match build_connection_url(&server_url) {
            Ok(url) => url,
            Err(err) => {
                self.events.exception(err).await;
                self.attempt_failed();
                return;
            }
        };
        self.server_url = Some(server_url);

        self.state = ConnectionState::Dialing;
        debug!(url = %connection_url, "dialing service node");
        match WsBackend::connect(&connection_url, self.options.connection_timeout).await {
            Ok((backend, handle)) => {
                backend.spawn();
                self.backend = Some(handle);
                self.last_heartbeat = Instant::now();
                self.state = ConnectionState::AwaitingValidate;
            }
            Err(err) => {
                debug!(err = %err, "dial failed");
                self.events.exception(OrtcError::NotConnected(DIAL_FAILURE.to_string())).await;
                self.attempt_failed();
            }
        }
    }

    fn attempt_failed(&mut self) {
        if self.reconnecting {
            // stay in the loop; the next wait emits Reconnecting again
            self.state = ConnectionState::Reconnecting;
        } else {
            self.state = ConnectionState::Idle;
        }
    }

    async fn handle_frame(&mut self, raw: &str) {
        self.last_heartbeat = Instant::now();
        let frame = match frame::parse_frame(raw) {
            Ok(frame) => frame,
            Err(err) => {
                error!(err = %err, "protocol error on inbound frame");
                self.events.exception(err).await;
                self.socket_dropped().await;
                return;
            }
        };
        match frame {
            Frame::Heartbeat => trace!("heartbeat"),
            Frame::Open => self.send_validate().await,
            Frame::Operation { op: Operation::Validated, body } => {
                self.handle_validated(&body).await
            }
            Frame::Operation { op: Operation::Subscribed, body } => {
                self.handle_subscribed_ack(&body).await
            }
            Frame::Operation { op: Operation::Unsubscribed, body } => {
                self.handle_unsubscribed_ack(&body).await
            }
            Frame::Operation { op: Operation::Error, body } => {
                self.handle_server_error(&body).await
            }
            Frame::Received { channel, payload } => self.handle_received(channel, payload).await,
        }
    }

    async fn send_validate(&mut self) {
        let Some(request) = self.conn.as_ref() else { return };
        let command = frame::validate_command(
            &request.application_key,
            &request.authentication_token,
            self.options.announcement_subchannel.as_deref().unwrap_or(""),
            &request.metadata,
        );
        self.dispatch(command).await;
    }

    async fn handle_validated(&mut self, body: &str) {
        let grants = frame::permissions_from_body(body);
        debug!(grants = grants.len(), "connection validated");
        self.permissions.replace(grants);
        self.state = ConnectionState::Connected;
        self.last_heartbeat = Instant::now();

        if self.reconnecting {
            self.reconnecting = false;
            self.events.reconnected().await;
            self.resubscribe_all().await;
        } else {
            self.events.connected().await;
        }
    }

    /// After a reconnect, re-issue every subscription that asked for it and
    /// drop the rest.
    async fn resubscribe_all(&mut self) {
        for channel in self.registry.channel_names() {
            let keep = self
                .registry
                .get(&channel)
                .map(|entry| entry.resubscribe_on_reconnect)
                .unwrap_or(false);
            if !keep {
                self.registry.remove(&channel);
                continue;
            }
            let Some(token) = self.permissions.lookup(&channel) else {
                self.events
                    .exception(OrtcError::DoesNotHavePermission(format!(
                        "No permission found to subscribe to the channel {channel}"
                    )))
                    .await;
                continue;
            };
            if let Some(entry) = self.registry.get_mut(&channel) {
                entry.subscribing = true;
                entry.subscribed = false;
            }
            debug!(channel = %channel, "re-subscribing after reconnect");
            let (application_key, authentication_token) = match self.conn.as_ref() {
                Some(request) => {
                    (request.application_key.clone(), request.authentication_token.clone())
                }
                None => return,
            };
            let command =
                frame::subscribe_command(&application_key, &authentication_token, &channel, &token);
            self.dispatch(command).await;
        }
    }

    async fn handle_subscribed_ack(&mut self, body: &str) {
        let Some(channel) = frame::channel_from_body(body) else {
            self.events
                .exception(OrtcError::InvalidMessage(
                    "Subscribe acknowledgement without a channel".to_string(),
                ))
                .await;
            return;
        };
        self.registry.mark_subscribed(&channel);
        self.events.subscribed(channel).await;
    }

    async fn handle_unsubscribed_ack(&mut self, body: &str) {
        let Some(channel) = frame::channel_from_body(body) else {
            self.events
                .exception(OrtcError::InvalidMessage(
                    "Unsubscribe acknowledgement without a channel".to_string(),
                ))
                .await;
            return;
        };
        self.registry.remove(&channel);
        self.events.unsubscribed(channel).await;
    }

    async fn handle_received(&mut self, channel: String, payload: String) {
        match frame::split_multi_part(&payload) {
            Some((message_id, part, total, chunk)) if total > 1 => {
                if let Some(full) = self.buffer.insert(&message_id, part, total, chunk) {
                    self.deliver(channel, full).await;
                }
            }
            Some((_, _, _, chunk)) => self.deliver(channel, chunk).await,
            None => self.deliver(channel, payload).await,
        }
    }

    async fn deliver(&mut self, channel: String, payload: String) {
        let payload = multipart::strip_escape_artifacts(&payload);
        let Some(entry) = self.registry.get(&channel) else {
            trace!(channel = %channel, "message for a channel without a subscription");
            return;
        };
        let message = ChannelMessage { channel, payload };
        let _ = entry.sink.unbounded_send(message.clone());
        self.events.message(message).await;
    }

    async fn handle_server_error(&mut self, body: &str) {
        let Some(server_error) = frame::server_error_from_body(body) else {
            self.events
                .exception(OrtcError::InvalidMessage("Unparsable server error".to_string()))
                .await;
            return;
        };
        warn!(
            operation = %server_error.operation,
            channel = %server_error.channel,
            "server reported an error"
        );
        match server_error.operation_kind() {
            ServerErrorOperation::Validate => self.force_disconnect().await,
            ServerErrorOperation::Subscribe => {
                self.registry.remove(&server_error.channel);
            }
            ServerErrorOperation::SubscribeMaxSize | ServerErrorOperation::UnsubscribeMaxSize => {
                self.registry.remove(&server_error.channel);
                self.force_disconnect().await;
            }
            ServerErrorOperation::SendMaxSize => self.force_disconnect().await,
            ServerErrorOperation::Unexpected => {}
        }
        self.events.exception(OrtcError::Server(server_error.message)).await;
    }

    async fn handle_subscribe(
        &mut self,
        channel: String,
        resubscribe_on_reconnect: bool,
        sink: mpsc::UnboundedSender<ChannelMessage>,
    ) {
        if self.state != ConnectionState::Connected {
            self.events.exception(OrtcError::NotConnected("Not connected".to_string())).await;
            return;
        }
        if channel.is_empty() {
            self.events.exception(OrtcError::EmptyField("Channel")).await;
            return;
        }
        if !utils::is_valid_input(&channel) {
            self.events.exception(OrtcError::InvalidCharacters("Channel")).await;
            return;
        }
        if let Some(entry) = self.registry.get(&channel) {
            let state = if entry.subscribing { "subscribing" } else { "subscribed" };
            self.events
                .exception(OrtcError::AlreadySubscribed(format!(
                    "Already {state} to the channel {channel}"
                )))
                .await;
            return;
        }
        if channel.len() > MAX_CHANNEL_SIZE {
            self.events.exception(OrtcError::MaxLength("Channel", MAX_CHANNEL_SIZE)).await;
            return;
        }
        let Some(token) = self.permissions.lookup(&channel) else {
            self.events
                .exception(OrtcError::DoesNotHavePermission(format!(
                    "No permission found to subscribe to the channel {channel}"
                )))
                .await;
            return;
        };

        let (application_key, authentication_token) = match self.conn.as_ref() {
            Some(request) => {
                (request.application_key.clone(), request.authentication_token.clone())
            }
            None => return,
        };
        self.registry.insert(
            channel.clone(),
            ChannelSubscription {
                subscribing: true,
                subscribed: false,
                resubscribe_on_reconnect,
                sink,
            },
        );
        let command =
            frame::subscribe_command(&application_key, &authentication_token, &channel, &token);
        self.dispatch(command).await;
    }

    async fn handle_unsubscribe(&mut self, channel: String) {
        if self.state != ConnectionState::Connected {
            self.events.exception(OrtcError::NotConnected("Not connected".to_string())).await;
            return;
        }
        if !utils::is_valid_input(&channel) {
            self.events.exception(OrtcError::InvalidCharacters("Channel")).await;
            return;
        }
        if !self.registry.get(&channel).map(|entry| entry.subscribed).unwrap_or(false) {
            self.events.exception(OrtcError::NotSubscribed(channel)).await;
            return;
        }
        if channel.len() > MAX_CHANNEL_SIZE {
            self.events.exception(OrtcError::MaxLength("Channel", MAX_CHANNEL_SIZE)).await;
            return;
        }

        // the entry itself is cleared by the acknowledgement
        if let Some(entry) = self.registry.get_mut(&channel) {
            entry.resubscribe_on_reconnect = false;
        }
        let application_key = match self.conn.as_ref() {
            Some(request) => request.application_key.clone(),
            None => return,
        };
        let command = frame::unsubscribe_command(&application_key, &channel);
        self.dispatch(command).await;
    }

    async fn handle_send(&mut self, channel: String, message: String) {
        if self.state != ConnectionState::Connected {
            self.events.exception(OrtcError::NotConnected("Not connected".to_string())).await;
            return;
        }
        if channel.is_empty() {
            self.events.exception(OrtcError::EmptyField("Channel")).await;
            return;
        }
        if !utils::is_valid_input(&channel) {
            self.events.exception(OrtcError::InvalidCharacters("Channel")).await;
            return;
        }
        if message.is_empty() {
            self.events.exception(OrtcError::EmptyField("Message")).await;
            return;
        }
        if channel.len() > MAX_CHANNEL_SIZE {
            self.events.exception(OrtcError::MaxLength("Channel", MAX_CHANNEL_SIZE)).await;
            return;
        }
        let Some(token) = self.permissions.lookup(&channel) else {
            self.events
                .exception(OrtcError::DoesNotHavePermission(format!(
                    "No permission found to send to the channel {channel}"
                )))
                .await;
            return;
        };

        let (application_key, authentication_token) = match self.conn.as_ref() {
            Some(request) => {
                (request.application_key.clone(), request.authentication_token.clone())
            }
            None => return,
        };
        let message_id = utils::random_id(8);
        let escaped = frame::escape_payload(&message);
        let chunks = multipart::fragment(&escaped);
        let total = chunks.len() as u32;
        trace!(channel = %channel, message_id = %message_id, parts = total, "sending message");
        let commands: Vec<String> = chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                frame::send_command(
                    &application_key,
                    &authentication_token,
                    &channel,
                    &token,
                    &message_id,
                    index as u32 + 1,
                    total,
                    chunk,
                )
            })
            .collect();
        for command in commands {
            self.dispatch(command).await;
        }
    }

    async fn handle_disconnect(&mut self) {
        let active = self.backend.is_some() || self.state == ConnectionState::Reconnecting;
        if !active {
            self.events.exception(OrtcError::NotConnected("Not connected".to_string())).await;
            return;
        }
        debug!("disconnecting");
        self.state = ConnectionState::Disconnecting;
        self.reconnecting = false;
        self.teardown().await;
    }

    /// Full teardown back to idle: used by user disconnects and by the
    /// forced disconnects the server error policy demands.
    async fn teardown(&mut self) {
        if let Some(backend) = self.backend.take() {
            backend.shutdown();
        }
        self.permissions.clear();
        self.buffer.clear();
        self.registry.clear();
        self.state = ConnectionState::Idle;
        self.events.disconnected().await;
    }

    async fn force_disconnect(&mut self) {
        self.reconnecting = false;
        self.teardown().await;
    }

    /// The socket went away underneath us: drop connection-scoped state and
    /// enter the reconnect loop. Subscriptions survive for the re-subscribe
    /// sweep.
    async fn socket_dropped(&mut self) {
        if let Some(backend) = self.backend.take() {
            backend.shutdown();
        }
        if self.state == ConnectionState::Disconnecting {
            return;
        }
        warn!("connection lost");
        self.permissions.clear();
        self.buffer.clear();
        self.reconnecting = true;
        self.state = ConnectionState::Reconnecting;
        self.events.disconnected().await;
    }

    async fn dispatch(&mut self, command: String) {
        let failed = match self.backend.as_ref() {
            Some(backend) => backend.dispatcher.unbounded_send(command).is_err(),
            None => return,
        };
        if failed {
            self.socket_dropped().await;
        }
    }

    fn current_url(&self) -> Option<String> {
        let request = self.conn.as_ref()?;
        if request.is_cluster {
            Some(request.url.clone())
        } else {
            self.server_url.clone().or_else(|| Some(request.url.clone()))
        }
    }
}

/// `<ws|wss>://<host>/broadcast/<0-999>/<8-char-id>/websocket` for the
/// resolved service URL; `ws` only for plain-HTTP services.
fn build_connection_url(server_url: &str) -> Result<String, OrtcError> {
    let parsed = Url::parse(server_url)?;
    let protocol = if parsed.scheme() == "http" { "ws" } else { "wss" };
    let host = parsed.host_str().ok_or(OrtcError::InvalidCharacters("URL"))?;
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(format!(
        "{protocol}://{authority}/broadcast/{}/{}/websocket",
        utils::random_broadcast_digits(),
        utils::random_id(8),
    ))
}

use std::time::Duration;

use futures_channel::{mpsc, oneshot};
use futures_util::{
    select_biased,
    sink::SinkExt,
    stream::{Fuse, StreamExt},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{error, trace};

use crate::errors::OrtcError;

type WsStream = Fuse<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Driver-side handle to a running [`WsBackend`]: inbound text frames, a
/// terminal error signal, the outbound dispatcher, and intentional shutdown.
pub(crate) struct BackendHandle {
    /// Raw text frames received on the socket
    pub frames: mpsc::UnboundedReceiver<String>,
    /// Fires when the backend halts on a socket fault
    pub error: oneshot::Receiver<()>,
    /// Frames the backend should write to the socket
    pub dispatcher: mpsc::UnboundedSender<String>,
    shutdown: oneshot::Sender<()>,
}

impl BackendHandle {
    pub(crate) fn shutdown(self) {
        // failure means the backend is already gone
        let _ = self.shutdown.send(());
    }
}

/// Owns the WebSocket for exactly one connection attempt. It forwards text
/// frames to the driver, writes dispatched frames out, and halts on the
/// first fault, a shutdown signal, or the driver going away.
pub(crate) struct WsBackend {
    server: WsStream,

    // channel to the driver, through which received frames flow
    handler: mpsc::UnboundedSender<String>,
    // notify the driver of a fault causing this task to halt
    error: oneshot::Sender<()>,

    // frames to write to the socket
    to_dispatch: mpsc::UnboundedReceiver<String>,
    // notification from the driver of intentional shutdown
    shutdown: oneshot::Receiver<()>,
}

impl WsBackend {
    /// Dials `url` within `timeout` and returns the backend with its handle.
    /// The backend does nothing until [`WsBackend::spawn`] is called.
    pub(crate) async fn connect(
        url: &str,
        timeout: Duration,
    ) -> Result<(WsBackend, BackendHandle), OrtcError> {
        let dial = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| OrtcError::NotConnected("Connection attempt timed out".to_string()))?;
        let (ws, _) = dial?;
        Ok(Self::new(ws.fuse()))
    }

    fn new(server: WsStream) -> (WsBackend, BackendHandle) {
        let (handler, frames) = mpsc::unbounded();
        let (dispatcher, to_dispatch) = mpsc::unbounded();
        let (error_tx, error_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        (
            WsBackend { server, handler, error: error_tx, to_dispatch, shutdown: shutdown_rx },
            BackendHandle { frames, error: error_rx, dispatcher, shutdown: shutdown_tx },
        )
    }

    pub(crate) fn spawn(mut self) {
        let fut = async move {
            let mut faulted = false;
            loop {
                select_biased! {
                    resp = self.server.next() => match resp {
                        Some(Ok(Message::Text(frame))) => {
                            trace!(frame = %frame, "received frame");
                            if self.handler.unbounded_send(frame).is_err() {
                                // driver is gone
                                break
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Binary(_))) => {
                            error!("unexpected binary frame");
                            faulted = true;
                            break
                        }
                        Some(Ok(Message::Close(frame))) => {
                            trace!(?frame, "server closed the connection");
                            faulted = true;
                            break
                        }
                        Some(Err(e)) => {
                            error!(err = %e, "WS connection error");
                            faulted = true;
                            break
                        }
                        None => {
                            error!("WS server has gone away");
                            faulted = true;
                            break
                        }
                    },
                    frame = self.to_dispatch.next() => match frame {
                        Some(frame) => {
                            trace!(frame = %frame, "writing frame");
                            if let Err(e) = self.server.send(Message::Text(frame)).await {
                                error!(err = %e, "WS connection error");
                                faulted = true;
                                break
                            }
                        }
                        // dispatcher has gone away
                        None => break,
                    },
                    // break on shutdown recv, or on shutdown recv error
                    _ = &mut self.shutdown => {
                        let _ = self.server.close().await;
                        break
                    },
                }
            }
            if faulted {
                let _ = self.error.send(());
            }
        };

        tokio::spawn(fut);
    }
}

//! Websocket transport worker.
//!
//! A single background task owns the socket. Writers reach it through a
//! [`TransportHandle`]; inbound text frames are forwarded one at a time, in
//! arrival order, to the one receiver returned by [`spawn`].

use std::fmt;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::XapiError;

/// Readiness of the underlying connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Closed => f.write_str("closed"),
            Self::Errored => f.write_str("errored"),
        }
    }
}

/// What the worker reports upward. Frame content is not interpreted here.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Frame(String),
    Error(String),
    /// The remote side closed the connection.
    Closed,
}

enum TransportRequest {
    Write {
        text: String,
        done: oneshot::Sender<Result<(), XapiError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable write/close surface of the transport worker.
#[derive(Clone, Debug)]
pub(crate) struct TransportHandle {
    requests: mpsc::UnboundedSender<TransportRequest>,
    state: watch::Receiver<ConnectionState>,
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write { text, .. } => f.debug_struct("Write").field("len", &text.len()).finish(),
            Self::Close { .. } => f.write_str("Close"),
        }
    }
}

impl TransportHandle {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Writes one text frame and waits until the socket accepted it.
    pub(crate) async fn send(&self, text: String) -> Result<(), XapiError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(XapiError::Send(format!("transport is {state}")));
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.requests
            .send(TransportRequest::Write {
                text,
                done: done_tx,
            })
            .map_err(|_| XapiError::Send("transport worker stopped".to_string()))?;
        done_rx
            .await
            .map_err(|_| XapiError::Send("transport worker stopped".to_string()))?
    }

    /// Sends a close frame and stops the worker. Idempotent.
    pub(crate) async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .requests
            .send(TransportRequest::Close { done: done_tx })
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    /// Resolves once the worker reports `Open`, or fails once it reports a
    /// terminal state.
    pub(crate) async fn wait_for_open(&self) -> Result<(), XapiError> {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Closed | ConnectionState::Errored => {
                    return Err(XapiError::Connection(format!("transport is {current}")));
                }
                ConnectionState::Connecting => {}
            }
            state
                .changed()
                .await
                .map_err(|_| XapiError::Connection("transport worker stopped".to_string()))?;
        }
    }
}

/// Opens a websocket connection to `url`.
pub(crate) async fn open(
    url: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, XapiError> {
    let (socket, _) = connect_async(url)
        .await
        .map_err(|err| XapiError::Connection(err.to_string()))?;
    debug!(event = "transport_connected", url);
    Ok(socket)
}

/// Spawns the worker that owns `socket`.
pub(crate) fn spawn<S>(
    socket: WebSocketStream<S>,
) -> (
    TransportHandle,
    mpsc::UnboundedReceiver<TransportEvent>,
    JoinHandle<()>,
)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

    let task = tokio::spawn(transport_worker(socket, requests_rx, events_tx, state_tx));

    (
        TransportHandle {
            requests: requests_tx,
            state: state_rx,
        },
        events_rx,
        task,
    )
}

async fn transport_worker<S>(
    mut socket: WebSocketStream<S>,
    mut requests: mpsc::UnboundedReceiver<TransportRequest>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    state.send_replace(ConnectionState::Open);

    loop {
        tokio::select! {
            maybe_request = requests.recv() => {
                match maybe_request {
                    Some(TransportRequest::Write { text, done }) => {
                        trace!(event = "frame_write", len = text.len());
                        match socket.send(Message::Text(text)).await {
                            Ok(()) => {
                                let _ = done.send(Ok(()));
                            }
                            Err(err) => {
                                let reason = err.to_string();
                                warn!(event = "transport_write_failed", error = %reason);
                                state.send_replace(ConnectionState::Errored);
                                let _ = events.send(TransportEvent::Error(reason.clone()));
                                let _ = done.send(Err(XapiError::Send(reason)));
                                return;
                            }
                        }
                    }
                    Some(TransportRequest::Close { done }) => {
                        let _ = socket.close(None).await;
                        state.send_replace(ConnectionState::Closed);
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        let _ = socket.close(None).await;
                        state.send_replace(ConnectionState::Closed);
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Frame(text));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            let reason = err.to_string();
                            warn!(event = "transport_pong_failed", error = %reason);
                            state.send_replace(ConnectionState::Errored);
                            let _ = events.send(TransportEvent::Error(reason));
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(event = "transport_closed_by_remote");
                        state.send_replace(ConnectionState::Closed);
                        let _ = events.send(TransportEvent::Closed);
                        return;
                    }
                    Some(Ok(_)) => {
                        trace!(event = "non_text_frame_ignored");
                    }
                    Some(Err(err)) => {
                        let reason = err.to_string();
                        warn!(event = "transport_read_failed", error = %reason);
                        state.send_replace(ConnectionState::Errored);
                        let _ = events.send(TransportEvent::Error(reason));
                        return;
                    }
                }
            }
        }
    }
}

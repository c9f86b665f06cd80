//! Caller-owned session handle.
//!
//! A [`Session`] owns one websocket and the background tasks that serve it:
//! the transport worker, the send governor, the inbound demultiplexer, and
//! the keepalive loop. Command sessions issue correlated calls; streaming
//! sessions subscribe to push channels under a bound stream session id.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::config::{SessionConfig, SessionMode};
use crate::correlator::Correlator;
use crate::demux::spawn_demultiplexer;
use crate::error::XapiError;
use crate::governor::{Envelope, SendGovernor};
use crate::keepalive::{spawn_keepalive, PING_COMMAND};
use crate::proto::{OutboundFrame, Reply};
use crate::subscription::{
    ChannelKey, Listener, SharedStreamSessionId, SubscriptionManager, SubscriptionState,
};
use crate::transport::{self, ConnectionState, TransportHandle};

const LIFECYCLE_CAPACITY: usize = 64;

/// Opaque stream session id issued by `login`.
///
/// The value is redacted from `Debug` output and only exposed when a
/// streaming frame is serialized.
#[derive(Clone, Debug)]
pub struct StreamSessionId(SecretString);

impl StreamSessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(SecretString::new(id.into()))
    }

    pub(crate) fn expose(&self) -> &SecretString {
        &self.0
    }
}

/// Lifecycle notification broadcast to session observers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    Open,
    /// Emitted once, on explicit close or when the service closes the socket.
    Close,
    /// Transport read/write failure. Pending calls are not failed by it.
    Error(String),
}

/// One logical connection to the service.
pub struct Session {
    mode: SessionMode,
    config: SessionConfig,
    transport: TransportHandle,
    governor: SendGovernor,
    correlator: Correlator,
    subscriptions: SubscriptionManager,
    stream_session_id: SharedStreamSessionId,
    stream_bound: Arc<Notify>,
    lifecycle: broadcast::Sender<SessionEvent>,
    first_events: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
    closed: Arc<AtomicBool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

impl Session {
    /// Wraps an established websocket and starts the session's tasks.
    ///
    /// Resolves once the transport is open; the keepalive loop sends its
    /// first ping right away.
    pub async fn from_stream<S>(
        socket: WebSocketStream<S>,
        mode: SessionMode,
        config: SessionConfig,
    ) -> Result<Self, XapiError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;

        let (lifecycle, first_events) = broadcast::channel(LIFECYCLE_CAPACITY);
        let (transport, inbound, transport_task) = transport::spawn(socket);
        if let Err(err) = transport.wait_for_open().await {
            transport_task.abort();
            return Err(err);
        }
        let _ = lifecycle.send(SessionEvent::Open);

        let (governor, governor_task) =
            SendGovernor::spawn(transport.clone(), config.send_interval);
        let stream_session_id: SharedStreamSessionId = Arc::new(RwLock::new(None));
        let correlator = Correlator::new(governor.clone());
        let subscriptions =
            SubscriptionManager::new(governor.clone(), Arc::clone(&stream_session_id));
        let closed = Arc::new(AtomicBool::new(false));
        let stream_bound = Arc::new(Notify::new());

        let demux_task = spawn_demultiplexer(
            inbound,
            correlator.clone(),
            subscriptions.clone(),
            lifecycle.clone(),
            Arc::clone(&closed),
        );
        let keepalive = spawn_keepalive(
            governor.clone(),
            config.keepalive_interval,
            mode,
            Arc::clone(&stream_session_id),
            Arc::clone(&stream_bound),
        );

        debug!(
            event = "session_opened",
            mode = %mode,
            send_interval_ms = config.send_interval.as_millis() as u64,
            keepalive_interval_ms = config.keepalive_interval.as_millis() as u64
        );

        Ok(Self {
            mode,
            config,
            transport,
            governor,
            correlator,
            subscriptions,
            stream_session_id,
            stream_bound,
            lifecycle,
            first_events: Mutex::new(Some(first_events)),
            closed,
            keepalive: Mutex::new(Some(keepalive)),
            tasks: Mutex::new(vec![transport_task, governor_task, demux_task]),
        })
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Whether the transport is open right now. Does not predict whether the
    /// next send succeeds.
    pub fn is_healthy(&self) -> bool {
        self.transport.is_healthy()
    }

    pub async fn wait_for_connection(&self) -> Result<(), XapiError> {
        self.transport.wait_for_open().await
    }

    /// Subscribes to lifecycle events.
    ///
    /// The first receiver handed out also holds the `Open` event emitted
    /// while the session was being established.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.first_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.lifecycle.subscribe())
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    fn require_mode(&self, operation: &'static str, mode: SessionMode) -> Result<(), XapiError> {
        if self.mode == mode {
            Ok(())
        } else {
            Err(XapiError::ModeMismatch {
                operation,
                mode: self.mode,
            })
        }
    }

    /// Issues a correlated command and returns the raw reply, including
    /// `status: false` replies.
    pub async fn call_reply(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Reply, XapiError> {
        self.require_mode("call", SessionMode::Command)?;
        self.correlator.call(command, arguments, timeout).await
    }

    /// Issues a correlated command with the configured timeout and returns
    /// its `returnData` (`Null` when absent).
    pub async fn call(&self, command: &str, arguments: Option<Value>) -> Result<Value, XapiError> {
        self.call_with_timeout(command, arguments, self.config.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, XapiError> {
        self.call_reply(command, arguments, timeout)
            .await?
            .into_result()
    }

    pub async fn ping(&self) -> Result<(), XapiError> {
        self.call(PING_COMMAND, None).await.map(|_| ())
    }

    /// Service time in milliseconds since the Unix epoch.
    pub async fn get_server_time(&self) -> Result<i64, XapiError> {
        let data = self.call("getServerTime", None).await?;
        data.get("time")
            .and_then(Value::as_i64)
            .ok_or_else(|| XapiError::Protocol("getServerTime reply has no `time`".to_string()))
    }

    pub async fn get_version(&self) -> Result<String, XapiError> {
        let data = self.call("getVersion", None).await?;
        data.get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| XapiError::Protocol("getVersion reply has no `version`".to_string()))
    }

    /// Logs in on a command session and returns the stream session id to
    /// bind on a streaming session.
    pub async fn login(
        &self,
        user_id: &str,
        password: &SecretString,
        app_name: Option<&str>,
    ) -> Result<StreamSessionId, XapiError> {
        let mut arguments = json!({
            "userId": user_id,
            "password": password.expose_secret(),
        });
        if let (Some(app_name), Some(fields)) = (app_name, arguments.as_object_mut()) {
            fields.insert("appName".to_string(), Value::String(app_name.to_string()));
        }

        let reply = self
            .call_reply("login", Some(arguments), self.config.call_timeout)
            .await?;
        let stream_session_id = reply.stream_session_id.clone();
        reply.into_result()?;
        let id = stream_session_id
            .ok_or_else(|| XapiError::Protocol("login reply has no `streamSessionId`".to_string()))?;
        debug!(event = "login_succeeded", user_id);
        Ok(StreamSessionId::new(id))
    }

    /// Fire-and-forget command. On a streaming session the bound stream
    /// session id is attached and object arguments go to the top level of
    /// the frame.
    pub async fn send(&self, command: &str, arguments: Option<Value>) -> Result<(), XapiError> {
        let frame = match self.mode {
            SessionMode::Command => OutboundFrame::command(command, arguments),
            SessionMode::Streaming => {
                let fields = match arguments {
                    None => Map::new(),
                    Some(Value::Object(fields)) => fields,
                    Some(_) => {
                        return Err(XapiError::Protocol(
                            "streaming arguments must be a JSON object".to_string(),
                        ))
                    }
                };
                OutboundFrame::streaming(command, self.bound_stream_session_id()?, fields)
            }
        };
        self.governor
            .submit(Envelope::untagged(frame.to_text()?))
            .await
    }

    fn bound_stream_session_id(&self) -> Result<String, XapiError> {
        self.stream_session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|id| id.expose().expose_secret().clone())
            .ok_or(XapiError::NoStreamSession)
    }

    /// Binds (or replaces) the stream session id used by subscriptions and
    /// keepalive pings. The keepalive loop pings with it right away.
    pub fn bind_stream_session(&self, id: StreamSessionId) -> Result<(), XapiError> {
        self.require_mode("bind_stream_session", SessionMode::Streaming)?;
        *self
            .stream_session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);
        self.stream_bound.notify_one();
        debug!(event = "stream_session_bound");
        Ok(())
    }

    pub fn listen(&self, key: ChannelKey) -> Listener {
        self.subscriptions.listen(key)
    }

    pub fn unlisten(&self, listener: &Listener) -> bool {
        self.subscriptions.unlisten(listener.key(), listener.id())
    }

    pub async fn subscribe(
        &self,
        key: &ChannelKey,
        extra: Map<String, Value>,
    ) -> Result<(), XapiError> {
        self.require_mode("subscribe", SessionMode::Streaming)?;
        self.subscriptions.subscribe(key, extra).await
    }

    pub async fn unsubscribe(&self, key: &ChannelKey) -> Result<(), XapiError> {
        self.require_mode("unsubscribe", SessionMode::Streaming)?;
        self.subscriptions.unsubscribe(key).await
    }

    pub async fn subscribe_tick_prices(
        &self,
        symbol: &str,
        min_arrival_time: Option<u64>,
        max_level: Option<u32>,
    ) -> Result<(), XapiError> {
        let mut extra = Map::new();
        if let Some(min_arrival_time) = min_arrival_time {
            extra.insert("minArrivalTime".to_string(), json!(min_arrival_time));
        }
        if let Some(max_level) = max_level {
            extra.insert("maxLevel".to_string(), json!(max_level));
        }
        self.subscribe(&ChannelKey::tick_prices(symbol), extra).await
    }

    pub async fn subscribe_candles(&self, symbol: &str) -> Result<(), XapiError> {
        self.subscribe(&ChannelKey::candles(symbol), Map::new())
            .await
    }

    pub fn subscription_state(&self, key: &ChannelKey) -> SubscriptionState {
        self.subscriptions.state(key)
    }

    pub fn active_channels(&self) -> Vec<ChannelKey> {
        self.subscriptions.active_channels()
    }

    /// Shuts the session down.
    ///
    /// Stops the keepalive loop and channel dispatch, fails every pending
    /// call with [`XapiError::ConnectionClosed`], then closes the socket.
    /// Calling it again is harmless.
    pub async fn close(&self) {
        if let Some(keepalive) = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            keepalive.abort();
        }
        self.subscriptions.close();
        let failed = self.correlator.fail_all();

        self.transport.close().await;
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(event = "session_closed", mode = %self.mode, failed_pending = failed);
            let _ = self.lifecycle.send(SessionEvent::Close);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let keepalive = self
            .keepalive
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(keepalive) = keepalive {
            keepalive.abort();
        }
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

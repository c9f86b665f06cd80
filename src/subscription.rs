//! Streaming channel registry and subscription state machine.
//!
//! Channels are keyed by push family plus an optional instance key (the
//! symbol for tick prices and candles). Subscription state is optimistic:
//! the service never acknowledges a subscribe, so a channel counts as
//! subscribed as soon as its subscribe frame was written. Subscribe and
//! unsubscribe on one key run one at a time; `Subscribing` and
//! `Unsubscribing` are only visible while a frame is in flight.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, trace, warn};

use crate::error::XapiError;
use crate::governor::{Envelope, SendGovernor};
use crate::proto::{OutboundFrame, PushMessage, StreamChannel};
use crate::session::StreamSessionId;

/// Stream session id slot shared by the subscription manager and the
/// keepalive loop.
pub(crate) type SharedStreamSessionId = Arc<RwLock<Option<StreamSessionId>>>;

/// Identifies one logical channel, e.g. (`TickPrices`, `EURUSD`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub channel: StreamChannel,
    pub instance: Option<String>,
}

impl ChannelKey {
    /// Family-wide key with no instance.
    pub fn new(channel: StreamChannel) -> Self {
        Self {
            channel,
            instance: None,
        }
    }

    pub fn with_instance(channel: StreamChannel, instance: impl Into<String>) -> Self {
        Self {
            channel,
            instance: Some(instance.into()),
        }
    }

    pub fn tick_prices(symbol: impl Into<String>) -> Self {
        Self::with_instance(StreamChannel::TickPrices, symbol)
    }

    pub fn candles(symbol: impl Into<String>) -> Self {
        Self::with_instance(StreamChannel::Candles, symbol)
    }
}

/// Per-channel subscription state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// Push event delivered to listeners.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    pub channel: StreamChannel,
    /// Instance key found in the payload, if the channel is keyed.
    pub instance: Option<String>,
    pub data: Value,
}

impl StreamEvent {
    /// Event name, e.g. `tickPrices` or `keepAliveFromServer`.
    pub fn name(&self) -> &'static str {
        self.channel.event_name()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

/// Receiving end of one listener registration.
///
/// Dropping it detaches the listener at the next dispatch on its channel.
#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    key: ChannelKey,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Next event for this listener; `None` once the session closed or the
    /// listener was unregistered.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }
}

struct ListenerSlot {
    id: ListenerId,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

struct ChannelEntry {
    state: SubscriptionState,
    listeners: Vec<ListenerSlot>,
    operation: Arc<AsyncMutex<()>>,
}

impl Default for ChannelEntry {
    fn default() -> Self {
        Self {
            state: SubscriptionState::Unsubscribed,
            listeners: Vec::new(),
            operation: Arc::new(AsyncMutex::new(())),
        }
    }
}

#[derive(Default)]
struct ChannelRegistry {
    entries: HashMap<ChannelKey, ChannelEntry>,
    reported_unknown: HashSet<String>,
    closed: bool,
}

impl ChannelRegistry {
    fn entry(&mut self, key: &ChannelKey) -> &mut ChannelEntry {
        self.entries.entry(key.clone()).or_default()
    }

    fn state(&self, key: &ChannelKey) -> SubscriptionState {
        self.entries
            .get(key)
            .map_or(SubscriptionState::Unsubscribed, |entry| entry.state)
    }
}

#[derive(Clone)]
pub(crate) struct SubscriptionManager {
    registry: Arc<Mutex<ChannelRegistry>>,
    next_listener: Arc<AtomicU64>,
    governor: SendGovernor,
    stream_session_id: SharedStreamSessionId,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("active", &self.active_channels())
            .finish()
    }
}

impl SubscriptionManager {
    pub(crate) fn new(governor: SendGovernor, stream_session_id: SharedStreamSessionId) -> Self {
        Self {
            registry: Arc::new(Mutex::new(ChannelRegistry::default())),
            next_listener: Arc::new(AtomicU64::new(1)),
            governor,
            stream_session_id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bound_session_id(&self) -> Result<String, XapiError> {
        self.stream_session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|id| id.expose().expose_secret().clone())
            .ok_or(XapiError::NoStreamSession)
    }

    /// Attaches a listener to `key`. The channel entry is created if needed.
    pub(crate) fn listen(&self, key: ChannelKey) -> Listener {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.lock();
        if !registry.closed {
            registry
                .entry(&key)
                .listeners
                .push(ListenerSlot { id, tx });
        }
        Listener {
            id,
            key,
            events: rx,
        }
    }

    /// Detaches a listener. Returns `false` if it was not registered.
    pub(crate) fn unlisten(&self, key: &ChannelKey, id: ListenerId) -> bool {
        let mut registry = self.lock();
        let Some(entry) = registry.entries.get_mut(key) else {
            return false;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|slot| slot.id != id);
        before != entry.listeners.len()
    }

    /// Lock that serializes subscribe/unsubscribe on one key, so a caller
    /// always acts on the settled outcome of the previous operation.
    fn operation_lock(&self, key: &ChannelKey) -> Result<Arc<AsyncMutex<()>>, XapiError> {
        let mut registry = self.lock();
        if registry.closed {
            return Err(XapiError::ConnectionClosed);
        }
        Ok(Arc::clone(&registry.entry(key).operation))
    }

    /// Submits the subscribe frame for `key` and marks it subscribed once
    /// written. A concurrent subscribe on the same key waits for the first
    /// one; if that write failed it submits its own frame, otherwise it sends
    /// nothing.
    pub(crate) async fn subscribe(
        &self,
        key: &ChannelKey,
        extra: Map<String, Value>,
    ) -> Result<(), XapiError> {
        let session_id = self.bound_session_id()?;
        let operation = self.operation_lock(key)?;
        let _operation = operation.lock().await;
        {
            let mut registry = self.lock();
            if registry.closed {
                return Err(XapiError::ConnectionClosed);
            }
            let entry = registry.entry(key);
            if entry.state == SubscriptionState::Subscribed {
                trace!(event = "subscribe_skipped", channel = %key.channel, instance = ?key.instance);
                return Ok(());
            }
            entry.state = SubscriptionState::Subscribing;
        }

        let mut fields = extra;
        if let Some(instance) = &key.instance {
            fields.insert("symbol".to_string(), Value::String(instance.clone()));
        }
        let frame = OutboundFrame::streaming(key.channel.subscribe_command(), session_id, fields);

        let result = self.send(frame).await;
        self.settle(
            key,
            if result.is_ok() {
                SubscriptionState::Subscribed
            } else {
                SubscriptionState::Unsubscribed
            },
        );

        if result.is_ok() {
            debug!(event = "channel_subscribed", channel = %key.channel, instance = ?key.instance);
        }
        result
    }

    /// Submits the stop frame for `key` and marks it unsubscribed once
    /// written; a failed write leaves it subscribed. Listeners stay attached
    /// and keep receiving whatever the service still pushes.
    pub(crate) async fn unsubscribe(&self, key: &ChannelKey) -> Result<(), XapiError> {
        let session_id = self.bound_session_id()?;
        let operation = self.operation_lock(key)?;
        let _operation = operation.lock().await;
        {
            let mut registry = self.lock();
            if registry.closed {
                return Err(XapiError::ConnectionClosed);
            }
            let entry = registry.entry(key);
            if entry.state != SubscriptionState::Subscribed {
                trace!(event = "unsubscribe_skipped", channel = %key.channel, instance = ?key.instance);
                return Ok(());
            }
            entry.state = SubscriptionState::Unsubscribing;
        }

        let mut fields = Map::new();
        if let Some(instance) = &key.instance {
            fields.insert("symbol".to_string(), Value::String(instance.clone()));
        }
        let frame = OutboundFrame::streaming(key.channel.stop_command(), session_id, fields);

        let result = self.send(frame).await;
        self.settle(
            key,
            if result.is_ok() {
                SubscriptionState::Unsubscribed
            } else {
                SubscriptionState::Subscribed
            },
        );

        if result.is_ok() {
            debug!(event = "channel_unsubscribed", channel = %key.channel, instance = ?key.instance);
        }
        result
    }

    fn settle(&self, key: &ChannelKey, state: SubscriptionState) {
        if let Some(entry) = self.lock().entries.get_mut(key) {
            entry.state = state;
        }
    }

    async fn send(&self, frame: OutboundFrame) -> Result<(), XapiError> {
        let text = frame.to_text()?;
        self.governor.submit(Envelope::untagged(text)).await
    }

    /// Routes one push to every listener on its channel key and on the
    /// family-wide key. Returns the number of listeners reached.
    pub(crate) fn dispatch(&self, push: PushMessage) -> usize {
        let mut registry = self.lock();
        if registry.closed {
            return 0;
        }

        let Some(channel) = StreamChannel::from_push_command(&push.command) else {
            if registry.reported_unknown.insert(push.command.clone()) {
                warn!(event = "unrecognized_push_command", command = %push.command);
            } else {
                trace!(event = "unrecognized_push_command", command = %push.command);
            }
            return 0;
        };

        let instance = if channel.keyed_by_symbol() {
            push.data
                .get("symbol")
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            None
        };
        let event = StreamEvent {
            channel,
            instance: instance.clone(),
            data: push.data,
        };

        let mut keys = vec![ChannelKey::new(channel)];
        if let Some(instance) = instance {
            keys.push(ChannelKey::with_instance(channel, instance));
        }

        let mut delivered = 0;
        for key in keys {
            let Some(entry) = registry.entries.get_mut(&key) else {
                continue;
            };
            entry.listeners.retain(|slot| {
                if slot.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                    true
                } else {
                    false
                }
            });
        }
        if delivered == 0 {
            trace!(event = "push_without_listeners", channel = %channel);
        }
        delivered
    }

    pub(crate) fn state(&self, key: &ChannelKey) -> SubscriptionState {
        self.lock().state(key)
    }

    pub(crate) fn active_channels(&self) -> Vec<ChannelKey> {
        let registry = self.lock();
        let mut keys: Vec<ChannelKey> = registry
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == SubscriptionState::Subscribed)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Stops all dispatch and drops every listener sender, which ends each
    /// listener's stream.
    pub(crate) fn close(&self) {
        let mut registry = self.lock();
        registry.closed = true;
        registry.entries.clear();
    }
}

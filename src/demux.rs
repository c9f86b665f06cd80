//! Inbound demultiplexer.
//!
//! Every inbound frame is offered first to the correlator by tag, then to the
//! channel registry by `command`; anything else is reported and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::correlator::Correlator;
use crate::proto::InboundFrame;
use crate::session::SessionEvent;
use crate::subscription::SubscriptionManager;
use crate::transport::TransportEvent;

/// Where one inbound frame ended up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Routed {
    Reply,
    StaleReply,
    Push,
    Unrecognized,
}

pub(crate) fn route_frame(
    text: &str,
    correlator: &Correlator,
    subscriptions: &SubscriptionManager,
) -> Routed {
    let frame = match InboundFrame::from_text(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(event = "inbound_frame_rejected", error = %err);
            return Routed::Unrecognized;
        }
    };

    let mut stale_tag = None;
    if let (Some(tag), Some(reply)) = (frame.custom_tag.as_deref(), frame.reply()) {
        if correlator.resolve(tag, reply) {
            return Routed::Reply;
        }
        stale_tag = Some(tag.to_string());
    }

    if let Some(push) = frame.push() {
        subscriptions.dispatch(push);
        return Routed::Push;
    }

    match stale_tag {
        Some(tag) => {
            debug!(event = "stale_reply_dropped", tag = %tag);
            Routed::StaleReply
        }
        None => {
            warn!(event = "inbound_frame_unrecognized", len = text.len());
            Routed::Unrecognized
        }
    }
}

/// Drains transport events until the transport stops.
///
/// A remote close fails every pending call and emits `Close` (once, shared
/// with an explicit close through `closed`). A transport error is only
/// broadcast; pending calls keep their own deadlines.
pub(crate) fn spawn_demultiplexer(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    correlator: Correlator,
    subscriptions: SubscriptionManager,
    lifecycle: broadcast::Sender<SessionEvent>,
    closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Frame(text) => {
                    route_frame(&text, &correlator, &subscriptions);
                }
                TransportEvent::Error(reason) => {
                    let _ = lifecycle.send(SessionEvent::Error(reason));
                }
                TransportEvent::Closed => {
                    if !closed.swap(true, Ordering::SeqCst) {
                        subscriptions.close();
                        correlator.fail_all();
                        let _ = lifecycle.send(SessionEvent::Close);
                    }
                }
            }
        }
    })
}

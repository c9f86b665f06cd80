//! Liveness loop.
//!
//! Sends one `ping` as soon as it starts and then one per period, through the
//! send governor, without waiting for any reply. A streaming session has
//! nothing to send until a stream session id is bound; binding one wakes the
//! loop and restarts the period. Failures are logged and the loop carries
//! on; only aborting its task stops it.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use secrecy::ExposeSecret;
use serde_json::Map;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{trace, warn};

use crate::config::SessionMode;
use crate::governor::{Envelope, SendGovernor};
use crate::proto::OutboundFrame;
use crate::subscription::SharedStreamSessionId;

pub(crate) const PING_COMMAND: &str = "ping";

pub(crate) fn spawn_keepalive(
    governor: SendGovernor,
    period: Duration,
    mode: SessionMode,
    stream_session_id: SharedStreamSessionId,
    bound: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = bound.notified() => ticker.reset(),
                _ = ticker.tick() => {}
            }

            let Some(frame) = ping_frame(mode, &stream_session_id) else {
                trace!(event = "keepalive_skipped_unbound");
                continue;
            };
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(err) => {
                    warn!(event = "keepalive_encode_failed", error = %err);
                    continue;
                }
            };

            match governor.submit(Envelope::untagged(text)).await {
                Ok(()) => trace!(event = "keepalive_sent", mode = %mode),
                Err(err) => warn!(event = "keepalive_send_failed", mode = %mode, error = %err),
            }
        }
    })
}

/// Streaming pings carry the bound stream session id; until one is bound
/// there is nothing to send.
fn ping_frame(mode: SessionMode, stream_session_id: &SharedStreamSessionId) -> Option<OutboundFrame> {
    match mode {
        SessionMode::Command => Some(OutboundFrame::command(PING_COMMAND, None)),
        SessionMode::Streaming => {
            let guard = stream_session_id
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let id = guard.as_ref()?;
            Some(OutboundFrame::streaming(
                PING_COMMAND,
                id.expose().expose_secret().clone(),
                Map::new(),
            ))
        }
    }
}

//! Outbound send governor.
//!
//! Every outbound frame goes through one FIFO queue drained by one task. A
//! frame is taken off the queue only after `interval` has elapsed since the
//! previous take and the transport accepted the previous write, so at most
//! one write is ever in flight.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::XapiError;
use crate::transport::TransportHandle;

/// Serialized frame plus the correlation tag a reply is expected under.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) frame: String,
    pub(crate) tag: Option<String>,
}

impl Envelope {
    pub(crate) fn untagged(frame: String) -> Self {
        Self { frame, tag: None }
    }

    pub(crate) fn tagged(frame: String, tag: String) -> Self {
        Self {
            frame,
            tag: Some(tag),
        }
    }
}

struct QueuedEnvelope {
    envelope: Envelope,
    done: oneshot::Sender<Result<(), XapiError>>,
}

/// Cloneable submission side of the governor.
#[derive(Clone, Debug)]
pub(crate) struct SendGovernor {
    queue: mpsc::UnboundedSender<QueuedEnvelope>,
}

impl std::fmt::Debug for QueuedEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.envelope.fmt(f)
    }
}

impl SendGovernor {
    pub(crate) fn spawn(transport: TransportHandle, interval: Duration) -> (Self, JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(governor_worker(queue_rx, transport, interval));
        (Self { queue: queue_tx }, task)
    }

    /// Queues `envelope` and resolves once its transmission was attempted.
    ///
    /// A failed write is returned as is; the governor never retries.
    pub(crate) async fn submit(&self, envelope: Envelope) -> Result<(), XapiError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .send(QueuedEnvelope {
                envelope,
                done: done_tx,
            })
            .map_err(|_| XapiError::ConnectionClosed)?;
        done_rx.await.map_err(|_| XapiError::ConnectionClosed)?
    }
}

#[cfg(test)]
impl SendGovernor {
    /// Governor whose every write fails, plus the number of attempts so far.
    pub(crate) fn failing() -> (Self, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let attempts = Arc::new(AtomicUsize::new(0));
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<QueuedEnvelope>();
        tokio::spawn({
            let attempts = Arc::clone(&attempts);
            async move {
                while let Some(QueuedEnvelope { done, .. }) = queue_rx.recv().await {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let _ = done.send(Err(XapiError::Send("transport is closed".to_string())));
                }
            }
        });
        (Self { queue: queue_tx }, attempts)
    }
}

async fn governor_worker(
    mut queue: mpsc::UnboundedReceiver<QueuedEnvelope>,
    transport: TransportHandle,
    interval: Duration,
) {
    let mut last_dequeue: Option<Instant> = None;

    while let Some(QueuedEnvelope { envelope, done }) = queue.recv().await {
        if let Some(previous) = last_dequeue {
            tokio::time::sleep_until(previous + interval).await;
        }
        last_dequeue = Some(Instant::now());

        trace!(
            event = "governor_dequeue",
            tag = envelope.tag.as_deref().unwrap_or("-"),
            len = envelope.frame.len()
        );
        let result = transport.send(envelope.frame).await;
        if let Err(err) = &result {
            debug!(
                event = "governor_send_failed",
                tag = envelope.tag.as_deref().unwrap_or("-"),
                error = %err
            );
        }
        let _ = done.send(result);
    }
}

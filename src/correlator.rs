//! Request/response correlation.
//!
//! Each correlated call gets a tag from a monotonic counter, so no two
//! outstanding requests ever share one. The pending table is the only state
//! shared between callers and the demultiplexer; every entry is removed
//! exactly once, by whichever of reply, timeout, send failure, cancellation,
//! or close gets to it first. Later attempts find nothing and do nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::XapiError;
use crate::governor::{Envelope, SendGovernor};
use crate::proto::{OutboundFrame, Reply};

struct PendingRequest {
    command: String,
    created_at: Instant,
    deadline: Instant,
    completion: oneshot::Sender<Result<Reply, XapiError>>,
}

#[derive(Default)]
struct PendingTable {
    requests: HashMap<String, PendingRequest>,
    closed: bool,
}

#[derive(Clone)]
pub(crate) struct Correlator {
    table: Arc<Mutex<PendingTable>>,
    next_tag: Arc<AtomicU64>,
    governor: SendGovernor,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Removes the entry if the call future is dropped before it settled.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    tag: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.correlator.remove(&self.tag).is_some() {
            trace!(event = "pending_request_dropped", tag = %self.tag);
        }
    }
}

impl Correlator {
    pub(crate) fn new(governor: SendGovernor) -> Self {
        Self {
            table: Arc::new(Mutex::new(PendingTable::default())),
            next_tag: Arc::new(AtomicU64::new(1)),
            governor,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `command` tagged and waits for the matching reply.
    ///
    /// The deadline starts when the call is registered, so time spent
    /// waiting in the governor queue counts against `timeout`.
    pub(crate) async fn call(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Reply, XapiError> {
        let (tag, completion) = self.register(command, timeout)?;
        let _guard = PendingGuard {
            correlator: self,
            tag: tag.clone(),
        };
        let deadline = Instant::now() + timeout;

        let frame = OutboundFrame::command(command, arguments)
            .with_tag(tag.clone())
            .to_text()?;

        let exchange = async {
            self.governor
                .submit(Envelope::tagged(frame, tag.clone()))
                .await?;
            completion.await.map_err(|_| XapiError::ConnectionClosed)?
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                if self.remove(&tag).is_some() {
                    debug!(event = "call_timed_out", command, tag = %tag);
                }
                Err(XapiError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    fn register(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<(String, oneshot::Receiver<Result<Reply, XapiError>>), XapiError> {
        let mut table = self.lock();
        if table.closed {
            return Err(XapiError::ConnectionClosed);
        }

        let mut tag = self.next_tag();
        while table.requests.contains_key(&tag) {
            tag = self.next_tag();
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        let created_at = Instant::now();
        table.requests.insert(
            tag.clone(),
            PendingRequest {
                command: command.to_string(),
                created_at,
                deadline: created_at + timeout,
                completion: completion_tx,
            },
        );
        trace!(
            event = "pending_request_registered",
            command,
            tag = %tag,
            pending = table.requests.len()
        );
        Ok((tag, completion_rx))
    }

    fn next_tag(&self) -> String {
        self.next_tag.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn remove(&self, tag: &str) -> Option<PendingRequest> {
        self.lock().requests.remove(tag)
    }

    /// Settles the request pending under `tag`.
    ///
    /// Returns `false` when nothing is pending under that tag, e.g. a reply
    /// that arrived after its call timed out.
    pub(crate) fn resolve(&self, tag: &str, reply: Reply) -> bool {
        let Some(pending) = self.remove(tag) else {
            return false;
        };
        let now = Instant::now();
        trace!(
            event = "pending_request_resolved",
            command = %pending.command,
            tag,
            status = reply.status,
            elapsed_ms = now.saturating_duration_since(pending.created_at).as_millis() as u64,
            late = now > pending.deadline
        );
        let _ = pending.completion.send(Ok(reply));
        true
    }

    /// Fails every pending request with [`XapiError::ConnectionClosed`] and
    /// refuses new ones.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.lock();
            table.closed = true;
            table.requests.drain().map(|(_, pending)| pending).collect()
        };
        let failed = drained.len();
        for pending in drained {
            let _ = pending.completion.send(Err(XapiError::ConnectionClosed));
        }
        if failed > 0 {
            debug!(event = "pending_requests_failed_on_close", failed);
        }
        failed
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().requests.len()
    }
}

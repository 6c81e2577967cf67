//! State transitions for `Dispatch<T>`: claiming a pending entry for
//! dispatch, awaiting the transport's result, and moving to a terminal
//! state.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::request::types::{Aborted, Completed, Dispatch, Failed, InFlight, Pending};
use crate::transport::{NetworkClient, TransportRequest, TransportResponse};

impl Dispatch<Pending> {
    /// Hand the entry to the transport. The HTTP call runs on a spawned
    /// task; this method returns immediately once the task is running, per
    /// spec §4.D ("does not block the caller").
    #[tracing::instrument(skip(self, transport), fields(position = self.entry.position))]
    pub fn dispatch(self, transport: Arc<dyn NetworkClient>) -> Dispatch<InFlight> {
        let (tx, rx) = mpsc::channel(1);
        let request = TransportRequest::from(&self.entry.request.config);
        let deadline = self
            .entry
            .request
            .config
            .timeout_secs
            .map(std::time::Duration::from_secs);

        let handle = tokio::spawn(async move {
            let outcome = transport.send(request, deadline).await;
            // The receiver may already be gone if the entry was aborted
            // concurrently; that's not an error here.
            let _ = tx.send(outcome).await;
        });

        tracing::debug!("dispatched entry to transport");

        Dispatch {
            state: InFlight {
                started_at: Utc::now(),
                result_rx: Arc::new(AsyncMutex::new(rx)),
                abort_handle: handle.abort_handle(),
            },
            entry: self.entry,
        }
    }
}

/// Classification of a finished dispatch, matching the result-routing table
/// in spec §4.D. The processor decides what to do with each variant
/// (retry/drop/notify); this module only classifies.
pub enum Resolution {
    /// 2xx/3xx.
    Success(Dispatch<Completed>),
    /// Connection timeout, DNS failure, socket drop, or the transport's
    /// result channel closing without a reply.
    TransientNetwork(Dispatch<Failed>),
    /// 5xx.
    ServerError(Dispatch<Failed>),
    /// 4xx — never retried automatically.
    ClientError(Dispatch<Failed>),
}

impl Dispatch<InFlight> {
    /// Await the spawned task's result and move to a terminal state.
    /// Whether a `Failed` outcome is retried is decided by the processor,
    /// which has the queueing policy and attempt count in scope.
    #[tracing::instrument(skip(self), fields(position = self.entry.position))]
    pub async fn complete(self) -> Resolution {
        let mut rx = self.state.result_rx.lock().await;
        let received = rx.recv().await;
        drop(rx);

        match received {
            Some(Ok(response)) if response.is_success() => {
                tracing::info!(status = response.status_code, "request succeeded");
                Resolution::Success(Dispatch {
                    state: Completed {
                        status_code: response.status_code,
                        headers: response.headers,
                        body: response.body,
                        completed_at: Utc::now(),
                    },
                    entry: self.entry,
                })
            }
            Some(Ok(response)) if response.is_server_error() => {
                tracing::warn!(status = response.status_code, "server error");
                let status = response.status_code;
                Resolution::ServerError(self.failed(Some(status), format!("HTTP {status}")))
            }
            Some(Ok(response)) => {
                tracing::warn!(status = response.status_code, "client error");
                let status = response.status_code;
                Resolution::ClientError(self.failed(Some(status), format!("HTTP {status}")))
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "transport call failed");
                Resolution::TransientNetwork(self.failed(None, e.to_string()))
            }
            None => {
                tracing::warn!("transport task dropped its result channel without replying");
                Resolution::TransientNetwork(
                    self.failed(None, "transport task ended without a result"),
                )
            }
        }
    }

    fn failed(self, status_code: Option<u16>, error: impl Into<String>) -> Dispatch<Failed> {
        Dispatch {
            state: Failed {
                status_code,
                error: error.into(),
                failed_at: Utc::now(),
            },
            entry: self.entry,
        }
    }

    /// Cancel the in-flight HTTP call. Used for explicit aborts and for
    /// timeouts, both of which route as `Outcome::Aborted`.
    pub fn cancel(self, reason: impl Into<String>) -> Dispatch<Aborted> {
        self.state.abort_handle.abort();
        Dispatch {
            state: Aborted {
                reason: reason.into(),
                aborted_at: Utc::now(),
            },
            entry: self.entry,
        }
    }
}

impl Dispatch<Failed> {
    /// Re-queue as a fresh `Pending` entry with `attemptCount` incremented,
    /// per invariant 3 and the retry contract in §4.C. Returns an error if
    /// the attempt ceiling (`max_attempts`) has already been reached — the
    /// caller should treat that as a terminal failure instead.
    pub fn retry(mut self, max_attempts: Option<u32>) -> std::result::Result<Dispatch<Pending>, Dispatch<Failed>> {
        let next_attempt = self.entry.attempt_count + 1;
        if let Some(max) = max_attempts {
            if next_attempt >= max {
                return Err(self);
            }
        }
        self.entry.attempt_count = next_attempt;
        Ok(Dispatch {
            state: Pending,
            entry: self.entry,
        })
    }
}

//! Processor (spec §4.D): the serial decision loop that pulls one request at
//! a time, dispatches it through the transport, and routes the outcome —
//! retry-with-backoff, terminal success, or terminal failure/abort.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;

use crate::config::{BackoffConfig, QueueConfig};
use crate::dispatcher::{Dispatcher, Outcome};
use crate::error::Result;
use crate::merger::{self, IdentifierExtractor};
use crate::queue::Storage;
use crate::request::types::{Dispatch, Pending, Request, RequestId, RetryPolicy};
use crate::request::Resolution;
use crate::scheduler::Scheduler;
use crate::transport::{NetworkClient, TransportResponse};

/// What `process_next` accomplished, used by the scheduler's drive loop to
/// decide whether to keep pulling or go back to waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Dispatched,
    NothingToPull,
}

/// Bookkeeping the processor keeps for one in-flight dispatch: enough to
/// cancel it, to deliver its eventual outcome to every request that was
/// deduplicated against it, and to release its concurrency permit on
/// completion.
struct InFlightRecord {
    primary_request: Request,
    barrier: bool,
    abort_handle: AbortHandle,
    merged: Vec<Request>,
    #[allow(dead_code)] // held for its Drop impl, never read
    permit: Option<OwnedSemaphorePermit>,
}

#[derive(Default)]
struct ProcessorState {
    in_flight: HashMap<u64, InFlightRecord>,
    barrier_in_flight: bool,
}

/// Classifies which branch of spec §4.D's result-routing table a failed
/// dispatch fell into, since each has different retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    TransientNetwork,
    ServerError,
    ClientError,
}

/// Whether a failure of `kind` is retried under `retry_policy`, per spec
/// §4.D's routing table: a 4xx is never retried regardless of policy; a 5xx
/// only under `RetryAlways`; a transient network failure under either
/// `RetryOnNetworkErrors` or `RetryAlways`.
fn retry_eligible(kind: FailureKind, retry_policy: RetryPolicy) -> bool {
    match kind {
        FailureKind::TransientNetwork => {
            matches!(retry_policy, RetryPolicy::RetryOnNetworkErrors | RetryPolicy::RetryAlways)
        }
        FailureKind::ServerError => matches!(retry_policy, RetryPolicy::RetryAlways),
        FailureKind::ClientError => false,
    }
}

pub struct Processor {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn NetworkClient>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    config: QueueConfig,
    identifier_extractor: Option<IdentifierExtractor>,
    non_barrier_permits: Arc<Semaphore>,
    state: Mutex<ProcessorState>,
}

impl Processor {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn NetworkClient>,
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<Scheduler>,
        config: QueueConfig,
        identifier_extractor: Option<IdentifierExtractor>,
    ) -> Self {
        let non_barrier_permits = Arc::new(Semaphore::new(config.max_concurrent_non_barrier.max(1)));
        Self {
            storage,
            transport,
            dispatcher,
            scheduler,
            config,
            identifier_extractor,
            non_barrier_permits,
            state: Mutex::new(ProcessorState::default()),
        }
    }

    pub async fn register(&self, handler: Arc<dyn crate::dispatcher::Handler>) -> crate::dispatcher::HandlerToken {
        self.dispatcher.register(handler).await
    }

    pub async fn unregister(&self, token: crate::dispatcher::HandlerToken) {
        self.dispatcher.unregister(token).await
    }

    /// Pulls the head request and dispatches it, honoring barrier gating,
    /// the non-barrier concurrency limit, and byte-identical deduplication.
    /// Returns immediately once the transport call is spawned — per spec
    /// §4.D this never blocks the caller on the HTTP round-trip.
    pub async fn process_next(self: &Arc<Self>) -> PullOutcome {
        let head = match self.storage.peek_first().await {
            Ok(Some(h)) => h,
            Ok(None) => return PullOutcome::NothingToPull,
            Err(e) => {
                tracing::error!(error = %e, "failed to peek queue head");
                return PullOutcome::NothingToPull;
            }
        };
        let policy = head.request.config.queueing_policy;

        let mut state = self.state.lock().await;
        if state.barrier_in_flight {
            return PullOutcome::NothingToPull;
        }

        let dedup_target = if head.request.config.deduplicate && !policy.barrier {
            state
                .in_flight
                .iter()
                .find(|(_, r)| !r.barrier && r.primary_request.config.same_bytes(&head.request.config))
                .map(|(&pos, _)| pos)
        } else {
            None
        };

        if dedup_target.is_none() && policy.barrier && !state.in_flight.is_empty() {
            // An earlier non-barrier dispatch hasn't drained yet; the
            // barrier must wait (spec §4.D, "Concurrency against barriers").
            return PullOutcome::NothingToPull;
        }

        let permit = if dedup_target.is_none() && !policy.barrier {
            match self.non_barrier_permits.clone().try_acquire_owned() {
                Ok(p) => Some(p),
                Err(_) => return PullOutcome::NothingToPull,
            }
        } else {
            None
        };

        let entry = match self.storage.drop_first().await {
            Ok(Some(e)) => e,
            Ok(None) => return PullOutcome::NothingToPull,
            Err(e) => {
                tracing::error!(error = %e, "failed to pop queue head");
                return PullOutcome::NothingToPull;
            }
        };

        if let Some(target_pos) = dedup_target {
            match state.in_flight.get_mut(&target_pos) {
                Some(record) => {
                    tracing::debug!(
                        position = entry.position,
                        merged_into = target_pos,
                        "deduplicated request merged into in-flight call"
                    );
                    record.merged.push(entry.request);
                    return PullOutcome::Dispatched;
                }
                None => {
                    tracing::warn!(
                        position = entry.position,
                        "dedup target completed before merge; dispatching independently"
                    );
                }
            }
        }

        if policy.barrier {
            state.barrier_in_flight = true;
        }

        let position = entry.position;
        let barrier = policy.barrier;
        let timeout = entry
            .request
            .config
            .timeout_secs
            .map(Duration::from_secs);
        let primary_request = entry.request.clone();

        let pending = Dispatch {
            state: Pending,
            entry,
        };
        let dispatch = pending.dispatch(self.transport.clone());
        let abort_handle = dispatch.state.abort_handle.clone();

        state.in_flight.insert(
            position,
            InFlightRecord {
                primary_request,
                barrier,
                abort_handle,
                merged: Vec::new(),
                permit,
            },
        );
        drop(state);

        let this = self.clone();
        tokio::spawn(async move {
            this.run_dispatch(dispatch, timeout).await;
        });

        PullOutcome::Dispatched
    }

    async fn run_dispatch(self: Arc<Self>, dispatch: Dispatch<crate::request::types::InFlight>, timeout: Option<Duration>) {
        let position = dispatch.entry.position;
        let result = match timeout {
            Some(d) => tokio::time::timeout(d, dispatch.complete()).await,
            None => Ok(dispatch.complete().await),
        };

        match result {
            Ok(resolution) => self.route_resolution(position, resolution).await,
            Err(_) => self.route_timeout(position).await,
        }
    }

    async fn route_timeout(&self, position: u64) {
        tracing::warn!(position, "request timed out, cancelling");
        let mut state = self.state.lock().await;
        let Some(record) = state.in_flight.remove(&position) else {
            return;
        };
        if record.barrier {
            state.barrier_in_flight = false;
        }
        drop(state);

        record.abort_handle.abort();
        self.deliver(&record, Outcome::Aborted { reason: "timeout".to_string() })
            .await;
        let queue_empty = self.storage.is_empty().await.unwrap_or(false);
        self.scheduler.request_did_succeed(queue_empty);
    }

    async fn route_resolution(&self, position: u64, resolution: Resolution) {
        let mut state = self.state.lock().await;
        let Some(record) = state.in_flight.remove(&position) else {
            tracing::warn!(position, "resolution delivered for unknown in-flight position");
            return;
        };
        if record.barrier {
            state.barrier_in_flight = false;
        }
        drop(state);

        match resolution {
            Resolution::Success(dispatch) => self.on_success(record, dispatch).await,
            Resolution::TransientNetwork(dispatch) => {
                self.on_failure(record, dispatch, FailureKind::TransientNetwork).await
            }
            Resolution::ServerError(dispatch) => {
                self.on_failure(record, dispatch, FailureKind::ServerError).await
            }
            Resolution::ClientError(dispatch) => {
                self.on_failure(record, dispatch, FailureKind::ClientError).await
            }
        }
    }

    async fn on_success(&self, record: InFlightRecord, dispatch: Dispatch<crate::request::types::Completed>) {
        let completed = dispatch.state;
        let outcome = Outcome::Success {
            status_code: completed.status_code,
            headers: completed.headers.clone(),
            body: completed.body.clone(),
        };
        self.deliver(&record, outcome).await;

        if let (Some(extractor), Some(snapshot)) =
            (&self.identifier_extractor, &record.primary_request.identifier_snapshot)
        {
            let response = TransportResponse {
                status_code: completed.status_code,
                headers: completed.headers,
                body: completed.body,
            };
            if let Some(remote_id) = extractor(&response) {
                match merger::rewrite(self.storage.as_ref(), &snapshot.0, &remote_id).await {
                    Ok(()) => {
                        self.dispatcher
                            .dispatch_identifier_merge(&snapshot.0, &remote_id)
                            .await;
                    }
                    Err(e) => tracing::error!(error = %e, "identifier merge failed"),
                }
            }
        }

        let queue_empty = self.storage.is_empty().await.unwrap_or(false);
        self.scheduler.request_did_succeed(queue_empty);
    }

    async fn on_failure(
        &self,
        record: InFlightRecord,
        dispatch: Dispatch<crate::request::types::Failed>,
        kind: FailureKind,
    ) {
        let policy = record.primary_request.config.queueing_policy;

        if !retry_eligible(kind, policy.retry_policy) {
            let outcome = match kind {
                FailureKind::ClientError | FailureKind::ServerError => Outcome::Failed {
                    status_code: dispatch.state.status_code,
                    error_kind: dispatch.state.error.clone(),
                    body: None,
                },
                FailureKind::TransientNetwork => Outcome::Aborted {
                    reason: dispatch.state.error.clone(),
                },
            };
            self.deliver(&record, outcome).await;
            let queue_empty = self.storage.is_empty().await.unwrap_or(false);
            self.scheduler.request_did_succeed(queue_empty);
            return;
        }

        let max_attempts = policy.max_attempts.or(self.config.default_max_attempts);
        match dispatch.retry(max_attempts) {
            Ok(pending) => {
                let attempt = pending.entry.attempt_count;
                let backoff: BackoffConfig = policy
                    .backoff
                    .map(Into::into)
                    .unwrap_or(self.config.default_backoff);
                match self.storage.prepend(pending.entry.request.clone()).await {
                    Ok(_) => {
                        let delay = Duration::from_millis(backoff.delay_ms(attempt));
                        self.scheduler.request_did_fail(delay);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "retry prepend failed; reporting terminal failure");
                        self.deliver(
                            &record,
                            Outcome::Failed {
                                status_code: None,
                                error_kind: e.to_string(),
                                body: None,
                            },
                        )
                        .await;
                        let queue_empty = self.storage.is_empty().await.unwrap_or(false);
                        self.scheduler.request_did_succeed(queue_empty);
                    }
                }
            }
            Err(failed) => {
                tracing::warn!(position = failed.entry.position, "retries exhausted");
                self.deliver(
                    &record,
                    Outcome::Aborted {
                        reason: format!("retries exhausted: {}", failed.state.error),
                    },
                )
                .await;
                let queue_empty = self.storage.is_empty().await.unwrap_or(false);
                self.scheduler.request_did_succeed(queue_empty);
            }
        }
    }

    /// Delivers `outcome` to the primary request and to every request that
    /// was deduplicated against it (spec §4.D, "its handlers inherit the
    /// in-flight request's eventual outcome").
    async fn deliver(&self, record: &InFlightRecord, outcome: Outcome) {
        self.dispatcher.dispatch(&record.primary_request, outcome.clone()).await;
        for merged in &record.merged {
            self.dispatcher.dispatch(merged, outcome.clone()).await;
        }
    }

    /// Cancels a specific request, whether still queued or in flight.
    /// Returns `Ok(true)` if a matching request was found, `Ok(false)`
    /// otherwise.
    pub async fn abort(&self, request_id: RequestId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let hit = state.in_flight.iter().find_map(|(&pos, record)| {
            if record.primary_request.id == request_id {
                Some((pos, true))
            } else if record.merged.iter().any(|m| m.id == request_id) {
                Some((pos, false))
            } else {
                None
            }
        });

        if let Some((pos, is_primary)) = hit {
            if is_primary {
                let record = state.in_flight.remove(&pos).unwrap();
                if record.barrier {
                    state.barrier_in_flight = false;
                }
                drop(state);
                record.abort_handle.abort();
                self.deliver(&record, Outcome::Aborted { reason: "cancelled".to_string() })
                    .await;
                let queue_empty = self.storage.is_empty().await.unwrap_or(false);
                self.scheduler.request_did_succeed(queue_empty);
                return Ok(true);
            }

            let removed = state
                .in_flight
                .get_mut(&pos)
                .and_then(|record| {
                    let idx = record.merged.iter().position(|m| m.id == request_id)?;
                    Some(record.merged.remove(idx))
                });
            drop(state);
            if let Some(req) = removed {
                self.dispatcher
                    .dispatch(&req, Outcome::Aborted { reason: "cancelled".to_string() })
                    .await;
                return Ok(true);
            }
            return Ok(false);
        }
        drop(state);

        let found: std::sync::Mutex<Option<Request>> = std::sync::Mutex::new(None);
        self.storage
            .retain(&|r: &Request| {
                if r.id == request_id {
                    *found.lock().unwrap() = Some(r.clone());
                    false
                } else {
                    true
                }
            })
            .await?;

        match found.into_inner().unwrap() {
            Some(req) => {
                self.dispatcher
                    .dispatch(&req, Outcome::Aborted { reason: "cancelled".to_string() })
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

//! Scheduler (spec §4.C): owns timing decisions for when the processor may
//! pull the next request. Reactive rather than polling on a fixed interval —
//! a `Notify` wakes the drive loop on enqueue, completion, or `flush`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::processor::{PullOutcome, Processor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    WaitingForConnectivity,
    BackingOff,
    Running,
}

/// Drives the processor: enters `Running` whenever there's reason to
/// believe work is available, and keeps calling `processor.process_next()`
/// until the processor reports nothing left to pull.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    wake: Notify,
    connected: AtomicBool,
    /// Bumped by `flush` so a stale backoff timer started before the flush
    /// doesn't clobber the state it sets.
    generation: AtomicU64,
    /// The currently pending backoff sleep, if any; cancelled on `shutdown`
    /// so no timer outlives the queue (spec §5, "must be cancelled on
    /// shutdown to avoid leaks").
    backoff_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedulerState::Idle),
            wake: Notify::new(),
            connected: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            backoff_handle: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub fn set_connected(self: &Arc<Self>, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            let mut state = self.state.lock();
            if *state == SchedulerState::WaitingForConnectivity {
                *state = SchedulerState::Running;
                drop(state);
                self.wake.notify_one();
            }
        } else {
            *self.state.lock() = SchedulerState::WaitingForConnectivity;
        }
    }

    /// A new request was appended to the queue.
    pub fn did_enqueue_new_request(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if *state == SchedulerState::Idle {
            *state = if self.connected.load(Ordering::SeqCst) {
                SchedulerState::Running
            } else {
                SchedulerState::WaitingForConnectivity
            };
        }
        drop(state);
        self.wake.notify_one();
    }

    /// A dispatch completed successfully.
    pub fn request_did_succeed(self: &Arc<Self>, queue_empty: bool) {
        *self.state.lock() = if queue_empty {
            SchedulerState::Idle
        } else {
            SchedulerState::Running
        };
        self.wake.notify_one();
    }

    /// A dispatch failed in a way that's eligible for backoff. Schedules a
    /// timer; when it elapses (and no intervening `flush` superseded it)
    /// the scheduler returns to `Running`.
    pub fn request_did_fail(self: &Arc<Self>, backoff: Duration) {
        *self.state.lock() = SchedulerState::BackingOff;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if this.generation.load(Ordering::SeqCst) == generation {
                *this.state.lock() = SchedulerState::Running;
                this.wake.notify_one();
            }
        });
        *self.backoff_handle.lock() = Some(handle);
    }

    /// Force an immediate attempt, clearing any pending backoff timer.
    pub fn flush(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.backoff_handle.lock().take() {
            handle.abort();
        }
        *self.state.lock() = SchedulerState::Running;
        self.wake.notify_one();
    }

    /// Cancel any outstanding backoff timer. Called when the owning `Queue`
    /// shuts down so no sleeping task outlives it.
    pub fn shutdown(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.backoff_handle.lock().take() {
            handle.abort();
        }
    }

    /// Run the drive loop until `shutdown` fires. Intended to be spawned
    /// once per `Queue` instance.
    pub async fn run(self: Arc<Self>, processor: Arc<Processor>) {
        loop {
            self.wake.notified().await;
            loop {
                if self.state() != SchedulerState::Running {
                    break;
                }
                match processor.process_next().await {
                    PullOutcome::Dispatched => continue,
                    PullOutcome::NothingToPull => break,
                }
            }
        }
    }
}

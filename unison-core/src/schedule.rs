use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use unison_protocol::time::RoomMs;
use unison_protocol::types::{Epoch, Seq, StartDescriptor};

/// The coarse sleep hands over to the fine tick this far before the
/// target, so OS scheduler jitter on the long sleep cannot overshoot.
pub const COARSE_LEAD_MS: i64 = 80;

const FINE_TICK_MS: u64 = 2;
const IDLE_AFTER_MS: u64 = 2_000;

/// Source of room time for the waiting task. The facade backs this
/// with the room clock; tests substitute a deterministic one.
pub trait RoomTime: Send + Sync + 'static {
    fn room_now(&self) -> RoomMs;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    Idle,
    Preparing,
    Waiting,
    Started,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    pub actual_start: RoomMs,
    /// `actual_start - target`: positive when the start fired late.
    pub error_ms: i64,
}

struct Shared {
    state: StartState,
    active: Option<(Epoch, Seq)>,
    fired: Option<(Epoch, Seq)>,
    max_epoch: Epoch,
    outcome: Option<StartOutcome>,
    task: Option<JoinHandle<()>>,
}

/// Coordinated-start scheduler: prepare once, then fire `on_start` at
/// the descriptor's room time via a coarse sleep plus a fine poll.
///
/// `(epoch, seq)` identifies an attempt; duplicates and strictly older
/// epochs are refused, and `on_start` fires at most once per pair.
pub struct StartScheduler {
    shared: Arc<Mutex<Shared>>,
}

impl StartScheduler {
    pub fn new() -> Self {
        StartScheduler {
            shared: Arc::new(Mutex::new(Shared {
                state: StartState::Idle,
                active: None,
                fired: None,
                max_epoch: Epoch::default(),
                outcome: None,
                task: None,
            })),
        }
    }

    pub fn state(&self) -> StartState {
        self.lock().state
    }

    pub fn last_outcome(&self) -> Option<StartOutcome> {
        self.lock().outcome
    }

    /// Schedule an attempt. Returns false (with a warning) when the
    /// descriptor is a duplicate or belongs to an older epoch. A newer
    /// descriptor cancels whatever was outstanding.
    pub fn schedule<C, P, PF, E, S>(
        &self,
        clock: C,
        descriptor: StartDescriptor,
        prepare: P,
        on_start: S,
    ) -> bool
    where
        C: RoomTime,
        P: FnOnce() -> PF + Send + 'static,
        PF: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
        S: FnOnce(StartOutcome) + Send + 'static,
    {
        let mut shared = self.lock();
        let pair = (descriptor.epoch, descriptor.seq);

        if descriptor.epoch < shared.max_epoch {
            log::warn!(
                "refusing start for stale epoch {} (current {})",
                descriptor.epoch,
                shared.max_epoch
            );
            return false;
        }
        if shared.fired.is_some_and(|fired| pair <= fired) {
            log::warn!(
                "refusing start: epoch={} seq={} already fired",
                descriptor.epoch,
                descriptor.seq
            );
            return false;
        }
        if matches!(
            shared.state,
            StartState::Preparing | StartState::Waiting | StartState::Started
        ) && shared.active.is_some_and(|active| pair <= active)
        {
            log::warn!(
                "ignoring duplicate start: epoch={} seq={}",
                descriptor.epoch,
                descriptor.seq
            );
            return false;
        }

        if let Some(task) = shared.task.take() {
            task.abort();
        }

        shared.state = StartState::Preparing;
        shared.active = Some(pair);
        shared.max_epoch = descriptor.epoch;
        shared.outcome = None;

        let task = tokio::spawn(run_attempt(
            self.shared.clone(),
            clock,
            descriptor,
            prepare,
            on_start,
        ));
        shared.task = Some(task);
        true
    }

    /// Drop timers and return to idle without firing.
    pub fn cancel(&self) {
        let mut shared = self.lock();
        if let Some(task) = shared.task.take() {
            task.abort();
        }
        if matches!(shared.state, StartState::Preparing | StartState::Waiting) {
            shared.state = StartState::Idle;
            shared.active = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }
}

impl Default for StartScheduler {
    fn default() -> Self {
        StartScheduler::new()
    }
}

async fn run_attempt<C, P, PF, E, S>(
    shared: Arc<Mutex<Shared>>,
    clock: C,
    descriptor: StartDescriptor,
    prepare: P,
    on_start: S,
) where
    C: RoomTime,
    P: FnOnce() -> PF + Send + 'static,
    PF: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
    S: FnOnce(StartOutcome) + Send + 'static,
{
    let pair = (descriptor.epoch, descriptor.seq);
    let target = descriptor.start_at_room_time_ms;

    if let Err(e) = prepare().await {
        log::warn!(
            "start prepare failed: epoch={} seq={}: {e}",
            descriptor.epoch,
            descriptor.seq
        );
        shared.lock().unwrap().state = StartState::Failed;
        return;
    }

    shared.lock().unwrap().state = StartState::Waiting;

    // two-phase wait: one long sleep to just short of the target, then
    // a tight poll so the fire lands within timer granularity
    let remaining = target.millis_since(clock.room_now());
    if remaining > COARSE_LEAD_MS {
        tokio::time::sleep(Duration::from_millis((remaining - COARSE_LEAD_MS) as u64)).await;
    }
    while clock.room_now() < target {
        tokio::time::sleep(Duration::from_millis(FINE_TICK_MS)).await;
    }

    let actual = clock.room_now();
    let outcome = StartOutcome {
        actual_start: actual,
        error_ms: actual.millis_since(target),
    };

    {
        let mut shared = shared.lock().unwrap();
        shared.state = StartState::Started;
        shared.outcome = Some(outcome);
        shared.fired = Some(shared.fired.map_or(pair, |fired| fired.max(pair)));
    }

    log::info!(
        "playback started: epoch={} seq={} error={}ms",
        descriptor.epoch,
        descriptor.seq,
        outcome.error_ms
    );
    on_start(outcome);

    tokio::time::sleep(Duration::from_millis(IDLE_AFTER_MS)).await;

    let mut shared = shared.lock().unwrap();
    if shared.state == StartState::Started && shared.active == Some(pair) {
        shared.state = StartState::Idle;
    }
}

//! Schedule-point payloads
//!
//! One payload shape per schedule point, aggregated in the [`Payload`] sum
//! type. A payload carries the inputs the yielding thread supplies and the
//! output fields the scheduler writes before the yield returns. Output fields
//! are written by *every* backend; a backend with no opinion writes the
//! identity choice (FIFO, handle-all-in-order, ready iff due).
//!
//! Payloads embed [`PAYLOAD_MAGIC`], written by their constructors. The
//! façade rejects a payload whose magic is wrong or whose variant does not
//! match the yield's schedule point — both indicate a miscoded caller.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::{CallbackKind, EventId, NodeId, SchedulePoint, TimerId, WorkId};

/// Sentinel establishing that a payload was built by a constructor.
pub const PAYLOAD_MAGIC: u32 = 0x5EED_CB01;

/// A queue entry visible at the `TP_WANTS_WORK` / `TP_GETTING_WORK` /
/// `LOOPER_GETTING_DONE` points. The caller snapshots the queue while holding
/// its mutex; `node` names the callback that choosing this entry will execute,
/// which is how replay matches entries against the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedWork {
    pub work: WorkId,
    pub node: NodeId,
}

/// One event returned by the poll call. `node` is absent when the event's
/// callback has not been registered; replay then treats the event as
/// unmatchable and defers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolledEvent {
    pub event: EventId,
    pub node: Option<NodeId>,
}

/// A timer that passed the `TIMER_READY` check this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyTimer {
    pub timer: TimerId,
    pub deadline: u64,
    pub node: NodeId,
}

/// An ordered set of items the scheduler may reorder, with one per-item
/// "thought": `true` means handle/run the item this turn, `false` means defer
/// it to a later turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Shuffleable<T> {
    pub items: Vec<T>,
    pub thoughts: Vec<bool>,
}

impl<T: PartialEq> Shuffleable<T> {
    /// The identity decision: original order, everything handled.
    #[must_use]
    pub fn identity(items: Vec<T>) -> Self {
        let thoughts = vec![true; items.len()];
        Self { items, thoughts }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when `items` holds exactly the members of `original`, in any
    /// order, and `thoughts` has matching length. Used to validate backend
    /// outputs: reordering may permute but never drop or invent items.
    #[must_use]
    pub fn is_permutation_of(&self, original: &[T]) -> bool {
        if self.items.len() != original.len() || self.thoughts.len() != self.items.len() {
            return false;
        }
        // Multiset comparison; n is small at every schedule point.
        let mut matched = vec![false; original.len()];
        for item in &self.items {
            let Some(pos) = original
                .iter()
                .enumerate()
                .position(|(i, o)| !matched[i] && o == item)
            else {
                return false;
            };
            matched[pos] = true;
        }
        true
    }
}

/// `BEFORE_EXEC_CB` / `AFTER_EXEC_CB`. `node` is `None` for callbacks that
/// carry no logical identity; those still get the lock bracket but produce no
/// schedule record.
#[derive(Debug, Clone)]
pub struct ExecCbPayload {
    pub magic: u32,
    pub kind: CallbackKind,
    pub node: Option<NodeId>,
}

/// `LOOPER_BEFORE_EPOLL` / `LOOPER_AFTER_EPOLL`. Observation only.
#[derive(Debug, Clone)]
pub struct EpollPayload {
    pub magic: u32,
}

/// `LOOPER_IOPOLL_BEFORE_HANDLING_EVENTS`. The scheduler may reorder the
/// events and defer any subset; a deferred event is presented again after the
/// next poll.
#[derive(Debug, Clone)]
pub struct HandleEventsPayload {
    pub magic: u32,
    pub events: Shuffleable<PolledEvent>,
}

/// `TP_WANTS_WORK`. `since` is when this worker began wanting work; the
/// thread-pool reordering backend bounds its delays against it.
#[derive(Debug, Clone)]
pub struct WantsWorkPayload {
    pub magic: u32,
    pub since: Instant,
    pub queue: Vec<QueuedWork>,
    /// OUTPUT. `true` means proceed to `TP_GETTING_WORK`.
    pub should_get_work: bool,
}

/// `TP_GETTING_WORK` and `LOOPER_GETTING_DONE` (same shape, as the queues are
/// alike). `index` of 0 means "treat the queue as FIFO".
#[derive(Debug, Clone)]
pub struct GettingWorkPayload {
    pub magic: u32,
    pub queue: Vec<QueuedWork>,
    /// OUTPUT. Always `< queue.len()`.
    pub index: usize,
}

/// `TP_GOT_WORK` and `TP_{BEFORE,AFTER}_PUT_DONE`. Observation only;
/// `original_index` is the queue position the item was taken from.
#[derive(Debug, Clone)]
pub struct GotWorkPayload {
    pub magic: u32,
    pub work: WorkId,
    pub original_index: usize,
}

/// `LOOPER_RUN_CLOSING`. `defer = true` postpones the current handle and all
/// subsequent ones to the next loop turn.
#[derive(Debug, Clone)]
pub struct RunClosingPayload {
    pub magic: u32,
    /// OUTPUT.
    pub defer: bool,
}

/// `TIMER_READY`. Identity choice: `ready = now >= deadline`.
#[derive(Debug, Clone)]
pub struct TimerReadyPayload {
    pub magic: u32,
    pub timer: TimerId,
    pub node: NodeId,
    pub deadline: u64,
    pub now: u64,
    /// OUTPUT.
    pub ready: bool,
}

/// `TIMER_RUN`. The set of ready timers about to fire.
#[derive(Debug, Clone)]
pub struct TimerRunPayload {
    pub magic: u32,
    pub timers: Shuffleable<ReadyTimer>,
}

/// `TIMER_NEXT_TIMEOUT`. `time_until_fire` is a recommendation to the poll
/// call, not a promise; the identity choice is `deadline - now` (saturating),
/// or no wakeup at all when no timer is pending.
#[derive(Debug, Clone)]
pub struct NextTimeoutPayload {
    pub magic: u32,
    pub timer: Option<TimerId>,
    pub deadline: u64,
    pub now: u64,
    /// OUTPUT. `u64::MAX` means "no pending timer, block indefinitely".
    pub time_until_fire: u64,
}

/// The payload passed to `thread_yield`, one variant per schedule point.
#[derive(Debug, Clone)]
pub enum Payload {
    BeforeExecCb(ExecCbPayload),
    AfterExecCb(ExecCbPayload),
    LooperBeforeEpoll(EpollPayload),
    LooperAfterEpoll(EpollPayload),
    HandleEvents(HandleEventsPayload),
    GettingDone(GettingWorkPayload),
    RunClosing(RunClosingPayload),
    TimerReady(TimerReadyPayload),
    TimerRun(TimerRunPayload),
    NextTimeout(NextTimeoutPayload),
    WantsWork(WantsWorkPayload),
    GettingWork(GettingWorkPayload),
    GotWork(GotWorkPayload),
    BeforePutDone(GotWorkPayload),
    AfterPutDone(GotWorkPayload),
}

impl Payload {
    #[must_use]
    pub fn before_exec_cb(kind: CallbackKind, node: Option<NodeId>) -> Self {
        Payload::BeforeExecCb(ExecCbPayload { magic: PAYLOAD_MAGIC, kind, node })
    }

    #[must_use]
    pub fn after_exec_cb(kind: CallbackKind, node: Option<NodeId>) -> Self {
        Payload::AfterExecCb(ExecCbPayload { magic: PAYLOAD_MAGIC, kind, node })
    }

    #[must_use]
    pub fn before_epoll() -> Self {
        Payload::LooperBeforeEpoll(EpollPayload { magic: PAYLOAD_MAGIC })
    }

    #[must_use]
    pub fn after_epoll() -> Self {
        Payload::LooperAfterEpoll(EpollPayload { magic: PAYLOAD_MAGIC })
    }

    #[must_use]
    pub fn handle_events(events: Vec<PolledEvent>) -> Self {
        Payload::HandleEvents(HandleEventsPayload {
            magic: PAYLOAD_MAGIC,
            events: Shuffleable::identity(events),
        })
    }

    #[must_use]
    pub fn getting_done(queue: Vec<QueuedWork>) -> Self {
        Payload::GettingDone(GettingWorkPayload { magic: PAYLOAD_MAGIC, queue, index: 0 })
    }

    #[must_use]
    pub fn run_closing() -> Self {
        Payload::RunClosing(RunClosingPayload { magic: PAYLOAD_MAGIC, defer: false })
    }

    #[must_use]
    pub fn timer_ready(timer: TimerId, node: NodeId, deadline: u64, now: u64) -> Self {
        Payload::TimerReady(TimerReadyPayload {
            magic: PAYLOAD_MAGIC,
            timer,
            node,
            deadline,
            now,
            ready: false,
        })
    }

    #[must_use]
    pub fn timer_run(timers: Vec<ReadyTimer>) -> Self {
        Payload::TimerRun(TimerRunPayload {
            magic: PAYLOAD_MAGIC,
            timers: Shuffleable::identity(timers),
        })
    }

    #[must_use]
    pub fn next_timeout(timer: Option<TimerId>, deadline: u64, now: u64) -> Self {
        Payload::NextTimeout(NextTimeoutPayload {
            magic: PAYLOAD_MAGIC,
            timer,
            deadline,
            now,
            time_until_fire: 0,
        })
    }

    #[must_use]
    pub fn wants_work(since: Instant, queue: Vec<QueuedWork>) -> Self {
        Payload::WantsWork(WantsWorkPayload {
            magic: PAYLOAD_MAGIC,
            since,
            queue,
            should_get_work: false,
        })
    }

    #[must_use]
    pub fn getting_work(queue: Vec<QueuedWork>) -> Self {
        Payload::GettingWork(GettingWorkPayload { magic: PAYLOAD_MAGIC, queue, index: 0 })
    }

    #[must_use]
    pub fn got_work(work: WorkId, original_index: usize) -> Self {
        Payload::GotWork(GotWorkPayload { magic: PAYLOAD_MAGIC, work, original_index })
    }

    #[must_use]
    pub fn before_put_done(work: WorkId, original_index: usize) -> Self {
        Payload::BeforePutDone(GotWorkPayload { magic: PAYLOAD_MAGIC, work, original_index })
    }

    #[must_use]
    pub fn after_put_done(work: WorkId, original_index: usize) -> Self {
        Payload::AfterPutDone(GotWorkPayload { magic: PAYLOAD_MAGIC, work, original_index })
    }

    /// The schedule point this payload belongs to. The pairing is total and
    /// injective: exactly one variant per point.
    #[must_use]
    pub fn point(&self) -> SchedulePoint {
        match self {
            Payload::BeforeExecCb(_) => SchedulePoint::BeforeExecCb,
            Payload::AfterExecCb(_) => SchedulePoint::AfterExecCb,
            Payload::LooperBeforeEpoll(_) => SchedulePoint::LooperBeforeEpoll,
            Payload::LooperAfterEpoll(_) => SchedulePoint::LooperAfterEpoll,
            Payload::HandleEvents(_) => SchedulePoint::LooperIopollBeforeHandlingEvents,
            Payload::GettingDone(_) => SchedulePoint::LooperGettingDone,
            Payload::RunClosing(_) => SchedulePoint::LooperRunClosing,
            Payload::TimerReady(_) => SchedulePoint::TimerReady,
            Payload::TimerRun(_) => SchedulePoint::TimerRun,
            Payload::NextTimeout(_) => SchedulePoint::TimerNextTimeout,
            Payload::WantsWork(_) => SchedulePoint::TpWantsWork,
            Payload::GettingWork(_) => SchedulePoint::TpGettingWork,
            Payload::GotWork(_) => SchedulePoint::TpGotWork,
            Payload::BeforePutDone(_) => SchedulePoint::TpBeforePutDone,
            Payload::AfterPutDone(_) => SchedulePoint::TpAfterPutDone,
        }
    }

    fn magic(&self) -> u32 {
        match self {
            Payload::BeforeExecCb(p) | Payload::AfterExecCb(p) => p.magic,
            Payload::LooperBeforeEpoll(p) | Payload::LooperAfterEpoll(p) => p.magic,
            Payload::HandleEvents(p) => p.magic,
            Payload::GettingDone(p) | Payload::GettingWork(p) => p.magic,
            Payload::RunClosing(p) => p.magic,
            Payload::TimerReady(p) => p.magic,
            Payload::TimerRun(p) => p.magic,
            Payload::NextTimeout(p) => p.magic,
            Payload::WantsWork(p) => p.magic,
            Payload::GotWork(p) | Payload::BeforePutDone(p) | Payload::AfterPutDone(p) => p.magic,
        }
    }

    /// Non-destructive validity check: magic intact and variant matching the
    /// point the caller claims to be at.
    #[must_use]
    pub fn looks_valid(&self, point: SchedulePoint) -> bool {
        self.magic() == PAYLOAD_MAGIC && self.point() == point
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructed_payload_is_valid() {
        let payload = Payload::timer_ready(TimerId(1), NodeId(2), 10, 5);
        assert!(payload.looks_valid(SchedulePoint::TimerReady));
    }

    #[test]
    fn test_wrong_point_rejected() {
        let payload = Payload::timer_ready(TimerId(1), NodeId(2), 10, 5);
        assert!(!payload.looks_valid(SchedulePoint::TimerRun));
    }

    #[test]
    fn test_zeroed_magic_rejected() {
        let mut payload = Payload::run_closing();
        if let Payload::RunClosing(ref mut p) = payload {
            p.magic = 0;
        }
        assert!(!payload.looks_valid(SchedulePoint::LooperRunClosing));
    }

    #[test]
    fn test_every_point_has_a_variant() {
        let payloads = [
            Payload::before_exec_cb(CallbackKind::Timer, None),
            Payload::after_exec_cb(CallbackKind::Timer, None),
            Payload::before_epoll(),
            Payload::after_epoll(),
            Payload::handle_events(vec![]),
            Payload::getting_done(vec![]),
            Payload::run_closing(),
            Payload::timer_ready(TimerId(0), NodeId(0), 0, 0),
            Payload::timer_run(vec![]),
            Payload::next_timeout(None, 0, 0),
            Payload::wants_work(Instant::now(), vec![]),
            Payload::getting_work(vec![]),
            Payload::got_work(WorkId(0), 0),
            Payload::before_put_done(WorkId(0), 0),
            Payload::after_put_done(WorkId(0), 0),
        ];
        let mut seen: Vec<SchedulePoint> = payloads.iter().map(Payload::point).collect();
        seen.sort_by_key(|p| p.to_string());
        seen.dedup();
        assert_eq!(seen.len(), SchedulePoint::ALL.len());
    }

    #[test]
    fn test_shuffleable_permutation_check() {
        let original = vec![1, 2, 3];
        let ok = Shuffleable { items: vec![3, 1, 2], thoughts: vec![true, false, true] };
        assert!(ok.is_permutation_of(&original));

        let dropped = Shuffleable { items: vec![1, 2], thoughts: vec![true, true] };
        assert!(!dropped.is_permutation_of(&original));

        let invented = Shuffleable { items: vec![1, 2, 4], thoughts: vec![true, true, true] };
        assert!(!invented.is_permutation_of(&original));

        let short_thoughts = Shuffleable { items: vec![1, 2, 3], thoughts: vec![true] };
        assert!(!short_thoughts.is_permutation_of(&original));
    }
}

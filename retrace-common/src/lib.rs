// Shared vocabulary between the instrumented event loop and the scheduler.
//
// The loop links against this crate to fill in schedule-point payloads; the
// scheduler links against it to read them and to write its decisions back.
// Everything that appears on the wire (the schedule file) derives serde.

pub mod payload;

pub use payload::{
    EpollPayload, ExecCbPayload, GettingWorkPayload, GotWorkPayload, HandleEventsPayload,
    NextTimeoutPayload, Payload, PolledEvent, QueuedWork, ReadyTimer, RunClosingPayload,
    Shuffleable, TimerReadyPayload, TimerRunPayload, WantsWorkPayload, PAYLOAD_MAGIC,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a timer handle owned by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub u64);

/// Identity of a work item queued to the thread pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub u64);

/// Identity of one polled I/O event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// Handle to a logical callback node in the scheduler's causation tree.
///
/// Opaque to the loop; obtained from `Scheduler::register_node` and passed
/// back inside payloads so the scheduler can match queue entries against the
/// schedule positionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Stable identity assigned to a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadSlot(pub u32);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer:{}", self.0)
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work:{}", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event:{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

impl fmt::Display for ThreadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread:{}", self.0)
    }
}

/// The role a thread registers under. Immutable after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadRole {
    /// The single thread that runs the event loop.
    Looper,
    /// A thread-pool worker. Any number may register.
    Worker,
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadRole::Looper => write!(f, "looper"),
            ThreadRole::Worker => write!(f, "worker"),
        }
    }
}

impl FromStr for ThreadRole {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "looper" => Ok(ThreadRole::Looper),
            "worker" => Ok(ThreadRole::Worker),
            _ => Err(UnknownName { what: "thread role", name: s.to_string() }),
        }
    }
}

/// Kind of a logical callback. Replay compares nodes by kind plus tree
/// position, so the set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    /// Wildcard: returned by `next_kind` once replay has diverged, meaning
    /// "do not constrain the loop phase".
    Any,
    /// Synthetic anchor for top-level callbacks. Never executed.
    Root,
    Timer,
    Io,
    Work,
    AfterWork,
    Async,
    Prepare,
    Check,
    Idle,
    Close,
    Shutdown,
}

impl CallbackKind {
    #[must_use]
    pub fn is_wildcard(self) -> bool {
        matches!(self, CallbackKind::Any)
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallbackKind::Any => "any",
            CallbackKind::Root => "root",
            CallbackKind::Timer => "timer",
            CallbackKind::Io => "io",
            CallbackKind::Work => "work",
            CallbackKind::AfterWork => "after_work",
            CallbackKind::Async => "async",
            CallbackKind::Prepare => "prepare",
            CallbackKind::Check => "check",
            CallbackKind::Idle => "idle",
            CallbackKind::Close => "close",
            CallbackKind::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

impl FromStr for CallbackKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "any" => CallbackKind::Any,
            "root" => CallbackKind::Root,
            "timer" => CallbackKind::Timer,
            "io" => CallbackKind::Io,
            "work" => CallbackKind::Work,
            "after_work" => CallbackKind::AfterWork,
            "async" => CallbackKind::Async,
            "prepare" => CallbackKind::Prepare,
            "check" => CallbackKind::Check,
            "idle" => CallbackKind::Idle,
            "close" => CallbackKind::Close,
            "shutdown" => CallbackKind::Shutdown,
            _ => return Err(UnknownName { what: "callback kind", name: s.to_string() }),
        };
        Ok(kind)
    }
}

/// Control-flow landmarks the loop announces between callbacks.
///
/// Replay checks each announced marker against the next recorded one; a
/// mismatch means the loop is in a different phase than the schedule expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    LoopBegin,
    LoopEnd,
    TimersBegin,
    TimersEnd,
    PollBegin,
    PollEnd,
    ClosingBegin,
    ClosingEnd,
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MarkerKind::LoopBegin => "loop_begin",
            MarkerKind::LoopEnd => "loop_end",
            MarkerKind::TimersBegin => "timers_begin",
            MarkerKind::TimersEnd => "timers_end",
            MarkerKind::PollBegin => "poll_begin",
            MarkerKind::PollEnd => "poll_end",
            MarkerKind::ClosingBegin => "closing_begin",
            MarkerKind::ClosingEnd => "closing_end",
        };
        f.write_str(name)
    }
}

impl FromStr for MarkerKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "loop_begin" => MarkerKind::LoopBegin,
            "loop_end" => MarkerKind::LoopEnd,
            "timers_begin" => MarkerKind::TimersBegin,
            "timers_end" => MarkerKind::TimersEnd,
            "poll_begin" => MarkerKind::PollBegin,
            "poll_end" => MarkerKind::PollEnd,
            "closing_begin" => MarkerKind::ClosingBegin,
            "closing_end" => MarkerKind::ClosingEnd,
            _ => return Err(UnknownName { what: "marker kind", name: s.to_string() }),
        };
        Ok(kind)
    }
}

/// The sites where loop threads yield to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePoint {
    /// Either role: brackets one callback invocation.
    BeforeExecCb,
    AfterExecCb,
    /// Looper: brackets the blocking poll call.
    LooperBeforeEpoll,
    LooperAfterEpoll,
    /// Looper: before dispatching the events the poll returned.
    LooperIopollBeforeHandlingEvents,
    /// Looper: before pulling a completed work item from the done queue.
    LooperGettingDone,
    /// Looper: one iteration of the closing-handles loop.
    LooperRunClosing,
    /// Looper: one pending timer being inspected.
    TimerReady,
    /// Looper: the set of ready timers about to fire.
    TimerRun,
    /// Looper: computing the next wakeup delay.
    TimerNextTimeout,
    /// Worker: work queue non-empty, considering pickup.
    TpWantsWork,
    /// Worker: about to choose an item from the queue.
    TpGettingWork,
    /// Worker: item retrieved.
    TpGotWork,
    /// Worker: brackets queueing of a completion.
    TpBeforePutDone,
    TpAfterPutDone,
}

impl SchedulePoint {
    pub const ALL: [SchedulePoint; 15] = [
        SchedulePoint::BeforeExecCb,
        SchedulePoint::AfterExecCb,
        SchedulePoint::LooperBeforeEpoll,
        SchedulePoint::LooperAfterEpoll,
        SchedulePoint::LooperIopollBeforeHandlingEvents,
        SchedulePoint::LooperGettingDone,
        SchedulePoint::LooperRunClosing,
        SchedulePoint::TimerReady,
        SchedulePoint::TimerRun,
        SchedulePoint::TimerNextTimeout,
        SchedulePoint::TpWantsWork,
        SchedulePoint::TpGettingWork,
        SchedulePoint::TpGotWork,
        SchedulePoint::TpBeforePutDone,
        SchedulePoint::TpAfterPutDone,
    ];

    /// The role allowed to reach this point, or `None` when either may.
    #[must_use]
    pub fn allowed_role(self) -> Option<ThreadRole> {
        match self {
            SchedulePoint::BeforeExecCb | SchedulePoint::AfterExecCb => None,
            SchedulePoint::LooperBeforeEpoll
            | SchedulePoint::LooperAfterEpoll
            | SchedulePoint::LooperIopollBeforeHandlingEvents
            | SchedulePoint::LooperGettingDone
            | SchedulePoint::LooperRunClosing
            | SchedulePoint::TimerReady
            | SchedulePoint::TimerRun
            | SchedulePoint::TimerNextTimeout => Some(ThreadRole::Looper),
            SchedulePoint::TpWantsWork
            | SchedulePoint::TpGettingWork
            | SchedulePoint::TpGotWork
            | SchedulePoint::TpBeforePutDone
            | SchedulePoint::TpAfterPutDone => Some(ThreadRole::Worker),
        }
    }

    /// True for the points whose payloads carry scheduler-written outputs.
    #[must_use]
    pub fn has_outputs(self) -> bool {
        matches!(
            self,
            SchedulePoint::LooperIopollBeforeHandlingEvents
                | SchedulePoint::LooperGettingDone
                | SchedulePoint::LooperRunClosing
                | SchedulePoint::TimerReady
                | SchedulePoint::TimerRun
                | SchedulePoint::TimerNextTimeout
                | SchedulePoint::TpWantsWork
                | SchedulePoint::TpGettingWork
        )
    }
}

impl fmt::Display for SchedulePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulePoint::BeforeExecCb => "before_exec_cb",
            SchedulePoint::AfterExecCb => "after_exec_cb",
            SchedulePoint::LooperBeforeEpoll => "looper_before_epoll",
            SchedulePoint::LooperAfterEpoll => "looper_after_epoll",
            SchedulePoint::LooperIopollBeforeHandlingEvents => "looper_iopoll_before_handling_events",
            SchedulePoint::LooperGettingDone => "looper_getting_done",
            SchedulePoint::LooperRunClosing => "looper_run_closing",
            SchedulePoint::TimerReady => "timer_ready",
            SchedulePoint::TimerRun => "timer_run",
            SchedulePoint::TimerNextTimeout => "timer_next_timeout",
            SchedulePoint::TpWantsWork => "tp_wants_work",
            SchedulePoint::TpGettingWork => "tp_getting_work",
            SchedulePoint::TpGotWork => "tp_got_work",
            SchedulePoint::TpBeforePutDone => "tp_before_put_done",
            SchedulePoint::TpAfterPutDone => "tp_after_put_done",
        };
        f.write_str(name)
    }
}

impl FromStr for SchedulePoint {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SchedulePoint::ALL
            .iter()
            .find(|p| p.to_string() == s)
            .copied()
            .ok_or_else(|| UnknownName { what: "schedule point", name: s.to_string() })
    }
}

/// Parse error for the name enums above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName {
    pub what: &'static str,
    pub name: String,
}

impl fmt::Display for UnknownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: `{}`", self.what, self.name)
    }
}

impl std::error::Error for UnknownName {}

//! # Scheduler backends
//!
//! The dispatch table at the heart of the scheduler: a closed family of
//! decision engines behind one [`Backend`] trait, selected once at init and
//! never changed.
//!
//! ## Division of labour
//!
//! - The façade owns validation, the core lock, and the thread registry.
//! - [`SharedState`] (tree, log, mode, counters) lives under the lock and is
//!   handed to every backend callout.
//! - Backends decide: they write payload outputs and append records.
//!
//! Every output field is written on every yield — a backend with no opinion
//! writes the identity choice via [`fill_identity`]. Recording is uniform
//! across backends (same record kinds in the same situations), which is what
//! makes a replayed run's emitted log comparable to the recording it was
//! driven from.

pub mod cbtree;
pub mod divergence;
pub mod fuzzing_time;
pub mod tp_freedom;
pub mod vanilla;

pub use cbtree::{CbTree, CbTreeConfig};
pub use fuzzing_time::{FuzzingTime, FuzzingTimeConfig};
pub use tp_freedom::{TpFreedom, TpFreedomConfig};
pub use vanilla::Vanilla;

use std::io::Write;

use retrace_common::{CallbackKind, ExecCbPayload, MarkerKind, NodeId, Payload, SchedulePoint};

use crate::domain::types::Mode;
use crate::export::ScheduleWriter;
use crate::registry::ThreadInfo;
use crate::schedule::{Decision, Record};
use crate::tree::CallbackTree;

/// State shared by the façade and whichever backend is installed. Protected
/// by the core lock; every backend callout runs with it held.
#[derive(Debug)]
pub struct SharedState {
    pub tree: CallbackTree,
    /// The log being recorded (in replay mode too: replay re-records what it
    /// observes so a divergent run can be emitted).
    pub log: Vec<Record>,
    pub mode: Mode,
    pub diverged: bool,
    /// AFTER_EXEC_CB observations of logical callbacks.
    pub n_executed: u64,
    next_exec_index: u64,
}

impl SharedState {
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        SharedState {
            tree: CallbackTree::new(),
            log: Vec::new(),
            mode,
            diverged: false,
            n_executed: 0,
            next_exec_index: 0,
        }
    }

    /// Register a callback node: inserts into the tree and appends the
    /// registration record.
    pub fn register_node(
        &mut self,
        parent: Option<NodeId>,
        kind: CallbackKind,
        handle: Option<u64>,
    ) -> NodeId {
        let id = self.tree.register(parent, kind, handle);
        let node = self.tree.node(id);
        self.log.push(Record::Node { path: node.path.clone(), kind, handle });
        id
    }
}

/// One scheduler implementation. All methods run under the core lock.
pub trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Called after a node lands in the shared tree. Most backends have no
    /// per-registration work.
    fn register_node(&mut self, shared: &mut SharedState, node: NodeId) {
        let _ = (shared, node);
    }

    /// Kind of the next scheduled callback. The wildcard means "do not
    /// constrain the loop phase" — it is the answer outside replay and once
    /// replay has diverged.
    fn next_kind(&self, shared: &SharedState) -> CallbackKind {
        let _ = shared;
        CallbackKind::Any
    }

    /// The central entry: decide at one schedule point.
    fn on_yield(
        &mut self,
        shared: &mut SharedState,
        thread: ThreadInfo,
        point: SchedulePoint,
        payload: &mut Payload,
    );

    /// A control-flow landmark announced by the loop.
    fn on_marker(&mut self, shared: &mut SharedState, kind: MarkerKind) {
        shared.log.push(Record::Mark { kind });
    }

    /// Scheduled callbacks not yet executed. Record mode has no fixed
    /// horizon, so the count stays positive while the log is open.
    fn nodes_remaining(&self, shared: &SharedState) -> usize {
        shared.tree.pending().saturating_add(1)
    }

    fn has_diverged(&self, shared: &SharedState) -> bool {
        shared.diverged
    }

    /// Serialise the log. Identical for every backend since recording is
    /// uniform; kept on the trait so a future backend may emit extra state.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    fn emit(&self, shared: &SharedState, writer: &mut dyn Write) -> std::io::Result<()> {
        ScheduleWriter::new(&shared.log).export(writer)
    }
}

/// Write the identity choice into a payload's output fields: queue FIFO,
/// handle all events in order, run all timers in order, ready iff due,
/// never defer closing handles.
pub fn fill_identity(payload: &mut Payload) {
    match payload {
        Payload::HandleEvents(p) => {
            p.events.thoughts = vec![true; p.events.items.len()];
        }
        Payload::GettingDone(p) | Payload::GettingWork(p) => p.index = 0,
        Payload::RunClosing(p) => p.defer = false,
        Payload::TimerReady(p) => p.ready = p.now >= p.deadline,
        Payload::TimerRun(p) => {
            p.timers.thoughts = vec![true; p.timers.items.len()];
        }
        Payload::NextTimeout(p) => {
            p.time_until_fire = match p.timer {
                Some(_) => p.deadline.saturating_sub(p.now),
                None => u64::MAX,
            };
        }
        Payload::WantsWork(p) => p.should_get_work = true,
        Payload::BeforeExecCb(_)
        | Payload::AfterExecCb(_)
        | Payload::LooperBeforeEpoll(_)
        | Payload::LooperAfterEpoll(_)
        | Payload::GotWork(_)
        | Payload::BeforePutDone(_)
        | Payload::AfterPutDone(_) => {}
    }
}

/// Snapshot the outputs a payload now carries as a [`Decision`], or `None`
/// for observation-only points.
#[must_use]
pub fn decision_of(payload: &Payload) -> Option<Decision> {
    match payload {
        Payload::TimerReady(p) => Some(Decision::TimerReady { timer: p.timer, ready: p.ready }),
        Payload::TimerRun(p) => Some(Decision::TimerRun {
            order: p.timers.items.iter().map(|t| t.timer).collect(),
            ran: p.timers.thoughts.clone(),
        }),
        Payload::NextTimeout(p) => {
            Some(Decision::NextTimeout { timer: p.timer, timeout: p.time_until_fire })
        }
        Payload::RunClosing(p) => Some(Decision::RunClosing { defer: p.defer }),
        Payload::WantsWork(p) => Some(Decision::WantsWork { granted: p.should_get_work }),
        Payload::GettingWork(p) => Some(Decision::GettingWork { index: p.index }),
        Payload::GettingDone(p) => Some(Decision::GettingDone { index: p.index }),
        Payload::HandleEvents(p) => Some(Decision::HandleEvents {
            order: p.events.items.iter().map(|e| e.event).collect(),
            handled: p.events.thoughts.clone(),
        }),
        Payload::BeforeExecCb(_)
        | Payload::AfterExecCb(_)
        | Payload::LooperBeforeEpoll(_)
        | Payload::LooperAfterEpoll(_)
        | Payload::GotWork(_)
        | Payload::BeforePutDone(_)
        | Payload::AfterPutDone(_) => None,
    }
}

/// Append the payload's decision to the log, if the point records one.
pub fn record_decision(shared: &mut SharedState, payload: &Payload) {
    if let Some(decision) = decision_of(payload) {
        shared.log.push(Record::Point { at: decision.point(), decision });
    }
}

/// BEFORE_EXEC_CB bookkeeping: stamp the node's global execution index.
pub fn exec_started(shared: &mut SharedState, payload: &ExecCbPayload) {
    if let Some(node) = payload.node {
        let exec_index = shared.next_exec_index;
        shared.next_exec_index += 1;
        shared.tree.mark_started(node, exec_index);
    }
}

/// AFTER_EXEC_CB bookkeeping: count the execution and append the landmark
/// record. Callbacks without a logical node leave no record.
pub fn exec_finished(shared: &mut SharedState, thread: ThreadInfo, payload: &ExecCbPayload) {
    if let Some(node) = payload.node {
        shared.n_executed += 1;
        shared.tree.mark_finished();
        let node = shared.tree.node(node);
        shared.log.push(Record::Exec {
            path: node.path.clone(),
            kind: node.kind,
            exec: node.exec_index.unwrap_or(0),
            thread: thread.role,
        });
    }
}

/// The whole record-mode yield: exec bookkeeping at the callback bracket,
/// identity outputs plus a decision record everywhere else. Backends that
/// perturb call the pieces themselves.
pub fn record_yield(shared: &mut SharedState, thread: ThreadInfo, payload: &mut Payload) {
    match payload {
        Payload::BeforeExecCb(p) => exec_started(shared, p),
        Payload::AfterExecCb(p) => exec_finished(shared, thread, p),
        _ => {
            fill_identity(payload);
            record_decision(shared, payload);
        }
    }
}

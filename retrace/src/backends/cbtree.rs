//! CbTree backend: record/replay against the callback causation tree
//!
//! Recording is the vanilla behaviour plus the causation tree that is always
//! captured in shared state. Replay is where the work is:
//!
//! - `BEFORE_EXEC_CB` checks the callback about to run against the schedule's
//!   next expected node (by kind and tree position).
//! - `TP_GETTING_WORK`, `LOOPER_GETTING_DONE`, and the iopoll event point are
//!   rewritten so the entry whose node is next in the schedule gets chosen;
//!   when no entry matches, pickup is denied (or every event deferred),
//!   forcing the loop to poll again until the expected cause materialises.
//! - Timer and closing decisions recorded by a perturbing backend are played
//!   back from per-point queues, so a FuzzingTime run replays exactly.
//!
//! Divergence is funnelled through [`divergence::declare`]; after a tolerated
//! divergence the shared mode is `Record` and this backend behaves like the
//! vanilla recorder for the rest of the run.

use std::collections::{HashMap, VecDeque};

use retrace_common::{CallbackKind, MarkerKind, NodeId, Payload, QueuedWork, SchedulePoint};

use super::divergence::{self, Divergence, DivergencePolicy};
use super::{exec_finished, exec_started, record_decision, record_yield, Backend, SharedState};
use crate::domain::types::Mode;
use crate::registry::ThreadInfo;
use crate::schedule::{Decision, ExecExpectation, Record, Schedule};
use crate::tree::{CallbackTree, TreePath};

/// Backend arguments for CbTree.
#[derive(Debug, Clone, Copy)]
pub struct CbTreeConfig {
    /// Executed callbacks required before divergence falls back to recording
    /// instead of aborting.
    pub min_executed_before_divergence: u64,
    /// Consecutive non-callback yields tolerated before replay is declared
    /// stalled.
    pub max_idle_yields: u32,
}

impl Default for CbTreeConfig {
    fn default() -> Self {
        CbTreeConfig { min_executed_before_divergence: 0, max_idle_yields: 10_000 }
    }
}

#[derive(Debug)]
struct ReplayState {
    execs: Vec<ExecExpectation>,
    cursor: usize,
    markers: Vec<MarkerKind>,
    marker_cursor: usize,
    decisions: HashMap<SchedulePoint, VecDeque<Decision>>,
    children: HashMap<TreePath, Vec<CallbackKind>>,
    idle_yields: u32,
}

impl ReplayState {
    fn new(schedule: &Schedule) -> Self {
        ReplayState {
            execs: schedule.execs(),
            cursor: 0,
            markers: schedule.markers(),
            marker_cursor: 0,
            decisions: schedule.decisions(),
            children: schedule.children_of(),
            idle_yields: 0,
        }
    }

    fn expected(&self) -> Option<&ExecExpectation> {
        self.execs.get(self.cursor)
    }

    fn pop_decision(&mut self, point: SchedulePoint) -> Option<Decision> {
        self.decisions.get_mut(&point).and_then(VecDeque::pop_front)
    }
}

#[derive(Debug)]
pub struct CbTree {
    policy: DivergencePolicy,
    replay: Option<ReplayState>,
}

impl CbTree {
    /// Record mode: vanilla recording plus the causation tree.
    #[must_use]
    pub fn recorder(config: CbTreeConfig) -> Self {
        CbTree { policy: policy_of(config), replay: None }
    }

    /// Replay mode, driving execution along `schedule`.
    #[must_use]
    pub fn replayer(config: CbTreeConfig, schedule: &Schedule) -> Self {
        CbTree { policy: policy_of(config), replay: Some(ReplayState::new(schedule)) }
    }
}

fn policy_of(config: CbTreeConfig) -> DivergencePolicy {
    DivergencePolicy {
        min_executed: config.min_executed_before_divergence,
        max_idle_yields: config.max_idle_yields,
    }
}

fn node_matches(tree: &CallbackTree, node: NodeId, expected: &ExecExpectation) -> bool {
    let node = tree.node(node);
    node.path == expected.path && node.kind == expected.kind
}

/// Position of the queue entry that would execute the expected node.
fn queue_match(tree: &CallbackTree, replay: &ReplayState, queue: &[QueuedWork]) -> Option<usize> {
    let expected = replay.expected()?;
    queue.iter().position(|entry| node_matches(tree, entry.node, expected))
}

impl Backend for CbTree {
    fn name(&self) -> &'static str {
        "cbtree"
    }

    fn next_kind(&self, shared: &SharedState) -> CallbackKind {
        if shared.diverged || shared.mode == Mode::Record {
            return CallbackKind::Any;
        }
        self.replay
            .as_ref()
            .and_then(ReplayState::expected)
            .map_or(CallbackKind::Any, |expected| expected.kind)
    }

    fn nodes_remaining(&self, shared: &SharedState) -> usize {
        if shared.mode == Mode::Replay {
            if let Some(replay) = &self.replay {
                return replay.execs.len().saturating_sub(replay.cursor);
            }
        }
        shared.tree.pending().saturating_add(1)
    }

    fn on_marker(&mut self, shared: &mut SharedState, kind: MarkerKind) {
        if shared.mode == Mode::Replay {
            if let Some(replay) = self.replay.as_mut() {
                let expected = replay.markers.get(replay.marker_cursor).copied();
                if expected == Some(kind) {
                    replay.marker_cursor += 1;
                } else {
                    divergence::declare(
                        shared,
                        &self.policy,
                        &Divergence::MarkerMismatch { expected, actual: kind },
                    );
                }
            }
        }
        shared.log.push(Record::Mark { kind });
    }

    #[allow(clippy::too_many_lines)]
    fn on_yield(
        &mut self,
        shared: &mut SharedState,
        thread: ThreadInfo,
        point: SchedulePoint,
        payload: &mut Payload,
    ) {
        if shared.mode == Mode::Record || self.replay.is_none() {
            record_yield(shared, thread, payload);
            return;
        }
        let policy = self.policy;
        let Some(replay) = self.replay.as_mut() else { unreachable!() };

        // Exec brackets never count towards the stall detector.
        let mut exec_bracket = false;

        match payload {
            Payload::BeforeExecCb(p) => {
                exec_bracket = true;
                if let Some(node) = p.node {
                    let actual = ExecExpectation {
                        path: shared.tree.node(node).path.clone(),
                        kind: p.kind,
                    };
                    if replay.expected() == Some(&actual) {
                        replay.idle_yields = 0;
                    } else {
                        let expected = replay.expected().cloned();
                        divergence::declare(
                            shared,
                            &policy,
                            &Divergence::ExecMismatch { expected, actual },
                        );
                    }
                    exec_started(shared, p);
                }
            }
            Payload::AfterExecCb(p) => {
                exec_bracket = true;
                if let Some(node) = p.node {
                    exec_finished(shared, thread, p);
                    if shared.mode == Mode::Replay {
                        replay.cursor += 1;
                        let path = shared.tree.node(node).path.clone();
                        let expected = replay.children.get(&path).cloned().unwrap_or_default();
                        let actual = shared.tree.children_kinds(node);
                        if actual != expected {
                            divergence::declare(
                                shared,
                                &policy,
                                &Divergence::ChildrenMismatch { path, expected, actual },
                            );
                        }
                    }
                }
            }
            Payload::WantsWork(p) => {
                p.should_get_work = queue_match(&shared.tree, replay, &p.queue).is_some();
            }
            Payload::GettingWork(p) | Payload::GettingDone(p) => {
                p.index = queue_match(&shared.tree, replay, &p.queue).unwrap_or(0);
            }
            Payload::HandleEvents(p) => {
                // Handle only the event that produces the expected node; if
                // none does, defer everything and let the looper re-poll.
                let expected = replay.expected();
                p.events.thoughts = p
                    .events
                    .items
                    .iter()
                    .map(|event| match (event.node, expected) {
                        (Some(node), Some(expected)) => node_matches(&shared.tree, node, expected),
                        _ => false,
                    })
                    .collect();
            }
            Payload::TimerReady(p) => match replay.pop_decision(point) {
                Some(Decision::TimerReady { timer, ready }) if timer == p.timer => p.ready = ready,
                _ => p.ready = p.now >= p.deadline,
            },
            Payload::TimerRun(p) => {
                let decision = replay.pop_decision(point);
                if let Some(Decision::TimerRun { order, ran }) = decision {
                    let mut remaining = std::mem::take(&mut p.timers.items);
                    let mut items = Vec::with_capacity(remaining.len());
                    let mut thoughts = Vec::with_capacity(remaining.len());
                    for (timer, ran_flag) in order.iter().zip(ran) {
                        if let Some(pos) = remaining.iter().position(|t| t.timer == *timer) {
                            items.push(remaining.remove(pos));
                            thoughts.push(ran_flag);
                        }
                    }
                    // Timers the recording never saw: defer, the exec check
                    // will flag them if they ever run.
                    for timer in remaining {
                        items.push(timer);
                        thoughts.push(false);
                    }
                    p.timers.items = items;
                    p.timers.thoughts = thoughts;
                } else {
                    p.timers.thoughts = vec![true; p.timers.items.len()];
                }
            }
            Payload::NextTimeout(p) => {
                p.time_until_fire = match replay.pop_decision(point) {
                    Some(Decision::NextTimeout { timeout, .. }) => timeout,
                    _ => match p.timer {
                        Some(_) => p.deadline.saturating_sub(p.now),
                        None => u64::MAX,
                    },
                };
            }
            Payload::RunClosing(p) => match replay.pop_decision(point) {
                Some(Decision::RunClosing { defer }) => p.defer = defer,
                _ => p.defer = false,
            },
            Payload::LooperBeforeEpoll(_)
            | Payload::LooperAfterEpoll(_)
            | Payload::GotWork(_)
            | Payload::BeforePutDone(_)
            | Payload::AfterPutDone(_) => {}
        }

        record_decision(shared, payload);

        if !exec_bracket && shared.mode == Mode::Replay {
            let Some(replay) = self.replay.as_mut() else { unreachable!() };
            replay.idle_yields += 1;
            if replay.idle_yields > policy.max_idle_yields {
                let yields = replay.idle_yields;
                replay.idle_yields = 0;
                divergence::declare(shared, &policy, &Divergence::Stall { yields });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_common::{EventId, PolledEvent, ThreadRole, TimerId, WorkId};

    use crate::backends::testutil;

    fn recorded_two_work_items() -> Schedule {
        // Two top-level work callbacks recorded in reverse registration
        // order: `1` completed before `0`.
        let text = "node 0 {\"kind\":\"work\",\"handle\":1}\n\
                    node 1 {\"kind\":\"work\",\"handle\":2}\n\
                    exec 1 {\"kind\":\"work\",\"exec\":0,\"thread\":\"worker\"}\n\
                    exec 0 {\"kind\":\"work\",\"exec\":1,\"thread\":\"worker\"}\n";
        Schedule::from_reader(text.as_bytes()).unwrap()
    }

    fn replaying(schedule: &Schedule) -> (CbTree, SharedState) {
        let backend = CbTree::replayer(CbTreeConfig::default(), schedule);
        (backend, SharedState::new(Mode::Replay))
    }

    #[test]
    fn test_getting_work_picks_the_scheduled_entry() {
        let schedule = recorded_two_work_items();
        let (mut backend, mut shared) = replaying(&schedule);
        let first = shared.register_node(None, CallbackKind::Work, Some(1));
        let second = shared.register_node(None, CallbackKind::Work, Some(2));

        let queue = vec![
            QueuedWork { work: WorkId(1), node: first },
            QueuedWork { work: WorkId(2), node: second },
        ];
        let mut payload = Payload::getting_work(queue);
        backend.on_yield(
            &mut shared,
            testutil::worker(1),
            SchedulePoint::TpGettingWork,
            &mut payload,
        );

        // The schedule wants node `1` (registered second) first.
        let Payload::GettingWork(p) = &payload else { unreachable!() };
        assert_eq!(p.index, 1);
    }

    #[test]
    fn test_wants_work_denied_until_expected_item_is_queued() {
        let schedule = recorded_two_work_items();
        let (mut backend, mut shared) = replaying(&schedule);
        let first = shared.register_node(None, CallbackKind::Work, Some(1));

        // Only the *not yet expected* item is in the queue.
        let queue = vec![QueuedWork { work: WorkId(1), node: first }];
        let mut payload = Payload::wants_work(std::time::Instant::now(), queue);
        backend.on_yield(&mut shared, testutil::worker(1), SchedulePoint::TpWantsWork, &mut payload);

        let Payload::WantsWork(p) = &payload else { unreachable!() };
        assert!(!p.should_get_work);
    }

    #[test]
    fn test_matched_exec_bracket_advances_schedule() {
        let schedule = recorded_two_work_items();
        let (mut backend, mut shared) = replaying(&schedule);
        let _first = shared.register_node(None, CallbackKind::Work, Some(1));
        let second = shared.register_node(None, CallbackKind::Work, Some(2));

        let mut before = Payload::before_exec_cb(CallbackKind::Work, Some(second));
        backend.on_yield(&mut shared, testutil::worker(1), SchedulePoint::BeforeExecCb, &mut before);
        let mut after = Payload::after_exec_cb(CallbackKind::Work, Some(second));
        backend.on_yield(&mut shared, testutil::worker(1), SchedulePoint::AfterExecCb, &mut after);

        assert!(!shared.diverged);
        assert_eq!(shared.n_executed, 1);
        assert_eq!(backend.next_kind(&shared), CallbackKind::Work);
        assert_eq!(backend.nodes_remaining(&shared), 1);
    }

    #[test]
    fn test_unexpected_exec_diverges_and_falls_back() {
        let schedule = recorded_two_work_items();
        let (mut backend, mut shared) = replaying(&schedule);
        let first = shared.register_node(None, CallbackKind::Work, Some(1));

        // Node `0` runs although `1` was scheduled first; threshold is 0 so
        // the run falls back to recording.
        let mut before = Payload::before_exec_cb(CallbackKind::Work, Some(first));
        backend.on_yield(&mut shared, testutil::worker(1), SchedulePoint::BeforeExecCb, &mut before);

        assert!(shared.diverged);
        assert_eq!(shared.mode, Mode::Record);
        assert!(backend.next_kind(&shared).is_wildcard());
    }

    #[test]
    fn test_iopoll_handles_only_the_scheduled_event() {
        let text = "node 0 {\"kind\":\"io\",\"handle\":1}\n\
                    node 1 {\"kind\":\"io\",\"handle\":2}\n\
                    exec 1 {\"kind\":\"io\",\"exec\":0,\"thread\":\"looper\"}\n\
                    exec 0 {\"kind\":\"io\",\"exec\":1,\"thread\":\"looper\"}\n";
        let schedule = Schedule::from_reader(text.as_bytes()).unwrap();
        let (mut backend, mut shared) = replaying(&schedule);
        let first = shared.register_node(None, CallbackKind::Io, Some(1));
        let second = shared.register_node(None, CallbackKind::Io, Some(2));

        let events = vec![
            PolledEvent { event: EventId(10), node: Some(first) },
            PolledEvent { event: EventId(11), node: Some(second) },
            PolledEvent { event: EventId(12), node: None },
        ];
        let mut payload = Payload::handle_events(events.clone());
        backend.on_yield(
            &mut shared,
            testutil::looper(),
            SchedulePoint::LooperIopollBeforeHandlingEvents,
            &mut payload,
        );

        // Only the event leading to the scheduled node `1` is handled; the
        // rest (including the unmatchable one) are deferred.
        let Payload::HandleEvents(p) = &payload else { unreachable!() };
        assert!(p.events.is_permutation_of(&events));
        assert_eq!(p.events.thoughts, vec![false, true, false]);
    }

    #[test]
    fn test_iopoll_defers_everything_when_nothing_matches() {
        let schedule = recorded_two_work_items();
        let (mut backend, mut shared) = replaying(&schedule);
        let _ = shared.register_node(None, CallbackKind::Work, Some(1));

        let events = vec![PolledEvent { event: EventId(10), node: None }];
        let mut payload = Payload::handle_events(events);
        backend.on_yield(
            &mut shared,
            testutil::looper(),
            SchedulePoint::LooperIopollBeforeHandlingEvents,
            &mut payload,
        );

        let Payload::HandleEvents(p) = &payload else { unreachable!() };
        assert_eq!(p.events.thoughts, vec![false]);
    }

    #[test]
    fn test_marker_mismatch_diverges() {
        let text = "mark - {\"kind\":\"loop_begin\"}\n";
        let schedule = Schedule::from_reader(text.as_bytes()).unwrap();
        let (mut backend, mut shared) = replaying(&schedule);

        backend.on_marker(&mut shared, MarkerKind::LoopEnd);
        assert!(shared.diverged);
    }

    #[test]
    fn test_stall_triggers_divergence() {
        let schedule = recorded_two_work_items();
        let backend_config = CbTreeConfig { min_executed_before_divergence: 0, max_idle_yields: 3 };
        let mut backend = CbTree::replayer(backend_config, &schedule);
        let mut shared = SharedState::new(Mode::Replay);

        for _ in 0..4 {
            let mut payload = Payload::before_epoll();
            backend.on_yield(
                &mut shared,
                testutil::looper(),
                SchedulePoint::LooperBeforeEpoll,
                &mut payload,
            );
        }
        assert!(shared.diverged);
    }

    #[test]
    fn test_replayed_timer_decisions_come_from_the_recording() {
        let text = "node 0 {\"kind\":\"timer\",\"handle\":1}\n\
                    timer_ready - {\"timer\":1,\"ready\":false}\n\
                    exec 0 {\"kind\":\"timer\",\"exec\":0,\"thread\":\"looper\"}\n";
        let schedule = Schedule::from_reader(text.as_bytes()).unwrap();
        let (mut backend, mut shared) = replaying(&schedule);
        let node = shared.register_node(None, CallbackKind::Timer, Some(1));

        // The recording deferred this timer even though it was due.
        let mut payload = Payload::timer_ready(TimerId(1), node, 10, 20);
        backend.on_yield(&mut shared, testutil::looper(), SchedulePoint::TimerReady, &mut payload);

        let Payload::TimerReady(p) = &payload else { unreachable!() };
        assert!(!p.ready);
    }

    #[test]
    fn test_replay_rerecords_what_it_observes() {
        let schedule = recorded_two_work_items();
        let (mut backend, mut shared) = replaying(&schedule);
        let _ = shared.register_node(None, CallbackKind::Work, Some(1));
        let second = shared.register_node(None, CallbackKind::Work, Some(2));

        let mut before = Payload::before_exec_cb(CallbackKind::Work, Some(second));
        backend.on_yield(&mut shared, testutil::worker(1), SchedulePoint::BeforeExecCb, &mut before);
        let mut after = Payload::after_exec_cb(CallbackKind::Work, Some(second));
        backend.on_yield(&mut shared, testutil::worker(1), SchedulePoint::AfterExecCb, &mut after);

        let execs: Vec<_> = shared
            .log
            .iter()
            .filter(|record| matches!(record, Record::Exec { .. }))
            .collect();
        assert_eq!(execs.len(), 1);
        assert!(
            matches!(execs[0], Record::Exec { thread: ThreadRole::Worker, exec: 0, .. })
        );
    }
}

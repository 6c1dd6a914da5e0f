//! A miniature event-loop simulation used by the integration tests.
//!
//! `TimerProgram` plays the looper side: a simulated clock, one-shot timers,
//! and the full yield protocol (markers, next-timeout, the poll bracket, the
//! timer points, and the exec-cb bracket for every fired timer). It is
//! deliberately deterministic so recorded schedules can be replayed against
//! it.
//!
//! `run_worker_pool` plays the thread-pool side: real OS threads draining a
//! shared work queue through the TP_* yield protocol.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use retrace::scheduler::Scheduler;
use retrace_common::{
    CallbackKind, MarkerKind, NodeId, Payload, QueuedWork, ReadyTimer, SchedulePoint, ThreadRole,
    TimerId, WorkId,
};

pub struct SimTimer {
    pub id: TimerId,
    pub deadline: u64,
    pub node: NodeId,
}

pub struct TimerProgram<'a> {
    scheduler: &'a Scheduler,
    pub now: u64,
    pub timers: Vec<SimTimer>,
    pub fired: Vec<TimerId>,
}

impl<'a> TimerProgram<'a> {
    /// Register the given `(id, deadline)` one-shot timers as top-level
    /// callbacks. The calling thread must already be registered as looper.
    pub fn new(scheduler: &'a Scheduler, timers: &[(u64, u64)]) -> Self {
        let timers = timers
            .iter()
            .map(|(id, deadline)| {
                let node = scheduler.register_node(None, CallbackKind::Timer, Some(*id));
                SimTimer { id: TimerId(*id), deadline: *deadline, node }
            })
            .collect();
        TimerProgram { scheduler, now: 0, timers, fired: Vec::new() }
    }

    /// Run loop iterations until every timer has fired.
    pub fn run(&mut self) {
        let mut iterations = 0u32;
        while !self.timers.is_empty() {
            iterations += 1;
            assert!(iterations < 100_000, "timer program did not converge");
            self.run_iteration();
        }
    }

    fn run_iteration(&mut self) {
        let scheduler = self.scheduler;
        scheduler.observe_marker(MarkerKind::LoopBegin);

        // How long may the poll sleep?
        let next = self
            .timers
            .iter()
            .min_by_key(|timer| timer.deadline)
            .expect("at least one pending timer");
        let mut timeout = Payload::next_timeout(Some(next.id), next.deadline, self.now);
        scheduler.thread_yield(SchedulePoint::TimerNextTimeout, &mut timeout);
        let Payload::NextTimeout(p) = &timeout else { unreachable!() };
        let wait = p.time_until_fire;

        // The poll itself; this program has no I/O, so the poll only passes
        // simulated time.
        let mut before = Payload::before_epoll();
        scheduler.thread_yield(SchedulePoint::LooperBeforeEpoll, &mut before);
        self.now = self.now.saturating_add(wait.max(1));
        let mut after = Payload::after_epoll();
        scheduler.thread_yield(SchedulePoint::LooperAfterEpoll, &mut after);

        // Timer phase.
        scheduler.observe_marker(MarkerKind::TimersBegin);
        let mut ready = Vec::new();
        for timer in &self.timers {
            let mut payload = Payload::timer_ready(timer.id, timer.node, timer.deadline, self.now);
            scheduler.thread_yield(SchedulePoint::TimerReady, &mut payload);
            let Payload::TimerReady(p) = &payload else { unreachable!() };
            if p.ready {
                ready.push(ReadyTimer { timer: timer.id, deadline: timer.deadline, node: timer.node });
            }
        }
        if !ready.is_empty() {
            let mut payload = Payload::timer_run(ready);
            scheduler.thread_yield(SchedulePoint::TimerRun, &mut payload);
            let Payload::TimerRun(p) = &payload else { unreachable!() };
            let decisions: Vec<(TimerId, NodeId, bool)> = p
                .timers
                .items
                .iter()
                .zip(&p.timers.thoughts)
                .map(|(timer, run)| (timer.timer, timer.node, *run))
                .collect();
            for (timer, node, run) in decisions {
                if !run {
                    continue;
                }
                self.fire(timer, node);
            }
        }
        scheduler.observe_marker(MarkerKind::TimersEnd);
        scheduler.observe_marker(MarkerKind::LoopEnd);
    }

    fn fire(&mut self, timer: TimerId, node: NodeId) {
        let scheduler = self.scheduler;
        let mut before = Payload::before_exec_cb(CallbackKind::Timer, Some(node));
        scheduler.thread_yield(SchedulePoint::BeforeExecCb, &mut before);
        self.fired.push(timer);
        let mut after = Payload::after_exec_cb(CallbackKind::Timer, Some(node));
        scheduler.thread_yield(SchedulePoint::AfterExecCb, &mut after);
        self.timers.retain(|t| t.id != timer);
    }
}

/// Drive `worker_count` pool threads through the TP_* protocol until the
/// queue is drained. Returns the completion order.
pub fn run_worker_pool(
    scheduler: &Arc<Scheduler>,
    worker_count: usize,
    items: &[(u64, NodeId)],
) -> Vec<WorkId> {
    let queue: Arc<Mutex<VecDeque<QueuedWork>>> = Arc::new(Mutex::new(
        items.iter().map(|(id, node)| QueuedWork { work: WorkId(*id), node: *node }).collect(),
    ));
    let done: Arc<Mutex<Vec<WorkId>>> = Arc::new(Mutex::new(Vec::new()));

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            let scheduler = Arc::clone(scheduler);
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            scope.spawn(move || worker_loop(&scheduler, &queue, &done));
        }
    });

    Arc::try_unwrap(done).expect("workers joined").into_inner().expect("done queue")
}

fn worker_loop(
    scheduler: &Scheduler,
    queue: &Mutex<VecDeque<QueuedWork>>,
    done: &Mutex<Vec<WorkId>>,
) {
    scheduler.register_thread(ThreadRole::Worker).expect("register worker");

    let mut since = Instant::now();
    loop {
        // The TP_* contract: the queue mutex is held and the queue is
        // non-empty at the wants/getting points.
        let picked = {
            let mut queue = queue.lock().expect("work queue");
            if queue.is_empty() {
                break;
            }
            let snapshot: Vec<QueuedWork> = queue.iter().copied().collect();

            let mut wants = Payload::wants_work(since, snapshot.clone());
            scheduler.thread_yield(SchedulePoint::TpWantsWork, &mut wants);
            let Payload::WantsWork(p) = &wants else { unreachable!() };
            if !p.should_get_work {
                drop(queue);
                std::thread::yield_now();
                continue;
            }

            let mut getting = Payload::getting_work(snapshot);
            scheduler.thread_yield(SchedulePoint::TpGettingWork, &mut getting);
            let Payload::GettingWork(p) = &getting else { unreachable!() };
            let index = p.index.min(queue.len() - 1);
            let item = queue.remove(index).expect("index in range");

            let mut got = Payload::got_work(item.work, index);
            scheduler.thread_yield(SchedulePoint::TpGotWork, &mut got);
            (item, index)
        };
        since = Instant::now();

        let (item, index) = picked;
        let mut before = Payload::before_exec_cb(CallbackKind::Work, Some(item.node));
        scheduler.thread_yield(SchedulePoint::BeforeExecCb, &mut before);
        let mut after = Payload::after_exec_cb(CallbackKind::Work, Some(item.node));
        scheduler.thread_yield(SchedulePoint::AfterExecCb, &mut after);

        {
            let mut done = done.lock().expect("done queue");
            let mut before = Payload::before_put_done(item.work, index);
            scheduler.thread_yield(SchedulePoint::TpBeforePutDone, &mut before);
            done.push(item.work);
            let mut after = Payload::after_put_done(item.work, index);
            scheduler.thread_yield(SchedulePoint::TpAfterPutDone, &mut after);
        }
    }
}

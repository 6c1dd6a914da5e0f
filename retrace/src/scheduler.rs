//! Public scheduler façade
//!
//! The fixed API the instrumented loop calls. The façade validates payloads
//! and thread roles, manages the reentrant core lock, and dispatches to the
//! backend selected at init. Loop threads share the scheduler behind an
//! `Arc`.
//!
//! Two contracts the loop relies on:
//!
//! - Between `BEFORE_EXEC_CB` and `AFTER_EXEC_CB` the core lock is held by
//!   the executing thread, so at most one callback runs at a time across all
//!   registered threads.
//! - Every payload output field is written before `thread_yield` returns.
//!
//! Schedule-point failures are never reported through a return value: an
//! invalid payload, a role mismatch, or an unmatched `AFTER_EXEC_CB` means a
//! miscoded collaborator and panics. Only `new` and `emit` return errors.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use log::info;
use retrace_common::{
    CallbackKind, MarkerKind, NodeId, Payload, SchedulePoint, ThreadRole, ThreadSlot,
};

use crate::backends::{
    Backend, CbTree, CbTreeConfig, FuzzingTime, FuzzingTimeConfig, SharedState, TpFreedom,
    TpFreedomConfig, Vanilla,
};
use crate::domain::errors::SchedulerError;
use crate::domain::types::Mode;
use crate::export::{replay_path, ScheduleWriter};
use crate::lock::CoreLock;
use crate::registry::ThreadRegistry;
use crate::schedule::Schedule;

/// Backend selection plus per-backend arguments.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Vanilla,
    CbTree(CbTreeConfig),
    FuzzingTime(FuzzingTimeConfig),
    TpFreedom(TpFreedomConfig),
}

/// Everything `Scheduler::new` needs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mode: Mode,
    /// RECORD: where `emit` puts the schedule. REPLAY: the schedule to
    /// follow; `emit` then writes to the same path with a `-replay` suffix.
    pub schedule_file: PathBuf,
    pub backend: BackendConfig,
}

impl SchedulerConfig {
    /// Vanilla recording to `schedule_file`.
    #[must_use]
    pub fn record(schedule_file: impl Into<PathBuf>) -> Self {
        SchedulerConfig {
            mode: Mode::Record,
            schedule_file: schedule_file.into(),
            backend: BackendConfig::Vanilla,
        }
    }

    /// CbTree replay of `schedule_file`.
    #[must_use]
    pub fn replay(schedule_file: impl Into<PathBuf>, config: CbTreeConfig) -> Self {
        SchedulerConfig {
            mode: Mode::Replay,
            schedule_file: schedule_file.into(),
            backend: BackendConfig::CbTree(config),
        }
    }
}

struct Core {
    shared: SharedState,
    backend: Box<dyn Backend>,
}

/// Slot value meaning "no thread is inside a callback".
const NO_CURRENT_CB: i64 = -1;

/// The semantic scheduler interposed between the loop's threads and their
/// decisions.
impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("schedule_file", &self.schedule_file)
            .field("initial_mode", &self.initial_mode)
            .finish_non_exhaustive()
    }
}

pub struct Scheduler {
    registry: ThreadRegistry,
    core: CoreLock<Core>,
    schedule_file: PathBuf,
    /// Mode at init. Emit targets are chosen by this, not the live mode: a
    /// replay that fell back to recording still emits to `-replay`.
    initial_mode: Mode,
    /// Slot of the thread inside a callback, or [`NO_CURRENT_CB`]. Callbacks
    /// may recursively enter the loop, so brackets nest; `cb_depth` counts
    /// the open brackets. Nesting is always on the owning thread (the lock
    /// is held across the bracket), so one slot covers the whole stack.
    current_cb: AtomicI64,
    cb_depth: AtomicU32,
}

impl Scheduler {
    /// Build a scheduler: select the backend, load the schedule when
    /// replaying, initialise the core lock.
    ///
    /// # Errors
    ///
    /// Configuration problems: a record-only backend asked to replay, or a
    /// missing/malformed schedule file.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let backend: Box<dyn Backend> = match (&config.backend, config.mode) {
            (BackendConfig::Vanilla, Mode::Record) => Box::new(Vanilla),
            (BackendConfig::Vanilla, Mode::Replay) => {
                return Err(SchedulerError::UnsupportedMode { backend: "vanilla", mode: Mode::Replay })
            }
            (BackendConfig::CbTree(cfg), Mode::Record) => Box::new(CbTree::recorder(*cfg)),
            (BackendConfig::CbTree(cfg), Mode::Replay) => {
                let schedule = load_schedule(&config.schedule_file)?;
                Box::new(CbTree::replayer(*cfg, &schedule))
            }
            (BackendConfig::FuzzingTime(cfg), Mode::Record) => Box::new(FuzzingTime::new(*cfg)),
            (BackendConfig::FuzzingTime(_), Mode::Replay) => {
                return Err(SchedulerError::UnsupportedMode {
                    backend: "fuzzing-time",
                    mode: Mode::Replay,
                })
            }
            (BackendConfig::TpFreedom(cfg), Mode::Record) => Box::new(TpFreedom::new(*cfg)),
            (BackendConfig::TpFreedom(_), Mode::Replay) => {
                return Err(SchedulerError::UnsupportedMode {
                    backend: "tp-freedom",
                    mode: Mode::Replay,
                })
            }
        };

        info!(
            "scheduler initialised: backend={}, mode={}, schedule={}",
            backend.name(),
            config.mode,
            config.schedule_file.display()
        );
        Ok(Scheduler {
            registry: ThreadRegistry::new(),
            core: CoreLock::new(Core { shared: SharedState::new(config.mode), backend }),
            schedule_file: config.schedule_file,
            initial_mode: config.mode,
            current_cb: AtomicI64::new(NO_CURRENT_CB),
            cb_depth: AtomicU32::new(0),
        })
    }

    /// Register the calling thread. Required before its first yield.
    ///
    /// # Errors
    ///
    /// Fails if the looper role is already taken or the thread registered
    /// before.
    pub fn register_thread(&self, role: ThreadRole) -> Result<ThreadSlot, SchedulerError> {
        self.registry.register(role)
    }

    /// Register a logical callback node before the callback it describes is
    /// executed. `parent = None` makes it a top-level callback.
    pub fn register_node(
        &self,
        parent: Option<NodeId>,
        kind: CallbackKind,
        handle: Option<u64>,
    ) -> NodeId {
        self.core.enter(|core| {
            let id = core.shared.register_node(parent, kind, handle);
            core.backend.register_node(&mut core.shared, id);
            id
        })
    }

    /// Yield at a schedule point, letting the backend decide. For the exec-cb
    /// bracket the core lock is acquired at BEFORE and only released at the
    /// matching AFTER, so the callback itself runs under the lock.
    ///
    /// # Panics
    ///
    /// Panics on an invalid payload, an unregistered thread, a role not
    /// allowed at `point`, or an unmatched `AFTER_EXEC_CB` — each of these
    /// means a miscoded collaborator, and masking it would hide bugs.
    pub fn thread_yield(&self, point: SchedulePoint, payload: &mut Payload) {
        assert!(
            payload.looks_valid(point),
            "invalid payload at {point}: magic or variant mismatch"
        );
        let Some(thread) = self.registry.current() else {
            panic!("thread_yield at {point} from an unregistered thread");
        };
        if let Some(required) = point.allowed_role() {
            assert!(
                thread.role == required,
                "{point} reached by a {} thread (only {required} may)",
                thread.role
            );
        }

        match point {
            SchedulePoint::BeforeExecCb => {
                self.core.acquire();
                self.core.with_held(|core| {
                    // Brackets nest when a callback recursively enters the
                    // loop; the nested BEFORE can only come from the owning
                    // thread, since the lock is held across the bracket.
                    let current = self.current_cb.load(Ordering::SeqCst);
                    assert!(
                        current == NO_CURRENT_CB || current == i64::from(thread.slot.0),
                        "BEFORE_EXEC_CB while a callback is running on another thread"
                    );
                    self.current_cb.store(i64::from(thread.slot.0), Ordering::SeqCst);
                    self.cb_depth.fetch_add(1, Ordering::SeqCst);
                    core.backend.on_yield(&mut core.shared, thread, point, payload);
                });
                // Lock intentionally left held until AFTER_EXEC_CB.
            }
            SchedulePoint::AfterExecCb => {
                assert!(
                    self.core.held_by_current(),
                    "AFTER_EXEC_CB without a matching BEFORE_EXEC_CB on this thread"
                );
                self.core.with_held(|core| {
                    core.backend.on_yield(&mut core.shared, thread, point, payload);
                    let depth = self.cb_depth.load(Ordering::SeqCst);
                    assert!(depth > 0, "AFTER_EXEC_CB without a matching BEFORE_EXEC_CB");
                    self.cb_depth.store(depth - 1, Ordering::SeqCst);
                    // At depth > 0 the enclosing bracket is still open on
                    // this same thread, so the slot stays in place.
                    if depth == 1 {
                        self.current_cb.store(NO_CURRENT_CB, Ordering::SeqCst);
                    }
                });
                self.core.release();
            }
            _ => self.core.enter(|core| {
                core.backend.on_yield(&mut core.shared, thread, point, payload);
            }),
        }
    }

    /// Announce a control-flow landmark (loop iteration, phase transition).
    /// Replay checks it against the schedule.
    pub fn observe_marker(&self, kind: MarkerKind) {
        self.core.enter(|core| core.backend.on_marker(&mut core.shared, kind));
    }

    /// The thread currently inside a callback, if any. Meaningful to the
    /// caller only when it is that thread itself — the shutdown path uses it
    /// to unwind the stack of callbacks it is nested under, one
    /// `AFTER_EXEC_CB` per open bracket:
    ///
    /// ```ignore
    /// while scheduler.current_cb_thread() == Some(my_slot) {
    ///     scheduler.thread_yield(SchedulePoint::AfterExecCb, &mut payload);
    /// }
    /// ```
    ///
    /// The loop keeps answering `Some(my_slot)` until the outermost bracket
    /// closes, because an inner `AFTER_EXEC_CB` restores the enclosing
    /// bracket rather than clearing the slot.
    #[must_use]
    pub fn current_cb_thread(&self) -> Option<ThreadSlot> {
        let raw = self.current_cb.load(Ordering::SeqCst);
        u32::try_from(raw).ok().map(ThreadSlot)
    }

    /// Write the schedule. RECORD mode targets the configured file; REPLAY
    /// mode appends `-replay` so the input schedule survives.
    ///
    /// # Errors
    ///
    /// I/O failures; the destination is left untouched on error.
    pub fn emit(&self) -> Result<PathBuf, SchedulerError> {
        let target = match self.initial_mode {
            Mode::Record => self.schedule_file.clone(),
            Mode::Replay => replay_path(&self.schedule_file),
        };
        self.core
            .enter(|core| ScheduleWriter::new(&core.shared.log).export_to_path(&target))
            .map_err(SchedulerError::from)
    }

    /// Kind of the next scheduled callback; the wildcard outside replay or
    /// after divergence.
    #[must_use]
    pub fn next_kind(&self) -> CallbackKind {
        self.core.enter(|core| core.backend.next_kind(&core.shared))
    }

    /// Scheduled callbacks not yet executed. Positive in record mode while
    /// the log is open.
    #[must_use]
    pub fn nodes_remaining(&self) -> usize {
        self.core.enter(|core| core.backend.nodes_remaining(&core.shared))
    }

    #[must_use]
    pub fn has_diverged(&self) -> bool {
        self.core.enter(|core| core.backend.has_diverged(&core.shared))
    }

    /// Completed callback executions so far.
    #[must_use]
    pub fn n_executed(&self) -> u64 {
        self.core.enter(|core| core.shared.n_executed)
    }

    /// The live mode. Starts as configured; a tolerated divergence flips
    /// REPLAY to RECORD.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.core.enter(|core| core.shared.mode)
    }
}

fn load_schedule(path: &Path) -> Result<Schedule, SchedulerError> {
    Schedule::from_file(path)
        .map_err(|source| SchedulerError::Schedule { path: path.to_path_buf(), source })
}

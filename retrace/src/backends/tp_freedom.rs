//! TpFreedom backend: reordering the worker pool's view of the queue
//!
//! A record-mode backend that explores thread-pool interleavings: at
//! `TP_GETTING_WORK` it may pick any valid index, not just the head, and at
//! `TP_WANTS_WORK` it may turn a worker away even though work is available.
//! Delays are bounded: a request that has been waiting `max_delay` or longer
//! is always granted, so no worker starves. Deterministic replay of whatever
//! this backend produced is the CbTree backend's job.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use retrace_common::{Payload, SchedulePoint};

use super::{record_decision, record_yield, Backend, SharedState};
use crate::registry::ThreadInfo;

/// Backend arguments for TpFreedom.
#[derive(Debug, Clone, Copy)]
pub struct TpFreedomConfig {
    pub seed: u64,
    /// Probability of turning away a worker that wants work.
    pub deny_probability: f64,
    /// Longest a worker may be turned away once it started wanting work.
    pub max_delay: Duration,
}

impl Default for TpFreedomConfig {
    fn default() -> Self {
        TpFreedomConfig {
            seed: 0,
            deny_probability: 0.5,
            max_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Debug)]
pub struct TpFreedom {
    config: TpFreedomConfig,
    rng: StdRng,
}

impl TpFreedom {
    #[must_use]
    pub fn new(config: TpFreedomConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        TpFreedom { config, rng }
    }
}

impl Backend for TpFreedom {
    fn name(&self) -> &'static str {
        "tp-freedom"
    }

    fn on_yield(
        &mut self,
        shared: &mut SharedState,
        thread: ThreadInfo,
        _point: SchedulePoint,
        payload: &mut Payload,
    ) {
        match payload {
            Payload::WantsWork(p) => {
                let overdue = p.since.elapsed() >= self.config.max_delay;
                p.should_get_work = overdue
                    || !self.rng.gen_bool(self.config.deny_probability.clamp(0.0, 1.0));
            }
            Payload::GettingWork(p) => {
                p.index = if p.queue.is_empty() { 0 } else { self.rng.gen_range(0..p.queue.len()) };
            }
            _ => {
                record_yield(shared, thread, payload);
                return;
            }
        }
        record_decision(shared, payload);
    }
}

//! FuzzingTime backend: seeded perturbation of timer decisions
//!
//! A record-mode backend whose only non-identity choices are at the three
//! timer points: it may hold back a due timer, shuffle the ready set and
//! defer a subset, or mis-advise the next-timeout computation (including
//! returning 0, which forces an immediate wake — permitted, the suggestion is
//! advisory). Everything is drawn from a seeded PRNG, so a given seed
//! reproduces the same perturbations, and every choice is recorded so the
//! outcome replays exactly under the CbTree backend.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use retrace_common::{Payload, SchedulePoint};

use super::{record_decision, record_yield, Backend, SharedState};
use crate::registry::ThreadInfo;

/// Backend arguments for FuzzingTime.
#[derive(Debug, Clone, Copy)]
pub struct FuzzingTimeConfig {
    pub seed: u64,
    /// Probability of holding back a due timer at `TIMER_READY`, and of
    /// deferring each ready timer at `TIMER_RUN`.
    pub defer_probability: f64,
    /// Shuffle the ready set at `TIMER_RUN`.
    pub shuffle: bool,
    /// Upper bound on how far past the identity value a next-timeout
    /// suggestion may be stretched.
    pub max_extension: u64,
}

impl Default for FuzzingTimeConfig {
    fn default() -> Self {
        FuzzingTimeConfig { seed: 0, defer_probability: 0.25, shuffle: true, max_extension: 100 }
    }
}

#[derive(Debug)]
pub struct FuzzingTime {
    config: FuzzingTimeConfig,
    rng: StdRng,
}

impl FuzzingTime {
    #[must_use]
    pub fn new(config: FuzzingTimeConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        FuzzingTime { config, rng }
    }

    fn defer(&mut self) -> bool {
        self.rng.gen_bool(self.config.defer_probability.clamp(0.0, 1.0))
    }
}

impl Backend for FuzzingTime {
    fn name(&self) -> &'static str {
        "fuzzing-time"
    }

    fn on_yield(
        &mut self,
        shared: &mut SharedState,
        thread: ThreadInfo,
        _point: SchedulePoint,
        payload: &mut Payload,
    ) {
        match payload {
            Payload::TimerReady(p) => {
                // A due timer may be held back; an un-due timer never fires.
                p.ready = p.now >= p.deadline && !self.defer();
            }
            Payload::TimerRun(p) => {
                if self.config.shuffle {
                    p.timers.items.shuffle(&mut self.rng);
                }
                p.timers.thoughts = (0..p.timers.items.len()).map(|_| !self.defer()).collect();
                // Deferring the whole set would stall an otherwise-idle loop.
                if !p.timers.items.is_empty() && p.timers.thoughts.iter().all(|run| !run) {
                    p.timers.thoughts[0] = true;
                }
            }
            Payload::NextTimeout(p) => {
                p.time_until_fire = match p.timer {
                    Some(_) => {
                        let identity = p.deadline.saturating_sub(p.now);
                        self.rng.gen_range(0..=identity.saturating_add(self.config.max_extension))
                    }
                    None => u64::MAX,
                };
            }
            _ => {
                record_yield(shared, thread, payload);
                return;
            }
        }
        record_decision(shared, payload);
    }
}

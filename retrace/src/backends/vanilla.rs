//! Vanilla backend: record-only pass-through
//!
//! Makes the identity choice at every schedule point and records what it
//! sees. The baseline every other backend's recordings are compared against.

use retrace_common::{Payload, SchedulePoint};

use super::{record_yield, Backend, SharedState};
use crate::registry::ThreadInfo;

#[derive(Debug, Default)]
pub struct Vanilla;

impl Backend for Vanilla {
    fn name(&self) -> &'static str {
        "vanilla"
    }

    fn on_yield(
        &mut self,
        shared: &mut SharedState,
        thread: ThreadInfo,
        _point: SchedulePoint,
        payload: &mut Payload,
    ) {
        record_yield(shared, thread, payload);
    }
}

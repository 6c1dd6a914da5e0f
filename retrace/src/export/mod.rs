//! Schedule export functionality
//!
//! Serialises a recorded log back to the line-oriented schedule format.
//! Writing to a path goes through a temp file plus atomic rename so a failed
//! emit never leaves a partial schedule behind.

pub mod schedule_text;

pub use schedule_text::{replay_path, ScheduleWriter, REPLAY_SUFFIX};

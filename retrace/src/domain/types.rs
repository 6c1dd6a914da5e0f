//! Small domain types used throughout the crate.

use std::fmt;
use std::str::FromStr;

/// The mode a scheduler runs in. Not a constant for the lifetime of a run:
/// the divergence detector may flip REPLAY to RECORD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Observe and log; make only identity-preserving choices unless the
    /// backend's whole point is perturbation.
    Record,
    /// Force the execution to follow a previously stored schedule.
    Replay,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Record => write!(f, "record"),
            Mode::Replay => write!(f, "replay"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "record" => Ok(Mode::Record),
            "replay" => Ok(Mode::Replay),
            _ => Err(format!("unknown mode: `{s}`")),
        }
    }
}

/// OS thread id as reported by the kernel, kept for correlating schedules
/// with external tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsTid(pub i32);

impl fmt::Display for OsTid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        assert_eq!("record".parse::<Mode>().unwrap(), Mode::Record);
        assert_eq!("replay".parse::<Mode>().unwrap(), Mode::Replay);
        assert!("rewind".parse::<Mode>().is_err());
    }

    #[test]
    fn test_os_tid_display() {
        assert_eq!(OsTid(4321).to_string(), "TID:4321");
    }
}

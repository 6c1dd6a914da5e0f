//! Schedule log model and loader
//!
//! The schedule is the single source of truth for replay: an ordered sequence
//! of records describing everything the scheduler observed and decided during
//! a run. On disk it is line-oriented text, one record per line:
//!
//! ```text
//! # retrace schedule v1
//! node 0 {"kind":"timer","handle":1}
//! mark - {"kind":"loop_begin"}
//! timer_ready - {"timer":1,"ready":true}
//! exec 0 {"kind":"timer","exec":0,"thread":"looper"}
//! ```
//!
//! The first column is the record tag (`node`, `exec`, `mark`, or the name of
//! the schedule point a decision was taken at), the second the node's tree
//! path (`-` when not applicable), the third the record body as JSON. Serde
//! struct field order keeps the body byte-stable, so emit → load → emit is
//! byte-identical.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use retrace_common::{CallbackKind, EventId, MarkerKind, SchedulePoint, ThreadRole, TimerId};
use serde::{Deserialize, Serialize};

use crate::domain::errors::ScheduleFileError;
use crate::tree::TreePath;

/// Header written as the first line of every schedule file. Lines starting
/// with `#` are ignored by the loader.
pub const FILE_HEADER: &str = "# retrace schedule v1";

/// A decision the scheduler wrote into a payload's output fields at a
/// non-callback schedule point.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    TimerReady { timer: TimerId, ready: bool },
    TimerRun { order: Vec<TimerId>, ran: Vec<bool> },
    NextTimeout { timer: Option<TimerId>, timeout: u64 },
    RunClosing { defer: bool },
    WantsWork { granted: bool },
    GettingWork { index: usize },
    GettingDone { index: usize },
    HandleEvents { order: Vec<EventId>, handled: Vec<bool> },
}

/// One record in the schedule log.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A callback registration: establishes the node's position in the
    /// causation tree. Parents always precede children.
    Node { path: TreePath, kind: CallbackKind, handle: Option<u64> },
    /// The `AFTER_EXEC_CB` landmark: one completed callback execution.
    Exec { path: TreePath, kind: CallbackKind, exec: u64, thread: ThreadRole },
    /// A control-flow landmark announced by the loop.
    Mark { kind: MarkerKind },
    /// A decision at a non-callback schedule point.
    Point { at: SchedulePoint, decision: Decision },
}

// Line bodies. Field order here is the on-disk field order.

#[derive(Serialize, Deserialize)]
struct NodeLine {
    kind: CallbackKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    handle: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct ExecLine {
    kind: CallbackKind,
    exec: u64,
    thread: ThreadRole,
}

#[derive(Serialize, Deserialize)]
struct MarkLine {
    kind: MarkerKind,
}

#[derive(Serialize, Deserialize)]
struct TimerReadyLine {
    timer: TimerId,
    ready: bool,
}

#[derive(Serialize, Deserialize)]
struct TimerRunLine {
    order: Vec<TimerId>,
    ran: Vec<bool>,
}

#[derive(Serialize, Deserialize)]
struct NextTimeoutLine {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    timer: Option<TimerId>,
    timeout: u64,
}

#[derive(Serialize, Deserialize)]
struct RunClosingLine {
    defer: bool,
}

#[derive(Serialize, Deserialize)]
struct WantsWorkLine {
    granted: bool,
}

#[derive(Serialize, Deserialize)]
struct IndexLine {
    index: usize,
}

#[derive(Serialize, Deserialize)]
struct HandleEventsLine {
    order: Vec<EventId>,
    handled: Vec<bool>,
}

fn to_json<T: Serialize>(body: &T) -> String {
    // Serializing plain data structs cannot fail.
    serde_json::to_string(body).expect("record body serialization")
}

impl Decision {
    /// The schedule point this decision belongs to.
    #[must_use]
    pub fn point(&self) -> SchedulePoint {
        match self {
            Decision::TimerReady { .. } => SchedulePoint::TimerReady,
            Decision::TimerRun { .. } => SchedulePoint::TimerRun,
            Decision::NextTimeout { .. } => SchedulePoint::TimerNextTimeout,
            Decision::RunClosing { .. } => SchedulePoint::LooperRunClosing,
            Decision::WantsWork { .. } => SchedulePoint::TpWantsWork,
            Decision::GettingWork { .. } => SchedulePoint::TpGettingWork,
            Decision::GettingDone { .. } => SchedulePoint::LooperGettingDone,
            Decision::HandleEvents { .. } => SchedulePoint::LooperIopollBeforeHandlingEvents,
        }
    }

    fn body_json(&self) -> String {
        match self {
            Decision::TimerReady { timer, ready } => {
                to_json(&TimerReadyLine { timer: *timer, ready: *ready })
            }
            Decision::TimerRun { order, ran } => {
                to_json(&TimerRunLine { order: order.clone(), ran: ran.clone() })
            }
            Decision::NextTimeout { timer, timeout } => {
                to_json(&NextTimeoutLine { timer: *timer, timeout: *timeout })
            }
            Decision::RunClosing { defer } => to_json(&RunClosingLine { defer: *defer }),
            Decision::WantsWork { granted } => to_json(&WantsWorkLine { granted: *granted }),
            Decision::GettingWork { index } | Decision::GettingDone { index } => {
                to_json(&IndexLine { index: *index })
            }
            Decision::HandleEvents { order, handled } => {
                to_json(&HandleEventsLine { order: order.clone(), handled: handled.clone() })
            }
        }
    }

    fn parse(point: SchedulePoint, line: usize, json: &str) -> Result<Self, ScheduleFileError> {
        let json_err = |source| ScheduleFileError::Json { line, source };
        let decision = match point {
            SchedulePoint::TimerReady => {
                let body: TimerReadyLine = serde_json::from_str(json).map_err(json_err)?;
                Decision::TimerReady { timer: body.timer, ready: body.ready }
            }
            SchedulePoint::TimerRun => {
                let body: TimerRunLine = serde_json::from_str(json).map_err(json_err)?;
                Decision::TimerRun { order: body.order, ran: body.ran }
            }
            SchedulePoint::TimerNextTimeout => {
                let body: NextTimeoutLine = serde_json::from_str(json).map_err(json_err)?;
                Decision::NextTimeout { timer: body.timer, timeout: body.timeout }
            }
            SchedulePoint::LooperRunClosing => {
                let body: RunClosingLine = serde_json::from_str(json).map_err(json_err)?;
                Decision::RunClosing { defer: body.defer }
            }
            SchedulePoint::TpWantsWork => {
                let body: WantsWorkLine = serde_json::from_str(json).map_err(json_err)?;
                Decision::WantsWork { granted: body.granted }
            }
            SchedulePoint::TpGettingWork => {
                let body: IndexLine = serde_json::from_str(json).map_err(json_err)?;
                Decision::GettingWork { index: body.index }
            }
            SchedulePoint::LooperGettingDone => {
                let body: IndexLine = serde_json::from_str(json).map_err(json_err)?;
                Decision::GettingDone { index: body.index }
            }
            SchedulePoint::LooperIopollBeforeHandlingEvents => {
                let body: HandleEventsLine = serde_json::from_str(json).map_err(json_err)?;
                Decision::HandleEvents { order: body.order, handled: body.handled }
            }
            other => {
                return Err(ScheduleFileError::Malformed {
                    line,
                    reason: format!("schedule point `{other}` records no outputs"),
                })
            }
        };
        Ok(decision)
    }
}

impl Record {
    /// The on-disk line for this record, without trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Record::Node { path, kind, handle } => {
                format!("node {path} {}", to_json(&NodeLine { kind: *kind, handle: *handle }))
            }
            Record::Exec { path, kind, exec, thread } => format!(
                "exec {path} {}",
                to_json(&ExecLine { kind: *kind, exec: *exec, thread: *thread })
            ),
            Record::Mark { kind } => format!("mark - {}", to_json(&MarkLine { kind: *kind })),
            Record::Point { at, decision } => format!("{at} - {}", decision.body_json()),
        }
    }

    fn parse(line_no: usize, line: &str) -> Result<Self, ScheduleFileError> {
        let mut parts = line.splitn(3, ' ');
        let (Some(tag), Some(path_str), Some(json)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ScheduleFileError::Malformed {
                line: line_no,
                reason: "expected `<tag> <path> <json>`".to_string(),
            });
        };

        let parse_path = || -> Result<TreePath, ScheduleFileError> {
            let path: TreePath = path_str
                .parse()
                .map_err(|_| ScheduleFileError::BadPath { line: line_no, path: path_str.to_string() })?;
            if path.is_root() {
                return Err(ScheduleFileError::BadPath { line: line_no, path: path_str.to_string() });
            }
            Ok(path)
        };
        let json_err = |source| ScheduleFileError::Json { line: line_no, source };

        match tag {
            "node" => {
                let path = parse_path()?;
                let body: NodeLine = serde_json::from_str(json).map_err(json_err)?;
                Ok(Record::Node { path, kind: body.kind, handle: body.handle })
            }
            "exec" => {
                let path = parse_path()?;
                let body: ExecLine = serde_json::from_str(json).map_err(json_err)?;
                Ok(Record::Exec { path, kind: body.kind, exec: body.exec, thread: body.thread })
            }
            "mark" => {
                let body: MarkLine = serde_json::from_str(json).map_err(json_err)?;
                Ok(Record::Mark { kind: body.kind })
            }
            other => {
                let at: SchedulePoint = other.parse().map_err(|_| {
                    ScheduleFileError::UnknownTag { line: line_no, tag: other.to_string() }
                })?;
                let decision = Decision::parse(at, line_no, json)?;
                Ok(Record::Point { at, decision })
            }
        }
    }
}

/// What replay expects of the next executed callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecExpectation {
    pub path: TreePath,
    pub kind: CallbackKind,
}

/// An ordered, validated schedule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    pub records: Vec<Record>,
}

impl Schedule {
    /// Parse a schedule from a file.
    ///
    /// # Errors
    ///
    /// Any I/O failure or structural problem in the file; see
    /// [`ScheduleFileError`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScheduleFileError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parse a schedule from any buffered reader, validating as it goes:
    /// every tag must be known, every non-root node's parent must appear
    /// earlier, exec records must name registered nodes.
    ///
    /// # Errors
    ///
    /// See [`ScheduleFileError`].
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, ScheduleFileError> {
        let mut records = Vec::new();
        let mut seen_paths: HashSet<TreePath> = HashSet::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = index + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let record = Record::parse(line_no, trimmed)?;
            match &record {
                Record::Node { path, .. } => {
                    if seen_paths.contains(path) {
                        return Err(ScheduleFileError::DuplicateNode {
                            line: line_no,
                            path: path.to_string(),
                        });
                    }
                    let parent = path.parent().unwrap_or_else(TreePath::root);
                    if !parent.is_root() && !seen_paths.contains(&parent) {
                        return Err(ScheduleFileError::OrphanNode {
                            line: line_no,
                            path: path.to_string(),
                        });
                    }
                    seen_paths.insert(path.clone());
                }
                Record::Exec { path, .. } => {
                    if !seen_paths.contains(path) {
                        return Err(ScheduleFileError::ExecUnknownNode {
                            line: line_no,
                            path: path.to_string(),
                        });
                    }
                }
                Record::Mark { .. } | Record::Point { .. } => {}
            }
            records.push(record);
        }

        Ok(Schedule { records })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The executed-callback sequence, in completion order.
    #[must_use]
    pub fn execs(&self) -> Vec<ExecExpectation> {
        self.records
            .iter()
            .filter_map(|record| match record {
                Record::Exec { path, kind, .. } => {
                    Some(ExecExpectation { path: path.clone(), kind: *kind })
                }
                _ => None,
            })
            .collect()
    }

    /// The marker sequence, in announcement order.
    #[must_use]
    pub fn markers(&self) -> Vec<MarkerKind> {
        self.records
            .iter()
            .filter_map(|record| match record {
                Record::Mark { kind } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    /// Recorded decisions, grouped per schedule point in record order.
    #[must_use]
    pub fn decisions(&self) -> HashMap<SchedulePoint, VecDeque<Decision>> {
        let mut map: HashMap<SchedulePoint, VecDeque<Decision>> = HashMap::new();
        for record in &self.records {
            if let Record::Point { at, decision } = record {
                map.entry(*at).or_default().push_back(decision.clone());
            }
        }
        map
    }

    /// Children kinds per tree position, from the node records. This is what
    /// the divergence detector compares live children against.
    #[must_use]
    pub fn children_of(&self) -> HashMap<TreePath, Vec<CallbackKind>> {
        let mut map: HashMap<TreePath, Vec<CallbackKind>> = HashMap::new();
        for record in &self.records {
            if let Record::Node { path, kind, .. } = record {
                let parent = path.parent().unwrap_or_else(TreePath::root);
                map.entry(parent).or_default().push(*kind);
            }
        }
        map
    }
}

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::domain::errors::ExportError;
use crate::schedule::{Record, FILE_HEADER};

/// Suffix appended to the schedule path when emitting from a replay run, so
/// the input schedule is never overwritten.
pub const REPLAY_SUFFIX: &str = "-replay";

/// Writes a recorded log as schedule text.
pub struct ScheduleWriter<'a> {
    records: &'a [Record],
}

impl<'a> ScheduleWriter<'a> {
    #[must_use]
    pub fn new(records: &'a [Record]) -> Self {
        Self { records }
    }

    /// Number of records that will be written.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Export to any writer (file, stdout, buffer, etc.).
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn export<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writeln!(writer, "{FILE_HEADER}")?;
        for record in self.records {
            writeln!(writer, "{}", record.to_line())?;
        }
        writer.flush()
    }

    /// Export to `path` via a temp file and atomic rename.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures; on failure the destination is untouched.
    pub fn export_to_path(&self, path: &Path) -> Result<PathBuf, ExportError> {
        let tmp_path = tmp_sibling(path);
        let file = File::create(&tmp_path)?;
        if let Err(err) = self.export(BufWriter::new(file)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        fs::rename(&tmp_path, path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            ExportError::Replace { path: path.to_path_buf(), source }
        })?;
        info!("emitted {} schedule records to {}", self.records.len(), path.display());
        Ok(path.to_path_buf())
    }
}

/// Append the replay suffix to a schedule path (`sched.txt` →
/// `sched.txt-replay`).
#[must_use]
pub fn replay_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(REPLAY_SUFFIX);
    PathBuf::from(name)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_common::{CallbackKind, MarkerKind, ThreadRole};

    use crate::schedule::Schedule;

    fn sample_records() -> Vec<Record> {
        vec![
            Record::Node { path: "0".parse().unwrap(), kind: CallbackKind::Timer, handle: Some(1) },
            Record::Mark { kind: MarkerKind::LoopBegin },
            Record::Exec {
                path: "0".parse().unwrap(),
                kind: CallbackKind::Timer,
                exec: 0,
                thread: ThreadRole::Looper,
            },
        ]
    }

    #[test]
    fn test_export_starts_with_header() {
        let records = sample_records();
        let mut buffer = Vec::new();
        ScheduleWriter::new(&records).export(&mut buffer).unwrap();

        let text = String::from_utf8(buffer).unwrap();
        assert!(text.starts_with(FILE_HEADER));
        assert_eq!(text.lines().count(), 1 + records.len());
    }

    #[test]
    fn test_export_load_export_is_byte_identical() {
        let records = sample_records();
        let mut first = Vec::new();
        ScheduleWriter::new(&records).export(&mut first).unwrap();

        let loaded = Schedule::from_reader(first.as_slice()).unwrap();
        let mut second = Vec::new();
        ScheduleWriter::new(&loaded.records).export(&mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_export_to_path_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sched.txt");
        let records = sample_records();

        let written = ScheduleWriter::new(&records).export_to_path(&path).unwrap();
        assert_eq!(written, path);
        assert!(!path.with_extension("txt.tmp").exists());

        let loaded = Schedule::from_file(&path).unwrap();
        assert_eq!(loaded.records, records);
    }

    #[test]
    fn test_replay_path_appends_suffix() {
        assert_eq!(
            replay_path(Path::new("/tmp/sched.txt")),
            PathBuf::from("/tmp/sched.txt-replay")
        );
    }
}

//! Attendance records and the plain-text summary.

use crate::attendance::AttendancePartition;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const PRESENT_FILE: &str = "present_students.csv";
pub const ABSENT_FILE: &str = "absent_students.csv";

const EMPTY_PLACEHOLDER: &str = "None";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        source: csv::Error,
    },
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: csv::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Present,
    Absent,
}

/// One `regno,status` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub regno: String,
    pub status: Status,
}

/// Durable records and summary text for one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceReport {
    pub present: Vec<AttendanceRecord>,
    pub absent: Vec<AttendanceRecord>,
    pub unknown_faces: usize,
    pub summary: String,
}

impl AttendanceReport {
    pub fn build(partition: &AttendancePartition) -> Self {
        let records = |ids: &[String], status: Status| -> Vec<AttendanceRecord> {
            ids.iter()
                .map(|regno| AttendanceRecord {
                    regno: regno.clone(),
                    status,
                })
                .collect()
        };

        Self {
            present: records(partition.present(), Status::Present),
            absent: records(partition.absent(), Status::Absent),
            unknown_faces: partition.unknown_count(),
            summary: render_summary(partition),
        }
    }

    /// Write the present and absent records as two `regno,status` CSV files.
    pub fn write_csv(&self, present_path: &Path, absent_path: &Path) -> Result<(), ReportError> {
        write_records(present_path, &self.present)?;
        write_records(absent_path, &self.absent)?;
        tracing::info!(
            present = %present_path.display(),
            absent = %absent_path.display(),
            "attendance records written"
        );
        Ok(())
    }

    /// Write both files into `dir` under their standard names.
    pub fn write_to_dir(&self, dir: &Path) -> Result<(), ReportError> {
        self.write_csv(&dir.join(PRESENT_FILE), &dir.join(ABSENT_FILE))
    }
}

/// Render the human-readable summary. Empty lists render as "None".
pub fn render_summary(partition: &AttendancePartition) -> String {
    let list = |ids: &[String]| {
        if ids.is_empty() {
            EMPTY_PLACEHOLDER.to_string()
        } else {
            ids.join(", ")
        }
    };

    format!(
        "Attendance Report:\n\n\
         Present Students:\n{}\n\n\
         Absent Students:\n{}\n\n\
         Unknown Faces Detected: {}",
        list(partition.present()),
        list(partition.absent()),
        partition.unknown_count()
    )
}

fn write_records(path: &Path, records: &[AttendanceRecord]) -> Result<(), ReportError> {
    let wrap = |source: csv::Error| ReportError::Write {
        path: path.display().to_string(),
        source,
    };

    // Header written by hand so an empty list still gets one.
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(wrap)?;
    writer.write_record(["regno", "status"]).map_err(wrap)?;
    for record in records {
        writer.serialize(record).map_err(wrap)?;
    }
    writer.flush().map_err(|e| wrap(e.into()))?;
    Ok(())
}

/// Read a `regno,status` file written by [`AttendanceReport::write_csv`].
pub fn read_records(path: &Path) -> Result<Vec<AttendanceRecord>, ReportError> {
    let wrap = |source: csv::Error| ReportError::Read {
        path: path.display().to_string(),
        source,
    };

    let mut reader = csv::Reader::from_path(path).map_err(wrap)?;
    reader
        .deserialize()
        .collect::<Result<Vec<AttendanceRecord>, _>>()
        .map_err(wrap)
}

//! Roster loading from a `regno,name,image_path` CSV.
//!
//! Rows whose reference photo is missing or cannot be decoded are skipped and
//! reported, never treated as an error. Only an unreadable or malformed source
//! fails the load.

use crate::types::RosterEntry;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

const REQUIRED_COLUMNS: [&str; 3] = ["regno", "name", "image_path"];

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("cannot open roster {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed roster: {0}")]
    Csv(#[from] csv::Error),
    #[error("roster is missing required column `{0}`")]
    MissingColumn(&'static str),
}

#[derive(Debug, Deserialize)]
struct RosterRecord {
    regno: String,
    name: String,
    image_path: PathBuf,
}

/// A roster row left out of the run because its photo is unusable.
#[derive(Debug, Clone)]
pub struct SkippedRow {
    pub identity_id: String,
    pub image_path: PathBuf,
    pub reason: String,
}

/// Enrolled identities for one attendance run, in source order.
#[derive(Debug, Default)]
pub struct Roster {
    pub entries: Vec<RosterEntry>,
    pub skipped: Vec<SkippedRow>,
}

impl Roster {
    /// Load a roster CSV from disk. Image paths are used as written.
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let file = std::fs::File::open(path).map_err(|source| RosterError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let roster = Self::from_reader(file)?;

        tracing::info!(
            path = %path.display(),
            loaded = roster.entries.len(),
            skipped = roster.skipped.len(),
            "roster loaded"
        );
        Ok(roster)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, RosterError> {
        let mut rows = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rows.headers()?.clone();
        for column in REQUIRED_COLUMNS {
            if !headers.iter().any(|h| h == column) {
                return Err(RosterError::MissingColumn(column));
            }
        }

        let mut roster = Roster::default();
        for row in rows.deserialize::<RosterRecord>() {
            let record = row?;
            match image::open(&record.image_path) {
                Ok(image) => roster.entries.push(RosterEntry {
                    identity_id: record.regno,
                    display_name: record.name,
                    image_path: record.image_path,
                    reference_image: image.to_rgb8(),
                }),
                Err(e) => {
                    tracing::warn!(
                        regno = %record.regno,
                        image = %record.image_path.display(),
                        error = %e,
                        "skipping roster entry with unusable photo"
                    );
                    roster.skipped.push(SkippedRow {
                        identity_id: record.regno,
                        image_path: record.image_path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(roster)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

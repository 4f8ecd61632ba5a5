//! headcount-core — Attendance from a group photo.
//!
//! Finds faces in a scene with SCRFD, verifies each face against a roster of
//! reference photos with a logical-OR consensus of embedding models (ONNX
//! Runtime on CPU), and partitions the roster into present and absent.

pub mod attendance;
pub mod detector;
pub mod localizer;
pub mod notify;
pub mod presets;
pub mod recognizer;
pub mod report;
pub mod roster;
pub mod types;
pub mod verifier;

pub use attendance::{aggregate, tally, AttendancePartition, Resolution};
pub use detector::{DetectionParams, Detector, FaceDetector};
pub use localizer::{CropLocalizer, Localizer};
pub use recognizer::FaceRecognizer;
pub use report::AttendanceReport;
pub use roster::Roster;
pub use types::{BoundingBox, Embedding, FaceCandidate, RosterEntry};
pub use verifier::{ConsensusVerifier, Reference, VerificationModel, VerificationOutcome, Verifier};

use std::path::PathBuf;

/// `$XDG_DATA_HOME/headcount/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("headcount")
        .join("models")
}

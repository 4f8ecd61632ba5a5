//! Attendance aggregation.
//!
//! Each face candidate is resolved against the roster on its own, then the
//! resolutions are folded into an [`AttendancePartition`]. A candidate is
//! attributed to the FIRST roster entry (in load order) that verifies, not to
//! the most similar one; when two enrolled photos look alike, roster order
//! decides.

use crate::detector::DetectorError;
use crate::localizer::Localizer;
use crate::types::{FaceCandidate, RosterEntry};
use crate::verifier::{Reference, VerificationOutcome, Verifier};
use image::DynamicImage;
use serde::Serialize;

/// What one face candidate turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Verified against the roster entry with this identity.
    Matched(String),
    /// No roster entry verified.
    Unknown,
}

/// Roster split into present and absent identities, plus unattributed faces.
///
/// Every roster identity is in exactly one of `present` and `absent`.
/// `present` is in marking order, `absent` in roster order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendancePartition {
    present: Vec<String>,
    absent: Vec<String>,
    unknown_count: usize,
}

impl AttendancePartition {
    /// Everyone absent, no unknown faces. Repeated identities appear once.
    pub fn new(roster: &[RosterEntry]) -> Self {
        let mut absent: Vec<String> = Vec::with_capacity(roster.len());
        for entry in roster {
            if !absent.contains(&entry.identity_id) {
                absent.push(entry.identity_id.clone());
            }
        }
        Self {
            present: Vec::new(),
            absent,
            unknown_count: 0,
        }
    }

    /// Fold one candidate resolution into the partition.
    ///
    /// A match moves the identity from absent to present; matching an
    /// identity that is already present changes nothing. Unknown faces are
    /// counted per candidate.
    pub fn apply(mut self, resolution: &Resolution) -> Self {
        match resolution {
            Resolution::Matched(id) => {
                if let Some(pos) = self.absent.iter().position(|a| a == id) {
                    let id = self.absent.remove(pos);
                    self.present.push(id);
                } else if !self.present.contains(id) {
                    tracing::debug!(identity = %id, "match for an identity outside the roster ignored");
                }
            }
            Resolution::Unknown => self.unknown_count += 1,
        }
        self
    }

    pub fn present(&self) -> &[String] {
        &self.present
    }

    pub fn absent(&self) -> &[String] {
        &self.absent
    }

    pub fn unknown_count(&self) -> usize {
        self.unknown_count
    }

    pub fn is_present(&self, identity_id: &str) -> bool {
        self.present.iter().any(|p| p == identity_id)
    }
}

/// Resolve one candidate by scanning the roster in order and stopping at the
/// first entry that verifies. Failed verifications count as non-matches.
///
/// Each entry is passed as a [`Reference`] carrying its roster index; callers
/// outside [`tally`] must call [`Verifier::begin_run`] when the roster changes.
pub fn resolve<V: Verifier + ?Sized>(
    candidate: &FaceCandidate,
    roster: &[RosterEntry],
    verifier: &mut V,
) -> Resolution {
    for (index, entry) in roster.iter().enumerate() {
        let reference = Reference {
            index,
            image: &entry.reference_image,
        };
        match verifier.verify(candidate, reference) {
            VerificationOutcome::Match { model_agreement } => {
                tracing::debug!(
                    identity = %entry.identity_id,
                    models = ?model_agreement,
                    bbox = ?candidate.bounding_box,
                    "candidate matched"
                );
                return Resolution::Matched(entry.identity_id.clone());
            }
            VerificationOutcome::NoMatch => {}
            VerificationOutcome::Failure(err) => {
                tracing::warn!(
                    identity = %entry.identity_id,
                    name = %entry.display_name,
                    error = %err,
                    "verification failed; treating as non-match"
                );
            }
        }
    }

    tracing::debug!(bbox = ?candidate.bounding_box, "candidate unknown");
    Resolution::Unknown
}

/// Build the partition from already-localized candidates.
pub fn tally<V: Verifier + ?Sized>(
    candidates: &[FaceCandidate],
    roster: &[RosterEntry],
    verifier: &mut V,
) -> AttendancePartition {
    // Roster indices are only meaningful within this call.
    verifier.begin_run();
    candidates
        .iter()
        .map(|candidate| resolve(candidate, roster, verifier))
        .fold(AttendancePartition::new(roster), |partition, resolution| {
            partition.apply(&resolution)
        })
}

/// Localize faces in `scene` and build the attendance partition for `roster`.
///
/// A scene without faces yields the all-absent partition without any
/// verification calls.
pub fn aggregate<L, V>(
    scene: &DynamicImage,
    roster: &[RosterEntry],
    localizer: &mut L,
    verifier: &mut V,
) -> Result<AttendancePartition, DetectorError>
where
    L: Localizer + ?Sized,
    V: Verifier + ?Sized,
{
    let candidates = localizer.localize(scene)?;
    if candidates.is_empty() {
        tracing::info!(roster = roster.len(), "no faces detected; everyone absent");
        return Ok(AttendancePartition::new(roster));
    }

    let partition = tally(&candidates, roster, verifier);
    tracing::info!(
        faces = candidates.len(),
        present = partition.present().len(),
        absent = partition.absent().len(),
        unknown = partition.unknown_count(),
        "attendance aggregated"
    );
    Ok(partition)
}

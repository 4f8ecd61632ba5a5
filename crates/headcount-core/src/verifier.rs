//! Identity verification by multi-model consensus.
//!
//! Every configured model votes on whether a face candidate and a reference
//! photo show the same person. The pair matches when ANY model votes yes.
//! A failing model does not abort the caller: the pair is reported as
//! [`VerificationOutcome::Failure`] and the aggregator treats it as a non-match.
//!
//! With a pair budget, models run against a shared deadline. Once it passes,
//! the running model is interrupted and the rest are skipped; a match already
//! voted by an earlier model still stands.

use crate::recognizer::RecognizerError;
use crate::types::FaceCandidate;
use image::RgbImage;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use thiserror::Error;

/// One model's decision for one image pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelVote {
    pub verified: bool,
    /// Distance under the model's own metric. Lower = more similar.
    pub distance: f32,
}

/// A roster photo together with its position in the roster.
///
/// The index is stable for one run, so models may cache per-reference work
/// under it until the next [`Verifier::begin_run`].
#[derive(Debug, Clone, Copy)]
pub struct Reference<'a> {
    pub index: usize,
    pub image: &'a RgbImage,
}

/// A model that decides whether two face images show the same identity.
pub trait VerificationModel {
    /// Stable identifier reported in [`VerificationOutcome::Match`].
    fn id(&self) -> &str;

    /// Drop anything cached against a previous roster.
    fn begin_run(&mut self) {}

    /// Vote on one pair. A model that cannot finish before `deadline` should
    /// stop and return [`RecognizerError::DeadlineExceeded`].
    fn vote(
        &mut self,
        candidate: &RgbImage,
        reference: Reference<'_>,
        deadline: Option<Instant>,
    ) -> Result<ModelVote, RecognizerError>;
}

impl<M: VerificationModel + ?Sized> VerificationModel for Box<M> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn begin_run(&mut self) {
        (**self).begin_run()
    }

    fn vote(
        &mut self,
        candidate: &RgbImage,
        reference: Reference<'_>,
        deadline: Option<Instant>,
    ) -> Result<ModelVote, RecognizerError> {
        (**self).vote(candidate, reference, deadline)
    }
}

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("model {model} failed: {source}")]
    Model {
        model: String,
        #[source]
        source: RecognizerError,
    },
    #[error("verification took {elapsed:?}, over the {budget:?} budget")]
    Timeout { elapsed: Duration, budget: Duration },
}

/// Result of verifying one candidate against one reference photo.
#[derive(Debug)]
pub enum VerificationOutcome {
    /// At least one model voted "same identity".
    Match { model_agreement: BTreeSet<String> },
    NoMatch,
    /// A model errored, or the budget ran out before any model voted yes.
    /// Counts as a non-match.
    Failure(VerificationError),
}

impl VerificationOutcome {
    pub fn matched(&self) -> bool {
        matches!(self, VerificationOutcome::Match { .. })
    }

    /// Models that voted "match"; `None` unless matched.
    pub fn model_agreement(&self) -> Option<&BTreeSet<String>> {
        match self {
            VerificationOutcome::Match { model_agreement } => Some(model_agreement),
            _ => None,
        }
    }
}

/// Decides whether a face candidate matches a reference photo.
pub trait Verifier {
    /// Called once before a roster is scanned.
    fn begin_run(&mut self) {}

    fn verify(&mut self, candidate: &FaceCandidate, reference: Reference<'_>) -> VerificationOutcome;
}

#[derive(Error, Debug)]
#[error("consensus verifier needs at least one model")]
pub struct NoModelsError;

/// Logical-OR consensus over independent verification models.
pub struct ConsensusVerifier<M> {
    models: Vec<M>,
    pair_budget: Option<Duration>,
}

impl<M: VerificationModel> ConsensusVerifier<M> {
    pub fn new(models: Vec<M>) -> Result<Self, NoModelsError> {
        if models.is_empty() {
            return Err(NoModelsError);
        }
        Ok(Self {
            models,
            pair_budget: None,
        })
    }

    /// Bound the time spent on one pair across all models.
    pub fn with_pair_budget(mut self, budget: Option<Duration>) -> Self {
        self.pair_budget = budget;
        self
    }

    pub fn model_ids(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.id()).collect()
    }
}

impl<M: VerificationModel> Verifier for ConsensusVerifier<M> {
    fn begin_run(&mut self) {
        for model in &mut self.models {
            model.begin_run();
        }
    }

    fn verify(&mut self, candidate: &FaceCandidate, reference: Reference<'_>) -> VerificationOutcome {
        let started = Instant::now();
        let budget = self.pair_budget.map(|limit| (started + limit, limit));
        let deadline = budget.map(|(deadline, _)| deadline);
        let mut agreement = BTreeSet::new();

        // Models run in order; one failure fails the whole pair.
        for model in &mut self.models {
            if let Some((deadline, limit)) = budget {
                if Instant::now() >= deadline {
                    tracing::debug!(model = model.id(), "pair budget spent; model skipped");
                    return out_of_time(agreement, started.elapsed(), limit);
                }
            }

            match model.vote(&candidate.pixels, reference, deadline) {
                Ok(vote) => {
                    tracing::trace!(
                        model = model.id(),
                        verified = vote.verified,
                        distance = vote.distance,
                        "model vote"
                    );
                    if vote.verified {
                        agreement.insert(model.id().to_string());
                    }
                }
                Err(RecognizerError::DeadlineExceeded) => {
                    tracing::debug!(model = model.id(), "model interrupted at pair deadline");
                    let limit = budget.map_or(Duration::ZERO, |(_, limit)| limit);
                    return out_of_time(agreement, started.elapsed(), limit);
                }
                Err(source) => {
                    return VerificationOutcome::Failure(VerificationError::Model {
                        model: model.id().to_string(),
                        source,
                    });
                }
            }
        }

        if agreement.is_empty() {
            VerificationOutcome::NoMatch
        } else {
            VerificationOutcome::Match {
                model_agreement: agreement,
            }
        }
    }
}

/// Outcome for a pair whose budget ran out. Votes already cast still count.
fn out_of_time(
    agreement: BTreeSet<String>,
    elapsed: Duration,
    budget: Duration,
) -> VerificationOutcome {
    if agreement.is_empty() {
        VerificationOutcome::Failure(VerificationError::Timeout { elapsed, budget })
    } else {
        VerificationOutcome::Match {
            model_agreement: agreement,
        }
    }
}

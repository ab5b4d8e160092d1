//! 1:1 face verification against a single claimed candidate.

use crate::types::{CandidateRecord, Descriptor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum Euclidean distance still accepted as the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    /// The live frame had no detectable face. Callers should prompt a
    /// recapture, not report a rejection.
    #[error("no face detected in the live frame")]
    NoFaceDetected,
    #[error("candidate {email} has no enrolled face descriptors")]
    NoEnrollmentData { email: String },
    #[error("match threshold must be a positive finite number, got {0}")]
    InvalidThreshold(f32),
}

/// Decision for one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOutcome {
    pub is_match: bool,
    /// Best (smallest) distance across the candidate's enrolled descriptors.
    /// Always reported, match or not.
    pub distance: f32,
}

/// Euclidean best-of-N matcher.
///
/// Only ever sees one claimed identity's templates per decision; there is
/// no gallery or population-wide search.
#[derive(Debug, Clone, Copy)]
pub struct MatchEngine {
    threshold: f32,
}

impl Default for MatchEngine {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl MatchEngine {
    pub fn new(threshold: f32) -> Result<Self, MatchError> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(MatchError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Decide whether `live` belongs to `claimed`.
    ///
    /// The distance is the minimum over all enrolled descriptors: a single
    /// good enrollment sample is enough. Every template is visited; there is
    /// no early exit on the first hit.
    pub fn verify(
        &self,
        live: Option<&Descriptor>,
        claimed: &CandidateRecord,
    ) -> Result<MatchOutcome, MatchError> {
        let live = live.ok_or(MatchError::NoFaceDetected)?;

        if claimed.embeddings.is_empty() {
            return Err(MatchError::NoEnrollmentData {
                email: claimed.email.clone(),
            });
        }

        let mut best = f32::INFINITY;
        for template in &claimed.embeddings {
            let distance = live.euclidean_distance(template);
            if distance < best {
                best = distance;
            }
        }

        let outcome = MatchOutcome {
            is_match: best < self.threshold,
            distance: best,
        };

        tracing::debug!(
            email = %claimed.email,
            templates = claimed.embeddings.len(),
            distance = outcome.distance,
            threshold = self.threshold,
            is_match = outcome.is_match,
            "verification decided"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::{descriptor, record};
    use crate::types::DESCRIPTOR_DIM;

    #[test]
    fn test_verify_against_own_descriptor() {
        let d1 = descriptor(0.2);
        let a = record("a@x.com", vec![d1]);
        let outcome = MatchEngine::default().verify(Some(&d1), &a).unwrap();
        assert_eq!(outcome, MatchOutcome { is_match: true, distance: 0.0 });
    }

    #[test]
    fn test_verify_unrelated_descriptor_rejected() {
        let d1 = descriptor(0.0);
        let d2 = descriptor(1.0);
        let a = record("a@x.com", vec![d1]);
        let outcome = MatchEngine::default().verify(Some(&d2), &a).unwrap();
        assert!(!outcome.is_match);
        assert!(outcome.distance > DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_verify_tiny_threshold_still_matches_exact() {
        let d1 = descriptor(0.3);
        let a = record("a@x.com", vec![d1]);
        let engine = MatchEngine::new(1e-6).unwrap();
        assert!(engine.verify(Some(&d1), &a).unwrap().is_match);
    }

    #[test]
    fn test_verify_uses_best_template() {
        // Best match is the last template
        let live = descriptor(0.5);
        let a = record("a@x.com", vec![descriptor(3.0), descriptor(-2.0), descriptor(0.51)]);
        let outcome = MatchEngine::default().verify(Some(&live), &a).unwrap();
        assert!(outcome.is_match);
        let expected = 0.01 * (DESCRIPTOR_DIM as f32).sqrt();
        assert!((outcome.distance - expected).abs() < 1e-3, "got {}", outcome.distance);
    }

    #[test]
    fn test_threshold_is_strict() {
        // distance 0.5 * sqrt(128) ≈ 5.657; threshold exactly at that distance rejects
        let a = record("a@x.com", vec![descriptor(0.0)]);
        let live = descriptor(0.5);
        let distance = live.euclidean_distance(&descriptor(0.0));
        let engine = MatchEngine::new(distance).unwrap();
        assert!(!engine.verify(Some(&live), &a).unwrap().is_match);
    }

    #[test]
    fn test_verify_without_face() {
        let a = record("a@x.com", vec![descriptor(0.0)]);
        assert_eq!(
            MatchEngine::default().verify(None, &a).unwrap_err(),
            MatchError::NoFaceDetected
        );
    }

    #[test]
    fn test_verify_without_enrollment() {
        let a = record("a@x.com", vec![]);
        let err = MatchEngine::default().verify(Some(&descriptor(0.0)), &a).unwrap_err();
        assert_eq!(err, MatchError::NoEnrollmentData { email: "a@x.com".into() });
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(MatchEngine::new(0.0).is_err());
        assert!(MatchEngine::new(-1.0).is_err());
        assert!(MatchEngine::new(f32::NAN).is_err());
        assert_eq!(MatchEngine::new(0.45).unwrap().threshold(), 0.45);
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(MatchOutcome { is_match: true, distance: 0.0 }).unwrap();
        assert_eq!(json["isMatch"], true);
        assert_eq!(json["distance"], 0.0);
    }
}

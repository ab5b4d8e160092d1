//! 1:1 verification against a claimed candidate, and the admin approval
//! that follows it.

use chrono::Utc;
use examgate_core::{CandidateRecord, Descriptor, MatchEngine, MatchError, MatchOutcome};
use examgate_store::{CandidateStore, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("no candidate registered under {0}")]
    UnknownCandidate(String),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Fetch the claimed candidate, or `UnknownCandidate`.
pub async fn load_claimed<S: CandidateStore>(
    store: &S,
    email: &str,
) -> Result<CandidateRecord, VerifyError> {
    let email = email.trim();
    store
        .get(email)
        .await?
        .ok_or_else(|| VerifyError::UnknownCandidate(email.to_string()))
}

/// Compare `live` with the enrolled descriptors of the candidate at `email`.
pub async fn verify_candidate<S: CandidateStore>(
    store: &S,
    engine: &MatchEngine,
    email: &str,
    live: Option<&Descriptor>,
) -> Result<MatchOutcome, VerifyError> {
    let record = load_claimed(store, email).await?;
    let outcome = engine.verify(live, &record)?;
    tracing::info!(
        email = %record.email,
        is_match = outcome.is_match,
        distance = outcome.distance,
        "candidate verified"
    );
    Ok(outcome)
}

/// Set the administrator verification flag. Read-modify-write; everything
/// else on the record is left as stored.
pub async fn set_verified<S: CandidateStore>(
    store: &S,
    email: &str,
    verified: bool,
) -> Result<CandidateRecord, VerifyError> {
    let mut record = load_claimed(store, email).await?;
    record.verified = verified;
    record.updated_at = Utc::now();
    store.put(record.clone()).await?;

    tracing::info!(email = %record.email, verified, "verification flag updated");
    Ok(record)
}

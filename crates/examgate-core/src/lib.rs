//! examgate-core — Candidate records and 1:1 face verification.
//!
//! Holds the fixed-length descriptor type, the candidate record model,
//! the Euclidean match engine and the embedding-provider seam. Nothing in
//! here touches storage, cameras or the network.

pub mod frame;
pub mod matcher;
pub mod provider;
pub mod registration;
pub mod types;

pub use frame::{Frame, FrameError};
pub use matcher::{MatchEngine, MatchError, MatchOutcome, DEFAULT_MATCH_THRESHOLD};
pub use provider::{Detection, EmbeddingProvider, ProviderError, ScriptedProvider};
pub use registration::{
    generate_exam_number, EnrollMode, RegistrationError, RegistrationForm, ValidatedForm,
};
pub use types::{
    CandidateRecord, CandidateSummary, Descriptor, DescriptorError, Subject, DESCRIPTOR_DIM,
    SUBJECTS_PER_CANDIDATE,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of every face descriptor produced by the embedding provider.
pub const DESCRIPTOR_DIM: usize = 128;

/// A candidate sits exactly this many subjects.
pub const SUBJECTS_PER_CANDIDATE: usize = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("expected {expected}-dim descriptor, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("descriptor component {index} is not a finite number")]
    NonFinite { index: usize },
}

/// Face descriptor with its dimensionality fixed by the type.
///
/// Construction and deserialization both validate the length and reject
/// NaN/infinite components, so a stored record can never carry a vector
/// of the wrong shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor([f32; DESCRIPTOR_DIM]);

impl Descriptor {
    pub fn new(values: [f32; DESCRIPTOR_DIM]) -> Result<Self, DescriptorError> {
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index });
        }
        Ok(Self(values))
    }

    pub fn from_slice(values: &[f32]) -> Result<Self, DescriptorError> {
        let array: [f32; DESCRIPTOR_DIM] =
            values.try_into().map_err(|_| DescriptorError::Dimension {
                expected: DESCRIPTOR_DIM,
                actual: values.len(),
            })?;
        Self::new(array)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean (L2) distance between two descriptors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::from_slice(&values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(descriptor: Descriptor) -> Self {
        descriptor.0.to_vec()
    }
}

/// The fixed subject list shared by the registration form and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subject {
    Maths,
    Physics,
    Chemistry,
    Biology,
    Agric,
    #[serde(rename = "GST")]
    Gst,
}

impl Subject {
    pub const ALL: [Subject; 6] = [
        Subject::Maths,
        Subject::Physics,
        Subject::Chemistry,
        Subject::Biology,
        Subject::Agric,
        Subject::Gst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::Maths => "Maths",
            Subject::Physics => "Physics",
            Subject::Chemistry => "Chemistry",
            Subject::Biology => "Biology",
            Subject::Agric => "Agric",
            Subject::Gst => "GST",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown subject: {0:?}")]
pub struct UnknownSubject(pub String);

impl FromStr for Subject {
    type Err = UnknownSubject;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Subject::ALL
            .into_iter()
            .find(|subject| subject.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownSubject(s.to_string()))
    }
}

/// A registered exam candidate, keyed by `email`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub email: String,
    pub name: String,
    pub course: String,
    pub university: String,
    pub state: String,
    pub exam_number: String,
    pub subjects: Vec<Subject>,
    /// One descriptor per successful enrollment capture, oldest first.
    pub embeddings: Vec<Descriptor>,
    /// Display-only photo; never consulted by the matcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<Vec<u8>>,
    /// Set by an administrator, never by the match engine.
    #[serde(default)]
    pub verified: bool,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub fn has_valid_key(&self) -> bool {
        !self.email.trim().is_empty()
    }

    pub fn is_enrolled(&self) -> bool {
        !self.embeddings.is_empty()
    }

    /// Case-insensitive substring match on name or email. An empty term
    /// matches everything.
    pub fn matches_search(&self, term: &str) -> bool {
        let term = term.trim().to_lowercase();
        term.is_empty()
            || self.name.to_lowercase().contains(&term)
            || self.email.to_lowercase().contains(&term)
    }

    pub fn summary(&self) -> CandidateSummary {
        CandidateSummary {
            email: self.email.clone(),
            name: self.name.clone(),
            course: self.course.clone(),
            university: self.university.clone(),
            state: self.state.clone(),
            exam_number: self.exam_number.clone(),
            subjects: self.subjects.clone(),
            verified: self.verified,
            samples: self.embeddings.len(),
            has_profile_image: self.profile_image.is_some(),
            registered_at: self.registered_at,
        }
    }
}

/// List view of a candidate, without biometric data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSummary {
    pub email: String,
    pub name: String,
    pub course: String,
    pub university: String,
    pub state: String,
    pub exam_number: String,
    pub subjects: Vec<Subject>,
    pub verified: bool,
    pub samples: usize,
    pub has_profile_image: bool,
    pub registered_at: DateTime<Utc>,
}

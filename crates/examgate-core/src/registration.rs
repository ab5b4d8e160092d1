//! Registration form validation and exam-number generation.

use crate::frame::{self, FrameError};
use crate::types::{Subject, SUBJECTS_PER_CANDIDATE};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("invalid subject selection: {0}")]
    InvalidSubjectSelection(String),
    #[error("no face samples captured")]
    NoEnrollmentData,
    #[error("required field is empty: {0}")]
    MissingField(&'static str),
    #[error("profile image is not a readable image: {0}")]
    InvalidProfileImage(#[source] FrameError),
}

/// What to do with descriptors already stored for a re-enrolling candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollMode {
    /// Keep stored descriptors and add the new ones after them.
    #[default]
    Append,
    /// Drop stored descriptors before adding the new ones.
    Reset,
}

/// Raw form fields as submitted by the registration UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationForm {
    pub name: String,
    pub course: String,
    pub state: String,
    pub university: String,
    pub email: String,
    pub subjects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<Vec<u8>>,
}

/// Form fields that passed validation, trimmed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedForm {
    pub name: String,
    pub course: String,
    pub state: String,
    pub university: String,
    pub email: String,
    pub subjects: Vec<Subject>,
    pub profile_image: Option<Vec<u8>>,
}

impl RegistrationForm {
    /// Exactly four distinct subjects from the fixed list, in form order.
    pub fn validate_subjects(&self) -> Result<Vec<Subject>, RegistrationError> {
        let mut parsed = Vec::with_capacity(self.subjects.len());
        for raw in &self.subjects {
            let subject = raw
                .parse::<Subject>()
                .map_err(|e| RegistrationError::InvalidSubjectSelection(e.to_string()))?;
            parsed.push(subject);
        }

        let distinct: BTreeSet<Subject> = parsed.iter().copied().collect();
        if distinct.len() != parsed.len() {
            return Err(RegistrationError::InvalidSubjectSelection(
                "subjects must not repeat".into(),
            ));
        }
        if parsed.len() != SUBJECTS_PER_CANDIDATE {
            return Err(RegistrationError::InvalidSubjectSelection(format!(
                "select exactly {SUBJECTS_PER_CANDIDATE} subjects, got {}",
                parsed.len()
            )));
        }
        Ok(parsed)
    }

    /// Validate in the order the UI reports problems: subjects, captured
    /// samples, required text fields, then the optional profile image.
    pub fn validate(self, captured_samples: usize) -> Result<ValidatedForm, RegistrationError> {
        let subjects = self.validate_subjects()?;

        if captured_samples == 0 {
            return Err(RegistrationError::NoEnrollmentData);
        }

        let name = required("name", &self.name)?;
        let course = required("course", &self.course)?;
        let state = required("state", &self.state)?;
        let university = required("university", &self.university)?;
        let email = required("email", &self.email)?;

        if let Some(bytes) = &self.profile_image {
            frame::image_dimensions(bytes).map_err(RegistrationError::InvalidProfileImage)?;
        }

        Ok(ValidatedForm {
            name,
            course,
            state,
            university,
            email,
            subjects,
            profile_image: self.profile_image,
        })
    }
}

fn required(field: &'static str, value: &str) -> Result<String, RegistrationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RegistrationError::MissingField(field));
    }
    Ok(trimmed.to_string())
}

/// `EXAM` + unix millis + 4 random digits.
pub fn generate_exam_number(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("EXAM{}{suffix:04}", now.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn form(subjects: &[&str]) -> RegistrationForm {
        RegistrationForm {
            name: " Ada Obi ".into(),
            course: "Physics".into(),
            state: "Lagos".into(),
            university: "UNILAG".into(),
            email: "ada@x.com".into(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            profile_image: None,
        }
    }

    const FOUR: [&str; 4] = ["Maths", "Physics", "Chemistry", "GST"];

    #[test]
    fn test_three_subjects_rejected() {
        let err = form(&["Maths", "Physics", "Chemistry"]).validate(1).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidSubjectSelection(_)));
    }

    #[test]
    fn test_five_subjects_rejected() {
        let err = form(&["Maths", "Physics", "Chemistry", "GST", "Agric"])
            .validate(1)
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidSubjectSelection(_)));
    }

    #[test]
    fn test_duplicate_subjects_rejected() {
        let err = form(&["Maths", "maths", "Chemistry", "GST"]).validate(1).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidSubjectSelection(_)));
    }

    #[test]
    fn test_unknown_subject_rejected() {
        let err = form(&["Maths", "History", "Chemistry", "GST"]).validate(1).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidSubjectSelection(_)));
    }

    #[test]
    fn test_no_samples_rejected_after_subjects() {
        let err = form(&FOUR).validate(0).unwrap_err();
        assert!(matches!(err, RegistrationError::NoEnrollmentData));
    }

    #[test]
    fn test_subjects_checked_before_samples() {
        let err = form(&["Maths"]).validate(0).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidSubjectSelection(_)));
    }

    #[test]
    fn test_missing_field() {
        let mut f = form(&FOUR);
        f.university = "   ".into();
        let err = f.validate(2).unwrap_err();
        assert!(matches!(err, RegistrationError::MissingField("university")));
    }

    #[test]
    fn test_missing_email() {
        let mut f = form(&FOUR);
        f.email.clear();
        assert!(matches!(f.validate(1).unwrap_err(), RegistrationError::MissingField("email")));
    }

    #[test]
    fn test_valid_form_trims() {
        let v = form(&FOUR).validate(1).unwrap();
        assert_eq!(v.name, "Ada Obi");
        assert_eq!(v.subjects, vec![Subject::Maths, Subject::Physics, Subject::Chemistry, Subject::Gst]);
    }

    #[test]
    fn test_profile_image_must_decode() {
        let mut f = form(&FOUR);
        f.profile_image = Some(b"garbage".to_vec());
        assert!(matches!(
            f.validate(1).unwrap_err(),
            RegistrationError::InvalidProfileImage(_)
        ));

        let mut f = form(&FOUR);
        let png = Frame::new(vec![90; 64], 8, 8).unwrap().encode_png().unwrap();
        f.profile_image = Some(png);
        assert!(f.validate(1).is_ok());
    }

    #[test]
    fn test_exam_number_format() {
        let now = Utc::now();
        let n = generate_exam_number(now);
        let millis = now.timestamp_millis().to_string();
        assert!(n.starts_with("EXAM"));
        assert_eq!(&n[4..4 + millis.len()], millis);
        assert_eq!(n.len(), 4 + millis.len() + 4);
    }

    #[test]
    fn test_enroll_mode_default_is_append() {
        assert_eq!(EnrollMode::default(), EnrollMode::Append);
        assert_eq!(serde_json::to_string(&EnrollMode::Reset).unwrap(), "\"reset\"");
    }
}

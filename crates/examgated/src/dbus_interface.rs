use crate::embedder::HttpEmbeddingProvider;
use crate::registry::{Registry, RegistryError};
use crate::sync::HttpRemote;
use examgate_core::{EnrollMode, RegistrationForm};
use examgate_hw::V4lOpener;
use examgate_store::{Role, SqliteStore};
use serde::Serialize;
use std::sync::Arc;
use zbus::{interface, DBusError};

pub const BUS_NAME: &str = "org.examgate.Registry1";
pub const OBJECT_PATH: &str = "/org/examgate/Registry1";

pub type DaemonRegistry = Registry<SqliteStore, HttpEmbeddingProvider, V4lOpener, HttpRemote>;

/// Named D-Bus errors, so a client can tell "recapture" from "rejected".
#[derive(Debug, DBusError)]
#[zbus(prefix = "org.examgate.Registry1")]
pub enum ServiceError {
    #[zbus(error)]
    ZBus(zbus::Error),
    ModelsUnavailable(String),
    NoActiveSession(String),
    InvalidSession(String),
    NoFaceDetected(String),
    NoEnrollmentData(String),
    InvalidSubjectSelection(String),
    MissingField(String),
    InvalidKey(String),
    ExamNumberTaken(String),
    UnknownCandidate(String),
    NotAuthorized(String),
    InvalidCredentials(String),
    AccountExists(String),
    InvalidImage(String),
    InvalidArgument(String),
    Camera(String),
    Provider(String),
    Storage(String),
    SyncFailed(String),
    Internal(String),
}

impl From<RegistryError> for ServiceError {
    fn from(e: RegistryError) -> Self {
        let msg = e.to_string();
        match e {
            RegistryError::ModelsUnavailable => Self::ModelsUnavailable(msg),
            RegistryError::NoActiveSession => Self::NoActiveSession(msg),
            RegistryError::InvalidSession(_) => Self::InvalidSession(msg),
            RegistryError::NoFaceDetected => Self::NoFaceDetected(msg),
            RegistryError::NoEnrollmentData => Self::NoEnrollmentData(msg),
            RegistryError::InvalidSubjectSelection(_) => Self::InvalidSubjectSelection(msg),
            RegistryError::MissingField(_) => Self::MissingField(msg),
            RegistryError::InvalidKey => Self::InvalidKey(msg),
            RegistryError::ExamNumberTaken(_) => Self::ExamNumberTaken(msg),
            RegistryError::UnknownCandidate(_) => Self::UnknownCandidate(msg),
            RegistryError::NotAuthorized => Self::NotAuthorized(msg),
            RegistryError::InvalidCredentials => Self::InvalidCredentials(msg),
            RegistryError::AccountExists(_) => Self::AccountExists(msg),
            RegistryError::InvalidImage(_) => Self::InvalidImage(msg),
            RegistryError::Camera(_) => Self::Camera(msg),
            RegistryError::Provider(_) => Self::Provider(msg),
            RegistryError::Storage(_) => Self::Storage(msg),
            RegistryError::SyncFailed(_) => Self::SyncFailed(msg),
            RegistryError::Internal(_) => Self::Internal(msg),
        }
    }
}

type Result<T> = std::result::Result<T, ServiceError>;

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ServiceError::Internal(e.to_string()))
}

/// D-Bus interface for the examgate daemon.
///
/// Bus name: org.examgate.Registry1
/// Object path: /org/examgate/Registry1
pub struct RegistryService {
    registry: Arc<DaemonRegistry>,
}

impl RegistryService {
    pub fn new(registry: Arc<DaemonRegistry>) -> Self {
        Self { registry }
    }
}

#[interface(name = "org.examgate.Registry1")]
impl RegistryService {
    /// Start a new enrollment and return its session id. `live` opens the
    /// camera for `CaptureSample`; image-only enrollments pass false.
    async fn start_enrollment(&self, live: bool) -> Result<String> {
        tracing::info!(live, "start_enrollment requested");
        Ok(self.registry.start_enrollment(live).await?)
    }

    /// Capture one live sample. Returns the buffered sample count.
    async fn capture_sample(&self, session: &str) -> Result<u32> {
        let n = self.registry.capture_sample(session).await?;
        Ok(n as u32)
    }

    /// Add a sample from an encoded still image (PNG/JPEG bytes).
    async fn add_image_sample(&self, session: &str, image: Vec<u8>) -> Result<u32> {
        let n = self.registry.add_image_sample(session, &image).await?;
        Ok(n as u32)
    }

    async fn face_present(&self) -> bool {
        self.registry.face_present().await
    }

    /// Persist the enrollment. `form` is the registration form as JSON.
    /// Returns the candidate summary as JSON.
    async fn finalize_enrollment(&self, session: &str, form: &str, reset: bool) -> Result<String> {
        let form: RegistrationForm = serde_json::from_str(form)
            .map_err(|e| ServiceError::InvalidArgument(format!("registration form: {e}")))?;
        let mode = if reset { EnrollMode::Reset } else { EnrollMode::Append };
        tracing::info!(email = %form.email, ?mode, "finalize_enrollment requested");
        let record = self.registry.finalize_enrollment(session, form, mode).await?;
        to_json(&record.summary())
    }

    async fn cancel_enrollment(&self, session: &str) -> Result<()> {
        Ok(self.registry.cancel_enrollment(session).await?)
    }

    /// Capture a live face and verify it against `email`. Returns
    /// `{"isMatch", "distance"}` as JSON.
    async fn verify(&self, email: &str) -> Result<String> {
        tracing::info!(email, "verify requested");
        to_json(&self.registry.verify(email).await?)
    }

    async fn verify_image(&self, email: &str, image: Vec<u8>) -> Result<String> {
        tracing::info!(email, "verify_image requested");
        to_json(&self.registry.verify_image(email, &image).await?)
    }

    async fn list_candidates(&self) -> Result<String> {
        to_json(&self.registry.list_candidates().await?)
    }

    async fn search_candidates(&self, term: &str) -> Result<String> {
        to_json(&self.registry.search_candidates(term).await?)
    }

    /// Full record, embeddings included, as JSON. Administrators only.
    async fn get_candidate(
        &self,
        email: &str,
        admin_email: &str,
        admin_password: &str,
    ) -> Result<String> {
        let record = self
            .registry
            .get_candidate(email, admin_email, admin_password)
            .await?;
        to_json(&record)
    }

    async fn remove_candidate(
        &self,
        email: &str,
        admin_email: &str,
        admin_password: &str,
    ) -> Result<()> {
        tracing::info!(email, "remove_candidate requested");
        Ok(self
            .registry
            .remove_candidate(email, admin_email, admin_password)
            .await?)
    }

    async fn set_verified(
        &self,
        email: &str,
        verified: bool,
        admin_email: &str,
        admin_password: &str,
    ) -> Result<String> {
        let record = self
            .registry
            .set_verified(email, verified, admin_email, admin_password)
            .await?;
        to_json(&record.summary())
    }

    async fn register_user(&self, email: &str, password: &str) -> Result<()> {
        Ok(self.registry.register_user(email, password).await?)
    }

    /// Check credentials. Returns the account role.
    async fn login(&self, email: &str, password: &str) -> Result<String> {
        let role = match self.registry.login(email, password).await? {
            Role::Admin => "admin",
            Role::User => "user",
        };
        Ok(role.to_string())
    }

    async fn sync_now(&self) -> Result<String> {
        tracing::info!("sync_now requested");
        to_json(&self.registry.sync_now().await?)
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String> {
        to_json(&self.registry.status().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names() {
        let err = ServiceError::from(RegistryError::NoFaceDetected);
        assert_eq!(err.name().as_str(), "org.examgate.Registry1.NoFaceDetected");
        assert_eq!(err.description(), Some("no face detected"));

        let err = ServiceError::from(RegistryError::UnknownCandidate("a@x.com".into()));
        assert_eq!(err.name().as_str(), "org.examgate.Registry1.UnknownCandidate");
        assert_eq!(err.description(), Some("no candidate registered under a@x.com"));
    }

    #[test]
    fn test_session_errors() {
        let err = ServiceError::from(RegistryError::InvalidSession("abc".into()));
        assert_eq!(err.name().as_str(), "org.examgate.Registry1.InvalidSession");
        let err = ServiceError::from(RegistryError::NotAuthorized);
        assert_eq!(err.name().as_str(), "org.examgate.Registry1.NotAuthorized");
    }

    #[test]
    fn test_enrollment_errors_stay_distinct() {
        let names: Vec<String> = [
            RegistryError::InvalidSubjectSelection("x".into()),
            RegistryError::NoEnrollmentData,
            RegistryError::MissingField("email".into()),
            RegistryError::ModelsUnavailable,
        ]
        .into_iter()
        .map(|e| ServiceError::from(e).name().to_string())
        .collect();

        assert_eq!(
            names,
            vec![
                "org.examgate.Registry1.InvalidSubjectSelection",
                "org.examgate.Registry1.NoEnrollmentData",
                "org.examgate.Registry1.MissingField",
                "org.examgate.Registry1.ModelsUnavailable",
            ]
        );
    }
}

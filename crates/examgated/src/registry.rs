//! Daemon service state: ties the store, provider, camera and sync
//! coordinator together behind the operations the D-Bus interface exposes.

use crate::capture::{CaptureError, CaptureSession};
use crate::enrollment::{EnrollmentError, EnrollmentManager};
use crate::sync::{RemoteSink, SyncCoordinator, SyncError, SyncStatus, TriggerOutcome};
use crate::verification::{self, VerifyError};
use examgate_core::{
    CandidateRecord, CandidateSummary, EmbeddingProvider, EnrollMode, Frame, FrameError,
    MatchEngine, MatchError, MatchOutcome, ProviderError, RegistrationError, RegistrationForm,
};
use examgate_hw::CameraOpener;
use examgate_store::{authenticate, CandidateStore, Role, StoreError, UserAccount, UserStore};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("embedding models are not loaded")]
    ModelsUnavailable,
    #[error("no enrollment capture session is running")]
    NoActiveSession,
    #[error("enrollment session {0} is not open")]
    InvalidSession(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("no face samples captured")]
    NoEnrollmentData,
    #[error("invalid subject selection: {0}")]
    InvalidSubjectSelection(String),
    #[error("required field is empty: {0}")]
    MissingField(String),
    #[error("record has an empty email key")]
    InvalidKey,
    #[error("exam number {0} already belongs to another candidate")]
    ExamNumberTaken(String),
    #[error("no candidate registered under {0}")]
    UnknownCandidate(String),
    #[error("administrator credentials required")]
    NotAuthorized,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("account {0} already exists")]
    AccountExists(String),
    #[error("image unreadable: {0}")]
    InvalidImage(String),
    #[error("camera error: {0}")]
    Camera(String),
    #[error("embedding provider error: {0}")]
    Provider(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("sync failed: {0}")]
    SyncFailed(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidKey => Self::InvalidKey,
            StoreError::ExamNumberTaken { exam_number } => Self::ExamNumberTaken(exam_number),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<ProviderError> for RegistryError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::ModelsNotLoaded => Self::ModelsUnavailable,
            ProviderError::Frame(e) => Self::InvalidImage(e.to_string()),
            other => Self::Provider(other.to_string()),
        }
    }
}

impl From<FrameError> for RegistryError {
    fn from(e: FrameError) -> Self {
        Self::InvalidImage(e.to_string())
    }
}

impl From<MatchError> for RegistryError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::NoFaceDetected => Self::NoFaceDetected,
            MatchError::NoEnrollmentData { .. } => Self::NoEnrollmentData,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<RegistrationError> for RegistryError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::InvalidSubjectSelection(msg) => Self::InvalidSubjectSelection(msg),
            RegistrationError::NoEnrollmentData => Self::NoEnrollmentData,
            RegistrationError::MissingField(field) => Self::MissingField(field.to_string()),
            RegistrationError::InvalidProfileImage(e) => Self::InvalidImage(e.to_string()),
        }
    }
}

impl From<CaptureError> for RegistryError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::Camera(e) => Self::Camera(e.to_string()),
            CaptureError::Provider(e) => e.into(),
            CaptureError::Released => Self::NoActiveSession,
            CaptureError::Join(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<EnrollmentError> for RegistryError {
    fn from(e: EnrollmentError) -> Self {
        match e {
            EnrollmentError::NoActiveSession => Self::NoActiveSession,
            EnrollmentError::SessionMismatch(id) => Self::InvalidSession(id.to_string()),
            EnrollmentError::NoFaceDetected => Self::NoFaceDetected,
            EnrollmentError::Registration(e) => e.into(),
            EnrollmentError::Provider(e) => e.into(),
            EnrollmentError::Frame(e) => e.into(),
            EnrollmentError::Store(e) => e.into(),
        }
    }
}

impl From<VerifyError> for RegistryError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::UnknownCandidate(email) => Self::UnknownCandidate(email),
            VerifyError::Match(e) => e.into(),
            VerifyError::Store(e) => e.into(),
        }
    }
}

impl From<SyncError> for RegistryError {
    fn from(e: SyncError) -> Self {
        Self::SyncFailed(e.to_string())
    }
}

/// Capture timing knobs from the daemon config.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub sample_interval: Duration,
    pub frames_per_verify: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(500),
            frames_per_verify: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentStatus {
    pub session_id: Option<String>,
    pub samples: usize,
    pub capturing: bool,
    pub face_present: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub version: &'static str,
    pub models_loaded: bool,
    pub match_threshold: f32,
    pub candidates: usize,
    pub enrollment: EnrollmentStatus,
    pub sync: SyncStatus,
}

/// One entry of the admin credentials file.
#[derive(Debug, Deserialize)]
struct SeedAccount {
    email: String,
    password: String,
    #[serde(default)]
    role: Option<Role>,
}

pub struct Registry<S, P, C, R>
where
    S: CandidateStore + UserStore,
    P: EmbeddingProvider,
    C: CameraOpener,
    R: RemoteSink,
{
    store: Arc<S>,
    provider: Arc<P>,
    opener: Arc<C>,
    engine: MatchEngine,
    settings: CaptureSettings,
    sync: Arc<SyncCoordinator<S, R>>,
    // Lock order: `session` before `enrollment`.
    session: Mutex<Option<CaptureSession<C::Source, P>>>,
    enrollment: Mutex<EnrollmentManager<S, P>>,
}

fn parse_session(raw: &str) -> Result<Uuid, RegistryError> {
    Uuid::parse_str(raw.trim()).map_err(|_| RegistryError::InvalidSession(raw.to_string()))
}

impl<S, P, C, R> Registry<S, P, C, R>
where
    S: CandidateStore + UserStore,
    P: EmbeddingProvider,
    C: CameraOpener,
    R: RemoteSink,
{
    pub fn new(
        store: Arc<S>,
        provider: Arc<P>,
        opener: Arc<C>,
        sync: Arc<SyncCoordinator<S, R>>,
        engine: MatchEngine,
        settings: CaptureSettings,
    ) -> Self {
        let enrollment = EnrollmentManager::new(Arc::clone(&store), Arc::clone(&provider));
        Self {
            store,
            provider,
            opener,
            engine,
            settings,
            sync,
            session: Mutex::new(None),
            enrollment: Mutex::new(enrollment),
        }
    }

    fn require_models(&self) -> Result<(), RegistryError> {
        if self.provider.models_loaded() {
            Ok(())
        } else {
            Err(RegistryError::ModelsUnavailable)
        }
    }

    // --- enrollment ---

    /// Begin a fresh enrollment and return its session id. With `live` the
    /// camera is opened for `capture_sample`; image-only enrollments leave
    /// it closed. Any previous session is stopped first.
    pub async fn start_enrollment(&self, live: bool) -> Result<String, RegistryError> {
        self.require_models()?;

        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            previous.stop().await;
        }

        if live {
            let started = CaptureSession::start(
                Arc::clone(&self.opener),
                Arc::clone(&self.provider),
                self.settings.sample_interval,
            )
            .await?;
            *session = Some(started);
        }

        let id = self.enrollment.lock().await.start_capture();
        Ok(id.to_string())
    }

    /// Capture one live sample into the enrollment buffer.
    pub async fn capture_sample(&self, session_id: &str) -> Result<usize, RegistryError> {
        let id = parse_session(session_id)?;
        let session = self.session.lock().await;
        let mut enrollment = self.enrollment.lock().await;
        enrollment.check_session(id)?;
        let active = session.as_ref().ok_or(RegistryError::NoActiveSession)?;
        let detection = active.capture().await?.ok_or(RegistryError::NoFaceDetected)?;
        Ok(enrollment.add_descriptor(id, detection.descriptor)?)
    }

    /// Add a sample from an uploaded still image.
    pub async fn add_image_sample(
        &self,
        session_id: &str,
        image: &[u8],
    ) -> Result<usize, RegistryError> {
        let id = parse_session(session_id)?;
        self.require_models()?;
        Ok(self.enrollment.lock().await.add_image(id, image).await?)
    }

    pub async fn face_present(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.face_present())
    }

    /// Validate and persist the enrollment. The camera is released on
    /// success; on a validation error the session stays open for recapture.
    pub async fn finalize_enrollment(
        &self,
        session_id: &str,
        form: RegistrationForm,
        mode: EnrollMode,
    ) -> Result<CandidateRecord, RegistryError> {
        let id = parse_session(session_id)?;
        let mut session = self.session.lock().await;
        let record = self.enrollment.lock().await.finalize(id, form, mode).await?;
        if let Some(active) = session.take() {
            active.stop().await;
        }
        Ok(record)
    }

    /// Drop the buffer of `session_id` and release the camera.
    pub async fn cancel_enrollment(&self, session_id: &str) -> Result<(), RegistryError> {
        let id = parse_session(session_id)?;
        let mut session = self.session.lock().await;
        let mut enrollment = self.enrollment.lock().await;
        enrollment.check_session(id)?;
        if let Some(active) = session.take() {
            active.stop().await;
        }
        enrollment.cancel();
        tracing::info!(session = %id, "enrollment cancelled");
        Ok(())
    }

    /// Cancel the open enrollment if it has been untouched for `max_idle`.
    /// Returns whether one was released.
    pub async fn release_idle(&self, max_idle: Duration) -> bool {
        let mut session = self.session.lock().await;
        let mut enrollment = self.enrollment.lock().await;
        let idle = match enrollment.idle_for() {
            Some(idle) if idle >= max_idle => idle,
            _ => return false,
        };
        if let Some(active) = session.take() {
            active.stop().await;
        }
        tracing::warn!(
            session = ?enrollment.session_id(),
            idle_secs = idle.as_secs(),
            "idle enrollment cancelled, camera released"
        );
        enrollment.cancel();
        true
    }

    // --- verification ---

    /// Capture a live face and match it against the candidate at `email`.
    ///
    /// Reuses the running capture session when there is one; otherwise the
    /// camera is held only for the duration of this call.
    pub async fn verify(&self, email: &str) -> Result<MatchOutcome, RegistryError> {
        self.require_models()?;
        let claimed = verification::load_claimed(self.store.as_ref(), email).await?;

        let attempts = self.settings.frames_per_verify;
        let session = self.session.lock().await;
        let detection = match session.as_ref() {
            Some(active) => active.capture_face(attempts).await?,
            None => {
                let temporary = CaptureSession::start(
                    Arc::clone(&self.opener),
                    Arc::clone(&self.provider),
                    self.settings.sample_interval,
                )
                .await?;
                let result = temporary.capture_face(attempts).await;
                temporary.stop().await;
                result?
            }
        };
        drop(session);

        let outcome = self
            .engine
            .verify(detection.as_ref().map(|d| &d.descriptor), &claimed)?;
        tracing::info!(
            email = %claimed.email,
            is_match = outcome.is_match,
            distance = outcome.distance,
            "live verification"
        );
        Ok(outcome)
    }

    /// Match the face in an uploaded still image against `email`.
    pub async fn verify_image(&self, email: &str, image: &[u8]) -> Result<MatchOutcome, RegistryError> {
        self.require_models()?;
        let frame = Frame::decode(image)?;
        let detection = self.provider.detect(&frame).await?;
        Ok(verification::verify_candidate(
            self.store.as_ref(),
            &self.engine,
            email,
            detection.as_ref().map(|d| &d.descriptor),
        )
        .await?)
    }

    // --- candidates ---

    pub async fn list_candidates(&self) -> Result<Vec<CandidateSummary>, RegistryError> {
        let all = self.store.get_all().await?;
        Ok(all.iter().map(CandidateRecord::summary).collect())
    }

    pub async fn search_candidates(&self, term: &str) -> Result<Vec<CandidateSummary>, RegistryError> {
        let all = self.store.get_all().await?;
        Ok(all
            .iter()
            .filter(|r| r.matches_search(term))
            .map(CandidateRecord::summary)
            .collect())
    }

    async fn require_admin(
        &self,
        admin_email: &str,
        admin_password: &str,
    ) -> Result<UserAccount, RegistryError> {
        authenticate(self.store.as_ref(), admin_email, admin_password)
            .await?
            .filter(UserAccount::is_admin)
            .ok_or(RegistryError::NotAuthorized)
    }

    /// Admin-only: the full record, embeddings included.
    pub async fn get_candidate(
        &self,
        email: &str,
        admin_email: &str,
        admin_password: &str,
    ) -> Result<CandidateRecord, RegistryError> {
        self.require_admin(admin_email, admin_password).await?;
        Ok(verification::load_claimed(self.store.as_ref(), email).await?)
    }

    /// Admin-only: delete a candidate.
    pub async fn remove_candidate(
        &self,
        email: &str,
        admin_email: &str,
        admin_password: &str,
    ) -> Result<(), RegistryError> {
        let admin = self.require_admin(admin_email, admin_password).await?;
        self.store.delete(email.trim()).await?;
        tracing::info!(admin = %admin.email, email = email.trim(), "candidate removed");
        Ok(())
    }

    /// Admin-only: set the verification flag.
    pub async fn set_verified(
        &self,
        email: &str,
        verified: bool,
        admin_email: &str,
        admin_password: &str,
    ) -> Result<CandidateRecord, RegistryError> {
        let admin = self.require_admin(admin_email, admin_password).await?;
        tracing::info!(admin = %admin.email, email, verified, "admin verification");
        Ok(verification::set_verified(self.store.as_ref(), email, verified).await?)
    }

    // --- accounts ---

    pub async fn register_user(&self, email: &str, password: &str) -> Result<(), RegistryError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(RegistryError::InvalidKey);
        }
        if password.is_empty() {
            return Err(RegistryError::MissingField("password".into()));
        }
        if self.store.get_user(email).await?.is_some() {
            return Err(RegistryError::AccountExists(email.to_string()));
        }
        self.store
            .put_user(UserAccount::new(email, password, Role::User))
            .await?;
        tracing::info!(email, "user registered");
        Ok(())
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Role, RegistryError> {
        authenticate(self.store.as_ref(), email, password)
            .await?
            .map(|account| account.role)
            .ok_or(RegistryError::InvalidCredentials)
    }

    /// Load administrator accounts from a JSON list of
    /// `{"email", "password", "role"?}` objects. A missing file seeds nothing.
    pub async fn seed_admins(&self, path: &Path) -> Result<usize, RegistryError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "admin seed file not found");
                return Ok(0);
            }
            Err(e) => return Err(RegistryError::Internal(format!("{}: {e}", path.display()))),
        };
        let seeds: Vec<SeedAccount> = serde_json::from_str(&text)
            .map_err(|e| RegistryError::Internal(format!("{}: {e}", path.display())))?;

        let count = seeds.len();
        for seed in seeds {
            let role = seed.role.unwrap_or(Role::Admin);
            self.store
                .put_user(UserAccount::new(seed.email, &seed.password, role))
                .await?;
        }
        tracing::info!(path = %path.display(), count, "accounts seeded");
        Ok(count)
    }

    // --- sync & status ---

    pub async fn sync_now(&self) -> Result<TriggerOutcome, RegistryError> {
        Ok(self.sync.sync_now().await?)
    }

    pub async fn status(&self) -> Result<DaemonStatus, RegistryError> {
        let candidates = self.store.get_all().await?.len();
        let session = self.session.lock().await;
        let enrollment = self.enrollment.lock().await;

        Ok(DaemonStatus {
            version: env!("CARGO_PKG_VERSION"),
            models_loaded: self.provider.models_loaded(),
            match_threshold: self.engine.threshold(),
            candidates,
            enrollment: EnrollmentStatus {
                session_id: enrollment.session_id().map(|id| id.to_string()),
                samples: enrollment.sample_count(),
                capturing: session.is_some(),
                face_present: session.as_ref().is_some_and(|s| s.face_present()),
            },
            sync: self.sync.status(),
        })
    }

    /// Release the camera if a session is still open.
    pub async fn shutdown(&self) {
        if let Some(active) = self.session.lock().await.take() {
            active.stop().await;
        }
    }
}

/// Periodically cancels enrollments whose client stopped talking to us,
/// so an abandoned session cannot hold the camera.
pub struct IdleReaper {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl IdleReaper {
    pub fn start<S, P, C, R>(registry: Arc<Registry<S, P, C, R>>, max_idle: Duration) -> Self
    where
        S: CandidateStore + UserStore,
        P: EmbeddingProvider,
        C: CameraOpener,
        R: RemoteSink,
    {
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);
        let period = (max_idle / 4).max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;

                    _ = stop.notified() => break,

                    _ = ticker.tick() => {
                        registry.release_idle(max_idle).await;
                    }
                }
            }
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                tracing::warn!("idle reaper did not stop in time");
            }
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

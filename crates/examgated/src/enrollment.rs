//! Capture-to-record assembly for candidate enrollment.
//!
//! Samples are buffered against the session id handed out by
//! [`EnrollmentManager::start_capture`]; every later call must present that
//! id, so one operator's samples can never end up in another's record.

use chrono::Utc;
use examgate_core::{
    generate_exam_number, CandidateRecord, Descriptor, EmbeddingProvider, EnrollMode, Frame,
    FrameError, ProviderError, RegistrationError, RegistrationForm,
};
use examgate_store::{CandidateStore, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Fresh exam numbers tried before giving up on a collision.
const EXAM_NUMBER_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("no enrollment session is open")]
    NoActiveSession,
    #[error("enrollment session {0} is not the open session")]
    SessionMismatch(Uuid),
    #[error("no face detected in the sample")]
    NoFaceDetected,
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("sample image unreadable: {0}")]
    Frame(#[from] FrameError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Buffers descriptors for one enrollment and turns them into a record.
pub struct EnrollmentManager<S: CandidateStore, P: EmbeddingProvider> {
    store: Arc<S>,
    provider: Arc<P>,
    session_id: Option<Uuid>,
    samples: Vec<Descriptor>,
    last_activity: Option<Instant>,
}

impl<S: CandidateStore, P: EmbeddingProvider> EnrollmentManager<S, P> {
    pub fn new(store: Arc<S>, provider: Arc<P>) -> Self {
        Self {
            store,
            provider,
            session_id: None,
            samples: Vec::new(),
            last_activity: None,
        }
    }

    /// Discard any buffered samples and begin a new session.
    pub fn start_capture(&mut self) -> Uuid {
        let id = Uuid::new_v4();
        if !self.samples.is_empty() {
            tracing::debug!(discarded = self.samples.len(), "enrollment buffer reset");
        }
        self.samples.clear();
        self.session_id = Some(id);
        self.last_activity = Some(Instant::now());
        tracing::info!(session = %id, "enrollment session started");
        id
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Time since the open session was last used; `None` without a session.
    pub fn idle_for(&self) -> Option<Duration> {
        self.session_id?;
        self.last_activity.map(|t| t.elapsed())
    }

    /// Accept `session` only if it is the open one, and mark it active.
    pub fn check_session(&mut self, session: Uuid) -> Result<(), EnrollmentError> {
        match self.session_id {
            None => Err(EnrollmentError::NoActiveSession),
            Some(open) if open != session => Err(EnrollmentError::SessionMismatch(session)),
            Some(_) => {
                self.last_activity = Some(Instant::now());
                Ok(())
            }
        }
    }

    /// Detect a face in `frame` and buffer its descriptor. Returns the new
    /// sample count. The buffer is untouched when no face is found.
    pub async fn add_sample(&mut self, session: Uuid, frame: &Frame) -> Result<usize, EnrollmentError> {
        self.check_session(session)?;
        let detection = self
            .provider
            .detect(frame)
            .await?
            .ok_or(EnrollmentError::NoFaceDetected)?;
        self.add_descriptor(session, detection.descriptor)
    }

    /// Decode an uploaded still image and buffer the face in it.
    pub async fn add_image(&mut self, session: Uuid, bytes: &[u8]) -> Result<usize, EnrollmentError> {
        self.check_session(session)?;
        let frame = Frame::decode(bytes)?;
        self.add_sample(session, &frame).await
    }

    pub fn add_descriptor(
        &mut self,
        session: Uuid,
        descriptor: Descriptor,
    ) -> Result<usize, EnrollmentError> {
        self.check_session(session)?;
        self.samples.push(descriptor);
        tracing::debug!(samples = self.samples.len(), "enrollment sample added");
        Ok(self.samples.len())
    }

    /// Validate `form` against the buffered samples and persist the record.
    ///
    /// An existing candidate keeps its exam number, verified flag and
    /// registration time. The buffer is cleared only on success.
    pub async fn finalize(
        &mut self,
        session: Uuid,
        form: RegistrationForm,
        mode: EnrollMode,
    ) -> Result<CandidateRecord, EnrollmentError> {
        self.check_session(session)?;
        let form = form.validate(self.samples.len())?;
        let now = Utc::now();

        let existing = self.store.get(&form.email).await?;
        let is_new = existing.is_none();

        let mut record = match existing {
            Some(mut record) => {
                if mode == EnrollMode::Reset {
                    record.embeddings.clear();
                }
                record.embeddings.extend(self.samples.iter().copied());
                record.name = form.name;
                record.course = form.course;
                record.state = form.state;
                record.university = form.university;
                record.subjects = form.subjects;
                if form.profile_image.is_some() {
                    record.profile_image = form.profile_image;
                }
                record.updated_at = now;
                record
            }
            None => CandidateRecord {
                email: form.email,
                name: form.name,
                course: form.course,
                university: form.university,
                state: form.state,
                exam_number: generate_exam_number(now),
                subjects: form.subjects,
                embeddings: self.samples.clone(),
                profile_image: form.profile_image,
                verified: false,
                registered_at: now,
                updated_at: now,
            },
        };

        let mut attempt = 1;
        loop {
            match self.store.put(record.clone()).await {
                Ok(()) => break,
                Err(StoreError::ExamNumberTaken { exam_number })
                    if is_new && attempt < EXAM_NUMBER_ATTEMPTS =>
                {
                    tracing::warn!(%exam_number, attempt, "exam number collision, regenerating");
                    record.exam_number = generate_exam_number(Utc::now());
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(
            email = %record.email,
            exam_number = %record.exam_number,
            samples = record.embeddings.len(),
            new = is_new,
            mode = ?mode,
            "candidate enrolled"
        );

        self.cancel();
        Ok(record)
    }

    /// Drop the buffer without writing anything.
    pub fn cancel(&mut self) {
        self.samples.clear();
        self.session_id = None;
        self.last_activity = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use examgate_core::{ScriptedProvider, DESCRIPTOR_DIM};
    use examgate_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn descriptor(value: f32) -> Descriptor {
        Descriptor::new([value; DESCRIPTOR_DIM]).unwrap()
    }

    pub(crate) fn form(email: &str) -> RegistrationForm {
        RegistrationForm {
            name: "Ada Obi".into(),
            course: "Physics".into(),
            state: "Lagos".into(),
            university: "UNILAG".into(),
            email: email.into(),
            subjects: vec!["Maths".into(), "Physics".into(), "Chemistry".into(), "GST".into()],
            profile_image: None,
        }
    }

    async fn manager(
        script: Vec<Option<Descriptor>>,
    ) -> (EnrollmentManager<MemoryStore, ScriptedProvider>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(script));
        provider.load_models().await.unwrap();
        (EnrollmentManager::new(Arc::clone(&store), provider), store)
    }

    fn frame() -> Frame {
        Frame::new(vec![128; 16], 4, 4).unwrap()
    }

    #[tokio::test]
    async fn test_add_sample_no_face_leaves_buffer() {
        let (mut m, _) = manager(vec![Some(descriptor(0.1)), None]).await;
        let id = m.start_capture();
        assert_eq!(m.add_sample(id, &frame()).await.unwrap(), 1);
        assert!(matches!(
            m.add_sample(id, &frame()).await,
            Err(EnrollmentError::NoFaceDetected)
        ));
        assert_eq!(m.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_start_capture_resets_buffer() {
        let (mut m, _) = manager(Vec::new()).await;
        let first = m.start_capture();
        m.add_descriptor(first, descriptor(0.1)).unwrap();
        let second = m.start_capture();
        assert_ne!(first, second);
        assert_eq!(m.sample_count(), 0);
    }

    #[tokio::test]
    async fn test_samples_require_open_session() {
        let (mut m, store) = manager(vec![Some(descriptor(0.5))]).await;
        let stray = Uuid::new_v4();
        assert!(matches!(
            m.add_descriptor(stray, descriptor(0.1)),
            Err(EnrollmentError::NoActiveSession)
        ));
        let png = frame().encode_png().unwrap();
        assert!(matches!(
            m.add_image(stray, &png).await,
            Err(EnrollmentError::NoActiveSession)
        ));

        let open = m.start_capture();
        assert!(matches!(
            m.add_descriptor(stray, descriptor(0.1)),
            Err(EnrollmentError::SessionMismatch(id)) if id == stray
        ));
        m.add_descriptor(open, descriptor(0.1)).unwrap();
        assert!(matches!(
            m.finalize(stray, form("ada@x.com"), EnrollMode::Append).await,
            Err(EnrollmentError::SessionMismatch(_))
        ));
        assert!(store.is_empty().await);
        assert_eq!(m.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_enrollment_does_not_leak_into_next() {
        let (mut m, store) = manager(Vec::new()).await;

        let first = m.start_capture();
        m.add_descriptor(first, descriptor(0.9)).unwrap();
        let mut three = form("a@x.com");
        three.subjects.pop();
        assert!(m.finalize(first, three, EnrollMode::Append).await.is_err());

        let second = m.start_capture();
        m.add_descriptor(second, descriptor(0.1)).unwrap();
        let record = m
            .finalize(second, form("b@x.com"), EnrollMode::Append)
            .await
            .unwrap();
        assert_eq!(record.embeddings, vec![descriptor(0.1)]);

        assert!(matches!(
            m.add_descriptor(first, descriptor(0.9)),
            Err(EnrollmentError::NoActiveSession)
        ));
        assert!(store.get("a@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finalize_new_candidate() {
        let (mut m, store) = manager(Vec::new()).await;
        let id = m.start_capture();
        m.add_descriptor(id, descriptor(0.1)).unwrap();
        m.add_descriptor(id, descriptor(0.2)).unwrap();

        let record = m.finalize(id, form("ada@x.com"), EnrollMode::Append).await.unwrap();
        assert!(record.exam_number.starts_with("EXAM"));
        assert_eq!(record.embeddings.len(), 2);
        assert!(!record.verified);
        assert_eq!(store.get("ada@x.com").await.unwrap(), Some(record));
        assert_eq!(m.sample_count(), 0);
        assert!(m.session_id().is_none());
        assert!(m.idle_for().is_none());
    }

    #[tokio::test]
    async fn test_finalize_three_subjects() {
        let (mut m, store) = manager(Vec::new()).await;
        let id = m.start_capture();
        m.add_descriptor(id, descriptor(0.1)).unwrap();
        let mut f = form("ada@x.com");
        f.subjects.pop();
        assert!(matches!(
            m.finalize(id, f, EnrollMode::Append).await,
            Err(EnrollmentError::Registration(RegistrationError::InvalidSubjectSelection(_)))
        ));
        assert!(store.is_empty().await);
        assert_eq!(m.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_finalize_without_samples() {
        let (mut m, store) = manager(Vec::new()).await;
        let id = m.start_capture();
        assert!(matches!(
            m.finalize(id, form("ada@x.com"), EnrollMode::Append).await,
            Err(EnrollmentError::Registration(RegistrationError::NoEnrollmentData))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_reenroll_appends_and_keeps_identity() {
        let (mut m, store) = manager(Vec::new()).await;
        let id = m.start_capture();
        m.add_descriptor(id, descriptor(0.1)).unwrap();
        let first = m.finalize(id, form("ada@x.com"), EnrollMode::Append).await.unwrap();

        let mut approved = first.clone();
        approved.verified = true;
        store.put(approved).await.unwrap();

        let id = m.start_capture();
        m.add_descriptor(id, descriptor(0.4)).unwrap();
        let mut f = form("ada@x.com");
        f.course = "Chemistry".into();
        let second = m.finalize(id, f, EnrollMode::Append).await.unwrap();

        assert_eq!(second.exam_number, first.exam_number);
        assert_eq!(second.registered_at, first.registered_at);
        assert!(second.verified);
        assert_eq!(second.course, "Chemistry");
        assert_eq!(second.embeddings, vec![descriptor(0.1), descriptor(0.4)]);
    }

    #[tokio::test]
    async fn test_reenroll_reset_replaces_embeddings() {
        let (mut m, _) = manager(Vec::new()).await;
        let id = m.start_capture();
        m.add_descriptor(id, descriptor(0.1)).unwrap();
        m.finalize(id, form("ada@x.com"), EnrollMode::Append).await.unwrap();

        let id = m.start_capture();
        m.add_descriptor(id, descriptor(0.9)).unwrap();
        let record = m.finalize(id, form("ada@x.com"), EnrollMode::Reset).await.unwrap();
        assert_eq!(record.embeddings, vec![descriptor(0.9)]);
    }

    #[tokio::test]
    async fn test_add_image_decodes_upload() {
        let (mut m, _) = manager(vec![Some(descriptor(0.5))]).await;
        let id = m.start_capture();
        let png = frame().encode_png().unwrap();
        assert_eq!(m.add_image(id, &png).await.unwrap(), 1);
        assert!(matches!(
            m.add_image(id, b"not an image").await,
            Err(EnrollmentError::Frame(_))
        ));
    }

    /// Rejects the first `conflicts` puts as exam-number collisions.
    struct Colliding {
        inner: MemoryStore,
        conflicts: AtomicUsize,
    }

    impl CandidateStore for Colliding {
        async fn put(&self, record: CandidateRecord) -> Result<(), StoreError> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::ExamNumberTaken {
                    exam_number: record.exam_number,
                });
            }
            self.inner.put(record).await
        }

        async fn get(&self, email: &str) -> Result<Option<CandidateRecord>, StoreError> {
            self.inner.get(email).await
        }

        async fn get_all(&self) -> Result<Vec<CandidateRecord>, StoreError> {
            self.inner.get_all().await
        }

        async fn delete(&self, email: &str) -> Result<(), StoreError> {
            self.inner.delete(email).await
        }
    }

    #[tokio::test]
    async fn test_exam_number_collision_retries() {
        let store = Arc::new(Colliding {
            inner: MemoryStore::new(),
            conflicts: AtomicUsize::new(1),
        });
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let mut m = EnrollmentManager::new(Arc::clone(&store), provider);
        let id = m.start_capture();
        m.add_descriptor(id, descriptor(0.1)).unwrap();
        m.finalize(id, form("ada@x.com"), EnrollMode::Append).await.unwrap();
        assert!(store.inner.get("ada@x.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exam_number_collision_gives_up() {
        let store = Arc::new(Colliding {
            inner: MemoryStore::new(),
            conflicts: AtomicUsize::new(EXAM_NUMBER_ATTEMPTS),
        });
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let mut m = EnrollmentManager::new(store, provider);
        let id = m.start_capture();
        m.add_descriptor(id, descriptor(0.1)).unwrap();
        assert!(matches!(
            m.finalize(id, form("ada@x.com"), EnrollMode::Append).await,
            Err(EnrollmentError::Store(StoreError::ExamNumberTaken { .. }))
        ));
        assert_eq!(m.sample_count(), 1);
    }
}

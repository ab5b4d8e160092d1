//! Embedding provider seam.
//!
//! The face detector/embedder is an external collaborator. The daemon talks
//! to it over HTTP; tests use [`ScriptedProvider`].

use crate::frame::{Frame, FrameError};
use crate::types::{Descriptor, DescriptorError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("embedding models are not loaded")]
    ModelsNotLoaded,
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("frame encoding failed: {0}")]
    Frame(#[from] FrameError),
    #[error("detection failed: {0}")]
    Detection(String),
    #[error("provider returned an invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
}

/// One detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub descriptor: Descriptor,
    /// Facial landmark points in frame coordinates, when the provider has them.
    #[serde(default)]
    pub landmarks: Option<Vec<(f32, f32)>>,
    #[serde(default)]
    pub score: Option<f32>,
}

impl Detection {
    pub fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            landmarks: None,
            score: None,
        }
    }
}

/// Turns frames into face descriptors.
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// Load detection and recognition models. Must succeed before `detect`.
    fn load_models(&self) -> impl Future<Output = Result<(), ProviderError>> + Send;

    fn models_loaded(&self) -> bool;

    /// Detect a single face. `Ok(None)` means no face was found.
    fn detect(
        &self,
        frame: &Frame,
    ) -> impl Future<Output = Result<Option<Detection>, ProviderError>> + Send;
}

/// Provider that replays a fixed script of detections, one per `detect`
/// call. Once the script runs out every frame reports no face.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Option<Detection>>>,
    loaded: AtomicBool,
    fail_load: bool,
}

impl ScriptedProvider {
    pub fn new(script: impl IntoIterator<Item = Option<Descriptor>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().map(|d| d.map(Detection::new)).collect()),
            loaded: AtomicBool::new(false),
            fail_load: false,
        }
    }

    /// A provider whose `load_models` always fails.
    pub fn broken() -> Self {
        Self {
            fail_load: true,
            ..Self::new(Vec::<Option<Descriptor>>::new())
        }
    }

    /// Append more detections to the end of the script.
    pub fn push(&self, next: Option<Descriptor>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(next.map(Detection::new));
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl EmbeddingProvider for ScriptedProvider {
    async fn load_models(&self) -> Result<(), ProviderError> {
        if self.fail_load {
            return Err(ProviderError::ModelLoad("scripted failure".into()));
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn models_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn detect(&self, _frame: &Frame) -> Result<Option<Detection>, ProviderError> {
        if !self.models_loaded() {
            return Err(ProviderError::ModelsNotLoaded);
        }
        let next = self
            .script
            .lock()
            .map_err(|_| ProviderError::Detection("script lock poisoned".into()))?
            .pop_front();
        Ok(next.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::descriptor;

    fn frame() -> Frame {
        Frame::new(vec![128; 16], 4, 4).unwrap()
    }

    #[tokio::test]
    async fn test_detect_requires_loaded_models() {
        let provider = ScriptedProvider::new([Some(descriptor(0.0))]);
        assert!(matches!(
            provider.detect(&frame()).await,
            Err(ProviderError::ModelsNotLoaded)
        ));
    }

    #[tokio::test]
    async fn test_script_replays_in_order() {
        let provider = ScriptedProvider::new([Some(descriptor(0.0)), None, Some(descriptor(1.0))]);
        provider.load_models().await.unwrap();
        let f = frame();
        assert_eq!(provider.detect(&f).await.unwrap().unwrap().descriptor, descriptor(0.0));
        assert!(provider.detect(&f).await.unwrap().is_none());
        assert_eq!(provider.detect(&f).await.unwrap().unwrap().descriptor, descriptor(1.0));
        // Exhausted script → no face
        assert!(provider.detect(&f).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broken_provider_fails_load() {
        let provider = ScriptedProvider::broken();
        assert!(matches!(provider.load_models().await, Err(ProviderError::ModelLoad(_))));
        assert!(!provider.models_loaded());
    }

    #[test]
    fn test_detection_json_with_landmarks() {
        let json = serde_json::json!({
            "descriptor": vec![0.0f32; 128],
            "landmarks": [[1.0, 2.0], [3.0, 4.0]],
            "score": 0.98,
        });
        let d: Detection = serde_json::from_value(json).unwrap();
        assert_eq!(d.landmarks.unwrap()[1], (3.0, 4.0));
    }
}

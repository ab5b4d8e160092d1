//! HTTP client for the external face detection/embedding service.
//!
//! `POST {base}/models/load` warms the models; `POST {base}/detect` takes a
//! PNG frame and answers `{"face": null}` or
//! `{"face": {"descriptor": [...], "landmarks": [[x, y], ...], "score": f}}`.

use examgate_core::{Descriptor, Detection, EmbeddingProvider, Frame, ProviderError};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Deserialize)]
struct DetectResponse {
    face: Option<RawFace>,
}

#[derive(Debug, Deserialize)]
struct RawFace {
    descriptor: Vec<f32>,
    #[serde(default)]
    landmarks: Option<Vec<(f32, f32)>>,
    #[serde(default)]
    score: Option<f32>,
}

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    loaded: AtomicBool,
}

impl HttpEmbeddingProvider {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            loaded: AtomicBool::new(false),
        }
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn load_models(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models/load", self.base_url);
        self.client
            .post(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProviderError::ModelLoad(e.to_string()))?;

        self.loaded.store(true, Ordering::SeqCst);
        tracing::info!(url = %self.base_url, "embedding models loaded");
        Ok(())
    }

    fn models_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn detect(&self, frame: &Frame) -> Result<Option<Detection>, ProviderError> {
        if !self.models_loaded() {
            return Err(ProviderError::ModelsNotLoaded);
        }

        let png = frame.encode_png()?;
        let response: DetectResponse = self
            .client
            .post(format!("{}/detect", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(png)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProviderError::Detection(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::Detection(format!("malformed response: {e}")))?;

        let Some(face) = response.face else {
            tracing::trace!(seq = frame.sequence, "no face in frame");
            return Ok(None);
        };

        let descriptor = Descriptor::from_slice(&face.descriptor)?;
        Ok(Some(Detection {
            descriptor,
            landmarks: face.landmarks,
            score: face.score,
        }))
    }
}

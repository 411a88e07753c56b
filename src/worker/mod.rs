// Generation worker seam — the remote image/video service the gateway
// fronts, reduced to an opaque request/reply capability. The transport
// behind it (gRPC, in-process stub, ...) is the embedder's concern.

use anyhow::{bail, Result};
use async_trait::async_trait;

/// Raw image returned by the worker, ready to stream back to the browser.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename_hint: String,
}

#[derive(Debug, Clone)]
pub struct GeneratedVideo {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename_hint: String,
}

/// A lora applied (or to be applied) on the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedLora {
    pub path: String,
    pub weight: f32,
}

/// Which pipeline a checkpoint is loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    TextToImage,
    ImageToVideo,
}

impl ModelKind {
    /// Parse the wire value. An empty string defaults to text-to-image for
    /// backwards compatibility.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "t2i" => Ok(Self::TextToImage),
            "i2v" => Ok(Self::ImageToVideo),
            other => bail!(r#"unknown modelType {other:?} (expected "t2i" or "i2v")"#),
        }
    }
}

#[async_trait]
pub trait GenerationWorker: Send + Sync {
    async fn generate_image(&self, positive: &str, negative: &str) -> Result<GeneratedImage>;

    async fn generate_image_to_video(
        &self,
        image: &[u8],
        positive: &str,
        negative: &str,
    ) -> Result<GeneratedVideo>;

    /// Load a checkpoint; returns the path the worker settled on.
    async fn set_model(&self, model_path: &str, kind: ModelKind) -> Result<String>;

    async fn set_loras(&self, loras: &[AppliedLora]) -> Result<Vec<AppliedLora>>;

    async fn current_model(&self) -> Result<String>;

    async fn current_loras(&self) -> Result<Vec<AppliedLora>>;

    /// Unload the checkpoint; returns the cleared path and the loras that
    /// went with it.
    async fn clear_model(&self) -> Result<(String, Vec<AppliedLora>)>;

    async fn clear_loras(&self) -> Result<Vec<AppliedLora>>;
}

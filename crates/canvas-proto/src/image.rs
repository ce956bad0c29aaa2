//! Image generation and the store that backs image handles.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::descriptors::DescriptorSet;
use crate::error::GenerationError;
use crate::inference::{ImageBytes, InferenceClient};

/// Path prefix under which the daemon serves stored images.
pub const IMAGE_ROUTE_PREFIX: &str = "/api/image";

/// Opaque, releasable reference to generated image bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageHandle(pub u64);

/// What the image slot carries: the handle plus enough to render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub handle: ImageHandle,
    pub url: String,
    pub content_type: String,
    pub size: usize,
}

/// Cloning shares the bytes.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub data: Bytes,
    pub content_type: String,
}

/// In-memory home of generated images. A handle stays dereferenceable until
/// it is released; releasing one handle never touches another.
#[derive(Default)]
pub struct ImageStore {
    next_id: AtomicU64,
    images: RwLock<HashMap<ImageHandle, StoredImage>>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, image: ImageBytes) -> ImageRef {
        let handle = ImageHandle(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let image_ref = ImageRef {
            handle,
            url: format!("{}/{}", IMAGE_ROUTE_PREFIX, handle.0),
            content_type: image.content_type.clone(),
            size: image.data.len(),
        };
        self.images.write().await.insert(
            handle,
            StoredImage {
                data: image.data,
                content_type: image.content_type,
            },
        );
        debug!("[image] Stored handle {} ({} bytes)", handle.0, image_ref.size);
        image_ref
    }

    pub async fn get(&self, handle: ImageHandle) -> Option<StoredImage> {
        self.images.read().await.get(&handle).cloned()
    }

    /// Returns false when the handle was already released (or never existed).
    pub async fn release(&self, handle: ImageHandle) -> bool {
        let released = self.images.write().await.remove(&handle).is_some();
        if released {
            debug!("[image] Released handle {}", handle.0);
        }
        released
    }

    pub async fn len(&self) -> usize {
        self.images.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.images.read().await.is_empty()
    }
}

/// The prompt sent to the image model, descriptors in slot order.
pub fn build_image_prompt(descriptors: &DescriptorSet) -> String {
    format!(
        "Generate an image of an abstract scene that embodies the following adjectives: {}.",
        descriptors.as_slice().join(", ")
    )
}

/// Third pipeline stage: descriptors in, raw image bytes out.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn image(&self, descriptors: &DescriptorSet) -> Result<ImageBytes, GenerationError>;
}

pub struct ImageGenerator {
    inference: InferenceClient,
    model_url: String,
}

impl ImageGenerator {
    pub fn new(inference: InferenceClient, model_url: impl Into<String>) -> Self {
        Self {
            inference,
            model_url: model_url.into(),
        }
    }
}

#[async_trait]
impl ImageSource for ImageGenerator {
    async fn image(&self, descriptors: &DescriptorSet) -> Result<ImageBytes, GenerationError> {
        let prompt = build_image_prompt(descriptors);
        debug!("[image] Prompt: {}", prompt);
        let image = self.inference.generate_image(&self.model_url, &prompt).await?;
        info!(
            "[image] Received {} bytes of {}",
            image.data.len(),
            image.content_type
        );
        Ok(image)
    }
}

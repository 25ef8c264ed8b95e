use crate::storage::{ObjectStore, StorageError};
use image::{imageops::FilterType, DynamicImage};
use serde::Serialize;
use thiserror::Error;

pub const THUMBNAIL_SIZE: u32 = 300;
pub const THUMBNAIL_QUALITY: u8 = 80;
pub const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("Source image could not be decoded: {0}")]
    SourceUnreadable(#[source] image::ImageError),

    #[error("Thumbnail encoding failed: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Storage error: {0}")]
    Store(#[from] StorageError),

    #[error("Thumbnail worker failed: {message}")]
    Worker { message: String },
}

/// Where a derived thumbnail ended up.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoredThumbnail {
    pub thumbnail_path: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone)]
pub struct ThumbnailService {
    thumbnail_size: u32,
    quality: u8,
}

impl ThumbnailService {
    pub fn new() -> Self {
        Self {
            thumbnail_size: THUMBNAIL_SIZE,
            quality: THUMBNAIL_QUALITY,
        }
    }

    /// Produce a square JPEG thumbnail from encoded image bytes.
    ///
    /// The source is scaled until its shorter edge matches the target size and the
    /// longer edge is center-cropped, so the output is never letterboxed or stretched.
    pub fn derive(&self, source: &[u8]) -> Result<Vec<u8>, ThumbnailError> {
        let img = self.load_image(source)?;
        let thumbnail = self.cover_crop(&img);
        self.encode_thumbnail(&thumbnail)
    }

    /// Fetch `image_path` from the store, derive its thumbnail off the async
    /// runtime, and write it to `thumbnail_path`.
    pub async fn derive_and_store(
        &self,
        store: &dyn ObjectStore,
        image_path: &str,
        thumbnail_path: &str,
    ) -> Result<StoredThumbnail, ThumbnailError> {
        let source = store.get(image_path).await?;

        let service = self.clone();
        let bytes = tokio::task::spawn_blocking(move || service.derive(&source))
            .await
            .map_err(|e| ThumbnailError::Worker {
                message: e.to_string(),
            })??;

        let stored_path = store
            .put(thumbnail_path, bytes, THUMBNAIL_CONTENT_TYPE)
            .await?;

        log::debug!("Derived thumbnail {} from {}", stored_path, image_path);

        Ok(StoredThumbnail {
            thumbnail_url: store.public_url(&stored_path),
            thumbnail_path: stored_path,
        })
    }

    fn load_image(&self, source: &[u8]) -> Result<DynamicImage, ThumbnailError> {
        image::load_from_memory(source).map_err(ThumbnailError::SourceUnreadable)
    }

    fn cover_crop(&self, img: &DynamicImage) -> DynamicImage {
        img.resize_to_fill(self.thumbnail_size, self.thumbnail_size, FilterType::Lanczos3)
    }

    fn encode_thumbnail(&self, img: &DynamicImage) -> Result<Vec<u8>, ThumbnailError> {
        // JPEG has no alpha channel
        let rgb_img = img.to_rgb8();

        let mut output = Vec::new();
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, self.quality);
        rgb_img
            .write_with_encoder(encoder)
            .map_err(ThumbnailError::Encode)?;

        Ok(output)
    }
}

impl Default for ThumbnailService {
    fn default() -> Self {
        Self::new()
    }
}

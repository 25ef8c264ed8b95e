use crate::config::AppConfig;
use crate::core::annotate::{AnnotateError, AnnotationSource, Annotator};
use crate::core::image::UploadFile;
use crate::core::search::{SearchError, SearchFilter};
use crate::core::similarity::{SimilarityEngine, SimilarityError};
use crate::core::thumbnail::{StoredThumbnail, ThumbnailError, ThumbnailService};
use crate::database::models::{Annotation, ImageView, ProcessingStatus};
use crate::database::repositories::ImageRepository;
use crate::database::{Database, DatabaseError};
use crate::services::gallery::{DeletedImage, GalleryError, GalleryService, ImagePage};
use crate::services::ingest::{BatchReport, IngestEvent, IngestionService};
use crate::services::AnnotationService;
use crate::storage::{LocalObjectStore, ObjectStore};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Boundary error, classified the way an HTTP layer would report it.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl CommandError {
    pub fn status_code(&self) -> u16 {
        match self {
            CommandError::BadRequest(_) => 400,
            CommandError::NotFound(_) => 404,
            CommandError::Internal(_) => 500,
        }
    }
}

impl Serialize for CommandError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut body = serializer.serialize_struct("CommandError", 1)?;
        body.serialize_field("error", &self.to_string())?;
        body.end()
    }
}

impl From<ThumbnailError> for CommandError {
    fn from(error: ThumbnailError) -> Self {
        CommandError::Internal(error.to_string())
    }
}

impl From<SimilarityError> for CommandError {
    fn from(error: SimilarityError) -> Self {
        match error {
            SimilarityError::NotFound { .. } => CommandError::NotFound(error.to_string()),
            SimilarityError::Store(e) => CommandError::Internal(e.to_string()),
        }
    }
}

impl From<SearchError> for CommandError {
    fn from(error: SearchError) -> Self {
        match error {
            SearchError::InvalidColor(e) => CommandError::BadRequest(e.to_string()),
            SearchError::Store(e) => CommandError::Internal(e.to_string()),
        }
    }
}

impl From<GalleryError> for CommandError {
    fn from(error: GalleryError) -> Self {
        match error {
            GalleryError::NotFound { .. } => CommandError::NotFound(error.to_string()),
            GalleryError::InvalidTransition { .. } => CommandError::BadRequest(error.to_string()),
            GalleryError::Database(e) => CommandError::Internal(e.to_string()),
        }
    }
}

impl From<DatabaseError> for CommandError {
    fn from(error: DatabaseError) -> Self {
        CommandError::Internal(error.to_string())
    }
}

impl From<AnnotateError> for CommandError {
    fn from(error: AnnotateError) -> Self {
        CommandError::Internal(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotateResponse {
    pub description: String,
    pub tags: Vec<String>,
    pub colors: Vec<String>,
    pub source: AnnotationSource,
}

/// Everything the boundary operations share.
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub store: Arc<dyn ObjectStore>,
    annotation_service: AnnotationService,
    thumbnail_service: ThumbnailService,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: Database,
        store: Arc<dyn ObjectStore>,
        annotator: Annotator,
    ) -> Self {
        let annotation_service = AnnotationService::new(Arc::new(annotator), db.clone());
        Self {
            config,
            db,
            store,
            annotation_service,
            thumbnail_service: ThumbnailService::new(),
        }
    }

    /// Open the metadata store and the local object store described by `config`.
    pub fn from_config(config: AppConfig) -> Result<Self, CommandError> {
        let db = Database::open(&config.database_path)
            .map_err(|e| CommandError::Internal(format!("Failed to open database: {}", e)))?;
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
            config.storage_dir.clone(),
            config.public_base_url.clone(),
        ));
        let annotator = Annotator::from_config(&config)?;

        if annotator.has_client() {
            log::info!("Vision model {} at {}", config.vision_model, config.vision_base_url);
            if config.objects_unreachable_by_model() {
                log::warn!(
                    "Objects are served from {}, which the vision model cannot fetch; \
                     set IMAGELENS_PUBLIC_URL or annotations will fall back",
                    config.public_base_url
                );
            }
        } else {
            log::info!("No OpenAI API key set, annotations will use mock data");
        }

        Ok(Self::new(config, db, store, annotator))
    }

    pub fn ingestion_service(&self) -> IngestionService {
        IngestionService::new(
            self.store.clone(),
            self.db.clone(),
            self.annotation_service.clone(),
        )
        .with_store_timeout(self.config.store_timeout())
    }

    pub fn gallery(&self) -> GalleryService {
        GalleryService::new(self.db.clone(), self.store.clone(), self.config.store_timeout())
    }

    fn similarity_engine(&self) -> SimilarityEngine {
        SimilarityEngine::new(self.db.clone(), self.store.clone())
            .with_limit(self.config.similar_limit)
    }

    fn search_filter(&self) -> SearchFilter {
        SearchFilter::new(self.db.clone(), self.store.clone())
            .with_threshold(self.config.color_threshold)
    }
}

fn require<'a>(value: &'a str, message: &str) -> Result<&'a str, CommandError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CommandError::BadRequest(message.to_string()));
    }
    Ok(value)
}

pub async fn derive_thumbnail(
    state: &AppState,
    image_path: &str,
    thumbnail_path: &str,
) -> Result<StoredThumbnail, CommandError> {
    const MISSING: &str = "Missing imagePath or thumbnailPath";
    let image_path = require(image_path, MISSING)?;
    let thumbnail_path = require(thumbnail_path, MISSING)?;

    let stored = state
        .thumbnail_service
        .derive_and_store(state.store.as_ref(), image_path, thumbnail_path)
        .await
        .map_err(|e| {
            log::error!("Thumbnail generation error: {}", e);
            e
        })?;

    link_thumbnail(state, image_path, &stored.thumbnail_path);
    Ok(stored)
}

/// Point records of `image_path` that still lack a thumbnail at the new one.
/// The thumbnail is already stored, so failures here are only logged.
fn link_thumbnail(state: &AppState, image_path: &str, thumbnail_path: &str) {
    let images = ImageRepository::new(state.db.clone());
    let pending = match images.find_without_thumbnail(image_path) {
        Ok(pending) => pending,
        Err(e) => {
            log::warn!("Could not look up records for {}: {}", image_path, e);
            return;
        }
    };

    for image in pending {
        match images.set_thumbnail_path(image.id, thumbnail_path) {
            Ok(_) => log::debug!("Linked thumbnail {} to image {}", thumbnail_path, image.id),
            Err(e) => log::warn!("Could not link thumbnail to image {}: {}", image.id, e),
        }
    }
}

/// Annotate an image and persist the result under the image's owner.
///
/// Model failures are absorbed into fallback content; only a failed owner lookup
/// or a failed write is reported.
pub async fn annotate(
    state: &AppState,
    image_path: &str,
    image_id: i64,
) -> Result<AnnotateResponse, CommandError> {
    const MISSING: &str = "Missing imagePath or imageId";
    let image_path = require(image_path, MISSING)?;
    if image_id <= 0 {
        return Err(CommandError::BadRequest(MISSING.to_string()));
    }

    let owner_id = ImageRepository::new(state.db.clone())
        .find_by_id(image_id)
        .map_err(|e| CommandError::Internal(format!("Image lookup failed: {}", e)))?
        .owner_id;

    let image_url = state.store.public_url(image_path);
    let (outcome, _) = state
        .annotation_service
        .annotate_image(image_id, &owner_id, &image_url)
        .await
        .map_err(|e| CommandError::Internal(format!("Database update failed: {}", e)))?;

    let source = outcome.source();
    let result = outcome.into_result();
    Ok(AnnotateResponse {
        description: result.description,
        tags: result.tags,
        colors: result.colors,
        source,
    })
}

pub async fn upload_batch(
    state: &AppState,
    owner_id: &str,
    files: Vec<UploadFile>,
    progress: Option<mpsc::UnboundedSender<IngestEvent>>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<BatchReport, CommandError> {
    let owner_id = require(owner_id, "Missing owner")?;
    if files.is_empty() {
        return Err(CommandError::BadRequest("No files to upload".to_string()));
    }

    let mut service = state.ingestion_service();
    if let Some(sender) = progress {
        service = service.with_progress_sender(sender);
    }
    if let Some(token) = cancel {
        service = service.with_cancellation_token(token);
    }

    Ok(service.upload_batch(owner_id, files).await)
}

pub fn find_similar(
    state: &AppState,
    image_id: i64,
    owner_id: &str,
) -> Result<Vec<ImageView>, CommandError> {
    Ok(state.similarity_engine().find_similar(image_id, owner_id)?)
}

pub fn search_text(
    state: &AppState,
    owner_id: &str,
    query: &str,
) -> Result<Vec<ImageView>, CommandError> {
    Ok(state.search_filter().search_text(owner_id, query)?)
}

pub fn search_color(
    state: &AppState,
    owner_id: &str,
    color: &str,
) -> Result<Vec<ImageView>, CommandError> {
    Ok(state.search_filter().search_color(owner_id, color)?)
}

pub fn list_images(
    state: &AppState,
    owner_id: &str,
    page: Option<u32>,
    limit: Option<u32>,
) -> Result<ImagePage, CommandError> {
    Ok(state.gallery().list_images(owner_id, page, limit)?)
}

pub fn get_image(state: &AppState, image_id: i64, owner_id: &str) -> Result<ImageView, CommandError> {
    Ok(state.gallery().get_image(image_id, owner_id)?)
}

pub fn processing_status(
    state: &AppState,
    image_id: i64,
    owner_id: &str,
) -> Result<ProcessingStatus, CommandError> {
    Ok(state.gallery().processing_status(image_id, owner_id)?)
}

pub fn update_processing_status(
    state: &AppState,
    image_id: i64,
    owner_id: &str,
    status: &str,
) -> Result<Annotation, CommandError> {
    let status: ProcessingStatus = status
        .parse()
        .map_err(|e: DatabaseError| CommandError::BadRequest(e.to_string()))?;
    Ok(state
        .gallery()
        .update_processing_status(image_id, owner_id, status)?)
}

pub async fn delete_image(
    state: &AppState,
    image_id: i64,
    owner_id: &str,
) -> Result<DeletedImage, CommandError> {
    Ok(state.gallery().delete_image(image_id, owner_id).await?)
}

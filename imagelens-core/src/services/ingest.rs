use crate::core::annotate::AnnotationSource;
use crate::core::image::UploadFile;
use crate::core::thumbnail::{StoredThumbnail, ThumbnailError, ThumbnailService};
use crate::database::models::{Image, NewImage};
use crate::database::repositories::ImageRepository;
use crate::database::{Database, DatabaseError};
use crate::services::annotation::AnnotationService;
use crate::storage::{
    original_object_path, thumbnail_object_path, with_timeout, ObjectStore, StorageError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Storage error: {0}")]
    Store(#[from] StorageError),

    #[error("Thumbnail generation error: {0}")]
    Thumbnail(#[from] ThumbnailError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Stable identity of one file within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub filename: String,
    pub progress: u8,
    pub status: UploadStatus,
    pub error: Option<String>,
}

impl UploadProgress {
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            progress: 0,
            status: UploadStatus::Uploading,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    Progress {
        id: UploadId,
        progress: UploadProgress,
    },
    FileCompleted {
        id: UploadId,
        filename: String,
        image_id: i64,
        source: Option<AnnotationSource>,
    },
    FileFailed {
        id: UploadId,
        filename: String,
        message: String,
    },
    BatchFinished {
        completed: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub id: UploadId,
    pub progress: UploadProgress,
    pub image_id: Option<i64>,
    pub annotation_source: Option<AnnotationSource>,
}

/// Final state of every file in a batch, in submission order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
}

impl BatchReport {
    pub fn completed_count(&self) -> usize {
        self.count(UploadStatus::Completed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(UploadStatus::Error)
    }

    fn count(&self, status: UploadStatus) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.progress.status == status)
            .count()
    }
}

/// Per-batch progress map, keyed by upload id and owned by the running batch.
struct ProgressTracker {
    progress: HashMap<UploadId, UploadProgress>,
    sender: Option<mpsc::UnboundedSender<IngestEvent>>,
}

impl ProgressTracker {
    fn new(sender: Option<mpsc::UnboundedSender<IngestEvent>>) -> Self {
        Self {
            progress: HashMap::new(),
            sender,
        }
    }

    fn register(&mut self, id: UploadId, filename: &str) {
        self.progress.insert(id, UploadProgress::new(filename));
    }

    fn advance(&mut self, id: UploadId, status: UploadStatus, progress: u8) {
        if let Some(entry) = self.progress.get_mut(&id) {
            entry.status = status;
            entry.progress = progress;
            let snapshot = entry.clone();
            self.send(IngestEvent::Progress {
                id,
                progress: snapshot,
            });
        }
    }

    fn fail(&mut self, id: UploadId, message: String) {
        if let Some(entry) = self.progress.get_mut(&id) {
            entry.status = UploadStatus::Error;
            entry.progress = 0;
            entry.error = Some(message.clone());
            let snapshot = entry.clone();
            let filename = snapshot.filename.clone();
            self.send(IngestEvent::Progress {
                id,
                progress: snapshot,
            });
            self.send(IngestEvent::FileFailed {
                id,
                filename,
                message,
            });
        }
    }

    fn take(&mut self, id: UploadId) -> Option<UploadProgress> {
        self.progress.remove(&id)
    }

    fn send(&self, event: IngestEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

struct Ingested {
    image: Image,
    source: Option<AnnotationSource>,
}

/// Drives uploaded files through store, thumbnail, record and annotation stages.
pub struct IngestionService {
    store: Arc<dyn ObjectStore>,
    images: ImageRepository,
    thumbnail_service: ThumbnailService,
    annotation_service: AnnotationService,
    store_timeout: Duration,
    progress_sender: Option<mpsc::UnboundedSender<IngestEvent>>,
    cancellation_token: Arc<AtomicBool>,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        db: Database,
        annotation_service: AnnotationService,
    ) -> Self {
        Self {
            store,
            images: ImageRepository::new(db),
            thumbnail_service: ThumbnailService::new(),
            annotation_service,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<IngestEvent>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    /// Share a cancellation flag with the caller. Once set, files not yet
    /// started fail with `Cancelled`.
    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Ingest `files` one after another. A failing file never aborts the batch.
    pub async fn upload_batch(&self, owner_id: &str, files: Vec<UploadFile>) -> BatchReport {
        let mut tracker = ProgressTracker::new(self.progress_sender.clone());
        let ids: Vec<UploadId> = files
            .iter()
            .map(|file| {
                let id = UploadId::new();
                tracker.register(id, &file.filename);
                id
            })
            .collect();

        log::info!("Uploading {} files for {}", files.len(), owner_id);

        let mut report = BatchReport::default();
        for (id, file) in ids.into_iter().zip(files) {
            let filename = file.filename.clone();

            let result = if self.cancellation_token.load(Ordering::Relaxed) {
                Err(IngestError::Cancelled)
            } else {
                self.ingest_file(id, owner_id, file, &mut tracker).await
            };

            let (image_id, annotation_source) = match result {
                Ok(ingested) => {
                    tracker.send(IngestEvent::FileCompleted {
                        id,
                        filename: filename.clone(),
                        image_id: ingested.image.id,
                        source: ingested.source,
                    });
                    (Some(ingested.image.id), ingested.source)
                }
                Err(e) => {
                    log::error!("Upload of {} failed: {}", filename, e);
                    tracker.fail(id, e.to_string());
                    (None, None)
                }
            };

            let progress = tracker
                .take(id)
                .unwrap_or_else(|| UploadProgress::new(&filename));
            report.entries.push(BatchEntry {
                id,
                progress,
                image_id,
                annotation_source,
            });
        }

        let completed = report.completed_count();
        let failed = report.failed_count();
        log::info!("Batch finished: {} completed, {} failed", completed, failed);
        tracker.send(IngestEvent::BatchFinished { completed, failed });

        report
    }

    async fn ingest_file(
        &self,
        id: UploadId,
        owner_id: &str,
        file: UploadFile,
        tracker: &mut ProgressTracker,
    ) -> Result<Ingested, IngestError> {
        let mime_type = file.resolved_mime_type();
        let file_size = file.size_bytes() as i64;

        tracker.advance(id, UploadStatus::Uploading, 10);
        let object_path = original_object_path(owner_id, &file.filename);
        let original_path = with_timeout(
            self.store_timeout,
            self.store.put(&object_path, file.bytes, &mime_type),
        )
        .await?;
        tracker.advance(id, UploadStatus::Uploading, 50);

        let thumbnail = match self.derive_thumbnail(&original_path).await {
            Ok(thumbnail) => thumbnail,
            Err(e) => {
                self.remove_orphans(vec![original_path]).await;
                return Err(e);
            }
        };
        tracker.advance(id, UploadStatus::Processing, 70);

        let created = self.images.create(&NewImage {
            owner_id: owner_id.to_string(),
            filename: file.filename.clone(),
            original_path: original_path.clone(),
            thumbnail_path: Some(thumbnail.thumbnail_path.clone()),
            file_size,
            mime_type,
        });
        let image = match created {
            Ok(image) => image,
            Err(e) => {
                self.remove_orphans(vec![original_path, thumbnail.thumbnail_path])
                    .await;
                return Err(e.into());
            }
        };
        tracker.advance(id, UploadStatus::Processing, 90);

        let image_url = self.store.public_url(&image.original_path);
        let source = match self
            .annotation_service
            .annotate_image(image.id, owner_id, &image_url)
            .await
        {
            Ok((outcome, _)) => Some(outcome.source()),
            Err(e) => {
                log::warn!("Annotation of image {} was not saved: {}", image.id, e);
                None
            }
        };
        tracker.advance(id, UploadStatus::Completed, 100);

        log::info!("Ingested {} as image {}", file.filename, image.id);
        Ok(Ingested { image, source })
    }

    async fn derive_thumbnail(&self, original_path: &str) -> Result<StoredThumbnail, IngestError> {
        let thumbnail_path = thumbnail_object_path(original_path);
        let derive = self.thumbnail_service.derive_and_store(
            self.store.as_ref(),
            original_path,
            &thumbnail_path,
        );

        match tokio::time::timeout(self.store_timeout, derive).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StorageError::Timeout {
                seconds: self.store_timeout.as_secs(),
            }
            .into()),
        }
    }

    async fn remove_orphans(&self, paths: Vec<String>) {
        let removal = with_timeout(self.store_timeout, self.store.remove(&paths)).await;
        if let Err(e) = removal {
            log::warn!("Could not remove orphaned objects {:?}: {}", paths, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::annotate::{Annotator, MOCK_DESCRIPTION};
    use crate::database::models::ProcessingStatus;
    use crate::database::repositories::AnnotationRepository;
    use crate::storage::LocalObjectStore;
    use async_trait::async_trait;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn create_test_image(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128u8])
        });
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    /// Local store whose n-th thumbnail write fails.
    struct FlakyStore {
        inner: LocalObjectStore,
        fail_on_thumbnail: usize,
        thumbnail_puts: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(
            &self,
            path: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> Result<String, StorageError> {
            if path.starts_with("thumbnails/") {
                let attempt = self.thumbnail_puts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt == self.fail_on_thumbnail {
                    return Err(StorageError::Io(std::io::Error::other("disk full")));
                }
            }
            self.inner.put(path, bytes, content_type).await
        }

        async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
            self.inner.get(path).await
        }

        async fn remove(&self, paths: &[String]) -> Result<(), StorageError> {
            self.inner.remove(paths).await
        }

        fn public_url(&self, path: &str) -> String {
            self.inner.public_url(path)
        }
    }

    struct Fixture {
        temp_dir: TempDir,
        db: Database,
        store: Arc<dyn ObjectStore>,
    }

    fn fixture(fail_on_thumbnail: usize) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FlakyStore {
            inner: LocalObjectStore::new(temp_dir.path().to_path_buf(), "https://cdn.test"),
            fail_on_thumbnail,
            thumbnail_puts: AtomicUsize::new(0),
        });
        Fixture {
            temp_dir,
            db: Database::open_in_memory().unwrap(),
            store,
        }
    }

    fn service(f: &Fixture) -> IngestionService {
        let annotations = AnnotationService::new(Arc::new(Annotator::new(None)), f.db.clone());
        IngestionService::new(f.store.clone(), f.db.clone(), annotations)
    }

    fn stored_files(dir: &std::path::Path) -> usize {
        let mut count = 0;
        let mut pending = vec![dir.to_path_buf()];
        while let Some(path) = pending.pop() {
            for entry in std::fs::read_dir(&path).unwrap() {
                let entry = entry.unwrap();
                if entry.file_type().unwrap().is_dir() {
                    pending.push(entry.path());
                } else {
                    count += 1;
                }
            }
        }
        count
    }

    #[tokio::test]
    async fn test_batch_survives_failing_file() {
        let f = fixture(2);
        let files = vec![
            UploadFile::new("one.png", create_test_image(640, 480)),
            UploadFile::new("two.png", create_test_image(200, 400)),
            UploadFile::new("three.png", create_test_image(300, 300)),
        ];

        let report = service(&f).upload_batch("alice", files).await;

        let statuses: Vec<UploadStatus> =
            report.entries.iter().map(|e| e.progress.status).collect();
        assert_eq!(
            statuses,
            vec![
                UploadStatus::Completed,
                UploadStatus::Error,
                UploadStatus::Completed
            ]
        );

        let failed = &report.entries[1];
        assert_eq!(failed.progress.filename, "two.png");
        assert_eq!(failed.progress.progress, 0);
        assert!(failed.progress.error.as_deref().unwrap().contains("disk full"));
        assert!(failed.image_id.is_none());

        assert_eq!(report.entries[0].progress.progress, 100);
        assert_eq!(report.completed_count(), 2);
        assert_eq!(report.failed_count(), 1);

        let images = ImageRepository::new(f.db.clone());
        assert_eq!(images.count_by_owner("alice").unwrap(), 2);

        // Two originals and two thumbnails; the failed file left nothing behind.
        assert_eq!(stored_files(f.temp_dir.path()), 4);
    }

    #[tokio::test]
    async fn test_completed_files_are_annotated() {
        let f = fixture(0);
        let report = service(&f)
            .upload_batch("alice", vec![UploadFile::new("a.png", create_test_image(50, 80))])
            .await;

        let entry = &report.entries[0];
        assert_eq!(entry.annotation_source, Some(AnnotationSource::Mock));

        let image_id = entry.image_id.unwrap();
        let image = ImageRepository::new(f.db.clone())
            .find_owned(image_id, "alice")
            .unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert!(image.original_path.starts_with("alice/"));
        assert_eq!(
            image.thumbnail_path.as_deref(),
            Some(format!("thumbnails/{}", image.original_path).as_str())
        );

        let annotation = AnnotationRepository::new(f.db.clone())
            .find_by_image(image_id, "alice")
            .unwrap();
        assert_eq!(annotation.status, ProcessingStatus::Completed);
        assert_eq!(annotation.description.as_deref(), Some(MOCK_DESCRIPTION));
    }

    #[tokio::test]
    async fn test_progress_events_follow_checkpoints() {
        let f = fixture(0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = service(&f).with_progress_sender(tx);

        service
            .upload_batch("alice", vec![UploadFile::new("a.png", create_test_image(20, 20))])
            .await;
        drop(service);

        let mut checkpoints = Vec::new();
        let mut completed = 0;
        let mut finished = None;
        while let Some(event) = rx.recv().await {
            match event {
                IngestEvent::Progress { progress, .. } => {
                    checkpoints.push((progress.status, progress.progress))
                }
                IngestEvent::FileCompleted { .. } => completed += 1,
                IngestEvent::FileFailed { .. } => panic!("unexpected failure"),
                IngestEvent::BatchFinished { completed, failed } => {
                    finished = Some((completed, failed))
                }
            }
        }

        assert_eq!(
            checkpoints,
            vec![
                (UploadStatus::Uploading, 10),
                (UploadStatus::Uploading, 50),
                (UploadStatus::Processing, 70),
                (UploadStatus::Processing, 90),
                (UploadStatus::Completed, 100),
            ]
        );
        assert_eq!(completed, 1);
        assert_eq!(finished, Some((1, 0)));
    }

    #[tokio::test]
    async fn test_unreadable_upload_is_cleaned_up() {
        let f = fixture(0);
        let report = service(&f)
            .upload_batch(
                "alice",
                vec![UploadFile::new("notes.txt", b"not an image".to_vec())],
            )
            .await;

        let entry = &report.entries[0];
        assert_eq!(entry.progress.status, UploadStatus::Error);
        assert!(entry
            .progress
            .error
            .as_deref()
            .unwrap()
            .contains("could not be decoded"));
        assert_eq!(stored_files(f.temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_cancelled_batch_starts_nothing() {
        let f = fixture(0);
        let token = Arc::new(AtomicBool::new(false));
        let service = service(&f).with_cancellation_token(token.clone());
        token.store(true, Ordering::Relaxed);

        let report = service
            .upload_batch(
                "alice",
                vec![
                    UploadFile::new("a.png", create_test_image(10, 10)),
                    UploadFile::new("b.png", create_test_image(10, 10)),
                ],
            )
            .await;

        assert_eq!(report.failed_count(), 2);
        for entry in &report.entries {
            assert_eq!(entry.progress.error.as_deref(), Some("Operation cancelled"));
        }
        assert_eq!(
            ImageRepository::new(f.db.clone())
                .count_by_owner("alice")
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_upload_ids_are_distinct() {
        let f = fixture(0);
        let report = service(&f)
            .upload_batch(
                "alice",
                vec![
                    UploadFile::new("same.png", create_test_image(10, 10)),
                    UploadFile::new("same.png", create_test_image(10, 10)),
                ],
            )
            .await;

        assert_ne!(report.entries[0].id, report.entries[1].id);
        assert_ne!(report.entries[0].image_id, report.entries[1].image_id);
    }
}

use crate::database::models::{Annotation, ImageView, ProcessingStatus};
use crate::database::repositories::{AnnotationRepository, ImageRepository};
use crate::database::{Database, DatabaseError};
use crate::storage::{with_timeout, ObjectStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("Image {id} not found")]
    NotFound { id: i64 },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    #[error("Metadata store error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for GalleryError {
    fn from(error: DatabaseError) -> Self {
        match error {
            DatabaseError::NotFound { id, .. } => GalleryError::NotFound { id },
            DatabaseError::InvalidTransition { from, to } => {
                GalleryError::InvalidTransition { from, to }
            }
            other => GalleryError::Database(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl Pagination {
    /// Zero page or limit falls back to the defaults.
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        let page = if page == 0 { DEFAULT_PAGE } else { page };
        let limit = if limit == 0 { DEFAULT_PAGE_SIZE } else { limit };
        Self {
            page,
            limit,
            total,
            total_pages: total.div_ceil(u64::from(limit)),
        }
    }

    /// Saturates for pages far past the end; such pages come back empty.
    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)).saturating_mul(i64::from(self.limit))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePage {
    pub images: Vec<ImageView>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedImage {
    pub image_id: i64,
    pub binaries_removed: bool,
}

/// Browsing and housekeeping over one owner's images.
pub struct GalleryService {
    images: ImageRepository,
    annotations: AnnotationRepository,
    store: Arc<dyn ObjectStore>,
    store_timeout: Duration,
}

impl GalleryService {
    pub fn new(db: Database, store: Arc<dyn ObjectStore>, store_timeout: Duration) -> Self {
        Self {
            images: ImageRepository::new(db.clone()),
            annotations: AnnotationRepository::new(db),
            store,
            store_timeout,
        }
    }

    /// Most recent first.
    pub fn list_images(
        &self,
        owner_id: &str,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<ImagePage, GalleryError> {
        let total = self.images.count_by_owner(owner_id)?.max(0) as u64;
        let pagination = Pagination::new(
            page.unwrap_or(DEFAULT_PAGE),
            limit.unwrap_or(DEFAULT_PAGE_SIZE),
            total,
        );

        let records = self.images.list_records_page(
            owner_id,
            i64::from(pagination.limit),
            pagination.offset(),
        )?;

        Ok(ImagePage {
            images: ImageView::resolve_all(records, self.store.as_ref()),
            pagination,
        })
    }

    pub fn get_image(&self, image_id: i64, owner_id: &str) -> Result<ImageView, GalleryError> {
        let record = self.images.find_record(image_id, owner_id)?;
        Ok(ImageView::resolve(record, self.store.as_ref()))
    }

    pub fn processing_status(
        &self,
        image_id: i64,
        owner_id: &str,
    ) -> Result<ProcessingStatus, GalleryError> {
        Ok(self.annotations.find_by_image(image_id, owner_id)?.status)
    }

    pub fn update_processing_status(
        &self,
        image_id: i64,
        owner_id: &str,
        status: ProcessingStatus,
    ) -> Result<Annotation, GalleryError> {
        Ok(self.annotations.set_status(image_id, owner_id, status)?)
    }

    /// Remove both binaries, then the record. A failed binary removal is logged
    /// and the record is deleted anyway.
    pub async fn delete_image(
        &self,
        image_id: i64,
        owner_id: &str,
    ) -> Result<DeletedImage, GalleryError> {
        let image = self.images.find_owned(image_id, owner_id)?;

        let mut paths = vec![image.original_path.clone()];
        paths.extend(image.thumbnail_path.clone());

        let binaries_removed =
            match with_timeout(self.store_timeout, self.store.remove(&paths)).await {
                Ok(()) => true,
                Err(e) => {
                    log::error!("Storage deletion for image {} failed: {}", image_id, e);
                    false
                }
            };

        self.images.delete(image_id, owner_id)?;
        log::info!("Deleted image {} ({})", image_id, image.filename);

        Ok(DeletedImage {
            image_id,
            binaries_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{AnnotationUpdate, NewImage};
    use crate::storage::{LocalObjectStore, StorageError};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct BrokenStore;

    #[async_trait]
    impl ObjectStore for BrokenStore {
        async fn put(&self, path: &str, _: Vec<u8>, _: &str) -> Result<String, StorageError> {
            Ok(path.to_string())
        }

        async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound {
                path: path.to_string(),
            })
        }

        async fn remove(&self, _paths: &[String]) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("bucket offline")))
        }

        fn public_url(&self, path: &str) -> String {
            format!("https://broken.test/{}", path)
        }
    }

    fn add_image(db: &Database, owner: &str, name: &str) -> i64 {
        ImageRepository::new(db.clone())
            .create(&NewImage {
                owner_id: owner.to_string(),
                filename: name.to_string(),
                original_path: format!("{}/{}", owner, name),
                thumbnail_path: Some(format!("thumbnails/{}/{}", owner, name)),
                file_size: 10,
                mime_type: "image/png".to_string(),
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_pagination_math() {
        let pagination = Pagination::new(2, 20, 45);
        assert_eq!(pagination.total_pages, 3);
        assert_eq!(pagination.offset(), 20);

        let defaults = Pagination::new(0, 0, 0);
        assert_eq!(defaults.page, 1);
        assert_eq!(defaults.limit, 20);
        assert_eq!(defaults.total_pages, 0);
    }

    #[test]
    fn test_pagination_offset_saturates() {
        let pagination = Pagination::new(u32::MAX, u32::MAX, 0);
        assert_eq!(pagination.offset(), i64::MAX);
    }

    #[test]
    fn test_list_images_far_past_the_end_is_empty() {
        let db = Database::open_in_memory().unwrap();
        let gallery = GalleryService::new(db.clone(), Arc::new(BrokenStore), Duration::from_secs(1));
        add_image(&db, "alice", "a.png");

        let page = gallery
            .list_images("alice", Some(u32::MAX), Some(u32::MAX))
            .unwrap();
        assert!(page.images.is_empty());
        assert_eq!(page.pagination.total, 1);
        assert_eq!(page.pagination.total_pages, 1);
    }

    #[test]
    fn test_list_images_pages_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(BrokenStore);
        let gallery = GalleryService::new(db.clone(), store, Duration::from_secs(1));

        let ids: Vec<i64> = (0..5)
            .map(|i| add_image(&db, "alice", &format!("{}.png", i)))
            .collect();
        add_image(&db, "bob", "other.png");

        let page = gallery.list_images("alice", Some(2), Some(2)).unwrap();
        assert_eq!(page.pagination.total, 5);
        assert_eq!(page.pagination.total_pages, 3);

        let page_ids: Vec<i64> = page.images.iter().map(|v| v.image.id).collect();
        assert_eq!(page_ids, vec![ids[2], ids[1]]);
        assert_eq!(page.images[0].original_url, "https://broken.test/alice/2.png");

        let first = gallery.list_images("alice", None, None).unwrap();
        assert_eq!(first.pagination.page, 1);
        assert_eq!(first.pagination.limit, 20);
        assert_eq!(first.images.len(), 5);
    }

    #[test]
    fn test_status_read_and_update() {
        let db = Database::open_in_memory().unwrap();
        let gallery = GalleryService::new(db.clone(), Arc::new(BrokenStore), Duration::from_secs(1));
        let image_id = add_image(&db, "alice", "a.png");

        assert!(matches!(
            gallery.processing_status(image_id, "alice"),
            Err(GalleryError::NotFound { .. })
        ));

        gallery
            .update_processing_status(image_id, "alice", ProcessingStatus::Processing)
            .unwrap();
        assert_eq!(
            gallery.processing_status(image_id, "alice").unwrap(),
            ProcessingStatus::Processing
        );

        assert!(matches!(
            gallery.update_processing_status(image_id, "alice", ProcessingStatus::Pending),
            Err(GalleryError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_binaries_and_record() {
        let temp_dir = TempDir::new().unwrap();
        let local = LocalObjectStore::new(temp_dir.path().to_path_buf(), "https://cdn.test");
        local.put("alice/a.png", vec![1, 2, 3], "image/png").await.unwrap();
        local
            .put("thumbnails/alice/a.png", vec![4, 5], "image/jpeg")
            .await
            .unwrap();

        let db = Database::open_in_memory().unwrap();
        let image_id = add_image(&db, "alice", "a.png");
        AnnotationRepository::new(db.clone())
            .upsert(&AnnotationUpdate {
                image_id,
                owner_id: "alice".to_string(),
                description: Some("dots".to_string()),
                tags: vec![],
                colors: vec![],
                status: ProcessingStatus::Completed,
            })
            .unwrap();

        let gallery = GalleryService::new(db.clone(), Arc::new(local), Duration::from_secs(5));

        assert!(matches!(
            gallery.delete_image(image_id, "bob").await,
            Err(GalleryError::NotFound { .. })
        ));

        let deleted = gallery.delete_image(image_id, "alice").await.unwrap();
        assert!(deleted.binaries_removed);
        assert!(!temp_dir.path().join("alice/a.png").exists());
        assert!(!temp_dir.path().join("thumbnails/alice/a.png").exists());
        assert!(matches!(
            gallery.get_image(image_id, "alice"),
            Err(GalleryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_proceeds_when_storage_fails() {
        let db = Database::open_in_memory().unwrap();
        let gallery = GalleryService::new(db.clone(), Arc::new(BrokenStore), Duration::from_secs(1));
        let image_id = add_image(&db, "alice", "a.png");

        let deleted = gallery.delete_image(image_id, "alice").await.unwrap();
        assert!(!deleted.binaries_removed);
        assert_eq!(
            ImageRepository::new(db).count_by_owner("alice").unwrap(),
            0
        );
    }
}

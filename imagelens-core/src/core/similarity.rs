use crate::config::DEFAULT_SIMILAR_LIMIT;
use crate::database::models::{Annotation, ImageRecord, ImageView};
use crate::database::repositories::{AnnotationRepository, ImageRepository};
use crate::database::{Database, DatabaseError};
use crate::storage::ObjectStore;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimilarityError {
    #[error("No annotation found for image {image_id}")]
    NotFound { image_id: i64 },

    #[error("Metadata store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Finds other images of the same owner sharing a tag or a color with a given image.
pub struct SimilarityEngine {
    images: ImageRepository,
    annotations: AnnotationRepository,
    store: Arc<dyn ObjectStore>,
    limit: usize,
}

impl SimilarityEngine {
    pub fn new(db: Database, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            images: ImageRepository::new(db.clone()),
            annotations: AnnotationRepository::new(db),
            store,
            limit: DEFAULT_SIMILAR_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn find_similar(
        &self,
        image_id: i64,
        owner_id: &str,
    ) -> Result<Vec<ImageView>, SimilarityError> {
        let source = self
            .annotations
            .find_by_image(image_id, owner_id)
            .map_err(|e| {
                if e.is_not_found() {
                    SimilarityError::NotFound { image_id }
                } else {
                    SimilarityError::Store(e)
                }
            })?;

        if source.tags.is_empty() && source.colors.is_empty() {
            log::debug!("Image {} has no tags or colors, nothing to compare", image_id);
            return Ok(Vec::new());
        }

        let candidates = self.images.list_records(owner_id)?;
        let similar = select_similar(&source, candidates, self.limit);
        log::debug!("Found {} images similar to {}", similar.len(), image_id);

        Ok(ImageView::resolve_all(similar, self.store.as_ref()))
    }
}

/// Keep records, other than the source image, whose tags or colors intersect the
/// source's by exact match. Input order is preserved and at most `limit` are kept.
pub fn select_similar(
    source: &Annotation,
    candidates: Vec<ImageRecord>,
    limit: usize,
) -> Vec<ImageRecord> {
    let tags: HashSet<&str> = source.tags.iter().map(String::as_str).collect();
    let colors: HashSet<&str> = source.colors.iter().map(String::as_str).collect();

    candidates
        .into_iter()
        .filter(|record| record.image.id != source.image_id)
        .filter(|record| {
            record.tags().iter().any(|tag| tags.contains(tag.as_str()))
                || record.colors().iter().any(|c| colors.contains(c.as_str()))
        })
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{AnnotationUpdate, NewImage, ProcessingStatus};
    use crate::storage::LocalObjectStore;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        db: Database,
        engine: SimilarityEngine,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
            temp_dir.path().to_path_buf(),
            "https://cdn.test",
        ));
        let engine = SimilarityEngine::new(db.clone(), store);
        Fixture {
            _temp_dir: temp_dir,
            db,
            engine,
        }
    }

    fn add_image(db: &Database, owner: &str, tags: &[&str], colors: &[&str]) -> i64 {
        let image = ImageRepository::new(db.clone())
            .create(&NewImage {
                owner_id: owner.to_string(),
                filename: "photo.jpg".to_string(),
                original_path: format!("{}/photo.jpg", owner),
                thumbnail_path: Some(format!("thumbnails/{}/photo.jpg", owner)),
                file_size: 100,
                mime_type: "image/jpeg".to_string(),
            })
            .unwrap();

        AnnotationRepository::new(db.clone())
            .upsert(&AnnotationUpdate {
                image_id: image.id,
                owner_id: owner.to_string(),
                description: Some("photo".to_string()),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                colors: colors.iter().map(|c| c.to_string()).collect(),
                status: ProcessingStatus::Completed,
            })
            .unwrap();

        image.id
    }

    fn ids(views: &[ImageView]) -> Vec<i64> {
        views.iter().map(|v| v.image.id).collect()
    }

    #[test]
    fn test_matches_on_tags_or_colors() {
        let f = fixture();
        let source = add_image(&f.db, "alice", &["beach", "sunset"], &["#FF8800"]);
        let by_tag = add_image(&f.db, "alice", &["sunset"], &["#000000"]);
        let by_color = add_image(&f.db, "alice", &["city"], &["#FF8800"]);
        let _unrelated = add_image(&f.db, "alice", &["city"], &["#000001"]);
        let _other_owner = add_image(&f.db, "bob", &["sunset"], &["#FF8800"]);

        let similar = f.engine.find_similar(source, "alice").unwrap();
        assert_eq!(ids(&similar), vec![by_color, by_tag]);
    }

    #[test]
    fn test_never_includes_source_and_caps_results() {
        let f = fixture();
        let source = add_image(&f.db, "alice", &["tree"], &[]);
        for _ in 0..15 {
            add_image(&f.db, "alice", &["tree"], &[]);
        }

        let similar = f.engine.find_similar(source, "alice").unwrap();
        assert_eq!(similar.len(), 12);
        assert!(!ids(&similar).contains(&source));
    }

    #[test]
    fn test_empty_tags_and_colors_yield_nothing() {
        let f = fixture();
        let source = add_image(&f.db, "alice", &[], &[]);
        add_image(&f.db, "alice", &[], &[]);

        assert!(f.engine.find_similar(source, "alice").unwrap().is_empty());
    }

    #[test]
    fn test_missing_annotation_is_not_found() {
        let f = fixture();
        let source = add_image(&f.db, "alice", &["tree"], &[]);

        assert!(matches!(
            f.engine.find_similar(9999, "alice"),
            Err(SimilarityError::NotFound { image_id: 9999 })
        ));
        assert!(matches!(
            f.engine.find_similar(source, "bob"),
            Err(SimilarityError::NotFound { .. })
        ));
    }

    #[test]
    fn test_results_carry_public_urls() {
        let f = fixture();
        let source = add_image(&f.db, "alice", &["tree"], &[]);
        add_image(&f.db, "alice", &["tree"], &[]);

        let similar = f.engine.find_similar(source, "alice").unwrap();
        assert_eq!(similar[0].original_url, "https://cdn.test/alice/photo.jpg");
        assert_eq!(
            similar[0].thumbnail_url.as_deref(),
            Some("https://cdn.test/thumbnails/alice/photo.jpg")
        );
    }
}

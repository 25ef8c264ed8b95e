use crate::core::color::{ColorError, Rgb, SIMILARITY_THRESHOLD};
use crate::database::models::{ImageRecord, ImageView};
use crate::database::repositories::ImageRepository;
use crate::database::{Database, DatabaseError};
use crate::storage::ObjectStore;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    InvalidColor(#[from] ColorError),

    #[error("Metadata store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Keyword and color-proximity search over one owner's annotated images.
pub struct SearchFilter {
    images: ImageRepository,
    store: Arc<dyn ObjectStore>,
    threshold: f64,
}

impl SearchFilter {
    pub fn new(db: Database, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            images: ImageRepository::new(db),
            store,
            threshold: SIMILARITY_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn search_text(&self, owner_id: &str, query: &str) -> Result<Vec<ImageView>, SearchError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let matches: Vec<ImageRecord> = self
            .images
            .list_records(owner_id)?
            .into_iter()
            .filter(|record| matches_text(record, &needle))
            .collect();

        log::debug!("Text search '{}' matched {} images", needle, matches.len());
        Ok(ImageView::resolve_all(matches, self.store.as_ref()))
    }

    pub fn search_color(&self, owner_id: &str, color: &str) -> Result<Vec<ImageView>, SearchError> {
        let target = Rgb::from_hex(color)?;
        let raw_target = color.trim();

        let matches: Vec<ImageRecord> = self
            .images
            .list_records(owner_id)?
            .into_iter()
            .filter(|record| matches_color(record, raw_target, &target, self.threshold))
            .collect();

        log::debug!("Color search {} matched {} images", target, matches.len());
        Ok(ImageView::resolve_all(matches, self.store.as_ref()))
    }
}

/// `needle` must already be lowercase and non-empty.
pub fn matches_text(record: &ImageRecord, needle: &str) -> bool {
    let Some(annotation) = &record.annotation else {
        return false;
    };

    let in_description = annotation
        .description
        .as_deref()
        .is_some_and(|d| d.to_lowercase().contains(needle));

    in_description
        || annotation
            .tags
            .iter()
            .any(|tag| tag.to_lowercase().contains(needle))
}

pub fn matches_color(record: &ImageRecord, raw_target: &str, target: &Rgb, threshold: f64) -> bool {
    let Some(annotation) = &record.annotation else {
        return false;
    };

    annotation.colors.iter().any(|stored| {
        if stored.trim().eq_ignore_ascii_case(raw_target) {
            return true;
        }
        match Rgb::from_hex(stored) {
            Ok(rgb) => rgb.distance(target) <= threshold,
            Err(_) => false,
        }
    })
}

use crate::core::annotate::{AnnotationOutcome, Annotator};
use crate::database::models::{Annotation, AnnotationUpdate, ProcessingStatus};
use crate::database::repositories::AnnotationRepository;
use crate::database::{Database, DatabaseError};
use std::sync::Arc;

/// Annotates one image and persists the result.
///
/// The annotator's fallback chain is applied exactly once here, so a model or
/// network failure still ends in a `completed` annotation carrying fallback content.
#[derive(Clone)]
pub struct AnnotationService {
    annotator: Arc<Annotator>,
    db: Database,
}

impl AnnotationService {
    pub fn new(annotator: Arc<Annotator>, db: Database) -> Self {
        Self { annotator, db }
    }

    pub async fn annotate_image(
        &self,
        image_id: i64,
        owner_id: &str,
        image_url: &str,
    ) -> Result<(AnnotationOutcome, Annotation), DatabaseError> {
        let repository = AnnotationRepository::new(self.db.clone());
        self.mark_processing(&repository, image_id, owner_id);

        let outcome = self.annotator.annotate_with_fallback(image_url).await;
        log::info!(
            "Annotated image {} ({})",
            image_id,
            outcome.source().as_str()
        );

        let annotation = repository.upsert(&AnnotationUpdate::completed(
            image_id,
            owner_id,
            outcome.result(),
        ))?;

        Ok((outcome, annotation))
    }

    // Re-annotating a completed or failed image skips the processing marker.
    fn mark_processing(&self, repository: &AnnotationRepository, image_id: i64, owner_id: &str) {
        match repository.set_status(image_id, owner_id, ProcessingStatus::Processing) {
            Ok(_) => {}
            Err(DatabaseError::InvalidTransition { from, .. }) => {
                log::debug!("Image {} stays {} while re-annotating", image_id, from);
            }
            Err(e) => {
                log::warn!("Could not mark image {} as processing: {}", image_id, e);
            }
        }
    }
}

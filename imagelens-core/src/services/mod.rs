pub mod annotation;
pub mod gallery;
pub mod ingest;

pub use annotation::AnnotationService;
pub use gallery::GalleryService;
pub use ingest::IngestionService;

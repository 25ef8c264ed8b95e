pub mod annotation;
pub mod image;

pub use annotation::AnnotationRepository;
pub use image::ImageRepository;

use super::{Database, DatabaseError};
use rusqlite::Connection;

pub trait Repository {
    fn database(&self) -> &Database;

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        self.database().with_connection(f)
    }
}

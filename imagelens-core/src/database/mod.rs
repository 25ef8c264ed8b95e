pub mod models;
pub mod repositories;

use models::ProcessingStatus;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS images (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        original_path TEXT NOT NULL,
        thumbnail_path TEXT,
        file_size INTEGER NOT NULL,
        mime_type TEXT NOT NULL,
        uploaded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_images_owner_uploaded
        ON images(owner_id, uploaded_at DESC);

    CREATE TABLE IF NOT EXISTS annotations (
        image_id INTEGER PRIMARY KEY REFERENCES images(id) ON DELETE CASCADE,
        owner_id TEXT NOT NULL,
        description TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        colors TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_annotations_owner ON annotations(owner_id);
";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database query error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    #[error("Annotation for image {image_id} cannot be completed without a description")]
    IncompleteAnnotation { image_id: i64 },

    #[error("Thumbnail for image {id} is already set")]
    ThumbnailAlreadySet { id: i64 },

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Could not create database directory: {0}")]
    Io(#[from] std::io::Error),
}

impl DatabaseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DatabaseError::NotFound { .. })
    }
}

/// Shared handle to the SQLite metadata store. Cloning is cheap.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::initialize(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let mut conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&mut conn)
    }
}

use super::annotation::{AnnotationRow, ANNOTATION_COLUMNS};
use super::{DatabaseError, Repository};
use crate::database::models::{
    format_timestamp, parse_timestamp, Image, ImageRecord, NewImage,
};
use crate::database::Database;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};

const IMAGE_COLUMNS: &str = "i.id, i.owner_id, i.filename, i.original_path, i.thumbnail_path, \
     i.file_size, i.mime_type, i.uploaded_at";
const IMAGE_COLUMN_COUNT: usize = 8;

struct ImageRow {
    id: i64,
    owner_id: String,
    filename: String,
    original_path: String,
    thumbnail_path: Option<String>,
    file_size: i64,
    mime_type: String,
    uploaded_at: String,
}

impl ImageRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            filename: row.get(2)?,
            original_path: row.get(3)?,
            thumbnail_path: row.get(4)?,
            file_size: row.get(5)?,
            mime_type: row.get(6)?,
            uploaded_at: row.get(7)?,
        })
    }

    fn into_image(self) -> Result<Image, DatabaseError> {
        Ok(Image {
            id: self.id,
            owner_id: self.owner_id,
            filename: self.filename,
            original_path: self.original_path,
            thumbnail_path: self.thumbnail_path,
            file_size: self.file_size,
            mime_type: self.mime_type,
            uploaded_at: parse_timestamp(&self.uploaded_at)?,
        })
    }
}

struct RecordRow {
    image: ImageRow,
    annotation: Option<AnnotationRow>,
}

impl RecordRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            image: ImageRow::read(row)?,
            annotation: AnnotationRow::read_optional(row, IMAGE_COLUMN_COUNT)?,
        })
    }

    fn into_record(self) -> Result<ImageRecord, DatabaseError> {
        Ok(ImageRecord {
            image: self.image.into_image()?,
            annotation: self
                .annotation
                .map(AnnotationRow::into_annotation)
                .transpose()?,
        })
    }
}

fn query_records(
    conn: &Connection,
    filter: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<ImageRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {}, {} FROM images i LEFT JOIN annotations a ON a.image_id = i.id {}",
        IMAGE_COLUMNS, ANNOTATION_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, RecordRow::read)?;

    rows.map(|row| -> Result<ImageRecord, DatabaseError> { row?.into_record() })
        .collect()
}

pub struct ImageRepository {
    db: Database,
}

impl Repository for ImageRepository {
    fn database(&self) -> &Database {
        &self.db
    }
}

impl ImageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, new_image: &NewImage) -> Result<Image, DatabaseError> {
        let uploaded_at = format_timestamp(&Utc::now());

        let id = self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO images (owner_id, filename, original_path, thumbnail_path, \
                 file_size, mime_type, uploaded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new_image.owner_id,
                    new_image.filename,
                    new_image.original_path,
                    new_image.thumbnail_path,
                    new_image.file_size,
                    new_image.mime_type,
                    uploaded_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        self.find_by_id(id)
    }

    pub fn find_by_id(&self, id: i64) -> Result<Image, DatabaseError> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {} FROM images i WHERE i.id = ?1", IMAGE_COLUMNS);
            conn.query_row(&sql, params![id], ImageRow::read)
                .optional()?
                .ok_or(DatabaseError::NotFound { entity: "Image", id })?
                .into_image()
        })
    }

    /// Images stored at `original_path` that have no thumbnail pointer yet.
    pub fn find_without_thumbnail(&self, original_path: &str) -> Result<Vec<Image>, DatabaseError> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM images i WHERE i.original_path = ?1 AND i.thumbnail_path IS NULL",
                IMAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![original_path], ImageRow::read)?;
            rows.map(|row| -> Result<Image, DatabaseError> { row?.into_image() })
                .collect()
        })
    }

    /// Fetch an image only if it belongs to `owner_id`.
    pub fn find_owned(&self, id: i64, owner_id: &str) -> Result<Image, DatabaseError> {
        let image = self.find_by_id(id)?;
        if image.owner_id != owner_id {
            return Err(DatabaseError::NotFound { entity: "Image", id });
        }
        Ok(image)
    }

    pub fn find_record(&self, id: i64, owner_id: &str) -> Result<ImageRecord, DatabaseError> {
        self.with_connection(|conn| {
            query_records(
                conn,
                "WHERE i.id = ?1 AND i.owner_id = ?2",
                &[&id, &owner_id],
            )
        })?
        .into_iter()
        .next()
        .ok_or(DatabaseError::NotFound { entity: "Image", id })
    }

    /// Every image of the owner with its annotation, most recent first.
    pub fn list_records(&self, owner_id: &str) -> Result<Vec<ImageRecord>, DatabaseError> {
        self.list_records_page(owner_id, -1, 0)
    }

    /// A negative `limit` means no limit.
    pub fn list_records_page(
        &self,
        owner_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ImageRecord>, DatabaseError> {
        self.with_connection(|conn| {
            query_records(
                conn,
                "WHERE i.owner_id = ?1 ORDER BY i.uploaded_at DESC, i.id DESC LIMIT ?2 OFFSET ?3",
                &[&owner_id, &limit, &offset],
            )
        })
    }

    pub fn count_by_owner(&self, owner_id: &str) -> Result<i64, DatabaseError> {
        self.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM images WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )?)
        })
    }

    /// Set the derived thumbnail pointer. It can only be written once.
    pub fn set_thumbnail_path(&self, id: i64, thumbnail_path: &str) -> Result<Image, DatabaseError> {
        let updated = self.with_connection(|conn| {
            Ok(conn.execute(
                "UPDATE images SET thumbnail_path = ?1 WHERE id = ?2 AND thumbnail_path IS NULL",
                params![thumbnail_path, id],
            )?)
        })?;

        if updated == 0 {
            // Distinguish a missing row from one that already has a thumbnail.
            self.find_by_id(id)?;
            return Err(DatabaseError::ThumbnailAlreadySet { id });
        }

        self.find_by_id(id)
    }

    /// Delete an owned image. Its annotation goes with it.
    pub fn delete(&self, id: i64, owner_id: &str) -> Result<(), DatabaseError> {
        let deleted = self.with_connection(|conn| {
            Ok(conn.execute(
                "DELETE FROM images WHERE id = ?1 AND owner_id = ?2",
                params![id, owner_id],
            )?)
        })?;

        if deleted == 0 {
            return Err(DatabaseError::NotFound { entity: "Image", id });
        }
        Ok(())
    }
}

use super::{DatabaseError, Repository};
use crate::database::models::{
    format_timestamp, parse_timestamp, Annotation, AnnotationUpdate, ProcessingStatus,
};
use crate::database::Database;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, Transaction};

pub(super) const ANNOTATION_COLUMNS: &str = "a.image_id, a.owner_id, a.description, a.tags, \
     a.colors, a.status, a.created_at, a.updated_at";

pub(super) struct AnnotationRow {
    image_id: i64,
    owner_id: String,
    description: Option<String>,
    tags: String,
    colors: String,
    status: ProcessingStatus,
    created_at: String,
    updated_at: String,
}

impl AnnotationRow {
    fn read(row: &Row<'_>, start: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            image_id: row.get(start)?,
            owner_id: row.get(start + 1)?,
            description: row.get(start + 2)?,
            tags: row.get(start + 3)?,
            colors: row.get(start + 4)?,
            status: row.get(start + 5)?,
            created_at: row.get(start + 6)?,
            updated_at: row.get(start + 7)?,
        })
    }

    /// Read from a LEFT JOIN, where a missing annotation is a row of NULLs.
    pub(super) fn read_optional(row: &Row<'_>, start: usize) -> rusqlite::Result<Option<Self>> {
        let image_id: Option<i64> = row.get(start)?;
        match image_id {
            Some(_) => Self::read(row, start).map(Some),
            None => Ok(None),
        }
    }

    pub(super) fn into_annotation(self) -> Result<Annotation, DatabaseError> {
        Ok(Annotation {
            image_id: self.image_id,
            owner_id: self.owner_id,
            description: self.description,
            tags: serde_json::from_str(&self.tags)?,
            colors: serde_json::from_str(&self.colors)?,
            status: self.status,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct CurrentState {
    status: ProcessingStatus,
    has_description: bool,
}

/// Checks ownership of the image and returns the existing annotation state, if any.
fn current_state(
    tx: &Transaction<'_>,
    image_id: i64,
    owner_id: &str,
) -> Result<Option<CurrentState>, DatabaseError> {
    let image_owner: Option<String> = tx
        .query_row(
            "SELECT owner_id FROM images WHERE id = ?1",
            params![image_id],
            |row| row.get(0),
        )
        .optional()?;
    if image_owner.as_deref() != Some(owner_id) {
        return Err(DatabaseError::NotFound {
            entity: "Image",
            id: image_id,
        });
    }

    let state = tx
        .query_row(
            "SELECT status, description FROM annotations WHERE image_id = ?1",
            params![image_id],
            |row| {
                let description: Option<String> = row.get(1)?;
                Ok(CurrentState {
                    status: row.get(0)?,
                    has_description: description.is_some_and(|d| !d.trim().is_empty()),
                })
            },
        )
        .optional()?;

    Ok(state)
}

fn check_transition(
    current: Option<&CurrentState>,
    next: ProcessingStatus,
) -> Result<(), DatabaseError> {
    match current {
        Some(state) if !state.status.can_transition_to(next) => {
            Err(DatabaseError::InvalidTransition {
                from: state.status,
                to: next,
            })
        }
        _ => Ok(()),
    }
}

pub struct AnnotationRepository {
    db: Database,
}

impl Repository for AnnotationRepository {
    fn database(&self) -> &Database {
        &self.db
    }
}

impl AnnotationRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn find_by_image(&self, image_id: i64, owner_id: &str) -> Result<Annotation, DatabaseError> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM annotations a WHERE a.image_id = ?1 AND a.owner_id = ?2",
                ANNOTATION_COLUMNS
            );
            conn.query_row(&sql, params![image_id, owner_id], |row| {
                AnnotationRow::read(row, 0)
            })
            .optional()?
            .ok_or(DatabaseError::NotFound {
                entity: "Annotation",
                id: image_id,
            })?
            .into_annotation()
        })
    }

    /// Create or replace the annotation of an image; the last writer wins.
    pub fn upsert(&self, update: &AnnotationUpdate) -> Result<Annotation, DatabaseError> {
        let tags = serde_json::to_string(&update.tags)?;
        let colors = serde_json::to_string(&update.colors)?;
        let now = format_timestamp(&Utc::now());

        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let current = current_state(&tx, update.image_id, &update.owner_id)?;
            check_transition(current.as_ref(), update.status)?;

            let described = update
                .description
                .as_deref()
                .is_some_and(|d| !d.trim().is_empty());
            if update.status == ProcessingStatus::Completed && !described {
                return Err(DatabaseError::IncompleteAnnotation {
                    image_id: update.image_id,
                });
            }

            tx.execute(
                "INSERT INTO annotations (image_id, owner_id, description, tags, colors, status, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) \
                 ON CONFLICT(image_id) DO UPDATE SET owner_id = excluded.owner_id, \
                 description = excluded.description, tags = excluded.tags, \
                 colors = excluded.colors, status = excluded.status, \
                 updated_at = excluded.updated_at",
                params![
                    update.image_id,
                    update.owner_id,
                    update.description,
                    tags,
                    colors,
                    update.status,
                    now,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        self.find_by_image(update.image_id, &update.owner_id)
    }

    /// Move the annotation to `status`, creating an empty one if the image has none yet.
    pub fn set_status(
        &self,
        image_id: i64,
        owner_id: &str,
        status: ProcessingStatus,
    ) -> Result<Annotation, DatabaseError> {
        let now = format_timestamp(&Utc::now());

        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let current = current_state(&tx, image_id, owner_id)?;
            check_transition(current.as_ref(), status)?;

            let described = current.as_ref().is_some_and(|state| state.has_description);
            if status == ProcessingStatus::Completed && !described {
                return Err(DatabaseError::IncompleteAnnotation { image_id });
            }

            if current.is_some() {
                tx.execute(
                    "UPDATE annotations SET status = ?1, updated_at = ?2 WHERE image_id = ?3",
                    params![status, now, image_id],
                )?;
            } else {
                tx.execute(
                    "INSERT INTO annotations (image_id, owner_id, status, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![image_id, owner_id, status, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;

        self.find_by_image(image_id, owner_id)
    }
}

use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tracing::info;
use uuid::Uuid;

use super::{now, parsed, to_millis};
use crate::error::{Result, WorkflowError};
use crate::model::Category;

fn row_to_category(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: parsed(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
    })
}

/// Uniqueness key for category names. Folds case beyond ASCII, so `Água`
/// and `água` collide.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn name_taken(err: rusqlite::Error, name: &str) -> WorkflowError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => {
            WorkflowError::validation(format!("category {name:?} already exists"))
        }
        _ => err.into(),
    }
}

pub fn insert(conn: &Connection, category: &Category) -> Result<()> {
    conn.execute(
        "INSERT INTO categories (id, name, name_key, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            category.id.to_string(),
            category.name,
            name_key(&category.name),
            category.description,
            to_millis(now()),
        ],
    )
    .map_err(|e| name_taken(e, &category.name))?;
    Ok(())
}

pub fn update(conn: &Connection, category: &Category) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE categories SET name = ?1, name_key = ?2, description = ?3 WHERE id = ?4",
            params![
                category.name,
                name_key(&category.name),
                category.description,
                category.id.to_string()
            ],
        )
        .map_err(|e| name_taken(e, &category.name))?;
    if changed == 0 {
        return Err(WorkflowError::not_found("category", category.id));
    }
    Ok(())
}

pub fn delete(conn: &Connection, id: Uuid) -> Result<()> {
    let changed = conn.execute(
        "DELETE FROM categories WHERE id = ?1",
        params![id.to_string()],
    )?;
    if changed == 0 {
        return Err(WorkflowError::not_found("category", id));
    }
    Ok(())
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Option<Category>> {
    let category = conn
        .query_row(
            "SELECT id, name, description FROM categories WHERE id = ?1",
            params![id.to_string()],
            row_to_category,
        )
        .optional()?;
    Ok(category)
}

pub fn require(conn: &Connection, id: Uuid) -> Result<Category> {
    get(conn, id)?.ok_or_else(|| WorkflowError::not_found("category", id))
}

/// Exact name match, ignoring case.
pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Category>> {
    let category = conn
        .query_row(
            "SELECT id, name, description FROM categories WHERE name_key = ?1",
            params![name_key(name)],
            row_to_category,
        )
        .optional()?;
    Ok(category)
}

pub fn get_or_create(conn: &Connection, name: &str) -> Result<Category> {
    if let Some(existing) = find_by_name(conn, name)? {
        return Ok(existing);
    }
    let category = Category {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: None,
    };
    insert(conn, &category)?;
    info!(name = %category.name, "Category created");
    Ok(category)
}

pub fn list(conn: &Connection) -> Result<Vec<Category>> {
    let mut stmt =
        conn.prepare("SELECT id, name, description FROM categories ORDER BY name_key")?;
    let rows = stmt.query_map([], row_to_category)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

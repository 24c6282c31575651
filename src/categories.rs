//! Flat registry of labels used to classify reports.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::model::{Category, Confirmation};
use crate::store::{Store, categories, reports};

pub struct CategoryRegistry {
    store: Arc<Store>,
}

fn clean_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(WorkflowError::validation("category name is required"));
    }
    Ok(name.to_string())
}

fn clean_description(description: Option<&str>) -> Option<String> {
    description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

impl CategoryRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create(&self, name: &str, description: Option<&str>) -> Result<Category> {
        let category = Category {
            id: Uuid::new_v4(),
            name: clean_name(name)?,
            description: clean_description(description),
        };
        self.store.write(|tx| categories::insert(tx, &category))?;
        info!(id = %category.id, name = %category.name, "Category created");
        Ok(category)
    }

    pub fn update(&self, id: Uuid, name: &str, description: Option<&str>) -> Result<Category> {
        let category = Category {
            id,
            name: clean_name(name)?,
            description: clean_description(description),
        };
        self.store.write(|tx| categories::update(tx, &category))?;
        info!(id = %id, name = %category.name, "Category updated");
        Ok(category)
    }

    /// Refused while any report still references the category.
    pub fn delete(&self, id: Uuid, confirmation: Confirmation) -> Result<()> {
        confirmation.require("deleting a category")?;
        self.store.write(|tx| {
            let category = categories::require(tx, id)?;
            let in_use = reports::count_for_category(tx, id)?;
            if in_use > 0 {
                return Err(WorkflowError::validation(format!(
                    "category {:?} is used by {in_use} report(s)",
                    category.name
                )));
            }
            categories::delete(tx, id)
        })?;
        info!(id = %id, "Category deleted");
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Category> {
        self.store.read(|conn| categories::require(conn, id))
    }

    pub fn list(&self) -> Result<Vec<Category>> {
        self.store.read(categories::list)
    }
}

//! Threat catalog persistence.

use biothreat_shared::{ForecastError, Result, ThreatCategory};
use chrono::Utc;
use libsql::params;

use crate::{Storage, col_opt_str, col_str, storage_err, ts};

const CATEGORY_COLUMNS: &str =
    "id, name, grp, description, criteria_json, timeline_estimate, content_hash";

/// What an upsert by name did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryUpsert {
    Inserted,
    /// Content changed; pairs against this category will be re-scored.
    Updated,
    Unchanged,
}

impl Storage {
    /// Insert a category unless one with the same name exists.
    pub async fn insert_threat_category_if_absent(&self, category: &ThreatCategory) -> Result<bool> {
        self.check_writable()?;
        let now = ts(&Utc::now());
        let affected = self
            .conn
            .execute(
                "INSERT INTO threat_categories (id, name, grp, description, criteria_json, timeline_estimate, content_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(name) DO NOTHING",
                params![
                    category.id.as_str(),
                    category.name.as_str(),
                    category.group.as_str(),
                    category.description.as_str(),
                    criteria_json(category)?,
                    category.timeline_estimate.as_deref(),
                    category.content_hash.as_str(),
                    now,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    /// Insert or update a category by name. The stored id is kept on update.
    pub async fn upsert_threat_category(&self, category: &ThreatCategory) -> Result<CategoryUpsert> {
        self.check_writable()?;
        let existing = self.get_threat_category_by_name(&category.name).await?;

        match existing {
            None => {
                self.insert_threat_category_if_absent(category).await?;
                Ok(CategoryUpsert::Inserted)
            }
            Some(current) if current.content_hash == category.content_hash => {
                Ok(CategoryUpsert::Unchanged)
            }
            Some(current) => {
                self.conn
                    .execute(
                        "UPDATE threat_categories SET
                           grp = ?1, description = ?2, criteria_json = ?3,
                           timeline_estimate = ?4, content_hash = ?5, updated_at = ?6
                         WHERE id = ?7",
                        params![
                            category.group.as_str(),
                            category.description.as_str(),
                            criteria_json(category)?,
                            category.timeline_estimate.as_deref(),
                            category.content_hash.as_str(),
                            ts(&Utc::now()),
                            current.id.as_str(),
                        ],
                    )
                    .await
                    .map_err(storage_err)?;
                tracing::info!(category = %category.name, "threat category updated");
                Ok(CategoryUpsert::Updated)
            }
        }
    }

    pub async fn get_threat_category_by_name(&self, name: &str) -> Result<Option<ThreatCategory>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CATEGORY_COLUMNS} FROM threat_categories WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_category(&row)?)),
            None => Ok(None),
        }
    }

    /// The full catalog ordered by group then name.
    pub async fn list_threat_categories(&self) -> Result<Vec<ThreatCategory>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CATEGORY_COLUMNS} FROM threat_categories ORDER BY grp, name"),
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_category(&row)?);
        }
        Ok(results)
    }
}

fn criteria_json(category: &ThreatCategory) -> Result<String> {
    serde_json::to_string(&category.criteria)
        .map_err(|e| ForecastError::Storage(format!("encode criteria: {e}")))
}

fn row_to_category(row: &libsql::Row) -> Result<ThreatCategory> {
    let criteria: Vec<String> = serde_json::from_str(&col_str(row, 4)?)
        .map_err(|e| ForecastError::Storage(format!("invalid criteria_json: {e}")))?;
    Ok(ThreatCategory {
        id: col_str(row, 0)?,
        name: col_str(row, 1)?,
        group: col_str(row, 2)?,
        description: col_str(row, 3)?,
        criteria,
        timeline_estimate: col_opt_str(row, 5),
        content_hash: col_str(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;

    fn category(name: &str, description: &str) -> ThreatCategory {
        ThreatCategory::new(
            name,
            "Pathogen Optimization",
            description,
            vec!["Fitness evaluation models".into()],
            Some("12-30 months".into()),
        )
    }

    #[tokio::test]
    async fn upsert_by_name() {
        let storage = test_storage().await;
        let original = category("Fitness Enhancement", "v1");
        assert_eq!(
            storage.upsert_threat_category(&original).await.unwrap(),
            CategoryUpsert::Inserted
        );
        assert_eq!(
            storage.upsert_threat_category(&category("Fitness Enhancement", "v1")).await.unwrap(),
            CategoryUpsert::Unchanged
        );
        assert_eq!(
            storage.upsert_threat_category(&category("Fitness Enhancement", "v2")).await.unwrap(),
            CategoryUpsert::Updated
        );

        let stored = storage
            .get_threat_category_by_name("Fitness Enhancement")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, original.id);
        assert_eq!(stored.description, "v2");
        assert_eq!(stored.criteria, vec!["Fitness evaluation models".to_string()]);
        assert_eq!(stored.timeline_estimate.as_deref(), Some("12-30 months"));
    }

    #[tokio::test]
    async fn insert_if_absent_skips_existing() {
        let storage = test_storage().await;
        assert!(storage.insert_threat_category_if_absent(&category("A", "x")).await.unwrap());
        assert!(!storage.insert_threat_category_if_absent(&category("A", "y")).await.unwrap());
        let all = storage.list_threat_categories().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].description, "x");
    }
}

//! The threat catalog as seen by one cycle.

use std::collections::HashMap;

use biothreat_shared::{ForecastError, Result, ThreatCategory};
use biothreat_storage::Storage;
use tracing::debug;

/// Snapshot of the curated threat categories, loaded once per cycle.
#[derive(Debug, Clone)]
pub struct ThreatCatalog {
    categories: Vec<ThreatCategory>,
    by_id: HashMap<String, usize>,
}

impl ThreatCatalog {
    /// Load every category. An empty catalog is a configuration error.
    pub async fn load(storage: &Storage) -> Result<Self> {
        let categories = storage.list_threat_categories().await?;
        let catalog = Self::from_categories(categories)?;
        debug!(categories = catalog.len(), "threat catalog loaded");
        Ok(catalog)
    }

    pub fn from_categories(categories: Vec<ThreatCategory>) -> Result<Self> {
        if categories.is_empty() {
            return Err(ForecastError::config(
                "threat catalog is empty; run `biothreat seed threats` or `biothreat threats import`",
            ));
        }
        let by_id = categories
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.clone(), i))
            .collect();
        Ok(Self { categories, by_id })
    }

    pub fn get(&self, id: &str) -> Option<&ThreatCategory> {
        self.by_id.get(id).map(|&i| &self.categories[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreatCategory> {
        self.categories.iter()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_storage;

    #[tokio::test]
    async fn empty_catalog_is_config_error() {
        let storage = test_storage().await;
        let err = ThreatCatalog::load(&storage).await.unwrap_err();
        assert!(matches!(err, ForecastError::Config { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn loads_and_indexes_categories() {
        let storage = test_storage().await;
        let category = ThreatCategory::new("Toxin design", "synthesis", "d", vec![], None);
        storage.insert_threat_category_if_absent(&category).await.unwrap();

        let catalog = ThreatCatalog::load(&storage).await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(&category.id).unwrap().name, "Toxin design");
        assert!(catalog.get("missing").is_none());
    }
}

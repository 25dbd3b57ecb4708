//! Source registry persistence.

use biothreat_shared::{Result, Source, SourceKind};
use libsql::params;

use crate::{Storage, col_i64, col_opt_ts, col_str, col_ts, storage_err, ts};

const SOURCE_COLUMNS: &str =
    "id, name, kind, endpoint, category, active, last_fetched_at, created_at";

impl Storage {
    /// Register a source. Returns `false` if a source with the same name exists.
    pub async fn insert_source(&self, source: &Source) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "INSERT INTO sources (id, name, kind, endpoint, category, active, last_fetched_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(name) DO NOTHING",
                params![
                    source.id.as_str(),
                    source.name.as_str(),
                    source.kind.as_str(),
                    source.endpoint.as_str(),
                    source.category.as_str(),
                    source.active as i64,
                    source.last_fetched_at.as_ref().map(ts),
                    ts(&source.created_at),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    /// Get a source by its unique name.
    pub async fn get_source_by_name(&self, name: &str) -> Result<Option<Source>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_source(&row)?)),
            None => Ok(None),
        }
    }

    /// List all sources ordered by name.
    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        self.query_sources(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY name"))
            .await
    }

    /// List sources eligible for fetching.
    pub async fn list_active_sources(&self) -> Result<Vec<Source>> {
        self.query_sources(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE active = 1 ORDER BY name"
        ))
        .await
    }

    async fn query_sources(&self, sql: &str) -> Result<Vec<Source>> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_source(&row)?);
        }
        Ok(results)
    }

    /// Toggle a source's active flag. Returns `false` if no source has that name.
    pub async fn set_source_active(&self, name: &str, active: bool) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "UPDATE sources SET active = ?1 WHERE name = ?2",
                params![active as i64, name],
            )
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }
}

fn row_to_source(row: &libsql::Row) -> Result<Source> {
    Ok(Source {
        id: col_str(row, 0)?,
        name: col_str(row, 1)?,
        kind: col_str(row, 2)?.parse::<SourceKind>()?,
        endpoint: col_str(row, 3)?,
        category: col_str(row, 4)?,
        active: col_i64(row, 5)? != 0,
        last_fetched_at: col_opt_ts(row, 6)?,
        created_at: col_ts(row, 7)?,
    })
}

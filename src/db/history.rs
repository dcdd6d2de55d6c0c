//! Download history CRUD operations.

use crate::error::DatabaseError;
use crate::types::{DownloadState, GroupId};
use crate::{Error, Result};

use super::{Database, HistoryRecord, HistoryRow, HistoryStore, NewHistoryRecord};

impl Database {
    /// Insert a history record and return its id
    pub async fn insert_history(&self, record: &NewHistoryRecord) -> Result<GroupId> {
        let now = chrono::Utc::now().timestamp();
        let sources = serde_json::to_string(&record.sources)?;

        let result = sqlx::query(
            r#"
            INSERT INTO download_history (
                kind, destination, state, priority, sources, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.kind.to_i32())
        .bind(&record.destination)
        .bind(record.state.to_i32())
        .bind(record.priority as i32)
        .bind(&sources)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert history record: {}",
                e
            )))
        })?;

        Ok(GroupId(result.last_insert_rowid()))
    }

    /// Get a history record by id
    pub async fn get_history(&self, id: GroupId) -> Result<Option<HistoryRow>> {
        let row = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, kind, destination, state, priority, sources, created_at, updated_at
            FROM download_history
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get history record: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// List all history records, oldest first
    pub async fn list_history(&self) -> Result<Vec<HistoryRow>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, kind, destination, state, priority, sources, created_at, updated_at
            FROM download_history
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list history: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// List history records in a given state
    pub async fn list_history_by_state(&self, state: DownloadState) -> Result<Vec<HistoryRow>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, kind, destination, state, priority, sources, created_at, updated_at
            FROM download_history
            WHERE state = ?
            ORDER BY id ASC
            "#,
        )
        .bind(state.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list history by state: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Overwrite state, destination and sources of an existing record
    ///
    /// Returns the number of rows touched (0 when the record doesn't exist).
    pub async fn update_history(&self, record: &HistoryRecord) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let sources = serde_json::to_string(&record.sources)?;

        let result = sqlx::query(
            r#"
            UPDATE download_history
            SET state = ?, destination = ?, sources = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(record.state.to_i32())
        .bind(&record.destination)
        .bind(&sources)
        .bind(now)
        .bind(record.id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update history record: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }

    /// Delete a history record
    pub async fn delete_history(&self, id: GroupId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM download_history WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete history record: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Count history records
    pub async fn count_history(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM download_history")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count history: {}",
                    e
                )))
            })?;

        Ok(count)
    }
}

#[async_trait::async_trait]
impl HistoryStore for Database {
    async fn create(&self, record: &NewHistoryRecord) -> Result<HistoryRecord> {
        let id = self.insert_history(record).await?;
        let row = self.get_history(id).await?.ok_or_else(|| {
            Error::Database(DatabaseError::NotFound(format!(
                "history record {} vanished after insert",
                id
            )))
        })?;
        HistoryRecord::try_from(row)
    }

    async fn update(&self, record: &HistoryRecord) -> Result<()> {
        if self.update_history(record).await? == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "history record {}",
                record.id
            ))));
        }
        Ok(())
    }

    async fn delete(&self, id: GroupId) -> Result<bool> {
        self.delete_history(id).await
    }

    async fn get(&self, id: GroupId) -> Result<Option<HistoryRecord>> {
        self.get_history(id)
            .await?
            .map(HistoryRecord::try_from)
            .transpose()
    }

    async fn list(&self) -> Result<Vec<HistoryRecord>> {
        self.list_history()
            .await?
            .into_iter()
            .map(HistoryRecord::try_from)
            .collect()
    }
}

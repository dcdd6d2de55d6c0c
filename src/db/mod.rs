//! Database layer for illust-dl
//!
//! Handles SQLite persistence of group history records.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`history`] - History record CRUD and the [`HistoryStore`] implementation
//! - [`state`] - Runtime state (shutdown tracking)

use crate::error::{Error, Result};
use crate::types::{DownloadState, GroupId, Priority, WorkKind};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod history;
mod migrations;
mod state;

/// Durable operations the engine needs from a history store
///
/// Records are keyed by group id. The engine creates a record before a group
/// first runs and updates it only when the group settles.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist a new record and return it with its assigned id
    async fn create(&self, record: &NewHistoryRecord) -> Result<HistoryRecord>;

    /// Overwrite the mutable fields (state, destination, sources) of a record
    async fn update(&self, record: &HistoryRecord) -> Result<()>;

    /// Remove a record; returns whether it existed
    async fn delete(&self, id: GroupId) -> Result<bool>;

    /// Fetch one record
    async fn get(&self, id: GroupId) -> Result<Option<HistoryRecord>>;

    /// All records, oldest first
    async fn list(&self) -> Result<Vec<HistoryRecord>>;
}

/// New history record to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewHistoryRecord {
    /// Kind of work the group downloads
    pub kind: WorkKind,
    /// Destination template shared by members
    pub destination: String,
    /// Initial state (normally Queued)
    pub state: DownloadState,
    /// Scheduling priority of the members
    pub priority: Priority,
    /// Source locators in member order
    pub sources: Vec<String>,
}

/// Durable summary of a group
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    /// Group id
    pub id: GroupId,
    /// Kind of work the group downloads
    pub kind: WorkKind,
    /// Destination template shared by members
    pub destination: String,
    /// Last settled state
    pub state: DownloadState,
    /// Scheduling priority of the members
    pub priority: Priority,
    /// Source locators in member order
    pub sources: Vec<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
}

/// History record from database (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct HistoryRow {
    /// Unique database ID
    pub id: i64,
    /// Work kind code
    pub kind: i32,
    /// Destination template
    pub destination: String,
    /// State code
    pub state: i32,
    /// Priority code (-1 low, 0 normal, 1 high)
    pub priority: i32,
    /// JSON array of source locators
    pub sources: String,
    /// Unix timestamp when the record was created
    pub created_at: i64,
    /// Unix timestamp when the record was last written
    pub updated_at: i64,
}

impl TryFrom<HistoryRow> for HistoryRecord {
    type Error = Error;

    fn try_from(row: HistoryRow) -> Result<Self> {
        let sources: Vec<String> = serde_json::from_str(&row.sources)?;
        Ok(HistoryRecord {
            id: GroupId(row.id),
            kind: WorkKind::from_i32(row.kind),
            destination: row.destination,
            state: DownloadState::from_i32(row.state),
            priority: Priority::from_i32(row.priority),
            sources,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
        })
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

/// Database handle for illust-dl
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

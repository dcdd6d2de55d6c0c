//! Core types for illust-dl

use serde::{Deserialize, Serialize};

/// Unique identifier for a download group (the id of its history record)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub i64);

impl GroupId {
    /// Create a new GroupId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for GroupId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<GroupId> for i64 {
    fn from(id: GroupId) -> Self {
        id.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GroupId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for GroupId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for GroupId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for GroupId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Download state, shared by tasks and groups
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// Registered, not yet started
    Queued,
    /// Actively transferring
    Running,
    /// Suspended by user, resumable
    Paused,
    /// Transfer done, finalization still in progress
    Pending,
    /// Transfer and finalization succeeded
    Completed,
    /// Transfer or finalization failed
    Error,
    /// Cancelled by the caller or by a group cascade
    Cancelled,
}

impl DownloadState {
    /// Convert integer state code to DownloadState
    pub fn from_i32(state: i32) -> Self {
        match state {
            0 => DownloadState::Queued,
            1 => DownloadState::Running,
            2 => DownloadState::Paused,
            3 => DownloadState::Pending,
            4 => DownloadState::Completed,
            5 => DownloadState::Error,
            6 => DownloadState::Cancelled,
            _ => DownloadState::Error, // Default to Error for unknown state
        }
    }

    /// Convert DownloadState to integer state code
    pub fn to_i32(&self) -> i32 {
        match self {
            DownloadState::Queued => 0,
            DownloadState::Running => 1,
            DownloadState::Paused => 2,
            DownloadState::Pending => 3,
            DownloadState::Completed => 4,
            DownloadState::Error => 5,
            DownloadState::Cancelled => 6,
        }
    }

    /// Completed, Error or Cancelled: the only states that are ever persisted
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Error | DownloadState::Cancelled
        )
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Kind of work a group downloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// One resource, one file
    #[default]
    Single,
    /// All pages of one multi-page work
    MultiPage,
    /// Unrelated resources downloaded together
    Batch,
}

impl WorkKind {
    /// Convert WorkKind to integer for database storage
    pub fn to_i32(&self) -> i32 {
        match self {
            WorkKind::Single => 0,
            WorkKind::MultiPage => 1,
            WorkKind::Batch => 2,
        }
    }

    /// Convert integer from database to WorkKind
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => WorkKind::MultiPage,
            2 => WorkKind::Batch,
            _ => WorkKind::Single,
        }
    }
}

/// Scheduling priority of a group's members
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (-1)
    Low = -1,
    /// Normal priority (0)
    #[default]
    Normal = 0,
    /// High priority (1)
    High = 1,
}

impl Priority {
    /// Convert a stored priority code; unknown codes read as Normal
    pub fn from_i32(value: i32) -> Self {
        match value {
            -1 => Priority::Low,
            1 => Priority::High,
            _ => Priority::Normal,
        }
    }
}

/// Field of a task that changed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskField {
    /// `DownloadTask::state`
    State,
    /// `DownloadTask::progress`
    Progress,
    /// `DownloadTask::error_cause`
    Error,
}

/// Derived property of a group that changed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupField {
    /// `DownloadTaskGroup::current_state`
    CurrentState,
    /// `DownloadTaskGroup::progress_percentage`
    ProgressPercentage,
    /// `DownloadTaskGroup::error_cause`
    ErrorCause,
}

impl From<TaskField> for GroupField {
    fn from(field: TaskField) -> Self {
        match field {
            TaskField::State => GroupField::CurrentState,
            TaskField::Progress => GroupField::ProgressPercentage,
            TaskField::Error => GroupField::ErrorCause,
        }
    }
}

/// Notification published by a single task to its observers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskEvent {
    /// The task entered Running
    Started,
    /// The task left Running without finishing (paused or cancelled)
    Stopped,
    /// The task entered Error
    Errored,
    /// The task reached Completed
    AfterDownload,
    /// A field of the task changed
    Changed(TaskField),
}

/// Event emitted on a group's (or the manager's) event bus
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Group persisted and admitted
    Queued {
        /// Group ID
        group_id: GroupId,
        /// Number of members
        tasks: usize,
    },

    /// Member started transferring
    ItemStarted {
        /// Group ID
        group_id: GroupId,
        /// Member index
        index: usize,
    },

    /// Member stopped without finishing (paused or cancelled)
    ItemStopped {
        /// Group ID
        group_id: GroupId,
        /// Member index
        index: usize,
    },

    /// Member failed
    ItemFailed {
        /// Group ID
        group_id: GroupId,
        /// Member index
        index: usize,
        /// Error message
        error: String,
    },

    /// Member finished downloading
    ItemDownloaded {
        /// Group ID
        group_id: GroupId,
        /// Member index
        index: usize,
    },

    /// A member field changed
    ItemChanged {
        /// Group ID
        group_id: GroupId,
        /// Member index
        index: usize,
        /// The field that changed
        field: TaskField,
    },

    /// A derived group property changed
    GroupChanged {
        /// Group ID
        group_id: GroupId,
        /// The property that changed
        field: GroupField,
    },

    /// All members completed; the post-completion hook is running
    PostProcessing {
        /// Group ID
        group_id: GroupId,
    },

    /// The post-completion hook was cancelled
    HookAborted {
        /// Group ID
        group_id: GroupId,
    },

    /// The group settled and its history record was written
    Settled {
        /// Group ID
        group_id: GroupId,
        /// The persisted state
        state: DownloadState,
    },

    /// Group removed from the manager
    Removed {
        /// Group ID
        group_id: GroupId,
    },

    /// Manager shutting down
    Shutdown,
}

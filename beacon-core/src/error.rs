//! Engine error types

use thiserror::Error;

/// Errors surfaced by the schedulers and the engine runtime.
///
/// Collaborator failures arrive as `anyhow::Error` and are wrapped here so
/// callers can tell a transient environment failure from bad input.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Task/note store could not be read or written
    #[error("task store unavailable: {0:#}")]
    Store(anyhow::Error),

    /// Persisted state (ledger, presence, marker) could not be read or written
    #[error("state store unavailable: {0:#}")]
    State(anyhow::Error),

    /// Notification sink refused the delivery
    #[error("notification delivery failed: {0:#}")]
    Notify(anyhow::Error),

    /// No usable location fix
    #[error("location unavailable: {0}")]
    Location(String),

    /// Archive store rejected the batch
    #[error("archive write failed: {0:#}")]
    ArchiveWrite(anyhow::Error),

    /// Archive committed but the date marker could not be stored
    #[error("archive marker update failed: {0:#}")]
    ArchiveMarker(anyhow::Error),

    /// Scheduler config could not be loaded or saved
    #[error("scheduler config unavailable: {0:#}")]
    Config(anyhow::Error),

    #[error("invalid archive time '{0}', expected HH:MM")]
    InvalidArchiveTime(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task {task_id} has no reminder {reminder_id}")]
    UnknownReminder { task_id: String, reminder_id: String },

    #[error("snooze minutes must be positive, got {0}")]
    InvalidSnooze(i64),

    #[error("engine already running")]
    AlreadyRunning,

    #[error("engine not running")]
    NotRunning,

    /// A polling loop did not wind down in time
    #[error("{name} loop did not stop within {seconds}s")]
    Shutdown { name: &'static str, seconds: u64 },
}

pub type TriggerResult<T> = Result<T, TriggerError>;

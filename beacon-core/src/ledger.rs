//! Dedup ledger for reminder firings.
//!
//! A `(task, reminder)` pair is recorded the moment it fires and only cleared
//! by an explicit reset (snooze, schedule edit). Backed by a [`StateStore`], so
//! durability is whatever the host's store gives.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::store::StateStore;

const NAMESPACE: &str = "reminder";

/// Reminder id used for the implicit "upcoming task" notice.
pub const BUILTIN_REMINDER: &str = "builtin";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub task_id: String,
    pub reminder_id: String,
}

impl LedgerKey {
    pub fn new(task_id: impl Into<String>, reminder_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            reminder_id: reminder_id.into(),
        }
    }

    pub fn builtin(task_id: impl Into<String>) -> Self {
        Self::new(task_id, BUILTIN_REMINDER)
    }

    pub fn is_builtin(&self) -> bool {
        self.reminder_id == BUILTIN_REMINDER
    }

    fn storage_key(&self) -> String {
        format!("{NAMESPACE}:{}:{}", self.task_id, self.reminder_id)
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task_id, self.reminder_id)
    }
}

#[derive(Clone)]
pub struct DedupLedger {
    state: Arc<dyn StateStore>,
}

impl DedupLedger {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    pub fn has_fired(&self, key: &LedgerKey) -> Result<bool> {
        Ok(self.state.flag(&key.storage_key())?.unwrap_or(false))
    }

    pub fn record(&self, key: &LedgerKey) -> Result<()> {
        self.state.set_flag(&key.storage_key(), true)
    }

    pub fn clear(&self, key: &LedgerKey) -> Result<()> {
        self.state.remove(&key.storage_key())
    }

    /// Drop every key of a task, built-in included.
    pub fn clear_task(&self, task_id: &str) -> Result<usize> {
        self.state.remove_prefix(&format!("{NAMESPACE}:{task_id}:"))
    }
}

impl fmt::Debug for DedupLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupLedger").finish_non_exhaustive()
    }
}

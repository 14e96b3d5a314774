//! Host-facing storage seams: the task/note store and the persisted
//! key -> bool state that backs every idempotency decision.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Result, bail};

use crate::task::{Note, Task, TaskPatch};

/// Task/note collection owned by the host.
pub trait TaskStore: Send + Sync {
    fn list_tasks(&self) -> Result<Vec<Task>>;
    fn list_notes(&self) -> Result<Vec<Note>>;
    fn update_task(&self, id: &str, patch: TaskPatch) -> Result<()>;
    fn remove_tasks(&self, ids: &[String]) -> Result<()>;
    fn remove_notes(&self, ids: &[String]) -> Result<()>;
}

/// Durable flags. `None` means "never recorded", which is distinct from `false`.
pub trait StateStore: Send + Sync {
    fn flag(&self, key: &str) -> Result<Option<bool>>;
    fn set_flag(&self, key: &str, value: bool) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// Returns how many keys were dropped.
    fn remove_prefix(&self, prefix: &str) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<Task>>,
    notes: Mutex<Vec<Note>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<Task>, notes: Vec<Note>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            notes: Mutex::new(notes),
        }
    }

    pub fn insert_task(&self, task: Task) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task,
            None => tasks.push(task),
        }
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }
}

impl TaskStore for MemoryTaskStore {
    fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn list_notes(&self) -> Result<Vec<Note>> {
        Ok(self.notes.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn update_task(&self, id: &str, patch: TaskPatch) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            bail!("no task with id {id}");
        };
        if !patch.apply(task) {
            bail!("patch {patch:?} does not apply to task {id}");
        }
        Ok(())
    }

    fn remove_tasks(&self, ids: &[String]) -> Result<()> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|t| !ids.contains(&t.id));
        Ok(())
    }

    fn remove_notes(&self, ids: &[String]) -> Result<()> {
        self.notes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|n| !ids.contains(&n.id));
        Ok(())
    }
}

/// Process-local state. Loses everything on restart.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    flags: Mutex<BTreeMap<String, bool>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn flag(&self, key: &str) -> Result<Option<bool>> {
        Ok(self
            .flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied())
    }

    fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        self.flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let mut flags = self.flags.lock().unwrap_or_else(PoisonError::into_inner);
        let before = flags.len();
        flags.retain(|k, _| !k.starts_with(prefix));
        Ok(before - flags.len())
    }
}

//! JSON files under the beacon home directory standing in for the host
//! application's storage, location service and notification center.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use beacon_core::{
    AnalyticsJob, ArchiveStore, ConfigStore, Coordinates, LocationSource, Note, Notification, NotificationPriority,
    NotificationSink, Priority, RegionRegistry, RegionSpec, SchedulerConfig, StateStore, Task, TaskPatch, TaskStore,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if s.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))
}

/// Write via a sibling temp file + rename so readers never see half a file.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("serialize json")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// tasks.json + notes.json, re-read on every call so edits made by other
/// tools between ticks are picked up.
#[derive(Debug)]
pub struct JsonTaskStore {
    tasks: PathBuf,
    notes: PathBuf,
    lock: Mutex<()>,
}

impl JsonTaskStore {
    pub fn new(tasks: impl Into<PathBuf>, notes: impl Into<PathBuf>) -> Self {
        Self {
            tasks: tasks.into(),
            notes: notes.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json(&self.tasks, &tasks)
    }

    pub fn save_notes(&self, notes: &[Note]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json(&self.notes, &notes)
    }
}

impl TaskStore for JsonTaskStore {
    fn list_tasks(&self) -> Result<Vec<Task>> {
        read_json(&self.tasks)
    }

    fn list_notes(&self) -> Result<Vec<Note>> {
        read_json(&self.notes)
    }

    fn update_task(&self, id: &str, patch: TaskPatch) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tasks: Vec<Task> = read_json(&self.tasks)?;
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            bail!("no task with id {id} in {}", self.tasks.display());
        };
        if !patch.apply(task) {
            bail!("patch {patch:?} does not apply to task {id}");
        }
        write_json(&self.tasks, &tasks)
    }

    fn remove_tasks(&self, ids: &[String]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tasks: Vec<Task> = read_json(&self.tasks)?;
        let before = tasks.len();
        tasks.retain(|t| !ids.contains(&t.id));
        if tasks.len() == before {
            return Ok(());
        }
        write_json(&self.tasks, &tasks)
    }

    fn remove_notes(&self, ids: &[String]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut notes: Vec<Note> = read_json(&self.notes)?;
        let before = notes.len();
        notes.retain(|n| !ids.contains(&n.id));
        if notes.len() == before {
            return Ok(());
        }
        write_json(&self.notes, &notes)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    flags: BTreeMap<String, bool>,
    #[serde(default)]
    last_archive: BTreeMap<String, NaiveDate>,
}

/// state.json: ledger entries, geofence presence and the per-user archive
/// marker. Every mutation is written through before it becomes visible.
#[derive(Debug)]
pub struct JsonStateStore {
    path: PathBuf,
    inner: Mutex<StateFile>,
}

impl JsonStateStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = read_json(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    pub fn last_archive(&self, user_id: &str) -> Option<NaiveDate> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_archive
            .get(user_id)
            .copied()
    }

    pub fn set_last_archive(&self, user_id: &str, date: NaiveDate) -> Result<()> {
        self.update(|s| {
            s.last_archive.insert(user_id.to_string(), date);
        })
    }

    /// Keys under `prefix` currently set.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flags
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn update<R>(&self, f: impl FnOnce(&mut StateFile) -> R) -> Result<R> {
        let mut current = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = current.clone();
        let out = f(&mut next);
        write_json(&self.path, &next)?;
        *current = next;
        Ok(out)
    }
}

impl StateStore for JsonStateStore {
    fn flag(&self, key: &str) -> Result<Option<bool>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flags
            .get(key)
            .copied())
    }

    fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        self.update(|s| {
            s.flags.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        if self.flag(key)?.is_none() {
            return Ok(());
        }
        self.update(|s| {
            s.flags.remove(key);
        })
    }

    fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        if self.keys_with_prefix(prefix).is_empty() {
            return Ok(0);
        }
        self.update(|s| {
            let before = s.flags.len();
            s.flags.retain(|k, _| !k.starts_with(prefix));
            before - s.flags.len()
        })
    }
}

/// Archived items for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveShelf {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl ArchiveShelf {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.notes.is_empty()
    }

    /// Insert or replace by id.
    fn upsert(&mut self, tasks: &[Task], notes: &[Note]) {
        for task in tasks {
            self.tasks.retain(|t| t.id != task.id);
            self.tasks.push(task.clone());
        }
        for note in notes {
            self.notes.retain(|n| n.id != note.id);
            self.notes.push(note.clone());
        }
    }

    fn filter(&self, task: impl Fn(&Task) -> bool, note: impl Fn(&Note) -> bool) -> Self {
        Self {
            tasks: self.tasks.iter().filter(|&t| task(t)).cloned().collect(),
            notes: self.notes.iter().filter(|&n| note(n)).cloned().collect(),
        }
    }
}

/// archive.json, keyed by user. The date marker lives in [`JsonStateStore`].
#[derive(Debug)]
pub struct JsonArchiveStore {
    path: PathBuf,
    state: Arc<JsonStateStore>,
    lock: Mutex<()>,
}

impl JsonArchiveStore {
    pub fn new(path: impl Into<PathBuf>, state: Arc<JsonStateStore>) -> Self {
        Self {
            path: path.into(),
            state,
            lock: Mutex::new(()),
        }
    }

    pub fn shelf(&self, user_id: &str) -> Result<ArchiveShelf> {
        let mut all: BTreeMap<String, ArchiveShelf> = read_json(&self.path)?;
        Ok(all.remove(user_id).unwrap_or_default())
    }

    fn update<T>(&self, user_id: &str, f: impl FnOnce(&mut ArchiveShelf) -> T) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: BTreeMap<String, ArchiveShelf> = read_json(&self.path)?;
        let out = f(all.entry(user_id.to_string()).or_default());
        write_json(&self.path, &all)?;
        Ok(out)
    }

    /// Merge an exported shelf back in; items with a known id are replaced.
    pub fn import(&self, user_id: &str, incoming: &ArchiveShelf) -> Result<(usize, usize)> {
        self.update(user_id, |shelf| {
            shelf.upsert(&incoming.tasks, &incoming.notes);
            (incoming.tasks.len(), incoming.notes.len())
        })
    }

    /// Returns how many tasks and notes were actually removed.
    pub fn delete(&self, user_id: &str, task_ids: &[String], note_ids: &[String]) -> Result<(usize, usize)> {
        self.update(user_id, |shelf| {
            let (tasks, notes) = (shelf.tasks.len(), shelf.notes.len());
            shelf.tasks.retain(|t| !task_ids.contains(&t.id));
            shelf.notes.retain(|n| !note_ids.contains(&n.id));
            (tasks - shelf.tasks.len(), notes - shelf.notes.len())
        })
    }

    /// Case-insensitive match on text and note tags.
    pub fn search(&self, user_id: &str, query: &str) -> Result<ArchiveShelf> {
        let needle = query.trim().to_lowercase();
        Ok(self.shelf(user_id)?.filter(
            |t| t.text.to_lowercase().contains(&needle),
            |n| {
                n.text.to_lowercase().contains(&needle)
                    || n.tags.iter().any(|tag| tag.to_lowercase().contains(&needle))
            },
        ))
    }

    /// Items whose archive stamp falls on `date` in `tz`.
    pub fn for_date(&self, user_id: &str, date: NaiveDate, tz: Tz) -> Result<ArchiveShelf> {
        let on_day = |stamp: Option<DateTime<Utc>>| stamp.is_some_and(|at| at.with_timezone(&tz).date_naive() == date);
        Ok(self
            .shelf(user_id)?
            .filter(|t| on_day(t.archived_at), |n| on_day(n.archived_at)))
    }

    /// Drop items archived more than `keep_days` before `now`. Items without
    /// a stamp are kept.
    pub fn prune(&self, user_id: &str, keep_days: i64, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::days(keep_days.max(0));
        let keep = |stamp: Option<DateTime<Utc>>| stamp.is_none_or(|at| at >= cutoff);

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: BTreeMap<String, ArchiveShelf> = read_json(&self.path)?;
        let Some(shelf) = all.get_mut(user_id) else {
            return Ok(0);
        };
        let before = shelf.tasks.len() + shelf.notes.len();
        shelf.tasks.retain(|t| keep(t.archived_at));
        shelf.notes.retain(|n| keep(n.archived_at));
        let removed = before - shelf.tasks.len() - shelf.notes.len();
        if removed > 0 {
            write_json(&self.path, &all)?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl ArchiveStore for JsonArchiveStore {
    async fn archive(&self, tasks: &[Task], notes: &[Note], user_id: &str) -> Result<()> {
        self.update(user_id, |shelf| shelf.upsert(tasks, notes))
    }

    async fn archived_tasks(&self, user_id: &str) -> Result<Vec<Task>> {
        Ok(self.shelf(user_id)?.tasks)
    }

    async fn last_archive_date(&self, user_id: &str) -> Result<Option<NaiveDate>> {
        Ok(self.state.last_archive(user_id))
    }

    async fn set_last_archive_date(&self, user_id: &str, date: NaiveDate) -> Result<()> {
        self.state.set_last_archive(user_id, date)
    }
}

/// location.json: `{"lat": .., "lng": ..}` written by whatever tracks the
/// device. A missing file means no fix.
#[derive(Debug)]
pub struct FileLocationSource {
    path: PathBuf,
}

impl FileLocationSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LocationSource for FileLocationSource {
    async fn current_position(&self) -> Result<Option<Coordinates>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let s = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read {}", self.path.display()))?;
        if s.trim().is_empty() {
            return Ok(None);
        }
        let fix: Coordinates = serde_json::from_str(&s).with_context(|| format!("parse {}", self.path.display()))?;
        Ok(Some(fix))
    }
}

/// Prints notifications to stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl NotificationSink for StdoutSink {
    async fn notify(&self, n: Notification) -> Result<()> {
        let level = match n.priority {
            NotificationPriority::Low => "low",
            NotificationPriority::Normal => "normal",
            NotificationPriority::High => "HIGH",
        };
        println!("[{level}] {}: {}", n.title, n.body);
        Ok(())
    }
}

/// regions.json: the registered geofence table.
#[derive(Debug)]
pub struct JsonRegionRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonRegionRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn list(&self) -> Result<BTreeMap<String, RegionSpec>> {
        read_json(&self.path)
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, RegionSpec>)) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut regions = self.list()?;
        f(&mut regions);
        write_json(&self.path, &regions)
    }
}

#[async_trait]
impl RegionRegistry for JsonRegionRegistry {
    async fn register_region(&self, region: &RegionSpec) -> Result<()> {
        self.update(|r| {
            r.insert(region.id.clone(), region.clone());
        })
    }

    async fn deregister_region(&self, id: &str) -> Result<()> {
        self.update(|r| {
            r.remove(id);
        })
    }
    async fn registered_regions(&self) -> Result<Vec<RegionSpec>> {
        Ok(self.list()?.into_values().collect())
    }
}

/// scheduler_config.json, keyed by user.
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self, user_id: &str) -> Result<Option<SchedulerConfig>> {
        let mut all: BTreeMap<String, SchedulerConfig> = read_json(&self.path)?;
        Ok(all.remove(user_id))
    }

    fn save(&self, user_id: &str, config: &SchedulerConfig) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: BTreeMap<String, SchedulerConfig> = read_json(&self.path)?;
        all.insert(user_id.to_string(), config.clone());
        write_json(&self.path, &all)
    }
}

/// Completion patterns over the archived history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionStats {
    pub generated_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub completed: usize,
    pub high_priority: usize,
    /// Completed tasks by the weekday they were created on.
    pub by_weekday: BTreeMap<String, usize>,
    /// Completed tasks by the UTC hour they were created in.
    pub by_hour: BTreeMap<u32, usize>,
}

pub fn completion_stats(tasks: &[Task], now: DateTime<Utc>) -> CompletionStats {
    let mut stats = CompletionStats {
        generated_at: Some(now),
        total: tasks.len(),
        ..CompletionStats::default()
    };
    for t in tasks {
        if t.priority == Priority::High {
            stats.high_priority += 1;
        }
        if !t.completed {
            continue;
        }
        stats.completed += 1;
        *stats.by_weekday.entry(t.created_at.weekday().to_string()).or_default() += 1;
        *stats.by_hour.entry(t.created_at.hour()).or_default() += 1;
    }
    stats
}

/// Local stand-in for the analysis job: writes [`CompletionStats`] per user
/// to analytics.json.
#[derive(Debug)]
pub struct LocalAnalytics {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LocalAnalytics {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl AnalyticsJob for LocalAnalytics {
    async fn analyze(&self, tasks: Vec<Task>, user_id: &str) -> Result<()> {
        let stats = completion_stats(&tasks, Utc::now());
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: BTreeMap<String, CompletionStats> = read_json(&self.path)?;
        all.insert(user_id.to_string(), stats);
        write_json(&self.path, &all)
    }
}

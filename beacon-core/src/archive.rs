//! Daily archive scheduler.
//!
//! Once per local calendar day, after the configured wall-clock time, move
//! finished items into the archive store. The per-user last-archive-date
//! marker is the only thing that decides whether today's pass already ran,
//! so restarts, missed ticks and repeated ticks all collapse into one pass.
//!
//! State machine per user:
//!
//! ```text
//! IDLE --(time reached && marker stale)--> ARCHIVING --(done | failed)--> IDLE
//! ```
//!
//! `ARCHIVING` is not reentrant; overlapping ticks return [`ArchiveTick::InFlight`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{TriggerError, TriggerResult};
use crate::notify::{Notification, NotificationPriority, NotificationSink};
use crate::store::TaskStore;
use crate::task::{Note, Task};
use crate::time::{Clock, local_date, parse_archive_time};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// "HH:MM" local wall-clock time.
    pub archive_time: String,
    pub archive_completed_only: bool,
    pub enable_ai_analysis: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            archive_time: "00:00".to_string(),
            archive_completed_only: true,
            enable_ai_analysis: true,
        }
    }
}

impl SchedulerConfig {
    pub fn archive_time(&self) -> TriggerResult<NaiveTime> {
        parse_archive_time(&self.archive_time)
            .map_err(|_| TriggerError::InvalidArchiveTime(self.archive_time.clone()))
    }
}

/// Partial update; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfigPatch {
    pub enabled: Option<bool>,
    pub archive_time: Option<String>,
    pub archive_completed_only: Option<bool>,
    pub enable_ai_analysis: Option<bool>,
}

impl SchedulerConfigPatch {
    fn apply(&self, config: &mut SchedulerConfig) {
        if let Some(v) = self.enabled {
            config.enabled = v;
        }
        if let Some(v) = &self.archive_time {
            config.archive_time = v.trim().to_string();
        }
        if let Some(v) = self.archive_completed_only {
            config.archive_completed_only = v;
        }
        if let Some(v) = self.enable_ai_analysis {
            config.enable_ai_analysis = v;
        }
    }
}

/// Per-user persisted JSON blob holding [`SchedulerConfig`].
pub trait ConfigStore: Send + Sync {
    fn load(&self, user_id: &str) -> Result<Option<SchedulerConfig>>;
    fn save(&self, user_id: &str, config: &SchedulerConfig) -> Result<()>;
}

/// Durable backend for archived items plus the per-user date marker.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn archive(&self, tasks: &[Task], notes: &[Note], user_id: &str) -> Result<()>;
    async fn archived_tasks(&self, user_id: &str) -> Result<Vec<Task>>;
    async fn last_archive_date(&self, user_id: &str) -> Result<Option<NaiveDate>>;
    async fn set_last_archive_date(&self, user_id: &str, date: NaiveDate) -> Result<()>;
}

/// Fire-and-forget analysis over the whole archived history.
#[async_trait]
pub trait AnalyticsJob: Send + Sync {
    async fn analyze(&self, tasks: Vec<Task>, user_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivePhase {
    Idle,
    Archiving,
}

#[derive(Debug)]
pub struct ArchiveReport {
    pub date: NaiveDate,
    pub archived_at: DateTime<Utc>,
    pub tasks_archived: usize,
    pub notes_archived: usize,
    pub tasks_removed: usize,
    /// Background analytics run, when one was started.
    pub analytics: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub enum ArchiveTick {
    Disabled,
    NotYetDue,
    AlreadyArchived(NaiveDate),
    InFlight,
    Archived(ArchiveReport),
}

/// Result of [`DailyArchiveScheduler::update_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub config: SchedulerConfig,
    pub enabled_changed: bool,
}

pub struct DailyArchiveScheduler {
    user_id: String,
    timezone: Tz,
    clock: Arc<dyn Clock>,
    store: Arc<dyn TaskStore>,
    archive: Arc<dyn ArchiveStore>,
    configs: Arc<dyn ConfigStore>,
    sink: Arc<dyn NotificationSink>,
    analytics: Option<Arc<dyn AnalyticsJob>>,
    in_flight: AtomicBool,
}

impl DailyArchiveScheduler {
    pub fn new(
        user_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn TaskStore>,
        archive: Arc<dyn ArchiveStore>,
        configs: Arc<dyn ConfigStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            timezone: Tz::UTC,
            clock,
            store,
            archive,
            configs,
            sink,
            analytics: None,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = tz;
        self
    }

    pub fn with_analytics(mut self, job: Arc<dyn AnalyticsJob>) -> Self {
        self.analytics = Some(job);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn phase(&self) -> ArchivePhase {
        if self.in_flight.load(Ordering::Acquire) {
            ArchivePhase::Archiving
        } else {
            ArchivePhase::Idle
        }
    }

    /// Persisted config, or the defaults when none was ever saved.
    pub fn config(&self) -> TriggerResult<SchedulerConfig> {
        Ok(self
            .configs
            .load(&self.user_id)
            .map_err(TriggerError::Config)?
            .unwrap_or_default())
    }

    pub fn update_config(&self, patch: &SchedulerConfigPatch) -> TriggerResult<ConfigChange> {
        let current = self.config()?;
        let mut next = current.clone();
        patch.apply(&mut next);
        next.archive_time()?;

        self.configs
            .save(&self.user_id, &next)
            .map_err(TriggerError::Config)?;
        info!(user_id = %self.user_id, config = ?next, "archive scheduler config updated");

        Ok(ConfigChange {
            enabled_changed: current.enabled != next.enabled,
            config: next,
        })
    }

    pub async fn last_archive_date(&self) -> TriggerResult<Option<NaiveDate>> {
        self.archive
            .last_archive_date(&self.user_id)
            .await
            .map_err(TriggerError::ArchiveMarker)
    }

    /// Automatic pass: both the time gate and the date gate must pass.
    ///
    /// The time gate is "at or after" rather than "exactly at", so the first
    /// tick after a downtime that spanned the archive time still runs today's
    /// pass.
    pub async fn tick(&self) -> TriggerResult<ArchiveTick> {
        let config = self.config()?;
        if !config.enabled {
            return Ok(ArchiveTick::Disabled);
        }
        let archive_time = config.archive_time()?;

        let now = self.clock.now();
        let local = now.with_timezone(&self.timezone);
        let today = local.date_naive();
        if local.time() < archive_time {
            return Ok(ArchiveTick::NotYetDue);
        }

        if let Some(last) = self.last_archive_date().await? {
            if last >= today {
                return Ok(ArchiveTick::AlreadyArchived(last));
            }
        }

        self.run_pass(&config, now, today).await
    }

    /// Operator-initiated pass. Skips the time/date gate but still records
    /// the marker so the automatic pass does not repeat it today.
    pub async fn archive_now(&self) -> TriggerResult<ArchiveTick> {
        let config = self.config()?;
        let now = self.clock.now();
        let today = local_date(now, self.timezone);
        info!(user_id = %self.user_id, "manual archive triggered");
        self.run_pass(&config, now, today).await
    }

    async fn run_pass(&self, config: &SchedulerConfig, now: DateTime<Utc>, today: NaiveDate) -> TriggerResult<ArchiveTick> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!(user_id = %self.user_id, "archive pass already running");
            return Ok(ArchiveTick::InFlight);
        };

        let tasks = self.store.list_tasks().map_err(TriggerError::Store)?;
        let notes = self.store.list_notes().map_err(TriggerError::Store)?;

        let (tasks, notes) = select_for_archive(tasks, notes, config.archive_completed_only, now);

        if tasks.is_empty() && notes.is_empty() {
            info!(user_id = %self.user_id, %today, "nothing to archive");
            self.mark(today).await?;
            return Ok(ArchiveTick::Archived(ArchiveReport {
                date: today,
                archived_at: now,
                tasks_archived: 0,
                notes_archived: 0,
                tasks_removed: 0,
                analytics: None,
            }));
        }

        info!(
            user_id = %self.user_id,
            tasks = tasks.len(),
            notes = notes.len(),
            "archiving"
        );

        if let Err(e) = self.archive.archive(&tasks, &notes, &self.user_id).await {
            error!(user_id = %self.user_id, error = %e, "archive write failed");
            self.send(Notification::new(
                "Daily archive failed",
                format!("Daily archive failed: {e}"),
                NotificationPriority::High,
            ))
            .await;
            return Err(TriggerError::ArchiveWrite(e));
        }

        let mut tasks_removed = 0;
        if config.archive_completed_only {
            let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
            match self.store.remove_tasks(&ids) {
                Ok(()) => tasks_removed = ids.len(),
                // Archive writes are keyed by id, so a retry tomorrow is harmless.
                Err(e) => warn!(user_id = %self.user_id, error = %e, "archived tasks not removed from active store"),
            }
        }

        self.mark(today).await?;

        self.send(Notification::new(
            "Daily archive",
            format!("{} tasks and {} notes archived", tasks.len(), notes.len()),
            NotificationPriority::Low,
        ))
        .await;

        let analytics = if config.enable_ai_analysis {
            self.spawn_analytics(tasks.clone())
        } else {
            None
        };

        info!(user_id = %self.user_id, %today, "daily archive completed");
        Ok(ArchiveTick::Archived(ArchiveReport {
            date: today,
            archived_at: now,
            tasks_archived: tasks.len(),
            notes_archived: notes.len(),
            tasks_removed,
            analytics,
        }))
    }

    async fn mark(&self, today: NaiveDate) -> TriggerResult<()> {
        self.archive
            .set_last_archive_date(&self.user_id, today)
            .await
            .map_err(TriggerError::ArchiveMarker)
    }

    async fn send(&self, notification: Notification) {
        if let Err(e) = self.sink.notify(notification).await {
            warn!(user_id = %self.user_id, error = %e, "notification delivery failed");
        }
    }

    /// Analytics runs detached; its failure is logged and nothing else.
    fn spawn_analytics(&self, batch: Vec<Task>) -> Option<JoinHandle<()>> {
        let job = self.analytics.clone()?;
        let archive = self.archive.clone();
        let user_id = self.user_id.clone();

        Some(tokio::spawn(async move {
            let history = match archive.archived_tasks(&user_id).await {
                Ok(history) => history,
                Err(e) => {
                    warn!(%user_id, error = %e, "archive history unavailable, analysing batch only");
                    Vec::new()
                }
            };
            let all = merge_by_id(history, batch);
            let count = all.len();
            match job.analyze(all, &user_id).await {
                Ok(()) => info!(%user_id, tasks = count, "archive analytics completed"),
                Err(e) => warn!(%user_id, error = %e, "archive analytics failed"),
            }
        }))
    }
}

/// Pick and stamp what today's pass moves.
pub fn select_for_archive(
    tasks: Vec<Task>,
    notes: Vec<Note>,
    completed_only: bool,
    archived_at: DateTime<Utc>,
) -> (Vec<Task>, Vec<Note>) {
    let tasks = tasks
        .into_iter()
        .filter(|t| !t.deleted && (!completed_only || t.completed))
        .map(|mut t| {
            t.archived_at = Some(archived_at);
            t
        })
        .collect();
    let notes = notes
        .into_iter()
        .filter(|n| !n.deleted)
        .map(|mut n| {
            n.archived_at = Some(archived_at);
            n
        })
        .collect();
    (tasks, notes)
}

/// Union by task id; `newer` wins.
fn merge_by_id(older: Vec<Task>, newer: Vec<Task>) -> Vec<Task> {
    let mut order = Vec::new();
    let mut by_id: HashMap<String, Task> = HashMap::new();
    for task in older.into_iter().chain(newer) {
        if !by_id.contains_key(&task.id) {
            order.push(task.id.clone());
        }
        by_id.insert(task.id.clone(), task);
    }
    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    configs: Mutex<HashMap<String, SchedulerConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(user_id: &str, config: SchedulerConfig) -> Self {
        let store = Self::default();
        store
            .configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), config);
        store
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self, user_id: &str) -> Result<Option<SchedulerConfig>> {
        Ok(self
            .configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned())
    }

    fn save(&self, user_id: &str, config: &SchedulerConfig) -> Result<()> {
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), config.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ArchiveShelf {
    tasks: Vec<Task>,
    notes: Vec<Note>,
    writes: usize,
    marker: Option<NaiveDate>,
}

/// In-memory archive keyed by user. Re-archiving an id replaces it.
#[derive(Debug, Default)]
pub struct MemoryArchiveStore {
    shelves: Mutex<HashMap<String, ArchiveShelf>>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `archive` calls for a user.
    pub fn writes(&self, user_id: &str) -> usize {
        self.shelves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map_or(0, |s| s.writes)
    }

    pub fn notes(&self, user_id: &str) -> Vec<Note> {
        self.shelves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map(|s| s.notes.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn archive(&self, tasks: &[Task], notes: &[Note], user_id: &str) -> Result<()> {
        let mut shelves = self.shelves.lock().unwrap_or_else(PoisonError::into_inner);
        let shelf = shelves.entry(user_id.to_string()).or_default();
        for task in tasks {
            shelf.tasks.retain(|t| t.id != task.id);
            shelf.tasks.push(task.clone());
        }
        for note in notes {
            shelf.notes.retain(|n| n.id != note.id);
            shelf.notes.push(note.clone());
        }
        shelf.writes += 1;
        Ok(())
    }

    async fn archived_tasks(&self, user_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .shelves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map(|s| s.tasks.clone())
            .unwrap_or_default())
    }

    async fn last_archive_date(&self, user_id: &str) -> Result<Option<NaiveDate>> {
        Ok(self
            .shelves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .and_then(|s| s.marker))
    }

    async fn set_last_archive_date(&self, user_id: &str, date: NaiveDate) -> Result<()> {
        self.shelves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id.to_string())
            .or_default()
            .marker = Some(date);
        Ok(())
    }
}

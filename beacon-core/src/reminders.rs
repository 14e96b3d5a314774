//! Reminder evaluation + the polling scheduler that fires them.
//!
//! Evaluation is a pure projection of one task at one instant
//! ([`evaluate_task`]). The scheduler layers the dedup ledger, the store
//! mutation and the notification on top, in that order.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{TriggerError, TriggerResult};
use crate::ledger::{BUILTIN_REMINDER, DedupLedger, LedgerKey};
use crate::notify::{Notification, NotificationPriority, NotificationSink};
use crate::store::TaskStore;
use crate::task::{Priority, ReminderConfig, ReminderKind, Task, TaskPatch};
use crate::time::{Clock, parse_timestamp};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReminderPolicy {
    /// Built-in "upcoming" notice fires once the task is this close.
    pub lookahead_minutes: i64,
    /// Half-width of the due window around a reminder's target instant.
    pub tolerance_seconds: i64,
    /// Forward fired reminders to the notification sink.
    pub notify: bool,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self {
            lookahead_minutes: 15,
            tolerance_seconds: 60,
            notify: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiredKind {
    /// Built-in lookahead notice.
    Upcoming,
    /// Relative or absolute reminder reached its target.
    Reminder,
    /// Snooze period elapsed.
    Snoozed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiredReminder {
    pub task_id: String,
    pub reminder_id: String,
    pub kind: FiredKind,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    pub fired_at: DateTime<Utc>,
}

impl FiredReminder {
    fn new(task: &Task, reminder_id: &str, kind: FiredKind, now: DateTime<Utc>) -> Self {
        let (title, priority) = match kind {
            FiredKind::Upcoming => ("Upcoming task", NotificationPriority::Low),
            FiredKind::Reminder | FiredKind::Snoozed => (
                "Reminder",
                match task.priority {
                    Priority::High => NotificationPriority::High,
                    Priority::Medium => NotificationPriority::Normal,
                },
            ),
        };
        Self {
            task_id: task.id.clone(),
            reminder_id: reminder_id.to_string(),
            kind,
            title: title.to_string(),
            body: task.text.clone(),
            priority,
            fired_at: now,
        }
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(&self.task_id, &self.reminder_id)
    }

    pub fn notification(&self) -> Notification {
        Notification::new(&self.title, &self.body, self.priority)
    }
}

/// Bad host data found while evaluating. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidReminder {
    pub task_id: String,
    pub reminder_id: Option<String>,
    pub detail: String,
}

impl InvalidReminder {
    fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}",
            self.task_id,
            self.reminder_id.as_deref().unwrap_or("-"),
            self.detail
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub due: Vec<FiredReminder>,
    pub invalid: Vec<InvalidReminder>,
}

/// `-tolerance < target - now <= tolerance`
pub fn within_tolerance(target: DateTime<Utc>, now: DateTime<Utc>, tolerance: Duration) -> bool {
    let diff = target - now;
    diff > -tolerance && diff <= tolerance
}

/// Everything on `task` that is due at `now`, ignoring the ledger.
pub fn evaluate_task(task: &Task, now: DateTime<Utc>, policy: &ReminderPolicy) -> Evaluation {
    let mut eval = Evaluation::default();
    if !task.is_open() {
        return eval;
    }

    let scheduled = match task.scheduled_at.as_deref() {
        None => None,
        Some(raw) => match parse_timestamp(raw) {
            Ok(at) => Some(at),
            Err(e) => {
                eval.invalid.push(InvalidReminder {
                    task_id: task.id.clone(),
                    reminder_id: None,
                    detail: e.to_string(),
                });
                None
            }
        },
    };

    if let Some(at) = scheduled {
        let lead = at - now;
        if lead > Duration::zero() && lead <= Duration::minutes(policy.lookahead_minutes) {
            eval.due
                .push(FiredReminder::new(task, BUILTIN_REMINDER, FiredKind::Upcoming, now));
        }
    }

    let tolerance = Duration::seconds(policy.tolerance_seconds);
    for reminder in &task.reminders {
        if reminder.is_spent() {
            continue;
        }

        if let Some(until) = reminder.snoozed_until {
            if now >= until {
                eval.due
                    .push(FiredReminder::new(task, &reminder.id, FiredKind::Snoozed, now));
            }
            continue;
        }

        let target = match &reminder.kind {
            ReminderKind::Relative { minutes_before } if *minutes_before < 0 => {
                eval.invalid.push(InvalidReminder {
                    task_id: task.id.clone(),
                    reminder_id: Some(reminder.id.clone()),
                    detail: format!("negative minutes_before: {minutes_before}"),
                });
                continue;
            }
            // No schedule, nothing to be relative to.
            ReminderKind::Relative { minutes_before } => match scheduled {
                Some(at) => at - Duration::minutes(*minutes_before),
                None => continue,
            },
            ReminderKind::Absolute { at } => match parse_timestamp(at) {
                Ok(at) => at,
                Err(e) => {
                    eval.invalid.push(InvalidReminder {
                        task_id: task.id.clone(),
                        reminder_id: Some(reminder.id.clone()),
                        detail: e.to_string(),
                    });
                    continue;
                }
            },
        };

        if within_tolerance(target, now, tolerance) {
            eval.due
                .push(FiredReminder::new(task, &reminder.id, FiredKind::Reminder, now));
        }
    }

    eval
}

/// Polls the task store and fires due reminders exactly once.
pub struct ReminderScheduler {
    clock: Arc<dyn Clock>,
    store: Arc<dyn TaskStore>,
    ledger: DedupLedger,
    sink: Arc<dyn NotificationSink>,
    policy: ReminderPolicy,
    reported: Mutex<HashSet<String>>,
}

impl ReminderScheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn TaskStore>,
        ledger: DedupLedger,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            clock,
            store,
            ledger,
            sink,
            policy: ReminderPolicy::default(),
            reported: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_policy(mut self, policy: ReminderPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &ReminderPolicy {
        &self.policy
    }

    /// One polling pass. A failure on one reminder never stops the others.
    pub async fn tick(&self) -> TriggerResult<Vec<FiredReminder>> {
        let now = self.clock.now();
        let tasks = self.store.list_tasks().map_err(TriggerError::Store)?;

        let mut fired = Vec::new();
        for task in tasks.iter().filter(|t| t.is_open()) {
            let eval = evaluate_task(task, now, &self.policy);
            self.report_invalid(&eval.invalid);

            for due in eval.due {
                let key = due.key();
                let previous = task.reminder(&due.reminder_id).cloned();
                match self.fire(due, previous).await {
                    Ok(Some(f)) => fired.push(f),
                    Ok(None) => debug!(%key, "already notified"),
                    Err(e) => warn!(%key, error = %e, "reminder not fired, will retry"),
                }
            }
        }

        Ok(fired)
    }

    /// Ledger check, then record + store mutation, then notify. A failed
    /// store write or delivery undoes the earlier steps so the next tick
    /// retries. `previous` is the reminder as it was before this firing.
    async fn fire(&self, due: FiredReminder, previous: Option<ReminderConfig>) -> TriggerResult<Option<FiredReminder>> {
        let key = due.key();
        if self.ledger.has_fired(&key).map_err(TriggerError::State)? {
            return Ok(None);
        }

        self.ledger.record(&key).map_err(TriggerError::State)?;
        if !key.is_builtin() {
            let patch = TaskPatch::MarkReminderTriggered {
                reminder_id: due.reminder_id.clone(),
            };
            if let Err(e) = self.store.update_task(&due.task_id, patch) {
                self.roll_back(&key, &due.task_id, None);
                return Err(TriggerError::Store(e));
            }
        }

        if self.policy.notify {
            if let Err(e) = self.sink.notify(due.notification()).await {
                self.roll_back(&key, &due.task_id, previous);
                return Err(TriggerError::Notify(e));
            }
        }

        info!(
            task_id = %due.task_id,
            reminder_id = %due.reminder_id,
            kind = ?due.kind,
            "reminder fired"
        );
        Ok(Some(due))
    }

    /// Re-arm a reminder `minutes` from now. Returns the new due instant.
    pub fn snooze(&self, task_id: &str, reminder_id: &str, minutes: i64) -> TriggerResult<DateTime<Utc>> {
        if minutes <= 0 {
            return Err(TriggerError::InvalidSnooze(minutes));
        }

        let tasks = self.store.list_tasks().map_err(TriggerError::Store)?;
        let task = tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| TriggerError::UnknownTask(task_id.to_string()))?;
        if task.reminder(reminder_id).is_none() {
            return Err(TriggerError::UnknownReminder {
                task_id: task_id.to_string(),
                reminder_id: reminder_id.to_string(),
            });
        }

        let now = self.clock.now();
        let until = now + Duration::minutes(minutes);
        self.store
            .update_task(task_id, TaskPatch::snooze(reminder_id, now, minutes))
            .map_err(TriggerError::Store)?;
        self.ledger
            .clear(&LedgerKey::new(task_id, reminder_id))
            .map_err(TriggerError::State)?;

        info!(task_id, reminder_id, %until, "reminder snoozed");
        Ok(until)
    }

    fn roll_back(&self, key: &LedgerKey, task_id: &str, previous: Option<ReminderConfig>) {
        if let Some(reminder) = previous {
            if let Err(e) = self.store.update_task(task_id, TaskPatch::RestoreReminder { reminder }) {
                warn!(%key, error = %e, "could not restore reminder state");
            }
        }
        if let Err(e) = self.ledger.clear(key) {
            warn!(%key, error = %e, "could not roll back ledger entry");
        }
    }

    /// Forget every firing of a task, e.g. after its schedule was edited.
    /// Explicit reminders are re-armed on the task as well. Returns how many
    /// ledger entries were dropped.
    pub fn reset_task(&self, task_id: &str) -> TriggerResult<usize> {
        let tasks = self.store.list_tasks().map_err(TriggerError::Store)?;
        if tasks.iter().any(|t| t.id == task_id) {
            self.store
                .update_task(task_id, TaskPatch::RearmReminders)
                .map_err(TriggerError::Store)?;
        }
        let cleared = self.ledger.clear_task(task_id).map_err(TriggerError::State)?;
        debug!(task_id, cleared, "ledger reset");
        Ok(cleared)
    }

    fn report_invalid(&self, invalid: &[InvalidReminder]) {
        if invalid.is_empty() {
            return;
        }
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
        for bad in invalid {
            if reported.insert(bad.fingerprint()) {
                warn!(
                    task_id = %bad.task_id,
                    reminder_id = bad.reminder_id.as_deref().unwrap_or("-"),
                    detail = %bad.detail,
                    "reminder excluded: invalid data"
                );
            }
        }
    }
}

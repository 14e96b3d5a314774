//! Task / note model as seen by the trigger engine.
//!
//! The host owns these records. The engine reads snapshots and only ever
//! applies a [`TaskPatch`] (reminder and geofence sub-fields).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
}

/// When an explicit reminder is due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReminderKind {
    /// Minutes before the task's scheduled time.
    Relative { minutes_before: i64 },
    /// Fixed instant, RFC3339 as supplied by the host.
    Absolute { at: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: ReminderKind,
    #[serde(default)]
    pub triggered: bool,
    #[serde(default)]
    pub snoozed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snoozed_count: u32,
}

impl ReminderConfig {
    pub fn relative(id: impl Into<String>, minutes_before: i64) -> Self {
        Self::with_kind(id, ReminderKind::Relative { minutes_before })
    }

    pub fn absolute(id: impl Into<String>, at: impl Into<String>) -> Self {
        Self::with_kind(id, ReminderKind::Absolute { at: at.into() })
    }

    fn with_kind(id: impl Into<String>, kind: ReminderKind) -> Self {
        Self {
            id: id.into(),
            kind,
            triggered: false,
            snoozed_until: None,
            snoozed_count: 0,
        }
    }

    /// Fired and not snoozed: never fires again.
    pub fn is_spent(&self) -> bool {
        self.triggered && self.snoozed_until.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoTrigger {
    Enter,
    Exit,
    Near,
}

impl std::fmt::Display for GeoTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GeoTrigger::Enter => "enter",
            GeoTrigger::Exit => "exit",
            GeoTrigger::Near => "near",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoReminder {
    pub lat: f64,
    pub lng: f64,
    /// Meters.
    pub radius: f64,
    pub trigger: GeoTrigger,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl GeoReminder {
    pub fn new(lat: f64, lng: f64, radius: f64, trigger: GeoTrigger) -> Self {
        Self {
            lat,
            lng,
            radius,
            trigger,
            enabled: true,
            address: None,
            last_triggered_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub priority: Priority,

    /// RFC3339, host supplied. May be malformed.
    #[serde(default)]
    pub scheduled_at: Option<String>,

    #[serde(default)]
    pub completed: bool,
    /// Soft delete.
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub reminders: Vec<ReminderConfig>,
    #[serde(default)]
    pub geo_reminder: Option<GeoReminder>,
}

impl Task {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            priority: Priority::Medium,
            scheduled_at: None,
            completed: false,
            deleted: false,
            created_at: Utc::now(),
            archived_at: None,
            reminders: Vec::new(),
            geo_reminder: None,
        }
    }

    pub fn scheduled(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at.to_rfc3339());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reminder(mut self, reminder: ReminderConfig) -> Self {
        self.reminders.push(reminder);
        self
    }

    pub fn with_geo(mut self, geo: GeoReminder) -> Self {
        self.geo_reminder = Some(geo);
        self
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }

    /// Not completed and not soft-deleted.
    pub fn is_open(&self) -> bool {
        !self.completed && !self.deleted
    }

    pub fn reminder(&self, reminder_id: &str) -> Option<&ReminderConfig> {
        self.reminders.iter().find(|r| r.id == reminder_id)
    }

    /// The geofence, when the monitor should look at this task at all.
    pub fn active_geo(&self) -> Option<&GeoReminder> {
        if !self.is_open() {
            return None;
        }
        self.geo_reminder.as_ref().filter(|g| g.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Note {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            created_at: Utc::now(),
            updated_at: None,
            tags: Vec::new(),
            deleted: false,
            archived_at: None,
        }
    }
}

/// Mutations the engine is allowed to apply to a host task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPatch {
    MarkReminderTriggered { reminder_id: String },
    SnoozeReminder { reminder_id: String, until: DateTime<Utc> },
    StampGeoTrigger { at: DateTime<Utc> },
    /// Clear `triggered` and any pending snooze on every reminder.
    RearmReminders,
    /// Put one reminder back exactly as it was.
    RestoreReminder { reminder: ReminderConfig },
}

impl TaskPatch {
    pub fn snooze(reminder_id: impl Into<String>, now: DateTime<Utc>, minutes: i64) -> Self {
        TaskPatch::SnoozeReminder {
            reminder_id: reminder_id.into(),
            until: now + Duration::minutes(minutes),
        }
    }

    /// Apply in place. Returns false when the target sub-record is missing.
    pub fn apply(&self, task: &mut Task) -> bool {
        match self {
            TaskPatch::MarkReminderTriggered { reminder_id } => {
                let Some(r) = task.reminders.iter_mut().find(|r| &r.id == reminder_id) else {
                    return false;
                };
                r.triggered = true;
                r.snoozed_until = None;
                true
            }
            TaskPatch::SnoozeReminder { reminder_id, until } => {
                let Some(r) = task.reminders.iter_mut().find(|r| &r.id == reminder_id) else {
                    return false;
                };
                r.triggered = false;
                r.snoozed_until = Some(*until);
                r.snoozed_count += 1;
                true
            }
            TaskPatch::StampGeoTrigger { at } => match task.geo_reminder.as_mut() {
                Some(geo) => {
                    geo.last_triggered_at = Some(*at);
                    true
                }
                None => false,
            },
            TaskPatch::RearmReminders => {
                for r in &mut task.reminders {
                    r.triggered = false;
                    r.snoozed_until = None;
                }
                true
            }
            TaskPatch::RestoreReminder { reminder } => {
                let Some(r) = task.reminders.iter_mut().find(|r| r.id == reminder.id) else {
                    return false;
                };
                *r = reminder.clone();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snooze_clears_triggered_and_counts() {
        let now = Utc::now();
        let mut r = ReminderConfig::relative("r1", 15);
        r.triggered = true;
        let mut t = Task::new("t1", "call mom").with_reminder(r);

        assert!(t.reminder("r1").unwrap().is_spent());
        assert!(TaskPatch::snooze("r1", now, 10).apply(&mut t));

        let r = t.reminder("r1").unwrap();
        assert!(!r.triggered);
        assert_eq!(r.snoozed_until, Some(now + Duration::minutes(10)));
        assert_eq!(r.snoozed_count, 1);
        assert!(!r.is_spent());
    }

    #[test]
    fn mark_triggered_drops_snooze() {
        let now = Utc::now();
        let mut t = Task::new("t1", "x").with_reminder(ReminderConfig::absolute("r1", now.to_rfc3339()));
        TaskPatch::snooze("r1", now, 5).apply(&mut t);
        TaskPatch::MarkReminderTriggered { reminder_id: "r1".into() }.apply(&mut t);
        assert!(t.reminder("r1").unwrap().is_spent());
    }

    #[test]
    fn patch_on_missing_reminder_is_reported() {
        let mut t = Task::new("t1", "x");
        assert!(!TaskPatch::MarkReminderTriggered { reminder_id: "nope".into() }.apply(&mut t));
        assert!(!TaskPatch::StampGeoTrigger { at: Utc::now() }.apply(&mut t));
    }

    #[test]
    fn rearm_clears_every_reminder() {
        let now = Utc::now();
        let mut fired = ReminderConfig::relative("r1", 15);
        fired.triggered = true;
        let mut t = Task::new("t1", "x")
            .with_reminder(fired)
            .with_reminder(ReminderConfig::absolute("r2", now.to_rfc3339()));
        TaskPatch::snooze("r2", now, 5).apply(&mut t);

        assert!(TaskPatch::RearmReminders.apply(&mut t));
        assert!(t.reminders.iter().all(|r| !r.triggered && r.snoozed_until.is_none()));
        assert_eq!(t.reminder("r2").unwrap().snoozed_count, 1);
    }

    #[test]
    fn restore_puts_back_the_snapshot() {
        let now = Utc::now();
        let mut t = Task::new("t1", "x").with_reminder(ReminderConfig::relative("r1", 15));
        TaskPatch::snooze("r1", now, 5).apply(&mut t);
        let before = t.reminder("r1").unwrap().clone();

        TaskPatch::MarkReminderTriggered { reminder_id: "r1".into() }.apply(&mut t);
        assert!(TaskPatch::RestoreReminder { reminder: before.clone() }.apply(&mut t));
        assert_eq!(t.reminder("r1"), Some(&before));
    }

    #[test]
    fn disabled_or_completed_geo_is_inactive() {
        let mut geo = GeoReminder::new(41.0, 29.0, 200.0, GeoTrigger::Enter);
        let t = Task::new("t1", "x").with_geo(geo.clone());
        assert!(t.active_geo().is_some());
        assert!(t.clone().completed().active_geo().is_none());

        geo.enabled = false;
        assert!(Task::new("t2", "x").with_geo(geo).active_geo().is_none());
    }

    #[test]
    fn reminder_kind_wire_format() {
        let json = r#"{"id":"r1","type":"relative","minutes_before":15}"#;
        let r: ReminderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(r.kind, ReminderKind::Relative { minutes_before: 15 });
        assert!(!r.triggered);
        assert_eq!(r.snoozed_count, 0);
    }
}

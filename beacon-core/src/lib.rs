//! beacon-core: temporal & spatial trigger engine for tasks and notes

pub mod archive;
pub mod engine;
pub mod error;
pub mod geofence;
pub mod ledger;
pub mod notify;
pub mod reminders;
pub mod store;
pub mod task;
pub mod time;

pub use archive::{
    AnalyticsJob, ArchivePhase, ArchiveReport, ArchiveStore, ArchiveTick, ConfigChange, ConfigStore,
    DailyArchiveScheduler, MemoryArchiveStore, MemoryConfigStore, SchedulerConfig, SchedulerConfigPatch,
    select_for_archive,
};
pub use engine::{EngineConfig, PollingLoop, PollingTask, TriggerEngine};
pub use error::{TriggerError, TriggerResult};
pub use geofence::{
    Coordinates, FixedLocation, GeoEvent, GeofenceMonitor, GeofencePolicy, LocationSource,
    MemoryRegionRegistry, RegionRegistry, RegionSpec, haversine_m,
};
pub use ledger::{BUILTIN_REMINDER, DedupLedger, LedgerKey};
pub use notify::{Notification, NotificationPriority, NotificationSink, RecordingSink};
pub use reminders::{FiredKind, FiredReminder, ReminderPolicy, ReminderScheduler, evaluate_task};
pub use store::{MemoryStateStore, MemoryTaskStore, StateStore, TaskStore};
pub use task::{GeoReminder, GeoTrigger, Note, Priority, ReminderConfig, ReminderKind, Task, TaskPatch};
pub use time::{Clock, ManualClock, SystemClock};

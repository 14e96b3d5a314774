use anyhow::Result;
use beacon_core::{
    Clock, DailyArchiveScheduler, DedupLedger, GeofenceMonitor, NotificationSink, ReminderScheduler, SystemClock,
    TriggerEngine,
};
use chrono_tz::Tz;
use std::sync::Arc;

use crate::config::{Config, load_config};
use crate::state::Layout;
use crate::stores::{
    FileLocationSource, JsonArchiveStore, JsonConfigStore, JsonRegionRegistry, JsonStateStore, JsonTaskStore,
    LocalAnalytics, StdoutSink,
};

/// Everything the commands need, wired over the files in one [`Layout`].
pub struct Host {
    pub layout: Layout,
    pub config: Config,
    pub timezone: Tz,
    pub tasks: Arc<JsonTaskStore>,
    pub state: Arc<JsonStateStore>,
    pub archive_store: Arc<JsonArchiveStore>,
    pub regions: Arc<JsonRegionRegistry>,
    pub reminders: Arc<ReminderScheduler>,
    pub geofence: Arc<GeofenceMonitor>,
    pub archive: Arc<DailyArchiveScheduler>,
}

impl Host {
    pub fn open(layout: Layout) -> Result<Self> {
        let config = load_config(&layout.config())?;
        let timezone = config.timezone()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sink: Arc<dyn NotificationSink> = Arc::new(StdoutSink);
        let tasks = Arc::new(JsonTaskStore::new(layout.tasks(), layout.notes()));
        let state = Arc::new(JsonStateStore::open(layout.state())?);
        let archive_store = Arc::new(JsonArchiveStore::new(layout.archive(), state.clone()));
        let regions = Arc::new(JsonRegionRegistry::new(layout.regions()));

        let reminders = ReminderScheduler::new(
            clock.clone(),
            tasks.clone(),
            DedupLedger::new(state.clone()),
            sink.clone(),
        )
        .with_policy(config.reminder_policy());

        let geofence = GeofenceMonitor::new(
            clock.clone(),
            tasks.clone(),
            state.clone(),
            Arc::new(FileLocationSource::new(layout.location())),
            regions.clone(),
            sink.clone(),
        )
        .with_policy(config.geofence_policy());

        let archive = DailyArchiveScheduler::new(
            config.user_id.clone(),
            clock,
            tasks.clone(),
            archive_store.clone(),
            Arc::new(JsonConfigStore::new(layout.scheduler_config())),
            sink,
        )
        .with_timezone(timezone)
        .with_analytics(Arc::new(LocalAnalytics::new(layout.analytics())));

        Ok(Self {
            layout,
            config,
            timezone,
            tasks,
            state,
            archive_store,
            regions,
            reminders: Arc::new(reminders),
            geofence: Arc::new(geofence),
            archive: Arc::new(archive),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn engine(&self) -> TriggerEngine {
        TriggerEngine::new(
            self.reminders.clone(),
            self.geofence.clone(),
            self.archive.clone(),
            self.config.engine(),
        )
    }
}

//! Polling runtime: one tokio task per scheduler, each with its own
//! cancellation token and join handle.
//!
//! Cancellation is only observed between ticks. A tick that has started is
//! always allowed to finish, so stopping never leaves a half-applied pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveTick, ConfigChange, DailyArchiveScheduler, SchedulerConfigPatch};
use crate::error::{TriggerError, TriggerResult};
use crate::geofence::GeofenceMonitor;
use crate::reminders::ReminderScheduler;

/// Intervals and timeouts for the polling loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub reminder_interval: Duration,
    pub geofence_interval: Duration,
    pub archive_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reminder_interval: Duration::from_secs(60),
            geofence_interval: Duration::from_secs(180),
            archive_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Something a polling loop drives. `poll` must swallow and log its own
/// failures; the loop keeps going regardless.
#[async_trait]
pub trait PollingTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn poll(&self);
}

#[async_trait]
impl PollingTask for ReminderScheduler {
    fn name(&self) -> &'static str {
        "reminders"
    }

    async fn poll(&self) {
        match self.tick().await {
            Ok(fired) if !fired.is_empty() => debug!(fired = fired.len(), "reminder tick"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "reminder tick failed"),
        }
    }
}

#[async_trait]
impl PollingTask for GeofenceMonitor {
    fn name(&self) -> &'static str {
        "geofence"
    }

    async fn poll(&self) {
        match self.tick().await {
            Ok(events) if !events.is_empty() => debug!(fired = events.len(), "geofence tick"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "geofence tick failed"),
        }
    }
}

#[async_trait]
impl PollingTask for DailyArchiveScheduler {
    fn name(&self) -> &'static str {
        "archive"
    }

    async fn poll(&self) {
        match self.tick().await {
            Ok(ArchiveTick::Archived(report)) => {
                debug!(date = %report.date, tasks = report.tasks_archived, "archive tick")
            }
            Ok(_) => {}
            Err(e) => warn!(user_id = %self.user_id(), error = %e, "archive tick failed"),
        }
    }
}

/// A running loop.
pub struct PollingLoop {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollingLoop {
    /// Spawn `task` on a fixed `interval`. The first tick runs immediately;
    /// ticks missed while the process was suspended are skipped, not replayed.
    pub fn spawn(task: Arc<dyn PollingTask>, interval: Duration) -> Self {
        let name = task.name();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                task.poll().await;
            }
            debug!(loop_name = name, "polling loop exited");
        });

        info!(loop_name = name, interval_ms = interval.as_millis() as u64, "polling loop started");
        Self { name, cancel, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the in-flight tick to finish.
    pub async fn stop(self, timeout: Duration) -> TriggerResult<()> {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(loop_name = self.name, error = %e, "polling loop panicked");
                Ok(())
            }
            Err(_) => Err(TriggerError::Shutdown {
                name: self.name,
                seconds: timeout.as_secs(),
            }),
        }
    }
}

/// Owns the three schedulers and their loops.
pub struct TriggerEngine {
    reminders: Arc<ReminderScheduler>,
    geofence: Arc<GeofenceMonitor>,
    archive: Arc<DailyArchiveScheduler>,
    config: EngineConfig,
    loops: BTreeMap<&'static str, PollingLoop>,
    running: bool,
}

impl TriggerEngine {
    pub fn new(
        reminders: Arc<ReminderScheduler>,
        geofence: Arc<GeofenceMonitor>,
        archive: Arc<DailyArchiveScheduler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            reminders,
            geofence,
            archive,
            config,
            loops: BTreeMap::new(),
            running: false,
        }
    }

    pub fn reminders(&self) -> &Arc<ReminderScheduler> {
        &self.reminders
    }

    pub fn geofence(&self) -> &Arc<GeofenceMonitor> {
        &self.geofence
    }

    pub fn archive(&self) -> &Arc<DailyArchiveScheduler> {
        &self.archive
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Names of the loops currently spawned.
    pub fn active_loops(&self) -> Vec<&'static str> {
        self.loops.keys().copied().collect()
    }

    pub async fn start(&mut self) -> TriggerResult<()> {
        if self.running {
            return Err(TriggerError::AlreadyRunning);
        }

        // Region state does not survive restarts on most platforms.
        if let Err(e) = self.geofence.replay_regions().await {
            warn!(error = %e, "geofence replay failed, next tick will reconcile");
        }

        self.spawn(self.reminders.clone(), self.config.reminder_interval);
        self.spawn(self.geofence.clone(), self.config.geofence_interval);
        if self.archive_enabled() {
            self.spawn(self.archive.clone(), self.config.archive_interval);
        } else {
            info!("daily archive disabled, loop not started");
        }

        self.running = true;
        info!("trigger engine started");
        Ok(())
    }

    pub async fn stop(&mut self) -> TriggerResult<()> {
        if !self.running {
            return Err(TriggerError::NotRunning);
        }
        self.running = false;

        let mut first_err = None;
        for (_, polling) in std::mem::take(&mut self.loops) {
            if let Err(e) = polling.stop(self.config.shutdown_timeout).await {
                warn!(error = %e, "loop shutdown");
                first_err.get_or_insert(e);
            }
        }
        info!("trigger engine stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Persist a config change and restart the archive loop when `enabled`
    /// flipped. A loop that will not stop in time is left detached; the new
    /// state still applies.
    pub async fn update_archive_config(&mut self, patch: &SchedulerConfigPatch) -> TriggerResult<ConfigChange> {
        let change = self.archive.update_config(patch)?;
        if change.enabled_changed && self.running {
            if let Some(polling) = self.loops.remove(self.archive.name()) {
                if let Err(e) = polling.stop(self.config.shutdown_timeout).await {
                    warn!(error = %e, "old archive loop detached");
                }
            }
            if change.config.enabled {
                self.spawn(self.archive.clone(), self.config.archive_interval);
            }
        }
        Ok(change)
    }

    fn archive_enabled(&self) -> bool {
        match self.archive.config() {
            Ok(config) => config.enabled,
            Err(e) => {
                // Let the loop run; each tick reports the config problem.
                warn!(error = %e, "archive config unreadable");
                true
            }
        }
    }

    fn spawn(&mut self, task: Arc<dyn PollingTask>, interval: Duration) {
        let polling = PollingLoop::spawn(task, interval);
        self.loops.insert(polling.name(), polling);
    }
}

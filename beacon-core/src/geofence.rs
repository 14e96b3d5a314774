//! Geofence monitor: device position -> location-triggered task reminders.
//!
//! Inside/outside presence per task is kept in the [`StateStore`] so edge
//! detection (`enter` / `exit`) survives restarts. The cooldown stamp lives on
//! the task itself (`last_triggered_at`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{TriggerError, TriggerResult};
use crate::notify::{Notification, NotificationPriority, NotificationSink};
use crate::store::{StateStore, TaskStore};
use crate::task::{GeoTrigger, Task, TaskPatch};
use crate::time::Clock;

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const DEFAULT_RADIUS_M: f64 = 200.0;
const PRESENCE_NAMESPACE: &str = "geo";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Great-circle distance in meters (haversine).
pub fn haversine_m(a: Coordinates, b: Coordinates) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Current device position; `Ok(None)` when there is no fix.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn current_position(&self) -> Result<Option<Coordinates>>;
}

/// Platform region registration (OS geofencing). Registrations may outlive
/// the process, so the monitor reads them back before its first reconcile.
#[async_trait]
pub trait RegionRegistry: Send + Sync {
    async fn register_region(&self, region: &RegionSpec) -> Result<()>;
    async fn deregister_region(&self, id: &str) -> Result<()>;
    async fn registered_regions(&self) -> Result<Vec<RegionSpec>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    pub radius: f64,
    pub mode: GeoTrigger,
}

impl RegionSpec {
    fn for_task(task: &Task) -> Option<Self> {
        let geo = task.active_geo()?;
        Some(Self {
            id: task.id.clone(),
            lat: geo.lat,
            lng: geo.lng,
            radius: effective_radius(geo.radius),
            mode: geo.trigger,
        })
    }
}

fn effective_radius(radius: f64) -> f64 {
    if radius > 0.0 { radius } else { DEFAULT_RADIUS_M }
}

#[derive(Debug, Clone, Copy)]
pub struct GeofencePolicy {
    /// Minimum gap between two firings of the same task.
    pub cooldown_minutes: i64,
    /// Upper bound on one location query.
    pub location_timeout: StdDuration,
}

impl Default for GeofencePolicy {
    fn default() -> Self {
        Self {
            cooldown_minutes: 30,
            location_timeout: StdDuration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoEvent {
    pub task_id: String,
    pub trigger: GeoTrigger,
    pub distance_m: f64,
    pub address: Option<String>,
    pub fired_at: DateTime<Utc>,
}

/// Does this observation fire, before cooldown?
///
/// `previous` is the last persisted presence; `None` means first sighting,
/// which only sets the baseline for the edge-triggered modes.
pub fn crosses(trigger: GeoTrigger, previous: Option<bool>, inside: bool) -> bool {
    match trigger {
        GeoTrigger::Enter => previous == Some(false) && inside,
        GeoTrigger::Exit => previous == Some(true) && !inside,
        GeoTrigger::Near => inside,
    }
}

pub fn cooling_down(last: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    last.is_some_and(|last| now - last < cooldown)
}

pub struct GeofenceMonitor {
    clock: Arc<dyn Clock>,
    store: Arc<dyn TaskStore>,
    state: Arc<dyn StateStore>,
    location: Arc<dyn LocationSource>,
    registry: Arc<dyn RegionRegistry>,
    sink: Arc<dyn NotificationSink>,
    policy: GeofencePolicy,
    /// `None` until the platform's table has been read back.
    registered: tokio::sync::Mutex<Option<HashMap<String, RegionSpec>>>,
    last_fix: Mutex<Option<Coordinates>>,
}

impl GeofenceMonitor {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn TaskStore>,
        state: Arc<dyn StateStore>,
        location: Arc<dyn LocationSource>,
        registry: Arc<dyn RegionRegistry>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            clock,
            store,
            state,
            location,
            registry,
            sink,
            policy: GeofencePolicy::default(),
            registered: tokio::sync::Mutex::new(None),
            last_fix: Mutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: GeofencePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Last position the monitor actually evaluated against.
    pub fn last_fix(&self) -> Option<Coordinates> {
        *self.last_fix.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Startup: drop whatever the platform holds for tasks that no longer
    /// want a region, then register every enabled one again.
    pub async fn replay_regions(&self) -> TriggerResult<usize> {
        let tasks = self.store.list_tasks().map_err(TriggerError::Store)?;
        *self.registered.lock().await = None;
        let registered = self.sync_regions(&tasks, true).await;
        info!(registered, "geofence regions replayed");
        Ok(registered)
    }

    /// Bring platform registrations in line with `tasks`. Returns how many
    /// regions are registered afterwards.
    pub async fn reconcile(&self, tasks: &[Task]) -> usize {
        self.sync_regions(tasks, false).await
    }

    async fn sync_regions(&self, tasks: &[Task], force: bool) -> usize {
        let desired: HashMap<String, RegionSpec> = tasks
            .iter()
            .filter_map(RegionSpec::for_task)
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut guard = self.registered.lock().await;
        if guard.is_none() {
            match self.registry.registered_regions().await {
                Ok(existing) => {
                    debug!(count = existing.len(), "platform regions read back");
                    *guard = Some(existing.into_iter().map(|r| (r.id.clone(), r)).collect());
                }
                Err(e) => {
                    warn!(error = %e, "could not list platform regions, retrying next pass");
                    return 0;
                }
            }
        }
        let Some(registered) = guard.as_mut() else {
            return 0;
        };

        let stale: Vec<String> = registered
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            match self.registry.deregister_region(&id).await {
                Ok(()) => {
                    registered.remove(&id);
                    if let Err(e) = self.state.remove(&presence_key(&id)) {
                        warn!(task_id = %id, error = %e, "could not clear geofence presence");
                    }
                    debug!(task_id = %id, "region deregistered");
                }
                Err(e) => warn!(task_id = %id, error = %e, "region deregistration failed"),
            }
        }

        for (id, spec) in desired {
            if !force && registered.get(&id) == Some(&spec) {
                continue;
            }
            match self.registry.register_region(&spec).await {
                Ok(()) => {
                    debug!(task_id = %id, mode = %spec.mode, radius = spec.radius, "region registered");
                    registered.insert(id, spec);
                }
                Err(e) => warn!(task_id = %id, error = %e, "region registration failed"),
            }
        }

        registered.len()
    }

    /// One polling pass.
    pub async fn tick(&self) -> TriggerResult<Vec<GeoEvent>> {
        let tasks = self.store.list_tasks().map_err(TriggerError::Store)?;
        self.reconcile(&tasks).await;

        let active: Vec<&Task> = tasks.iter().filter(|t| t.active_geo().is_some()).collect();
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let position = match self.position().await {
            Ok(Some(position)) => position,
            Ok(None) => {
                debug!("no location fix, skipping tick");
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!(error = %e, "skipping geofence tick");
                return Ok(Vec::new());
            }
        };
        *self.last_fix.lock().unwrap_or_else(PoisonError::into_inner) = Some(position);

        let now = self.clock.now();
        let mut events = Vec::new();
        for task in active {
            match self.evaluate(task, position, now).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "geofence evaluation failed"),
            }
        }
        Ok(events)
    }

    /// Bounded location query.
    async fn position(&self) -> TriggerResult<Option<Coordinates>> {
        let timeout = self.policy.location_timeout;
        match tokio::time::timeout(timeout, self.location.current_position()).await {
            Ok(Ok(position)) => Ok(position),
            Ok(Err(e)) => Err(TriggerError::Location(format!("{e:#}"))),
            Err(_) => Err(TriggerError::Location(format!(
                "no answer within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn evaluate(&self, task: &Task, position: Coordinates, now: DateTime<Utc>) -> TriggerResult<Option<GeoEvent>> {
        let Some(geo) = task.active_geo() else {
            return Ok(None);
        };

        let distance = haversine_m(position, Coordinates::new(geo.lat, geo.lng));
        let inside = distance <= effective_radius(geo.radius);

        let key = presence_key(&task.id);
        let previous = self.state.flag(&key).map_err(TriggerError::State)?;
        let edge = crosses(geo.trigger, previous, inside);
        let suppressed = edge
            && cooling_down(
                geo.last_triggered_at,
                now,
                Duration::minutes(self.policy.cooldown_minutes),
            );

        if !edge || suppressed {
            if suppressed {
                debug!(task_id = %task.id, "geofence trigger suppressed by cooldown");
            }
            if previous != Some(inside) {
                self.state.set_flag(&key, inside).map_err(TriggerError::State)?;
            }
            return Ok(None);
        }

        // Presence moves only once the firing is stamped; a failed stamp
        // leaves the edge in place for the next tick.
        self.store
            .update_task(&task.id, TaskPatch::StampGeoTrigger { at: now })
            .map_err(TriggerError::Store)?;
        if previous != Some(inside) {
            if let Err(e) = self.state.set_flag(&key, inside) {
                warn!(task_id = %task.id, error = %e, "could not store geofence presence");
            }
        }

        let title = match geo.trigger {
            GeoTrigger::Enter => "Arrived near task location",
            GeoTrigger::Exit => "Left task location",
            GeoTrigger::Near => "Task nearby",
        };
        let body = match geo.address.as_deref() {
            Some(address) => format!("{} ({address})", task.text),
            None => task.text.clone(),
        };
        if let Err(e) = self
            .sink
            .notify(Notification::new(title, body, NotificationPriority::Normal))
            .await
        {
            warn!(task_id = %task.id, error = %e, "notification delivery failed");
        }

        info!(task_id = %task.id, trigger = %geo.trigger, distance_m = distance.round(), "geofence fired");
        Ok(Some(GeoEvent {
            task_id: task.id.clone(),
            trigger: geo.trigger,
            distance_m: distance,
            address: geo.address.clone(),
            fired_at: now,
        }))
    }
}

fn presence_key(task_id: &str) -> String {
    format!("{PRESENCE_NAMESPACE}:{task_id}")
}

/// Always reports the same position (or none).
#[derive(Debug, Default)]
pub struct FixedLocation {
    position: Mutex<Option<Coordinates>>,
}

impl FixedLocation {
    pub fn new(position: Option<Coordinates>) -> Self {
        Self {
            position: Mutex::new(position),
        }
    }

    pub fn set(&self, position: Option<Coordinates>) {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner) = position;
    }
}

#[async_trait]
impl LocationSource for FixedLocation {
    async fn current_position(&self) -> Result<Option<Coordinates>> {
        Ok(*self.position.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// In-memory region table standing in for the platform service.
#[derive(Debug, Default)]
pub struct MemoryRegionRegistry {
    regions: Mutex<HashMap<String, RegionSpec>>,
}

impl MemoryRegionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regions(&self) -> HashMap<String, RegionSpec> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl RegionRegistry for MemoryRegionRegistry {
    async fn register_region(&self, region: &RegionSpec) -> Result<()> {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(region.id.clone(), region.clone());
        Ok(())
    }

    async fn deregister_region(&self, id: &str) -> Result<()> {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    async fn registered_regions(&self) -> Result<Vec<RegionSpec>> {
        Ok(self.regions().into_values().collect())
    }
}

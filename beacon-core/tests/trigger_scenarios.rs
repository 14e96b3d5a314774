use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use beacon_core::{
    AnalyticsJob, ArchiveStore, ArchiveTick, Coordinates, DailyArchiveScheduler, DedupLedger, EngineConfig,
    FiredKind, FixedLocation, GeoReminder, GeoTrigger, GeofenceMonitor, LocationSource, ManualClock,
    MemoryArchiveStore, MemoryConfigStore, MemoryRegionRegistry, MemoryStateStore, MemoryTaskStore, Note,
    NotificationPriority, RecordingSink, ReminderConfig, ReminderScheduler, SchedulerConfig, SchedulerConfigPatch,
    Task, TaskStore, TriggerEngine, TriggerError,
};

const USER: &str = "ada";
const HOME: Coordinates = Coordinates { lat: 52.5200, lng: 13.4050 };

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 15, h, m, s).unwrap()
}

fn north_of(c: Coordinates, meters: f64) -> Coordinates {
    Coordinates::new(c.lat + (meters / 6_371_000.0_f64).to_degrees(), c.lng)
}

fn reminders(clock: &Arc<ManualClock>, store: &Arc<MemoryTaskStore>, state: &Arc<MemoryStateStore>) -> ReminderScheduler {
    ReminderScheduler::new(
        clock.clone(),
        store.clone(),
        DedupLedger::new(state.clone()),
        Arc::new(RecordingSink::new()),
    )
}

fn geofence(clock: &Arc<ManualClock>, store: &Arc<MemoryTaskStore>, location: Arc<dyn LocationSource>) -> GeofenceMonitor {
    GeofenceMonitor::new(
        clock.clone(),
        store.clone(),
        Arc::new(MemoryStateStore::new()),
        location,
        Arc::new(MemoryRegionRegistry::new()),
        Arc::new(RecordingSink::new()),
    )
}

fn archive_config(time: &str, analysis: bool) -> SchedulerConfig {
    SchedulerConfig {
        archive_time: time.to_string(),
        enable_ai_analysis: analysis,
        ..SchedulerConfig::default()
    }
}

#[tokio::test]
async fn relative_reminder_fires_once_across_tolerance_window() {
    let clock = Arc::new(ManualClock::new(at(13, 44, 10)));
    let store = Arc::new(MemoryTaskStore::new(
        vec![Task::new("t1", "call the plumber")
            .scheduled(at(14, 0, 0))
            .with_reminder(ReminderConfig::relative("r1", 15))],
        vec![],
    ));
    let state = Arc::new(MemoryStateStore::new());
    let scheduler = reminders(&clock, &store, &state);

    let mut explicit = 0;
    for _ in 0..4 {
        explicit += scheduler
            .tick()
            .await
            .unwrap()
            .iter()
            .filter(|f| f.reminder_id == "r1")
            .count();
        clock.advance(Duration::seconds(30));
    }
    assert_eq!(explicit, 1);
}

#[tokio::test]
async fn snooze_produces_exactly_one_more_event() {
    let clock = Arc::new(ManualClock::new(at(9, 0, 0)));
    let store = Arc::new(MemoryTaskStore::new(
        vec![Task::new("t1", "stretch").with_reminder(ReminderConfig::absolute("r1", at(9, 0, 0).to_rfc3339()))],
        vec![],
    ));
    let state = Arc::new(MemoryStateStore::new());
    let scheduler = reminders(&clock, &store, &state);

    assert_eq!(scheduler.tick().await.unwrap().len(), 1);
    let until = scheduler.snooze("t1", "r1", 10).unwrap();
    assert_eq!(until, at(9, 10, 0));

    let snoozed = store.task("t1").unwrap().reminders[0].clone();
    assert!(!snoozed.triggered);
    assert_eq!(snoozed.snoozed_count, 1);

    clock.advance(Duration::minutes(5));
    assert!(scheduler.tick().await.unwrap().is_empty());

    clock.advance(Duration::minutes(5));
    let refired = scheduler.tick().await.unwrap();
    assert_eq!(refired.len(), 1);
    assert_eq!(refired[0].kind, FiredKind::Snoozed);

    for _ in 0..3 {
        clock.advance(Duration::minutes(1));
        assert!(scheduler.tick().await.unwrap().is_empty());
    }
    let spent = store.task("t1").unwrap().reminders[0].clone();
    assert!(spent.triggered);
    assert!(spent.snoozed_until.is_none());
}

#[tokio::test]
async fn ledger_survives_scheduler_restart() {
    let clock = Arc::new(ManualClock::new(at(13, 50, 0)));
    let store = Arc::new(MemoryTaskStore::new(
        vec![Task::new("t1", "standup").scheduled(at(14, 0, 0))],
        vec![],
    ));
    let state = Arc::new(MemoryStateStore::new());

    assert_eq!(reminders(&clock, &store, &state).tick().await.unwrap().len(), 1);

    clock.advance(Duration::minutes(1));
    let restarted = reminders(&clock, &store, &state);
    assert!(restarted.tick().await.unwrap().is_empty());
}

#[tokio::test]
async fn enter_and_exit_each_fire_once_over_a_trace() {
    let clock = Arc::new(ManualClock::new(at(8, 0, 0)));
    let store = Arc::new(MemoryTaskStore::new(
        vec![
            Task::new("arrive", "pick up parcel").with_geo(GeoReminder::new(HOME.lat, HOME.lng, 200.0, GeoTrigger::Enter)),
            Task::new("leave", "take keys").with_geo(GeoReminder::new(HOME.lat, HOME.lng, 200.0, GeoTrigger::Exit)),
        ],
        vec![],
    ));
    let location = Arc::new(FixedLocation::new(None));
    let monitor = geofence(&clock, &store, location.clone());

    // Outside, enter, five more ticks inside, exit.
    let trace = [800.0, 50.0, 60.0, 40.0, 20.0, 90.0, 120.0, 900.0];

    let mut events = Vec::new();
    for (tick, meters) in trace.into_iter().enumerate() {
        location.set(Some(north_of(HOME, meters)));
        for e in monitor.tick().await.unwrap() {
            events.push((tick, e.task_id, e.trigger));
        }
        clock.advance(Duration::minutes(3));
    }

    assert_eq!(
        events,
        vec![
            (1, "arrive".to_string(), GeoTrigger::Enter),
            (7, "leave".to_string(), GeoTrigger::Exit),
        ]
    );
}

#[tokio::test]
async fn scenario_reminder_geofence_and_archive() {
    // T1: relative reminder 15 minutes before 14:00.
    let clock = Arc::new(ManualClock::new(at(13, 45, 30)));
    let store = Arc::new(MemoryTaskStore::new(
        vec![Task::new("T1", "quarterly review")
            .scheduled(at(14, 0, 0))
            .with_reminder(ReminderConfig::relative("r1", 15))],
        vec![],
    ));
    let state = Arc::new(MemoryStateStore::new());
    let scheduler = reminders(&clock, &store, &state);

    let first = scheduler.tick().await.unwrap();
    assert_eq!(first.iter().filter(|f| f.reminder_id == "r1").count(), 1);
    clock.set(at(13, 46, 30));
    let second = scheduler.tick().await.unwrap();
    assert_eq!(second.iter().filter(|f| f.reminder_id == "r1").count(), 0);

    // T2: enter-mode geofence, trace 300m, 150m, 150m, 250m.
    let store = Arc::new(MemoryTaskStore::new(
        vec![Task::new("T2", "drop off library books")
            .with_geo(GeoReminder::new(HOME.lat, HOME.lng, 200.0, GeoTrigger::Enter))],
        vec![],
    ));
    let location = Arc::new(FixedLocation::new(None));
    let monitor = geofence(&clock, &store, location.clone());

    let mut fired_on = Vec::new();
    for (tick, meters) in [300.0, 150.0, 150.0, 250.0].into_iter().enumerate() {
        location.set(Some(north_of(HOME, meters)));
        if !monitor.tick().await.unwrap().is_empty() {
            fired_on.push(tick + 1);
        }
        clock.advance(Duration::minutes(3));
    }
    assert_eq!(fired_on, vec![2]);

    // Archive at 00:00, completed only: 3 completed, 2 active.
    let store = Arc::new(MemoryTaskStore::new(
        vec![
            Task::new("c1", "a").completed(),
            Task::new("c2", "b").completed(),
            Task::new("c3", "c").completed(),
            Task::new("a1", "d"),
            Task::new("a2", "e"),
        ],
        vec![],
    ));
    let archive = Arc::new(MemoryArchiveStore::new());
    let daily = DailyArchiveScheduler::new(
        USER,
        clock.clone(),
        store.clone(),
        archive.clone(),
        Arc::new(MemoryConfigStore::with_config(USER, archive_config("00:00", false))),
        Arc::new(RecordingSink::new()),
    );

    assert!(matches!(daily.tick().await.unwrap(), ArchiveTick::Archived(_)));
    let mut left: Vec<String> = store.list_tasks().unwrap().into_iter().map(|t| t.id).collect();
    left.sort();
    assert_eq!(left, vec!["a1", "a2"]);
    assert_eq!(archive.archived_tasks(USER).await.unwrap().len(), 3);
    assert_eq!(archive.writes(USER), 1);
}

#[tokio::test]
async fn daily_archive_is_idempotent_within_a_day() {
    let clock = Arc::new(ManualClock::new(at(0, 1, 0)));
    let store = Arc::new(MemoryTaskStore::new(
        vec![Task::new("done", "renew passport").completed()],
        vec![Note::new("n1", "gate code 4411")],
    ));
    let archive = Arc::new(MemoryArchiveStore::new());
    let daily = DailyArchiveScheduler::new(
        USER,
        clock.clone(),
        store.clone(),
        archive.clone(),
        Arc::new(MemoryConfigStore::with_config(USER, archive_config("00:00", false))),
        Arc::new(RecordingSink::new()),
    );

    assert!(matches!(daily.tick().await.unwrap(), ArchiveTick::Archived(_)));
    // The host puts a completed task back; the marker still blocks today.
    store.insert_task(Task::new("late", "late finish").completed());
    clock.advance(Duration::minutes(1));
    assert!(matches!(daily.tick().await.unwrap(), ArchiveTick::AlreadyArchived(_)));

    assert_eq!(archive.writes(USER), 1);
    assert!(store.task("late").is_some());

    clock.advance(Duration::days(1));
    assert!(matches!(daily.tick().await.unwrap(), ArchiveTick::Archived(_)));
    assert_eq!(archive.writes(USER), 2);
}

#[tokio::test]
async fn first_tick_after_downtime_runs_the_pass() {
    let clock = Arc::new(ManualClock::new(at(15, 30, 0)));
    let archive = Arc::new(MemoryArchiveStore::new());
    archive
        .set_last_archive_date(USER, NaiveDate::from_ymd_opt(2026, 6, 14).unwrap())
        .await
        .unwrap();
    let daily = DailyArchiveScheduler::new(
        USER,
        clock,
        Arc::new(MemoryTaskStore::new(vec![Task::new("done", "x").completed()], vec![])),
        archive.clone(),
        Arc::new(MemoryConfigStore::with_config(USER, archive_config("09:00", false))),
        Arc::new(RecordingSink::new()),
    );

    let ArchiveTick::Archived(report) = daily.tick().await.unwrap() else {
        panic!("expected the missed pass to run");
    };
    assert_eq!(report.date, NaiveDate::from_ymd_opt(2026, 6, 15).unwrap());
    assert_eq!(
        archive.last_archive_date(USER).await.unwrap(),
        NaiveDate::from_ymd_opt(2026, 6, 15)
    );
}

/// Archive store that can be told to reject writes.
#[derive(Default)]
struct FlakyArchive {
    inner: MemoryArchiveStore,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

#[async_trait]
impl ArchiveStore for FlakyArchive {
    async fn archive(&self, tasks: &[Task], notes: &[Note], user_id: &str) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("archive backend unavailable");
        }
        self.inner.archive(tasks, notes, user_id).await
    }

    async fn archived_tasks(&self, user_id: &str) -> Result<Vec<Task>> {
        self.inner.archived_tasks(user_id).await
    }

    async fn last_archive_date(&self, user_id: &str) -> Result<Option<NaiveDate>> {
        self.inner.last_archive_date(user_id).await
    }

    async fn set_last_archive_date(&self, user_id: &str, date: NaiveDate) -> Result<()> {
        self.inner.set_last_archive_date(user_id, date).await
    }
}

#[tokio::test]
async fn failed_archive_write_changes_nothing_and_retries() {
    let clock = Arc::new(ManualClock::new(at(1, 0, 0)));
    let store = Arc::new(MemoryTaskStore::new(
        vec![Task::new("done", "x").completed(), Task::new("open", "y")],
        vec![],
    ));
    let archive = Arc::new(FlakyArchive::default());
    archive.failing.store(true, Ordering::SeqCst);
    let sink = Arc::new(RecordingSink::new());
    let daily = DailyArchiveScheduler::new(
        USER,
        clock.clone(),
        store.clone(),
        archive.clone(),
        Arc::new(MemoryConfigStore::with_config(USER, archive_config("00:00", false))),
        sink.clone(),
    );

    let err = daily.tick().await.unwrap_err();
    assert!(matches!(err, TriggerError::ArchiveWrite(_)));
    assert_eq!(store.list_tasks().unwrap().len(), 2);
    assert_eq!(daily.last_archive_date().await.unwrap(), None);

    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].priority, NotificationPriority::High);

    archive.failing.store(false, Ordering::SeqCst);
    clock.advance(Duration::minutes(1));
    assert!(matches!(daily.tick().await.unwrap(), ArchiveTick::Archived(_)));
    assert_eq!(archive.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(store.list_tasks().unwrap().len(), 1);
}

struct BrokenAnalytics;

#[async_trait]
impl AnalyticsJob for BrokenAnalytics {
    async fn analyze(&self, _tasks: Vec<Task>, _user_id: &str) -> Result<()> {
        bail!("model quota exhausted")
    }
}

#[derive(Default)]
struct CapturingAnalytics {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl AnalyticsJob for CapturingAnalytics {
    async fn analyze(&self, tasks: Vec<Task>, _user_id: &str) -> Result<()> {
        let mut seen = self.seen.lock().unwrap();
        seen.extend(tasks.into_iter().map(|t| t.id));
        Ok(())
    }
}

#[tokio::test]
async fn analytics_failure_keeps_the_archive_commit() {
    let archive = Arc::new(MemoryArchiveStore::new());
    let store = Arc::new(MemoryTaskStore::new(vec![Task::new("done", "x").completed()], vec![]));
    let daily = DailyArchiveScheduler::new(
        USER,
        Arc::new(ManualClock::new(at(2, 0, 0))),
        store.clone(),
        archive.clone(),
        Arc::new(MemoryConfigStore::with_config(USER, archive_config("00:00", true))),
        Arc::new(RecordingSink::new()),
    )
    .with_analytics(Arc::new(BrokenAnalytics));

    let ArchiveTick::Archived(report) = daily.tick().await.unwrap() else {
        panic!("expected a pass");
    };
    report.analytics.expect("analytics spawned").await.unwrap();

    assert_eq!(archive.writes(USER), 1);
    assert!(store.list_tasks().unwrap().is_empty());
    assert!(daily.last_archive_date().await.unwrap().is_some());
}

#[tokio::test]
async fn analytics_sees_history_plus_batch() {
    let archive = Arc::new(MemoryArchiveStore::new());
    archive
        .archive(&[Task::new("old", "last week").completed()], &[], USER)
        .await
        .unwrap();
    let analytics = Arc::new(CapturingAnalytics::default());
    let daily = DailyArchiveScheduler::new(
        USER,
        Arc::new(ManualClock::new(at(2, 0, 0))),
        Arc::new(MemoryTaskStore::new(vec![Task::new("new", "today").completed()], vec![])),
        archive,
        Arc::new(MemoryConfigStore::with_config(USER, archive_config("00:00", true))),
        Arc::new(RecordingSink::new()),
    )
    .with_analytics(analytics.clone());

    let ArchiveTick::Archived(report) = daily.tick().await.unwrap() else {
        panic!("expected a pass");
    };
    report.analytics.expect("analytics spawned").await.unwrap();

    let mut seen = analytics.seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["new", "old"]);
}

struct Rig {
    sink: Arc<RecordingSink>,
    engine: TriggerEngine,
}

fn rig(tasks: Vec<Task>, location: Arc<dyn LocationSource>, archive_enabled: bool, config: EngineConfig) -> Rig {
    let schedule = SchedulerConfig {
        enabled: archive_enabled,
        archive_time: "23:59".into(),
        ..SchedulerConfig::default()
    };
    rig_with_archive(tasks, location, Arc::new(MemoryArchiveStore::new()), schedule, config)
}

fn rig_with_archive(
    tasks: Vec<Task>,
    location: Arc<dyn LocationSource>,
    archive_store: Arc<dyn ArchiveStore>,
    schedule: SchedulerConfig,
    config: EngineConfig,
) -> Rig {
    let clock = Arc::new(ManualClock::new(at(9, 0, 0)));
    let store = Arc::new(MemoryTaskStore::new(tasks, vec![]));
    let sink = Arc::new(RecordingSink::new());

    let reminders = ReminderScheduler::new(
        clock.clone(),
        store.clone(),
        DedupLedger::new(Arc::new(MemoryStateStore::new())),
        sink.clone(),
    );
    let geofence = GeofenceMonitor::new(
        clock.clone(),
        store.clone(),
        Arc::new(MemoryStateStore::new()),
        location,
        Arc::new(MemoryRegionRegistry::new()),
        sink.clone(),
    );
    let archive = DailyArchiveScheduler::new(
        USER,
        clock,
        store,
        archive_store,
        Arc::new(MemoryConfigStore::with_config(USER, schedule)),
        sink.clone(),
    );

    Rig {
        sink,
        engine: TriggerEngine::new(Arc::new(reminders), Arc::new(geofence), Arc::new(archive), config),
    }
}

fn fast() -> EngineConfig {
    EngineConfig {
        reminder_interval: StdDuration::from_millis(10),
        geofence_interval: StdDuration::from_millis(10),
        archive_interval: StdDuration::from_millis(10),
        shutdown_timeout: StdDuration::from_secs(1),
    }
}

#[tokio::test]
async fn engine_lifecycle_and_archive_toggle() {
    let mut rig = rig(vec![], Arc::new(FixedLocation::new(None)), false, fast());

    assert!(matches!(rig.engine.stop().await, Err(TriggerError::NotRunning)));
    rig.engine.start().await.unwrap();
    assert!(matches!(rig.engine.start().await, Err(TriggerError::AlreadyRunning)));
    assert_eq!(rig.engine.active_loops(), vec!["geofence", "reminders"]);

    let change = rig
        .engine
        .update_archive_config(&SchedulerConfigPatch {
            enabled: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(change.enabled_changed);
    assert_eq!(rig.engine.active_loops(), vec!["archive", "geofence", "reminders"]);

    rig.engine
        .update_archive_config(&SchedulerConfigPatch {
            enabled: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rig.engine.active_loops(), vec!["geofence", "reminders"]);

    rig.engine.stop().await.unwrap();
    assert!(!rig.engine.is_running());
    assert!(rig.engine.active_loops().is_empty());
}

struct HangingLocation;

#[async_trait]
impl LocationSource for HangingLocation {
    async fn current_position(&self) -> Result<Option<Coordinates>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn hung_location_does_not_stall_reminders() {
    let tasks = vec![
        Task::new("geo", "buy stamps").with_geo(GeoReminder::new(HOME.lat, HOME.lng, 100.0, GeoTrigger::Near)),
        Task::new("t1", "morning pills").with_reminder(ReminderConfig::absolute("r1", at(9, 0, 0).to_rfc3339())),
    ];
    let mut config = fast();
    config.shutdown_timeout = StdDuration::from_millis(50);
    let mut rig = rig(tasks, Arc::new(HangingLocation), false, config);

    rig.engine.start().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(100)).await;

    let sent = rig.sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, "morning pills");

    let err = rig.engine.stop().await.unwrap_err();
    assert!(matches!(err, TriggerError::Shutdown { name: "geofence", .. }));
}

/// Archive backend whose writes never return.
struct StuckArchive;

#[async_trait]
impl ArchiveStore for StuckArchive {
    async fn archive(&self, _tasks: &[Task], _notes: &[Note], _user_id: &str) -> Result<()> {
        std::future::pending().await
    }

    async fn archived_tasks(&self, _user_id: &str) -> Result<Vec<Task>> {
        Ok(Vec::new())
    }

    async fn last_archive_date(&self, _user_id: &str) -> Result<Option<NaiveDate>> {
        Ok(None)
    }

    async fn set_last_archive_date(&self, _user_id: &str, _date: NaiveDate) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn archive_toggle_applies_even_when_old_loop_is_stuck() {
    let mut config = fast();
    config.shutdown_timeout = StdDuration::from_millis(50);
    let schedule = SchedulerConfig {
        enabled: true,
        archive_time: "00:00".into(),
        ..SchedulerConfig::default()
    };
    let mut rig = rig_with_archive(
        vec![Task::new("done", "file taxes").completed()],
        Arc::new(FixedLocation::new(None)),
        Arc::new(StuckArchive),
        schedule,
        config,
    );

    rig.engine.start().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let off = rig
        .engine
        .update_archive_config(&SchedulerConfigPatch {
            enabled: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(off.enabled_changed && !off.config.enabled);
    assert_eq!(rig.engine.active_loops(), vec!["geofence", "reminders"]);

    rig.engine
        .update_archive_config(&SchedulerConfigPatch {
            enabled: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rig.engine.active_loops(), vec!["archive", "geofence", "reminders"]);

    // The detached pass still holds the in-flight guard, so the new loop idles.
    rig.engine.stop().await.unwrap();
}

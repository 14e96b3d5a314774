use anyhow::{Context, Result};
use beacon_core::time::parse_timezone;
use beacon_core::{EngineConfig, GeofencePolicy, ReminderPolicy};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub user_id: String,
    /// IANA name, e.g. "Europe/Berlin".
    pub timezone: String,
    pub engine: EngineSection,
    pub reminders: ReminderSection,
    pub geofence: GeofenceSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub reminder_interval_secs: u64,
    pub geofence_interval_secs: u64,
    pub archive_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderSection {
    pub lookahead_minutes: i64,
    pub tolerance_seconds: i64,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceSection {
    pub cooldown_minutes: i64,
    pub location_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: "local".to_string(),
            timezone: "UTC".to_string(),
            engine: EngineSection::default(),
            reminders: ReminderSection::default(),
            geofence: GeofenceSection::default(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        let d = EngineConfig::default();
        Self {
            reminder_interval_secs: d.reminder_interval.as_secs(),
            geofence_interval_secs: d.geofence_interval.as_secs(),
            archive_interval_secs: d.archive_interval.as_secs(),
            shutdown_timeout_secs: d.shutdown_timeout.as_secs(),
        }
    }
}

impl Default for ReminderSection {
    fn default() -> Self {
        let d = ReminderPolicy::default();
        Self {
            lookahead_minutes: d.lookahead_minutes,
            tolerance_seconds: d.tolerance_seconds,
            notify: d.notify,
        }
    }
}

impl Default for GeofenceSection {
    fn default() -> Self {
        let d = GeofencePolicy::default();
        Self {
            cooldown_minutes: d.cooldown_minutes,
            location_timeout_secs: d.location_timeout.as_secs(),
        }
    }
}

impl Config {
    pub fn timezone(&self) -> Result<Tz> {
        parse_timezone(&self.timezone).context("config.toml timezone")
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            reminder_interval: Duration::from_secs(self.engine.reminder_interval_secs),
            geofence_interval: Duration::from_secs(self.engine.geofence_interval_secs),
            archive_interval: Duration::from_secs(self.engine.archive_interval_secs),
            shutdown_timeout: Duration::from_secs(self.engine.shutdown_timeout_secs),
        }
    }

    pub fn reminder_policy(&self) -> ReminderPolicy {
        ReminderPolicy {
            lookahead_minutes: self.reminders.lookahead_minutes,
            tolerance_seconds: self.reminders.tolerance_seconds,
            notify: self.reminders.notify,
        }
    }

    pub fn geofence_policy(&self) -> GeofencePolicy {
        GeofencePolicy {
            cooldown_minutes: self.geofence.cooldown_minutes,
            location_timeout: Duration::from_secs(self.geofence.location_timeout_secs),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&s).context("parse config.toml")
}

pub fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg).context("serialize config")?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config already exists: {}", path.display());
        return Ok(());
    }
    save_config(path, &Config::default())?;
    println!("Wrote {}", path.display());
    Ok(())
}

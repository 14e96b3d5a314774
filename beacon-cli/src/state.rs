use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// `$BEACON_HOME`, or `~/.beacon`.
pub fn beacon_home() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("BEACON_HOME") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".beacon"))
}

pub fn ensure_beacon_home() -> Result<PathBuf> {
    let dir = beacon_home()?;
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

/// File layout under the beacon home directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn discover() -> Result<Self> {
        Ok(Self::new(ensure_beacon_home()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    pub fn notes(&self) -> PathBuf {
        self.root.join("notes.json")
    }

    pub fn state(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn archive(&self) -> PathBuf {
        self.root.join("archive.json")
    }

    pub fn regions(&self) -> PathBuf {
        self.root.join("regions.json")
    }

    pub fn location(&self) -> PathBuf {
        self.root.join("location.json")
    }

    pub fn analytics(&self) -> PathBuf {
        self.root.join("analytics.json")
    }

    pub fn scheduler_config(&self) -> PathBuf {
        self.root.join("scheduler_config.json")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }
}

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub model_dir: Option<PathBuf>,
    pub transcript_dir: Option<PathBuf>,
    pub default_model: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub require_accelerator: Option<bool>,
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub model_dir: Option<PathBuf>,
    pub transcript_dir: Option<PathBuf>,
    pub default_model: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub require_accelerator: Option<bool>,
}

/// Settings with every default filled in against a data dir.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Resolved {
    pub model_dir: PathBuf,
    pub transcript_dir: PathBuf,
    pub default_model: String,
    pub poll_interval: Duration,
    pub require_accelerator: bool,
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let p = settings_path(data_dir);
    if !p.exists() {
        return Ok(Settings::default());
    }
    let s = fs::read_to_string(&p).context("read settings.json failed")?;
    serde_json::from_str(&s).context("parse settings.json failed")
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    fs::create_dir_all(data_dir).context("create data dir failed")?;
    let s = serde_json::to_string_pretty(settings).context("serialize settings failed")?;
    fs::write(settings_path(data_dir), s).context("write settings.json failed")?;
    Ok(())
}

impl Settings {
    pub fn apply(&mut self, patch: SettingsPatch) -> Result<()> {
        if let Some(m) = patch.default_model.as_deref() {
            if catalog::lookup(m).is_none() {
                let known: Vec<_> = catalog::names().collect();
                return Err(anyhow!("unknown model: {m} (known: {})", known.join(", ")));
            }
        }
        if patch.poll_interval_ms == Some(0) {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if patch.model_dir.is_some() {
            self.model_dir = patch.model_dir;
        }
        if patch.transcript_dir.is_some() {
            self.transcript_dir = patch.transcript_dir;
        }
        if patch.default_model.is_some() {
            self.default_model = patch.default_model;
        }
        if patch.poll_interval_ms.is_some() {
            self.poll_interval_ms = patch.poll_interval_ms;
        }
        if patch.require_accelerator.is_some() {
            self.require_accelerator = patch.require_accelerator;
        }
        Ok(())
    }

    pub fn resolve(&self, data_dir: &Path) -> Resolved {
        Resolved {
            model_dir: self
                .model_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("models")),
            transcript_dir: self
                .transcript_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("transcripts")),
            default_model: self
                .default_model
                .clone()
                .unwrap_or_else(|| catalog::DEFAULT_MODEL.to_string()),
            poll_interval: Duration::from_millis(
                self.poll_interval_ms
                    .filter(|ms| *ms > 0)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            require_accelerator: self.require_accelerator.unwrap_or(true),
        }
    }
}

use crate::{
    api::{DEFAULT_BASE_URL, DEFAULT_GENERATION_TIMEOUT, DEFAULT_REQUEST_TIMEOUT},
    app::APP_ID,
    env_flags,
    model::{GenerationParameters, Scheduler},
    notify::DEFAULT_SUCCESS_DISMISS,
    poller::DEFAULT_POLL_INTERVAL,
};
use anyhow::{anyhow, Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug)]
pub struct ConfigStore {
    root_dir: PathBuf,
    config_dir: PathBuf,
    output_dir: PathBuf,
    settings: RwLock<StudioSettings>,
}

impl ConfigStore {
    pub fn new() -> Result<Self> {
        let base = BaseDirs::new()
            .ok_or_else(|| anyhow!("unable to resolve base directories for {APP_ID}"))?;
        Self::with_root(base.data_local_dir().join(APP_ID))
    }

    pub fn with_root(root_dir: PathBuf) -> Result<Self> {
        let config_dir = root_dir.join("config");
        let output_dir = root_dir.join("outputs");

        fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed to create config directory {config_dir:?}"))?;

        fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create output directory {output_dir:?}"))?;

        let settings_path = config_dir.join(SETTINGS_FILE);
        let settings = if settings_path.exists() {
            let data = fs::read(&settings_path)
                .with_context(|| format!("failed to read settings file {settings_path:?}"))?;
            serde_json::from_slice(&data)
                .with_context(|| format!("failed to parse settings from {settings_path:?}"))?
        } else {
            StudioSettings::default()
        };

        Ok(Self {
            root_dir,
            config_dir,
            output_dir,
            settings: RwLock::new(settings),
        })
    }

    /// Persisted settings with environment overrides applied.
    pub fn settings(&self) -> StudioSettings {
        let mut settings = self
            .settings
            .read()
            .expect("settings lock poisoned")
            .clone();
        if let Some(url) = env_flags::api_url_override() {
            settings.api_base_url = url;
        }
        settings
    }

    pub fn update_settings<F>(&self, mutate: F) -> Result<StudioSettings>
    where
        F: FnOnce(&mut StudioSettings),
    {
        let mut guard = self
            .settings
            .write()
            .expect("settings lock poisoned for write");
        mutate(&mut guard);
        let snapshot = guard.clone();
        self.persist_locked(&snapshot)?;
        Ok(snapshot)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.clone()
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.clone()
    }

    pub fn root_path(&self) -> &Path {
        &self.root_dir
    }

    fn persist_locked(&self, settings: &StudioSettings) -> Result<()> {
        let path = self.config_path().join(SETTINGS_FILE);
        let data = serde_json::to_vec_pretty(settings)?;
        fs::write(&path, data).with_context(|| format!("failed to write settings to {path:?}"))?;
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct StudioSettings {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub generation_timeout_secs: u64,
    pub device_poll_interval_secs: u64,
    pub success_dismiss_ms: u64,
    pub history_limit: usize,
    pub generation_defaults: GenerationDefaults,
}

impl StudioSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs.max(1))
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_secs(self.device_poll_interval_secs.max(1))
    }

    pub fn success_dismiss(&self) -> Duration {
        Duration::from_millis(self.success_dismiss_ms)
    }
}

impl Default for StudioSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            generation_timeout_secs: DEFAULT_GENERATION_TIMEOUT.as_secs(),
            device_poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            success_dismiss_ms: DEFAULT_SUCCESS_DISMISS.as_millis() as u64,
            history_limit: 50,
            generation_defaults: GenerationDefaults::default(),
        }
    }
}

/// Initial values for the generation form.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub image_count: u32,
    pub scheduler: Scheduler,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_skip: Option<u8>,
}

impl GenerationDefaults {
    pub fn parameters(&self, prompt: impl Into<String>) -> GenerationParameters {
        GenerationParameters {
            scheduler: self.scheduler,
            clip_skip: self.clip_skip,
            ..GenerationParameters::new(prompt)
                .with_size(self.width, self.height)
                .with_steps(self.steps)
                .with_guidance(self.guidance_scale)
                .with_image_count(self.image_count)
        }
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        let base = GenerationParameters::default();
        Self {
            width: base.width,
            height: base.height,
            steps: base.steps,
            guidance_scale: base.guidance_scale,
            image_count: base.image_count,
            scheduler: base.scheduler,
            clip_skip: None,
        }
    }
}

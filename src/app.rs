use crate::{
    api::{ApiClient, StudioApi},
    catalog::CatalogService,
    config::{ConfigStore, StudioSettings},
    env_flags,
    error::StudioResult,
    generate::Orchestrator,
    lora::LoraSet,
    model::{HistoryEntry, HistoryPage, StudioStats},
    notify::Notifier,
    poller::DevicePoller,
    state::Store,
};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};

pub const APP_ID: &str = "dev.aistudio.Client";

#[derive(Clone)]
pub struct AppContext {
    pub runtime: Arc<Runtime>,
    pub config: Arc<ConfigStore>,
    pub studio: Arc<Studio>,
}

pub fn build_context() -> Result<AppContext> {
    let runtime = Arc::new(
        Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| anyhow!("failed to create Tokio runtime: {err}"))?,
    );

    let config = Arc::new(ConfigStore::new()?);
    let settings = config.settings();
    let api = ApiClient::new(
        settings.api_base_url.clone(),
        settings.request_timeout(),
        settings.generation_timeout(),
    )
    .map_err(|err| anyhow!("failed to build API client: {err}"))?;
    info!("Using studio service at {}", api.base_url());

    let studio = Arc::new(Studio::new(
        Arc::new(api),
        runtime.handle().clone(),
        settings,
    ));

    Ok(AppContext {
        runtime,
        config,
        studio,
    })
}

/// Coordinator owning the state store and every component that writes it.
pub struct Studio {
    api: Arc<dyn StudioApi>,
    runtime: Handle,
    settings: StudioSettings,
    pub store: Store,
    pub notifier: Arc<Notifier>,
    pub generator: Orchestrator,
    pub loras: LoraSet,
    pub catalog: CatalogService,
}

impl Studio {
    pub fn new(api: Arc<dyn StudioApi>, runtime: Handle, settings: StudioSettings) -> Self {
        let store = Store::new();
        let notifier = Arc::new(Notifier::new(
            store.clone(),
            runtime.clone(),
            settings.success_dismiss(),
        ));

        Self {
            generator: Orchestrator::new(api.clone(), store.clone(), notifier.clone()),
            loras: LoraSet::new(api.clone(), store.clone(), notifier.clone()),
            catalog: CatalogService::new(api.clone(), store.clone(), notifier.clone()),
            api,
            runtime,
            settings,
            store,
            notifier,
        }
    }

    pub fn settings(&self) -> &StudioSettings {
        &self.settings
    }

    /// Starts the device status refresh unless disabled by environment.
    pub fn start_device_polling(&self) -> Option<DevicePoller> {
        if !env_flags::device_poll_enabled() {
            info!("Device status polling is disabled via environment toggle.");
            return None;
        }
        Some(DevicePoller::start(
            self.api.clone(),
            self.store.clone(),
            &self.runtime,
            self.settings.device_poll_interval(),
        ))
    }

    /// Initial load of the model list and the LoRA mirror. Failures are
    /// logged; each panel retries on its own.
    pub async fn bootstrap(&self) {
        match self.api.health().await {
            Ok(health) => info!(
                "Studio service is {} (version {})",
                health.status,
                health.version.as_deref().unwrap_or("unknown")
            ),
            Err(err) => warn!("Health check failed: {err}"),
        }
        if let Err(err) = self.catalog.refresh().await {
            warn!("Failed to load models: {err}");
        }
        if let Err(err) = self.loras.refresh().await {
            warn!("Failed to load LoRAs: {err}");
        }
    }

    /// Loads a model, then reloads the LoRA listing for its type tag.
    pub async fn load_model(&self, key: &str) -> StudioResult<()> {
        self.catalog.load(key).await?;
        if let Err(err) = self.loras.refresh().await {
            warn!("Failed to reload LoRAs for {key}: {err}");
        }
        Ok(())
    }

    pub async fn history(&self) -> StudioResult<HistoryPage> {
        self.api.history(self.settings.history_limit).await
    }

    pub async fn search_history(&self, query: &str) -> StudioResult<HistoryPage> {
        self.api
            .search_history(query, self.settings.history_limit)
            .await
    }

    pub async fn history_entry(&self, id: i64) -> StudioResult<HistoryEntry> {
        self.api.history_entry(id).await
    }

    pub async fn delete_history_entry(&self, id: i64) -> StudioResult<()> {
        self.api.delete_history_entry(id).await.map(|_| ())
    }

    pub async fn stats(&self) -> StudioResult<StudioStats> {
        self.api.stats().await
    }

    pub async fn clear_device_cache(&self) -> StudioResult<()> {
        self.api.clear_device_cache().await.map(|_| ())
    }
}

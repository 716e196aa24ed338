use crate::{
    api::StudioApi,
    error::{StudioError, StudioResult},
    model::ModelInfo,
    notify::Notifier,
    state::{Store, StudioEvent},
};
use log::{info, warn};
use std::sync::Arc;

/// Mirror of the service's model list. At most one model is current.
#[derive(Clone, Debug, Default)]
pub struct ModelCatalog {
    models: Vec<ModelInfo>,
    current: Option<String>,
    loading: bool,
}

impl ModelCatalog {
    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn find(&self, key: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|model| model.key == key)
    }

    pub fn current_key(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current_model(&self) -> Option<&ModelInfo> {
        self.current_key().and_then(|key| self.find(key))
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Model type tags present in the list, sorted and deduplicated.
    pub fn model_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .models
            .iter()
            .map(|model| model.model_type.clone())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    pub(crate) fn replace(&mut self, models: Vec<ModelInfo>) {
        self.models = models;
    }

    pub(crate) fn set_current(&mut self, key: Option<String>) {
        self.current = key;
    }

    pub(crate) fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }
}

pub struct CatalogService {
    api: Arc<dyn StudioApi>,
    store: Store,
    notifier: Arc<Notifier>,
}

impl CatalogService {
    pub fn new(api: Arc<dyn StudioApi>, store: Store, notifier: Arc<Notifier>) -> Self {
        Self {
            api,
            store,
            notifier,
        }
    }

    pub fn snapshot(&self) -> ModelCatalog {
        self.store.read(|state| state.models().clone())
    }

    pub async fn refresh(&self) -> StudioResult<()> {
        let (models, current) =
            futures::future::try_join(self.api.list_models(), self.api.current_model()).await?;
        let current_key = current.key.filter(|_| current.loaded);
        self.store.dispatch(StudioEvent::ModelsReplaced(models));
        self.store
            .dispatch(StudioEvent::CurrentModelChanged(current_key));
        Ok(())
    }

    /// Loads a model on the service. Progress and outcome are shown as
    /// notifications.
    pub async fn load(&self, key: &str) -> StudioResult<()> {
        let display_name = self
            .store
            .read(|state| state.models().find(key).map(|model| model.name.clone()))
            .unwrap_or_else(|| key.to_string());

        self.store.dispatch(StudioEvent::ModelLoading(true));
        self.notifier
            .loading(format!("Loading model {display_name}..."));

        let result = match self.api.load_model(key).await {
            Ok(response) if response.success => Ok(()),
            Ok(response) => Err(StudioError::PartialData(
                response
                    .message
                    .unwrap_or_else(|| format!("service did not load {key}")),
            )),
            Err(err) => Err(err),
        };
        self.store.dispatch(StudioEvent::ModelLoading(false));

        match result {
            Ok(()) => {
                info!("Model {key} loaded");
                self.store
                    .dispatch(StudioEvent::CurrentModelChanged(Some(key.to_string())));
                if let Err(err) = self.refresh().await {
                    warn!("Failed to reload model list: {err}");
                }
                self.notifier
                    .success(format!("Model {display_name} loaded"));
                Ok(())
            }
            Err(err) => {
                warn!("Failed to load model {key}: {err}");
                self.notifier.error(err.user_message());
                Err(err)
            }
        }
    }
}

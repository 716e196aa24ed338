//! Client-side mirror of the style adapters and the calls that toggle them.
//!
//! The service owns the cardinality limit. The mirror never predicts it; a
//! rejected activation is surfaced verbatim and the mirror is left as the
//! service last reported it.

use crate::{
    api::StudioApi,
    error::{StudioError, StudioResult},
    model::{
        Lora, LoraActivation, LoraUpdate, LoraWeight, NewLora, MAX_LORA_WEIGHT, MIN_LORA_WEIGHT,
    },
    notify::Notifier,
    state::{Store, StudioEvent},
};
use log::{info, warn};
use std::{collections::HashMap, sync::Arc};

/// Display-only copy of the service limit.
pub const MAX_ACTIVE_LORAS: usize = 5;

#[derive(Clone, Debug, Default)]
pub struct LoraMirror {
    listed: Vec<Lora>,
    active: Vec<Lora>,
    /// Weight edits not yet sent with an activation call.
    local_weights: HashMap<i64, f32>,
}

impl LoraMirror {
    /// Adapters matching the current listing filter.
    pub fn listed(&self) -> &[Lora] {
        &self.listed
    }

    /// Every active adapter, regardless of the listing filter.
    pub fn active(&self) -> &[Lora] {
        &self.active
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: i64) -> bool {
        self.active.iter().any(|lora| lora.id == id)
    }

    pub fn get(&self, id: i64) -> Option<&Lora> {
        self.active
            .iter()
            .chain(self.listed.iter())
            .find(|lora| lora.id == id)
    }

    pub fn weight_of(&self, id: i64) -> Option<f32> {
        self.get(id).map(|lora| lora.weight)
    }

    pub fn has_unsent_weight(&self, id: i64) -> bool {
        self.local_weights.contains_key(&id)
    }

    /// Active adapters and their current local weights, as sent with a
    /// generation request.
    pub fn active_weights(&self) -> Vec<LoraWeight> {
        self.active
            .iter()
            .map(|lora| LoraWeight {
                id: lora.id,
                weight: lora.weight,
            })
            .collect()
    }

    pub(crate) fn replace(&mut self, listed: Vec<Lora>, active: Vec<Lora>) {
        self.listed = listed;
        self.active = active;
        self.local_weights
            .retain(|id, _| self.active.iter().any(|lora| lora.id == *id));
        let pending = self.local_weights.clone();
        for lora in self.listed.iter_mut().chain(self.active.iter_mut()) {
            if let Some(weight) = pending.get(&lora.id) {
                lora.weight = *weight;
            }
        }
    }

    pub(crate) fn confirm(&mut self, id: i64, is_active: bool, weight: f32) -> bool {
        self.local_weights.remove(&id);
        let Some(mut record) = self.get(id).cloned() else {
            return false;
        };
        record.is_active = is_active;
        record.weight = weight;
        if let Some(listed) = self.listed.iter_mut().find(|lora| lora.id == id) {
            *listed = record.clone();
        }
        self.active.retain(|lora| lora.id != id);
        if is_active {
            self.active.push(record);
        }
        true
    }

    pub(crate) fn deactivate_all(&mut self) {
        self.active.clear();
        self.local_weights.clear();
        for lora in &mut self.listed {
            lora.is_active = false;
        }
    }

    pub(crate) fn forget_local_weight(&mut self, id: i64) -> bool {
        self.local_weights.remove(&id).is_some()
    }

    pub(crate) fn set_weight(&mut self, id: i64, weight: f32) -> bool {
        if !self.is_active(id) {
            return false;
        }
        for lora in self
            .listed
            .iter_mut()
            .chain(self.active.iter_mut())
            .filter(|lora| lora.id == id)
        {
            lora.weight = weight;
        }
        self.local_weights.insert(id, weight);
        true
    }
}

fn check_weight(weight: f32) -> StudioResult<()> {
    if weight.is_finite() && (MIN_LORA_WEIGHT..=MAX_LORA_WEIGHT).contains(&weight) {
        Ok(())
    } else {
        Err(StudioError::validation(format!(
            "LoRA weight must be within {MIN_LORA_WEIGHT}..={MAX_LORA_WEIGHT}, got {weight}"
        )))
    }
}

pub struct LoraSet {
    api: Arc<dyn StudioApi>,
    store: Store,
    notifier: Arc<Notifier>,
}

impl LoraSet {
    pub fn new(api: Arc<dyn StudioApi>, store: Store, notifier: Arc<Notifier>) -> Self {
        Self {
            api,
            store,
            notifier,
        }
    }

    pub fn snapshot(&self) -> LoraMirror {
        self.store.read(|state| state.loras().clone())
    }

    /// Reloads the listing, filtered by the loaded model's type, and the
    /// global active set.
    pub async fn refresh(&self) -> StudioResult<()> {
        let model_type = self.store.read(|state| {
            state
                .models()
                .current_model()
                .map(|model| model.model_type.clone())
        });
        let (listed, active) = futures::future::try_join(
            self.api.list_loras(model_type.as_deref()),
            self.api.active_loras(),
        )
        .await?;
        self.store
            .dispatch(StudioEvent::LorasReplaced { listed, active });
        Ok(())
    }

    async fn reconcile(&self) {
        if let Err(err) = self.refresh().await {
            warn!("Failed to reload LoRAs: {err}");
        }
    }

    pub async fn activate(&self, id: i64) -> StudioResult<()> {
        self.set_active(id, true).await
    }

    pub async fn deactivate(&self, id: i64) -> StudioResult<()> {
        self.set_active(id, false).await
    }

    pub async fn toggle(&self, id: i64) -> StudioResult<()> {
        let active = self.store.read(|state| state.loras().is_active(id));
        self.set_active(id, !active).await
    }

    async fn set_active(&self, id: i64, is_active: bool) -> StudioResult<()> {
        let weight = self
            .store
            .read(|state| state.loras().weight_of(id))
            .ok_or_else(|| StudioError::validation(format!("unknown LoRA {id}")))?;

        match self
            .api
            .set_lora_active(id, LoraActivation { is_active, weight })
            .await
        {
            Ok(_) => {
                info!(
                    "LoRA {id} {} (weight {weight})",
                    if is_active { "activated" } else { "deactivated" }
                );
                self.store.dispatch(StudioEvent::LoraActivationConfirmed {
                    id,
                    is_active,
                    weight,
                });
                self.reconcile().await;
                Ok(())
            }
            Err(err) => {
                warn!("Failed to change LoRA {id} activation: {err}");
                self.notifier.error(err.user_message());
                Err(err)
            }
        }
    }

    /// Local-only edit of an active adapter's weight. The value reaches the
    /// service with the next generation or activation call.
    pub fn set_weight(&self, id: i64, weight: f32) -> StudioResult<()> {
        check_weight(weight)?;
        if self
            .store
            .dispatch(StudioEvent::LoraWeightSet { id, weight })
        {
            Ok(())
        } else {
            Err(StudioError::validation(format!("LoRA {id} is not active")))
        }
    }

    pub async fn deactivate_all(&self) -> StudioResult<()> {
        if let Err(err) = self.api.deactivate_all_loras().await {
            warn!("Failed to deactivate LoRAs: {err}");
            self.notifier.error(err.user_message());
            return Err(err);
        }
        self.store.dispatch(StudioEvent::LorasDeactivated);
        self.reconcile().await;
        Ok(())
    }

    pub async fn add(&self, lora: NewLora) -> StudioResult<Lora> {
        if lora.name.trim().is_empty() || lora.file_path.trim().is_empty() {
            return Err(StudioError::validation("name and file path are required"));
        }
        check_weight(lora.weight)?;
        let record = self.api.add_lora(&lora).await.map_err(|err| {
            self.notifier.error(err.user_message());
            err
        })?;
        info!("Registered LoRA {} ({})", record.name, record.id);
        self.reconcile().await;
        Ok(record)
    }

    /// Edits an adapter's details. A new weight replaces any unsent local edit.
    pub async fn update(&self, id: i64, update: LoraUpdate) -> StudioResult<()> {
        if update.is_empty() {
            return Err(StudioError::validation("nothing to update"));
        }
        if update.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(StudioError::validation("name must not be empty"));
        }
        if let Some(weight) = update.weight {
            check_weight(weight)?;
        }

        self.api.update_lora(id, &update).await.map_err(|err| {
            warn!("Failed to update LoRA {id}: {err}");
            self.notifier.error(err.user_message());
            err
        })?;
        info!("Updated LoRA {id}");
        if update.weight.is_some() {
            self.store
                .dispatch(StudioEvent::LoraWeightCommitted { id });
        }
        self.reconcile().await;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> StudioResult<()> {
        self.api.delete_lora(id).await.map_err(|err| {
            self.notifier.error(err.user_message());
            err
        })?;
        self.reconcile().await;
        Ok(())
    }
}

//! Typed gateway to the studio inference service.
//!
//! Every remote capability is one method on [`StudioApi`]; [`ApiClient`] is
//! the reqwest implementation. No retries happen here, callers decide.

use crate::{
    error::{StudioError, StudioResult},
    model::{
        Ack, CurrentModel, DeviceStatus, GenerateRequest, GenerateResponse, Health, HistoryEntry,
        HistoryPage, LoadModelResponse, Lora, LoraActivation, LoraList, LoraUpdate, ModelInfo,
        ModelList, NewLora, StudioStats,
    },
};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait StudioApi: Send + Sync {
    async fn health(&self) -> StudioResult<Health>;
    async fn device_status(&self) -> StudioResult<DeviceStatus>;
    async fn clear_device_cache(&self) -> StudioResult<Ack>;

    async fn list_models(&self) -> StudioResult<Vec<ModelInfo>>;
    async fn current_model(&self) -> StudioResult<CurrentModel>;
    async fn load_model(&self, model_key: &str) -> StudioResult<LoadModelResponse>;

    async fn generate(&self, request: &GenerateRequest) -> StudioResult<GenerateResponse>;

    async fn history(&self, limit: usize) -> StudioResult<HistoryPage>;
    async fn search_history(&self, query: &str, limit: usize) -> StudioResult<HistoryPage>;
    async fn history_entry(&self, id: i64) -> StudioResult<HistoryEntry>;
    async fn delete_history_entry(&self, id: i64) -> StudioResult<Ack>;
    async fn stats(&self) -> StudioResult<StudioStats>;

    async fn list_loras(&self, model_type: Option<&str>) -> StudioResult<Vec<Lora>>;
    async fn active_loras(&self) -> StudioResult<Vec<Lora>>;
    async fn add_lora(&self, lora: &NewLora) -> StudioResult<Lora>;
    async fn update_lora(&self, id: i64, update: &LoraUpdate) -> StudioResult<Ack>;
    async fn set_lora_active(&self, id: i64, activation: LoraActivation) -> StudioResult<Ack>;
    async fn delete_lora(&self, id: i64) -> StudioResult<Ack>;
    async fn deactivate_all_loras(&self) -> StudioResult<Ack>;
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct ApiClient {
    base_url: String,
    client: Client,
    request_timeout: Duration,
    generation_timeout: Duration,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        generation_timeout: Duration,
    ) -> StudioResult<Self> {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        let client = Client::builder()
            .user_agent(format!(
                "AIStudio/{} ({})",
                env!("CARGO_PKG_VERSION"),
                env!("CARGO_PKG_NAME")
            ))
            .tcp_nodelay(true)
            .build()
            .map_err(|err| {
                StudioError::Transport(format!("failed to construct HTTP client: {err}"))
            })?;

        Ok(Self {
            base_url,
            client,
            request_timeout,
            generation_timeout,
        })
    }

    pub fn localhost() -> StudioResult<Self> {
        Self::new(
            DEFAULT_BASE_URL,
            DEFAULT_REQUEST_TIMEOUT,
            DEFAULT_GENERATION_TIMEOUT,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn generation_timeout(&self) -> Duration {
        self.generation_timeout
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{method} {url}");
        self.client
            .request(method, url)
            .timeout(self.request_timeout)
    }

    fn lora_list_request(&self, model_type: Option<&str>) -> RequestBuilder {
        let builder = self.request(Method::GET, "/lora");
        match model_type {
            Some(model_type) => builder.query(&[("model_type", model_type)]),
            None => builder,
        }
    }

    fn lora_patch_request<B: serde::Serialize>(&self, id: i64, body: &B) -> RequestBuilder {
        self.request(Method::PATCH, &format!("/lora/{id}")).json(body)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> StudioResult<T> {
        let response = builder.send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> StudioResult<T> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(StudioError::Backend {
            status: status.as_u16(),
            detail: extract_detail(&text),
        });
    }

    serde_json::from_str(&text).map_err(|err| {
        debug!("unparseable response body: {}", preview(&text));
        StudioError::PartialData(err.to_string())
    })
}

fn preview(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Pulls the human-readable `detail` out of an error body. Validation
/// errors carry a list of objects with a `msg` field instead of a string.
pub(crate) fn extract_detail(body: &str) -> Option<String> {
    let parsed: ErrorBody = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) => {
            debug!("error body is not JSON: {}", preview(body));
            return None;
        }
    };
    match parsed.detail? {
        serde_json::Value::String(detail) => Some(detail),
        serde_json::Value::Array(items) => {
            let messages: Vec<String> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|msg| msg.as_str()))
                .map(str::to_string)
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        }
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl StudioApi for ApiClient {
    async fn health(&self) -> StudioResult<Health> {
        self.send(self.request(Method::GET, "/health")).await
    }

    async fn device_status(&self) -> StudioResult<DeviceStatus> {
        self.send(self.request(Method::GET, "/gpu/info")).await
    }

    async fn clear_device_cache(&self) -> StudioResult<Ack> {
        self.send(self.request(Method::POST, "/gpu/clear-cache")).await
    }

    async fn list_models(&self) -> StudioResult<Vec<ModelInfo>> {
        let list: ModelList = self.send(self.request(Method::GET, "/models")).await?;
        Ok(list.models)
    }

    async fn current_model(&self) -> StudioResult<CurrentModel> {
        self.send(self.request(Method::GET, "/models/current")).await
    }

    async fn load_model(&self, model_key: &str) -> StudioResult<LoadModelResponse> {
        // Loading weights blocks server-side like inference does.
        let builder = self
            .request(Method::POST, "/models/load")
            .timeout(self.generation_timeout)
            .json(&serde_json::json!({ "model_key": model_key }));
        self.send(builder).await
    }

    async fn generate(&self, request: &GenerateRequest) -> StudioResult<GenerateResponse> {
        let builder = self
            .request(Method::POST, "/generate/image")
            .timeout(self.generation_timeout)
            .json(request);
        self.send(builder).await
    }

    async fn history(&self, limit: usize) -> StudioResult<HistoryPage> {
        let builder = self
            .request(Method::GET, "/history")
            .query(&[("limit", limit)]);
        self.send(builder).await
    }

    async fn search_history(&self, query: &str, limit: usize) -> StudioResult<HistoryPage> {
        let limit = limit.to_string();
        let builder = self
            .request(Method::GET, "/history/search")
            .query(&[("q", query), ("limit", limit.as_str())]);
        self.send(builder).await
    }

    async fn history_entry(&self, id: i64) -> StudioResult<HistoryEntry> {
        self.send(self.request(Method::GET, &format!("/history/{id}")))
            .await
    }

    async fn delete_history_entry(&self, id: i64) -> StudioResult<Ack> {
        self.send(self.request(Method::DELETE, &format!("/history/{id}")))
            .await
    }

    async fn stats(&self) -> StudioResult<StudioStats> {
        self.send(self.request(Method::GET, "/stats")).await
    }

    async fn list_loras(&self, model_type: Option<&str>) -> StudioResult<Vec<Lora>> {
        let list: LoraList = self.send(self.lora_list_request(model_type)).await?;
        Ok(list.loras)
    }

    async fn active_loras(&self) -> StudioResult<Vec<Lora>> {
        let list: LoraList = self.send(self.request(Method::GET, "/lora/active")).await?;
        Ok(list.loras)
    }

    async fn add_lora(&self, lora: &NewLora) -> StudioResult<Lora> {
        self.send(self.request(Method::POST, "/lora").json(lora))
            .await
    }

    async fn update_lora(&self, id: i64, update: &LoraUpdate) -> StudioResult<Ack> {
        self.send(self.lora_patch_request(id, update)).await
    }

    async fn set_lora_active(&self, id: i64, activation: LoraActivation) -> StudioResult<Ack> {
        self.send(self.lora_patch_request(id, &activation)).await
    }

    async fn delete_lora(&self, id: i64) -> StudioResult<Ack> {
        self.send(self.request(Method::DELETE, &format!("/lora/{id}")))
            .await
    }

    async fn deactivate_all_loras(&self) -> StudioResult<Ack> {
        self.send(self.request(Method::POST, "/lora/deactivate-all"))
            .await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted in-memory service used by the component tests.

    use super::*;
    use crate::model::{GenerateResponse, ImagePayload};
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };
    use tokio::sync::Notify;

    pub const LORA_LIMIT: usize = 5;

    #[derive(Default)]
    pub struct FakeApi {
        pub calls: Mutex<HashMap<&'static str, usize>>,
        pub device_failures: AtomicUsize,
        pub generate_gate: Option<std::sync::Arc<Notify>>,
        pub generate_result: Mutex<Option<StudioResult<GenerateResponse>>>,
        pub last_request: Mutex<Option<GenerateRequest>>,
        pub loras: Mutex<Vec<Lora>>,
        pub models: Mutex<Vec<ModelInfo>>,
        pub current: Mutex<Option<String>>,
        pub load_error: Mutex<Option<StudioError>>,
    }

    impl FakeApi {
        pub fn count(&self, name: &str) -> usize {
            self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
        }

        fn record(&self, name: &'static str) {
            *self.calls.lock().unwrap().entry(name).or_insert(0) += 1;
        }

        pub fn respond_with_images(&self, names: &[&str]) {
            let images = names
                .iter()
                .map(|name| ImagePayload {
                    filename: name.to_string(),
                    path: format!("/outputs/{name}"),
                    base64: "iVBORw0KGgo=".to_string(),
                })
                .collect::<Vec<_>>();
            *self.generate_result.lock().unwrap() = Some(Ok(GenerateResponse {
                success: true,
                count: images.len(),
                images,
                prompt: String::new(),
                model: Some("sdxl-turbo".to_string()),
            }));
        }

        pub fn respond_with_error(&self, err: StudioError) {
            *self.generate_result.lock().unwrap() = Some(Err(err));
        }

        pub fn with_loras(loras: Vec<Lora>) -> Self {
            let api = Self::default();
            *api.loras.lock().unwrap() = loras;
            api
        }
    }

    pub fn lora(id: i64, model_type: &str, active: bool) -> Lora {
        Lora {
            id,
            name: format!("lora-{id}"),
            file_path: format!("/loras/lora-{id}.safetensors"),
            model_type: model_type.to_string(),
            trigger_words: None,
            description: None,
            weight: 1.0,
            is_active: active,
        }
    }

    fn ok_ack() -> StudioResult<Ack> {
        Ok(Ack {
            success: Some(true),
            message: None,
        })
    }

    #[async_trait]
    impl StudioApi for FakeApi {
        async fn health(&self) -> StudioResult<Health> {
            self.record("health");
            Ok(Health {
                status: "healthy".into(),
                version: Some("1.0.0".into()),
            })
        }

        async fn device_status(&self) -> StudioResult<DeviceStatus> {
            self.record("device_status");
            let remaining = self.device_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.device_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StudioError::Transport("connection refused".into()));
            }
            Ok(DeviceStatus {
                available: true,
                name: Some("Fake GPU".into()),
                ..DeviceStatus::default()
            })
        }

        async fn clear_device_cache(&self) -> StudioResult<Ack> {
            self.record("clear_device_cache");
            ok_ack()
        }

        async fn list_models(&self) -> StudioResult<Vec<ModelInfo>> {
            self.record("list_models");
            Ok(self.models.lock().unwrap().clone())
        }

        async fn current_model(&self) -> StudioResult<CurrentModel> {
            self.record("current_model");
            let key = self.current.lock().unwrap().clone();
            Ok(CurrentModel {
                loaded: key.is_some(),
                key,
            })
        }

        async fn load_model(&self, model_key: &str) -> StudioResult<LoadModelResponse> {
            self.record("load_model");
            if let Some(err) = self.load_error.lock().unwrap().clone() {
                return Err(err);
            }
            *self.current.lock().unwrap() = Some(model_key.to_string());
            for model in self.models.lock().unwrap().iter_mut() {
                model.loaded = model.key == model_key;
            }
            Ok(LoadModelResponse {
                success: true,
                message: None,
            })
        }

        async fn generate(&self, request: &GenerateRequest) -> StudioResult<GenerateResponse> {
            self.record("generate");
            *self.last_request.lock().unwrap() = Some(request.clone());
            if let Some(gate) = &self.generate_gate {
                gate.notified().await;
            }
            self.generate_result
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err(StudioError::Transport("no scripted response".into())))
        }

        async fn history(&self, _limit: usize) -> StudioResult<HistoryPage> {
            self.record("history");
            Ok(HistoryPage {
                generations: Vec::new(),
                count: 0,
            })
        }

        async fn search_history(&self, _query: &str, _limit: usize) -> StudioResult<HistoryPage> {
            self.record("search_history");
            Ok(HistoryPage {
                generations: Vec::new(),
                count: 0,
            })
        }

        async fn history_entry(&self, _id: i64) -> StudioResult<HistoryEntry> {
            self.record("history_entry");
            Err(StudioError::backend(404, "Generation not found"))
        }

        async fn delete_history_entry(&self, _id: i64) -> StudioResult<Ack> {
            self.record("delete_history_entry");
            ok_ack()
        }

        async fn stats(&self) -> StudioResult<StudioStats> {
            self.record("stats");
            Ok(StudioStats {
                stats: Default::default(),
                gpu: self.device_status().await?,
            })
        }

        async fn list_loras(&self, model_type: Option<&str>) -> StudioResult<Vec<Lora>> {
            self.record("list_loras");
            Ok(self
                .loras
                .lock()
                .unwrap()
                .iter()
                .filter(|lora| model_type.map_or(true, |ty| lora.model_type == ty))
                .cloned()
                .collect())
        }

        async fn active_loras(&self) -> StudioResult<Vec<Lora>> {
            self.record("active_loras");
            Ok(self
                .loras
                .lock()
                .unwrap()
                .iter()
                .filter(|lora| lora.is_active)
                .cloned()
                .collect())
        }

        async fn add_lora(&self, lora: &NewLora) -> StudioResult<Lora> {
            self.record("add_lora");
            let mut loras = self.loras.lock().unwrap();
            let id = loras.iter().map(|l| l.id).max().unwrap_or(0) + 1;
            let record = Lora {
                id,
                name: lora.name.clone(),
                file_path: lora.file_path.clone(),
                model_type: lora.model_type.clone(),
                trigger_words: lora.trigger_words.clone(),
                description: lora.description.clone(),
                weight: lora.weight,
                is_active: false,
            };
            loras.push(record.clone());
            Ok(record)
        }

        async fn update_lora(&self, id: i64, update: &LoraUpdate) -> StudioResult<Ack> {
            self.record("update_lora");
            let mut loras = self.loras.lock().unwrap();
            let lora = loras
                .iter_mut()
                .find(|l| l.id == id)
                .ok_or_else(|| StudioError::backend(404, "LoRA not found or no changes made"))?;
            if let Some(name) = &update.name {
                lora.name = name.clone();
            }
            if let Some(words) = &update.trigger_words {
                lora.trigger_words = Some(words.clone());
            }
            if let Some(description) = &update.description {
                lora.description = Some(description.clone());
            }
            if let Some(weight) = update.weight {
                lora.weight = weight;
            }
            ok_ack()
        }

        async fn set_lora_active(&self, id: i64, activation: LoraActivation) -> StudioResult<Ack> {
            self.record("set_lora_active");
            let mut loras = self.loras.lock().unwrap();
            let active = loras.iter().filter(|l| l.is_active && l.id != id).count();
            if activation.is_active && active >= LORA_LIMIT {
                return Err(StudioError::backend(
                    400,
                    "Maximum 5 LoRAs can be active at once",
                ));
            }
            let lora = loras
                .iter_mut()
                .find(|l| l.id == id)
                .ok_or_else(|| StudioError::backend(404, "LoRA not found"))?;
            lora.is_active = activation.is_active;
            lora.weight = activation.weight;
            ok_ack()
        }

        async fn delete_lora(&self, id: i64) -> StudioResult<Ack> {
            self.record("delete_lora");
            self.loras.lock().unwrap().retain(|l| l.id != id);
            ok_ack()
        }

        async fn deactivate_all_loras(&self) -> StudioResult<Ack> {
            self.record("deactivate_all_loras");
            for lora in self.loras.lock().unwrap().iter_mut() {
                lora.is_active = false;
            }
            ok_ack()
        }
    }
}

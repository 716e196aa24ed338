//! Generation orchestrator.
//!
//! Turns a parameter set into one request against the service and fans the
//! result into the gallery and the notification slot. The Idle/Generating
//! transition is owned here; [`InFlight`] guarantees the return to Idle on
//! every exit path, including the future being dropped mid-request.

use crate::{
    api::StudioApi,
    error::{StudioError, StudioResult},
    gallery::DownloadBlob,
    model::{GenerateResponse, GenerationParameters},
    notify::Notifier,
    state::{RequestToken, Store, StudioEvent},
};
use log::{debug, info, warn};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed { token: RequestToken, images: usize },
    /// Another request was in flight; nothing was sent.
    AlreadyRunning,
}

pub struct Orchestrator {
    api: Arc<dyn StudioApi>,
    store: Store,
    notifier: Arc<Notifier>,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn StudioApi>, store: Store, notifier: Arc<Notifier>) -> Self {
        Self {
            api,
            store,
            notifier,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.store.read(|state| state.is_generating())
    }

    pub async fn generate(&self, params: &GenerationParameters) -> StudioResult<GenerationOutcome> {
        if self.is_generating() {
            debug!("generate ignored: a request is already in flight");
            return Ok(GenerationOutcome::AlreadyRunning);
        }

        if let Err(err) = params.validate() {
            self.store.dispatch(StudioEvent::GenerationRejected {
                message: err.user_message(),
            });
            return Err(err);
        }

        let requested = params.image_count as usize;
        let Some(token) = self.store.begin_generation(requested) else {
            debug!("generate ignored: a request is already in flight");
            return Ok(GenerationOutcome::AlreadyRunning);
        };
        let in_flight = InFlight::new(self.store.clone(), token);

        let loras = self.store.read(|state| state.loras().active_weights());
        let request = params.to_request(loras);
        info!(
            "Generation {token} started: {requested} image(s), {}x{}, {} steps, {} active LoRA(s)",
            request.width,
            request.height,
            request.num_inference_steps,
            request.loras.len()
        );
        self.notifier.loading(if requested == 1 {
            "Generating image...".to_string()
        } else {
            format!("Generating {requested} images...")
        });

        let result = self
            .api
            .generate(&request)
            .await
            .and_then(GenerateResponse::into_images);

        match result {
            Ok(images) => {
                let count = images.len();
                info!("Generation {token} finished with {count} image(s)");
                in_flight.resolve(StudioEvent::GenerationSucceeded { token, images });
                self.notifier.success(if count == 1 {
                    "Image generated".to_string()
                } else {
                    format!("{count} images generated")
                });
                Ok(GenerationOutcome::Completed {
                    token,
                    images: count,
                })
            }
            Err(err) => {
                warn!("Generation {token} failed: {err}");
                let message = err.user_message();
                in_flight.resolve(StudioEvent::GenerationFailed {
                    token,
                    message: message.clone(),
                });
                self.notifier.error(message);
                Err(err)
            }
        }
    }

    pub fn clear_error(&self) {
        self.store.dispatch(StudioEvent::GenerationErrorCleared);
    }

    pub fn clear_gallery(&self) {
        self.store.dispatch(StudioEvent::GalleryCleared);
    }

    pub fn download(&self, filename: &str) -> StudioResult<DownloadBlob> {
        self.store
            .read(|state| state.gallery().download(filename))
            .ok_or_else(|| StudioError::validation(format!("no image named {filename}")))
    }
}

/// Resolves the pending request exactly once. Dropping it unresolved marks
/// the request failed so the orchestrator can never stay in Generating.
struct InFlight {
    store: Store,
    token: RequestToken,
    resolved: bool,
}

impl InFlight {
    fn new(store: Store, token: RequestToken) -> Self {
        Self {
            store,
            token,
            resolved: false,
        }
    }

    fn resolve(mut self, event: StudioEvent) {
        self.resolved = true;
        self.store.dispatch(event);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.resolved {
            warn!("Generation {} abandoned before completion", self.token);
            self.store.dispatch(StudioEvent::GenerationFailed {
                token: self.token,
                message: "generation was interrupted".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::fake::{lora, FakeApi},
        model::{GeneratedImage, LoraWeight},
        notify::{NotificationKind, DEFAULT_SUCCESS_DISMISS},
    };
    use std::time::Duration;
    use tokio::{runtime::Handle, sync::Notify};

    fn orchestrator(api: FakeApi) -> (Arc<FakeApi>, Arc<Orchestrator>, Store) {
        let api = Arc::new(api);
        let store = Store::new();
        let notifier = Arc::new(Notifier::new(
            store.clone(),
            Handle::current(),
            DEFAULT_SUCCESS_DISMISS,
        ));
        let orchestrator = Arc::new(Orchestrator::new(api.clone(), store.clone(), notifier));
        (api, orchestrator, store)
    }

    fn gated() -> (FakeApi, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let api = FakeApi {
            generate_gate: Some(gate.clone()),
            ..FakeApi::default()
        };
        (api, gate)
    }

    async fn wait_for_request(api: &FakeApi, expected: usize) {
        while api.count("generate") < expected {
            tokio::task::yield_now().await;
        }
    }

    fn gallery_names(store: &Store) -> Vec<String> {
        store.read(|s| {
            s.gallery()
                .images()
                .iter()
                .map(|i| i.filename().to_string())
                .collect()
        })
    }

    #[tokio::test]
    async fn placeholders_match_the_requested_count_while_in_flight() {
        for requested in 1..=4u32 {
            let (api, gate) = gated();
            let names: Vec<String> = (0..requested).map(|i| format!("img{i}.png")).collect();
            api.respond_with_images(&names.iter().map(String::as_str).collect::<Vec<_>>());
            let (api, orchestrator, store) = orchestrator(api);

            let params = GenerationParameters::new("a lighthouse").with_image_count(requested);
            let task = {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.generate(&params).await })
            };
            wait_for_request(&api, 1).await;

            assert!(store.read(|s| s.is_generating()));
            assert_eq!(
                store.read(|s| s.gallery().placeholder_count()),
                requested as usize
            );

            gate.notify_one();
            task.await.unwrap().unwrap();
            assert_eq!(store.read(|s| s.gallery().placeholder_count()), 0);
        }
    }

    #[tokio::test]
    async fn blank_prompt_never_reaches_the_transport() {
        let (api, orchestrator, store) = orchestrator(FakeApi::default());
        for prompt in ["", "   ", "\t\n"] {
            let err = orchestrator
                .generate(&GenerationParameters::new(prompt))
                .await
                .unwrap_err();
            assert!(err.is_validation());
        }
        assert_eq!(api.count("generate"), 0);
        assert!(!store.read(|s| s.is_generating()));
        assert!(store.read(|s| s.generation_error().is_some()));
        assert!(store.read(|s| s.notification().is_none()));
    }

    #[tokio::test]
    async fn new_images_precede_existing_ones() {
        let api = FakeApi::default();
        api.respond_with_images(&["a.png", "b.png"]);
        let (api, orchestrator, store) = orchestrator(api);
        orchestrator
            .generate(&GenerationParameters::new("first").with_image_count(2))
            .await
            .unwrap();

        api.respond_with_images(&["c.png", "d.png", "e.png"]);
        let outcome = orchestrator
            .generate(&GenerationParameters::new("second").with_image_count(3))
            .await
            .unwrap();

        assert!(matches!(outcome, GenerationOutcome::Completed { images: 3, .. }));
        assert_eq!(
            gallery_names(&store),
            ["c.png", "d.png", "e.png", "a.png", "b.png"]
        );
    }

    #[tokio::test]
    async fn failure_leaves_the_gallery_untouched() {
        let api = FakeApi::default();
        api.respond_with_images(&["keep.png"]);
        let (api, orchestrator, store) = orchestrator(api);
        orchestrator
            .generate(&GenerationParameters::new("ok"))
            .await
            .unwrap();

        api.respond_with_error(StudioError::backend(500, "CUDA out of memory"));
        let err = orchestrator
            .generate(&GenerationParameters::new("too big").with_image_count(4))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(500));
        assert_eq!(gallery_names(&store), ["keep.png"]);
        assert!(!store.read(|s| s.is_generating()));
        assert_eq!(store.read(|s| s.gallery().placeholder_count()), 0);
        assert_eq!(
            store.read(|s| s.generation_error().map(str::to_string)),
            Some("CUDA out of memory".to_string())
        );
        let note = store.read(|s| s.notification().cloned()).unwrap();
        assert_eq!(note.kind, NotificationKind::Error);
    }

    #[tokio::test]
    async fn transport_failure_resets_to_idle() {
        let api = FakeApi::default();
        api.respond_with_error(StudioError::Transport("operation timed out".into()));
        let (_api, orchestrator, store) = orchestrator(api);
        let err = orchestrator
            .generate(&GenerationParameters::new("fox"))
            .await
            .unwrap_err();
        assert!(matches!(err, StudioError::Transport(_)));
        assert!(!orchestrator.is_generating());
        assert!(store.read(|s| s.gallery().is_empty()));
    }

    #[tokio::test]
    async fn second_request_while_generating_is_ignored() {
        let (api, gate) = gated();
        api.respond_with_images(&["one.png"]);
        let (api, orchestrator, store) = orchestrator(api);

        let task = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .generate(&GenerationParameters::new("first"))
                    .await
            })
        };
        wait_for_request(&api, 1).await;

        let second = orchestrator
            .generate(&GenerationParameters::new("second").with_image_count(3))
            .await
            .unwrap();
        assert_eq!(second, GenerationOutcome::AlreadyRunning);
        assert_eq!(store.read(|s| s.gallery().placeholder_count()), 1);

        gate.notify_one();
        task.await.unwrap().unwrap();
        assert_eq!(api.count("generate"), 1);
        assert_eq!(gallery_names(&store), ["one.png"]);
    }

    #[tokio::test]
    async fn dropping_the_request_returns_to_idle() {
        let (api, _gate) = gated();
        let (api, orchestrator, store) = orchestrator(api);

        let task = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .generate(&GenerationParameters::new("never finishes").with_image_count(2))
                    .await
            })
        };
        wait_for_request(&api, 1).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(!store.read(|s| s.is_generating()));
        assert_eq!(store.read(|s| s.gallery().placeholder_count()), 0);
    }

    #[tokio::test]
    async fn request_carries_active_lora_weights() {
        let api = FakeApi::with_loras(vec![lora(1, "sdxl", true), lora(2, "sdxl", false)]);
        api.respond_with_images(&["x.png"]);
        let (api, orchestrator, store) = orchestrator(api);
        store.dispatch(StudioEvent::LorasReplaced {
            listed: api.loras.lock().unwrap().clone(),
            active: vec![lora(1, "sdxl", true)],
        });
        store.dispatch(StudioEvent::LoraWeightSet { id: 1, weight: 0.6 });

        orchestrator
            .generate(&GenerationParameters::new("styled"))
            .await
            .unwrap();
        let request = api.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.loras, vec![LoraWeight { id: 1, weight: 0.6 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn red_fox_end_to_end() {
        let api = FakeApi::default();
        api.respond_with_images(&["fox_0.png", "fox_1.png"]);
        let (api, orchestrator, store) = orchestrator(api);
        store.dispatch(StudioEvent::GenerationSucceeded {
            token: RequestToken(0),
            images: vec![GeneratedImage::new("older.png", "/outputs/older.png", vec![1])],
        });

        let params = GenerationParameters::new("a red fox")
            .with_size(512, 512)
            .with_steps(30)
            .with_guidance(7.5)
            .with_image_count(2)
            .with_seed(None);
        orchestrator.generate(&params).await.unwrap();

        let request = api.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.seed, None);
        assert_eq!(request.num_images, 2);
        assert_eq!(
            gallery_names(&store),
            ["fox_0.png", "fox_1.png", "older.png"]
        );
        assert!(!orchestrator.is_generating());
        assert_eq!(
            store.read(|s| s.notification().map(|n| n.kind)),
            Some(NotificationKind::Success)
        );

        tokio::time::sleep(DEFAULT_SUCCESS_DISMISS + Duration::from_millis(1)).await;
        assert!(store.read(|s| s.notification().is_none()));
    }

    #[tokio::test]
    async fn download_reads_from_the_gallery() {
        let api = FakeApi::default();
        api.respond_with_images(&["fox.png"]);
        let (_api, orchestrator, _store) = orchestrator(api);
        orchestrator
            .generate(&GenerationParameters::new("fox"))
            .await
            .unwrap();
        let blob = orchestrator.download("fox.png").unwrap();
        assert_eq!(blob.mime, "image/png");
        assert!(!blob.bytes.is_empty());
        assert!(orchestrator.download("nope.png").is_err());
    }
}

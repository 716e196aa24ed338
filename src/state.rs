//! Application state and the events that mutate it.
//!
//! All mutation goes through [`AppState::apply`]; components hold a
//! [`Store`] handle and never touch the fields directly.

use crate::{
    catalog::ModelCatalog,
    gallery::Gallery,
    lora::LoraMirror,
    model::{DeviceStatus, GeneratedImage, Lora, ModelInfo},
    notify::Notification,
};
use std::{
    fmt,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
};

/// Identity of one generation request.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestToken(pub(crate) u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GenerationPhase {
    #[default]
    Idle,
    Generating {
        token: RequestToken,
        placeholders: usize,
    },
}

#[derive(Clone, Debug)]
pub enum StudioEvent {
    GenerationStarted {
        token: RequestToken,
        placeholders: usize,
    },
    GenerationSucceeded {
        token: RequestToken,
        images: Vec<GeneratedImage>,
    },
    GenerationFailed {
        token: RequestToken,
        message: String,
    },
    /// Parameters failed client-side checks; nothing was sent.
    GenerationRejected {
        message: String,
    },
    GenerationErrorCleared,
    GalleryCleared,
    NotificationShown(Notification),
    /// `None` hides whatever is shown; `Some(id)` only hides that notification.
    NotificationHidden {
        id: Option<u64>,
    },
    DeviceStatusUpdated(DeviceStatus),
    LorasReplaced {
        listed: Vec<Lora>,
        active: Vec<Lora>,
    },
    /// The service accepted an activation change for one adapter.
    LoraActivationConfirmed {
        id: i64,
        is_active: bool,
        weight: f32,
    },
    LorasDeactivated,
    LoraWeightSet {
        id: i64,
        weight: f32,
    },
    /// The service stored a new weight outside an activation call.
    LoraWeightCommitted {
        id: i64,
    },
    ModelsReplaced(Vec<ModelInfo>),
    CurrentModelChanged(Option<String>),
    ModelLoading(bool),
}

#[derive(Debug, Default)]
pub struct AppState {
    phase: GenerationPhase,
    next_token: u64,
    generation_error: Option<String>,
    gallery: Gallery,
    notification: Option<Notification>,
    device: Option<DeviceStatus>,
    loras: LoraMirror,
    models: ModelCatalog,
}

impl AppState {
    pub fn phase(&self) -> GenerationPhase {
        self.phase
    }

    pub fn is_generating(&self) -> bool {
        matches!(self.phase, GenerationPhase::Generating { .. })
    }

    /// Inline error from the last failed generation.
    pub fn generation_error(&self) -> Option<&str> {
        self.generation_error.as_deref()
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn notification(&self) -> Option<&Notification> {
        self.notification.as_ref()
    }

    pub fn device(&self) -> Option<&DeviceStatus> {
        self.device.as_ref()
    }

    pub fn loras(&self) -> &LoraMirror {
        &self.loras
    }

    pub fn models(&self) -> &ModelCatalog {
        &self.models
    }

    /// Applies one event. Returns `false` when the event was stale and
    /// left the state untouched.
    pub fn apply(&mut self, event: &StudioEvent) -> bool {
        match event {
            StudioEvent::GenerationStarted {
                token,
                placeholders,
            } => {
                if self.is_generating() {
                    return false;
                }
                self.phase = GenerationPhase::Generating {
                    token: *token,
                    placeholders: *placeholders,
                };
                self.generation_error = None;
                self.gallery.begin(*token, *placeholders);
                true
            }
            StudioEvent::GenerationSucceeded { token, images } => {
                self.gallery.complete(*token, images.clone());
                self.finish(*token);
                true
            }
            StudioEvent::GenerationFailed { token, message } => {
                self.gallery.abandon(*token);
                self.generation_error = Some(message.clone());
                self.finish(*token);
                true
            }
            StudioEvent::GenerationRejected { message } => {
                self.generation_error = Some(message.clone());
                true
            }
            StudioEvent::GenerationErrorCleared => self.generation_error.take().is_some(),
            StudioEvent::GalleryCleared => {
                self.gallery.clear();
                true
            }
            StudioEvent::NotificationShown(notification) => {
                self.notification = Some(notification.clone());
                true
            }
            StudioEvent::NotificationHidden { id } => match (id, &self.notification) {
                (Some(id), Some(current)) if current.id != *id => false,
                (_, None) => false,
                _ => {
                    self.notification = None;
                    true
                }
            },
            StudioEvent::DeviceStatusUpdated(status) => {
                self.device = Some(status.clone());
                true
            }
            StudioEvent::LorasReplaced { listed, active } => {
                self.loras.replace(listed.clone(), active.clone());
                true
            }
            StudioEvent::LoraActivationConfirmed {
                id,
                is_active,
                weight,
            } => self.loras.confirm(*id, *is_active, *weight),
            StudioEvent::LorasDeactivated => {
                self.loras.deactivate_all();
                true
            }
            StudioEvent::LoraWeightSet { id, weight } => self.loras.set_weight(*id, *weight),
            StudioEvent::LoraWeightCommitted { id } => self.loras.forget_local_weight(*id),
            StudioEvent::ModelsReplaced(models) => {
                self.models.replace(models.clone());
                true
            }
            StudioEvent::CurrentModelChanged(key) => {
                self.models.set_current(key.clone());
                true
            }
            StudioEvent::ModelLoading(loading) => {
                self.models.set_loading(*loading);
                true
            }
        }
    }

    fn finish(&mut self, token: RequestToken) {
        if let GenerationPhase::Generating { token: current, .. } = self.phase {
            if current == token {
                self.phase = GenerationPhase::Idle;
            }
        }
    }

    fn allocate_token(&mut self) -> RequestToken {
        self.next_token += 1;
        RequestToken(self.next_token)
    }
}

/// Shared handle to the application state. Cloning is cheap; every clone
/// sees the same state and the same subscribers.
#[derive(Clone, Debug, Default)]
pub struct Store {
    state: Arc<Mutex<AppState>>,
    subscribers: Arc<Mutex<Vec<Sender<StudioEvent>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&self, event: StudioEvent) -> bool {
        let applied = self
            .state
            .lock()
            .expect("app state poisoned")
            .apply(&event);
        if applied {
            self.publish(event);
        }
        applied
    }

    /// Atomically moves Idle to Generating. Returns `None` when a request
    /// is already in flight.
    pub(crate) fn begin_generation(&self, placeholders: usize) -> Option<RequestToken> {
        let (token, event) = {
            let mut state = self.state.lock().expect("app state poisoned");
            if state.is_generating() {
                return None;
            }
            let token = state.allocate_token();
            let event = StudioEvent::GenerationStarted {
                token,
                placeholders,
            };
            state.apply(&event);
            (token, event)
        };
        self.publish(event);
        Some(token)
    }

    pub fn read<R>(&self, f: impl FnOnce(&AppState) -> R) -> R {
        f(&self.state.lock().expect("app state poisoned"))
    }

    /// Every applied event is delivered to the returned receiver.
    pub fn subscribe(&self) -> Receiver<StudioEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(sender);
        receiver
    }

    fn publish(&self, event: StudioEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

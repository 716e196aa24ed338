pub mod api;
pub mod app;
pub mod catalog;
pub mod config;
pub mod env_flags;
pub mod error;
pub mod gallery;
pub mod generate;
pub mod lora;
pub mod model;
pub mod notify;
pub mod poller;
pub mod state;

pub use api::{ApiClient, StudioApi};
pub use app::{build_context, AppContext, Studio};
pub use error::{StudioError, StudioResult};
pub use generate::{GenerationOutcome, Orchestrator};
pub use model::{GeneratedImage, GenerationParameters, Scheduler};
pub use state::{AppState, Store, StudioEvent};

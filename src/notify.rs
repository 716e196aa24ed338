//! Single-slot transient notifications.

use crate::state::{Store, StudioEvent};
use log::debug;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SUCCESS_DISMISS: Duration = Duration::from_millis(3000);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Loading,
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub message: String,
    pub kind: NotificationKind,
    /// Only ever set for `Success`.
    pub dismiss_after: Option<Duration>,
}

/// Owns the notification slot and its dismiss timer. Showing a new
/// notification replaces the old one and cancels its timer.
#[derive(Debug)]
pub struct Notifier {
    store: Store,
    runtime: Handle,
    default_delay: Duration,
    next_id: AtomicU64,
    timer: Mutex<Option<CancellationToken>>,
}

impl Notifier {
    pub fn new(store: Store, runtime: Handle, default_delay: Duration) -> Self {
        Self {
            store,
            runtime,
            default_delay,
            next_id: AtomicU64::new(1),
            timer: Mutex::new(None),
        }
    }

    pub fn show(&self, message: impl Into<String>, kind: NotificationKind) -> u64 {
        self.show_with(message.into(), kind, None)
    }

    /// Like [`Notifier::show`] with a custom dismiss delay. The delay is
    /// ignored for kinds that never expire.
    pub fn show_for(
        &self,
        message: impl Into<String>,
        kind: NotificationKind,
        delay: Duration,
    ) -> u64 {
        self.show_with(message.into(), kind, Some(delay))
    }

    pub fn loading(&self, message: impl Into<String>) -> u64 {
        self.show(message, NotificationKind::Loading)
    }

    pub fn success(&self, message: impl Into<String>) -> u64 {
        self.show(message, NotificationKind::Success)
    }

    pub fn error(&self, message: impl Into<String>) -> u64 {
        self.show(message, NotificationKind::Error)
    }

    pub fn hide(&self) {
        let mut timer = self.timer.lock().expect("notification timer poisoned");
        if let Some(previous) = timer.take() {
            previous.cancel();
        }
        self.store.dispatch(StudioEvent::NotificationHidden { id: None });
    }

    pub fn current(&self) -> Option<Notification> {
        self.store.read(|state| state.notification().cloned())
    }

    fn show_with(&self, message: String, kind: NotificationKind, delay: Option<Duration>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dismiss_after = match kind {
            NotificationKind::Success => Some(delay.unwrap_or(self.default_delay)),
            NotificationKind::Loading | NotificationKind::Error => None,
        };

        let mut timer = self.timer.lock().expect("notification timer poisoned");
        if let Some(previous) = timer.take() {
            previous.cancel();
        }

        debug!("notification {id} ({kind:?}): {message}");
        self.store
            .dispatch(StudioEvent::NotificationShown(Notification {
                id,
                message,
                kind,
                dismiss_after,
            }));

        if let Some(delay) = dismiss_after {
            let cancel = CancellationToken::new();
            let guard = cancel.clone();
            let store = self.store.clone();
            self.runtime.spawn(async move {
                tokio::select! {
                    _ = guard.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        store.dispatch(StudioEvent::NotificationHidden { id: Some(id) });
                    }
                }
            });
            *timer = Some(cancel);
        }

        id
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(pending) = timer.take() {
                pending.cancel();
            }
        }
    }
}

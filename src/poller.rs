use crate::{
    api::StudioApi,
    state::{Store, StudioEvent},
};
use log::{debug, warn};
use std::{sync::Arc, time::Duration};
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Background refresh of the device status. The task lives until the
/// returned handle is stopped or dropped.
pub struct DevicePoller {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DevicePoller {
    /// Fetches once immediately, then every `period`. Failed fetches are
    /// logged and the schedule continues.
    pub fn start(
        api: Arc<dyn StudioApi>,
        store: Store,
        runtime: &Handle,
        period: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let task = runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = guard.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let fetched = tokio::select! {
                    _ = guard.cancelled() => break,
                    fetched = api.device_status() => fetched,
                };
                match fetched {
                    Ok(status) => {
                        store.dispatch(StudioEvent::DeviceStatusUpdated(status));
                    }
                    Err(err) => warn!("Device status refresh failed: {err}"),
                }
            }
            debug!("device status polling stopped");
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Cancels the interval and waits for the task to wind down.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("Device poller ended abnormally: {err}");
            }
        }
    }
}

impl Drop for DevicePoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

//! Polling route monitor
//!
//! Desktop audio servers do not expose a portable route-change callback,
//! so the monitor takes a snapshot every interval and raises a
//! [`RouteChange`] whenever it differs from the previous one.

use super::{classify_change, RouteChange, RouteProbe, RouteSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to the polling task. Dropping it stops monitoring.
pub struct RouteMonitor {
    task: JoinHandle<()>,
}

impl RouteMonitor {
    /// Start polling `probe`; `on_change` runs on the monitor task
    pub fn spawn<F>(probe: Arc<dyn RouteProbe>, interval: Duration, on_change: F) -> Self
    where
        F: Fn(RouteChange) + Send + Sync + 'static,
    {
        let task = tokio::spawn(async move {
            let mut previous: Option<RouteSnapshot> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let probe = probe.clone();
                let snapshot = match tokio::task::spawn_blocking(move || probe.snapshot()).await {
                    Ok(Ok(snapshot)) => snapshot,
                    Ok(Err(e)) => {
                        tracing::warn!("Route probe failed: {}", e);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Route probe task failed: {}", e);
                        continue;
                    }
                };

                // The first snapshot is the baseline
                if let Some(ref prev) = previous {
                    if let Some(reason) = classify_change(prev, &snapshot) {
                        tracing::debug!("Route changed: {:?}", reason);
                        on_change(RouteChange {
                            reason,
                            snapshot: snapshot.clone(),
                        });
                    }
                }
                previous = Some(snapshot);
            }
        });

        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for RouteMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

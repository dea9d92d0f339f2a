use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{Delivery, PresenceSink};
use crate::transport::PresenceMode;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically re-publishes presence. Each tick doubles as a liveness check,
/// since publishing reconnects a dropped session.
pub struct Heartbeat {
    sink: Arc<dyn PresenceSink>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Heartbeat {
    pub fn new(sink: Arc<dyn PresenceSink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the heartbeat task. Returns false if one is already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
        {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(beat(self.sink.clone(), self.interval, cancel.clone()));
        *running = Some(Running { cancel, handle });
        info!(interval_secs = self.interval.as_secs(), "heartbeat started");
        true
    }

    /// Stop the heartbeat and wait for an in-flight tick to finish.
    /// No presence is published by the task once this returns.
    pub async fn stop(&self) {
        let Some(task) = self.running.lock().await.take() else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }
        info!("heartbeat stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

async fn beat(sink: Arc<dyn PresenceSink>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match sink.publish_presence(PresenceMode::Available).await {
            Delivery::Sent => debug!("heartbeat presence published"),
            other => debug!(delivery = ?other, "heartbeat presence not delivered"),
        }
    }
}

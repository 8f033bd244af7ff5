use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::debounce::{DebounceMode, Debouncer};
use crate::bus::{BusError, TelemetryBus, ValueEvent};

/// One forwarded path and how often it may be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSpec {
    pub path: String,
    pub min_interval: Duration,
    pub mode: DebounceMode,
}

impl PathSpec {
    pub fn new(path: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            path: path.into(),
            min_interval,
            mode: DebounceMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: DebounceMode) -> Self {
        self.mode = mode;
        self
    }
}

/// A debounced bus subscription running in its own task.
///
/// Shutting down cancels any pending window timer and drops the upstream
/// receiver, which releases the bus subscription.
pub struct PathSubscription {
    path: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl PathSubscription {
    pub fn spawn<B: TelemetryBus + ?Sized>(
        bus: &B,
        spec: PathSpec,
        output: mpsc::Sender<ValueEvent>,
    ) -> Result<Self, BusError> {
        let upstream = bus.subscribe(&spec.path)?;
        let path = spec.path.clone();
        info!(
            "Subscribing to {} with minimum interval {:?} ({:?})",
            spec.path, spec.min_interval, spec.mode
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_handle = tokio::spawn(run_debounced(spec, upstream, output, shutdown_rx));

        Ok(Self {
            path,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        })
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                debug!("Subscription task for {} already finished", self.path);
            }
        }

        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                warn!("Subscription task for {} panicked: {}", self.path, e);
            }
            debug!("Unsubscribed from {}", self.path);
        }
    }
}

async fn run_debounced(
    spec: PathSpec,
    mut upstream: mpsc::UnboundedReceiver<ValueEvent>,
    output: mpsc::Sender<ValueEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut debouncer = Debouncer::new(spec.min_interval, spec.mode);

    loop {
        let deadline = debouncer.deadline();
        let emitted = tokio::select! {
            _ = &mut shutdown_rx => break,

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                debouncer.expire(Instant::now())
            }

            received = upstream.recv() => match received {
                Some(mut event) => {
                    event.path.clone_from(&spec.path);
                    debouncer.offer(event, Instant::now())
                }
                None => {
                    info!("Bus closed subscription for {}", spec.path);
                    break;
                }
            },
        };

        if let Some(event) = emitted {
            debug!("Emitting debounced value for {}", spec.path);
            if output.send(event).await.is_err() {
                debug!("Forwarding pipeline gone, stopping {}", spec.path);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use chrono::Utc;
    use serde_json::json;

    const PATH: &str = "navigation.position";

    fn value(n: i64) -> ValueEvent {
        ValueEvent::new(PATH, json!(n), Utc::now(), "test")
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    fn spawn(bus: &MemoryBus, mode: DebounceMode) -> (PathSubscription, mpsc::Receiver<ValueEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let spec = PathSpec::new(PATH, Duration::from_secs(60)).with_mode(mode);
        (PathSubscription::spawn(bus, spec, tx).unwrap(), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_emits_first_then_one_per_window() {
        let bus = MemoryBus::new("vessels.self");
        let (mut subscription, mut rx) = spawn(&bus, DebounceMode::Latest);

        bus.publish(value(1)).unwrap();
        advance(3).await;
        bus.publish(value(2)).unwrap();
        advance(4).await;
        bus.publish(value(3)).unwrap();
        advance(3).await;

        assert_eq!(rx.recv().await.unwrap().value, json!(1));
        assert!(rx.try_recv().is_err());

        // window opened at t=0 closes at t=60 with the newest pending value
        advance(50).await;
        assert_eq!(rx.recv().await.unwrap().value, json!(3));

        advance(5).await;
        bus.publish(value(4)).unwrap();
        advance(1).await;
        assert!(rx.try_recv().is_err());

        advance(60).await;
        assert_eq!(rx.recv().await.unwrap().value, json!(4));

        subscription.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn drop_mode_matches_sixty_second_scenario() {
        let bus = MemoryBus::new("vessels.self");
        let (mut subscription, mut rx) = spawn(&bus, DebounceMode::Drop);

        bus.publish(value(1)).unwrap();
        advance(4).await;
        bus.publish(value(2)).unwrap();
        advance(4).await;
        bus.publish(value(3)).unwrap();
        advance(2).await;

        assert_eq!(rx.recv().await.unwrap().value, json!(1));

        advance(55).await;
        assert!(rx.try_recv().is_err());

        bus.publish(value(4)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(rx.recv().await.unwrap().value, json!(4));

        subscription.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_bus_subscription_and_pending_timer() {
        let bus = MemoryBus::new("vessels.self");
        let (mut subscription, mut rx) = spawn(&bus, DebounceMode::Latest);

        bus.publish(value(1)).unwrap();
        bus.publish(value(2)).unwrap();
        assert_eq!(rx.recv().await.unwrap().value, json!(1));

        subscription.shutdown().await;
        subscription.shutdown().await;

        assert_eq!(bus.subscriber_count(PATH), 0);
        advance(120).await;
        assert!(rx.recv().await.is_none());
    }
}

use std::time::Duration;

use rumqttc::AsyncClient;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::ValueEvent;
use crate::mqtt::{ConnectionState, DeliveryClient, OutgoingMessage, OutgoingQueue, RemotePublisher};

/// How long a connected pipeline waits before pushing a stalled backlog into
/// the transport again.
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Turns debounced values into deltas for the remote broker.
///
/// Owns the outgoing queue outright: appends and drains both happen on the
/// pipeline task, so a value racing a reconnect is delivered exactly once
/// whichever of the two is handled first.
pub struct ForwardingPipeline<P: RemotePublisher = AsyncClient> {
    context: String,
    queue: OutgoingQueue,
    delivery: DeliveryClient<P>,
    events: mpsc::Receiver<ValueEvent>,
}

impl<P: RemotePublisher> ForwardingPipeline<P> {
    pub fn new(
        context: impl Into<String>,
        queue: OutgoingQueue,
        delivery: DeliveryClient<P>,
        events: mpsc::Receiver<ValueEvent>,
    ) -> Self {
        Self {
            context: context.into(),
            queue,
            delivery,
            events,
        }
    }

    /// Publishes the value now if the broker is reachable, otherwise queues it.
    pub fn handle_value(&mut self, event: ValueEvent) {
        let message = match OutgoingMessage::from_value(&self.context, &event) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode delta for {}: {}", event.path, e);
                return;
            }
        };

        if !self.delivery.connected() {
            debug!("Remote broker offline, queueing value for {}", event.path);
            self.queue.push(message);
            return;
        }

        if !self.queue.is_empty() {
            // older messages still waiting; keep FIFO order
            self.queue.push(message);
            self.flush_queue();
            return;
        }

        if let Err(e) = self.delivery.publish(&message) {
            warn!("Publish for {} rejected, queueing: {}", event.path, e);
            self.queue.push(message);
        }
    }

    /// Sends every queued message in insertion order. Returns how many went
    /// out.
    pub fn flush_queue(&mut self) -> usize {
        if self.queue.is_empty() {
            return 0;
        }

        let delivery = &self.delivery;
        match self.queue.drain_with(|message| delivery.publish(message)) {
            Ok(sent) => {
                info!("Resent {} stored outgoing messages", sent);
                sent
            }
            Err((sent, e)) => {
                debug!(
                    "Resend stopped after {} messages, {} still queued: {}",
                    sent,
                    self.queue.len(),
                    e
                );
                sent
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn evicted(&self) -> u64 {
        self.queue.evicted()
    }

    /// Runs until shut down or until every value producer is gone.
    ///
    /// While connected with messages still queued, the queue is retried every
    /// [`RETRY_INTERVAL`] until the transport has taken all of them.
    pub async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) -> Self {
        info!("Forwarding pipeline started for {}", self.context);
        let mut transport_alive = true;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("Shutdown signal received for forwarding pipeline");
                    break;
                }

                changed = self.delivery.changed(), if transport_alive => match changed {
                    Some(ConnectionState::Connected) => {
                        self.flush_queue();
                    }
                    Some(ConnectionState::Disconnected) => {
                        debug!("Remote broker offline, buffering outgoing values");
                    }
                    None => {
                        warn!("Remote transport closed, buffering outgoing values");
                        transport_alive = false;
                    }
                },

                _ = tokio::time::sleep(RETRY_INTERVAL),
                    if self.delivery.connected() && !self.queue.is_empty() =>
                {
                    self.flush_queue();
                }

                received = self.events.recv() => match received {
                    Some(event) => self.handle_value(event),
                    None => {
                        info!("All path subscriptions closed");
                        break;
                    }
                },
            }
        }

        if !self.queue.is_empty() {
            warn!(
                "Forwarding pipeline stopped with {} undelivered messages",
                self.queue.len()
            );
        }
        if self.queue.evicted() > 0 {
            warn!(
                "Forwarding pipeline evicted {} messages from a full queue",
                self.queue.evicted()
            );
        }
        self
    }

    pub fn report(&self) -> PipelineReport {
        PipelineReport {
            queued: self.queued(),
            evicted: self.evicted(),
        }
    }

    pub fn spawn(self) -> PipelineHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_handle = tokio::spawn(async move {
            let pipeline = self.run(shutdown_rx).await;
            pipeline.report()
        });

        PipelineHandle {
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        }
    }
}

/// Queue figures of a stopped pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Messages never handed to the transport.
    pub queued: usize,
    /// Messages dropped because the queue was full.
    pub evicted: u64,
}

/// Handle for a pipeline running in a tokio task.
pub struct PipelineHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<PipelineReport>>,
}

impl PipelineHandle {
    /// Stops the pipeline and reports what was left in its queue. Later calls
    /// return an empty report.
    pub async fn shutdown(&mut self) -> PipelineReport {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                debug!("Forwarding pipeline already stopped");
            }
        }

        match self.task_handle.take() {
            Some(handle) => match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("Forwarding pipeline task panicked: {}", e);
                    PipelineReport::default()
                }
            },
            None => PipelineReport::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Delta;
    use crate::mqtt::DeliveryError;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    /// `free_slots` models the transport's request channel: `None` never
    /// fills up, `Some(n)` accepts `n` more messages before rejecting.
    #[derive(Clone, Default)]
    struct RecordingPublisher {
        published: Arc<Mutex<Vec<OutgoingMessage>>>,
        reject: Arc<AtomicBool>,
        free_slots: Arc<Mutex<Option<usize>>>,
    }

    impl RecordingPublisher {
        fn values(&self) -> Vec<serde_json::Value> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|m| {
                    let delta = Delta::from_json_slice(m.payload()).unwrap();
                    delta.updates[0].values[0].value.clone()
                })
                .collect()
        }
    }

    impl RemotePublisher for RecordingPublisher {
        fn publish(&self, message: &OutgoingMessage) -> Result<(), DeliveryError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(DeliveryError::Task("request channel closed".into()));
            }
            if let Some(slots) = self.free_slots.lock().unwrap().as_mut() {
                if *slots == 0 {
                    return Err(DeliveryError::Task("request channel full".into()));
                }
                *slots -= 1;
            }
            self.published.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Fixture {
        pipeline: ForwardingPipeline<RecordingPublisher>,
        publisher: RecordingPublisher,
        state: watch::Sender<ConnectionState>,
        events: mpsc::Sender<ValueEvent>,
    }

    fn fixture() -> Fixture {
        fixture_with_capacity(None)
    }

    fn fixture_with_capacity(capacity: Option<usize>) -> Fixture {
        let publisher = RecordingPublisher::default();
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, events_rx) = mpsc::channel(16);
        let pipeline = ForwardingPipeline::new(
            "vessels.self",
            OutgoingQueue::new(capacity),
            DeliveryClient::new(publisher.clone(), state_rx),
            events_rx,
        );
        Fixture {
            pipeline,
            publisher,
            state,
            events,
        }
    }

    fn value(n: i64) -> ValueEvent {
        ValueEvent::new("navigation.speedOverGround", json!(n), Utc::now(), "test")
    }

    #[test]
    fn connected_values_publish_immediately() {
        let mut f = fixture();
        f.state.send(ConnectionState::Connected).unwrap();

        f.pipeline.handle_value(value(1));

        assert_eq!(f.publisher.values(), vec![json!(1)]);
        assert_eq!(f.pipeline.queued(), 0);
    }

    #[test]
    fn reconnect_drains_queue_in_order() {
        let mut f = fixture();
        f.pipeline.handle_value(value(1));
        f.pipeline.handle_value(value(2));
        assert!(f.publisher.values().is_empty());
        assert_eq!(f.pipeline.queued(), 2);

        f.state.send(ConnectionState::Connected).unwrap();
        assert_eq!(f.pipeline.flush_queue(), 2);

        assert_eq!(f.publisher.values(), vec![json!(1), json!(2)]);
        assert_eq!(f.pipeline.queued(), 0);
    }

    #[test]
    fn append_seen_connected_before_drain_keeps_order() {
        let mut f = fixture();
        f.pipeline.handle_value(value(1));
        f.pipeline.handle_value(value(2));

        // state flips but the transition has not been handled yet
        f.state.send(ConnectionState::Connected).unwrap();
        f.pipeline.handle_value(value(3));
        f.pipeline.flush_queue();

        assert_eq!(f.publisher.values(), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn drain_then_append_delivers_each_once() {
        let mut f = fixture();
        f.pipeline.handle_value(value(1));
        f.state.send(ConnectionState::Connected).unwrap();

        f.pipeline.flush_queue();
        f.pipeline.handle_value(value(2));
        f.pipeline.flush_queue();

        assert_eq!(f.publisher.values(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn rejected_publish_is_requeued() {
        let mut f = fixture();
        f.state.send(ConnectionState::Connected).unwrap();
        f.publisher.reject.store(true, Ordering::SeqCst);

        f.pipeline.handle_value(value(1));
        assert_eq!(f.pipeline.queued(), 1);

        f.publisher.reject.store(false, Ordering::SeqCst);
        f.pipeline.handle_value(value(2));

        assert_eq!(f.publisher.values(), vec![json!(1), json!(2)]);
        assert_eq!(f.pipeline.queued(), 0);
    }

    #[tokio::test]
    async fn running_pipeline_flushes_on_connect() {
        let f = fixture();
        let publisher = f.publisher.clone();
        let mut handle = f.pipeline.spawn();

        f.events.send(value(1)).await.unwrap();
        f.events.send(value(2)).await.unwrap();
        tokio::task::yield_now().await;

        f.state.send(ConnectionState::Connected).unwrap();
        f.events.send(value(3)).await.unwrap();

        for _ in 0..100 {
            if publisher.values().len() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(publisher.values(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(handle.shutdown().await.queued, 0);
        assert_eq!(handle.shutdown().await, PipelineReport::default());
    }

    #[tokio::test]
    async fn pipeline_keeps_buffering_after_transport_is_gone() {
        let f = fixture();
        let publisher = f.publisher.clone();
        let mut handle = f.pipeline.spawn();

        drop(f.state);
        f.events.send(value(1)).await.unwrap();
        f.events.send(value(2)).await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(publisher.values().is_empty());
        assert_eq!(handle.shutdown().await.queued, 2);
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_larger_than_transport_channel_drains_without_new_values() {
        let f = fixture();
        let publisher = f.publisher.clone();
        *publisher.free_slots.lock().unwrap() = Some(100);
        let mut handle = f.pipeline.spawn();

        for n in 0..150 {
            f.events.send(value(n)).await.unwrap();
        }
        settle().await;
        assert!(publisher.values().is_empty());

        f.state.send(ConnectionState::Connected).unwrap();
        settle().await;
        assert_eq!(publisher.values().len(), 100);

        // event loop catches up; no further values arrive
        *publisher.free_slots.lock().unwrap() = None;
        tokio::time::sleep(RETRY_INTERVAL * 2).await;
        settle().await;

        let expected: Vec<_> = (0..150).map(|n| json!(n)).collect();
        assert_eq!(publisher.values(), expected);
        assert_eq!(handle.shutdown().await.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_single_publish_is_retried_while_connected() {
        let f = fixture();
        let publisher = f.publisher.clone();
        f.state.send(ConnectionState::Connected).unwrap();
        publisher.reject.store(true, Ordering::SeqCst);
        let mut handle = f.pipeline.spawn();

        f.events.send(value(1)).await.unwrap();
        settle().await;
        assert!(publisher.values().is_empty());

        publisher.reject.store(false, Ordering::SeqCst);
        tokio::time::sleep(RETRY_INTERVAL * 2).await;
        settle().await;

        assert_eq!(publisher.values(), vec![json!(1)]);
        assert_eq!(handle.shutdown().await.queued, 0);
    }

    #[tokio::test]
    async fn shutdown_reports_evictions() {
        let f = fixture_with_capacity(Some(2));
        let mut handle = f.pipeline.spawn();

        for n in 0..5 {
            f.events.send(value(n)).await.unwrap();
        }
        settle().await;

        let report = handle.shutdown().await;
        assert_eq!(report, PipelineReport { queued: 2, evicted: 3 });
    }
}

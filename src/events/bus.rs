//! In-process publish/subscribe bus with a bounded replay window.
//!
//! Delivery is best-effort: `publish` never blocks and never fails. Each
//! subscriber owns a bounded channel; when it is full the event is dropped
//! for that subscriber only and counted. A subscriber whose receiver is gone
//! is removed on the next publish.
//!
//! History snapshot and subscriber registration happen in the same critical
//! section as publication, so a subscriber sees every event exactly once:
//! either in its replay or live, never both and never neither (replay
//! overflow aside).

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

use super::event::{Event, SSE_KEEPALIVE};
use crate::metrics::MetricsCollector;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Max event bus subscribers reached ({max})")]
    TooManySubscribers { max: usize },
}

/// Event bus limits.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Events kept for replay.
    pub buffer_size: usize,
    pub max_subscribers: usize,
    /// Per-subscriber channel capacity.
    pub subscriber_capacity: usize,
    /// Idle interval after which SSE streams emit a keepalive comment.
    pub keepalive_interval: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            max_subscribers: 100,
            subscriber_capacity: 50,
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

impl EventBusConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_max_subscribers(mut self, max: usize) -> Self {
        self.max_subscribers = max;
        self
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

/// Snapshot of bus counters for the health interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventBusStats {
    pub active_subscribers: usize,
    pub max_subscribers: usize,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub buffer_size: usize,
    pub buffer_capacity: usize,
}

/// Anything that accepts published events.
pub trait EventSink: Send + Sync {
    fn publish(
        &self,
        event_type: &str,
        job_id: Option<&str>,
        data: Option<Value>,
        metadata: Option<Value>,
    ) -> Event;
}

struct Subscriber {
    filter: Option<HashSet<String>>,
    tx: mpsc::Sender<Event>,
}

impl Subscriber {
    fn wants(&self, event: &Event) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |types| types.contains(&event.event_type))
    }
}

#[derive(Default)]
struct BusState {
    history: VecDeque<Event>,
    subscribers: HashMap<u64, Subscriber>,
    next_seq: u64,
    next_subscriber: u64,
}

struct BusInner {
    config: EventBusConfig,
    state: Mutex<BusState>,
    emitted: AtomicU64,
    dropped: AtomicU64,
    metrics: MetricsCollector,
}

impl BusInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().expect("event bus lock poisoned")
    }

    fn remove(&self, id: u64) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }
}

/// Shared handle to the event bus. Cloning is cheap.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                state: Mutex::new(BusState::default()),
                emitted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                metrics: MetricsCollector,
            }),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// Opens a subscription.
    ///
    /// `event_types` restricts delivery to the named types. With
    /// `include_history`, buffered events published before this call are
    /// queued first; replay stops early if the channel fills.
    pub fn subscribe(
        &self,
        event_types: Option<Vec<String>>,
        include_history: bool,
    ) -> Result<Subscription, EventBusError> {
        let config = &self.inner.config;
        let (tx, rx) = mpsc::channel(config.subscriber_capacity.max(1));
        let subscriber = Subscriber {
            filter: event_types.map(|types| types.into_iter().collect()),
            tx,
        };

        let mut state = self.inner.lock();
        if state.subscribers.len() >= config.max_subscribers {
            return Err(EventBusError::TooManySubscribers {
                max: config.max_subscribers,
            });
        }

        if include_history {
            let mut replayed = 0usize;
            for event in state.history.iter().filter(|e| subscriber.wants(e)) {
                if subscriber.tx.try_send(event.clone()).is_err() {
                    debug!(replayed = replayed, "Subscriber channel full during replay");
                    break;
                }
                replayed += 1;
            }
        }

        state.next_subscriber += 1;
        let id = state.next_subscriber;
        state.subscribers.insert(id, subscriber);
        let active = state.subscribers.len();
        drop(state);

        debug!(subscriber_id = id, active = active, "Event bus subscriber added");
        let cancel = CancellationToken::new();
        Ok(Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
        })
    }

    /// Removes a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscriber_id: u64) -> bool {
        let removed = self.inner.remove(subscriber_id);
        if removed {
            debug!(subscriber_id = subscriber_id, "Event bus subscriber removed");
        }
        removed
    }

    /// Publishes an event to the replay buffer and every matching subscriber.
    pub fn publish(
        &self,
        event_type: &str,
        job_id: Option<&str>,
        data: Option<Value>,
        metadata: Option<Value>,
    ) -> Event {
        let config = &self.inner.config;
        let mut dropped = 0u64;
        let mut dead = Vec::new();

        let mut state = self.inner.lock();
        state.next_seq += 1;
        let event = Event::new(
            state.next_seq,
            event_type,
            job_id.map(str::to_string),
            data,
            metadata,
        );

        if config.buffer_size > 0 {
            if state.history.len() >= config.buffer_size {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
        }

        for (id, subscriber) in state.subscribers.iter() {
            if !subscriber.wants(&event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in &dead {
            state.subscribers.remove(id);
        }
        drop(state);

        self.inner.emitted.fetch_add(1, Ordering::Relaxed);
        if dropped > 0 {
            self.inner.dropped.fetch_add(dropped, Ordering::Relaxed);
            debug!(event_type = event_type, dropped = dropped, "Dropped event for slow subscribers");
        }
        if !dead.is_empty() {
            warn!(count = dead.len(), "Removed disconnected event bus subscribers");
        }
        self.inner.metrics.record_event(dropped);

        event
    }

    pub fn stats(&self) -> EventBusStats {
        let state = self.inner.lock();
        EventBusStats {
            active_subscribers: state.subscribers.len(),
            max_subscribers: self.inner.config.max_subscribers,
            events_emitted: self.inner.emitted.load(Ordering::Relaxed),
            events_dropped: self.inner.dropped.load(Ordering::Relaxed),
            buffer_size: state.history.len(),
            buffer_capacity: self.inner.config.buffer_size,
        }
    }

    /// Events for a streaming endpoint. The stream ends when `cancel` fires
    /// (client disconnect) and the subscription is released.
    pub fn stream(
        &self,
        event_types: Option<Vec<String>>,
        include_history: bool,
        cancel: CancellationToken,
    ) -> Result<impl Stream<Item = Event> + Send + 'static, EventBusError> {
        let mut subscription = self.subscribe(event_types, include_history)?;
        Ok(async_stream::stream! {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => yield event,
                        None => break,
                    },
                }
            }
        })
    }

    /// SSE frames for a streaming endpoint, with a keepalive comment after
    /// each idle `keepalive_interval`.
    pub fn sse_stream(
        &self,
        event_types: Option<Vec<String>>,
        include_history: bool,
        cancel: CancellationToken,
    ) -> Result<impl Stream<Item = String> + Send + 'static, EventBusError> {
        let keepalive = self.inner.config.keepalive_interval;
        let mut subscription = self.subscribe(event_types, include_history)?;
        Ok(async_stream::stream! {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => yield event.to_sse(),
                        None => break,
                    },
                    _ = tokio::time::sleep(keepalive) => yield SSE_KEEPALIVE.to_string(),
                }
            }
        })
    }
}

impl EventSink for EventBus {
    fn publish(
        &self,
        event_type: &str,
        job_id: Option<&str>,
        data: Option<Value>,
        metadata: Option<Value>,
    ) -> Event {
        EventBus::publish(self, event_type, job_id, data, metadata)
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    bus: Weak<BusInner>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token the consuming layer cancels on client disconnect.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the next event. Returns `None` once cancelled or removed.
    pub async fn recv(&mut self) -> Option<Event> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn bus_with(config: EventBusConfig) -> EventBus {
        EventBus::new(config)
    }

    fn types(sub: &mut Subscription) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(event) = sub.try_recv() {
            out.push(event.event_type);
        }
        out
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let bus = EventBus::default();
        bus.publish("e1", None, None, None);
        bus.publish("e2", None, None, None);

        let mut sub = bus.subscribe(None, true).unwrap();
        assert_eq!(types(&mut sub), vec!["e1", "e2"]);

        bus.publish("e3", None, None, None);
        assert_eq!(sub.recv().await.unwrap().event_type, "e3");
    }

    #[tokio::test]
    async fn test_without_history_only_live() {
        let bus = EventBus::default();
        bus.publish("before", None, None, None);

        let mut sub = bus.subscribe(None, false).unwrap();
        assert!(sub.try_recv().is_none());

        bus.publish("after", None, None, None);
        assert_eq!(types(&mut sub), vec!["after"]);
    }

    #[tokio::test]
    async fn test_filter_applies_to_history_and_live() {
        let bus = EventBus::default();
        bus.publish("job.progress", Some("j"), None, None);
        bus.publish("worker.started", None, None, None);

        let mut sub = bus
            .subscribe(Some(vec!["job.progress".to_string()]), true)
            .unwrap();
        bus.publish("worker.stopped", None, None, None);
        bus.publish("job.progress", Some("j"), Some(json!({"n": 2})), None);

        assert_eq!(types(&mut sub), vec!["job.progress", "job.progress"]);
    }

    #[tokio::test]
    async fn test_max_subscribers() {
        let bus = bus_with(EventBusConfig::default().with_max_subscribers(2));
        let _a = bus.subscribe(None, false).unwrap();
        let b = bus.subscribe(None, false).unwrap();

        assert_eq!(
            bus.subscribe(None, false).err(),
            Some(EventBusError::TooManySubscribers { max: 2 })
        );

        drop(b);
        assert!(bus.subscribe(None, false).is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::default();
        let sub = bus.subscribe(None, false).unwrap();
        let id = sub.id();

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        drop(sub);
        assert_eq!(bus.stats().active_subscribers, 0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_counts() {
        let bus = bus_with(EventBusConfig::default().with_subscriber_capacity(2));
        let mut slow = bus.subscribe(None, false).unwrap();
        let mut other = bus
            .subscribe(Some(vec!["rare".to_string()]), false)
            .unwrap();

        for i in 0..5 {
            bus.publish(&format!("e{}", i), None, None, None);
        }

        let stats = bus.stats();
        assert_eq!(stats.events_emitted, 5);
        assert_eq!(stats.events_dropped, 3);
        assert_eq!(types(&mut slow), vec!["e0", "e1"]);
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_history_replay_stops_when_channel_fills() {
        let bus = bus_with(EventBusConfig::default().with_subscriber_capacity(2));
        for i in 0..4 {
            bus.publish(&format!("e{}", i), None, None, None);
        }

        let mut sub = bus.subscribe(None, true).unwrap();
        assert_eq!(types(&mut sub), vec!["e0", "e1"]);
    }

    #[tokio::test]
    async fn test_buffer_evicts_oldest() {
        let bus = bus_with(EventBusConfig::default().with_buffer_size(3));
        for i in 0..5 {
            bus.publish(&format!("e{}", i), None, None, None);
        }

        let stats = bus.stats();
        assert_eq!(stats.buffer_size, 3);
        assert_eq!(stats.buffer_capacity, 3);

        let mut sub = bus.subscribe(None, true).unwrap();
        assert_eq!(types(&mut sub), vec!["e2", "e3", "e4"]);
    }

    #[tokio::test]
    async fn test_dead_subscriber_removed_on_publish() {
        let bus = EventBus::default();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        bus.inner
            .lock()
            .subscribers
            .insert(u64::MAX, Subscriber { filter: None, tx });

        assert_eq!(bus.stats().active_subscribers, 1);
        bus.publish("ping", None, None, None);
        assert_eq!(bus.stats().active_subscribers, 0);
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(None, false).unwrap();
        let token = sub.cancel_token();

        bus.publish("e1", None, None, None);
        token.cancel();

        assert!(sub.recv().await.is_none());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_until_cancelled() {
        let bus = EventBus::default();
        bus.publish("e1", None, None, None);
        let cancel = CancellationToken::new();
        let stream = bus.stream(None, true, cancel.clone()).unwrap();
        tokio::pin!(stream);

        assert_eq!(stream.next().await.unwrap().event_type, "e1");
        bus.publish("e2", None, None, None);
        assert_eq!(stream.next().await.unwrap().event_type, "e2");

        cancel.cancel();
        assert!(stream.next().await.is_none());
        assert_eq!(bus.stats().active_subscribers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sse_stream_keepalive() {
        let bus = bus_with(EventBusConfig::default().with_keepalive_interval(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let stream = bus.sse_stream(None, false, cancel.clone()).unwrap();
        tokio::pin!(stream);

        assert_eq!(stream.next().await.unwrap(), SSE_KEEPALIVE);

        bus.publish("job.completed", Some("j"), None, None);
        let frame = stream.next().await.unwrap();
        assert!(frame.starts_with("event: job.completed\n"));
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let bus = EventBus::default();
        let a = bus.publish("a", None, None, None);
        let b = bus.publish("b", None, None, None);
        assert_eq!((a.seq, b.seq), (1, 2));
    }
}

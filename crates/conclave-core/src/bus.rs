//! Event fabric: pub-sub bus and the per-query event emitter.
//!
//! The [`EventBus`] fans lifecycle events out to subscribers over
//! bounded tokio MPSC channels. Producers never block: a full
//! subscriber buffer drops the event for that subscriber with a
//! warning. Subscribers hold only a receiver and a cursor (the last
//! sequence number seen) -- never a reference back into the
//! orchestrator.
//!
//! The [`EventEmitter`] assigns each query's sequence numbers from a
//! single counter under mutual exclusion, so every consumer observes a
//! strict total order: the gap-free sequence `1, 2, .., K`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use conclave_types::{EventKind, LayerEvent, Stage};

/// Default per-subscriber buffer capacity.
const DEFAULT_CAPACITY: usize = 256;

/// A sink that receives every emitted event synchronously, before bus
/// fan-out. The transcript store implements this to keep
/// `events.ndjson` complete even when a slow subscriber overflows.
pub trait EventSink: Send + Sync {
    /// Append one event.
    fn append(&self, event: &LayerEvent);
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LayerEvent>,
    kinds: Option<HashSet<EventKind>>,
}

/// Bounded fan-out bus for lifecycle events.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to every event kind with the default buffer.
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_with(DEFAULT_CAPACITY, None)
    }

    /// Subscribe to a subset of event kinds.
    pub fn subscribe_kinds(&self, kinds: HashSet<EventKind>) -> EventSubscription {
        self.subscribe_with(DEFAULT_CAPACITY, Some(kinds))
    }

    /// Subscribe with explicit capacity and optional kind filter.
    pub fn subscribe_with(
        &self,
        capacity: usize,
        kinds: Option<HashSet<EventKind>>,
    ) -> EventSubscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("bus lock")
            .push(Subscriber { id, tx, kinds });
        debug!(subscriber = id, "bus subscriber added");
        EventSubscription { rx, cursor: 0 }
    }

    /// Publish one event to every matching subscriber.
    ///
    /// Never blocks: a subscriber whose buffer is full loses this event
    /// (logged); a subscriber whose receiver is gone is removed.
    pub fn publish(&self, event: &LayerEvent) {
        let mut subscribers = self.subscribers.lock().expect("bus lock");
        subscribers.retain(|sub| {
            if let Some(ref kinds) = sub.kinds {
                if !kinds.contains(&event.kind) {
                    return true;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscriber = sub.id,
                        seq = event.seq,
                        kind = ?event.kind,
                        "subscriber buffer full, dropping event"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = sub.id, "subscriber gone, removing");
                    false
                }
            }
        });
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("bus lock").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's end of the bus: a receiver plus a cursor tracking the
/// highest sequence number seen.
pub struct EventSubscription {
    rx: mpsc::Receiver<LayerEvent>,
    cursor: u64,
}

impl EventSubscription {
    /// Receive the next event, advancing the cursor. Returns `None`
    /// once the bus side is gone and the buffer is drained.
    pub async fn next(&mut self) -> Option<LayerEvent> {
        let event = self.rx.recv().await?;
        self.cursor = self.cursor.max(event.seq);
        Some(event)
    }

    /// The highest sequence number this subscriber has seen.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

/// Assigns sequence numbers and publishes events for one query.
///
/// Sequence assignment, transcript append and bus publication happen
/// under one lock so subscribers always observe sequence order.
pub struct EventEmitter {
    query_id: String,
    bus: Arc<EventBus>,
    sink: Option<Arc<dyn EventSink>>,
    state: Mutex<EmitterState>,
}

struct EmitterState {
    next_seq: u64,
    log: Vec<LayerEvent>,
}

impl EventEmitter {
    /// Emitter for one query.
    pub fn new(query_id: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            query_id: query_id.into(),
            bus,
            sink: None,
            state: Mutex::new(EmitterState {
                next_seq: 1,
                log: Vec::new(),
            }),
        }
    }

    /// Attach a synchronous sink (the transcript) that sees every event.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Emit one event: assign the next sequence number, record it,
    /// and fan it out.
    pub fn emit(
        &self,
        kind: EventKind,
        stage: Option<Stage>,
        slot: Option<usize>,
        payload: serde_json::Value,
    ) -> LayerEvent {
        let mut state = self.state.lock().expect("emitter lock");
        let event = LayerEvent {
            kind,
            query_id: self.query_id.clone(),
            stage,
            slot,
            payload,
            seq: state.next_seq,
            timestamp: Utc::now(),
        };
        state.next_seq += 1;
        state.log.push(event.clone());
        if let Some(ref sink) = self.sink {
            sink.append(&event);
        }
        self.bus.publish(&event);
        event
    }

    /// Every event emitted so far, in sequence order.
    pub fn log(&self) -> Vec<LayerEvent> {
        self.state.lock().expect("emitter lock").log.clone()
    }

    /// How many events have been emitted.
    pub fn emitted(&self) -> u64 {
        self.state.lock().expect("emitter lock").next_seq - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter() -> (Arc<EventBus>, EventEmitter) {
        let bus = Arc::new(EventBus::new());
        let emitter = EventEmitter::new("q-1", bus.clone());
        (bus, emitter)
    }

    #[tokio::test]
    async fn events_arrive_in_sequence_order() {
        let (bus, emitter) = emitter();
        let mut sub = bus.subscribe();

        for _ in 0..5 {
            emitter.emit(EventKind::Stage3Token, Some(Stage::Stage3), None, serde_json::Value::Null);
        }

        for expected_seq in 1..=5 {
            let event = sub.next().await.unwrap();
            assert_eq!(event.seq, expected_seq);
        }
        assert_eq!(sub.cursor(), 5);
    }

    #[tokio::test]
    async fn sequence_is_gap_free_from_one() {
        let (_bus, emitter) = emitter();
        for _ in 0..10 {
            emitter.emit(EventKind::DegradationNotice, None, None, serde_json::Value::Null);
        }
        let log = emitter.log();
        let seqs: Vec<u64> = log.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
        assert_eq!(emitter.emitted(), 10);
    }

    #[tokio::test]
    async fn concurrent_emitters_never_repeat_or_gap() {
        let (_bus, emitter) = emitter();
        let emitter = Arc::new(emitter);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let em = emitter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    em.emit(EventKind::Stage1SlotStarted, Some(Stage::Stage1), Some(0), serde_json::Value::Null);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut seqs: Vec<u64> = emitter.log().iter().map(|e| e.seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=200).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn kind_filter_applies() {
        let (bus, emitter) = emitter();
        let mut sub = bus.subscribe_kinds(HashSet::from([EventKind::CouncilCompleted]));

        emitter.emit(EventKind::CouncilStarted, None, None, serde_json::Value::Null);
        emitter.emit(EventKind::Stage1Complete, Some(Stage::Stage1), None, serde_json::Value::Null);
        emitter.emit(EventKind::CouncilCompleted, None, None, serde_json::Value::Null);

        let event = sub.next().await.unwrap();
        assert_eq!(event.kind, EventKind::CouncilCompleted);
        assert_eq!(event.seq, 3);
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let bus = Arc::new(EventBus::new());
        let emitter = EventEmitter::new("q", bus.clone());
        let mut sub = bus.subscribe_with(2, None);

        // Publish more than the buffer holds; emit must not block.
        for _ in 0..10 {
            emitter.emit(EventKind::Stage3Token, Some(Stage::Stage3), None, serde_json::Value::Null);
        }

        // The two buffered events are the earliest ones; the rest were
        // dropped for this subscriber.
        assert_eq!(sub.next().await.unwrap().seq, 1);
        assert_eq!(sub.next().await.unwrap().seq, 2);
        // The emitter itself recorded all ten.
        assert_eq!(emitter.emitted(), 10);
    }

    #[tokio::test]
    async fn dead_subscribers_are_removed() {
        let (bus, emitter) = emitter();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        emitter.emit(EventKind::CouncilStarted, None, None, serde_json::Value::Null);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn sink_sees_every_event() {
        struct CountingSink(AtomicU64);
        impl EventSink for CountingSink {
            fn append(&self, _event: &LayerEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(CountingSink(AtomicU64::new(0)));
        let emitter = EventEmitter::new("q", bus).with_sink(sink.clone());

        for _ in 0..7 {
            emitter.emit(EventKind::Stage2SlotCompleted, Some(Stage::Stage2), Some(1), serde_json::Value::Null);
        }
        assert_eq!(sink.0.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_events() {
        let (bus, emitter) = emitter();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        emitter.emit(EventKind::CouncilStarted, None, None, serde_json::Value::Null);

        assert_eq!(a.next().await.unwrap().seq, 1);
        assert_eq!(b.next().await.unwrap().seq, 1);
    }
}

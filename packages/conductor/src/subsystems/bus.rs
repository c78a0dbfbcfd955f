use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::instrument;
use utils::telemetry::BusMetrics;

use conductor_types::{Event, SubscriberId, Topic};

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

struct SubscriberEntry {
    tx: mpsc::Sender<Event>,
    topics: Vec<Topic>,
}

/// In-process fan-out of state transitions to subscribers.
///
/// Each subscriber gets one bounded buffer shared across its topic set. A
/// subscriber that falls behind is disconnected rather than allowed to stall
/// the pipeline: `try_send` failure drops the whole subscription and the
/// subscriber observes its stream ending with `slow_consumer`.
pub struct EventBus {
    topics: DashMap<Topic, Vec<SubscriberId>>,
    subscribers: DashMap<SubscriberId, SubscriberEntry>,
    buffer: usize,
    metrics: BusMetrics,
}

pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<Event>,
}

impl EventBus {
    pub fn new(buffer: usize, metrics: BusMetrics) -> Self {
        Self {
            topics: DashMap::new(),
            subscribers: DashMap::new(),
            buffer,
            metrics,
        }
    }

    #[instrument(level = "debug", skip(self), fields(subsys = "EventBus"))]
    pub fn subscribe(&self, topics: Vec<Topic>) -> Subscription {
        let id = SubscriberId::generate();
        let (tx, rx) = mpsc::channel(self.buffer);

        for topic in &topics {
            self.topics.entry(*topic).or_default().push(id);
        }
        self.subscribers.insert(id, SubscriberEntry { tx, topics });
        self.metrics.increment_subscribers();

        Subscription { id, rx }
    }

    #[instrument(level = "debug", skip(self), fields(subsys = "EventBus"))]
    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Some((_, entry)) = self.subscribers.remove(&id) {
            self.detach(id, &entry.topics);
            self.metrics.decrement_subscribers();
        }
    }

    /// Deliver an event to its topic, and to `global` for entity updates.
    /// Order per topic matches the caller's commit order; the aggregator is
    /// the only publisher for run topics.
    pub fn publish(&self, event: &Event) {
        self.metrics.increment_published();

        let mut targets = self.topic_subscribers(event.topic());
        if event.mirrors_to_global() {
            for id in self.topic_subscribers(Topic::Global) {
                if !targets.contains(&id) {
                    targets.push(id);
                }
            }
        }

        for id in targets {
            let full = match self.subscribers.get(&id) {
                Some(entry) => match entry.tx.try_send(event.clone()) {
                    Ok(()) => false,
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    // receiver already gone, clean up lazily
                    Err(mpsc::error::TrySendError::Closed(_)) => true,
                },
                None => continue,
            };

            if full {
                tracing::warn!(subscriber = %id, "disconnecting slow consumer");
                self.metrics.increment_slow_consumer_drops();
                self.unsubscribe(id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn topic_subscribers(&self, topic: Topic) -> Vec<SubscriberId> {
        self.topics
            .get(&topic)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    fn detach(&self, id: SubscriberId, topics: &[Topic]) {
        for topic in topics {
            if let Some(mut ids) = self.topics.get_mut(topic) {
                ids.retain(|existing| *existing != id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{LogStream, RunId, ShardId};
    use opentelemetry::global;

    fn bus(buffer: usize) -> EventBus {
        EventBus::new(buffer, BusMetrics::new(&global::meter("test")))
    }

    fn log_event(run: u128, seq: u64) -> Event {
        Event::LogChunk {
            run_id: RunId::from_u128(run),
            shard_id: ShardId::from_u128(run),
            seq,
            stream: LogStream::Stdout,
            data: format!("line {}", seq),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = bus(16);
        let mut sub = bus.subscribe(vec![Topic::Run(RunId::from_u128(1))]);

        for seq in 0..5 {
            bus.publish(&log_event(1, seq));
        }

        for expected in 0..5 {
            match sub.rx.recv().await.unwrap() {
                Event::LogChunk { seq, .. } => assert_eq!(seq, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn topic_isolation() {
        let bus = bus(16);
        let mut sub = bus.subscribe(vec![Topic::Run(RunId::from_u128(1))]);

        bus.publish(&log_event(2, 0));
        bus.publish(&log_event(1, 0));

        match sub.rx.recv().await.unwrap() {
            Event::LogChunk { run_id, .. } => assert_eq!(run_id, RunId::from_u128(1)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_consumer_is_disconnected_and_others_continue() {
        let bus = bus(2);
        let mut slow = bus.subscribe(vec![Topic::Run(RunId::from_u128(1))]);
        let mut healthy = bus.subscribe(vec![Topic::Run(RunId::from_u128(1))]);

        // fill both buffers, then only the healthy subscriber drains
        bus.publish(&log_event(1, 0));
        bus.publish(&log_event(1, 1));
        assert!(healthy.rx.try_recv().is_ok());
        assert!(healthy.rx.try_recv().is_ok());

        // the slow subscriber's buffer overflows on the next publish
        bus.publish(&log_event(1, 2));
        assert_eq!(bus.subscriber_count(), 1);

        // the healthy subscriber keeps receiving in order
        bus.publish(&log_event(1, 3));
        let mut seen = Vec::new();
        while let Ok(event) = healthy.rx.try_recv() {
            if let Event::LogChunk { seq, .. } = event {
                seen.push(seq);
            }
        }
        assert_eq!(seen, vec![2, 3]);

        // the slow subscription still holds its buffered prefix, then ends
        assert!(slow.rx.try_recv().is_ok());
        assert!(slow.rx.try_recv().is_ok());
        assert!(slow.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn global_receives_entity_updates_only() {
        let bus = bus(16);
        let mut global_sub = bus.subscribe(vec![Topic::Global]);

        bus.publish(&log_event(1, 0));
        assert!(global_sub.rx.try_recv().is_err());
    }
}

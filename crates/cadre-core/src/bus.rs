// Workspace Event Bus
// Typed pub/sub with a bounded critical-event log and late-subscriber replay.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use cadre_types::AgentEvent;

/// An event stamped at emission. `seq` is strictly increasing per bus and
/// breaks timestamp ties.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: AgentEvent,
}

struct BusInner {
    next_seq: u64,
    last_timestamp: DateTime<Utc>,
    /// Tail of recent events (critical or not) handed to late subscribers.
    replay: VecDeque<BusEvent>,
    /// Bounded ring of critical events, strict insertion order.
    log: VecDeque<BusEvent>,
    replay_size: usize,
    max_log_size: usize,
}

/// Broadcast bus with two facets: a live stream (plus a small replay tail
/// for late subscribers) and a bounded critical-event log.
///
/// Thread-safe; emitters and subscribers may run on any executor. Emission
/// never suspends: slow live subscribers lag on their broadcast receiver
/// rather than blocking the emitter.
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new(replay_size: usize, max_log_size: usize) -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self {
            tx,
            inner: Mutex::new(BusInner {
                next_seq: 0,
                last_timestamp: Utc::now(),
                replay: VecDeque::new(),
                log: VecDeque::new(),
                replay_size,
                max_log_size: max_log_size.max(1),
            }),
        }
    }

    /// Publish an event: always delivered live, retained in the log when
    /// critical. Returns the stamped event.
    pub fn emit(&self, event: AgentEvent) -> BusEvent {
        let (stamped, _) = self.emit_inner(event);
        stamped
    }

    /// Non-suspending emit with identical logging policy. The boolean
    /// reports whether any live subscriber received the event.
    pub fn try_emit(&self, event: AgentEvent) -> (BusEvent, bool) {
        self.emit_inner(event)
    }

    fn emit_inner(&self, event: AgentEvent) -> (BusEvent, bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        // Monotonic emission timestamps; seq disambiguates equal instants.
        let now = Utc::now().max(inner.last_timestamp);
        inner.last_timestamp = now;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let stamped = BusEvent {
            seq,
            timestamp: now,
            event,
        };

        if inner.replay_size > 0 {
            if inner.replay.len() == inner.replay_size {
                inner.replay.pop_front();
            }
            inner.replay.push_back(stamped.clone());
        }

        if stamped.event.is_critical() {
            if inner.log.len() == inner.max_log_size {
                inner.log.pop_front();
            }
            inner.log.push_back(stamped.clone());
        }

        // Send while still holding the lock so a concurrent subscribe()
        // observes each event exactly once: either in its replay snapshot or
        // on its live receiver, never both.
        let delivered = self.tx.send(stamped.clone()).is_ok();
        (stamped, delivered)
    }

    /// Attach a subscriber. The returned subscription first yields up to
    /// `replay_size` recent events, then the live stream.
    pub fn subscribe(&self) -> BusSubscription {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let rx = self.tx.subscribe();
        let replay = inner.replay.iter().cloned().collect();
        BusSubscription { replay, rx }
    }

    /// All critical events still in the log, in insertion order.
    pub fn replay_all(&self) -> Vec<AgentEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.log.iter().map(|e| e.event.clone()).collect()
    }

    /// Critical events at or after `since`, in insertion order.
    pub fn replay_since(&self, since: DateTime<Utc>) -> Vec<AgentEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .log
            .iter()
            .filter(|e| e.timestamp >= since)
            .map(|e| e.event.clone())
            .collect()
    }

    /// Critical events at or after `since` that satisfy `filter`.
    pub fn replay_since_filtered<F>(&self, since: DateTime<Utc>, filter: F) -> Vec<AgentEvent>
    where
        F: Fn(&AgentEvent) -> bool,
    {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .log
            .iter()
            .filter(|e| e.timestamp >= since && filter(&e.event))
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.log.clear();
    }

    pub fn timestamped_log(&self) -> Vec<(DateTime<Utc>, AgentEvent)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .log
            .iter()
            .map(|e| (e.timestamp, e.event.clone()))
            .collect()
    }

    pub fn log_len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.log.len()
    }
}

/// One subscriber's view of the bus.
pub struct BusSubscription {
    replay: VecDeque<BusEvent>,
    rx: broadcast::Receiver<BusEvent>,
}

impl BusSubscription {
    /// Next event: replayed history first, then the live stream. Returns
    /// `None` when the bus is dropped. A lagged receiver skips to the oldest
    /// retained event rather than erroring out.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("bus subscriber lagged by {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_types::AgentRole;

    fn created(agent_id: &str) -> AgentEvent {
        AgentEvent::AgentCreated {
            workspace_id: "ws".to_string(),
            agent_id: agent_id.to_string(),
            role: AgentRole::Planner,
            parent_id: None,
        }
    }

    fn message(agent_id: &str) -> AgentEvent {
        AgentEvent::MessageReceived {
            workspace_id: "ws".to_string(),
            agent_id: agent_id.to_string(),
            message: "chunk".to_string(),
        }
    }

    #[test]
    fn critical_events_are_logged_and_ephemeral_ones_are_not() {
        let bus = EventBus::new(8, 64);
        bus.emit(created("a1"));
        bus.emit(message("a1"));
        bus.emit(created("a2"));

        let log = bus.replay_all();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|e| e.is_critical()));
    }

    #[test]
    fn log_is_bounded_and_drops_oldest_first() {
        let bus = EventBus::new(0, 3);
        for i in 0..5 {
            bus.emit(created(&format!("a{}", i)));
        }

        let log = bus.replay_all();
        assert_eq!(log.len(), 3);
        match &log[0] {
            AgentEvent::AgentCreated { agent_id, .. } => assert_eq!(agent_id, "a2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn timestamps_are_monotonic_and_seq_orders_log() {
        let bus = EventBus::new(0, 64);
        for i in 0..10 {
            bus.emit(created(&format!("a{}", i)));
        }
        let log = bus.timestamped_log();
        for pair in log.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }

    #[tokio::test]
    async fn late_subscriber_replays_without_duplicates() {
        let bus = EventBus::new(8, 64);
        bus.emit(created("planner"));

        let mut sub = bus.subscribe();
        bus.emit(created("worker"));

        let first = sub.recv().await.expect("replayed event");
        let second = sub.recv().await.expect("live event");
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn replay_tail_is_bounded() {
        let bus = EventBus::new(2, 64);
        for i in 0..5 {
            bus.emit(created(&format!("a{}", i)));
        }
        let mut sub = bus.subscribe();
        let first = sub.recv().await.expect("event");
        assert_eq!(first.seq, 3);
    }

    #[test]
    fn try_emit_reports_live_delivery() {
        let bus = EventBus::new(8, 64);
        let (_, delivered) = bus.try_emit(created("a1"));
        assert!(!delivered);

        let _sub = bus.subscribe();
        let (_, delivered) = bus.try_emit(created("a2"));
        assert!(delivered);
    }

    #[test]
    fn replay_since_filters_by_timestamp_and_predicate() {
        let bus = EventBus::new(0, 64);
        bus.emit(created("a1"));
        let log = bus.timestamped_log();
        let cutoff = log[0].0;

        bus.emit(message("a1")); // not logged
        bus.emit(created("a2"));

        let since = bus.replay_since(cutoff);
        assert_eq!(since.len(), 2);

        let filtered = bus.replay_since_filtered(cutoff, |e| {
            matches!(e, AgentEvent::AgentCreated { agent_id, .. } if agent_id == "a2")
        });
        assert_eq!(filtered.len(), 1);
    }
}

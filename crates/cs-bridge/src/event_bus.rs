use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::{json, Value};

use cs_api_types::BusStats;
use cs_telemetry::metrics::PlatformMetrics;

use crate::protocol::{BusFilter, BusKind, BusMessage};

pub const DEFAULT_CAPACITY: usize = 1000;

/// Per-subscriber queue depth used by [`EventBus::subscribe`].
pub const SUBSCRIBER_CAPACITY: usize = 256;

struct Subscriber {
    filter: BusFilter,
    tx: flume::Sender<BusMessage>,
}

struct Inner {
    buffer: VecDeque<BusMessage>,
    subscribers: Vec<Subscriber>,
    next_seq: u64,
    by_kind: BTreeMap<BusKind, u64>,
    dropped: u64,
    paused: bool,
}

/// Process-wide broadcast bus with a bounded history ring.
///
/// Publishing never blocks: each subscriber gets its own bounded flume
/// channel and delivery uses `try_send`. A message that finds a subscriber's
/// queue full is dropped for that subscriber only and counted in
/// `stats().dropped`; the subscriber stays registered. Subscribers whose
/// receiver was dropped are pruned on the next publish. Sequence numbers are assigned under the same lock that
/// appends to the ring, so history order equals publication order.
///
/// The bus is cheap to clone; clones share the same ring and subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A zero capacity is bumped to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity.min(4096)),
                subscribers: Vec::new(),
                next_seq: 1,
                by_kind: BTreeMap::new(),
                dropped: 0,
                paused: false,
            })),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message and fan it out. Returns the assigned sequence number,
    /// or `None` when the bus is paused.
    pub fn publish(
        &self,
        kind: BusKind,
        source: impl Into<String>,
        target: Option<String>,
        payload: Value,
        metadata: Option<serde_json::Map<String, Value>>,
    ) -> Option<u64> {
        let mut inner = self.lock();
        if inner.paused {
            inner.dropped += 1;
            return None;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let msg = BusMessage {
            seq,
            timestamp: Utc::now(),
            kind,
            source: source.into(),
            target,
            payload,
            metadata: metadata.unwrap_or_default(),
        };

        if inner.buffer.len() >= self.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(msg.clone());
        *inner.by_kind.entry(kind).or_insert(0) += 1;

        let mut full = 0u64;
        inner.subscribers.retain(|sub| {
            if !sub.filter.matches(&msg) {
                return !sub.tx.is_disconnected();
            }
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    full += 1;
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
        inner.dropped += full;
        drop(inner);

        PlatformMetrics::bus_message(kind.as_str());
        if full > 0 {
            tracing::debug!(
                kind = kind.as_str(),
                subscribers = full,
                "bus subscriber queue full, message dropped"
            );
            for _ in 0..full {
                PlatformMetrics::bus_dropped(kind.as_str());
            }
        }
        Some(seq)
    }

    /// Shorthand for a message with no target and no metadata.
    pub fn emit(&self, kind: BusKind, source: impl Into<String>, payload: Value) -> Option<u64> {
        self.publish(kind, source, None, payload, None)
    }

    /// Receive future messages matching `filter`, queued up to
    /// [`SUBSCRIBER_CAPACITY`].
    pub fn subscribe(&self, filter: BusFilter) -> flume::Receiver<BusMessage> {
        self.subscribe_with_capacity(filter, SUBSCRIBER_CAPACITY)
    }

    /// Like [`subscribe`](Self::subscribe) with an explicit queue depth.
    /// Zero is bumped to one.
    pub fn subscribe_with_capacity(&self, filter: BusFilter, capacity: usize) -> flume::Receiver<BusMessage> {
        let (tx, rx) = flume::bounded(capacity.max(1));
        self.lock().subscribers.push(Subscriber { filter, tx });
        rx
    }

    /// The newest `limit` buffered messages matching `filter`, oldest first.
    pub fn history(&self, filter: &BusFilter, limit: usize) -> Vec<BusMessage> {
        let inner = self.lock();
        let mut tail: Vec<BusMessage> = inner
            .buffer
            .iter()
            .rev()
            .filter(|m| filter.matches(m))
            .take(limit)
            .cloned()
            .collect();
        tail.reverse();
        tail
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.tx.is_disconnected());
        inner.subscribers.len()
    }

    pub fn stats(&self) -> BusStats {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.tx.is_disconnected());
        BusStats {
            total_published: inner.next_seq - 1,
            buffered: inner.buffer.len(),
            capacity: self.capacity,
            subscribers: inner.subscribers.len(),
            dropped: inner.dropped,
            paused: inner.paused,
            by_kind: inner
                .by_kind
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
        }
    }

    /// Empty the ring. Counters and subscribers are kept.
    pub fn clear(&self) {
        self.lock().buffer.clear();
    }

    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    // ---- Convenience publishers ------------------------------------------

    pub fn log_request(&self, source: &str, target: &str, payload: Value) -> Option<u64> {
        self.publish(BusKind::Request, source, Some(target.to_string()), payload, None)
    }

    pub fn log_response(&self, source: &str, target: &str, payload: Value) -> Option<u64> {
        self.publish(BusKind::Response, source, Some(target.to_string()), payload, None)
    }

    pub fn log_task_start(&self, source: &str, task_id: &str, description: &str) -> Option<u64> {
        self.publish(
            BusKind::TaskStart,
            source,
            None,
            json!({ "task_id": task_id, "description": description }),
            Some(task_meta(task_id)),
        )
    }

    /// Entry into an intermediate task state, published as an `Execution`
    /// message with `action = "task_state"`. The first transition goes
    /// through [`log_task_start`](Self::log_task_start) and terminal states
    /// through [`log_task_end`](Self::log_task_end).
    pub fn log_task_state(&self, source: &str, task_id: &str, from: &str, state: &str) -> Option<u64> {
        self.publish(
            BusKind::Execution,
            source,
            None,
            json!({ "action": "task_state", "task_id": task_id, "from": from, "state": state }),
            Some(task_meta(task_id)),
        )
    }

    pub fn log_task_end(
        &self,
        source: &str,
        task_id: &str,
        state: &str,
        success: bool,
    ) -> Option<u64> {
        self.publish(
            BusKind::TaskEnd,
            source,
            None,
            json!({ "task_id": task_id, "state": state, "success": success }),
            Some(task_meta(task_id)),
        )
    }

    pub fn log_error(&self, source: &str, error: &str) -> Option<u64> {
        self.emit(BusKind::Error, source, json!({ "error": error }))
    }

    pub fn log_llm_call(&self, source: &str, model: &str, prompt_chars: usize) -> Option<u64> {
        self.emit(
            BusKind::LlmCall,
            source,
            json!({ "model": model, "prompt_chars": prompt_chars }),
        )
    }

    pub fn log_llm_response(
        &self,
        source: &str,
        model: &str,
        success: bool,
        tokens: u64,
    ) -> Option<u64> {
        self.emit(
            BusKind::LlmResponse,
            source,
            json!({ "model": model, "success": success, "tokens": tokens }),
        )
    }

    pub fn log_code_gen(&self, source: &str, language: &str, code_chars: usize) -> Option<u64> {
        self.emit(
            BusKind::CodeGen,
            source,
            json!({ "language": language, "code_chars": code_chars }),
        )
    }

    pub fn log_execution(
        &self,
        source: &str,
        container: &str,
        exit_code: i32,
        success: bool,
    ) -> Option<u64> {
        self.publish(
            BusKind::Execution,
            source,
            Some(container.to_string()),
            json!({ "exit_code": exit_code, "success": success }),
            None,
        )
    }

    pub fn log_docker_op(&self, operation: &str, container: &str, success: bool) -> Option<u64> {
        self.publish(
            BusKind::DockerOp,
            "sandbox",
            Some(container.to_string()),
            json!({ "operation": operation, "success": success }),
            None,
        )
    }

    pub fn log_github_op(&self, operation: &str, repo: &str, success: bool) -> Option<u64> {
        self.publish(
            BusKind::GithubOp,
            "registry",
            Some(repo.to_string()),
            json!({ "operation": operation, "success": success }),
            None,
        )
    }

    pub fn log_coordinator(&self, action: &str, details: Value) -> Option<u64> {
        self.emit(
            BusKind::Coordinator,
            "coordinator",
            json!({ "action": action, "details": details }),
        )
    }
}

fn task_meta(task_id: &str) -> serde_json::Map<String, Value> {
    let mut meta = serde_json::Map::new();
    meta.insert("task_id".into(), Value::String(task_id.to_string()));
    meta
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("buffered", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let bus = EventBus::with_capacity(3);
        for i in 0..5 {
            bus.emit(BusKind::Request, "t", json!(i));
        }
        let hist = bus.history(&BusFilter::all(), 10);
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[0].payload, json!(2));
        assert_eq!(hist[2].payload, json!(4));
        assert_eq!(bus.stats().total_published, 5);
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let bus = EventBus::new();
        let a = bus.emit(BusKind::Request, "t", Value::Null).unwrap();
        let b = bus.emit(BusKind::Request, "t", Value::Null).unwrap();
        assert!(b > a);
    }

    #[test]
    fn history_limit_returns_tail_in_order() {
        let bus = EventBus::new();
        for i in 0..10 {
            let kind = if i % 2 == 0 { BusKind::Request } else { BusKind::Error };
            bus.emit(kind, "t", json!(i));
        }
        let hist = bus.history(&BusFilter::kind(BusKind::Request), 2);
        let payloads: Vec<_> = hist.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(6), json!(8)]);
    }

    #[test]
    fn subscriber_receives_only_matching() {
        let bus = EventBus::new();
        let rx = bus.subscribe(BusFilter::kind(BusKind::Error));
        bus.emit(BusKind::Request, "t", Value::Null);
        bus.log_error("t", "boom");
        let got = rx.try_recv().unwrap();
        assert_eq!(got.kind, BusKind::Error);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(BusFilter::all());
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.emit(BusKind::Request, "t", Value::Null);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn paused_bus_drops_and_counts() {
        let bus = EventBus::new();
        bus.pause();
        assert!(bus.emit(BusKind::Request, "t", Value::Null).is_none());
        assert!(bus.is_empty());
        assert_eq!(bus.stats().dropped, 1);
        bus.resume();
        assert!(bus.emit(BusKind::Request, "t", Value::Null).is_some());
    }

    #[test]
    fn clear_keeps_counters() {
        let bus = EventBus::new();
        bus.log_task_start("python", "abc", "sum");
        bus.clear();
        let stats = bus.stats();
        assert_eq!(stats.buffered, 0);
        assert_eq!(stats.by_kind.get("task-start"), Some(&1));
    }

    #[test]
    fn task_helpers_tag_metadata() {
        let bus = EventBus::new();
        bus.log_task_end("python", "abc", "completed", true);
        let msg = &bus.history(&BusFilter::all(), 1)[0];
        assert_eq!(msg.metadata["task_id"], json!("abc"));
        assert_eq!(msg.payload["success"], json!(true));
    }
}

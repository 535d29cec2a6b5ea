use std::sync::Arc;
use std::thread;

use cs_bridge::event_bus::EventBus;
use cs_bridge::protocol::{BusFilter, BusKind};
use serde_json::json;

#[test]
fn test_history_never_exceeds_capacity() {
    let bus = EventBus::with_capacity(16);
    for i in 0..1000 {
        bus.emit(BusKind::Execution, "t", json!(i));
        assert!(bus.history(&BusFilter::all(), usize::MAX).len() <= 16);
    }
    assert_eq!(bus.len(), 16);
}

#[test]
fn test_zero_capacity_is_bumped() {
    let bus = EventBus::with_capacity(0);
    bus.emit(BusKind::Request, "t", json!(1));
    bus.emit(BusKind::Request, "t", json!(2));
    let hist = bus.history(&BusFilter::all(), 10);
    assert_eq!(hist.len(), 1);
    assert_eq!(hist[0].payload, json!(2));
}

#[test]
fn test_per_publisher_order_is_preserved_across_threads() {
    let bus = Arc::new(EventBus::with_capacity(10_000));
    let handles: Vec<_> = (0..4)
        .map(|p| {
            let bus = bus.clone();
            thread::spawn(move || {
                for i in 0..500u64 {
                    bus.emit(BusKind::Request, format!("pub-{p}"), json!(i));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for p in 0..4 {
        let filter = BusFilter::all().with_source(format!("pub-{p}"));
        let seen: Vec<u64> = bus
            .history(&filter, usize::MAX)
            .iter()
            .map(|m| m.payload.as_u64().unwrap())
            .collect();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }
    assert_eq!(bus.stats().total_published, 2000);
}

#[test]
fn test_multiple_subscribers_each_get_a_copy() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe(BusFilter::all());
    let rx2 = bus.subscribe(BusFilter::kind(BusKind::CodeGen));
    bus.log_code_gen("python", "python", 120);
    assert_eq!(rx1.try_recv().unwrap().kind, BusKind::CodeGen);
    assert_eq!(rx2.try_recv().unwrap().payload["code_chars"], json!(120));
}

#[test]
fn test_full_subscriber_drops_and_counts() {
    let bus = EventBus::new();
    let slow = bus.subscribe_with_capacity(BusFilter::all(), 2);
    let fast = bus.subscribe(BusFilter::all());
    for i in 0..5 {
        assert!(bus.emit(BusKind::Execution, "t", json!(i)).is_some());
    }

    let stats = bus.stats();
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.subscribers, 2);
    assert_eq!(stats.total_published, 5);
    assert_eq!(slow.drain().map(|m| m.payload).collect::<Vec<_>>(), vec![json!(0), json!(1)]);
    assert_eq!(fast.drain().count(), 5);

    bus.emit(BusKind::Execution, "t", json!(5));
    assert_eq!(slow.try_recv().unwrap().payload, json!(5));
    assert_eq!(bus.stats().dropped, 3);
}

#[tokio::test]
async fn test_async_subscriber_sees_publication_order() {
    let bus = EventBus::new();
    let rx = bus.subscribe(BusFilter::kind(BusKind::TaskEnd).with_kind(BusKind::TaskStart));
    bus.log_task_start("go", "t1", "hello");
    bus.log_docker_op("build", "c1", true);
    bus.log_task_end("go", "t1", "completed", true);

    let first = rx.recv_async().await.unwrap();
    let second = rx.recv_async().await.unwrap();
    assert_eq!(first.kind, BusKind::TaskStart);
    assert_eq!(second.kind, BusKind::TaskEnd);
    assert!(second.seq > first.seq);
}

#[test]
fn test_intermediate_states_are_not_task_starts() {
    let bus = EventBus::new();
    let starts = bus.subscribe(BusFilter::kind(BusKind::TaskStart));
    bus.log_task_start("python", "t1", "sum");
    bus.log_task_state("python", "t1", "analyzing", "generating");
    bus.log_task_state("python", "t1", "generating", "building");

    assert_eq!(starts.try_recv().unwrap().payload["task_id"], "t1");
    assert!(starts.try_recv().is_err());

    let states = bus.history(&BusFilter::kind(BusKind::Execution), 10);
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].payload["action"], "task_state");
    assert_eq!(states[1].payload["from"], "generating");
    assert_eq!(states[1].payload["state"], "building");
}

#[test]
fn test_stats_count_by_kind() {
    let bus = EventBus::new();
    bus.log_llm_call("python", "qwen", 10);
    bus.log_llm_response("python", "qwen", true, 42);
    bus.log_llm_call("python", "qwen", 10);
    bus.log_coordinator("retry", json!({"attempt": 2}));
    let stats = bus.stats();
    assert_eq!(stats.by_kind["llm-call"], 2);
    assert_eq!(stats.by_kind["llm-response"], 1);
    assert_eq!(stats.by_kind["coordinator"], 1);
}

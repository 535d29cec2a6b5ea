use cs_core::decision_memory::{DecisionContext, DecisionMemory, NewDecision, Outcome};

#[tokio::test]
async fn decisions_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decisions.db");
    let ctx = DecisionContext::new("api-x", "auth", "rate_limit", "too many requests");

    let id = {
        let mem = DecisionMemory::new(&path).await.unwrap();
        let id = mem
            .record(
                NewDecision::new(ctx.clone(), "fix", "add_cache")
                    .reasoning("cache hot tokens")
                    .confidence(0.7)
                    .context_data(serde_json::json!({"attempt": 1})),
            )
            .await
            .unwrap();
        mem.patch_outcome(id, Outcome::Success, Some(serde_json::json!({"latency_ms": 12})), Some(1.0))
            .await
            .unwrap();
        id
    };

    let mem = DecisionMemory::new(&path).await.unwrap();
    let rec = mem.get(id).await.unwrap().expect("record persisted");
    assert_eq!(rec.reasoning, "cache hot tokens");
    assert_eq!(rec.outcome, Outcome::Success);
    assert_eq!(rec.context_data["attempt"], 1);
    assert_eq!(rec.outcome_details.unwrap()["latency_ms"], 12);

    // Already patched before the reopen: still ignored.
    assert!(!mem
        .patch_outcome(id, Outcome::Failure, None, None)
        .await
        .unwrap());
}

#[tokio::test]
async fn scenario_recall_prefers_successful_decision() {
    let mem = DecisionMemory::new_in_memory().await.unwrap();
    let ctx = DecisionContext::new("api-x", "auth", "rate_limit", "");

    let first = mem
        .record(NewDecision::new(ctx.clone(), "fix", "raise_limit"))
        .await
        .unwrap();
    mem.patch_outcome(first, Outcome::Failure, None, None)
        .await
        .unwrap();
    let second = mem
        .record(NewDecision::new(ctx.clone(), "fix", "add_cache"))
        .await
        .unwrap();
    mem.patch_outcome(second, Outcome::Success, None, None)
        .await
        .unwrap();

    let recalled = mem.recall(&ctx, 10).await.unwrap();
    let names: Vec<_> = recalled.iter().map(|r| r.decision.as_str()).collect();
    assert_eq!(names, vec!["add_cache", "raise_limit"]);
}

#[tokio::test]
async fn concurrent_patches_apply_exactly_once() {
    let mem = std::sync::Arc::new(DecisionMemory::new_in_memory().await.unwrap());
    let id = mem
        .record(NewDecision::new(
            DecisionContext::new("a", "b", "c", "d"),
            "fix",
            "x",
        ))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let mem = mem.clone();
        handles.push(tokio::spawn(async move {
            let outcome = if i % 2 == 0 { Outcome::Success } else { Outcome::Failure };
            mem.patch_outcome(id, outcome, None, Some(i as f64)).await.unwrap()
        }));
    }
    let mut applied = 0;
    for h in handles {
        if h.await.unwrap() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);
}

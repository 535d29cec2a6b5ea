use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use cs_agents::escalation::{
    wait_for_reply, EscalationError, Notifier, PeerFixClient, TelegramNotifier, WahaNotifier,
};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// ── Telegram ──

#[derive(Clone, Default)]
struct Telegram {
    updates: Arc<Mutex<Vec<Value>>>,
    sent: Arc<Mutex<Vec<Value>>>,
    offsets: Arc<Mutex<Vec<Option<i64>>>>,
}

impl Telegram {
    fn push(&self, id: i64, chat: i64, text: &str) {
        self.updates.lock().unwrap().push(json!({
            "update_id": id,
            "message": { "chat": { "id": chat }, "text": text },
        }));
    }
}

async fn get_updates(
    State(tg): State<Telegram>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Value> {
    let offset = q.get("offset").and_then(|o| o.parse::<i64>().ok());
    tg.offsets.lock().unwrap().push(offset);
    let result: Vec<Value> = tg
        .updates
        .lock()
        .unwrap()
        .iter()
        .filter(|u| offset.map_or(true, |o| u["update_id"].as_i64().unwrap() >= o))
        .cloned()
        .collect();
    Json(json!({ "ok": true, "result": result }))
}

async fn send_message(State(tg): State<Telegram>, Json(body): Json<Value>) -> Json<Value> {
    tg.sent.lock().unwrap().push(body);
    Json(json!({ "ok": true }))
}

#[tokio::test]
async fn telegram_ignores_history_and_other_chats() {
    let tg = Telegram::default();
    tg.push(7, 42, "an old message");
    let base = serve(
        Router::new()
            .route("/botT0K3N/getUpdates", get(get_updates))
            .route("/botT0K3N/sendMessage", post(send_message))
            .with_state(tg.clone()),
    )
    .await;
    let notifier = TelegramNotifier::new("T0K3N", "42", Duration::from_secs(5)).with_api_base(base);

    notifier.send("task failed, please advise").await.unwrap();
    let sent = tg.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["chat_id"], "42");
    assert_eq!(sent[0]["text"], "task failed, please advise");

    assert_eq!(notifier.poll_reply().await.unwrap(), None);

    tg.push(8, 99, "someone else");
    tg.push(9, 42, "use sqlite");
    let reply = wait_for_reply(&notifier, Duration::from_secs(2), Duration::from_millis(10)).await;
    assert_eq!(reply.as_deref(), Some("use sqlite"));

    let offsets = tg.offsets.lock().unwrap().clone();
    assert_eq!(offsets[0], None);
    assert!(offsets[1..].iter().all(|o| o.unwrap_or(0) >= 8));
}

// ── WhatsApp through WAHA ──

#[derive(Clone, Default)]
struct Waha {
    sent: Arc<Mutex<Vec<Value>>>,
    inbox: Arc<Mutex<Vec<Value>>>,
}

async fn send_text(State(w): State<Waha>, Json(body): Json<Value>) -> Json<Value> {
    w.sent.lock().unwrap().push(body);
    Json(json!({ "id": "msg-1" }))
}

async fn messages(State(w): State<Waha>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    assert_eq!(q.get("chatId").map(String::as_str), Some("5511999990000@c.us"));
    Json(Value::Array(w.inbox.lock().unwrap().clone()))
}

#[tokio::test]
async fn waha_skips_own_and_stale_messages() {
    let waha = Waha::default();
    let base = serve(
        Router::new()
            .route("/api/sendText", post(send_text))
            .route("/api/messages", get(messages))
            .with_state(waha.clone()),
    )
    .await;
    let notifier = WahaNotifier::new(base, "default", "+55 11 99999-0000", Duration::from_secs(5));

    notifier.send("need input").await.unwrap();
    let sent = waha.sent.lock().unwrap().clone();
    assert_eq!(sent[0]["chatId"], "5511999990000@c.us");
    assert_eq!(sent[0]["session"], "default");

    let now = chrono::Utc::now().timestamp();
    waha.inbox.lock().unwrap().extend([
        json!({ "fromMe": true, "timestamp": now + 5, "body": "need input" }),
        json!({ "fromMe": false, "timestamp": now - 3600, "body": "stale" }),
        json!({ "fromMe": false, "timestamp": now + 5, "body": "port 8080" }),
    ]);
    assert_eq!(notifier.poll_reply().await.unwrap().as_deref(), Some("port 8080"));
}

// ── Peer fix ──

#[tokio::test]
async fn peer_fix_errors_are_reported() {
    let base = serve(
        Router::new()
            .route(
                "/agent/fix",
                post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
            )
            .route(
                "/empty/agent/fix",
                post(|| async { Json(json!({ "suggestion": "" })) }),
            ),
    )
    .await;

    let err = PeerFixClient::new(base.clone(), Duration::from_secs(5))
        .request_fix(&["Traceback".into()], "python")
        .await
        .unwrap_err();
    assert!(matches!(err, EscalationError::Status { status: 502, .. }));

    let err = PeerFixClient::new(format!("{base}/empty/"), Duration::from_secs(5))
        .request_fix(&["Traceback".into()], "python")
        .await
        .unwrap_err();
    assert!(matches!(err, EscalationError::Malformed(_)));

    let err = PeerFixClient::new("http://127.0.0.1:1", Duration::from_secs(2))
        .request_fix(&[], "python")
        .await
        .unwrap_err();
    assert!(matches!(err, EscalationError::Http(_)));
}

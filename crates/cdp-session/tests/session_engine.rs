//! End-to-end engine behavior over an in-memory transport pair: correlation
//! under shuffled replies, wire-order event delivery, teardown draining, and
//! the lifecycle edges.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};

use cdp_session::commands::{CaptureScreenshot, GetVersion, ImageFormat, Navigate};
use cdp_session::transport::{ChannelRemote, ChannelTransport};
use cdp_session::{Session, SessionConfig, SessionError, SessionState};

fn engine(transport: Arc<ChannelTransport>) -> Arc<Session> {
    Arc::new(Session::with_executor(
        SessionConfig::default(),
        transport,
        Handle::current(),
    ))
}

async fn connected_engine() -> (Arc<Session>, ChannelRemote) {
    let (transport, remote) = ChannelTransport::pair();
    let session = engine(transport);
    session.connect().await.expect("connect");
    (session, remote)
}

async fn next_frame(remote: &mut ChannelRemote) -> Value {
    let text = timeout(Duration::from_secs(5), remote.from_client.recv())
        .await
        .expect("timed out waiting for an outbound frame")
        .expect("client hung up");
    serde_json::from_str(&text).expect("outbound frame must be valid json")
}

async fn reply(remote: &ChannelRemote, body: Value) {
    remote
        .to_client
        .send(body.to_string())
        .await
        .expect("push inbound frame");
}

#[tokio::test]
async fn shuffled_replies_reach_their_own_callers() {
    let (session, mut remote) = connected_engine().await;

    const CALLS: u64 = 8;
    let mut tasks = Vec::new();
    for seq in 0..CALLS {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            session.execute_raw("Probe.echo", json!({ "seq": seq })).await
        }));
    }

    let mut frames = Vec::new();
    for _ in 0..CALLS {
        let frame = next_frame(&mut remote).await;
        frames.push((
            frame["id"].as_u64().unwrap(),
            frame["params"]["seq"].as_u64().unwrap(),
        ));
    }

    // All ids distinct.
    let mut ids: Vec<u64> = frames.iter().map(|(id, _)| *id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), CALLS as usize);

    // Answer in reverse arrival order.
    for (id, seq) in frames.iter().rev() {
        reply(&remote, json!({ "id": id, "result": { "seq": seq } })).await;
    }

    for (seq, task) in tasks.into_iter().enumerate() {
        let response = task.await.unwrap().expect("command must succeed");
        assert_eq!(
            response.result["seq"],
            json!(seq as u64),
            "caller {seq} must get its own reply"
        );
    }

    session.close().await;
}

#[tokio::test]
async fn events_and_replies_keep_wire_order() {
    let (session, mut remote) = connected_engine().await;

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    session.subscribe("Probe.marker", move |params| {
        let tag = params["seq"].as_str().unwrap_or_default().to_string();
        sink.lock().unwrap().push(tag);
    });

    let call = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.execute_raw("Probe.command", json!({})).await })
    };

    let frame = next_frame(&mut remote).await;
    let id = frame["id"].as_u64().unwrap();

    // Wire order: E1, then the reply, then E2.
    reply(&remote, json!({ "method": "Probe.marker", "params": { "seq": "E1" } })).await;
    reply(&remote, json!({ "id": id, "result": { "ok": true } })).await;
    reply(&remote, json!({ "method": "Probe.marker", "params": { "seq": "E2" } })).await;

    let response = call.await.unwrap().expect("command must succeed");
    assert_eq!(response.result["ok"], true);

    // E1 was dispatched before the reply completed.
    assert_eq!(
        log.lock().unwrap().first().map(String::as_str),
        Some("E1"),
        "the event preceding the reply must be visible once the reply is"
    );

    // E2 lands after the reply's completion effect.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while log.lock().unwrap().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "E2 never arrived");
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(log.lock().unwrap().as_slice(), ["E1", "E2"]);

    session.close().await;
}

#[tokio::test]
async fn closing_drains_outstanding_calls_exactly_once() {
    let (session, mut remote) = connected_engine().await;

    let call = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.execute_raw("Probe.never", json!({})).await })
    };

    // Make sure the command is registered and on the wire before closing.
    let _frame = next_frame(&mut remote).await;
    assert_eq!(session.outstanding(), 1);

    session.close().await;

    match call.await.unwrap() {
        Err(SessionError::Closed { .. }) => {}
        other => panic!("expected Closed, got {other:?}"),
    }
    assert_eq!(session.outstanding(), 0);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let (session, _remote) = connected_engine().await;

    session.close().await;
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    // And a close_async on an already-closed session is a no-op too.
    session.close_async();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn close_async_reaches_closed_observable_via_state_watch() {
    let (session, _remote) = connected_engine().await;

    let mut states = session.state_changes();
    session.close_async();

    timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == SessionState::Closed),
    )
    .await
    .expect("close_async must finish")
    .expect("state watch must stay alive");

    // A blocking close after the fact just observes the terminal state.
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn unknown_reply_ids_and_garbage_are_dropped_harmlessly() {
    let (session, mut remote) = connected_engine().await;

    // Neither a reply nobody asked for nor unparseable text may disturb the
    // pump.
    reply(&remote, json!({ "id": 4242, "result": {} })).await;
    remote
        .to_client
        .send("definitely not json".to_string())
        .await
        .unwrap();

    let call = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.execute_raw("Probe.alive", json!({})).await })
    };
    let frame = next_frame(&mut remote).await;
    let id = frame["id"].as_u64().unwrap();
    reply(&remote, json!({ "id": id, "result": { "alive": true } })).await;

    let response = call.await.unwrap().expect("pump must still be routing");
    assert_eq!(response.result["alive"], true);

    session.close().await;
}

#[tokio::test]
async fn losing_the_transport_fails_pending_calls_and_closes() {
    let (session, mut remote) = connected_engine().await;

    let call = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.execute_raw("Probe.lost", json!({})).await })
    };
    let _frame = next_frame(&mut remote).await;

    // The far side goes away without a reply.
    drop(remote);

    match call.await.unwrap() {
        Err(SessionError::Closed { .. }) => {}
        other => panic!("expected Closed, got {other:?}"),
    }

    let mut states = session.state_changes();
    timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == SessionState::Closed),
    )
    .await
    .expect("connection loss must close the session")
    .expect("state watch must stay alive");
}

#[tokio::test]
async fn typed_commands_round_trip_through_the_engine() {
    let (session, mut remote) = connected_engine().await;

    let call = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.execute(GetVersion {}).await })
    };

    let frame = next_frame(&mut remote).await;
    assert_eq!(frame["method"], "Browser.getVersion");
    assert_eq!(frame["params"], json!({}));
    let id = frame["id"].as_u64().unwrap();

    reply(
        &remote,
        json!({
            "id": id,
            "result": {
                "protocolVersion": "1.3",
                "product": "Chrome/126.0.6478.55",
                "revision": "@abcdef",
                "userAgent": "Mozilla/5.0",
                "jsVersion": "12.6"
            }
        }),
    )
    .await;

    let response = call.await.unwrap().expect("typed decode must succeed");
    assert_eq!(response.result.product, "Chrome/126.0.6478.55");
    assert_eq!(response.result.protocol_version, "1.3");

    session.close().await;
}

#[tokio::test]
async fn protocol_errors_surface_as_typed_failures() {
    let (session, mut remote) = connected_engine().await;

    let call = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session.execute(Navigate::new("https://unreachable.example")).await
        })
    };

    let frame = next_frame(&mut remote).await;
    let id = frame["id"].as_u64().unwrap();
    reply(
        &remote,
        json!({
            "id": id,
            "error": { "code": -32000, "message": "Cannot navigate to invalid URL" }
        }),
    )
    .await;

    match call.await.unwrap() {
        Err(SessionError::Protocol { code, message, id: failed_id, .. }) => {
            assert_eq!(code, -32000);
            assert_eq!(message, "Cannot navigate to invalid URL");
            assert_eq!(failed_id.0, id);
        }
        other => panic!("expected Protocol failure, got {other:?}"),
    }

    session.close().await;
}

#[tokio::test]
async fn validation_failures_produce_no_traffic() {
    let (session, mut remote) = connected_engine().await;

    let err = session
        .execute(
            CaptureScreenshot::new()
                .with_format(ImageFormat::Jpeg)
                .with_quality(150),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidParams { .. }));
    assert!(remote.from_client.try_recv().is_err(), "nothing may be sent");
    assert_eq!(session.outstanding(), 0);

    session.close().await;
}

#[tokio::test]
async fn embedded_quotes_survive_the_wire_round_trip() {
    let (session, mut remote) = connected_engine().await;

    let call = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .execute_raw("Probe.quote", json!({ "a": "x\"y", "b": 3 }))
                .await
        })
    };

    let text = timeout(Duration::from_secs(5), remote.from_client.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(text.contains(r#"x\"y"#), "quote must be escaped on the wire");

    let frame: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(frame["params"]["a"], "x\"y");
    assert_eq!(frame["params"]["b"], 3);

    let id = frame["id"].as_u64().unwrap();
    reply(&remote, json!({ "id": id, "result": { "value": 42 } })).await;

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.id.0, id);
    assert_eq!(response.result["value"], 42);

    session.close().await;
}

#[tokio::test]
async fn owned_worker_pool_drives_the_pump_too() {
    let cfg = SessionConfig {
        connect_timeout_secs: 5,
        worker_threads: 2,
        own_executor: true,
    };
    let (transport, mut remote) = ChannelTransport::pair();
    let session = Arc::new(Session::new(cfg, transport));
    session.connect().await.expect("connect on owned pool");

    let call = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.execute_raw("Probe.pool", json!({})).await })
    };
    let frame = next_frame(&mut remote).await;
    let id = frame["id"].as_u64().unwrap();
    reply(&remote, json!({ "id": id, "result": { "pool": "owned" } })).await;

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.result["pool"], "owned");

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn execute_after_close_is_rejected_before_touching_the_table() {
    let (session, _remote) = connected_engine().await;
    session.close().await;

    let err = session
        .execute_raw("Probe.late", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
    assert_eq!(session.outstanding(), 0);
}

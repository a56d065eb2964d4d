//! WebSocket tests against a server bound on an ephemeral port.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};

use voice_server::config::ServerConfig;
use voice_server::routes::build_router;
use voice_server::state::AppState;

use common::*;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(h: &Harness) -> (SocketAddr, AppState) {
    let state = AppState::new(ServerConfig::default(), h.services.clone());
    let app = build_router(state.clone()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, path: &str) -> (Socket, String) {
    let (mut ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    let hello = next_json(&mut ws).await.expect("no session event");
    assert_eq!(hello["type"], "session");
    let session_id = hello["session_id"].as_str().unwrap().to_string();
    (ws, session_id)
}

/// The next JSON event, or `None` once the server closed the socket.
async fn next_json(ws: &mut Socket) -> Option<Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("socket went quiet")?;
        match message.ok()? {
            WsMessage::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            WsMessage::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn until_type(ws: &mut Socket, kind: &str) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let event = next_json(ws).await.expect("socket closed early");
        let done = event["type"] == kind;
        events.push(event);
        if done {
            return events;
        }
    }
}

fn types(events: &[Value]) -> Vec<&str> {
    events.iter().map(|e| e["type"].as_str().unwrap()).collect()
}

async fn wait_until_removed(state: &AppState, session_id: &str) {
    for _ in 0..200 {
        if !state.registry.is_live(session_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {session_id} still registered");
}

#[tokio::test]
async fn test_websocket_conversation() {
    let h = harness(&["天气怎么样"], vec![vec!["今天", "天气不错。"]], Duration::from_millis(5)).await;
    let (addr, state) = serve(&h).await;

    let (mut ws, session_id) = connect(addr, "/ws").await;
    assert!(session_id.starts_with("voice_session_"));
    assert!(state.registry.is_live(&session_id));

    ws.send(WsMessage::Binary(utterance().into())).await.unwrap();
    let events = until_type(&mut ws, "end_of_response").await;
    assert_eq!(
        types(&events),
        vec!["speech_start", "speech_end", "transcript", "audio", "end_of_response"]
    );
    assert_eq!(events[2]["text"], "天气怎么样");
    let audio = &events[3];
    assert_eq!(audio["text"], "今天天气不错。");
    assert_eq!(audio["sequence_index"], 0);
    let artifact_id = audio["artifact_id"].as_str().unwrap();
    assert_eq!(audio["url"], format!("/api/artifact/{artifact_id}"));
    assert!(h.store.is_reachable(artifact_id));

    // Nothing to interrupt: no reply.
    ws.send(WsMessage::Text(r#"{"type":"interrupt"}"#.into())).await.unwrap();
    ws.close(None).await.unwrap();

    wait_until_removed(&state, &session_id).await;
    assert!(state.registry.is_empty());
    assert_eq!(h.store.session_artifact_count(&session_id), 0);
    assert!(!h.store.is_registered(artifact_id));
}

#[tokio::test]
async fn test_websocket_interrupt_mid_reply() {
    let h = harness(&["讲个故事"], vec![vec!["从前", "有座山。"]], Duration::from_millis(150)).await;
    let (addr, state) = serve(&h).await;

    let (mut ws, session_id) = connect(addr, "/api/ws").await;
    ws.send(WsMessage::Binary(utterance().into())).await.unwrap();
    let events = until_type(&mut ws, "transcript").await;
    assert_eq!(types(&events), vec!["speech_start", "speech_end", "transcript"]);

    ws.send(WsMessage::Text(r#"{"type":"interrupt"}"#.into())).await.unwrap();
    let event = next_json(&mut ws).await.unwrap();
    assert_eq!(event["type"], "interrupted");

    ws.close(None).await.unwrap();
    wait_until_removed(&state, &session_id).await;
    assert!(h.synthesizer.spoken.lock().unwrap().is_empty());
    assert_eq!(h.services.metrics.sessions().generations_cancelled, 1);
}

#[tokio::test]
async fn test_websocket_end_session_closes_socket() {
    let h = harness(&[], vec![], Duration::ZERO).await;
    let (addr, state) = serve(&h).await;

    let (mut ws, session_id) = connect(addr, "/ws").await;
    ws.send(WsMessage::Text(r#"{"type":"end_session"}"#.into())).await.unwrap();

    let event = next_json(&mut ws).await.unwrap();
    assert_eq!(event["type"], "session_ended");
    assert_eq!(event["session_id"], session_id.as_str());
    assert!(next_json(&mut ws).await.is_none());

    wait_until_removed(&state, &session_id).await;
    assert_eq!(h.services.metrics.sessions().sessions_active, 0);
}

#[tokio::test]
async fn test_malformed_text_frame_keeps_socket_open() {
    let h = harness(&["你好"], vec![vec!["你好！"]], Duration::from_millis(5)).await;
    let (addr, state) = serve(&h).await;

    let (mut ws, session_id) = connect(addr, "/ws").await;
    ws.send(WsMessage::Text("not json".into())).await.unwrap();
    ws.send(WsMessage::Binary(utterance().into())).await.unwrap();

    let events = until_type(&mut ws, "end_of_response").await;
    assert_eq!(events.last().unwrap()["text"], "你好！");
    assert!(state.registry.is_live(&session_id));

    drop(ws);
    wait_until_removed(&state, &session_id).await;
}

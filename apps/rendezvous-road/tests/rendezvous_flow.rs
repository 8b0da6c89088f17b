use std::time::Duration;

use axum::extract::State;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use rendezvous_proto::{Envelope, Role, CLOSE, CLOSE_CMD, RENDEZVOUS_PATH};
use rendezvous_road::config::{parse_pairing_rules, DEFAULT_PAIRING_RULES};
use rendezvous_road::handlers::health_check;
use rendezvous_road::registry::{ConflictPolicy, Registry};
use rendezvous_road::serve;
use rendezvous_road::websocket::SignalingState;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

async fn start_server(rules: &str, policy: ConflictPolicy) -> (String, SignalingState) {
    let rules = parse_pairing_rules(rules).expect("rules parse");
    let state = SignalingState::from_registry(Registry::new(rules, policy));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(serve(listener, state.clone(), std::future::pending()));
    (format!("ws://{addr}{RENDEZVOUS_PATH}"), state)
}

async fn connect(url: &str) -> Client {
    let (client, _) = connect_async(url).await.expect("connect");
    client
}

async fn announce(url: &str, role: &str) -> Client {
    let mut client = connect(url).await;
    send_text(&mut client, &Envelope::opener(role).to_text().unwrap()).await;
    client
}

async fn send_text(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string()))
        .await
        .expect("send");
}

/// Next text frame, or `None` once the server closed the channel.
async fn next_text(client: &mut Client) -> Option<String> {
    loop {
        let frame = timeout(STEP, client.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(text),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn expect_text(client: &mut Client, expected: &str) {
    assert_eq!(next_text(client).await.as_deref(), Some(expected));
}

async fn expect_silence(client: &mut Client) {
    if let Ok(frame) = timeout(QUIET, client.next()).await {
        panic!("expected no frame, got {frame:?}");
    }
}

fn status(text: &str) -> String {
    format!(r#"{{"type":"status","status":"{text}"}}"#)
}

async fn wait_for_roles(state: &SignalingState, expected: &[&str]) {
    let expected: Vec<Role> = expected.iter().copied().map(Role::new).collect();
    for _ in 0..100 {
        if state.roles() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("roles never became {expected:?}, have {:?}", state.roles());
}

#[test_timeout::tokio_timeout_test]
async fn pairing_reports_waiting_then_ready() {
    let (url, _state) = start_server(DEFAULT_PAIRING_RULES, ConflictPolicy::Replace).await;

    let mut robot = announce(&url, "robotino").await;
    expect_text(&mut robot, &status("waiting for browser")).await;

    let mut recorder = announce(&url, "answerClient").await;
    expect_text(&mut robot, &status("ready")).await;
    expect_text(&mut recorder, &status("ready")).await;
    expect_silence(&mut robot).await;
}

#[test_timeout::tokio_timeout_test]
async fn negotiation_frames_are_relayed_verbatim() {
    let (url, _state) = start_server("cam+viewer", ConflictPolicy::Replace).await;
    let mut cam = announce(&url, "cam").await;
    expect_text(&mut cam, &status("waiting for viewer")).await;
    let mut viewer = announce(&url, "viewer").await;
    expect_text(&mut cam, &status("ready")).await;
    expect_text(&mut viewer, &status("ready")).await;

    let offer = "{ \"sdp\": \"v=0\\r\\na=x\\r\\n\",  \"type\": \"offer\", \"note\": 7 }";
    send_text(&mut cam, offer).await;
    expect_text(&mut viewer, offer).await;
    expect_silence(&mut cam).await;

    let candidate = r#"{"type":"candidate","candidate":"candidate:1 1 udp 1 10.0.0.2 9 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
    send_text(&mut viewer, candidate).await;
    expect_text(&mut cam, candidate).await;
}

#[test_timeout::tokio_timeout_test]
async fn hang_up_leaves_peer_waiting() {
    let (url, state) = start_server(DEFAULT_PAIRING_RULES, ConflictPolicy::Replace).await;
    let mut robot = announce(&url, "robotino").await;
    expect_text(&mut robot, &status("waiting for browser")).await;
    let mut recorder = announce(&url, "answerClient").await;
    expect_text(&mut robot, &status("ready")).await;
    expect_text(&mut recorder, &status("ready")).await;

    send_text(&mut recorder, CLOSE).await;
    expect_text(&mut robot, &status("waiting for browser")).await;
    wait_for_roles(&state, &["robotino"]).await;

    let mut recorder = announce(&url, "answerClient").await;
    expect_text(&mut robot, &status("ready")).await;
    expect_text(&mut recorder, &status("ready")).await;
}

#[test_timeout::tokio_timeout_test]
async fn newer_channel_displaces_older_holder() {
    let (url, state) = start_server("cam+viewer", ConflictPolicy::Replace).await;
    let mut viewer = announce(&url, "viewer").await;
    expect_text(&mut viewer, &status("waiting for cam")).await;
    let mut first = announce(&url, "cam").await;
    expect_text(&mut first, &status("ready")).await;
    expect_text(&mut viewer, &status("ready")).await;

    let mut second = announce(&url, "cam").await;
    expect_text(&mut first, CLOSE_CMD).await;
    assert_eq!(next_text(&mut first).await, None);
    expect_text(&mut second, &status("ready")).await;
    expect_text(&mut viewer, &status("ready")).await;

    // The displaced channel's teardown must not evict its successor.
    tokio::time::sleep(QUIET).await;
    wait_for_roles(&state, &["cam", "viewer"]).await;
    send_text(&mut second, r#"{"type":"answer","sdp":"a"}"#).await;
    expect_text(&mut viewer, r#"{"type":"answer","sdp":"a"}"#).await;
}

#[test_timeout::tokio_timeout_test]
async fn reject_policy_keeps_first_holder() {
    let (url, state) = start_server("cam+viewer", ConflictPolicy::Reject).await;
    let mut first = announce(&url, "cam").await;
    expect_text(&mut first, &status("waiting for viewer")).await;
    let mut second = announce(&url, "cam").await;

    expect_silence(&mut first).await;
    expect_silence(&mut second).await;
    let holder = state.owner(&Role::new("cam"));
    assert!(holder.is_some());

    // Frames from the refused channel go nowhere.
    let mut viewer = announce(&url, "viewer").await;
    expect_text(&mut first, &status("ready")).await;
    expect_text(&mut viewer, &status("ready")).await;
    send_text(&mut second, r#"{"type":"offer","sdp":"x"}"#).await;
    expect_silence(&mut viewer).await;
    assert_eq!(state.owner(&Role::new("cam")), holder);
}

#[test_timeout::tokio_timeout_test]
async fn unknown_and_unregistered_senders_are_ignored() {
    let (url, state) = start_server("cam+viewer", ConflictPolicy::Replace).await;
    let mut cam = announce(&url, "cam").await;
    expect_text(&mut cam, &status("waiting for viewer")).await;

    let mut stranger = announce(&url, "mallory").await;
    send_text(&mut stranger, r#"{"type":"offer","sdp":"x"}"#).await;
    send_text(&mut stranger, "not json at all").await;
    expect_silence(&mut cam).await;

    let mut anonymous = connect(&url).await;
    send_text(&mut anonymous, r#"{"type":"candidate","candidate":"c"}"#).await;
    expect_silence(&mut cam).await;
    wait_for_roles(&state, &["cam"]).await;
}

#[test_timeout::tokio_timeout_test]
async fn health_lists_registered_roles() {
    let (url, state) = start_server(DEFAULT_PAIRING_RULES, ConflictPolicy::Replace).await;
    let mut robot = announce(&url, "robotino").await;
    expect_text(&mut robot, &status("waiting for browser")).await;
    let mut viewer = announce(&url, "browser").await;
    expect_text(&mut viewer, &status("ready")).await;

    let health = health_check(State(state)).await.0;
    assert_eq!(health.status, "ok");
    assert_eq!(health.roles, vec![Role::new("browser"), Role::new("robotino")]);
}

#[test_timeout::tokio_timeout_test]
async fn switching_roles_never_pairs_a_channel_with_itself() {
    let (url, state) = start_server("cam+viewer", ConflictPolicy::Replace).await;

    let mut switcher = announce(&url, "cam").await;
    expect_text(&mut switcher, &status("waiting for viewer")).await;

    send_text(&mut switcher, &Envelope::opener("viewer").to_text().unwrap()).await;
    expect_text(&mut switcher, &status("waiting for cam")).await;
    expect_silence(&mut switcher).await;
    wait_for_roles(&state, &["viewer"]).await;

    let mut cam = announce(&url, "cam").await;
    expect_text(&mut cam, &status("ready")).await;
    expect_text(&mut switcher, &status("ready")).await;
    expect_silence(&mut switcher).await;
}

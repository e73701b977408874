use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beach_pier::config::ServerConfig;
use beach_pier::server::{serve, AppState};
use beach_pier::switchboard::SwitchboardConfig;
use beach_pier::telemetry::detached_metrics_handle;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(250);

struct Pier {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl Pier {
    async fn start(switchboard: SwitchboardConfig) -> Self {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            switchboard,
            ..ServerConfig::default()
        };
        let listener = TcpListener::bind(config.listen_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(&config, detached_metrics_handle());
        tokio::spawn(serve(listener, state.clone(), std::future::pending()));
        Self { addr, state }
    }

    async fn connect(&self) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .expect("connect");
        let mut client = Client {
            ws,
            id: String::new(),
        };
        let welcome = client.recv().await;
        assert_eq!(welcome["type"], "welcome");
        client.id = welcome["connectionId"].as_str().unwrap().to_string();
        client
    }

    fn is_waiting(&self, client: &Client) -> bool {
        self.state
            .switchboard
            .snapshot()
            .waiting
            .iter()
            .any(|id| id.to_string() == client.id)
    }

    async fn wait_until(&self, what: &str, condition: impl Fn(&AppState) -> bool) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        while !condition(&self.state) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting until {what}"
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Request a match and wait until the pier has processed it.
    async fn enqueue(&self, client: &mut Client) {
        client.send(json!({ "type": "find-match" })).await;
        let id = client.id.clone();
        self.wait_until("client is queued", |state| {
            state
                .switchboard
                .snapshot()
                .waiting
                .iter()
                .any(|waiting| waiting.to_string() == id)
        })
        .await;
    }

    /// Pair two fresh clients; `first` waits, `second` initiates.
    async fn pair(&self, first: &mut Client, second: &mut Client) -> String {
        self.enqueue(first).await;
        second.send(json!({ "type": "find-match" })).await;
        let a = first.recv().await;
        let b = second.recv().await;
        assert_eq!(a["type"], "match-found");
        assert_eq!(a, b);
        a["roomId"].as_str().unwrap().to_string()
    }
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    id: String,
}

impl Client {
    async fn send(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("send");
    }

    async fn recv_text(&mut self) -> String {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed")
                .expect("websocket error");
            if let Message::Text(text) = frame {
                return text.as_str().to_string();
            }
        }
    }

    async fn recv(&mut self) -> Value {
        serde_json::from_str(&self.recv_text().await).expect("json frame")
    }

    async fn assert_silent(&mut self) {
        if let Ok(Some(Ok(frame))) = timeout(QUIET_PERIOD, self.ws.next()).await {
            panic!("client {} unexpectedly received {frame:?}", self.id);
        }
    }

    async fn close(mut self) {
        self.ws.close(None).await.expect("close");
    }
}

#[test_timeout::timeout(30)]
async fn first_two_requesters_pair_and_third_waits() {
    let pier = Pier::start(SwitchboardConfig::default()).await;
    let mut x = pier.connect().await;
    let mut y = pier.connect().await;
    let mut z = pier.connect().await;

    pier.enqueue(&mut x).await;
    y.send(json!({ "type": "find-match" })).await;

    let to_x = x.recv().await;
    let to_y = y.recv().await;
    assert_eq!(to_x["type"], "match-found");
    assert_eq!(to_x["roomId"], to_y["roomId"]);
    assert_eq!(to_x["initiator"], y.id.as_str());
    assert_eq!(to_y["initiator"], y.id.as_str());

    pier.enqueue(&mut z).await;
    z.assert_silent().await;
    assert!(pier.is_waiting(&z));
    assert_eq!(pier.state.switchboard.snapshot().sessions.len(), 1);
}

#[test_timeout::timeout(30)]
async fn disconnected_waiter_is_never_offered_as_partner() {
    let pier = Pier::start(SwitchboardConfig::default()).await;
    let mut x = pier.connect().await;
    let mut y = pier.connect().await;

    pier.enqueue(&mut x).await;
    x.close().await;
    pier.wait_until("x is gone", |state| {
        state.registry.len() == 1 && state.switchboard.snapshot().waiting.is_empty()
    })
    .await;

    pier.enqueue(&mut y).await;
    y.assert_silent().await;
    assert_eq!(pier.state.switchboard.snapshot().waiting.len(), 1);
}

#[test_timeout::timeout(30)]
async fn offer_is_relayed_verbatim_to_the_peer_only() {
    let pier = Pier::start(SwitchboardConfig::default()).await;
    let mut x = pier.connect().await;
    let mut y = pier.connect().await;
    let mut z = pier.connect().await;
    let room = pier.pair(&mut x, &mut y).await;

    let payload = r#"{"sdp" : "v=0\r\no=- 46117 2 IN IP4 127.0.0.1",  "type":"offer"}"#;
    y.send_raw(&format!(
        r#"{{"type":"offer","roomId":"{room}","payload":{payload}}}"#
    ))
    .await;

    let text = x.recv_text().await;
    assert!(text.contains(payload), "payload was rewritten: {text}");
    let frame: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(frame["type"], "offer");
    assert_eq!(frame["roomId"], room.as_str());
    assert_eq!(frame["from"], y.id.as_str());

    y.assert_silent().await;
    z.assert_silent().await;
}

#[test_timeout::timeout(30)]
async fn answer_and_candidates_flow_back_to_the_initiator() {
    let pier = Pier::start(SwitchboardConfig::default()).await;
    let mut x = pier.connect().await;
    let mut y = pier.connect().await;
    let room = pier.pair(&mut x, &mut y).await;

    x.send(json!({ "type": "answer", "roomId": room, "payload": { "sdp": "answer" } }))
        .await;
    x.send(json!({ "type": "ice-candidate", "roomId": room, "payload": null }))
        .await;

    let answer = y.recv().await;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["payload"]["sdp"], "answer");
    let candidate = y.recv().await;
    assert_eq!(candidate["type"], "ice-candidate");
    assert!(candidate["payload"].is_null());
    assert_eq!(candidate["from"], x.id.as_str());
}

#[test_timeout::timeout(30)]
async fn outsiders_cannot_signal_into_a_session() {
    let pier = Pier::start(SwitchboardConfig::default()).await;
    let mut x = pier.connect().await;
    let mut y = pier.connect().await;
    let mut z = pier.connect().await;
    let room = pier.pair(&mut x, &mut y).await;

    z.send(json!({ "type": "ice-candidate", "roomId": room, "payload": { "candidate": "spoof" } }))
        .await;

    x.assert_silent().await;
    y.assert_silent().await;
    z.assert_silent().await;
}

#[test_timeout::timeout(30)]
async fn signals_after_session_end_are_dropped_silently() {
    let pier = Pier::start(SwitchboardConfig::default()).await;
    let mut x = pier.connect().await;
    let mut y = pier.connect().await;
    let room = pier.pair(&mut x, &mut y).await;

    x.close().await;
    pier.wait_until("session is dissolved", |state| {
        state.switchboard.snapshot().sessions.is_empty()
    })
    .await;

    y.send(json!({ "type": "offer", "roomId": room, "payload": {} }))
        .await;
    y.assert_silent().await;

    // The survivor can look for a new partner.
    pier.enqueue(&mut y).await;
}

#[test_timeout::timeout(30)]
async fn peer_left_is_sent_when_enabled() {
    let pier = Pier::start(SwitchboardConfig {
        notify_peer_left: true,
        ..Default::default()
    })
    .await;
    let mut x = pier.connect().await;
    let mut y = pier.connect().await;
    let room = pier.pair(&mut x, &mut y).await;

    y.close().await;
    let notice = x.recv().await;
    assert_eq!(notice, json!({ "type": "peer-left", "roomId": room }));
}

#[test_timeout::timeout(30)]
async fn malformed_frames_get_an_error_and_ping_gets_pong() {
    let pier = Pier::start(SwitchboardConfig::default()).await;
    let mut x = pier.connect().await;

    x.send_raw("{ not json").await;
    assert_eq!(x.recv().await["type"], "error");

    x.send(json!({ "type": "offer", "payload": {} })).await;
    let err = x.recv().await;
    assert_eq!(err["type"], "error");
    assert!(err["message"].as_str().unwrap().contains("roomId"));

    x.send(json!({ "type": "ping" })).await;
    assert_eq!(x.recv().await, json!({ "type": "pong" }));
    assert!(!pier.is_waiting(&x));
}

#[test_timeout::timeout(30)]
async fn repeated_find_match_does_not_duplicate_the_waiter() {
    let pier = Pier::start(SwitchboardConfig::default()).await;
    let mut x = pier.connect().await;

    pier.enqueue(&mut x).await;
    x.send(json!({ "type": "find-match" })).await;
    x.send(json!({ "type": "ping" })).await;
    // Frames from one connection are handled in order, so the pong proves the
    // duplicate request was processed.
    assert_eq!(x.recv().await["type"], "pong");
    assert_eq!(pier.state.switchboard.snapshot().waiting.len(), 1);
}

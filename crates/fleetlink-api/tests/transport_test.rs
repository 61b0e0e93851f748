// Loopback tests for the WebSocket server and the agent link.
#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use fleetlink_api::client::{AgentLink, ReconnectConfig};
use fleetlink_api::protocol::{AgentCommand, CommandReply, ControlRequest};
use fleetlink_api::server::{self, ConnectionHandler, Outbound, ServerConfig};
use fleetlink_api::{AgentMessage, ConnectionId, Handshake, Role, ToAgent};

// ── Helpers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Open(Handshake),
    Frame(String),
    Close,
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(ConnectionId, Seen)>>,
    outbound: Mutex<Vec<mpsc::Sender<Outbound>>>,
}

impl Recorder {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }
}

impl ConnectionHandler for Recorder {
    fn on_open(&self, id: ConnectionId, handshake: Handshake, outbound: mpsc::Sender<Outbound>) {
        let welcome = serde_json::to_string(&ToAgent::Welcome { connection_id: id }).unwrap();
        let _ = outbound.try_send(Outbound::Text(welcome.into()));
        self.outbound.lock().unwrap().push(outbound);
        self.seen.lock().unwrap().push((id, Seen::Open(handshake)));
    }

    fn on_frame(&self, id: ConnectionId, text: &str) {
        self.seen.lock().unwrap().push((id, Seen::Frame(text.to_owned())));
    }

    fn on_close(&self, id: ConnectionId) {
        self.seen.lock().unwrap().push((id, Seen::Close));
    }
}

async fn start(recorder: Arc<Recorder>) -> (Url, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        server::serve(listener, recorder, ServerConfig::default(), task_cancel)
            .await
            .unwrap();
    });
    (Url::parse(&format!("ws://{addr}/")).unwrap(), cancel)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_link_round_trip() {
    let recorder = Arc::new(Recorder::default());
    let (url, server_cancel) = start(Arc::clone(&recorder)).await;

    let link_cancel = CancellationToken::new();
    let link = AgentLink::connect(
        url,
        Handshake::agent("acme", "downtown", "till-1"),
        ReconnectConfig::default(),
        link_cancel.clone(),
    );
    let mut inbound = link.subscribe();

    // Welcome arrives first.
    let frame = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(*frame, ToAgent::Welcome { .. }));

    assert_eq!(
        recorder.seen().first(),
        Some(&Seen::Open(Handshake::agent("acme", "downtown", "till-1")))
    );

    // Gateway → agent request.
    let correlation_id = uuid::Uuid::new_v4();
    let request = ToAgent::Request {
        correlation_id,
        command: AgentCommand::Control(ControlRequest {
            action: "refresh".into(),
            ..ControlRequest::default()
        }),
    };
    let text = serde_json::to_string(&request).unwrap();
    let sender = recorder.outbound.lock().unwrap()[0].clone();
    sender.send(Outbound::Text(text.into())).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*frame, request);

    // Agent → gateway reply.
    link.send(AgentMessage::ControlAck(CommandReply {
        correlation_id: Some(correlation_id),
        printer_id: None,
        success: true,
        message: Some("ok".into()),
    }))
    .await
    .unwrap();

    eventually(|| {
        recorder
            .seen()
            .iter()
            .any(|s| matches!(s, Seen::Frame(t) if t.contains("control_ack")))
    })
    .await;

    link.shutdown();
    eventually(|| recorder.seen().contains(&Seen::Close)).await;
    server_cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_handshake_is_rejected_before_upgrade() {
    let recorder = Arc::new(Recorder::default());
    let (url, server_cancel) = start(Arc::clone(&recorder)).await;

    let mut bad = url.clone();
    bad.set_query(Some("role=agent&companyId=acme"));

    let err = tokio_tungstenite::connect_async(bad.as_str()).await.unwrap_err();
    assert!(err.to_string().contains("400"), "unexpected error: {err}");
    assert!(recorder.seen().is_empty());

    server_cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observer_handshake_is_accepted() {
    let recorder = Arc::new(Recorder::default());
    let (url, server_cancel) = start(Arc::clone(&recorder)).await;

    let url = Handshake::observer(Some("acme".into())).apply_to(&url);
    let (_ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    eventually(|| {
        recorder
            .seen()
            .iter()
            .any(|s| matches!(s, Seen::Open(h) if h.role == Role::Observer))
    })
    .await;

    server_cancel.cancel();
}

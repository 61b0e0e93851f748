// End-to-end: a started Fleet on a loopback socket, a real agent link
// and a real observer socket.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use fleetlink_api::client::{AgentLink, ReconnectConfig};
use fleetlink_api::protocol::{AgentCommand, CommandReply, PrinterReport, TestPrintRequest};
use fleetlink_api::{AgentMessage, Handshake, PrinterState, ToAgent};
use fleetlink_core::{Command, CommandResult, Fleet, FleetConfig};

// ── Helpers ─────────────────────────────────────────────────────────

async fn started_fleet() -> (Fleet, Url) {
    let mut config = FleetConfig::default();
    config.service.mdns = false;
    let fleet = Fleet::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = fleet.start(listener).unwrap();
    (fleet, Url::parse(&format!("ws://{addr}/")).unwrap())
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3s");
}

async fn next_json<S>(ws: &mut S) -> serde_json::Value
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Agent that answers every test print with success.
fn spawn_agent(url: &Url, branch: &str) -> (Arc<AgentLink>, CancellationToken) {
    let cancel = CancellationToken::new();
    let link = Arc::new(AgentLink::connect(
        url.clone(),
        Handshake::agent("acme", branch, "till-1"),
        ReconnectConfig::default(),
        cancel.clone(),
    ));

    let mut inbound = link.subscribe();
    let replies = Arc::clone(&link);
    tokio::spawn(async move {
        while let Ok(frame) = inbound.recv().await {
            if let ToAgent::Request {
                correlation_id,
                command: AgentCommand::TestPrint(request),
            } = frame.as_ref()
            {
                let reply = AgentMessage::TestResult(CommandReply {
                    correlation_id: Some(*correlation_id),
                    printer_id: Some(request.printer_id.clone()),
                    success: true,
                    message: Some("Test page printed".into()),
                });
                if replies.send(reply).await.is_err() {
                    break;
                }
            }
        }
    });
    (link, cancel)
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_round_trip_over_websocket() {
    let (fleet, url) = started_fleet().await;
    let (link, cancel) = spawn_agent(&url, "b1");

    eventually(|| fleet.gateway().agents_in_branch("b1") == 1).await;

    link.send(AgentMessage::PrinterDiscovered(PrinterReport {
        printer_id: "p1".into(),
        name: Some("Kitchen".into()),
        status: Some(PrinterState::Online),
        paper_level: Some(80),
        ..PrinterReport::default()
    }))
    .await
    .unwrap();
    eventually(|| fleet.store().get("p1").is_some()).await;
    let printer = fleet.store().get("p1").unwrap();
    assert_eq!(printer.company_id, "acme");
    assert_eq!(printer.status, PrinterState::Online);

    let result = fleet
        .execute(Command::TestPrint {
            branch_id: "b1".into(),
            request: TestPrintRequest {
                printer_id: "p1".into(),
                ..TestPrintRequest::default()
            },
        })
        .await
        .unwrap();
    let CommandResult::TestPrint(outcome) = result else {
        panic!("unexpected result {result:?}");
    };
    assert!(outcome.success);
    assert_eq!(outcome.message, "Test page printed");
    assert_eq!(fleet.gateway().pending_count(), 0);

    // Losing the only agent marks the branch offline.
    cancel.cancel();
    eventually(|| fleet.gateway().agents_in_branch("b1") == 0).await;
    eventually(|| fleet.store().get("p1").unwrap().status == PrinterState::Offline).await;

    tokio::time::timeout(Duration::from_secs(5), fleet.stop())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observer_gets_welcome_then_scoped_bulk() {
    let (fleet, url) = started_fleet().await;
    fleet
        .register_printer(fleetlink_core::PrinterRegistration {
            printer_id: "mine".into(),
            company_id: "acme".into(),
            branch_id: "b1".into(),
            ..Default::default()
        })
        .unwrap();
    fleet
        .register_printer(fleetlink_core::PrinterRegistration {
            printer_id: "theirs".into(),
            company_id: "globex".into(),
            branch_id: "b7".into(),
            ..Default::default()
        })
        .unwrap();

    let observer_url = format!("{url}?role=observer&companyId=acme");
    let (mut ws, _) = tokio_tungstenite::connect_async(observer_url.as_str())
        .await
        .unwrap();

    assert_eq!(next_json(&mut ws).await["type"], "welcome");
    let bulk = next_json(&mut ws).await;
    assert_eq!(bulk["type"], "status_bulk");
    let printers = bulk["printers"].as_array().unwrap();
    assert_eq!(printers.len(), 1);
    assert_eq!(printers[0]["id"], "mine");

    tokio::time::timeout(Duration::from_secs(5), fleet.stop())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_handshake_is_rejected_before_upgrade() {
    let (fleet, url) = started_fleet().await;

    // Agents must name their branch.
    let bad = format!("{url}?role=agent&companyId=acme");
    assert!(tokio_tungstenite::connect_async(bad.as_str()).await.is_err());
    assert_eq!(fleet.gateway().agent_count(), 0);

    tokio::time::timeout(Duration::from_secs(5), fleet.stop())
        .await
        .unwrap();
}

//! End-to-end tests using a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use herald_core::{Envelope, Target};
use herald_server::bridge::LocalBridge;
use herald_server::{HeraldServer, Hub, HubConfig};
use herald_settings::ServerSettings;
use serde_json::Value;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Boot a hub and server on an ephemeral port.
async fn boot_server(config: HubConfig) -> (String, Arc<Hub>) {
    let hub = Arc::new(Hub::new(config, Arc::new(LocalBridge)));
    hub.start().await.unwrap();
    let server = HeraldServer::new(
        hub.clone(),
        ServerSettings {
            port: 0,
            ..ServerSettings::default()
        },
    );
    let (addr, _handle) = server.listen().await.unwrap();
    (format!("ws://{addr}/ws"), hub)
}

fn fast_config() -> HubConfig {
    HubConfig {
        batch_poll_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(2),
        ..HubConfig::default()
    }
}

async fn connect(url: &str, principal: &str) -> Result<WsStream, WsError> {
    let mut req = url.into_client_request()?;
    let _ = req
        .headers_mut()
        .insert("x-principal-id", HeaderValue::from_str(principal).unwrap());
    let (ws, _) = connect_async(req).await?;
    Ok(ws)
}

/// Next text frame as JSON, or `None` once the socket closes.
async fn next_json(ws: &mut WsStream) -> Option<Value> {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.expect("frame timeout");
        match msg {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(other)) => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn wait_for_connections(hub: &Hub, n: usize) {
    for _ in 0..100 {
        if hub.registry().len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} connections, have {}", hub.registry().len());
}

// ─── Connect ───

#[tokio::test]
async fn first_frame_announces_connection_id() {
    let (url, hub) = boot_server(fast_config()).await;
    let mut ws = connect(&format!("{url}?scope=dashboard"), "3").await.unwrap();

    let hello = next_json(&mut ws).await.unwrap();
    assert_eq!(hello["type"], "heartbeat");
    let id = hello["connectionId"].as_str().unwrap();
    assert!(id.starts_with("conn_"));
    assert!(hub.registry().contains(&id.into()));

    hub.shutdown().await;
}

#[tokio::test]
async fn missing_project_rejects_upgrade() {
    let (url, hub) = boot_server(fast_config()).await;
    match connect(&format!("{url}?scope=project"), "3").await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 400),
        other => panic!("expected http 400, got {other:?}"),
    }
    assert!(hub.registry().is_empty());
    hub.shutdown().await;
}

#[tokio::test]
async fn reject_policy_returns_429() {
    let (url, hub) = boot_server(HubConfig {
        max_connections_per_user: 1,
        connection_limit_policy: herald_settings::ConnectionLimitPolicy::Reject,
        ..fast_config()
    })
    .await;
    let _first = connect(&url, "3").await.unwrap();
    match connect(&url, "3").await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 429),
        other => panic!("expected http 429, got {other:?}"),
    }
    hub.shutdown().await;
}

#[tokio::test]
async fn over_cap_evicts_oldest_with_error_frame() {
    let (url, hub) = boot_server(HubConfig {
        max_connections_per_user: 1,
        ..fast_config()
    })
    .await;
    let mut first = connect(&url, "3").await.unwrap();
    let _ = next_json(&mut first).await.unwrap();
    let _second = connect(&url, "3").await.unwrap();

    let notice = next_json(&mut first).await.unwrap();
    assert_eq!(notice["type"], "error");
    assert_eq!(notice["code"], "connection_limit");
    assert!(next_json(&mut first).await.is_none());
    wait_for_connections(&hub, 1).await;

    hub.shutdown().await;
}

// ─── Delivery ───

#[tokio::test]
async fn project_message_reaches_only_project_clients() {
    let (url, hub) = boot_server(fast_config()).await;
    let mut p7 = connect(&format!("{url}?scope=project&project_id=7"), "3")
        .await
        .unwrap();
    let mut p8 = connect(&format!("{url}?scope=project&project_id=8"), "3")
        .await
        .unwrap();
    let _ = next_json(&mut p7).await.unwrap();
    let _ = next_json(&mut p8).await.unwrap();

    let report = hub.send_to_project(&"7".into(), Envelope::project_update("7", "renamed"));
    assert_eq!(report.delivered, 1);

    let frame = next_json(&mut p7).await.unwrap();
    assert_eq!(frame["type"], "project_update");
    assert_eq!(frame["projectId"], "7");
    assert!(timeout(Duration::from_millis(200), p8.next()).await.is_err());

    hub.shutdown().await;
}

#[tokio::test]
async fn queued_messages_arrive_as_one_batch() {
    let (url, hub) = boot_server(fast_config()).await;
    let mut ws = connect(&url, "3").await.unwrap();
    let _ = next_json(&mut ws).await.unwrap();

    for i in 0..3 {
        hub.enqueue(
            Target::User("3".into()),
            Envelope::user_message(format!("m{i}")),
        )
        .unwrap();
    }

    let frame = next_json(&mut ws).await.unwrap();
    assert_eq!(frame["type"], "batch");
    let items = frame["messages"].as_array().unwrap();
    let texts: Vec<_> = items.iter().map(|m| m["message"].as_str().unwrap()).collect();
    assert_eq!(texts, ["m0", "m1", "m2"]);
    assert!(items.iter().all(|m| m["type"] == "user_message"));

    hub.shutdown().await;
}

#[tokio::test]
async fn client_close_unregisters() {
    let (url, hub) = boot_server(fast_config()).await;
    let mut ws = connect(&url, "3").await.unwrap();
    let _ = next_json(&mut ws).await.unwrap();
    wait_for_connections(&hub, 1).await;

    ws.close(None).await.unwrap();
    wait_for_connections(&hub, 0).await;

    hub.shutdown().await;
}

// ─── Shutdown ───

#[tokio::test]
async fn shutdown_sends_reconnect_then_closes() {
    let (url, hub) = boot_server(fast_config()).await;
    let mut ws = connect(&url, "3").await.unwrap();
    let _ = next_json(&mut ws).await.unwrap();

    hub.shutdown().await;
    let frame = next_json(&mut ws).await.unwrap();
    assert_eq!(frame["type"], "reconnect");
    assert_eq!(frame["reason"], "server_shutdown");
    assert!(next_json(&mut ws).await.is_none());
}

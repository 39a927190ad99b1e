//! WebSocket session lifecycle: one registered client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use herald_core::Envelope;
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::connection::ClientConnection;
use super::registry::ConnectionRegistry;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// How long the writer gets to flush after the reader stops.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// The first frame a client sees: a heartbeat carrying its connection id.
pub fn hello_frame(connection: &ClientConnection) -> String {
    Envelope::heartbeat()
        .with("connectionId", connection.id.as_str())
        .stamped(Utc::now())
        .encode()
}

/// Run a WebSocket session for an already registered connection.
///
/// 1. Sends the hello frame
/// 2. Forwards frames from the connection's buffer to the socket,
///    acknowledging each write on the connection
/// 3. Reads client frames until close, error, or a server-side close;
///    client pings and pongs count as activity
/// 4. Unregisters the connection
#[instrument(skip_all, fields(conn_id = %connection.id))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection: Arc<ClientConnection>,
    mut send_rx: mpsc::Receiver<Arc<String>>,
    registry: Arc<ConnectionRegistry>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let started = Instant::now();
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let hello = hello_frame(&connection);
    let greeted = ws_tx.send(Message::Text(hello.into())).await.is_ok();

    let writer_conn = connection.clone();
    let mut writer = tokio::spawn(async move {
        if !greeted {
            return;
        }
        loop {
            tokio::select! {
                biased;
                frame = send_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = String::clone(&frame);
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                    writer_conn.mark_written();
                }
                () = writer_conn.closed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    if greeted {
        loop {
            tokio::select! {
                () = connection.closed() => {
                    debug!("closed by server");
                    break;
                }
                frame = ws_rx.next() => match frame {
                    None | Some(Ok(Message::Close(_))) => {
                        info!("client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read error");
                        break;
                    }
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        debug!("ignoring client data frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        connection.touch();
                    }
                },
            }
        }
    }

    connection.close();
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    let _ = registry.unregister(&connection.id);

    info!(
        dropped = connection.drop_count(),
        duration_secs = started.elapsed().as_secs(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};

use crate::mailbox::{MailboxState, Registration};

#[derive(Serialize)]
pub struct HealthStatus {
    status: &'static str,
    online: usize,
}

pub fn router(state: MailboxState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/mailbox/:endpoint_id", get(mailbox_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn health_check(State(state): State<MailboxState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        online: state.online_count(),
    })
}

/// WebSocket upgrade handler
pub async fn mailbox_handler(
    ws: WebSocketUpgrade,
    Path(endpoint_id): Path<String>,
    State(state): State<MailboxState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, endpoint_id, state))
}

async fn handle_socket(socket: WebSocket, endpoint: String, state: MailboxState) {
    let Registration {
        connection_id,
        mut rx,
    } = state.connect(&endpoint);
    let (mut sender, mut receiver) = socket.split();
    info!(endpoint = %endpoint, connection_id, "mailbox connected");

    // Forward routed frames to the socket until the connection is replaced
    // or the peer goes away.
    let writer_endpoint = endpoint.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        debug!(endpoint = %writer_endpoint, "mailbox writer ended");
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => route_frame(&state, &endpoint, text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => route_frame(&state, &endpoint, text),
                    Err(_) => debug!(endpoint = %endpoint, "ignoring non-UTF8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(endpoint = %endpoint, error = %err, "mailbox socket error");
                    break;
                }
            },
        }
    }

    state.disconnect(&endpoint, connection_id);
    writer.abort();
    info!(endpoint = %endpoint, connection_id, "mailbox disconnected");
}

fn route_frame(state: &MailboxState, endpoint: &str, text: String) {
    match state.route(endpoint, text) {
        Ok(delivery) => trace!(endpoint, ?delivery, "frame routed"),
        Err(err) => warn!(endpoint, error = %err, "dropping frame"),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};

    use super::*;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(max_pending: usize) -> (SocketAddr, MailboxState) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = MailboxState::new(max_pending);
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn client(addr: SocketAddr, endpoint: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}/mailbox/{endpoint}"))
            .await
            .unwrap();
        ws
    }

    fn frame(from: &str, to: &str, kind: &str) -> String {
        json!({ "type": kind, "data": null, "from": from, "to": to }).to_string()
    }

    async fn next_kind(ws: &mut Client) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame within 5s")
                .expect("socket open")
                .unwrap();
            if let tungstenite::Message::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                return value["type"].as_str().unwrap().to_string();
            }
        }
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[test_timeout::tokio_timeout_test]
    async fn relays_between_connected_endpoints() {
        let (addr, state) = start(16).await;
        let mut alice = client(addr, "alice").await;
        let mut bob = client(addr, "bob").await;
        until(|| state.online_count() == 2).await;

        alice
            .send(tungstenite::Message::Text(frame("alice", "bob", "offer")))
            .await
            .unwrap();
        assert_eq!(next_kind(&mut bob).await, "offer");

        bob.send(tungstenite::Message::Text(frame("bob", "alice", "answer")))
            .await
            .unwrap();
        assert_eq!(next_kind(&mut alice).await, "answer");
    }

    #[test_timeout::tokio_timeout_test]
    async fn holds_messages_until_the_recipient_connects() {
        let (addr, state) = start(16).await;
        let mut alice = client(addr, "alice").await;
        alice
            .send(tungstenite::Message::Text(frame("alice", "bob", "offer")))
            .await
            .unwrap();
        alice
            .send(tungstenite::Message::Text(frame("alice", "bob", "candidate")))
            .await
            .unwrap();
        until(|| state.held_for("bob") == 2).await;

        let mut bob = client(addr, "bob").await;
        assert_eq!(next_kind(&mut bob).await, "offer");
        assert_eq!(next_kind(&mut bob).await, "candidate");
        assert_eq!(state.held_for("bob"), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn spoofed_frames_are_dropped() {
        let (addr, state) = start(16).await;
        let mut mallory = client(addr, "mallory").await;
        let mut bob = client(addr, "bob").await;
        until(|| state.online_count() == 2).await;

        mallory
            .send(tungstenite::Message::Text(frame("alice", "bob", "end-call")))
            .await
            .unwrap();
        mallory
            .send(tungstenite::Message::Text(frame("mallory", "bob", "call-request")))
            .await
            .unwrap();
        assert_eq!(next_kind(&mut bob).await, "call-request");
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_online_endpoints() {
        let (addr, state) = start(16).await;
        let _alice = client(addr, "alice").await;
        until(|| state.online_count() == 1).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains(r#""status":"ok""#), "{response}");
        assert!(response.contains(r#""online":1"#), "{response}");
    }
}

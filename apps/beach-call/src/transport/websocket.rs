//! Socket-push mailbox backed by the `beach-mailbox` relay.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use url::Url;

use super::{ConnectionState, MailboxTransport, ReconnectPolicy, TransportError};
use crate::protocol::{EndpointId, WireMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Outbound = (WireMessage, oneshot::Sender<Result<(), TransportError>>);

pub struct WebSocketMailbox {
    id: EndpointId,
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<WireMessage>>,
    state: watch::Receiver<ConnectionState>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    fatal: Arc<Mutex<Option<TransportError>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketMailbox {
    /// Open the mailbox for `id` on the relay at `relay_url`.
    ///
    /// The first connection attempt is made eagerly so configuration and
    /// credential errors surface to the caller; later losses are repaired
    /// in the background every `policy.delay`.
    pub async fn connect(
        relay_url: &str,
        id: EndpointId,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>, TransportError> {
        let url = mailbox_url(relay_url, &id)?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(classify_connect_error)?;
        tracing::debug!(target = "mailbox", url = %url, endpoint = %id, "mailbox socket connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let state_tx = Arc::new(state_tx);
        let fatal = Arc::new(Mutex::new(None));

        let supervisor = tokio::spawn(supervise(
            url,
            ws,
            outbound_rx,
            inbound_tx,
            Arc::clone(&state_tx),
            Arc::clone(&fatal),
            policy,
        ));

        Ok(Arc::new(Self {
            id,
            outbound: outbound_tx,
            inbound: AsyncMutex::new(inbound_rx),
            state: state_rx,
            state_tx,
            fatal,
            supervisor: Mutex::new(Some(supervisor)),
        }))
    }
}

#[async_trait]
impl MailboxTransport for WebSocketMailbox {
    fn endpoint_id(&self) -> &EndpointId {
        &self.id
    }

    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        match *self.state.borrow() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(TransportError::Closed),
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                return Err(TransportError::Disconnected);
            }
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send((message, ack_tx))
            .map_err(|_| TransportError::Closed)?;
        ack_rx.await.map_err(|_| TransportError::Disconnected)?
    }

    async fn recv(&self) -> Result<WireMessage, TransportError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(message) => Ok(message),
            None => Err(self.fatal.lock().take().unwrap_or(TransportError::Closed)),
        }
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn close(&self) {
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.state_tx.send_replace(ConnectionState::Closed);
        self.inbound.lock().await.close();
    }
}

impl Drop for WebSocketMailbox {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

enum PumpExit {
    Lost,
    Shutdown,
}

async fn supervise(
    url: Url,
    first: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<WireMessage>,
    state: Arc<watch::Sender<ConnectionState>>,
    fatal: Arc<Mutex<Option<TransportError>>>,
    policy: ReconnectPolicy,
) {
    let mut next = Some(first);
    loop {
        let ws = match next.take() {
            Some(ws) => ws,
            None => {
                state.send_replace(ConnectionState::Connecting);
                match connect_async(url.as_str()).await {
                    Ok((ws, _)) => {
                        tracing::info!(target = "mailbox", url = %url, "mailbox socket reconnected");
                        ws
                    }
                    Err(err) => match classify_connect_error(err) {
                        err @ TransportError::Unauthorized(_) => {
                            tracing::error!(target = "mailbox", error = %err, "mailbox rejected credentials");
                            *fatal.lock() = Some(err);
                            state.send_replace(ConnectionState::Closed);
                            return;
                        }
                        err => {
                            tracing::debug!(
                                target = "mailbox",
                                error = %err,
                                delay_ms = policy.delay.as_millis() as u64,
                                "mailbox reconnect failed"
                            );
                            state.send_replace(ConnectionState::Disconnected);
                            tokio::time::sleep(policy.delay).await;
                            continue;
                        }
                    },
                }
            }
        };

        state.send_replace(ConnectionState::Connected);
        match pump(ws, &mut outbound, &inbound).await {
            PumpExit::Shutdown => {
                state.send_replace(ConnectionState::Closed);
                return;
            }
            PumpExit::Lost => {
                tracing::warn!(target = "mailbox", url = %url, "mailbox socket lost");
                state.send_replace(ConnectionState::Disconnected);
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

async fn pump(
    ws: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    inbound: &mpsc::UnboundedSender<WireMessage>,
) -> PumpExit {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some((message, ack)) = next else {
                    let _ = write.close().await;
                    return PumpExit::Shutdown;
                };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        let _ = ack.send(Err(TransportError::Send(err.to_string())));
                        continue;
                    }
                };
                if let Err(err) = write.send(Message::Text(text)).await {
                    let _ = ack.send(Err(TransportError::Send(err.to_string())));
                    return PumpExit::Lost;
                }
                let _ = ack.send(Ok(()));
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => return PumpExit::Lost,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::debug!(target = "mailbox", error = %err, "mailbox socket error");
                        return PumpExit::Lost;
                    }
                };
                match WireMessage::from_json(&text) {
                    Ok(message) => {
                        tracing::trace!(target = "mailbox", kind = %message.kind, from = %message.from, "mailbox message in");
                        if inbound.send(message).is_err() {
                            return PumpExit::Shutdown;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target = "mailbox", error = %err, "dropping malformed mailbox frame");
                    }
                }
            }
        }
    }
}

fn mailbox_url(relay_url: &str, id: &EndpointId) -> Result<Url, TransportError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| TransportError::Connect(format!("invalid relay url {relay_url}: {err}")))?;
    match url.scheme() {
        "http" => url
            .set_scheme("ws")
            .map_err(|_| TransportError::Connect("invalid websocket scheme".into()))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| TransportError::Connect("invalid websocket scheme".into()))?,
        _ => {}
    }
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TransportError::Connect("relay url cannot carry a path".into()))?;
        segments.pop_if_empty();
        segments.push("mailbox");
        segments.push(id.as_str());
    }
    Ok(url)
}

fn classify_connect_error(err: WsError) -> TransportError {
    match &err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            TransportError::Unauthorized(format!("relay answered {}", response.status()))
        }
        _ => TransportError::Connect(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::Instant;

    use super::*;

    #[test_timeout::timeout]
    fn mailbox_url_appends_endpoint_path() {
        let id = EndpointId::new("alice").unwrap();
        let url = mailbox_url("ws://127.0.0.1:8090", &id).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8090/mailbox/alice");

        let url = mailbox_url("https://relay.example.com/base/", &id).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/base/mailbox/alice");
    }

    #[test_timeout::timeout]
    fn mailbox_url_rejects_garbage() {
        let id = EndpointId::new("alice").unwrap();
        assert!(matches!(
            mailbox_url("not a url", &id),
            Err(TransportError::Connect(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unreachable_relay_fails_initialization() {
        let id = EndpointId::new("alice").unwrap();
        let result = WebSocketMailbox::connect("ws://127.0.0.1:9", id, ReconnectPolicy::default()).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[test_timeout::tokio_timeout_test]
    async fn reconnect_attempts_keep_a_constant_pace() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (attempts_tx, mut attempts) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
            // Every later attempt is cut off before the handshake.
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let _ = attempts_tx.send(Instant::now());
                drop(stream);
            }
        });

        let delay = Duration::from_millis(100);
        let id = EndpointId::new("alice").unwrap();
        let mailbox = WebSocketMailbox::connect(&format!("ws://{addr}"), id, ReconnectPolicy { delay })
            .await
            .unwrap();

        let mut stamps = Vec::new();
        for _ in 0..5 {
            stamps.push(attempts.recv().await.unwrap());
        }
        for pair in stamps.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= delay && gap < delay * 2, "attempt gap {gap:?}");
        }
        assert_ne!(*mailbox.state().borrow(), ConnectionState::Connected);
        mailbox.close().await;
    }
}

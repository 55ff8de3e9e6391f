//! Polled mailbox on top of Redis streams. One stream per recipient; a
//! message is deleted from the stream as soon as it has been handed to the
//! local consumer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;

use super::{ConnectionState, MailboxTransport, ReconnectPolicy, TransportError};
use crate::protocol::{EndpointId, WireMessage};

const STREAM_PREFIX: &str = "beach:mailbox:";
const PAYLOAD_FIELD: &str = "payload";
const POLL_BLOCK: Duration = Duration::from_millis(1_000);
const POLL_BATCH: usize = 32;

fn stream_key(id: &str) -> String {
    format!("{STREAM_PREFIX}{id}")
}

pub struct RedisMailbox {
    id: EndpointId,
    writer: ConnectionManager,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<WireMessage>>,
    state: watch::Receiver<ConnectionState>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RedisMailbox {
    pub async fn connect(
        redis_url: &str,
        id: EndpointId,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>, TransportError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let writer = client
            .get_connection_manager()
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        // XREAD BLOCK parks its connection, so polling gets its own.
        let reader = client
            .get_connection_manager()
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        tracing::debug!(target = "mailbox", endpoint = %id, "redis mailbox connected");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let state_tx = Arc::new(state_tx);
        let poller = tokio::spawn(poll_loop(
            reader,
            stream_key(id.as_str()),
            inbound_tx,
            Arc::clone(&state_tx),
            policy,
        ));

        Ok(Arc::new(Self {
            id,
            writer,
            inbound: AsyncMutex::new(inbound_rx),
            state: state_rx,
            state_tx,
            poller: Mutex::new(Some(poller)),
        }))
    }
}

#[async_trait]
impl MailboxTransport for RedisMailbox {
    fn endpoint_id(&self) -> &EndpointId {
        &self.id
    }

    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        if *self.state.borrow() == ConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        let payload = message
            .to_json()
            .map_err(|err| TransportError::Send(err.to_string()))?;
        let mut conn = self.writer.clone();
        let _: String = conn
            .xadd(stream_key(&message.to), "*", &[(PAYLOAD_FIELD, payload.as_str())])
            .await
            .map_err(|err| TransportError::Send(err.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<WireMessage, TransportError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(TransportError::Closed)
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn close(&self) {
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.state_tx.send_replace(ConnectionState::Closed);
        self.inbound.lock().await.close();
    }
}

impl Drop for RedisMailbox {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}

async fn poll_loop(
    mut conn: ConnectionManager,
    key: String,
    inbound: mpsc::UnboundedSender<WireMessage>,
    state: Arc<watch::Sender<ConnectionState>>,
    policy: ReconnectPolicy,
) {
    let mut last_id = "0".to_string();
    loop {
        match read_batch(&mut conn, &key, &last_id).await {
            Ok(batch) => {
                state.send_if_modified(|current| {
                    let changed = *current != ConnectionState::Connected;
                    *current = ConnectionState::Connected;
                    changed
                });
                for (id, message) in batch {
                    last_id = id.clone();
                    if let Some(message) = message {
                        if inbound.send(message).is_err() {
                            return;
                        }
                    }
                    let deleted: RedisResult<i64> = conn.xdel(&key, &[id.as_str()]).await;
                    if let Err(err) = deleted {
                        tracing::debug!(target = "mailbox", error = %err, entry = %id, "failed to delete consumed entry");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "mailbox",
                    error = %err,
                    delay_ms = policy.delay.as_millis() as u64,
                    "redis mailbox poll failed"
                );
                state.send_replace(ConnectionState::Disconnected);
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

/// Entries newer than `after`. Entries whose payload does not parse come
/// back as `None` so they are still deleted.
async fn read_batch(
    conn: &mut ConnectionManager,
    key: &str,
    after: &str,
) -> RedisResult<Vec<(String, Option<WireMessage>)>> {
    let opts = StreamReadOptions::default()
        .count(POLL_BATCH)
        .block(POLL_BLOCK.as_millis() as usize);
    let reply: Option<StreamReadReply> = conn.xread_options(&[key], &[after], &opts).await?;
    let mut out = Vec::new();
    for stream in reply.map(|reply| reply.keys).unwrap_or_default() {
        for entry in stream.ids {
            let message = entry
                .map
                .get(PAYLOAD_FIELD)
                .and_then(|value| redis::from_redis_value::<String>(value).ok())
                .and_then(|payload| WireMessage::from_json(&payload).ok());
            if message.is_none() {
                tracing::debug!(target = "mailbox", entry = %entry.id, "dropping malformed redis entry");
            }
            out.push((entry.id, message));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn stream_keys_are_namespaced_per_recipient() {
        assert_eq!(stream_key("bob"), "beach:mailbox:bob");
    }

    #[test_timeout::tokio_timeout_test]
    async fn unreachable_redis_fails_initialization() {
        let id = EndpointId::new("alice").unwrap();
        let result = RedisMailbox::connect("redis://127.0.0.1:1/", id, ReconnectPolicy::default()).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}

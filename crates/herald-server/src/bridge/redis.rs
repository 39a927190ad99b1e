//! Redis pub/sub bridge.

use async_trait::async_trait;
use futures::StreamExt;
use herald_core::{BridgeError, ConnectionId, Envelope, Target};
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, PubSub};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{BridgeCallback, BridgePayload, ScaleOutBridge, resubscribe_delay};

/// Publishes every message on one Redis channel and feeds messages from other
/// processes back to the local hub.
pub struct RedisBridge {
    client: redis::Client,
    publisher: ConnectionManager,
    channel: String,
    origin: String,
}

impl RedisBridge {
    /// Connect to Redis. The process gets a fresh origin id so it can ignore
    /// its own publications.
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, BridgeError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(backend)?;
        let origin = ConnectionId::new().into_inner();
        let channel = channel.into();
        info!(%channel, %origin, "redis bridge connected");
        Ok(Self {
            client,
            publisher,
            channel,
            origin,
        })
    }
}

#[async_trait]
impl ScaleOutBridge for RedisBridge {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, target: &Target, envelope: &Envelope) -> Result<(), BridgeError> {
        let payload = BridgePayload {
            origin: self.origin.clone(),
            target: target.clone(),
            envelope: envelope.clone(),
        }
        .encode()?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(backend)?;
        debug!(%target, receivers, "published to bridge");
        Ok(())
    }

    /// The first subscription must succeed. After that, a dropped
    /// subscription is reopened with backoff until `cancel` fires.
    async fn subscribe(
        &self,
        callback: BridgeCallback,
        cancel: CancellationToken,
    ) -> Result<Option<JoinHandle<()>>, BridgeError> {
        let first = open_pubsub(&self.client, &self.channel).await?;
        info!(channel = %self.channel, "redis bridge subscribed");

        let handle = tokio::spawn(listen(
            self.client.clone(),
            self.channel.clone(),
            self.origin.clone(),
            first,
            callback,
            cancel,
        ));
        Ok(Some(handle))
    }
}

#[instrument(skip_all, name = "redis_subscriber", fields(%channel))]
async fn listen(
    client: redis::Client,
    channel: String,
    origin: String,
    first: PubSub,
    callback: BridgeCallback,
    cancel: CancellationToken,
) {
    let mut active = Some(first);
    let mut attempt: u32 = 0;
    loop {
        if let Some(pubsub) = active.take() {
            attempt = 0;
            if forward(pubsub, &origin, &callback, &cancel).await {
                break;
            }
            warn!("redis subscription ended, resubscribing");
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(resubscribe_delay(attempt)) => {}
        }
        match open_pubsub(&client, &channel).await {
            Ok(pubsub) => {
                info!("redis bridge resubscribed");
                active = Some(pubsub);
            }
            Err(e) => {
                warn!(error = %e, attempt, "redis resubscribe failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
    debug!("redis subscriber stopped");
}

/// Feed foreign messages to `callback` until the stream ends or `cancel`
/// fires. Returns `true` when cancelled.
async fn forward(
    pubsub: PubSub,
    origin: &str,
    callback: &BridgeCallback,
    cancel: &CancellationToken,
) -> bool {
    let mut stream = pubsub.into_on_message();
    loop {
        let msg = tokio::select! {
            biased;
            () = cancel.cancelled() => return true,
            next = stream.next() => match next {
                Some(msg) => msg,
                None => return false,
            },
        };
        let raw: String = match msg.get_payload() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "unreadable bridge payload");
                continue;
            }
        };
        match BridgePayload::decode_foreign(&raw, origin) {
            Ok(Some(payload)) => callback(payload.target, payload.envelope),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "malformed bridge payload"),
        }
    }
}

async fn open_pubsub(client: &redis::Client, channel: &str) -> Result<PubSub, BridgeError> {
    let mut pubsub = client.get_async_pubsub().await.map_err(backend)?;
    pubsub.subscribe(channel).await.map_err(backend)?;
    Ok(pubsub)
}

fn backend(e: redis::RedisError) -> BridgeError {
    BridgeError::Backend(e.to_string())
}

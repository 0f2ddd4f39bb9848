//! Redis Pub/Sub 总线
//!
//! 发布走多路复用连接并经熔断器保护；每个订阅持有独立的
//! PubSub 连接，断线后指数退避重连。订阅句柄丢弃即退订。

use std::sync::Arc;

use application::bus::{Bus, BusEnvelope, BusError, Subscription};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::redis::COMMAND_TIMEOUT;
use crate::retry::Backoff;

const SUBSCRIPTION_BUFFER: usize = 256;
const RECONNECT_ATTEMPTS: u32 = 5;

pub struct RedisBus {
    client: redis::Client,
    publish_conn: MultiplexedConnection,
    breaker: Arc<CircuitBreaker>,
}

impl RedisBus {
    pub async fn connect(
        client: redis::Client,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, redis::RedisError> {
        let publish_conn = client.get_multiplexed_async_connection().await?;
        info!("Redis 总线已连接");
        Ok(Self {
            client,
            publish_conn,
            breaker,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, envelope: BusEnvelope) -> Result<(), BusError> {
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| BusError::Publish(format!("serialize: {e}")))?;

        let result = self
            .breaker
            .call(|| {
                let mut conn = self.publish_conn.clone();
                let channel = channel.to_owned();
                let payload = payload.clone();
                async move {
                    let publish = async {
                        let subscribers: i64 = redis::cmd("PUBLISH")
                            .arg(&channel)
                            .arg(&payload)
                            .query_async(&mut conn)
                            .await?;
                        Ok::<i64, redis::RedisError>(subscribers)
                    };
                    match tokio::time::timeout(COMMAND_TIMEOUT, publish).await {
                        Ok(outcome) => outcome.map_err(|e| BusError::Publish(e.to_string())),
                        Err(_) => Err(BusError::Publish("publish timed out".to_owned())),
                    }
                }
            })
            .await;

        match result {
            Ok(subscribers) => {
                debug!(channel, subscribers, "published to redis channel");
                Ok(())
            }
            Err(CircuitError::Open) => Err(BusError::Unavailable("circuit open".to_owned())),
            Err(CircuitError::Inner(err)) => Err(err),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let client = self.client.clone();
        let channel = channel.to_owned();

        tokio::spawn(async move {
            let backoff = Backoff::exponential(std::time::Duration::from_millis(500));
            let mut pubsub = Some(pubsub);
            let mut attempt = 0u32;

            loop {
                let mut active = match pubsub.take() {
                    Some(active) => active,
                    None => {
                        attempt += 1;
                        if attempt > RECONNECT_ATTEMPTS {
                            warn!(channel = %channel, "redis subscription abandoned after reconnect attempts");
                            break;
                        }
                        sleep(backoff.delay_at(attempt)).await;
                        match client.get_async_pubsub().await {
                            Ok(mut fresh) => match fresh.subscribe(&channel).await {
                                Ok(()) => {
                                    info!(channel = %channel, "redis subscription re-established");
                                    fresh
                                }
                                Err(err) => {
                                    warn!(channel = %channel, error = %err, "resubscribe failed");
                                    continue;
                                }
                            },
                            Err(err) => {
                                warn!(channel = %channel, error = %err, "redis reconnect failed");
                                continue;
                            }
                        }
                    }
                };
                attempt = 0;

                let mut stream = active.on_message();
                while let Some(message) = stream.next().await {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(channel = %channel, error = %err, "unreadable bus payload");
                            continue;
                        }
                    };
                    match serde_json::from_str::<BusEnvelope>(&payload) {
                        Ok(envelope) => {
                            if tx.send(envelope).await.is_err() {
                                // 订阅句柄已丢弃
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(channel = %channel, error = %err, "undecodable bus envelope");
                        }
                    }
                }

                if tx.is_closed() {
                    return;
                }
                warn!(channel = %channel, "redis subscription dropped, reconnecting");
            }
        });

        Ok(Subscription::new(rx))
    }
}

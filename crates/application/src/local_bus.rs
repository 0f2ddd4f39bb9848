// 进程内总线实现：单实例部署与总线降级时使用
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::bus::{Bus, BusEnvelope, BusError, Subscription};

const FANOUT_CAPACITY: usize = 1024;
const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<(String, BusEnvelope)>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FANOUT_CAPACITY);
        Self { sender }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, channel: &str, envelope: BusEnvelope) -> Result<(), BusError> {
        // 没有订阅者不算失败
        let _ = self.sender.send((channel.to_owned(), envelope));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let mut upstream = self.sender.subscribe();
        let channel = channel.to_owned();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok((name, envelope)) if name == channel => {
                        if tx.send(envelope).await.is_err() {
                            // 订阅句柄已丢弃
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, channel = %channel, "local bus lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusEvent;

    #[tokio::test]
    async fn delivers_only_to_matching_channel() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("room:a:messages").await.unwrap();

        bus.publish(
            "room:b:messages",
            BusEnvelope::new(BusEvent::Broadcast {
                content: "other".into(),
            }),
        )
        .await
        .unwrap();
        bus.publish(
            "room:a:messages",
            BusEnvelope::new(BusEvent::Broadcast {
                content: "mine".into(),
            }),
        )
        .await
        .unwrap();

        let envelope = sub.recv().await.unwrap();
        match envelope.event {
            BusEvent::Broadcast { content } => assert_eq!(content, "mine"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = LocalBus::new();
        assert!(bus
            .publish(
                "room:none:messages",
                BusEnvelope::new(BusEvent::Broadcast {
                    content: "void".into()
                })
            )
            .await
            .is_ok());
    }
}

//! Bounded outbound queue for publish, subscribe and unsubscribe operations.
//!
//! Wraps an inner [`MqttPubSub`] so that callers get an immediate [`QueueFull`](crate::error::PublishErrorKind::QueueFull)-flavored
//! error instead of blocking indefinitely when the broker connection cannot keep up, while
//! still delivering operations to the broker in the order they were enqueued.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::control_packet::{PublishProperties, QoS, SubscribeProperties, UnsubscribeProperties};
use crate::error::{
    PublishError, PublishErrorKind, SubscribeError, SubscribeErrorKind, UnsubscribeError,
    UnsubscribeErrorKind,
};
use crate::interface::{CompletionToken, MqttPubSub};

/// Default capacity of the outbound queue: one less than the MQTT packet identifier space.
pub const DEFAULT_CAPACITY: usize = u16::MAX as usize;

enum QueuedOp {
    Publish {
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Bytes,
        properties: Option<PublishProperties>,
        reply: oneshot::Sender<Result<CompletionToken, PublishError>>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        properties: Option<SubscribeProperties>,
        reply: oneshot::Sender<Result<CompletionToken, SubscribeError>>,
    },
    Unsubscribe {
        topic: String,
        properties: Option<UnsubscribeProperties>,
        reply: oneshot::Sender<Result<CompletionToken, UnsubscribeError>>,
    },
}

/// A FIFO-ordered, bounded-capacity wrapper around an [`MqttPubSub`] implementation.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<QueuedOp>,
}

impl OutboundQueue {
    /// Wrap `inner` with a bounded queue of the given `capacity`, draining it to `inner` on a
    /// background task in enqueue order.
    pub fn new<PS>(inner: PS, capacity: usize) -> Self
    where
        PS: MqttPubSub + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::channel(capacity);
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    QueuedOp::Publish {
                        topic,
                        qos,
                        retain,
                        payload,
                        properties,
                        reply,
                    } => {
                        let result = match properties {
                            Some(p) => inner.publish_with_properties(topic, qos, retain, payload, p).await,
                            None => inner.publish(topic, qos, retain, payload).await,
                        };
                        let _ = reply.send(result);
                    }
                    QueuedOp::Subscribe {
                        topic,
                        qos,
                        properties,
                        reply,
                    } => {
                        let result = match properties {
                            Some(p) => inner.subscribe_with_properties(topic, qos, p).await,
                            None => inner.subscribe(topic, qos).await,
                        };
                        let _ = reply.send(result);
                    }
                    QueuedOp::Unsubscribe {
                        topic,
                        properties,
                        reply,
                    } => {
                        let result = match properties {
                            Some(p) => inner.unsubscribe_with_properties(topic, p).await,
                            None => inner.unsubscribe(topic).await,
                        };
                        let _ = reply.send(result);
                    }
                }
            }
        });
        Self { tx }
    }
}

#[async_trait]
impl MqttPubSub for OutboundQueue {
    async fn publish(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
    ) -> Result<CompletionToken, PublishError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .try_send(QueuedOp::Publish {
                topic: topic.into(),
                qos,
                retain,
                payload: payload.into(),
                properties: None,
                reply,
            })
            .map_err(|_| PublishError::new(PublishErrorKind::QueueFull))?;
        reply_rx
            .await
            .map_err(|_| PublishError::new(PublishErrorKind::DetachedClient))?
    }

    async fn publish_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes> + Send,
        properties: PublishProperties,
    ) -> Result<CompletionToken, PublishError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .try_send(QueuedOp::Publish {
                topic: topic.into(),
                qos,
                retain,
                payload: payload.into(),
                properties: Some(properties),
                reply,
            })
            .map_err(|_| PublishError::new(PublishErrorKind::QueueFull))?;
        reply_rx
            .await
            .map_err(|_| PublishError::new(PublishErrorKind::DetachedClient))?
    }

    async fn subscribe(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
    ) -> Result<CompletionToken, SubscribeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .try_send(QueuedOp::Subscribe {
                topic: topic.into(),
                qos,
                properties: None,
                reply,
            })
            .map_err(|_| SubscribeError::new(SubscribeErrorKind::QueueFull))?;
        reply_rx
            .await
            .map_err(|_| SubscribeError::new(SubscribeErrorKind::DetachedClient))?
    }

    async fn subscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        qos: QoS,
        properties: SubscribeProperties,
    ) -> Result<CompletionToken, SubscribeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .try_send(QueuedOp::Subscribe {
                topic: topic.into(),
                qos,
                properties: Some(properties),
                reply,
            })
            .map_err(|_| SubscribeError::new(SubscribeErrorKind::QueueFull))?;
        reply_rx
            .await
            .map_err(|_| SubscribeError::new(SubscribeErrorKind::DetachedClient))?
    }

    async fn unsubscribe(
        &self,
        topic: impl Into<String> + Send,
    ) -> Result<CompletionToken, UnsubscribeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .try_send(QueuedOp::Unsubscribe {
                topic: topic.into(),
                properties: None,
                reply,
            })
            .map_err(|_| UnsubscribeError::new(UnsubscribeErrorKind::QueueFull))?;
        reply_rx
            .await
            .map_err(|_| UnsubscribeError::new(UnsubscribeErrorKind::DetachedClient))?
    }

    async fn unsubscribe_with_properties(
        &self,
        topic: impl Into<String> + Send,
        properties: UnsubscribeProperties,
    ) -> Result<CompletionToken, UnsubscribeError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .try_send(QueuedOp::Unsubscribe {
                topic: topic.into(),
                properties: Some(properties),
                reply,
            })
            .map_err(|_| UnsubscribeError::new(UnsubscribeErrorKind::QueueFull))?;
        reply_rx
            .await
            .map_err(|_| UnsubscribeError::new(UnsubscribeErrorKind::DetachedClient))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::CompletionToken as Token;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct CountingPubSub {
        publishes: Arc<AtomicUsize>,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl MqttPubSub for CountingPubSub {
        async fn publish(
            &self,
            _topic: impl Into<String> + Send,
            _qos: QoS,
            _retain: bool,
            _payload: impl Into<Bytes> + Send,
        ) -> Result<CompletionToken, PublishError> {
            self.gate.notified().await;
            self.publishes.fetch_add(1, Ordering::SeqCst);
            Ok(Token(Box::new(async { Ok(()) })))
        }

        async fn publish_with_properties(
            &self,
            topic: impl Into<String> + Send,
            qos: QoS,
            retain: bool,
            payload: impl Into<Bytes> + Send,
            _properties: PublishProperties,
        ) -> Result<CompletionToken, PublishError> {
            self.publish(topic, qos, retain, payload).await
        }

        async fn subscribe(
            &self,
            _topic: impl Into<String> + Send,
            _qos: QoS,
        ) -> Result<CompletionToken, SubscribeError> {
            Ok(Token(Box::new(async { Ok(()) })))
        }

        async fn subscribe_with_properties(
            &self,
            topic: impl Into<String> + Send,
            qos: QoS,
            _properties: SubscribeProperties,
        ) -> Result<CompletionToken, SubscribeError> {
            self.subscribe(topic, qos).await
        }

        async fn unsubscribe(
            &self,
            _topic: impl Into<String> + Send,
        ) -> Result<CompletionToken, UnsubscribeError> {
            Ok(Token(Box::new(async { Ok(()) })))
        }

        async fn unsubscribe_with_properties(
            &self,
            topic: impl Into<String> + Send,
            _properties: UnsubscribeProperties,
        ) -> Result<CompletionToken, UnsubscribeError> {
            self.unsubscribe(topic).await
        }
    }

    #[tokio::test]
    async fn publish_is_forwarded_to_inner() {
        let publishes = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        let queue = OutboundQueue::new(
            CountingPubSub {
                publishes: Arc::clone(&publishes),
                gate: Arc::clone(&gate),
            },
            8,
        );
        let recv = tokio::spawn({
            let queue = queue.clone();
            async move { queue.publish("topic", QoS::AtLeastOnce, false, "payload").await }
        });
        gate.notify_one();
        recv.await.unwrap().unwrap();
        assert_eq!(publishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_errors_when_queue_is_full() {
        let publishes = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        let queue = OutboundQueue::new(
            CountingPubSub {
                publishes: Arc::clone(&publishes),
                gate: Arc::clone(&gate),
            },
            1,
        );

        // First op: the drain task picks this up immediately and blocks on the gate,
        // freeing the channel slot it occupied.
        let blocked = tokio::spawn({
            let queue = queue.clone();
            async move { queue.publish("a", QoS::AtLeastOnce, false, "1").await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Second op: fills the now-free channel slot, since the drain task is stuck on the
        // first op and isn't receiving.
        let queued = tokio::spawn({
            let queue = queue.clone();
            async move { queue.subscribe("b", QoS::AtLeastOnce).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Third op: the channel is now full, so this fails synchronously.
        let err = queue.subscribe("c", QoS::AtLeastOnce).await.unwrap_err();
        assert_eq!(*err.kind(), SubscribeErrorKind::QueueFull);

        gate.notify_one();
        blocked.await.unwrap().unwrap();
        queued.await.unwrap().unwrap();
    }
}

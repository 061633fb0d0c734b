//! Receivers for incoming publishes dispatched to a single topic filter (or left unfiltered).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;

use crate::control_packet::Publish;
use crate::error::{AckError, AckErrorKind};
use crate::interface::{CompletionToken, PubReceiver};

use super::ack_tracker::AckTracker;

/// Token that can be used to manually acknowledge a single received publish (Quality of Service 1).
///
/// Dropping an unused token auto-acks the publish on behalf of the dropped receiver, so the
/// session is never left waiting on an acknowledgement that will never come.
pub struct AckToken {
    publish: Publish,
    ack_tracker: Arc<AckTracker>,
    acked: bool,
}

impl AckToken {
    pub(super) fn new(publish: Publish, ack_tracker: Arc<AckTracker>) -> Self {
        Self {
            publish,
            ack_tracker,
            acked: false,
        }
    }

    /// Acknowledge the publish this token was issued for.
    ///
    /// # Errors
    /// Returns an [`AckError`] if the publish has already been acknowledged.
    pub async fn ack(mut self) -> Result<CompletionToken, AckError> {
        self.acked = true;
        self.ack_tracker
            .ack(&self.publish)
            .await
            .map_err(|_| AckError::new(AckErrorKind::AlreadyAcked))?;
        Ok(CompletionToken(Box::new(async { Ok(()) })))
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        if self.acked {
            return;
        }
        let publish = self.publish.clone();
        let ack_tracker = Arc::clone(&self.ack_tracker);
        tokio::spawn(async move {
            if let Err(e) = ack_tracker.ack(&publish).await {
                log::error!("failed to ack publish pkid {} on drop: {e}", publish.pkid);
            }
        });
    }
}

/// Receiver for publishes dispatched to a specific topic filter registration (or the unfiltered
/// fallback receiver).
pub struct SessionPubReceiver {
    pub_rx: Receiver<Publish>,
    ack_tracker: Arc<AckTracker>,
    auto_ack: bool,
}

impl SessionPubReceiver {
    pub(super) fn new(
        pub_rx: Receiver<Publish>,
        ack_tracker: Arc<AckTracker>,
        auto_ack: bool,
    ) -> Self {
        Self {
            pub_rx,
            ack_tracker,
            auto_ack,
        }
    }
}

#[async_trait]
impl PubReceiver for SessionPubReceiver {
    async fn recv(&mut self) -> Option<Publish> {
        let publish = self.pub_rx.recv().await?;
        if let Err(e) = self.ack_tracker.ack(&publish).await {
            log::error!("failed to ack publish pkid {}: {e}", publish.pkid);
        }
        Some(publish)
    }

    async fn recv_manual_ack(&mut self) -> Option<(Publish, Option<AckToken>)> {
        let publish = self.pub_rx.recv().await?;
        if self.auto_ack || publish.pkid == 0 {
            if let Err(e) = self.ack_tracker.ack(&publish).await {
                log::error!("failed to auto-ack publish pkid {}: {e}", publish.pkid);
            }
            return Some((publish, None));
        }
        let token = AckToken::new(publish.clone(), Arc::clone(&self.ack_tracker));
        Some((publish, Some(token)))
    }

    fn close(&mut self) {
        self.pub_rx.close();
    }
}

impl Drop for SessionPubReceiver {
    fn drop(&mut self) {
        // Drain any publishes left buffered in the channel, auto-acking them so the ack tracker
        // is not left waiting on acknowledgements that can now never arrive.
        self.pub_rx.close();
        while let Ok(publish) = self.pub_rx.try_recv() {
            let ack_tracker = Arc::clone(&self.ack_tracker);
            tokio::spawn(async move {
                if let Err(e) = ack_tracker.ack(&publish).await {
                    log::error!("failed to ack publish pkid {} on drop: {e}", publish.pkid);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_packet::QoS;
    use tokio::sync::mpsc::channel;

    fn create_publish(topic_name: &str, payload: &str, pkid: u16) -> Publish {
        let mut publish = Publish::new(topic_name, QoS::AtLeastOnce, payload.to_string(), None);
        publish.pkid = pkid;
        publish
    }

    #[tokio::test]
    async fn recv_auto_acks_on_tracker() {
        let ack_tracker = Arc::new(AckTracker::default());
        let (tx, rx) = channel(8);
        let mut receiver = SessionPubReceiver::new(rx, Arc::clone(&ack_tracker), true);

        let publish = create_publish("topic", "payload", 1);
        ack_tracker.register_pending(&publish, 1).unwrap();
        tx.send(publish.clone()).await.unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(received, publish);
        assert_eq!(ack_tracker.try_next_ready().unwrap(), publish);
    }

    #[tokio::test]
    async fn manual_ack_token_acks_on_drop() {
        let ack_tracker = Arc::new(AckTracker::default());
        let (tx, rx) = channel(8);
        let mut receiver = SessionPubReceiver::new(rx, Arc::clone(&ack_tracker), false);

        let publish = create_publish("topic", "payload", 1);
        ack_tracker.register_pending(&publish, 1).unwrap();
        tx.send(publish.clone()).await.unwrap();

        let (received, token) = receiver.recv_manual_ack().await.unwrap();
        assert_eq!(received, publish);
        drop(token);

        // Give the spawned drop-ack task a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(ack_tracker.try_next_ready().unwrap(), publish);
    }
}

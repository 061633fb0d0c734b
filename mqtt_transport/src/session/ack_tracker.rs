//! Inverse demultiplexing of publishes previously distributed to multiple receivers, in original receiving order.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;

use crate::control_packet::Publish;

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("publish already registered for pkid {0}")]
    AlreadyRegistered(u16),
}

#[derive(Error, Debug)]
pub enum AckError {
    #[error("cannot ack a publish more times than required")]
    AckOverflow,
}

#[derive(Error, Debug)]
pub enum TryNextReadyError {
    #[error("no registered pending publishes are ready")]
    NotReady,
    #[error("no registered pending publishes")]
    Empty,
}

/// Represents tracking data for a pending publish.
struct PendingPub {
    /// Publish that is pending, waiting for acks
    pub publish: Publish,
    /// Number of acks remaining before the publish is ready
    pub remaining_acks: usize,
}

/// Tracking structure for determining when a [`Publish`] has been acknowledged
/// locally the required number of times and is ready to ack back to the server.
///
/// Note that this is only designed for Quality of Service 1 at present moment
pub struct AckTracker {
    pending: Mutex<VecDeque<PendingPub>>,
    registration_notify: Notify,
    ready_notify: Notify,
}

impl AckTracker {
    /// Register a [`Publish`] as pending.
    ///
    /// When it is acked the required number of times on this tracker, it will be considered ready
    /// to ack back to the server.
    ///
    /// The [`Publish`] will not be registered if it has a PKID of 0, as this is reserved for
    /// Quality of Service 0 messages, which do not require acknowledgement.
    /// This is not considered an error.
    ///
    /// # Arguments
    /// * `publish` - The [`Publish`] to register as pending
    /// * `acks_required` - The number of acks required before the [`Publish`] is considered ready
    ///
    /// # Errors
    /// * [`RegisterError::AlreadyRegistered`] if a [`Publish`] with the same pkid is already registered.
    ///   This indicates a duplicate [`Publish`], and can be ignored.
    pub fn register_pending(
        &self,
        publish: &Publish,
        acks_required: usize,
    ) -> Result<(), RegisterError> {
        // Ignore PKID 0, as it is reserved for QoS 0 messages
        if publish.pkid == 0 {
            return Ok(());
        }
        let mut pending = self.pending.lock().unwrap();
        if pending
            .iter()
            .any(|pending| pending.publish.pkid == publish.pkid)
        {
            // A publish with the same PKID already tracked means a duplicate was received.
            // Duplicates are only valid once the original has been acked back to the server,
            // which by definition of still being tracked here has not happened yet.
            return Err(RegisterError::AlreadyRegistered(publish.pkid));
        }

        let pending_pub = PendingPub {
            publish: publish.clone(),
            remaining_acks: acks_required,
        };
        pending.push_back(pending_pub);
        self.registration_notify.notify_waiters();
        Ok(())
    }

    /// Acknowledge a pending [`Publish`].
    ///
    /// Decrements the amount of remaining acks required for the [`Publish`] to be considered ready.
    ///
    /// Does nothing if the [`Publish`] has a PKID of 0, as this is reserved for
    /// Quality of Service 0 messages which do not require acknowledgement.
    ///
    /// # Arguments
    /// * `publish` - The [`Publish`] to acknowledge
    pub async fn ack(&self, publish: &Publish) -> Result<(), AckError> {
        if publish.pkid == 0 {
            return Ok(());
        }

        loop {
            {
                let mut pending = self.pending.lock().unwrap();

                if let Some(pos) = pending
                    .iter()
                    .position(|pending| pending.publish.pkid == publish.pkid)
                {
                    let entry = &mut pending[pos];
                    if entry.remaining_acks == 0 {
                        return Err(AckError::AckOverflow);
                    }
                    entry.remaining_acks -= 1;

                    if entry.remaining_acks == 0 && pos == 0 {
                        self.ready_notify.notify_one();
                    }
                    return Ok(());
                }
            }
            // Wait for a registration if the ack occurs before the corresponding pending entry
            // was registered. This can happen because registering a publish requires knowing
            // how many acks to wait for, which is only known after dispatch, and some of the
            // dispatched receivers may have already acked by then.
            self.registration_notify.notified().await;
        }
    }

    /// Get the next [`Publish`] that is ready to ack back to the server.
    ///
    /// A [`Publish`] is considered ready to be acked to the server when:
    /// 1) It has been acked on this tracker the number of times specified when it was registered
    /// 2) It is the oldest registration in the tracker
    ///
    /// This method should not be called in parallel with itself.
    pub async fn next_ready(&self) -> Publish {
        loop {
            match self.try_next_ready() {
                Ok(publish) => return publish,
                Err(_) => self.ready_notify.notified().await,
            }
        }
    }

    /// Get the next [`Publish`] that is ready to ack back to the server.
    ///
    /// If no [`Publish`] is ready returns a [`TryNextReadyError`].
    ///
    /// # Errors
    /// * [`TryNextReadyError::NotReady`] if no tracked publishes are ready
    /// * [`TryNextReadyError::Empty`] if there are no tracked publishes
    pub fn try_next_ready(&self) -> Result<Publish, TryNextReadyError> {
        let mut pending = self.pending.lock().unwrap();
        if let Some(next) = pending.front() {
            if next.remaining_acks == 0 {
                match pending.pop_front() {
                    Some(pending_ack) => return Ok(pending_ack.publish),
                    None => unreachable!("front element was just checked under the same lock"),
                }
            }
            return Err(TryNextReadyError::NotReady);
        }
        Err(TryNextReadyError::Empty)
    }

    /// Check if a [`Publish`] is currently pending in the tracker.
    #[must_use]
    pub fn contains(&self, publish: &Publish) -> bool {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .any(|pending| pending.publish.pkid == publish.pkid)
    }

    /// Clear all pending publishes from the tracker.
    ///
    /// Do not use this except for shutdown/cleanup.
    pub fn reset(&self) {
        self.pending.lock().unwrap().clear();
        // TODO: Notify waiters left blocked on a publish that will now never become ready.
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        AckTracker {
            pending: Mutex::new(VecDeque::new()),
            registration_notify: Notify::new(),
            ready_notify: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::control_packet::QoS;

    use test_case::test_case;

    fn create_publish(topic_name: &str, payload: &str, pkid: u16) -> Publish {
        let mut publish = Publish::new(topic_name, QoS::AtLeastOnce, payload.to_string(), None);
        publish.pkid = pkid;
        publish
    }

    /// Registering and acking publishes requiring a single ack, acked in registration order.
    #[test_case(1, 2, 3; "Sequential PKIDs")]
    #[test_case(9, 10, 1; "Wrap-around PKIDs")]
    #[tokio::test]
    async fn register_and_single_ack_ordered(pub1_pkid: u16, pub2_pkid: u16, pub3_pkid: u16) {
        let tracker = AckTracker::default();
        assert!(matches!(
            tracker.try_next_ready().err(),
            Some(TryNextReadyError::Empty)
        ));

        let publish1 = create_publish("test", "pub1", pub1_pkid);
        tracker.register_pending(&publish1, 1).unwrap();
        let publish2 = create_publish("test", "pub2", pub2_pkid);
        tracker.register_pending(&publish2, 1).unwrap();
        let publish3 = create_publish("test", "pub3", pub3_pkid);
        tracker.register_pending(&publish3, 1).unwrap();

        assert!(matches!(
            tracker.try_next_ready().err(),
            Some(TryNextReadyError::NotReady)
        ));

        tracker.ack(&publish1).await.unwrap();
        assert_eq!(tracker.try_next_ready().unwrap(), publish1);
        assert!(!tracker.contains(&publish1));

        tracker.ack(&publish2).await.unwrap();
        tracker.ack(&publish3).await.unwrap();
        assert_eq!(tracker.try_next_ready().unwrap(), publish2);
        assert_eq!(tracker.try_next_ready().unwrap(), publish3);
        assert!(matches!(
            tracker.try_next_ready().err(),
            Some(TryNextReadyError::Empty)
        ));
    }

    /// Acking out of registration order holds everything back until the front is complete.
    #[tokio::test]
    async fn register_and_single_ack_unordered() {
        let tracker = AckTracker::default();
        let publish1 = create_publish("test", "pub1", 1);
        let publish2 = create_publish("test", "pub2", 2);
        let publish3 = create_publish("test", "pub3", 3);
        tracker.register_pending(&publish1, 1).unwrap();
        tracker.register_pending(&publish2, 1).unwrap();
        tracker.register_pending(&publish3, 1).unwrap();

        tracker.ack(&publish3).await.unwrap();
        tracker.ack(&publish2).await.unwrap();
        assert!(matches!(
            tracker.try_next_ready().err(),
            Some(TryNextReadyError::NotReady)
        ));

        tracker.ack(&publish1).await.unwrap();
        assert_eq!(tracker.try_next_ready().unwrap(), publish1);
        assert_eq!(tracker.try_next_ready().unwrap(), publish2);
        assert_eq!(tracker.try_next_ready().unwrap(), publish3);
    }

    /// Publishes dispatched to multiple receivers require multiple acks before becoming ready.
    #[tokio::test]
    async fn register_and_multi_ack() {
        let tracker = AckTracker::default();
        let publish1 = create_publish("test", "pub1", 1);
        tracker.register_pending(&publish1, 2).unwrap();

        tracker.ack(&publish1).await.unwrap();
        assert!(matches!(
            tracker.try_next_ready().err(),
            Some(TryNextReadyError::NotReady)
        ));

        tracker.ack(&publish1).await.unwrap();
        assert_eq!(tracker.try_next_ready().unwrap(), publish1);
    }

    /// Waiting for the next ready publish blocks until it is fully acked.
    #[tokio::test]
    async fn next_ready() {
        let tracker = Arc::new(AckTracker::default());
        let publish1 = create_publish("test", "pub1", 1);
        tracker.register_pending(&publish1, 1).unwrap();

        let tracker_clone = Arc::clone(&tracker);
        let publish1_clone = publish1.clone();
        let jh = tokio::task::spawn(async move {
            let next_pub = tracker_clone.next_ready().await;
            assert_eq!(next_pub.pkid, publish1_clone.pkid);
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(!jh.is_finished());

        tracker.ack(&publish1).await.unwrap();
        jh.await.unwrap();
    }

    /// Acks that arrive before the corresponding registration are still counted once registered.
    /// This matters because registration can only happen after dispatch is complete, but some
    /// dispatched receivers may ack before that count is known.
    #[tokio::test]
    async fn early_ack() {
        let tracker = Arc::new(AckTracker::default());
        let publish1 = create_publish("test", "pub1", 1);

        let ack_jh = tokio::task::spawn({
            let tracker = tracker.clone();
            let publish1 = publish1.clone();
            async move {
                tracker.ack(&publish1).await.unwrap();
            }
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(!ack_jh.is_finished());

        tracker.register_pending(&publish1, 1).unwrap();
        ack_jh.await.unwrap();
        assert_eq!(tracker.try_next_ready().unwrap(), publish1);
    }

    #[tokio::test]
    async fn ack_overflow() {
        let tracker = AckTracker::default();
        let publish = create_publish("test", "pub", 1);
        tracker.register_pending(&publish, 1).unwrap();

        assert!(tracker.ack(&publish).await.is_ok());
        assert!(matches!(
            tracker.ack(&publish).await,
            Err(AckError::AckOverflow)
        ));
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let tracker = AckTracker::default();
        let publish = create_publish("test", "pub", 1);
        tracker.register_pending(&publish, 1).unwrap();
        assert!(matches!(
            tracker.register_pending(&publish, 1),
            Err(RegisterError::AlreadyRegistered(1))
        ));
    }

    #[tokio::test]
    async fn pkid_0_ignored() {
        let tracker = AckTracker::default();
        let publish = create_publish("test", "pub1", 0);

        assert!(tracker.register_pending(&publish, 1).is_ok());
        assert!(!tracker.contains(&publish));
        assert!(tracker.ack(&publish).await.is_ok());
        assert!(matches!(
            tracker.try_next_ready().err(),
            Some(TryNextReadyError::Empty)
        ));
    }
}

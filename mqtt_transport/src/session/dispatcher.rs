//! Fan-out of incoming publishes to per-filter receivers, in dispatch order.
use std::{collections::HashMap, string::FromUtf8Error};

use thiserror::Error;
use tokio::sync::mpsc::{channel, error::SendError, Receiver, Sender};

use crate::control_packet::Publish;
use crate::topic::{TopicFilter, TopicName, TopicParseError};

// NOTE: These errors should almost never happen.
// - Closed receivers can only occur due to race condition since receivers are checked before dispatch.
// - Invalid publishes should not happen at all, since we shouldn't be receiving Publishes from the broker
//   that are invalid.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("receiver closed")]
    ClosedReceiver(#[from] SendError<Publish>),
    #[error("could not get topic from publish: {0}")]
    InvalidPublish(#[from] InvalidPublish),
}

// NOTE: if/when Publish is reimplemented, this logic should probably move there.
#[derive(Error, Debug)]
pub enum InvalidPublish {
    #[error("invalid UTF-8")]
    TopicNameUtf8(#[from] FromUtf8Error),
    #[error("invalid topic: {0}")]
    TopicNameFormat(#[from] TopicParseError),
}

pub struct IncomingPublishDispatcher {
    channel_capacity: usize,
    filtered_txs: HashMap<TopicFilter, Vec<Sender<Publish>>>,
    unfiltered_tx: Sender<Publish>,
}

impl IncomingPublishDispatcher {
    pub fn new(capacity: usize) -> (Self, Receiver<Publish>) {
        let (tx, rx) = channel(capacity);
        (
            IncomingPublishDispatcher {
                channel_capacity: capacity,
                filtered_txs: HashMap::new(),
                unfiltered_tx: tx,
            },
            rx,
        )
        // NOTE: There's a case where the unfiltered receiver drops and the dispatcher is still alive.
        // This will cause the dispatch to fail. This is fine, but there's probably a more elegant way to handle this.
        // TODO: Reconsider this after ordered ack implementation.
    }

    /// Register a topic filter for dispatching.
    ///
    /// Returns a receiver that will receive incoming publishes published to the topic filter.
    /// Multiple receivers can be registered for the same topic filter.
    /// If a receiver is closed or dropped, it will be removed from the list of receivers.
    /// If all receivers for a topic filter are closed, the topic filter will be unregistered.
    ///
    /// # Arguments
    /// * `topic_filter` - The [`TopicFilter`] to listen for incoming publishes on.
    pub fn register_filter(&mut self, topic_filter: &TopicFilter) -> Receiver<Publish> {
        self.prune();

        let (tx, rx) = channel(self.channel_capacity);
        // If the topic filter is already in use, add to the associated vector
        if let Some(v) = self.filtered_txs.get_mut(topic_filter) {
            v.push(tx);
        // Otherwise, create a new vector and add
        } else {
            self.filtered_txs.insert(topic_filter.clone(), vec![tx]);
        }
        rx
    }

    /// Dispatch a [`Publish`] to all registered filters that match its topic name.
    ///
    /// The [`Publish`] will be sent to the corresponding receiver(s) for the filters.
    /// If no filters are registered for the topic, the unfiltered receiver will receive the [`Publish`].
    /// Returns the number of receivers that the [`Publish`] was dispatched to.
    ///
    /// # Arguments
    /// * `publish` - The [`Publish`] to dispatch.
    ///
    /// # Errors
    /// Returns a [`DispatchError`] if dispatching fails.
    pub async fn dispatch_publish(&mut self, publish: Publish) -> Result<usize, DispatchError> {
        let mut num_dispatches = 0;
        let mut closed = vec![]; // (Topic filter, position in vector)

        let topic_name = extract_publish_topic_name(&publish)?;

        // First, dispatch to all receivers filters that match the topic name
        let filtered = self
            .filtered_txs
            .iter()
            .filter(|(topic_filter, _)| topic_filter.matches_topic_name(&topic_name));
        for (topic_filter, v) in filtered {
            for (pos, tx) in v.iter().enumerate() {
                // If the receiver is closed, add it to the list of closed receivers to remove after iteration.
                // NOTE: This must be done dynamically because the awaitable send allows for a channel to be closed
                // sometime during the execution of this loop. You cannot simply use .prune() before the loop.
                if tx.is_closed() {
                    closed.push((topic_filter.clone(), pos));
                    continue;
                }
                // Otherwise, send the publish to the receiver
                tx.send(publish.clone()).await?;
                num_dispatches += 1;
            }
        }
        // Then, if no filters matched, dispatch to the unfiltered receiver
        if num_dispatches == 0 {
            self.unfiltered_tx.send(publish).await?;
            num_dispatches += 1;
        }

        // Remove any closed receivers.
        // NOTE: Do this in reverse order to avoid index issues.
        for (topic_filter, pos) in closed.iter().rev() {
            if let Some(v) = self.filtered_txs.get_mut(topic_filter) {
                v.remove(*pos);
                if v.is_empty() {
                    self.filtered_txs.remove(topic_filter);
                }
            }
        }

        // TODO: What should happen in the error cases above?
        // Because a message can be dispatched to multiple receivers, execution should probably not stop just
        // because one send failed. But, this would mean we need to change the error reporting paradigm.
        // Revisit this in the future and find a better way to handle this edge case.

        Ok(num_dispatches)
    }

    /// Collect the receivers a publish should be dispatched to, without performing the sends.
    ///
    /// Exists so that a caller holding this dispatcher behind a lock can release the lock before
    /// awaiting the sends, rather than holding it across every `Sender::send().await`.
    ///
    /// # Errors
    /// Returns an [`InvalidPublish`] if the publish's topic name cannot be parsed.
    pub fn dispatch_targets(
        &mut self,
        publish: &Publish,
    ) -> Result<Vec<Sender<Publish>>, InvalidPublish> {
        self.prune();
        let topic_name = extract_publish_topic_name(publish)?;
        let mut targets: Vec<Sender<Publish>> = self
            .filtered_txs
            .iter()
            .filter(|(topic_filter, _)| topic_filter.matches_topic_name(&topic_name))
            .flat_map(|(_, v)| v.iter().filter(|tx| !tx.is_closed()).cloned())
            .collect();
        if targets.is_empty() {
            targets.push(self.unfiltered_tx.clone());
        }
        Ok(targets)
    }

    /// Remove any closed filter receivers.
    ///
    /// Call this before any register
    /// Note that the runtime is O(c * m) and not O(n * m) as it may seem.
    /// (c = capacity, m = max number of duplicate listeners on a filter, n = number of filters).
    fn prune(&mut self) {
        self.filtered_txs.retain(|_, v| {
            v.retain(|tx| !tx.is_closed());
            !v.is_empty()
        });
    }
}

fn extract_publish_topic_name(publish: &Publish) -> Result<TopicName, InvalidPublish> {
    Ok(TopicName::from_string(String::from_utf8(
        publish.topic.to_vec(),
    )?)?)
}

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{JobCategory, JobEvent, OwnerId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Per-subscriber queue depth. A subscriber that falls this far behind is
    /// disconnected and expected to reconnect and re-read the ledger.
    pub subscriber_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
        }
    }
}

struct Subscriber {
    id: Uuid,
    category: Option<JobCategory>,
    sender: mpsc::Sender<JobEvent>,
}

impl Subscriber {
    fn wants(&self, event: &JobEvent) -> bool {
        match (self.category, event.category()) {
            (None, _) | (_, None) => true,
            (Some(wanted), Some(actual)) => wanted == actual,
        }
    }
}

/// Per-owner topic registry. Publishing never blocks the writer: each
/// subscriber has a bounded queue and is dropped once it overflows.
#[derive(Clone)]
pub struct FanoutHub {
    topics: Arc<DashMap<OwnerId, Vec<Subscriber>>>,
    capacity: usize,
}

impl fmt::Debug for FanoutHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutHub")
            .field("topic_count", &self.topics.len())
            .field("subscriber_count", &self.total_subscribers())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl FanoutHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: config.subscriber_capacity.max(1),
        }
    }

    /// Registers a live feed for `owner`, optionally narrowed to one category.
    pub fn subscribe(
        &self,
        owner: OwnerId,
        category: Option<JobCategory>,
    ) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        self.topics.entry(owner.clone()).or_default().push(Subscriber {
            id,
            category,
            sender,
        });
        debug!(owner = %owner, subscriber = %id, ?category, "subscriber attached");
        Subscription {
            id,
            owner,
            receiver,
            hub: self.clone(),
        }
    }

    /// Delivers `event` to every matching subscriber of `owner` and returns
    /// how many received it. Other owners' topics are never touched.
    pub fn publish(&self, owner: &OwnerId, event: &JobEvent) -> usize {
        let mut delivered = 0;
        let now_empty = {
            let Some(mut subscribers) = self.topics.get_mut(owner) else {
                return 0;
            };
            subscribers.retain(|subscriber| {
                if !subscriber.wants(event) {
                    return !subscriber.sender.is_closed();
                }
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            owner = %owner,
                            subscriber = %subscriber.id,
                            "dropping subscriber that fell behind"
                        );
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            });
            subscribers.is_empty()
        };
        if now_empty {
            self.topics.remove_if(owner, |_, subscribers| subscribers.is_empty());
        }
        delivered
    }

    pub fn unsubscribe(&self, owner: &OwnerId, id: Uuid) {
        let now_empty = match self.topics.get_mut(owner) {
            Some(mut subscribers) => {
                subscribers.retain(|subscriber| subscriber.id != id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.topics.remove_if(owner, |_, subscribers| subscribers.is_empty());
        }
        debug!(owner = %owner, subscriber = %id, "subscriber detached");
    }

    pub fn subscriber_count(&self, owner: &OwnerId) -> usize {
        self.topics.get(owner).map(|s| s.len()).unwrap_or_default()
    }

    pub fn total_subscribers(&self) -> usize {
        self.topics.iter().map(|entry| entry.value().len()).sum()
    }
}

/// A live feed. Dropping it detaches from the hub.
pub struct Subscription {
    id: Uuid,
    owner: OwnerId,
    receiver: mpsc::Receiver<JobEvent>,
    hub: FanoutHub,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.receiver.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.owner, self.id);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{GenerationJob, JobId};

    fn owner(raw: &str) -> OwnerId {
        OwnerId::parse(raw).unwrap()
    }

    fn update(owner_id: &OwnerId, category: JobCategory) -> JobEvent {
        JobEvent::update(GenerationJob::pending(
            JobId::parse("j1").unwrap(),
            owner_id.clone(),
            category,
            Utc::now(),
        ))
    }

    #[tokio::test]
    async fn events_never_cross_owners() {
        let hub = FanoutHub::default();
        let alice = owner("alice");
        let bob = owner("bob");
        let mut alice_feed = hub.subscribe(alice.clone(), None);
        let mut bob_feed = hub.subscribe(bob.clone(), None);

        assert_eq!(hub.publish(&alice, &update(&alice, JobCategory::Upscale)), 1);

        assert!(alice_feed.recv().await.is_some());
        assert!(bob_feed.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn category_filter_lets_uncategorised_events_through() {
        let hub = FanoutHub::default();
        let alice = owner("alice");
        let mut video = hub.subscribe(alice.clone(), Some(JobCategory::TextToVideo));

        assert_eq!(hub.publish(&alice, &update(&alice, JobCategory::Upscale)), 0);
        let cleared = JobEvent::JobsCleared {
            count: 2,
            category: None,
        };
        assert_eq!(hub.publish(&alice, &cleared), 1);
        assert_eq!(video.recv().await, Some(cleared));
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking() {
        let hub = FanoutHub::new(HubConfig {
            subscriber_capacity: 2,
        });
        let alice = owner("alice");
        let mut slow = hub.subscribe(alice.clone(), None);
        let mut fast = hub.subscribe(alice.clone(), None);

        for _ in 0..2 {
            hub.publish(&alice, &update(&alice, JobCategory::Upscale));
            fast.recv().await.unwrap();
        }
        hub.publish(&alice, &update(&alice, JobCategory::Upscale));
        assert_eq!(hub.subscriber_count(&alice), 1);

        // Buffered events drain, then the feed ends.
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());
        assert!(fast.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropping_subscription_detaches_it() {
        let hub = FanoutHub::default();
        let alice = owner("alice");
        let feed = hub.subscribe(alice.clone(), None);
        assert_eq!(hub.subscriber_count(&alice), 1);
        drop(feed);
        assert_eq!(hub.subscriber_count(&alice), 0);
        assert_eq!(hub.total_subscribers(), 0);
    }
}

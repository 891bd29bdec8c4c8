use futures_util::{StreamExt, stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::error::SubscriptionError;
use crate::model::{ChangeEvent, OwnerId};
use crate::store::{ChangeFeed, FeedFilter, FeedStream};

pub const DEFAULT_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct FeedEnvelope {
    pub owner_id: OwnerId,
    pub event: ChangeEvent,
}

/// In-process change feed. The database publishes every committed row change
/// here and subscribers receive the ones matching their filter.
#[derive(Debug, Clone)]
pub struct FeedHub {
    tx: broadcast::Sender<FeedEnvelope>,
    closed: CancellationToken,
}

impl FeedHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }

    pub fn publish(&self, owner_id: OwnerId, event: ChangeEvent) {
        tracing::debug!(owner = %owner_id, id = %event.id(), kind = event.kind(), "publishing change");
        // No subscribers is not an error; the event is simply dropped.
        let _ = self.tx.send(FeedEnvelope { owner_id, event });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Ends every open subscription and refuses new ones.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ChangeFeed for FeedHub {
    fn subscribe(&self, filter: FeedFilter) -> Result<FeedStream, SubscriptionError> {
        if self.is_closed() {
            return Err(SubscriptionError::Closed("change feed".to_string()));
        }

        let rx = self.tx.subscribe();
        let events = stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) if envelope.owner_id == filter.owner_id => return Some((envelope.event, rx)),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(owner = %filter.owner_id, skipped, "change feed subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(events.take_until(self.closed.clone().cancelled_owned()).boxed())
    }
}

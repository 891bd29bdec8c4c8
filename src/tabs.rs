//! Cross-tab channel: same-process, in-memory pub/sub between independent
//! sync sessions. Nothing is persisted; only handles that are open when a
//! message is posted receive it, and a tab never receives its own posts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::error::SubscriptionError;
use crate::model::{Bookmark, BookmarkId};

const TAB_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabMessage {
    Added { bookmark: Bookmark },
    Removed { id: BookmarkId },
}

#[derive(Debug, Clone)]
struct TabEnvelope {
    from: Uuid,
    message: TabMessage,
}

#[derive(Debug, Default)]
struct Channels {
    closed: bool,
    by_name: HashMap<String, broadcast::Sender<TabEnvelope>>,
}

#[derive(Debug, Clone, Default)]
pub struct TabHub {
    channels: Arc<Mutex<Channels>>,
}

impl TabHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a handle on the named channel, creating it on first use.
    pub fn open(&self, name: &str) -> Result<TabChannel, SubscriptionError> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels.closed {
            return Err(SubscriptionError::Closed(format!("tab channel {name}")));
        }

        let tx = channels
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(TAB_CHANNEL_CAPACITY).0)
            .clone();

        Ok(TabChannel {
            name: name.to_string(),
            tab_id: Uuid::new_v4(),
            tx,
        })
    }

    pub fn close(&self) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.closed = true;
        channels.by_name.clear();
    }
}

#[derive(Debug, Clone)]
pub struct TabChannel {
    name: String,
    tab_id: Uuid,
    tx: broadcast::Sender<TabEnvelope>,
}

impl TabChannel {
    pub fn post(&self, message: TabMessage) {
        let envelope = TabEnvelope {
            from: self.tab_id,
            message,
        };
        if self.tx.send(envelope).is_err() {
            tracing::debug!(channel = %self.name, "no open tabs to receive message");
        }
    }

    pub fn subscribe(&self) -> TabReceiver {
        TabReceiver {
            tab_id: self.tab_id,
            rx: self.tx.subscribe(),
        }
    }
}

pub struct TabReceiver {
    tab_id: Uuid,
    rx: broadcast::Receiver<TabEnvelope>,
}

impl TabReceiver {
    /// Next message from a sibling tab, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<TabMessage> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.from == self.tab_id => continue,
                Ok(envelope) => return Some(envelope.message),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "tab receiver lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

//! Collaborator interfaces the sync layer depends on.
//!
//! The record store and change feed are kept behind these traits so that a
//! [`crate::sync::SyncSession`] can run against the libsql-backed
//! [`crate::db::Database`], an in-process [`crate::feed::FeedHub`], or test
//! doubles, without knowing the transport.

use std::future::Future;

use futures_util::stream::BoxStream;

use crate::error::{PersistenceError, SubscriptionError};
use crate::model::{Bookmark, BookmarkId, ChangeEvent, OwnerId};

pub trait BookmarkStore {
    /// All records owned by `owner`, newest first.
    fn list(&self, owner: OwnerId) -> impl Future<Output = Result<Vec<Bookmark>, PersistenceError>> + Send;

    /// Persists a new record. The store emits the matching insert event on
    /// its change feed.
    fn insert(&self, record: &Bookmark) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Removes a record if `owner` owns it, returning whether a row went away.
    fn delete(
        &self,
        id: BookmarkId,
        owner: OwnerId,
    ) -> impl Future<Output = Result<bool, PersistenceError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedFilter {
    pub owner_id: OwnerId,
}

impl FeedFilter {
    pub fn owner(owner_id: OwnerId) -> Self {
        Self { owner_id }
    }
}

/// Push-based events for one subscriber. Ends when the feed shuts down.
pub type FeedStream = BoxStream<'static, ChangeEvent>;

pub trait ChangeFeed {
    fn subscribe(&self, filter: FeedFilter) -> Result<FeedStream, SubscriptionError>;
}

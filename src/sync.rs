use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{PersistOp, PersistenceError, SyncError, ValidationError};
use crate::model::{Bookmark, BookmarkId, ChangeEvent, OwnerId};
use crate::store::{BookmarkStore, ChangeFeed, FeedFilter, FeedStream};
use crate::tabs::{TabChannel, TabMessage, TabReceiver};
use crate::unpack_error;
use crate::validator::{BookmarkInput, validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    Removed,
    Ignored,
}

impl MergeOutcome {
    pub fn record(self, stats: &mut MergeStats) -> Self {
        match self {
            MergeOutcome::Inserted => stats.inserted += 1,
            MergeOutcome::Replaced => stats.replaced += 1,
            MergeOutcome::Removed => stats.removed += 1,
            MergeOutcome::Ignored => stats.ignored += 1,
        }
        self
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: u32,
    pub replaced: u32,
    pub removed: u32,
    pub ignored: u32,
}

/// The converged, newest-first list of one owner's bookmarks.
///
/// Every mutation is keyed by id, never by position, so duplicate or
/// reordered notifications settle to the same list. New entries are
/// prepended rather than sorted into place.
#[derive(Debug, Default, Clone)]
pub struct BookmarkState {
    bookmarks: Vec<Bookmark>,
    stats: MergeStats,
}

impl BookmarkState {
    pub fn new(snapshot: Vec<Bookmark>) -> Self {
        let mut state = Self::default();
        state.replace_snapshot(snapshot);
        state
    }

    pub fn bookmarks(&self) -> &[Bookmark] {
        &self.bookmarks
    }

    pub fn len(&self) -> usize {
        self.bookmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }

    pub fn get(&self, id: BookmarkId) -> Option<&Bookmark> {
        self.bookmarks.iter().find(|b| b.id == id)
    }

    pub fn contains(&self, id: BookmarkId) -> bool {
        self.get(id).is_some()
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    /// Replaces the list unconditionally. Repeated ids keep their first entry.
    pub fn replace_snapshot(&mut self, snapshot: Vec<Bookmark>) {
        let mut seen = HashSet::with_capacity(snapshot.len());
        self.bookmarks = snapshot.into_iter().filter(|b| seen.insert(b.id)).collect();
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> MergeOutcome {
        let outcome = match event {
            ChangeEvent::Insert { record } => self.insert_if_absent(record),
            ChangeEvent::Update { record } => self.replace_existing(record),
            ChangeEvent::Delete { id } => self.remove(*id),
        };
        outcome.record(&mut self.stats)
    }

    pub fn apply_tab_message(&mut self, message: &TabMessage) -> MergeOutcome {
        let outcome = match message {
            TabMessage::Added { bookmark } => self.insert_if_absent(bookmark),
            TabMessage::Removed { id } => self.remove(*id),
        };
        outcome.record(&mut self.stats)
    }

    /// Optimistic insert. A record whose id is already present overwrites it.
    pub fn local_add(&mut self, record: Bookmark) -> MergeOutcome {
        let outcome = match self.position(record.id) {
            Some(idx) => {
                self.bookmarks[idx] = record;
                MergeOutcome::Replaced
            }
            None => {
                self.bookmarks.insert(0, record);
                MergeOutcome::Inserted
            }
        };
        outcome.record(&mut self.stats)
    }

    pub fn local_remove(&mut self, id: BookmarkId) -> MergeOutcome {
        self.remove(id).record(&mut self.stats)
    }

    fn position(&self, id: BookmarkId) -> Option<usize> {
        self.bookmarks.iter().position(|b| b.id == id)
    }

    fn insert_if_absent(&mut self, record: &Bookmark) -> MergeOutcome {
        if self.contains(record.id) {
            return MergeOutcome::Ignored;
        }
        self.bookmarks.insert(0, record.clone());
        MergeOutcome::Inserted
    }

    fn replace_existing(&mut self, record: &Bookmark) -> MergeOutcome {
        match self.position(record.id) {
            Some(idx) => {
                self.bookmarks[idx] = record.clone();
                MergeOutcome::Replaced
            }
            None => MergeOutcome::Ignored,
        }
    }

    fn remove(&mut self, id: BookmarkId) -> MergeOutcome {
        match self.position(id) {
            Some(idx) => {
                self.bookmarks.remove(idx);
                MergeOutcome::Removed
            }
            None => MergeOutcome::Ignored,
        }
    }
}

/// A write waiting for the store. `Flush` is answered once every request
/// queued before it has been handled.
#[derive(Debug)]
enum PersistRequest {
    Insert(Bookmark),
    Delete(BookmarkId),
    Flush(oneshot::Sender<()>),
}

/// Live view of one owner's bookmarks, fed by the store snapshot, the change
/// feed, local intents and (optionally) sibling tabs.
///
/// Persist requests run in the background, one at a time and in the order
/// they were issued. A failed persist is logged and reported on the error
/// channel; the optimistic change is kept until a reseed or a contradicting
/// remote event corrects it.
pub struct SyncSession<S> {
    owner: OwnerId,
    state: Arc<Mutex<BookmarkState>>,
    _store: PhantomData<fn() -> S>,
    tabs: Option<TabChannel>,
    persists: mpsc::UnboundedSender<PersistRequest>,
    errors_rx: Option<mpsc::UnboundedReceiver<SyncError>>,
    cancel: CancellationToken,
}

impl<S> SyncSession<S>
where
    S: BookmarkStore + Send + Sync + 'static,
{
    /// Subscribes first, then loads the snapshot, so nothing committed in
    /// between is missed. Feed events already reflected in the snapshot merge
    /// as no-ops.
    pub async fn start<F>(
        owner: OwnerId,
        store: Arc<S>,
        feed: &F,
        tabs: Option<TabChannel>,
    ) -> Result<Self, PersistenceError>
    where
        F: ChangeFeed + ?Sized,
    {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let events = match feed.subscribe(FeedFilter::owner(owner)) {
            Ok(events) => Some(events),
            Err(e) => {
                tracing::warn!(%owner, error = %e, "change feed unavailable, running snapshot-only");
                let _ = errors_tx.send(SyncError::Subscription(e));
                None
            }
        };

        let snapshot = store.list(owner).await?;
        tracing::info!(%owner, count = snapshot.len(), "sync session seeded");

        let (persists, queue) = mpsc::unbounded_channel();
        tokio::spawn(persist_worker(store, owner, queue, errors_tx));

        let session = SyncSession {
            owner,
            state: Arc::new(Mutex::new(BookmarkState::new(snapshot))),
            _store: PhantomData,
            tabs,
            persists,
            errors_rx: Some(errors_rx),
            cancel: CancellationToken::new(),
        };

        if let Some(events) = events {
            session.spawn_feed_listener(events);
        }
        if let Some(tabs) = &session.tabs {
            session.spawn_tab_listener(tabs.subscribe());
        }

        Ok(session)
    }

    pub async fn snapshot(&self) -> Vec<Bookmark> {
        self.state.lock().await.bookmarks().to_vec()
    }

    pub async fn stats(&self) -> MergeStats {
        self.state.lock().await.stats()
    }

    pub async fn reseed(&self, snapshot: Vec<Bookmark>) {
        self.state.lock().await.replace_snapshot(snapshot);
    }

    /// Takes the receiving end of the error channel. Only the first caller
    /// gets it.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<SyncError>> {
        self.errors_rx.take()
    }

    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Validates and optimistically adds a bookmark, then queues the insert.
    /// Invalid input leaves the state untouched.
    pub async fn submit(&self, input: &BookmarkInput) -> Result<Bookmark, ValidationError> {
        let valid = validate(input)?;
        let record = Bookmark::new(self.owner, valid);

        self.state.lock().await.local_add(record.clone());
        if let Some(tabs) = &self.tabs {
            tabs.post(TabMessage::Added {
                bookmark: record.clone(),
            });
        }

        self.queue(PersistRequest::Insert(record.clone()));
        Ok(record)
    }

    /// Optimistically removes a bookmark, then queues the delete behind any
    /// earlier request for it.
    pub async fn remove(&self, id: BookmarkId) {
        self.state.lock().await.local_remove(id);
        if let Some(tabs) = &self.tabs {
            tabs.post(TabMessage::Removed { id });
        }

        self.queue(PersistRequest::Delete(id));
    }

    /// Waits for every persist request issued before the call. Safe to call
    /// from several tasks at once.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue(PersistRequest::Flush(done_tx));
        let _ = done_rx.await;
    }

    /// Releases the feed and tab subscriptions. Persist requests already
    /// queued are left to finish.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        self.tabs.take();
        tracing::info!(owner = %self.owner, "sync session closed");
    }

    fn queue(&self, request: PersistRequest) {
        if let Err(e) = self.persists.send(request) {
            tracing::error!(owner = %self.owner, request = ?e.0, "persist worker is gone, request dropped");
        }
    }

    fn spawn_feed_listener(&self, mut events: FeedStream) {
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let owner = self.owner;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = events.next() => {
                        let Some(event) = next else {
                            tracing::warn!(%owner, "change feed ended, running snapshot-only");
                            break;
                        };
                        let outcome = state.lock().await.apply(&event);
                        tracing::debug!(%owner, id = %event.id(), kind = event.kind(), ?outcome, "merged feed event");
                    }
                }
            }
        });
    }

    fn spawn_tab_listener(&self, mut rx: TabReceiver) {
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let owner = self.owner;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => {
                        let Some(message) = next else { break };
                        let outcome = state.lock().await.apply_tab_message(&message);
                        tracing::debug!(%owner, ?outcome, "merged tab message");
                    }
                }
            }
        });
    }
}

impl<S> Drop for SyncSession<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Drains one session's persist queue in order. Ends once the session, and
/// with it the sending half, is gone.
async fn persist_worker<S>(
    store: Arc<S>,
    owner: OwnerId,
    mut queue: mpsc::UnboundedReceiver<PersistRequest>,
    errors: mpsc::UnboundedSender<SyncError>,
) where
    S: BookmarkStore + Send + Sync + 'static,
{
    while let Some(request) = queue.recv().await {
        let (op, id, result) = match request {
            PersistRequest::Insert(record) => (PersistOp::Insert, record.id, store.insert(&record).await),
            PersistRequest::Delete(id) => match store.delete(id, owner).await {
                Ok(true) => continue,
                Ok(false) => {
                    tracing::debug!(%id, "bookmark already gone from store");
                    continue;
                }
                Err(e) => (PersistOp::Delete, id, Err(e)),
            },
            PersistRequest::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        if let Err(source) = result {
            tracing::error!(%owner, %id, %op, error = %unpack_error(&source), "failed to persist bookmark change");
            let _ = errors.send(SyncError::Persist { op, id, source });
        }
    }
    tracing::debug!(%owner, "persist queue closed");
}

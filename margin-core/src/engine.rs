//! The annotation engine: store, reconciler, live tracking and aggregates
//! wired together behind one handle.
//!
//! # Writers
//!
//! A document's store is mutated by explicit user actions, by reconciliation
//! passes ([`Engine::activate_document`]) and by live tracking flushes
//! ([`Engine::flush_tracker`]). All three run their read-modify-write under
//! the store's per-document lock. The last two also engage the
//! [`SelfSaveGuard`] around their write so that [`Engine::external_change`]
//! ignores the notification their own write produces.
//!
//! # Notifications
//!
//! Every successful save publishes [`StoreEvent::Changed`]; a reconciliation
//! pass that had nothing to write publishes [`StoreEvent::Reconciled`]. Both
//! go out on a broadcast channel; see [`Engine::subscribe`]. Tracking
//! sessions reseed only on `Changed` and `Invalidated`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregate::{FilterPolicy, LineAggregate};
use crate::config::EngineConfig;
use crate::db::now_millis;
use crate::error::StoreError;
use crate::guard::SelfSaveGuard;
use crate::position::{LineIndex, TextEdit};
use crate::reconcile::{move_anchor, reconcile_annotations, shift_anchor, ReconcileReport};
use crate::store::AnnotationStore;
use crate::tracker::{LineSnapshot, PositionTracker};
use crate::types::{Annotation, DocumentAnnotations, NewAnnotation, Reply};

const EVENT_CAPACITY: usize = 64;

/// Published after store changes, keyed by document path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The store was saved.
    Changed(String),
    /// A reconciliation pass completed without writing.
    Reconciled(String),
    /// The cached store was dropped after an out-of-band change.
    Invalidated(String),
}

pub struct Engine {
    store: AnnotationStore,
    guard: SelfSaveGuard,
    config: EngineConfig,
    filter: Mutex<FilterPolicy>,
    aggregates: Mutex<HashMap<String, LineAggregate>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Engine {
    pub fn new(store: AnnotationStore, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            guard: SelfSaveGuard::new(config.self_save_window.max(config.debounce)),
            filter: Mutex::new(config.filter),
            config,
            aggregates: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn guard(&self) -> &SelfSaveGuard {
        &self.guard
    }

    /// Receives a [`StoreEvent`] after every save and reconciliation pass.
    ///
    /// Renderers should refresh on any event.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// The annotations of `document_path`, or `None` if it has none.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Parse`] for a malformed store; the document should
    /// be shown without annotations until it parses again.
    pub async fn get_store(
        &self,
        document_path: &str,
    ) -> Result<Option<DocumentAnnotations>, StoreError> {
        self.store.get(document_path).await
    }

    /// Awaits a store mutation, then refreshes the aggregate and notifies.
    async fn mutation<T>(
        &self,
        document_path: &str,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let out = op.await?;
        if let Some(doc) = self.store.cached(document_path) {
            self.rebuild_aggregate(&doc);
        }
        self.notify(StoreEvent::Changed(document_path.to_owned()));
        Ok(out)
    }

    pub async fn add_annotation(
        &self,
        document_path: &str,
        new: NewAnnotation,
    ) -> Result<Annotation, StoreError> {
        self.mutation(document_path, self.store.add_annotation(document_path, new))
            .await
    }

    pub async fn add_reply(
        &self,
        document_path: &str,
        annotation_id: &str,
        author: &str,
        content: &str,
    ) -> Result<Reply, StoreError> {
        self.mutation(
            document_path,
            self.store
                .add_reply(document_path, annotation_id, author, content),
        )
        .await
    }

    pub async fn resolve(
        &self,
        document_path: &str,
        annotation_id: &str,
        resolved_by: &str,
    ) -> Result<Annotation, StoreError> {
        self.mutation(
            document_path,
            self.store.resolve(document_path, annotation_id, resolved_by),
        )
        .await
    }

    pub async fn reopen(
        &self,
        document_path: &str,
        annotation_id: &str,
    ) -> Result<Annotation, StoreError> {
        self.mutation(document_path, self.store.reopen(document_path, annotation_id))
            .await
    }

    pub async fn archive(
        &self,
        document_path: &str,
        annotation_id: &str,
    ) -> Result<Annotation, StoreError> {
        self.mutation(document_path, self.store.archive(document_path, annotation_id))
            .await
    }

    pub async fn edit_annotation(
        &self,
        document_path: &str,
        annotation_id: &str,
        content: &str,
    ) -> Result<Annotation, StoreError> {
        self.mutation(
            document_path,
            self.store
                .edit_annotation(document_path, annotation_id, content),
        )
        .await
    }

    pub async fn delete_annotation(
        &self,
        document_path: &str,
        annotation_id: &str,
    ) -> Result<Annotation, StoreError> {
        self.mutation(
            document_path,
            self.store.delete_annotation(document_path, annotation_id),
        )
        .await
    }

    pub async fn delete_reply(
        &self,
        document_path: &str,
        annotation_id: &str,
        reply_id: &str,
    ) -> Result<Reply, StoreError> {
        self.mutation(
            document_path,
            self.store
                .delete_reply(document_path, annotation_id, reply_id),
        )
        .await
    }

    /// Moves a document's annotations to a new path.
    ///
    /// # Errors
    ///
    /// See [`AnnotationStore::rename_document`].
    pub async fn rename_document(&self, from: &str, to: &str) -> Result<(), StoreError> {
        self.store.rename_document(from, to).await?;
        self.drop_aggregate(from);
        self.drop_aggregate(to);
        self.notify(StoreEvent::Invalidated(from.to_owned()));
        self.notify(StoreEvent::Changed(to.to_owned()));
        Ok(())
    }

    /// Deletes every annotation of a document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] if the delete fails.
    pub async fn forget_document(&self, document_path: &str) -> Result<bool, StoreError> {
        let removed = self.store.forget_document(document_path).await?;
        self.drop_aggregate(document_path);
        self.notify(StoreEvent::Invalidated(document_path.to_owned()));
        Ok(removed)
    }

    /// Runs a reconciliation pass for a document that just became active.
    ///
    /// `text` is the document's current content; `None` means it could not be
    /// read and the pass is skipped without touching any anchor. Returns
    /// `None` when skipped or when the document has no annotations.
    ///
    /// The store is written at most once per pass, and only if an annotation
    /// changed.
    ///
    /// # Errors
    ///
    /// Propagates load and save failures. A failed save leaves the cached
    /// store as it was before the pass.
    pub async fn activate_document(
        &self,
        document_path: &str,
        text: Option<&str>,
    ) -> Result<Option<ReconcileReport>, StoreError> {
        let Some(text) = text else {
            debug!(document = document_path, "document text unavailable, skipping reconciliation");
            return Ok(None);
        };
        let lines: Vec<&str> = text.lines().collect();

        let _lock = self.store.lock_document(document_path).await;
        let Some(mut doc) = self.store.get(document_path).await? else {
            return Ok(None);
        };

        let report = reconcile_annotations(
            &mut doc.comments,
            &lines,
            self.config.search_radius,
            now_millis(),
        );

        let event = if report.changed() {
            let saved = {
                let _token = self.guard.engage(document_path);
                self.store.save(doc).await?
            };
            info!(
                document = document_path,
                relocated = report.relocated.len(),
                stale = report.marked_stale,
                "reconciliation saved"
            );
            self.rebuild_aggregate(&saved);
            StoreEvent::Changed(document_path.to_owned())
        } else {
            debug!(document = document_path, "reconciliation found nothing to change");
            if !self.has_aggregate(document_path) {
                self.rebuild_aggregate(&doc);
            }
            StoreEvent::Reconciled(document_path.to_owned())
        };
        self.notify(event);
        Ok(Some(report))
    }

    /// Reconciles several documents, e.g. every document already open at startup.
    pub async fn activate_documents<I>(
        &self,
        documents: I,
    ) -> Vec<(String, Result<Option<ReconcileReport>, StoreError>)>
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        let mut results = Vec::new();
        for (path, text) in documents {
            let result = self.activate_document(&path, text.as_deref()).await;
            results.push((path, result));
        }
        results
    }

    /// Handles an out-of-band change to a document's persisted store.
    ///
    /// Returns `false` when the change was attributed to one of our own
    /// writes and ignored; otherwise the cache entry is dropped and
    /// [`StoreEvent::Invalidated`] is published.
    pub fn external_change(&self, document_path: &str) -> bool {
        if self.guard.is_suppressed(document_path) {
            debug!(document = document_path, "ignoring self-originated change");
            return false;
        }
        self.store.invalidate(document_path);
        self.drop_aggregate(document_path);
        self.notify(StoreEvent::Invalidated(document_path.to_owned()));
        true
    }

    /// The per-line summary of a document, built on demand.
    ///
    /// # Errors
    ///
    /// Propagates load failures.
    pub async fn line_aggregate(&self, document_path: &str) -> Result<LineAggregate, StoreError> {
        if let Some(aggregate) = self.aggregate_entry(document_path) {
            return Ok(aggregate);
        }
        let aggregate = match self.store.get(document_path).await? {
            Some(doc) => LineAggregate::build(&doc.comments, &self.filter()),
            None => LineAggregate::default(),
        };
        let mut aggregates = self.aggregates.lock().unwrap_or_else(PoisonError::into_inner);
        aggregates.insert(document_path.to_owned(), aggregate.clone());
        Ok(aggregate)
    }

    pub fn filter(&self) -> FilterPolicy {
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the visibility policy and rebuilds every aggregate.
    pub fn set_filter(&self, policy: FilterPolicy) {
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner) = policy;
        let mut aggregates = self.aggregates.lock().unwrap_or_else(PoisonError::into_inner);
        aggregates.retain(|path, aggregate| match self.store.cached(path) {
            Some(doc) => {
                *aggregate = LineAggregate::build(&doc.comments, &policy);
                true
            }
            None => false,
        });
    }

    fn aggregate_entry(&self, document_path: &str) -> Option<LineAggregate> {
        let aggregates = self.aggregates.lock().unwrap_or_else(PoisonError::into_inner);
        aggregates.get(document_path).cloned()
    }

    fn has_aggregate(&self, document_path: &str) -> bool {
        let aggregates = self.aggregates.lock().unwrap_or_else(PoisonError::into_inner);
        aggregates.contains_key(document_path)
    }

    fn rebuild_aggregate(&self, doc: &DocumentAnnotations) {
        let aggregate = LineAggregate::build(&doc.comments, &self.filter());
        let mut aggregates = self.aggregates.lock().unwrap_or_else(PoisonError::into_inner);
        aggregates.insert(doc.document_path.clone(), aggregate);
    }

    fn drop_aggregate(&self, document_path: &str) {
        let mut aggregates = self.aggregates.lock().unwrap_or_else(PoisonError::into_inner);
        aggregates.remove(document_path);
    }

    fn remap_aggregate(
        &self,
        document_path: &str,
        edit: &TextEdit,
        before: &LineIndex,
        after: &LineIndex,
    ) {
        let mut aggregates = self.aggregates.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(aggregate) = aggregates.get_mut(document_path) {
            *aggregate = aggregate.remap(edit, before, after);
        }
    }

    /// Builds a tracker for `document_path` seeded from its store.
    ///
    /// # Errors
    ///
    /// Propagates load failures.
    pub async fn new_tracker(
        &self,
        document_path: &str,
        text: String,
    ) -> Result<PositionTracker, StoreError> {
        let annotations = self
            .store
            .get(document_path)
            .await?
            .map(|doc| doc.comments)
            .unwrap_or_default();
        Ok(PositionTracker::new(
            document_path,
            text,
            &annotations,
            self.config.debounce,
        ))
    }

    /// Applies an edit to a tracker and shifts the document's aggregate with it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEdit`] if the edit does not fit the buffer.
    pub fn apply_edit(
        &self,
        tracker: &mut PositionTracker,
        edit: &TextEdit,
    ) -> Result<(), StoreError> {
        let before = tracker.apply_edit(edit, Instant::now())?;
        self.remap_aggregate(tracker.document_path(), edit, &before, tracker.line_index());
        Ok(())
    }

    /// Re-seeds a tracker from the current store content.
    ///
    /// Unflushed movement survives (see [`PositionTracker::reseed`]), and the
    /// document's aggregate is rebuilt at the tracked lines so the gutter
    /// keeps following the buffer.
    pub async fn reseed_tracker(&self, tracker: &mut PositionTracker) {
        match self.store.get(tracker.document_path()).await {
            Ok(doc) => {
                let mut annotations = doc.map(|d| d.comments).unwrap_or_default();
                tracker.reseed(&annotations);
                let lines = tracker.snapshot();
                for annotation in &mut annotations {
                    if let Some(&line) = lines.get(&annotation.id) {
                        annotation.anchor.start_line = line;
                    }
                }
                let aggregate = LineAggregate::build(&annotations, &self.filter());
                let mut aggregates = self.aggregates.lock().unwrap_or_else(PoisonError::into_inner);
                aggregates.insert(tracker.document_path().to_owned(), aggregate);
            }
            Err(error) => warn!(
                document = tracker.document_path(),
                %error,
                "cannot reseed tracker"
            ),
        }
    }

    /// Writes tracked lines back if the tracker's debounce has expired and
    /// some line moved since the last flush. Returns whether the store was
    /// written.
    ///
    /// Moved anchors follow [`move_anchor`]. A stale anchor only has its lines
    /// shifted and keeps its snippet and flag.
    ///
    /// # Errors
    ///
    /// Propagates load and save failures; the tracker keeps its previous
    /// snapshot so the next flush retries.
    pub async fn flush_tracker(&self, tracker: &mut PositionTracker) -> Result<bool, StoreError> {
        let Some(batch) = tracker.begin_flush(Instant::now()) else {
            return Ok(false);
        };
        let result = self
            .write_tracked_lines(tracker.document_path(), &batch.moved, tracker.text())
            .await;
        tracker.finish_flush(batch.snapshot, result.is_ok());
        result
    }

    async fn write_tracked_lines(
        &self,
        document_path: &str,
        moved_lines: &LineSnapshot,
        text: &str,
    ) -> Result<bool, StoreError> {
        let _lock = self.store.lock_document(document_path).await;
        let Some(mut doc) = self.store.get(document_path).await? else {
            return Ok(false);
        };

        let lines: Vec<&str> = text.lines().collect();
        let now = now_millis();
        let mut moved = 0usize;
        for annotation in &mut doc.comments {
            let Some(&line) = moved_lines.get(&annotation.id) else {
                continue;
            };
            if line == annotation.anchor.start_line {
                continue;
            }
            if annotation.stale {
                shift_anchor(annotation, line, now);
            } else {
                move_anchor(annotation, line, &lines, now);
            }
            moved += 1;
        }
        if moved == 0 {
            debug!(document = document_path, "tracked lines already persisted");
            return Ok(false);
        }

        let saved = {
            let _token = self.guard.engage(document_path);
            self.store.save(doc).await?
        };
        info!(document = document_path, moved, "tracked anchor lines saved");
        self.rebuild_aggregate(&saved);
        self.notify(StoreEvent::Changed(document_path.to_owned()));
        Ok(true)
    }

    /// Opens a live tracking session driven by a background task.
    ///
    /// # Errors
    ///
    /// Propagates load failures while seeding.
    pub async fn open_session(
        self: &Arc<Self>,
        document_path: &str,
        text: String,
    ) -> Result<SessionHandle, StoreError> {
        let events = self.subscribe();
        let tracker = self.new_tracker(document_path, text).await?;
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(Arc::clone(self), tracker, rx, events));
        Ok(SessionHandle { commands, task })
    }
}

/// Messages from the editing surface to a session task.
#[derive(Debug)]
pub enum SessionCommand {
    Edit(TextEdit),
    Close,
}

/// Owner side of a live tracking session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<PositionTracker>,
}

impl SessionHandle {
    /// Forwards an edit. Returns `false` if the session already ended.
    pub fn edit(&self, edit: TextEdit) -> bool {
        self.commands.send(SessionCommand::Edit(edit)).is_ok()
    }

    /// Ends the session. A pending flush is cancelled, not run.
    ///
    /// Returns the final tracker state, or `None` if the task panicked.
    pub async fn close(self) -> Option<PositionTracker> {
        let _ = self.commands.send(SessionCommand::Close);
        self.task.await.ok()
    }
}

async fn run_session(
    engine: Arc<Engine>,
    mut tracker: PositionTracker,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut events: broadcast::Receiver<StoreEvent>,
) -> PositionTracker {
    loop {
        let deadline = tracker.deadline();
        let flush_due = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Edit(edit)) => {
                    if let Err(error) = engine.apply_edit(&mut tracker, &edit) {
                        warn!(document = tracker.document_path(), %error, "edit rejected");
                    }
                }
                Some(SessionCommand::Close) | None => {
                    tracker.cancel();
                    break;
                }
            },
            () = flush_due => {
                if let Err(error) = engine.flush_tracker(&mut tracker).await {
                    warn!(document = tracker.document_path(), %error, "tracked line flush failed");
                }
            }
            event = events.recv() => match event {
                Ok(StoreEvent::Changed(path) | StoreEvent::Invalidated(path))
                    if path == tracker.document_path() =>
                {
                    engine.reseed_tracker(&mut tracker).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    engine.reseed_tracker(&mut tracker).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracker.cancel();
                    break;
                }
            },
        }
    }
    debug!(document = tracker.document_path(), "tracking session closed");
    tracker
}

//! Cached, persisted annotation stores, one per document.
//!
//! [`AnnotationStore`] owns the database connection and an in-memory cache
//! keyed by document path. Reads go through the cache; every save writes the
//! database first and only then replaces the cache entry, so a failed write
//! leaves the cached state untouched.
//!
//! Mutations are read-modify-write cycles and run under a per-document async
//! lock (see [`AnnotationStore::lock_document`]). Callers that need several
//! steps under the same lock, like the reconciler, take the lock themselves and
//! use [`AnnotationStore::get`] and [`AnnotationStore::save`] directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::db::{self, now_millis};
use crate::error::StoreError;
use crate::snippet::capture_snippet;
use crate::types::{
    Annotation, AnnotationStatus, DocumentAnnotations, NewAnnotation, Reply, ReplyStatus,
};

/// Generates an identifier: hex millisecond prefix plus a random suffix.
fn new_id(now: i64) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{:x}-{}", now, &random[..12])
}

pub struct AnnotationStore {
    conn: Connection,
    cache: Mutex<HashMap<String, DocumentAnnotations>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AnnotationStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the database at `db_path` and wraps it in a store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] if the database cannot be opened or migrated.
    pub async fn open(db_path: &str) -> Result<Self, StoreError> {
        Ok(Self::new(db::open_db(db_path).await?))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Acquires the critical section for `document_path`.
    ///
    /// Held across the whole read-modify-write of any mutation.
    pub async fn lock_document(&self, document_path: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(document_path.to_owned()).or_default())
        };
        lock.lock_owned().await
    }

    /// Returns the cached copy of `document_path`, without touching storage.
    pub fn cached(&self, document_path: &str) -> Option<DocumentAnnotations> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get(document_path).cloned()
    }

    /// Returns the store for `document_path`, loading it into the cache if needed.
    ///
    /// `Ok(None)` means the document has no annotations yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Parse`] when the persisted body is malformed (the
    /// cache stays empty for that document) and [`StoreError::Db`] on read failure.
    pub async fn get(&self, document_path: &str) -> Result<Option<DocumentAnnotations>, StoreError> {
        if let Some(doc) = self.cached(document_path) {
            debug!(document = document_path, "annotation cache hit");
            return Ok(Some(doc));
        }

        let Some(body) = db::load_store_body(&self.conn, document_path).await? else {
            debug!(document = document_path, "no persisted annotations");
            return Ok(None);
        };
        let mut doc: DocumentAnnotations = match serde_json::from_str(&body) {
            Ok(doc) => doc,
            Err(source) => {
                warn!(document = document_path, error = %source, "malformed annotation store");
                return Err(StoreError::Parse {
                    path: document_path.to_owned(),
                    source,
                });
            }
        };
        doc.normalize();

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(document_path.to_owned(), doc.clone());
        Ok(Some(doc))
    }

    /// Persists `doc` and refreshes its cache entry.
    ///
    /// Recomputes `metadata` and bumps `updated_at` before writing. The cache
    /// is only updated after the write succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialize`] or [`StoreError::Db`]; in both cases
    /// the cache still holds the previous state.
    pub async fn save(&self, mut doc: DocumentAnnotations) -> Result<DocumentAnnotations, StoreError> {
        doc.refresh_metadata();
        doc.updated_at = now_millis().max(doc.updated_at);

        let body = serde_json::to_string_pretty(&doc).map_err(StoreError::Serialize)?;
        db::write_store_body(&self.conn, &doc.document_path, body, doc.updated_at).await?;
        debug!(
            document = %doc.document_path,
            comments = doc.comments.len(),
            "annotation store saved"
        );

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(doc.document_path.clone(), doc.clone());
        Ok(doc)
    }

    /// Drops the cache entry for `document_path` so the next `get` re-reads storage.
    pub fn invalidate(&self, document_path: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.remove(document_path).is_some() {
            debug!(document = document_path, "annotation cache invalidated");
        }
    }

    /// Drops every cache entry.
    pub fn clear_all(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.clear();
    }

    /// Runs `mutate` on the store for `document_path` under its lock and saves.
    ///
    /// With `create` set, a missing store is created empty first.
    async fn update<T>(
        &self,
        document_path: &str,
        create: bool,
        mutate: impl FnOnce(&mut DocumentAnnotations, i64) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.lock_document(document_path).await;
        let now = now_millis();
        let mut doc = match self.get(document_path).await? {
            Some(doc) => doc,
            None if create => DocumentAnnotations::new(document_path, now),
            None => return Err(StoreError::NoStore(document_path.to_owned())),
        };
        let out = mutate(&mut doc, now)?;
        self.save(doc).await?;
        Ok(out)
    }

    /// Adds a new open annotation, creating the document's store if needed.
    ///
    /// # Errors
    ///
    /// Propagates load and save failures.
    pub async fn add_annotation(
        &self,
        document_path: &str,
        new: NewAnnotation,
    ) -> Result<Annotation, StoreError> {
        let annotation = self
            .update(document_path, true, |doc, now| {
                let mut anchor = new.anchor;
                anchor.start_line = anchor.start_line.max(1);
                anchor.end_line = anchor.end_line.max(anchor.start_line);
                let annotation = Annotation {
                    id: new_id(now),
                    author: new.author,
                    created_at: now,
                    updated_at: now,
                    content: new.content,
                    anchor,
                    snippet: new
                        .line_text
                        .as_deref()
                        .map(capture_snippet)
                        .filter(|s| !s.is_empty()),
                    stale: false,
                    status: AnnotationStatus::Open,
                    resolved_at: None,
                    resolved_by: None,
                    last_activity_at: Some(now),
                    replies: Vec::new(),
                };
                doc.comments.push(annotation.clone());
                Ok(annotation)
            })
            .await?;
        info!(
            document = document_path,
            id = %annotation.id,
            line = annotation.anchor.start_line,
            "annotation added"
        );
        Ok(annotation)
    }

    /// Appends a reply; a resolved or archived thread is reopened.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown annotation id.
    pub async fn add_reply(
        &self,
        document_path: &str,
        annotation_id: &str,
        author: &str,
        content: &str,
    ) -> Result<Reply, StoreError> {
        self.update(document_path, false, |doc, now| {
            let annotation = doc
                .find_mut(annotation_id)
                .ok_or_else(|| StoreError::not_found(document_path, annotation_id))?;
            let reply = Reply {
                id: new_id(now),
                author: author.to_owned(),
                created_at: now,
                updated_at: now,
                content: content.to_owned(),
                status: ReplyStatus::Active,
            };
            annotation.push_reply(reply.clone());
            Ok(reply)
        })
        .await
    }

    /// Resolves an annotation on behalf of `resolved_by`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown annotation id.
    pub async fn resolve(
        &self,
        document_path: &str,
        annotation_id: &str,
        resolved_by: &str,
    ) -> Result<Annotation, StoreError> {
        self.update(document_path, false, |doc, now| {
            let annotation = doc
                .find_mut(annotation_id)
                .ok_or_else(|| StoreError::not_found(document_path, annotation_id))?;
            annotation.resolve(resolved_by, now);
            Ok(annotation.clone())
        })
        .await
    }

    /// Moves a resolved or archived annotation back to open.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown annotation id.
    pub async fn reopen(
        &self,
        document_path: &str,
        annotation_id: &str,
    ) -> Result<Annotation, StoreError> {
        self.update(document_path, false, |doc, now| {
            let annotation = doc
                .find_mut(annotation_id)
                .ok_or_else(|| StoreError::not_found(document_path, annotation_id))?;
            annotation.reopen(now);
            Ok(annotation.clone())
        })
        .await
    }

    /// Archives an annotation. Resolution fields are kept.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown annotation id.
    pub async fn archive(
        &self,
        document_path: &str,
        annotation_id: &str,
    ) -> Result<Annotation, StoreError> {
        self.update(document_path, false, |doc, now| {
            let annotation = doc
                .find_mut(annotation_id)
                .ok_or_else(|| StoreError::not_found(document_path, annotation_id))?;
            annotation.status = AnnotationStatus::Archived;
            annotation.updated_at = now;
            Ok(annotation.clone())
        })
        .await
    }

    /// Replaces the body of an annotation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown annotation id.
    pub async fn edit_annotation(
        &self,
        document_path: &str,
        annotation_id: &str,
        content: &str,
    ) -> Result<Annotation, StoreError> {
        self.update(document_path, false, |doc, now| {
            let annotation = doc
                .find_mut(annotation_id)
                .ok_or_else(|| StoreError::not_found(document_path, annotation_id))?;
            annotation.content = content.to_owned();
            annotation.updated_at = now;
            Ok(annotation.clone())
        })
        .await
    }

    /// Removes an annotation and its replies.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown annotation id.
    pub async fn delete_annotation(
        &self,
        document_path: &str,
        annotation_id: &str,
    ) -> Result<Annotation, StoreError> {
        self.update(document_path, false, |doc, _now| {
            let idx = doc
                .comments
                .iter()
                .position(|c| c.id == annotation_id)
                .ok_or_else(|| StoreError::not_found(document_path, annotation_id))?;
            Ok(doc.comments.remove(idx))
        })
        .await
    }

    /// Marks a reply deleted. Its content stays in storage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if either id is unknown.
    pub async fn delete_reply(
        &self,
        document_path: &str,
        annotation_id: &str,
        reply_id: &str,
    ) -> Result<Reply, StoreError> {
        self.update(document_path, false, |doc, now| {
            let annotation = doc
                .find_mut(annotation_id)
                .ok_or_else(|| StoreError::not_found(document_path, annotation_id))?;
            let reply = annotation
                .replies
                .iter_mut()
                .find(|r| r.id == reply_id)
                .ok_or_else(|| StoreError::not_found(document_path, reply_id))?;
            reply.status = ReplyStatus::Deleted;
            reply.updated_at = now;
            let reply = reply.clone();
            annotation.updated_at = now;
            Ok(reply)
        })
        .await
    }

    /// Moves the store of `from` to `to` and invalidates both cache entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoStore`] if `from` has no annotations and
    /// [`StoreError::AlreadyExists`] if `to` already has some.
    pub async fn rename_document(&self, from: &str, to: &str) -> Result<(), StoreError> {
        if from == to {
            return Ok(());
        }
        // Locks are always taken in path order.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let _first = self.lock_document(first).await;
        let _second = self.lock_document(second).await;

        if db::load_store_body(&self.conn, to).await?.is_some() {
            return Err(StoreError::AlreadyExists(to.to_owned()));
        }
        let mut doc = self
            .get(from)
            .await?
            .ok_or_else(|| StoreError::NoStore(from.to_owned()))?;
        doc.document_path = to.to_owned();
        doc.refresh_metadata();
        doc.updated_at = now_millis().max(doc.updated_at);
        let body = serde_json::to_string_pretty(&doc).map_err(StoreError::Serialize)?;

        if !db::move_store_body(&self.conn, from, to, body, doc.updated_at).await? {
            return Err(StoreError::NoStore(from.to_owned()));
        }
        self.invalidate(from);
        self.invalidate(to);
        info!(from, to, "annotation store renamed");
        Ok(())
    }

    /// Deletes every annotation of `document_path`. Returns whether a store existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] if the delete fails.
    pub async fn forget_document(&self, document_path: &str) -> Result<bool, StoreError> {
        let _lock = self.lock_document(document_path).await;
        let removed = db::delete_store_body(&self.conn, document_path).await?;
        self.invalidate(document_path);
        Ok(removed)
    }

    /// Every document path with persisted annotations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Db`] if the query fails.
    pub async fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        Ok(db::list_document_paths(&self.conn).await?)
    }
}

//! Integration tests for the persisted annotation store.
//!
//! Exercises: add_annotation, add_reply, resolve, reopen, archive,
//! edit/delete, invalidate, rename/forget, malformed and legacy bodies,
//! and cache consistency after a failed write.

use margin_core::store::AnnotationStore;
use margin_core::types::{Anchor, AnnotationStatus, NewAnnotation, ReplyStatus};
use margin_core::StoreError;
use pretty_assertions::assert_eq;

fn temp_db() -> (tempfile::TempDir, String) {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("annotations.db").to_string_lossy().to_string();
    (dir, path)
}

fn note(author: &str, line: u32, text: &str) -> NewAnnotation {
    NewAnnotation {
        author: author.to_owned(),
        content: format!("about {text}"),
        anchor: Anchor {
            start_line: line,
            start_char: 0,
            end_line: line + 1,
            end_char: 4,
        },
        line_text: Some(text.to_owned()),
    }
}

async fn write_raw(store: &AnnotationStore, document_path: &str, body: &str) {
    let document_path = document_path.to_owned();
    let body = body.to_owned();
    store
        .connection()
        .call(move |db| {
            db.execute(
                "INSERT OR REPLACE INTO annotation_stores (document_path, body, updated_at)
                 VALUES (?1, ?2, 0)",
                rusqlite::params![&document_path, &body],
            )?;
            Ok::<_, rusqlite::Error>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn annotation_thread_lifecycle() {
    let (_dir, path) = temp_db();
    let store = AnnotationStore::open(&path).await.unwrap();

    assert!(store.get("src/lib.rs").await.unwrap().is_none(), "no store yet");

    let first = store
        .add_annotation("src/lib.rs", note("ana", 3, "pub fn parse(input: &str) {    "))
        .await
        .unwrap();
    assert_eq!(first.snippet.as_deref(), Some("pub fn parse(input: &str) {"));
    assert_eq!(first.status, AnnotationStatus::Open);
    assert!(!first.stale);
    assert_eq!(first.last_activity_at, Some(first.created_at));

    let second = store
        .add_annotation("src/lib.rs", note("bo", 10, "}"))
        .await
        .unwrap();
    assert_ne!(first.id, second.id, "ids must not collide");

    let doc = store.get("src/lib.rs").await.unwrap().unwrap();
    assert_eq!(doc.comments.len(), 2);
    assert_eq!(doc.metadata.total_comments, 2);
    assert_eq!(doc.metadata.open_comments, 2);
    assert_eq!(doc.metadata.authors, vec!["ana".to_owned(), "bo".to_owned()]);
    assert_eq!(doc.version, "1.0");
    assert_eq!(doc.document_path, "src/lib.rs");

    // Resolve, then reply: the reply reopens the thread.
    let resolved = store.resolve("src/lib.rs", &first.id, "bo").await.unwrap();
    assert_eq!(resolved.status, AnnotationStatus::Resolved);
    assert_eq!(resolved.resolved_by.as_deref(), Some("bo"));
    assert!(resolved.resolved_at.is_some());
    assert_eq!(
        resolved.last_activity_at, first.last_activity_at,
        "resolving is not activity"
    );
    let doc = store.get("src/lib.rs").await.unwrap().unwrap();
    assert_eq!(doc.metadata.resolved_comments, 1);
    assert_eq!(doc.metadata.open_comments, 1);

    let reply = store
        .add_reply("src/lib.rs", &first.id, "cy", "still broken")
        .await
        .unwrap();
    let doc = store.get("src/lib.rs").await.unwrap().unwrap();
    let reopened = doc.find(&first.id).unwrap();
    assert_eq!(reopened.status, AnnotationStatus::Open);
    assert_eq!(reopened.resolved_at, None);
    assert_eq!(reopened.resolved_by, None);
    assert_eq!(reopened.last_activity_at, Some(reply.created_at));
    assert!(reopened.updated_at >= reply.created_at);
    assert_eq!(
        doc.metadata.authors,
        vec!["ana".to_owned(), "bo".to_owned(), "cy".to_owned()],
        "reply authors count too"
    );

    // Soft-delete the reply.
    let deleted = store
        .delete_reply("src/lib.rs", &first.id, &reply.id)
        .await
        .unwrap();
    assert_eq!(deleted.status, ReplyStatus::Deleted);
    assert_eq!(deleted.content, "still broken");

    // Archive, reopen, edit, delete.
    let archived = store.archive("src/lib.rs", &second.id).await.unwrap();
    assert_eq!(archived.status, AnnotationStatus::Archived);
    let doc = store.get("src/lib.rs").await.unwrap().unwrap();
    assert_eq!(doc.metadata.archived_comments, 1);

    let back = store.reopen("src/lib.rs", &second.id).await.unwrap();
    assert_eq!(back.status, AnnotationStatus::Open);

    let edited = store
        .edit_annotation("src/lib.rs", &second.id, "closing brace")
        .await
        .unwrap();
    assert_eq!(edited.content, "closing brace");

    store.delete_annotation("src/lib.rs", &second.id).await.unwrap();
    let doc = store.get("src/lib.rs").await.unwrap().unwrap();
    assert_eq!(doc.metadata.total_comments, 1);
    assert_eq!(doc.metadata.authors, vec!["ana".to_owned(), "cy".to_owned()]);

    // Unknown ids and documents are errors, not panics.
    assert!(matches!(
        store.resolve("src/lib.rs", "nope", "ana").await,
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        store.add_reply("missing.rs", "x", "ana", "hi").await,
        Err(StoreError::NoStore(_))
    ));
}

#[tokio::test]
async fn store_round_trips_through_storage() {
    let (_dir, path) = temp_db();
    let store = AnnotationStore::open(&path).await.unwrap();

    let ann = store
        .add_annotation("notes.md", note("ana", 1, "# Title"))
        .await
        .unwrap();
    store
        .add_reply("notes.md", &ann.id, "bo", "agreed")
        .await
        .unwrap();
    store.resolve("notes.md", &ann.id, "bo").await.unwrap();
    let cached = store.cached("notes.md").unwrap();

    // A second store over the same database reads exactly what was cached.
    let other = AnnotationStore::open(&path).await.unwrap();
    let loaded = other.get("notes.md").await.unwrap().unwrap();
    assert_eq!(loaded, cached);

    // Invalidate forces a re-read of changes made elsewhere.
    other.add_reply("notes.md", &ann.id, "cy", "reopening").await.unwrap();
    let stale_view = store.get("notes.md").await.unwrap().unwrap();
    assert_eq!(stale_view.find(&ann.id).unwrap().replies.len(), 1);
    store.invalidate("notes.md");
    let fresh = store.get("notes.md").await.unwrap().unwrap();
    assert_eq!(fresh.find(&ann.id).unwrap().replies.len(), 2);
    assert_eq!(fresh.find(&ann.id).unwrap().status, AnnotationStatus::Open);

    store.clear_all();
    assert!(store.cached("notes.md").is_none());
}

#[tokio::test]
async fn malformed_store_is_a_recoverable_error() {
    let (_dir, path) = temp_db();
    let store = AnnotationStore::open(&path).await.unwrap();
    write_raw(&store, "broken.txt", "{ this is not json").await;

    let err = store.get("broken.txt").await.unwrap_err();
    assert!(matches!(err, StoreError::Parse { .. }), "got {err:?}");
    assert!(store.cached("broken.txt").is_none());

    // Other documents are unaffected.
    store
        .add_annotation("fine.txt", note("ana", 1, "ok"))
        .await
        .unwrap();
    assert!(store.get("fine.txt").await.unwrap().is_some());

    // Once the body is fixed, the next read succeeds.
    write_raw(
        &store,
        "broken.txt",
        r#"{"version":"1.0","documentPath":"broken.txt","createdAt":1,"updatedAt":1,"comments":[]}"#,
    )
    .await;
    let doc = store.get("broken.txt").await.unwrap().unwrap();
    assert!(doc.comments.is_empty());
}

#[tokio::test]
async fn legacy_store_without_anchor_fingerprints_loads() {
    let (_dir, path) = temp_db();
    let store = AnnotationStore::open(&path).await.unwrap();
    write_raw(
        &store,
        "old.txt",
        r#"{
            "version": "1.0",
            "documentPath": "old.txt",
            "createdAt": 100,
            "updatedAt": 100,
            "comments": [{
                "id": "legacy-1",
                "author": "ana",
                "createdAt": 100,
                "updatedAt": 100,
                "content": "old note",
                "anchor": {"startLine": 2, "startChar": 0, "endLine": 2, "endChar": 0},
                "status": "open",
                "replies": [{
                    "id": "r1", "author": "bo", "createdAt": 250, "updatedAt": 250,
                    "content": "reply"
                }]
            }]
        }"#,
    )
    .await;

    let doc = store.get("old.txt").await.unwrap().unwrap();
    let ann = &doc.comments[0];
    assert_eq!(ann.snippet, None);
    assert!(!ann.stale);
    assert_eq!(ann.last_activity_at, Some(250), "backfilled from replies");
    assert_eq!(ann.replies[0].status, ReplyStatus::Active);
    assert_eq!(doc.metadata.total_comments, 1);
    assert_eq!(doc.metadata.authors, vec!["ana".to_owned(), "bo".to_owned()]);
}

#[tokio::test]
async fn failed_write_leaves_cache_untouched() {
    let (_dir, path) = temp_db();
    let store = AnnotationStore::open(&path).await.unwrap();
    let ann = store
        .add_annotation("doc.txt", note("ana", 1, "first line"))
        .await
        .unwrap();
    let before = store.cached("doc.txt").unwrap();

    store
        .connection()
        .call(|db| {
            db.execute_batch(
                "CREATE TRIGGER deny_update BEFORE UPDATE ON annotation_stores
                 BEGIN SELECT RAISE(ABORT, 'read only'); END;
                 CREATE TRIGGER deny_insert BEFORE INSERT ON annotation_stores
                 BEGIN SELECT RAISE(ABORT, 'read only'); END;",
            )?;
            Ok::<_, rusqlite::Error>(())
        })
        .await
        .unwrap();

    let err = store
        .add_reply("doc.txt", &ann.id, "bo", "lost")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Db(_)), "got {err:?}");
    assert_eq!(store.cached("doc.txt").unwrap(), before);
    assert_eq!(store.get("doc.txt").await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn rename_and_forget_documents() {
    let (_dir, path) = temp_db();
    let store = AnnotationStore::open(&path).await.unwrap();
    let ann = store
        .add_annotation("a.txt", note("ana", 1, "alpha"))
        .await
        .unwrap();
    store
        .add_annotation("c.txt", note("ana", 1, "gamma"))
        .await
        .unwrap();
    assert_eq!(
        store.list_documents().await.unwrap(),
        vec!["a.txt".to_owned(), "c.txt".to_owned()]
    );

    store.rename_document("a.txt", "b.txt").await.unwrap();
    assert!(store.get("a.txt").await.unwrap().is_none());
    let moved = store.get("b.txt").await.unwrap().unwrap();
    assert_eq!(moved.document_path, "b.txt");
    assert_eq!(moved.comments[0].id, ann.id);

    assert!(matches!(
        store.rename_document("b.txt", "c.txt").await,
        Err(StoreError::AlreadyExists(_))
    ));
    assert!(matches!(
        store.rename_document("nope.txt", "z.txt").await,
        Err(StoreError::NoStore(_))
    ));

    assert!(store.forget_document("c.txt").await.unwrap());
    assert!(!store.forget_document("c.txt").await.unwrap());
    assert_eq!(store.list_documents().await.unwrap(), vec!["b.txt".to_owned()]);
}

#[tokio::test]
async fn schema_is_migrated_once_to_the_current_version() {
    let (_dir, path) = temp_db();
    let versions = |store: AnnotationStore| async move {
        store
            .connection()
            .call(|db| {
                db.query_row(
                    "SELECT COUNT(*), MAX(version) FROM schema_version",
                    [],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
                )
            })
            .await
            .unwrap()
    };

    let store = AnnotationStore::open(&path).await.unwrap();
    assert_eq!(versions(store).await, (1, margin_core::schema::CURRENT_VERSION));

    // Reopening finds the schema current and records nothing new.
    let store = AnnotationStore::open(&path).await.unwrap();
    assert_eq!(versions(store).await, (1, margin_core::schema::CURRENT_VERSION));
}

#[tokio::test]
async fn newer_schema_is_left_alone() {
    let (_dir, path) = temp_db();
    let store = AnnotationStore::open(&path).await.unwrap();
    store
        .connection()
        .call(|db| {
            db.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [margin_core::schema::CURRENT_VERSION + 1],
            )?;
            Ok::<_, rusqlite::Error>(())
        })
        .await
        .unwrap();
    drop(store);

    let store = AnnotationStore::open(&path).await.unwrap();
    store
        .add_annotation("doc.txt", note("ana", 1, "first line"))
        .await
        .unwrap();
    assert_eq!(store.list_documents().await.unwrap(), vec!["doc.txt".to_owned()]);
}

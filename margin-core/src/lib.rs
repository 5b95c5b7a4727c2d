//! Line-anchored annotations that survive edits.
//!
//! Annotations are stored per document in a SQLite-backed JSON store
//! ([`store`]). When a document becomes active the [`reconcile`] pass checks
//! each anchor against the current text and relocates drifted ones with the
//! [`snippet`] matcher. While a document is being edited, a [`tracker`]
//! carries anchor offsets through every edit and writes changed lines back
//! after a quiet period. [`aggregate`] derives per-line gutter summaries.
//! [`engine::Engine`] ties these together.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod guard;
pub mod position;
pub mod reconcile;
pub mod schema;
pub mod snippet;
pub mod store;
pub mod tracker;
pub mod types;

pub use aggregate::{FilterPolicy, LineAggregate, LineSummary};
pub use config::EngineConfig;
pub use engine::{Engine, SessionHandle, StoreEvent};
pub use error::StoreError;
pub use position::TextEdit;
pub use reconcile::ReconcileReport;
pub use store::AnnotationStore;
pub use types::{Anchor, Annotation, AnnotationStatus, DocumentAnnotations, NewAnnotation, Reply};

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Format version written into every persisted document store.
pub const STORE_FORMAT_VERSION: &str = "1.0";

/// Location of an annotation inside its document.
///
/// Lines are 1-indexed, character offsets are 0-indexed. `start_line <= end_line`
/// holds for every anchor produced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    pub start_line: u32,
    pub start_char: u32,
    pub end_line: u32,
    pub end_char: u32,
}

impl Anchor {
    /// An anchor covering the start of a single line.
    pub fn line(line: u32) -> Self {
        Self {
            start_line: line,
            start_char: 0,
            end_line: line,
            end_char: 0,
        }
    }

    /// Number of lines spanned beyond the first one.
    pub fn span(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line)
    }
}

/// Lifecycle of an annotation thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationStatus {
    #[default]
    Open,
    Resolved,
    Archived,
}

impl AnnotationStatus {
    /// `true` for every state that is not `Open`.
    pub fn is_closed(self) -> bool {
        !matches!(self, AnnotationStatus::Open)
    }
}

/// Visibility of a single reply. Deleted replies keep their content on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    #[default]
    Active,
    Deleted,
}

/// One reply inside an annotation thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub id: String,
    pub author: String,
    pub created_at: i64, // Unix timestamp milliseconds
    pub updated_at: i64,
    pub content: String,
    #[serde(default)]
    pub status: ReplyStatus,
}

/// One anchored comment thread.
///
/// `snippet`, `stale` and `last_activity_at` may be missing in stores written by
/// older versions; such annotations load fine and are backfilled by the
/// reconciler and by [`DocumentAnnotations::normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    pub author: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub content: String,
    pub anchor: Anchor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub status: AnnotationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<i64>,
    #[serde(default)]
    pub replies: Vec<Reply>,
}

impl Annotation {
    /// The stored snippet, treating an empty string the same as a missing one.
    pub fn snippet(&self) -> Option<&str> {
        self.snippet.as_deref().filter(|s| !s.is_empty())
    }

    /// Latest of `created_at` and every reply's `created_at`.
    pub fn last_activity(&self) -> i64 {
        let from_replies = self.replies.iter().map(|r| r.created_at).max();
        let derived = from_replies.map_or(self.created_at, |r| r.max(self.created_at));
        self.last_activity_at.map_or(derived, |stored| stored.max(derived))
    }

    /// Appends a reply. A closed thread is reopened and its resolution cleared.
    pub fn push_reply(&mut self, reply: Reply) {
        let at = reply.created_at;
        if self.status.is_closed() {
            self.status = AnnotationStatus::Open;
            self.resolved_at = None;
            self.resolved_by = None;
        }
        self.replies.push(reply);
        self.updated_at = self.updated_at.max(at);
        self.last_activity_at = Some(self.last_activity().max(at));
    }

    /// Marks the thread resolved. `last_activity_at` is left alone.
    pub fn resolve(&mut self, by: &str, at: i64) {
        self.status = AnnotationStatus::Resolved;
        self.resolved_at = Some(at);
        self.resolved_by = Some(by.to_owned());
        self.updated_at = at;
    }

    /// Moves a resolved or archived thread back to `Open`.
    pub fn reopen(&mut self, at: i64) {
        self.status = AnnotationStatus::Open;
        self.resolved_at = None;
        self.resolved_by = None;
        self.updated_at = at;
    }
}

/// Derived summary of a document store. Always recomputed from `comments`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub total_comments: usize,
    pub open_comments: usize,
    pub resolved_comments: usize,
    pub archived_comments: usize,
    pub authors: Vec<String>,
}

impl Metadata {
    pub fn from_comments(comments: &[Annotation]) -> Self {
        let mut meta = Metadata {
            total_comments: comments.len(),
            ..Metadata::default()
        };
        let mut authors = BTreeSet::new();
        for comment in comments {
            match comment.status {
                AnnotationStatus::Open => meta.open_comments += 1,
                AnnotationStatus::Resolved => meta.resolved_comments += 1,
                AnnotationStatus::Archived => meta.archived_comments += 1,
            }
            authors.insert(comment.author.clone());
            for reply in &comment.replies {
                authors.insert(reply.author.clone());
            }
        }
        meta.authors = authors.into_iter().collect();
        meta
    }
}

/// Every annotation of one document, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAnnotations {
    pub version: String,
    pub document_path: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub comments: Vec<Annotation>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DocumentAnnotations {
    /// An empty store for `document_path`, created at `now`.
    pub fn new(document_path: &str, now: i64) -> Self {
        Self {
            version: STORE_FORMAT_VERSION.to_owned(),
            document_path: document_path.to_owned(),
            created_at: now,
            updated_at: now,
            comments: Vec::new(),
            metadata: Metadata::default(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&Annotation> {
        self.comments.iter().find(|c| c.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Annotation> {
        self.comments.iter_mut().find(|c| c.id == id)
    }

    pub fn refresh_metadata(&mut self) {
        self.metadata = Metadata::from_comments(&self.comments);
    }

    /// Fills fields that older stores may lack and recomputes `metadata`.
    pub fn normalize(&mut self) {
        for comment in &mut self.comments {
            if comment.last_activity_at.is_none() {
                comment.last_activity_at = Some(comment.last_activity());
            }
        }
        self.refresh_metadata();
    }
}

/// Input for creating an annotation.
///
/// `line_text` is the current content of `anchor.start_line`; when present the
/// snippet is captured from it.
#[derive(Debug, Clone)]
pub struct NewAnnotation {
    pub author: String,
    pub content: String,
    pub anchor: Anchor,
    pub line_text: Option<String>,
}

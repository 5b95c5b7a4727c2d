//! Live anchor positions for one open editing session.
//!
//! A [`PositionTracker`] mirrors the session's buffer and maps each
//! annotation id to a byte offset. Edits move offsets through
//! [`TextEdit::map_offset`]; no matching happens here. Every edit (re)arms a
//! debounce deadline. Once it passes, [`PositionTracker::begin_flush`] turns
//! offsets into line numbers and hands back a [`FlushBatch`] only when they
//! differ from the last lines written.
//!
//! Anchors whose line lies outside the buffer are not tracked; they stay
//! wherever the store has them.
//!
//! The flush state machine is `Idle -> Pending(deadline) -> Flushing -> Idle`.
//! An edit during `Flushing` re-arms `Pending` so the later edit gets its own
//! flush. The async driver that owns a tracker lives in [`crate::engine`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::StoreError;
use crate::position::{LineIndex, TextEdit};
use crate::types::Annotation;

/// Flush progress of a tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Pending { deadline: Instant },
    Flushing,
    /// A flush is running and another edit arrived meanwhile.
    FlushingThenPending { deadline: Instant },
}

/// Line numbers keyed by annotation id.
pub type LineSnapshot = HashMap<String, u32>;

/// Lines handed out by [`PositionTracker::begin_flush`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushBatch {
    /// Every tracked line; the baseline for the next flush once persisted.
    pub snapshot: LineSnapshot,
    /// The annotations whose line differs from the baseline.
    pub moved: LineSnapshot,
}

#[derive(Debug)]
pub struct PositionTracker {
    document_path: String,
    text: String,
    index: LineIndex,
    offsets: HashMap<String, usize>,
    last_snapshot: LineSnapshot,
    state: FlushState,
    debounce: Duration,
}

impl PositionTracker {
    /// Starts tracking `text` with offsets seeded from `annotations`.
    pub fn new(
        document_path: &str,
        text: String,
        annotations: &[Annotation],
        debounce: Duration,
    ) -> Self {
        let index = LineIndex::new(&text);
        let mut tracker = Self {
            document_path: document_path.to_owned(),
            text,
            index,
            offsets: HashMap::new(),
            last_snapshot: HashMap::new(),
            state: FlushState::Idle,
            debounce,
        };
        tracker.reseed(annotations);
        tracker
    }

    /// Seeds tracked offsets from the stored anchors.
    ///
    /// Called at session start and whenever the persisted store changes. An
    /// anchor the store still has on its last flushed line keeps its tracked
    /// offset, so movement not yet flushed survives. Every other anchor is
    /// placed at the start of its stored line, or dropped from tracking when
    /// that line is outside the buffer. The stored lines become the baseline
    /// the next flush compares against.
    pub fn reseed(&mut self, annotations: &[Annotation]) {
        let line_count = self.index.line_count();
        let mut offsets = HashMap::with_capacity(annotations.len());
        let mut baseline = HashMap::with_capacity(annotations.len());
        for annotation in annotations {
            let line = annotation.anchor.start_line;
            let flushed = self.last_snapshot.get(&annotation.id);
            let kept = match (flushed, self.offsets.get(&annotation.id)) {
                (Some(&flushed), Some(&offset)) if flushed == line => Some(offset),
                _ => None,
            };
            let offset = match kept {
                Some(offset) => offset,
                None if line >= 1 && line as usize <= line_count => self.index.line_start(line),
                None => continue,
            };
            offsets.insert(annotation.id.clone(), offset);
            baseline.insert(annotation.id.clone(), line);
        }
        self.offsets = offsets;
        self.last_snapshot = baseline;
        debug!(
            document = %self.document_path,
            anchors = self.offsets.len(),
            "tracker seeded"
        );
    }

    /// Applies `edit` to the buffer, moves every offset and arms the debounce.
    ///
    /// Returns the line index of the buffer as it was before the edit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEdit`] if the edit does not fit the buffer;
    /// nothing changes in that case.
    pub fn apply_edit(&mut self, edit: &TextEdit, now: Instant) -> Result<LineIndex, StoreError> {
        edit.apply(&mut self.text)?;
        let before = std::mem::replace(&mut self.index, LineIndex::new(&self.text));
        for offset in self.offsets.values_mut() {
            *offset = edit.map_offset(*offset);
        }

        let deadline = now + self.debounce;
        self.state = match self.state {
            FlushState::Flushing | FlushState::FlushingThenPending { .. } => {
                FlushState::FlushingThenPending { deadline }
            }
            FlushState::Idle | FlushState::Pending { .. } => FlushState::Pending { deadline },
        };
        Ok(before)
    }

    /// When the pending flush is due, if one is scheduled.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            FlushState::Pending { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    pub fn document_path(&self) -> &str {
        &self.document_path
    }

    /// Current buffer content.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn line_index(&self) -> &LineIndex {
        &self.index
    }

    /// Current 1-indexed line of every tracked annotation.
    pub fn snapshot(&self) -> LineSnapshot {
        self.offsets
            .iter()
            .map(|(id, &offset)| (id.clone(), self.index.line_of(offset)))
            .collect()
    }

    /// Starts a flush if the debounce deadline has passed.
    ///
    /// Returns the lines to persist, or `None` when nothing is due or no
    /// line moved since the last flush. A returned batch's snapshot must be
    /// handed back through [`PositionTracker::finish_flush`].
    pub fn begin_flush(&mut self, now: Instant) -> Option<FlushBatch> {
        let FlushState::Pending { deadline } = self.state else {
            return None;
        };
        if now < deadline {
            return None;
        }

        let snapshot = self.snapshot();
        let moved: LineSnapshot = snapshot
            .iter()
            .filter(|(id, line)| self.last_snapshot.get(*id) != Some(*line))
            .map(|(id, &line)| (id.clone(), line))
            .collect();
        if moved.is_empty() {
            debug!(document = %self.document_path, "tracked lines unchanged, skipping flush");
            self.state = FlushState::Idle;
            return None;
        }
        self.state = FlushState::Flushing;
        Some(FlushBatch { snapshot, moved })
    }

    /// Completes a flush started by [`PositionTracker::begin_flush`].
    ///
    /// On success the snapshot becomes the baseline for the next comparison.
    pub fn finish_flush(&mut self, snapshot: LineSnapshot, persisted: bool) {
        if persisted {
            self.last_snapshot = snapshot;
        }
        self.state = match self.state {
            FlushState::FlushingThenPending { deadline } => FlushState::Pending { deadline },
            _ => FlushState::Idle,
        };
    }

    /// Drops any scheduled flush.
    pub fn cancel(&mut self) {
        self.state = FlushState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Anchor, AnnotationStatus};

    fn annotation(id: &str, line: u32) -> Annotation {
        Annotation {
            id: id.to_owned(),
            author: "ana".to_owned(),
            created_at: 1,
            updated_at: 1,
            content: String::new(),
            anchor: Anchor::line(line),
            snippet: None,
            stale: false,
            status: AnnotationStatus::Open,
            resolved_at: None,
            resolved_by: None,
            last_activity_at: None,
            replies: Vec::new(),
        }
    }

    const TEXT: &str = "zero\none\ntwo\nthree\n";

    fn tracker() -> PositionTracker {
        PositionTracker::new(
            "doc.txt",
            TEXT.to_owned(),
            &[annotation("a", 2), annotation("b", 4)],
            Duration::from_secs(2),
        )
    }

    #[test]
    fn seeds_from_anchor_lines() {
        let t = tracker();
        assert_eq!(t.snapshot().get("a"), Some(&2));
        assert_eq!(t.snapshot().get("b"), Some(&4));
        assert_eq!(t.state(), FlushState::Idle);
    }

    #[test]
    fn edits_transport_offsets() {
        let mut t = tracker();
        let now = Instant::now();
        // Two new lines at the very top push both anchors down.
        t.apply_edit(&TextEdit::insert(0, "x\ny\n"), now).unwrap();
        assert_eq!(t.snapshot().get("a"), Some(&4));
        assert_eq!(t.snapshot().get("b"), Some(&6));

        // Typing inside line "one" keeps "a" on its line.
        t.apply_edit(&TextEdit::insert(10, "!!"), now).unwrap();
        assert_eq!(t.snapshot().get("a"), Some(&4));
    }

    #[test]
    fn flush_waits_for_quiet_period_and_skips_unchanged() {
        let mut t = tracker();
        let start = Instant::now();
        t.apply_edit(&TextEdit::insert(0, "new\n"), start).unwrap();
        assert_eq!(t.begin_flush(start + Duration::from_secs(1)), None);

        // A second edit pushes the deadline out.
        t.apply_edit(&TextEdit::insert(0, "more\n"), start + Duration::from_secs(1))
            .unwrap();
        assert_eq!(t.begin_flush(start + Duration::from_millis(2_500)), None);

        let batch = t
            .begin_flush(start + Duration::from_secs(3))
            .expect("flush due");
        assert_eq!(batch.snapshot.get("a"), Some(&4));
        assert_eq!(batch.moved.len(), 2);
        assert_eq!(t.state(), FlushState::Flushing);
        t.finish_flush(batch.snapshot, true);
        assert_eq!(t.state(), FlushState::Idle);

        // Typing that leaves every line in place produces no flush.
        let later = start + Duration::from_secs(10);
        t.apply_edit(&TextEdit::insert(0, "x"), later).unwrap();
        assert_eq!(t.begin_flush(later + Duration::from_secs(2)), None);
        assert_eq!(t.state(), FlushState::Idle);
    }

    #[test]
    fn flush_lists_only_moved_anchors() {
        let mut t = tracker();
        let now = Instant::now();
        // A line inserted between the anchors only moves "b".
        t.apply_edit(&TextEdit::insert(9, "new\n"), now).unwrap();
        let batch = t.begin_flush(now + Duration::from_secs(2)).unwrap();
        assert_eq!(batch.moved, LineSnapshot::from([("b".to_owned(), 5)]));
        assert_eq!(batch.snapshot.get("a"), Some(&2));
    }

    #[test]
    fn edit_during_flush_schedules_another() {
        let mut t = tracker();
        let start = Instant::now();
        t.apply_edit(&TextEdit::insert(0, "\n"), start).unwrap();
        let batch = t.begin_flush(start + Duration::from_secs(2)).unwrap();
        t.apply_edit(&TextEdit::insert(0, "\n"), start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(t.deadline(), None);
        t.finish_flush(batch.snapshot, true);
        assert_eq!(t.deadline(), Some(start + Duration::from_secs(4)));
    }

    #[test]
    fn offsets_clamp_after_truncation() {
        let mut t = tracker();
        t.apply_edit(&TextEdit::delete(4, TEXT.len() - 4), Instant::now())
            .unwrap();
        assert_eq!(t.text(), "zero");
        assert_eq!(t.snapshot().get("b"), Some(&1));
    }

    #[test]
    fn cancel_drops_pending_flush() {
        let mut t = tracker();
        let now = Instant::now();
        t.apply_edit(&TextEdit::insert(0, "\n"), now).unwrap();
        t.cancel();
        assert_eq!(t.begin_flush(now + Duration::from_secs(5)), None);
    }

    #[test]
    fn reseed_keeps_movement_the_store_has_not_seen() {
        let mut t = tracker();
        let now = Instant::now();
        t.apply_edit(&TextEdit::insert(0, "x\ny\n"), now).unwrap();

        // The store changed for another reason and still has the old lines.
        t.reseed(&[annotation("a", 2), annotation("b", 4), annotation("c", 1)]);
        let snapshot = t.snapshot();
        assert_eq!(snapshot.get("a"), Some(&4));
        assert_eq!(snapshot.get("b"), Some(&6));
        assert_eq!(snapshot.get("c"), Some(&1), "new anchors seed from the store");

        let batch = t.begin_flush(now + Duration::from_secs(2)).unwrap();
        assert_eq!(batch.moved.get("a"), Some(&4));
        assert_eq!(batch.moved.get("b"), Some(&6));
        assert!(!batch.moved.contains_key("c"));
    }

    #[test]
    fn reseed_follows_anchors_the_store_moved() {
        let mut t = tracker();
        let now = Instant::now();
        t.apply_edit(&TextEdit::insert(0, "x\n"), now).unwrap();

        // Reconciliation put "a" somewhere else; the store wins for it.
        t.reseed(&[annotation("a", 4), annotation("b", 4)]);
        assert_eq!(t.snapshot().get("a"), Some(&4));
        assert_eq!(t.snapshot().get("b"), Some(&5));

        // Deleted annotations stop being tracked.
        t.reseed(&[annotation("b", 4)]);
        assert!(!t.snapshot().contains_key("a"));
    }

    #[test]
    fn anchors_outside_the_buffer_are_not_tracked() {
        let mut t = PositionTracker::new(
            "doc.txt",
            TEXT.to_owned(),
            &[annotation("a", 2), annotation("far", 40)],
            Duration::from_secs(2),
        );
        assert!(!t.snapshot().contains_key("far"));

        let now = Instant::now();
        t.apply_edit(&TextEdit::insert(0, "new\n"), now).unwrap();
        let batch = t.begin_flush(now + Duration::from_secs(2)).unwrap();
        assert_eq!(batch.moved, LineSnapshot::from([("a".to_owned(), 3)]));
    }
}

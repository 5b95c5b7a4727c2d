//! Anchor validation and relocation against current document text.
//!
//! [`reconcile_annotations`] is the pure part of a reconciliation pass: it
//! checks every anchor against `lines`, relocates drifted ones with the
//! snippet matcher and flags the rest as stale. Locking, persistence and
//! notification live in [`crate::engine::Engine::activate_document`].

use tracing::{debug, info, warn};

use crate::snippet::{capture_snippet, relocate};
use crate::types::Annotation;

/// An anchor that moved during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub id: String,
    pub from_line: u32,
    pub to_line: u32,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Anchors whose snippet still matched in place.
    pub verified: usize,
    /// Anchors that had no snippet and received one.
    pub backfilled: usize,
    /// Stale flags cleared on anchors that matched in place.
    pub cleared_stale: usize,
    pub relocated: Vec<Relocation>,
    /// Anchors newly flagged stale.
    pub marked_stale: usize,
}

impl ReconcileReport {
    /// Whether the pass changed any annotation.
    pub fn changed(&self) -> bool {
        self.backfilled > 0
            || self.cleared_stale > 0
            || !self.relocated.is_empty()
            || self.marked_stale > 0
    }
}

/// Moves an anchor to `new_line`, keeping its span.
///
/// The end line shifts by the same delta as the start, the snippet is
/// recaptured from `lines` and the stale flag is cleared. Shared by the
/// reconciler and by the live tracker's flush.
pub(crate) fn move_anchor<S: AsRef<str>>(
    annotation: &mut Annotation,
    new_line: u32,
    lines: &[S],
    now: i64,
) {
    let new_line = shift_anchor(annotation, new_line, now);
    annotation.snippet = lines
        .get(new_line as usize - 1)
        .map(|line| capture_snippet(line.as_ref()))
        .filter(|s| !s.is_empty());
    annotation.stale = false;
}

/// Moves an anchor to `new_line` keeping its span, snippet and stale flag.
///
/// Used when a stale anchor is carried along with edited text: its
/// fingerprint still describes the line it lost, so only reconciliation
/// may replace it. Returns the line actually used.
pub(crate) fn shift_anchor(annotation: &mut Annotation, new_line: u32, now: i64) -> u32 {
    let new_line = new_line.max(1);
    let span = annotation.anchor.span();
    annotation.anchor.start_line = new_line;
    annotation.anchor.end_line = new_line.saturating_add(span);
    annotation.updated_at = now;
    new_line
}

/// Validates every annotation against `lines` (the document's current text,
/// one entry per line) and relocates or flags the ones that drifted.
///
/// Annotations without a snippet get one backfilled from their current line
/// and are otherwise left alone. Running the pass twice on unchanged text
/// changes nothing the second time.
pub fn reconcile_annotations<S: AsRef<str>>(
    annotations: &mut [Annotation],
    lines: &[S],
    radius: usize,
    now: i64,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for annotation in annotations.iter_mut() {
        let start = annotation.anchor.start_line;
        let current = (start as usize)
            .checked_sub(1)
            .and_then(|idx| lines.get(idx))
            .map(|line| line.as_ref());

        let Some(snippet) = annotation.snippet().map(str::to_owned) else {
            let captured = current.map(capture_snippet).filter(|s| !s.is_empty());
            if let Some(captured) = captured {
                debug!(id = %annotation.id, line = start, "backfilled snippet");
                annotation.snippet = Some(captured);
                annotation.updated_at = now;
                report.backfilled += 1;
            }
            continue;
        };

        if current.is_some_and(|line| line.starts_with(&snippet)) {
            report.verified += 1;
            if annotation.stale {
                annotation.stale = false;
                annotation.updated_at = now;
                report.cleared_stale += 1;
            }
            continue;
        }

        let hint = (start as usize).saturating_sub(1);
        match relocate(lines, &snippet, hint, radius) {
            Some(found) => {
                let to_line = found.line as u32 + 1;
                info!(
                    id = %annotation.id,
                    from = start,
                    to = to_line,
                    confidence = found.confidence,
                    "relocated anchor"
                );
                move_anchor(annotation, to_line, lines, now);
                report.relocated.push(Relocation {
                    id: annotation.id.clone(),
                    from_line: start,
                    to_line,
                });
            }
            None => {
                if !annotation.stale {
                    warn!(id = %annotation.id, line = start, "anchor could not be relocated");
                    annotation.stale = true;
                    annotation.updated_at = now;
                    report.marked_stale += 1;
                }
            }
        }
    }

    report
}

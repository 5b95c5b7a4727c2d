//! Per-line display summaries for gutter rendering.

use std::collections::BTreeMap;

use crate::position::{LineIndex, TextEdit};
use crate::types::{Annotation, AnnotationStatus};

/// Which annotations are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterPolicy {
    pub show_resolved: bool,
    pub show_archived: bool,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            show_resolved: true,
            show_archived: false,
        }
    }
}

impl FilterPolicy {
    pub fn is_visible(&self, annotation: &Annotation) -> bool {
        match annotation.status {
            AnnotationStatus::Open => true,
            AnnotationStatus::Resolved => self.show_resolved,
            AnnotationStatus::Archived => self.show_archived,
        }
    }
}

/// Summary of the annotations bucketed at one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSummary {
    pub count: usize,
    pub has_stale: bool,
    pub all_resolved: bool,
}

impl Default for LineSummary {
    /// The identity for [`LineSummary::merge`].
    fn default() -> Self {
        Self {
            count: 0,
            has_stale: false,
            all_resolved: true,
        }
    }
}

impl LineSummary {
    fn of(annotation: &Annotation) -> Self {
        Self {
            count: 1,
            has_stale: annotation.stale,
            all_resolved: annotation.status.is_closed(),
        }
    }

    /// Combines two buckets: counts add, stale flags OR, resolved flags AND.
    pub fn merge(self, other: Self) -> Self {
        Self {
            count: self.count + other.count,
            has_stale: self.has_stale || other.has_stale,
            all_resolved: self.all_resolved && other.all_resolved,
        }
    }
}

/// Line number (1-indexed) to [`LineSummary`] for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineAggregate {
    lines: BTreeMap<u32, LineSummary>,
}

impl LineAggregate {
    /// Groups the visible annotations by their start line.
    pub fn build(annotations: &[Annotation], policy: &FilterPolicy) -> Self {
        let mut aggregate = Self::default();
        for annotation in annotations.iter().filter(|a| policy.is_visible(a)) {
            aggregate.add(annotation.anchor.start_line, LineSummary::of(annotation));
        }
        aggregate
    }

    /// Shifts every bucket through `edit`.
    ///
    /// `before` indexes the text the edit applies to and `after` the result.
    /// Buckets that land on the same line are merged. Buckets past the end
    /// of `before` belong to no text and keep their line.
    pub fn remap(&self, edit: &TextEdit, before: &LineIndex, after: &LineIndex) -> Self {
        let mut remapped = Self::default();
        for (&line, &summary) in &self.lines {
            if line as usize > before.line_count() {
                remapped.add(line, summary);
                continue;
            }
            let offset = edit.map_offset(before.line_start(line));
            remapped.add(after.line_of(offset), summary);
        }
        remapped
    }

    fn add(&mut self, line: u32, summary: LineSummary) {
        let slot = self.lines.entry(line).or_default();
        *slot = slot.merge(summary);
    }

    pub fn get(&self, line: u32) -> Option<&LineSummary> {
        self.lines.get(&line)
    }

    /// Buckets in ascending line order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &LineSummary)> + '_ {
        self.lines.iter().map(|(&line, summary)| (line, summary))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

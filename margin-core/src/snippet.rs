//! Line fingerprints and fingerprint relocation.
//!
//! A snippet is the first [`SNIPPET_MAX_CHARS`] characters of a line with
//! trailing whitespace removed. [`relocate`] looks for the line a snippet came
//! from near a hint: exact prefix matches first, scanning outward from the
//! hint, then the most similar line by [`bigram_similarity`].
//!
//! Line numbers in this module are 0-indexed positions into the slice of
//! document lines.

use std::collections::HashMap;

/// Maximum snippet length in characters.
pub const SNIPPET_MAX_CHARS: usize = 50;

/// Default number of lines searched on each side of the hint.
pub const DEFAULT_SEARCH_RADIUS: usize = 50;

/// Minimum similarity for a fuzzy candidate to count as a match.
pub const FUZZY_THRESHOLD: f64 = 0.7;

/// A relocated snippet: the 0-indexed line and how confident the match is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnippetMatch {
    pub line: usize,
    pub confidence: f64,
}

/// Captures the fingerprint of `line`.
pub fn capture_snippet(line: &str) -> String {
    let end = line
        .char_indices()
        .nth(SNIPPET_MAX_CHARS)
        .map_or(line.len(), |(idx, _)| idx);
    line[..end].trim_end().to_owned()
}

/// Finds the line `snippet` was captured from, searching `radius` lines
/// around `hint`.
///
/// Exact matches are tried at `hint`, then `hint - d` before `hint + d` for
/// growing `d`, and win with confidence `1.0`. Otherwise every line in the
/// window is scored by [`bigram_similarity`]; the best score at or above
/// [`FUZZY_THRESHOLD`] wins and equal scores go to the line closer to `hint`.
pub fn relocate<S: AsRef<str>>(
    lines: &[S],
    snippet: &str,
    hint: usize,
    radius: usize,
) -> Option<SnippetMatch> {
    if snippet.is_empty() || lines.is_empty() {
        return None;
    }

    let starts_with = |idx: usize| {
        lines
            .get(idx)
            .is_some_and(|line| line.as_ref().starts_with(snippet))
    };

    if starts_with(hint) {
        return Some(SnippetMatch {
            line: hint,
            confidence: 1.0,
        });
    }
    for d in 1..=radius {
        if let Some(above) = hint.checked_sub(d) {
            if starts_with(above) {
                return Some(SnippetMatch {
                    line: above,
                    confidence: 1.0,
                });
            }
        }
        if starts_with(hint + d) {
            return Some(SnippetMatch {
                line: hint + d,
                confidence: 1.0,
            });
        }
    }

    let lo = hint.saturating_sub(radius);
    let hi = hint.saturating_add(radius).min(lines.len() - 1);
    let mut best: Option<(SnippetMatch, usize)> = None;
    for idx in lo..=hi {
        let score = bigram_similarity(&capture_snippet(lines[idx].as_ref()), snippet);
        if score < FUZZY_THRESHOLD {
            continue;
        }
        let distance = idx.abs_diff(hint);
        let better = match &best {
            None => true,
            Some((current, current_distance)) => {
                score > current.confidence
                    || (score == current.confidence && distance < *current_distance)
            }
        };
        if better {
            best = Some((
                SnippetMatch {
                    line: idx,
                    confidence: score,
                },
                distance,
            ));
        }
    }
    best.map(|(found, _)| found)
}

/// Dice coefficient over the character bigrams of `a` and `b`.
///
/// Identical strings score `1.0`; otherwise a string shorter than two
/// characters scores `0.0`.
pub fn bigram_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }

    let mut counts: HashMap<(char, char), usize> = HashMap::new();
    for pair in a.windows(2) {
        *counts.entry((pair[0], pair[1])).or_default() += 1;
    }
    let mut intersection = 0usize;
    for pair in b.windows(2) {
        if let Some(count) = counts.get_mut(&(pair[0], pair[1])) {
            if *count > 0 {
                *count -= 1;
                intersection += 1;
            }
        }
    }

    (2 * intersection) as f64 / ((a.len() - 1) + (b.len() - 1)) as f64
}

//! Knowledge matcher: scores a message against trigger phrases.
//!
//! Scoring per trigger, on folded text:
//! - exact equality → 1.0
//! - one contains the other → 0.8
//! - otherwise the Jaccard overlap of their word sets
//!
//! Words are runs of alphanumeric characters, so a CJK phrase without
//! spaces is one word and only matches through equality or containment.
//! An entry scores the maximum over its triggers. The best entry at or above
//! the threshold wins; ties go to the higher priority, then the lower id.
//!
//! [`KnowledgeMatcher::top`] ranks prompt references with a looser
//! character-set overlap instead of words.

use std::collections::HashSet;

use crate::knowledge::model::{KnowledgeEntry, KnowledgeSnapshot};
use crate::pipeline::text::normalize;

/// Score for a containment match.
const CONTAINMENT_SCORE: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overlap {
    Words,
    Chars,
}

struct Query {
    folded: String,
    words: HashSet<String>,
    chars: HashSet<char>,
}

impl Query {
    fn new(text: &str) -> Option<Self> {
        let folded = normalize(text);
        if folded.is_empty() {
            return None;
        }
        Some(Self {
            chars: folded.chars().collect(),
            words: words(text),
            folded,
        })
    }
}

/// Pure matcher over a knowledge snapshot.
#[derive(Debug, Clone, Copy)]
pub struct KnowledgeMatcher {
    threshold: f32,
}

impl KnowledgeMatcher {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Best entry for `text`, with its score.
    pub fn find<'a>(
        &self,
        snapshot: &'a KnowledgeSnapshot,
        text: &str,
    ) -> Option<(&'a KnowledgeEntry, f32)> {
        let query = Query::new(text)?;

        let mut best: Option<(&KnowledgeEntry, f32)> = None;
        for entry in snapshot.entries() {
            let score = entry_score(entry, &query, Overlap::Words);
            if score < self.threshold || score <= 0.0 {
                continue;
            }
            best = match best {
                None => Some((entry, score)),
                Some((current, current_score)) => {
                    if outranks(entry, score, current, current_score) {
                        Some((entry, score))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }
        best
    }

    /// Top `limit` entries by character overlap (no threshold), for prompt
    /// context.
    pub fn top<'a>(
        &self,
        snapshot: &'a KnowledgeSnapshot,
        text: &str,
        limit: usize,
    ) -> Vec<(&'a KnowledgeEntry, f32)> {
        let Some(query) = Query::new(text) else {
            return Vec::new();
        };
        let mut scored: Vec<(&KnowledgeEntry, f32)> = snapshot
            .entries()
            .iter()
            .map(|e| (e, entry_score(e, &query, Overlap::Chars)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            if outranks(a.0, a.1, b.0, b.1) {
                std::cmp::Ordering::Less
            } else if outranks(b.0, b.1, a.0, a.1) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        scored.truncate(limit);
        scored
    }
}

fn outranks(a: &KnowledgeEntry, a_score: f32, b: &KnowledgeEntry, b_score: f32) -> bool {
    if a_score != b_score {
        return a_score > b_score;
    }
    if a.priority != b.priority {
        return a.priority > b.priority;
    }
    a.id < b.id
}

fn entry_score(entry: &KnowledgeEntry, query: &Query, overlap: Overlap) -> f32 {
    entry
        .triggers
        .iter()
        .map(|t| trigger_score(t, query, overlap))
        .fold(0.0, f32::max)
}

fn trigger_score(trigger: &str, query: &Query, overlap: Overlap) -> f32 {
    let folded = normalize(trigger);
    if folded.is_empty() {
        return 0.0;
    }
    if folded == query.folded {
        return 1.0;
    }
    if query.folded.contains(&folded) || folded.contains(&query.folded) {
        return CONTAINMENT_SCORE;
    }
    match overlap {
        Overlap::Words => jaccard(&words(trigger), &query.words),
        Overlap::Chars => jaccard(&folded.chars().collect::<HashSet<char>>(), &query.chars),
    }
}

/// Lowercased runs of alphanumeric characters.
fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

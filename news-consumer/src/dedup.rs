use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use news_common::message::RawItem;

/// Scores closer than this are considered equal when picking the best match,
/// so ties fall back to the earliest-seen entry.
const SCORE_EPSILON: f64 = 1e-9;

/// Stopwords are excluded from fingerprints so that boilerplate words do not
/// inflate similarity between unrelated stories.
const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "been", "before", "being", "between", "both", "but", "by", "can", "could", "did", "do", "does",
    "down", "during", "each", "for", "from", "further", "had", "has", "have", "having", "he",
    "her", "here", "him", "his", "how", "if", "in", "into", "is", "it", "its", "just", "more",
    "most", "no", "not", "now", "of", "off", "on", "once", "only", "or", "other", "our", "out",
    "over", "own", "said", "same", "she", "so", "some", "such", "than", "that", "the", "their",
    "them", "then", "there", "these", "they", "this", "those", "through", "to", "too", "under",
    "until", "up", "very", "was", "we", "were", "what", "when", "where", "which", "while", "who",
    "whom", "why", "will", "with", "would", "you", "your",
];

/// The stable identifier of a story: a hex-encoded prefix of the SHA-256 of
/// its link. Hashing the link (unique per producer) is what makes the
/// storage upsert idempotent under redelivery.
pub fn canonical_id(link: &str) -> String {
    let digest = Sha256::digest(link.trim().as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// A sparse token-frequency vector with its precomputed euclidean norm.
#[derive(Debug, Clone, Default)]
struct TermVector {
    weights: HashMap<String, f64>,
    norm: f64,
}

impl TermVector {
    fn build(text: &str) -> TermVector {
        let mut weights: HashMap<String, f64> = HashMap::new();
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1 && !STOP_WORDS.contains(t))
        {
            *weights.entry(token.to_owned()).or_insert(0.0) += 1.0;
        }

        let norm = weights.values().map(|w| w * w).sum::<f64>().sqrt();
        TermVector { weights, norm }
    }

    /// Cosine similarity in [0, 1]. Empty vectors never match anything.
    fn cosine(&self, other: &TermVector) -> f64 {
        if self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }

        // Iterate the smaller map.
        let (small, large) = if self.weights.len() <= other.weights.len() {
            (&self.weights, &other.weights)
        } else {
            (&other.weights, &self.weights)
        };

        let dot: f64 = small
            .iter()
            .filter_map(|(token, weight)| large.get(token).map(|w| w * weight))
            .sum();

        dot / (self.norm * other.norm)
    }
}

/// The comparable representation of an item's text content. Computed outside
/// the index lock; used only for scoring, never persisted.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    title: TermVector,
    description: TermVector,
    pub published_at: DateTime<Utc>,
}

impl Fingerprint {
    pub fn of(item: &RawItem) -> Fingerprint {
        Fingerprint {
            title: TermVector::build(&item.title),
            description: TermVector::build(&item.description),
            published_at: item.published_date,
        }
    }

    /// Combined similarity: the best of the per-field scores, so a story
    /// rewritten with a fresh headline but the same body (or vice versa)
    /// still counts as the same story.
    fn similarity(&self, other: &Fingerprint) -> f64 {
        let title = self.title.cosine(&other.title);
        let description = self.description.cosine(&other.description);
        title.max(description)
    }
}

/// The result of evaluating one item against the window.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// No near-duplicate in the window; a window entry was reserved for
    /// this item under the same lock.
    New { canonical_id: String },
    /// Near-duplicate of an already-seen story.
    Duplicate { canonical_id: String, score: f64 },
}

struct WindowEntry {
    fingerprint: Fingerprint,
    canonical_id: String,
    inserted_at: DateTime<Utc>,
    /// Eviction timeline: publication time clamped to insertion time, so a
    /// producer claiming a future date cannot extend an entry's life.
    effective_at: DateTime<Utc>,
}

/// The time-bounded index of recently seen stories.
///
/// Entries live in hour buckets keyed by their effective timestamp, in a
/// `BTreeMap` so eviction is a cheap range split. One lock guards the whole
/// map: `evaluate` performs evict + scan + insert atomically, which is what
/// prevents two concurrent near-duplicates from both being ruled new.
/// Fingerprinting and everything downstream (classification, persistence)
/// happen outside the lock.
pub struct DedupIndex {
    threshold: f64,
    window: Duration,
    buckets: Mutex<BTreeMap<i64, Vec<WindowEntry>>>,
}

impl DedupIndex {
    pub fn new(threshold: f64, window_hours: u32) -> Self {
        Self {
            threshold,
            window: Duration::hours(i64::from(window_hours)),
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Evaluate an item against all non-evicted entries. A `New` verdict
    /// inserts the item's own entry before the lock is released, reserving
    /// its canonical id against concurrent near-duplicates.
    pub fn evaluate(&self, canonical_id: &str, fingerprint: &Fingerprint) -> Verdict {
        let now = Utc::now();
        let cutoff = now - self.window;

        let mut buckets = self.buckets.lock().expect("poisoned DedupIndex lock");

        // Evict everything older than the window first, so stale entries can
        // never produce a false duplicate.
        *buckets = buckets.split_off(&bucket_of(cutoff));
        if let Some(entries) = buckets.get_mut(&bucket_of(cutoff)) {
            entries.retain(|entry| entry.effective_at >= cutoff);
        }

        let mut best: Option<(f64, &WindowEntry)> = None;
        for entry in buckets.values().flatten() {
            let score = fingerprint.similarity(&entry.fingerprint);
            let better = match best {
                None => score >= self.threshold,
                Some((best_score, best_entry)) => {
                    score > best_score + SCORE_EPSILON
                        || ((score - best_score).abs() <= SCORE_EPSILON
                            && entry.inserted_at < best_entry.inserted_at)
                }
            };
            if better {
                best = Some((score, entry));
            }
        }

        if let Some((score, entry)) = best {
            return Verdict::Duplicate {
                canonical_id: entry.canonical_id.clone(),
                score,
            };
        }

        let effective_at = fingerprint.published_at.min(now);
        buckets
            .entry(bucket_of(effective_at))
            .or_default()
            .push(WindowEntry {
                fingerprint: fingerprint.clone(),
                canonical_id: canonical_id.to_owned(),
                inserted_at: now,
                effective_at,
            });

        Verdict::New {
            canonical_id: canonical_id.to_owned(),
        }
    }

    /// Drop the entry reserved for a canonical id. Used to compensate when
    /// a new item ultimately fails to persist, so the failed reservation
    /// cannot suppress a later copy of the story.
    pub fn remove(&self, canonical_id: &str) {
        let mut buckets = self.buckets.lock().expect("poisoned DedupIndex lock");
        for entries in buckets.values_mut() {
            entries.retain(|entry| entry.canonical_id != canonical_id);
        }
    }

    /// Number of live window entries, for the gauge. Counts evictable
    /// entries until the next evaluation removes them.
    pub fn len(&self) -> usize {
        let buckets = self.buckets.lock().expect("poisoned DedupIndex lock");
        buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn bucket_of(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, description: &str, link: &str, published: DateTime<Utc>) -> RawItem {
        RawItem {
            source: "Example News".to_owned(),
            title: title.to_owned(),
            description: description.to_owned(),
            link: link.to_owned(),
            published_date: published,
            category: None,
            picture: None,
            provider: None,
        }
    }

    fn fingerprint(title: &str, description: &str, published: DateTime<Utc>) -> Fingerprint {
        Fingerprint::of(&item(title, description, "http://example.com/x", published))
    }

    #[test]
    fn canonical_id_is_a_stable_link_hash() {
        let a = canonical_id("http://example.com/news/1");
        let b = canonical_id("http://example.com/news/1");
        let c = canonical_id("http://example.com/news/2");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_text_scores_one() {
        let a = TermVector::build("markets rally on rate cut hopes");
        let b = TermVector::build("markets rally on rate cut hopes");
        assert!((a.cosine(&b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn disjoint_text_scores_zero() {
        let a = TermVector::build("markets rally sharply");
        let b = TermVector::build("festival lineup revealed");
        assert_eq!(a.cosine(&b), 0.0);
    }

    #[test]
    fn partial_overlap_scores_between() {
        // {alpha, beta} vs {alpha, gamma}: dot 1, norms sqrt(2) each.
        let a = TermVector::build("alpha beta");
        let b = TermVector::build("alpha gamma");
        assert!((a.cosine(&b) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_text_never_matches() {
        let a = TermVector::build("");
        let b = TermVector::build("markets rally");
        assert_eq!(a.cosine(&b), 0.0);
        assert_eq!(a.cosine(&a), 0.0);
    }

    #[test]
    fn first_item_is_new_and_near_copy_is_duplicate() {
        let index = DedupIndex::new(0.8, 24);
        let now = Utc::now();

        let original = fingerprint(
            "Prime minister announces new budget plan for 2026",
            "The government presented its budget plan to parliament today",
            now,
        );
        let verdict = index.evaluate("id-original", &original);
        assert_eq!(
            verdict,
            Verdict::New {
                canonical_id: "id-original".to_owned()
            }
        );

        let copy = fingerprint(
            "Prime minister announces new budget plan for schools",
            "The government presented its budget plan to parliament today",
            now,
        );
        match index.evaluate("id-copy", &copy) {
            Verdict::Duplicate {
                canonical_id,
                score,
            } => {
                assert_eq!(canonical_id, "id-original");
                assert!(score >= 0.8);
            }
            verdict => panic!("expected a duplicate, got {:?}", verdict),
        }

        // Only the original reserved an entry.
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn unrelated_item_is_new() {
        let index = DedupIndex::new(0.8, 24);
        let now = Utc::now();

        index.evaluate(
            "id-politics",
            &fingerprint("Prime minister announces budget", "", now),
        );
        let verdict = index.evaluate(
            "id-entertainment",
            &fingerprint("Festival lineup revealed for summer", "", now),
        );

        assert_eq!(
            verdict,
            Verdict::New {
                canonical_id: "id-entertainment".to_owned()
            }
        );
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn score_at_threshold_counts_as_duplicate() {
        // Cosine of "alpha beta" vs "alpha gamma" is exactly 0.5.
        let index = DedupIndex::new(0.5, 24);
        let now = Utc::now();

        index.evaluate("id-a", &fingerprint("alpha beta", "", now));
        let verdict = index.evaluate("id-b", &fingerprint("alpha gamma", "", now));

        assert!(matches!(verdict, Verdict::Duplicate { canonical_id, .. } if canonical_id == "id-a"));
    }

    #[test]
    fn items_outside_the_window_are_new_even_if_identical() {
        let index = DedupIndex::new(0.8, 24);
        let now = Utc::now();
        let thirty_hours_ago = now - Duration::hours(30);

        index.evaluate(
            "id-old",
            &fingerprint("Prime minister unveils budget", "", thirty_hours_ago),
        );
        let verdict = index.evaluate(
            "id-new",
            &fingerprint("Prime minister unveils budget", "", now),
        );

        assert_eq!(
            verdict,
            Verdict::New {
                canonical_id: "id-new".to_owned()
            }
        );
        // The stale entry was evicted during evaluation.
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn future_publication_dates_cannot_pin_entries_in_the_window() {
        let index = DedupIndex::new(0.8, 0);
        let now = Utc::now();

        index.evaluate(
            "id-future",
            &fingerprint("Prime minister unveils budget", "", now + Duration::hours(100)),
        );
        assert_eq!(index.len(), 1);

        // The entry's lifetime follows its insertion time, so with a
        // zero-length window the next evaluation evicts it no matter what
        // date the producer claimed.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let verdict = index.evaluate(
            "id-later",
            &fingerprint("Prime minister unveils budget", "", now),
        );
        assert!(matches!(verdict, Verdict::New { .. }));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn ties_resolve_to_the_earliest_seen_entry() {
        // Both entries score identically against the query; neither matches
        // the other, so both are in the window.
        let index = DedupIndex::new(0.8, 24);
        let now = Utc::now();

        index.evaluate("id-first", &fingerprint("alpha beta", "", now));
        index.evaluate("id-second", &fingerprint("alpha gamma", "", now));

        let verdict = index.evaluate("id-query", &fingerprint("alpha beta gamma", "", now));
        assert!(
            matches!(verdict, Verdict::Duplicate { canonical_id, .. } if canonical_id == "id-first")
        );
    }

    #[test]
    fn removed_reservations_no_longer_match() {
        let index = DedupIndex::new(0.8, 24);
        let now = Utc::now();
        let print = fingerprint("Prime minister unveils budget", "", now);

        index.evaluate("id-failed", &print);
        index.remove("id-failed");
        assert!(index.is_empty());

        let verdict = index.evaluate("id-retry", &print);
        assert_eq!(
            verdict,
            Verdict::New {
                canonical_id: "id-retry".to_owned()
            }
        );
    }
}

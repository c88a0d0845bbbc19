//! Phrase localization over word timestamps

use std::collections::BTreeSet;

use super::{RedactionMode, RedactionSegment, TranscriptWord};

/// Lowercase, drop punctuation, collapse whitespace
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Segments covering every occurrence of every phrase
///
/// Single-word phrases need an exact normalized match. Multi-word phrases
/// compare the joined window of the same number of words by normalized
/// Levenshtein similarity against `fuzzy_threshold`. After a match the scan
/// resumes past the matched words. Result is sorted by start time.
pub fn localize(
    words: &[TranscriptWord],
    phrases: &[String],
    fuzzy_threshold: f64,
    mode: RedactionMode,
) -> Vec<RedactionSegment> {
    // Flattened sequence, skipping tokens that normalize away
    let flat: Vec<(String, &TranscriptWord)> = words
        .iter()
        .map(|w| (normalize(&w.text), w))
        .filter(|(n, _)| !n.is_empty())
        .collect();

    let unique: BTreeSet<String> = phrases
        .iter()
        .map(|p| normalize(p))
        .filter(|p| !p.is_empty())
        .collect();

    let mut segments = Vec::new();
    for phrase in &unique {
        let len = phrase.split_whitespace().count();
        if len > flat.len() {
            continue;
        }
        let mut i = 0;
        while i + len <= flat.len() {
            let window = &flat[i..i + len];
            let matched = if len == 1 {
                window[0].0 == *phrase
            } else {
                let joined = window
                    .iter()
                    .map(|(n, _)| n.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                strsim::normalized_levenshtein(&joined, phrase) >= fuzzy_threshold
            };
            if matched {
                segments.push(RedactionSegment::new(
                    window[0].1.start,
                    window[len - 1].1.end,
                    mode,
                ));
                i += len;
            } else {
                i += 1;
            }
        }
    }

    segments.sort_by(|a, b| {
        a.start_time
            .partial_cmp(&b.start_time)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    segments
}

/// Phrases still present in a transcript
pub fn phrases_found(
    words: &[TranscriptWord],
    phrases: &[String],
    fuzzy_threshold: f64,
) -> Vec<String> {
    phrases
        .iter()
        .filter(|p| {
            !localize(words, std::slice::from_ref(*p), fuzzy_threshold, RedactionMode::None)
                .is_empty()
        })
        .cloned()
        .collect()
}

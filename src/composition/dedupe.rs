//! Shingle-based DRY deduplication (P6): split composed text into
//! paragraphs (or lines, when the text doesn't split into paragraphs),
//! compute overlapping k-word shingle sets, and drop any chunk whose
//! shingles were already seen in a chunk processed later in document order
//! (later layers are higher priority, so scanning runs last-to-first).

use std::collections::HashSet;

/// Overlapping k-word windows of `text`, each window joined back into a
/// normalized string key. Empty for blank or sub-k-word text.
fn shingles(text: &str, k: usize) -> HashSet<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || k == 0 || words.len() < k {
        return HashSet::new();
    }
    words
        .windows(k)
        .map(|window| window.join(" ").to_lowercase())
        .collect()
}

fn split_paragraphs(content: &str) -> Vec<String> {
    content.split("\n\n").map(str::to_owned).collect()
}

/// Drop paragraphs/lines whose shingles are subsumed by later, higher
/// priority content. Shared by the Markdown and Concatenate strategies,
/// scanning from last to first so later layers win ties.
#[must_use]
pub fn dedupe_by_shingles(content: &str, k: usize) -> String {
    let paragraphs = split_paragraphs(content);
    if paragraphs.len() == 1 && paragraphs[0].contains('\n') {
        return dedupe_lines(content, k);
    }
    dedupe_chunks(&paragraphs, k, "\n\n")
}

fn dedupe_lines(content: &str, k: usize) -> String {
    let lines: Vec<String> = content.split('\n').map(str::to_owned).collect();
    dedupe_chunks(&lines, k, "\n")
}

fn dedupe_chunks(chunks: &[String], k: usize, join_with: &str) -> String {
    let mut seen: HashSet<String> = HashSet::new();
    let mut keep = vec![false; chunks.len()];

    for idx in (0..chunks.len()).rev() {
        let trimmed = chunks[idx].trim();
        if trimmed.is_empty() {
            keep[idx] = true;
            continue;
        }
        let chunk_shingles = shingles(trimmed, k);
        if !chunk_shingles.is_empty() && chunk_shingles.iter().any(|s| seen.contains(s)) {
            keep[idx] = false;
        } else {
            keep[idx] = true;
            seen.extend(chunk_shingles);
        }
    }

    chunks
        .iter()
        .zip(keep)
        .filter_map(|(c, k)| k.then_some(c.as_str()))
        .collect::<Vec<_>>()
        .join(join_with)
        .trim()
        .to_owned()
}

/// Keep mask for chunks already ordered by descending priority (the
/// chunk a caller wants to win ties appears first): returns `true` for a
/// chunk whose shingles were not already claimed by an earlier (= higher
/// priority) chunk in `chunks`.
#[must_use]
pub(crate) fn priority_keep_mask(chunks_by_priority: &[&str], k: usize) -> Vec<bool> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut keep = Vec::with_capacity(chunks_by_priority.len());
    for chunk in chunks_by_priority {
        let trimmed = chunk.trim();
        if trimmed.is_empty() {
            keep.push(true);
            continue;
        }
        let chunk_shingles = shingles(trimmed, k);
        if !chunk_shingles.is_empty() && chunk_shingles.iter().any(|s| seen.contains(s)) {
            keep.push(false);
        } else {
            keep.push(true);
            seen.extend(chunk_shingles);
        }
    }
    keep
}

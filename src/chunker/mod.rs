//! C6: chunker (spec §4.2).
//!
//! Splits a document's extracted text into overlapping chunks under one of
//! four selectable strategies (spec §4.2).

use crate::domain::chunk::new_chunk;
use crate::domain::ids::chunk_id;
use crate::domain::{Chunk, ChunkType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    Fixed,
    Sentence,
    Paragraph,
    Adaptive,
}

#[derive(Debug, Clone)]
pub struct Heading {
    pub level: u8,
    pub text: String,
    /// Character offset into the preprocessed text where this heading's
    /// section begins.
    pub start_char: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub max_size: usize,
    pub min_size: usize,
    pub overlap: usize,
}

impl ChunkParams {
    pub fn new(max_size: usize, min_size: usize, overlap: usize) -> Self {
        assert!(overlap <= max_size / 2, "overlap must be <= max_size / 2 (spec §4.2)");
        assert!(min_size <= max_size, "min_size must be <= max_size (spec §4.2)");
        Self { max_size, min_size, overlap }
    }
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self { max_size: 1200, min_size: 200, overlap: 100 }
    }
}

/// Splits `text` into chunks with `doc_id` using `strategy`. `headings` is
/// only consulted by [`ChunkStrategy::Adaptive`].
pub fn chunk_text(doc_id: i64, text: &str, strategy: ChunkStrategy, params: ChunkParams, headings: &[Heading]) -> Vec<Chunk> {
    let spans = match strategy {
        ChunkStrategy::Fixed => fixed_spans(text, params),
        ChunkStrategy::Sentence => sentence_spans(text, params),
        ChunkStrategy::Paragraph => paragraph_spans(text, params),
        ChunkStrategy::Adaptive => adaptive_spans(text, params, headings),
    };

    spans
        .into_iter()
        .enumerate()
        .map(|(index, span)| {
            let slice = &text[span.start..span.end];
            let id = chunk_id(&doc_id.to_string(), index, slice);
            new_chunk(id, doc_id, index, span.start, span.end, slice.to_string(), span.chunk_type, span.section_title, span.heading_level)
        })
        .collect()
}

struct Span {
    start: usize,
    end: usize,
    chunk_type: ChunkType,
    section_title: Option<String>,
    heading_level: Option<u8>,
}

impl Span {
    fn content(start: usize, end: usize) -> Self {
        Self { start, end, chunk_type: ChunkType::Content, section_title: None, heading_level: None }
    }
}

/// *fixed*: slide a window of `max_size` chars with `overlap` chars of
/// overlap between consecutive windows.
fn fixed_spans(text: &str, params: ChunkParams) -> Vec<Span> {
    let len = text.len();
    if len == 0 {
        return Vec::new();
    }
    let mut spans = Vec::new();
    let stride = params.max_size - params.overlap;
    let mut start = 0;
    while start < len {
        let end = (start + params.max_size).min(len);
        spans.push(Span::content(start, end));
        if end == len {
            break;
        }
        start += stride;
    }
    enforce_min_size(spans, params.min_size)
}

/// Merges any span below `min_size` forward into its successor, except the
/// last span in the list (spec §4.2's `minChunkSize` floor binds every
/// chunk but the final, naturally-shorter remainder of a document/section).
fn enforce_min_size(spans: Vec<Span>, min_size: usize) -> Vec<Span> {
    if spans.len() <= 1 || min_size == 0 {
        return spans;
    }
    let mut merged = Vec::with_capacity(spans.len());
    let mut iter = spans.into_iter().peekable();
    while let Some(mut span) = iter.next() {
        while iter.peek().is_some() && (span.end - span.start) < min_size {
            let next = iter.next().unwrap();
            span.end = next.end;
            if span.section_title.is_none() {
                span.section_title = next.section_title;
                span.heading_level = next.heading_level;
            }
        }
        merged.push(span);
    }
    merged
}

/// Byte offsets of sentence boundaries: terminators `. ! ?` (ASCII set;
/// the CJK terminators in spec §4.2 are matched too) followed by whitespace
/// or end-of-input, falling back to `;` + newline, falling back to `,`/`，`
/// + space.
fn sentence_boundaries(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut bounds = Vec::new();
    let primary = ['.', '!', '?', '。', '！', '？'];
    let secondary = [';', '\n'];
    let tertiary = [',', '，'];

    let mut chars: Vec<(usize, char)> = text.char_indices().collect();
    chars.push((bytes.len(), '\0'));

    for window in chars.windows(2) {
        let (idx, ch) = window[0];
        let (_, next) = window[1];
        let boundary_end = idx + ch.len_utf8();
        if primary.contains(&ch) && (next.is_whitespace() || next == '\0') {
            bounds.push(boundary_end);
        }
    }
    if bounds.is_empty() {
        for window in chars.windows(2) {
            let (idx, ch) = window[0];
            let (_, next) = window[1];
            let boundary_end = idx + ch.len_utf8();
            if secondary.contains(&ch) && next != '\0' {
                bounds.push(boundary_end);
            }
        }
    }
    if bounds.is_empty() {
        for window in chars.windows(2) {
            let (idx, ch) = window[0];
            let (_, next) = window[1];
            let boundary_end = idx + ch.len_utf8();
            if tertiary.contains(&ch) && next == ' ' {
                bounds.push(boundary_end);
            }
        }
    }
    if bounds.last() != Some(&bytes.len()) {
        bounds.push(bytes.len());
    }
    bounds
}

/// *sentence*: greedily pack sentences until adding the next would exceed
/// `max_size`; carry tail-most sentences totalling >= `overlap` chars into
/// the next chunk.
fn sentence_spans(text: &str, params: ChunkParams) -> Vec<Span> {
    if text.is_empty() {
        return Vec::new();
    }
    let bounds = sentence_boundaries(text);
    let mut sentence_starts = vec![0usize];
    sentence_starts.extend(bounds.iter().copied());
    let sentences: Vec<(usize, usize)> = sentence_starts.windows(2).map(|w| (w[0], w[1])).filter(|(s, e)| e > s).collect();

    pack_spans(text, &sentences, params)
}

/// *paragraph*: split on blank-line runs; paragraphs longer than
/// `max_size` recurse into sentence-mode.
fn paragraph_spans(text: &str, params: ChunkParams) -> Vec<Span> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut paragraphs = Vec::new();
    let mut pos = 0usize;
    for piece in split_keep_offsets(text, "\n\n") {
        if !piece.1.trim().is_empty() {
            paragraphs.push(piece);
        }
        pos = piece.2;
    }
    let _ = pos;

    let mut units: Vec<(usize, usize)> = Vec::new();
    for (start, slice, end) in &paragraphs {
        if slice.len() > params.max_size {
            let sub = sentence_spans(&text[*start..*end], params);
            units.extend(sub.into_iter().map(|s| (s.start + start, s.end + start)));
        } else {
            units.push((*start, *end));
        }
    }
    pack_spans(text, &units, params)
}

/// *adaptive*: split into sections by heading; short sections become one
/// chunk labelled `section`; long sections are paragraph-chunked and
/// labelled `subsection`, inheriting the section's title/level.
fn adaptive_spans(text: &str, params: ChunkParams, headings: &[Heading]) -> Vec<Span> {
    if headings.is_empty() {
        return paragraph_spans(text, params);
    }
    let mut sorted: Vec<&Heading> = headings.iter().collect();
    sorted.sort_by_key(|h| h.start_char);

    let mut spans = Vec::new();
    for (i, heading) in sorted.iter().enumerate() {
        let start = heading.start_char;
        let end = sorted.get(i + 1).map(|h| h.start_char).unwrap_or(text.len());
        if start >= end {
            continue;
        }
        let section_text = &text[start..end];
        if section_text.len() <= params.max_size {
            spans.push(Span {
                start,
                end,
                chunk_type: ChunkType::Section,
                section_title: Some(heading.text.clone()),
                heading_level: Some(heading.level),
            });
        } else {
            for sub in paragraph_spans(section_text, params) {
                spans.push(Span {
                    start: sub.start + start,
                    end: sub.end + start,
                    chunk_type: ChunkType::Subsection,
                    section_title: Some(heading.text.clone()),
                    heading_level: Some(heading.level),
                });
            }
        }
    }
    enforce_min_size(spans, params.min_size)
}

/// Greedily packs `units` (already-split sentence/paragraph spans) into
/// chunks bounded by `max_size`, carrying tail units worth >= `overlap`
/// chars forward as the next chunk's opening overlap.
fn pack_spans(text: &str, units: &[(usize, usize)], params: ChunkParams) -> Vec<Span> {
    if units.is_empty() {
        return Vec::new();
    }
    let mut spans = Vec::new();
    let mut current_start = units[0].0;
    let mut current_units: Vec<(usize, usize)> = Vec::new();
    let mut current_len = 0usize;

    let flush = |spans: &mut Vec<Span>, start: usize, end: usize| {
        if end > start {
            spans.push(Span::content(start, end));
        }
    };

    for &(u_start, u_end) in units {
        let u_len = u_end - u_start;
        if !current_units.is_empty() && current_len + (u_start - current_units.last().unwrap().1) + u_len > params.max_size {
            let chunk_end = current_units.last().unwrap().1;
            flush(&mut spans, current_start, chunk_end);

            let mut overlap_units = Vec::new();
            let mut overlap_len = 0usize;
            for &unit in current_units.iter().rev() {
                if overlap_len >= params.overlap {
                    break;
                }
                overlap_len += unit.1 - unit.0;
                overlap_units.push(unit);
            }
            overlap_units.reverse();
            current_start = overlap_units.first().map(|u| u.0).unwrap_or(u_start);
            current_units = overlap_units;
            current_len = current_units.iter().map(|u| u.1 - u.0).sum();
        }
        current_units.push((u_start, u_end));
        current_len += u_len;
    }
    if let Some(last) = current_units.last() {
        flush(&mut spans, current_start, last.1);
    }
    let _ = text;
    enforce_min_size(spans, params.min_size)
}

/// Splits `text` on `sep`, returning `(start_offset, slice, end_offset)` for
/// each non-separator piece, offsets measured against the original string.
fn split_keep_offsets<'a>(text: &'a str, sep: &str) -> Vec<(usize, &'a str, usize)> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    for part in text.split(sep) {
        let start = pos;
        let end = start + part.len();
        out.push((start, part, end));
        pos = end + sep.len();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_strategy_respects_overlap_bound() {
        let text = "a".repeat(1000);
        let params = ChunkParams::new(300, 0, 50);
        let chunks = chunk_text(1, &text, ChunkStrategy::Fixed, params, &[]);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_char, pair[0].end_char - params.overlap);
        }
    }

    #[test]
    fn paragraph_strategy_splits_on_blank_lines() {
        let text = "First paragraph here.\n\nSecond paragraph follows.";
        let params = ChunkParams::new(1000, 0, 0);
        let chunks = chunk_text(1, text, ChunkStrategy::Paragraph, params, &[]);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph"));
    }

    #[test]
    fn sentence_strategy_packs_until_size_bound() {
        let text = "One. Two. Three. Four. Five.";
        let params = ChunkParams::new(10, 0, 0);
        let chunks = chunk_text(1, text, ChunkStrategy::Sentence, params, &[]);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content_length() > 0);
        }
    }

    #[test]
    fn adaptive_strategy_labels_short_sections() {
        let text = "# Title\nShort section body.";
        let headings = vec![Heading { level: 1, text: "Title".into(), start_char: 0 }];
        let params = ChunkParams::new(1000, 0, 0);
        let chunks = chunk_text(1, text, ChunkStrategy::Adaptive, params, &headings);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::Section);
        assert_eq!(chunks[0].section_title.as_deref(), Some("Title"));
    }

    #[test]
    fn chunk_ids_are_unique_within_a_document() {
        let text = "a".repeat(1000);
        let params = ChunkParams::new(300, 0, 50);
        let chunks = chunk_text(7, &text, ChunkStrategy::Fixed, params, &[]);
        let ids: std::collections::HashSet<_> = chunks.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), chunks.len());
    }

    #[test]
    fn sentence_strategy_merges_non_final_chunks_below_the_floor() {
        // The middle sentence alone packs to a 3-char chunk, below min_size;
        // it must merge forward into the final chunk rather than stand alone.
        let text = "AAAA. B. CCCCCCCCCC.";
        let params = ChunkParams::new(6, 5, 0);
        let chunks = chunk_text(1, text, ChunkStrategy::Sentence, params, &[]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].end_char, 5);
        assert_eq!(chunks[1].start_char, 5);
        assert_eq!(chunks[1].end_char, text.len());
    }

    proptest::proptest! {
        /// Spec §4.2's `maxChunkSize` bound holds for arbitrary ASCII text
        /// once `min_size` is 0 (no forward merge can push a span past the
        /// window it was sliced from).
        #[test]
        fn fixed_strategy_chunks_never_exceed_max_size(
            text in "[a-zA-Z0-9 .\n]{0,400}",
            max_size in 20usize..200,
            overlap in 0usize..10usize,
        ) {
            let params = ChunkParams::new(max_size, 0, overlap.min(max_size / 2));
            let chunks = chunk_text(1, &text, ChunkStrategy::Fixed, params, &[]);
            for chunk in &chunks {
                proptest::prop_assert!(chunk.content_length() <= max_size);
            }
        }
    }
}

use std::collections::BTreeSet;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::ChunkingSettings;
use crate::error::{RagError, Result};

/// Separator levels in priority order: paragraph, line, sentence, whitespace.
/// Below the last level text is split into single characters.
const SEPARATOR_LEVELS: &[&[&str]] = &[
    &["\n\n"],
    &["\n"],
    // 日本語の句読点も文の区切りとして扱う
    &["。", "？", "！", ". ", "? ", "! "],
    &[" ", "\t"],
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    #[default]
    Chars,
    Words,
}

impl SizeUnit {
    pub fn measure(self, text: &str) -> usize {
        match self {
            SizeUnit::Chars => text.chars().count(),
            SizeUnit::Words => text.split_whitespace().count(),
        }
    }
}

/// A contiguous slice `[start, end)` (byte offsets) of the chunked text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: usize,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    max_size: usize,
    overlap: usize,
    unit: SizeUnit,
}

impl Chunker {
    pub fn new(max_size: usize, overlap: usize, unit: SizeUnit) -> Result<Self> {
        if max_size == 0 {
            return Err(RagError::Config("Chunk max_size must be positive".to_string()));
        }
        if overlap >= max_size {
            return Err(RagError::Config(format!(
                "Chunk overlap ({}) must be smaller than max_size ({})",
                overlap, max_size
            )));
        }
        Ok(Self {
            max_size,
            overlap,
            unit,
        })
    }

    pub fn from_settings(settings: &ChunkingSettings) -> Result<Self> {
        Self::new(settings.max_size, settings.overlap, settings.unit)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into overlapping chunks of at most `max_size` units.
    ///
    /// Every chunk is an exact slice of the input and consecutive chunks
    /// never leave a gap, so [`reconstruct`] gives back the input.
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        if text.is_empty() {
            return Vec::new();
        }

        if self.measure(text) <= self.max_size {
            return vec![TextChunk {
                text: text.to_string(),
                chunk_index: 0,
                start: 0,
                end: text.len(),
            }];
        }

        let mut pieces = Vec::new();
        self.split(text, 0..text.len(), SEPARATOR_LEVELS, &mut pieces);
        self.merge(text, &pieces)
    }

    fn measure(&self, text: &str) -> usize {
        self.unit.measure(text)
    }

    /// Cut `span` at the highest-priority separator present, recursing into
    /// pieces that are still too large.
    fn split(
        &self,
        text: &str,
        span: Range<usize>,
        levels: &[&[&str]],
        out: &mut Vec<Range<usize>>,
    ) {
        let slice = &text[span.clone()];
        if self.measure(slice) <= self.max_size {
            out.push(span);
            return;
        }

        for (depth, separators) in levels.iter().enumerate() {
            let points = split_points(slice, separators);
            if points.is_empty() {
                continue;
            }

            let mut piece_start = 0;
            for point in points.into_iter().chain(std::iter::once(slice.len())) {
                let piece = span.start + piece_start..span.start + point;
                self.split(text, piece, &levels[depth + 1..], out);
                piece_start = point;
            }
            return;
        }

        for (offset, ch) in slice.char_indices() {
            let at = span.start + offset;
            out.push(at..at + ch.len_utf8());
        }
    }

    fn merge(&self, text: &str, pieces: &[Range<usize>]) -> Vec<TextChunk> {
        let mut chunks = Vec::new();
        let mut first = 0;
        let mut start = pieces[0].start;

        loop {
            let mut last = first;
            while last + 1 < pieces.len()
                && self.measure(&text[start..pieces[last + 1].end]) <= self.max_size
            {
                last += 1;
            }

            let end = pieces[last].end;
            chunks.push(TextChunk {
                text: text[start..end].to_string(),
                chunk_index: chunks.len(),
                start,
                end,
            });

            if last + 1 == pieces.len() {
                break;
            }

            let next = self.overlap_start(text, pieces, first, last);
            start = if next <= last {
                skip_whitespace(text, pieces[next].start, end)
            } else {
                pieces[next].start
            };
            first = next;
            while pieces[first].end <= start {
                first += 1;
            }
        }

        chunks
    }

    /// Index of the piece the next chunk starts at: the longest run of
    /// trailing pieces within `overlap` that still leaves room for the piece
    /// after `last`. `last + 1` means no overlap.
    fn overlap_start(&self, text: &str, pieces: &[Range<usize>], first: usize, last: usize) -> usize {
        if self.overlap == 0 {
            return last + 1;
        }

        let chunk_end = pieces[last].end;
        let following_end = pieces[last + 1].end;
        for candidate in first + 1..=last {
            let start = skip_whitespace(text, pieces[candidate].start, chunk_end);
            if self.measure(&text[start..chunk_end]) <= self.overlap
                && self.measure(&text[start..following_end]) <= self.max_size
            {
                return candidate;
            }
        }
        last + 1
    }
}

/// Byte positions inside `slice` where it may be cut. Punctuation stays with
/// the preceding piece, whitespace moves to the following one.
fn split_points(slice: &str, separators: &[&str]) -> BTreeSet<usize> {
    let mut points = BTreeSet::new();
    for separator in separators {
        let keep = separator.trim_end().len();
        for (pos, _) in slice.match_indices(separator) {
            let point = pos + keep;
            if point > 0 && point < slice.len() {
                points.insert(point);
            }
        }
    }
    points
}

fn skip_whitespace(text: &str, from: usize, limit: usize) -> usize {
    text[from..limit]
        .char_indices()
        .find(|(_, ch)| !ch.is_whitespace())
        .map_or(limit, |(offset, _)| from + offset)
}

/// Character-measured chunking with the default separators.
pub fn chunk_text(text: &str, max_size: usize, overlap: usize) -> Result<Vec<TextChunk>> {
    Ok(Chunker::new(max_size, overlap, SizeUnit::Chars)?.chunk(text))
}

/// Concatenate chunks, dropping the bytes each one shares with its
/// predecessor.
pub fn reconstruct(chunks: &[TextChunk]) -> String {
    let mut text = String::new();
    let mut covered = 0usize;
    for chunk in chunks {
        let shared = covered.saturating_sub(chunk.start).min(chunk.text.len());
        text.push_str(&chunk.text[shared..]);
        covered = covered.max(chunk.end);
    }
    text
}

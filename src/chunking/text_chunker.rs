//! Language-aware semantic chunking. Splits on sentence boundaries chosen
//! by a CJK/Latin probe, packs sentences greedily up to the chunk size,
//! then slides a character overlap across chunk boundaries so context
//! survives the cut. All sizes are in characters, not bytes.

use tracing::{debug, warn};

/// Which punctuation set acts as sentence boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageKind {
    Chinese,
    English,
    Mixed,
}

const ZH_BOUNDARIES: &[char] = &['。', '！', '？', '，', '；', '：', '\n'];
const EN_BOUNDARIES: &[char] = &['.', '!', '?', '\n', ';', ':'];

#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(1000, 200, 100)
    }
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize, min_chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            min_chunk_size,
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            warn!("empty text provided to chunker");
            return Vec::new();
        }

        let cleaned = clean_text(text);
        let chunks = self.smart_chunk(&cleaned);
        let chunks = dedup_chunks(chunks);
        let chunks = self.validate_chunks(chunks);

        debug!(
            input_chars = cleaned.chars().count(),
            chunks = chunks.len(),
            "chunking finished"
        );
        chunks
    }

    fn smart_chunk(&self, text: &str) -> Vec<String> {
        if text.chars().count() <= self.chunk_size {
            return vec![text.to_owned()];
        }

        let mut sentences = Vec::new();
        for paragraph in text.split("\n\n") {
            if paragraph.trim().is_empty() {
                continue;
            }
            sentences.extend(split_sentences(paragraph, detect_language(paragraph)));
        }

        // Greedy pack: a sentence that would overflow the current chunk
        // starts the next one instead.
        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for sentence in sentences {
            let sentence_len = sentence.chars().count();
            if current_len + sentence_len > self.chunk_size {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                current_len = sentence_len;
                current = sentence;
            } else {
                current_len += sentence_len;
                current.push_str(&sentence);
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        self.add_overlap(chunks)
    }

    /// Prepend the tail of the previous emitted chunk to each subsequent
    /// chunk. Deliberate duplication: the window keeps boundary context
    /// retrievable from either side of the cut.
    fn add_overlap(&self, chunks: Vec<String>) -> Vec<String> {
        if chunks.len() <= 1 {
            return chunks;
        }

        let mut overlapped: Vec<String> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match overlapped.last() {
                None => overlapped.push(chunk),
                Some(prev) => {
                    let prev_chars = prev.chars().count();
                    let overlap_len = self.chunk_overlap.min(prev_chars / 3);
                    let context: String = prev
                        .chars()
                        .skip(prev_chars.saturating_sub(overlap_len))
                        .collect();
                    overlapped.push(format!("{}{}", context, chunk));
                }
            }
        }
        overlapped
    }

    fn validate_chunks(&self, chunks: Vec<String>) -> Vec<String> {
        let valid = chunks
            .iter()
            .filter(|c| c.trim().chars().count() >= self.min_chunk_size)
            .cloned()
            .collect::<Vec<_>>();

        if valid.is_empty() {
            // Better an undersized chunk than losing the document
            warn!("no chunks met the minimum size, returning all of them");
            return chunks;
        }
        valid
    }
}

/// Normalise newlines, collapse runs of spaces, and squeeze blank-line runs
/// down to a single structural blank line.
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let text = text.replace('\u{0}', "").replace('\u{feff}', "");
    let text = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut spaces = 0usize;
    let mut newlines = 0usize;
    for ch in text.chars() {
        match ch {
            ' ' | '\t' => {
                spaces += 1;
                if spaces == 1 {
                    out.push(' ');
                }
            }
            '\n' => {
                spaces = 0;
                newlines += 1;
                if newlines <= 2 {
                    out.push('\n');
                }
            }
            _ => {
                spaces = 0;
                newlines = 0;
                out.push(ch);
            }
        }
    }
    out.trim().to_owned()
}

pub fn detect_language(sample: &str) -> LanguageKind {
    let chinese = sample
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count();
    let english = sample.chars().filter(|c| c.is_ascii_alphabetic()).count();
    let total = (chinese + english).max(1);

    if chinese * 2 > total {
        LanguageKind::Chinese
    } else if english * 2 > total {
        LanguageKind::English
    } else {
        LanguageKind::Mixed
    }
}

/// Split on sentence boundaries, keeping trailing punctuation with the
/// sentence it closes.
pub fn split_sentences(text: &str, language: LanguageKind) -> Vec<String> {
    let is_boundary = |c: char| match language {
        LanguageKind::Chinese => ZH_BOUNDARIES.contains(&c),
        LanguageKind::English => EN_BOUNDARIES.contains(&c),
        LanguageKind::Mixed => ZH_BOUNDARIES.contains(&c) || EN_BOUNDARIES.contains(&c),
    };

    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if is_boundary(ch) {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_owned());
            }
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_owned());
    }
    sentences
}

fn dedup_chunks(chunks: Vec<String>) -> Vec<String> {
    if chunks.len() <= 1 {
        return chunks;
    }

    let mut seen = std::collections::HashSet::new();
    let mut deduped = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let normalized = chunk
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let hash = blake3::hash(normalized.as_bytes());
        if seen.insert(hash) {
            deduped.push(chunk);
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_yields_no_chunks() {
        let chunker = TextChunker::default();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n  ").is_empty());
    }

    #[test]
    fn test_short_text_is_a_single_chunk() {
        let chunker = TextChunker::new(1000, 200, 10);
        let chunks = chunker.chunk("A short paragraph that fits comfortably.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "A short paragraph that fits comfortably.");
    }

    #[test]
    fn test_fifty_sentences_pack_into_a_handful_of_chunks() {
        // 50 distinct sentences at 100 chars apiece
        let text: String = (0..50)
            .map(|i| format!("第{:02}段{}。", i, "数".repeat(95)))
            .collect();
        assert_eq!(text.chars().count(), 5000);

        let chunker = TextChunker::new(1000, 200, 100);
        let chunks = chunker.chunk(&text);
        assert!(
            (5..=10).contains(&chunks.len()),
            "expected 5..=10 chunks, got {}",
            chunks.len()
        );
    }

    #[test]
    fn test_overlap_prefixes_the_previous_tail() {
        let sentence_a = format!("{}.", "a".repeat(59));
        let sentence_b = format!("{}.", "b".repeat(59));
        let text = format!("{}{}", sentence_a, sentence_b);

        let chunker = TextChunker::new(60, 20, 10);
        let chunks = chunker.chunk(&text);
        assert_eq!(chunks.len(), 2);
        // second chunk carries min(20, 60/3) = 20 chars of the first
        let tail: String = chunks[0].chars().skip(40).collect();
        assert!(chunks[1].starts_with(&tail));
        assert!(chunks[1].ends_with(&sentence_b));
    }

    #[test]
    fn test_duplicate_sentences_are_dropped() {
        let repeated = format!("{}。", "重".repeat(80));
        let text = format!("{}\n\n{}", repeated, repeated);

        let chunker = TextChunker::new(90, 0, 10);
        let chunks = chunker.chunk(&text);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_undersized_residue_is_discarded() {
        let big = format!("{}.", "x".repeat(199));
        let tiny = "ok.";
        let text = format!("{}{}", big.repeat(3), tiny);

        let chunker = TextChunker::new(200, 0, 50);
        let chunks = chunker.chunk(&text);
        assert!(chunks.iter().all(|c| c.chars().count() >= 50));
    }

    #[test]
    fn test_single_oversized_chunk_survives_validation() {
        let text = "tiny";
        let chunker = TextChunker::new(1000, 200, 100);
        let chunks = chunker.chunk(text);
        assert_eq!(chunks, vec!["tiny".to_owned()]);
    }

    #[test]
    fn test_language_probe() {
        assert_eq!(detect_language("这是一个中文句子，完全没有英文。"), LanguageKind::Chinese);
        assert_eq!(detect_language("This is plainly English text."), LanguageKind::English);
        assert_eq!(detect_language("中文混合测试对半 backhand"), LanguageKind::Mixed);
    }

    #[test]
    fn test_sentence_split_keeps_trailing_punctuation() {
        let sentences = split_sentences("One. Two! Three?", LanguageKind::English);
        assert_eq!(sentences, vec!["One.", "Two!", "Three?"]);
    }

    #[test]
    fn test_clean_text_normalises_whitespace() {
        let cleaned = clean_text("a  b\r\nc\n\n\n\nd");
        assert_eq!(cleaned, "a b\nc\n\nd");
    }
}

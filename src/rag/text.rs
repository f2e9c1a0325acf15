//! Keyword tokenisation shared by the reranker and the confidence scorer.
//!
//! Tokens come from whitespace splitting, then each piece is further cut
//! at script boundaries (ASCII alphanumeric runs vs CJK runs) so that
//! mixed strings like `2024年营收` yield both the number and the CJK part.

pub const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "is", "are", "what",
    "的", "是", "了", "在", "和", "这", "个", "有", "什么", "哪", "怎样", "怎么", "如何", "请",
    "帮", "我",
];

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Extract lowercase keyword tokens, stopwords and single-character tokens
/// removed.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();

    fn flush(buf: &mut String, tokens: &mut Vec<String>) {
        if !buf.is_empty() {
            tokens.push(std::mem::take(buf));
        }
    }

    for piece in text.to_lowercase().split_whitespace() {
        let mut current = String::new();
        let mut current_cjk = false;

        for c in piece.chars() {
            if c.is_ascii_alphanumeric() {
                if current_cjk {
                    flush(&mut current, &mut tokens);
                }
                current_cjk = false;
                current.push(c);
            } else if is_cjk(c) {
                if !current_cjk {
                    flush(&mut current, &mut tokens);
                }
                current_cjk = true;
                current.push(c);
            } else {
                // punctuation and anything else breaks the token
                flush(&mut current, &mut tokens);
            }
        }
        flush(&mut current, &mut tokens);
    }

    tokens
        .into_iter()
        .filter(|t| t.chars().count() > 1 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Fraction of `keywords` found (case-insensitive substring) in `text`.
/// Neutral 0.5 when there are no keywords to match.
pub fn keyword_match_ratio(keywords: &[String], text: &str) -> f32 {
    if keywords.is_empty() {
        return 0.5;
    }
    let haystack = text.to_lowercase();
    let matched = keywords.iter().filter(|kw| haystack.contains(kw.as_str())).count();
    (matched as f32 / keywords.len() as f32).min(1.0)
}

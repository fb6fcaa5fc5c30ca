//! BM25 scoring over the dense candidate pool.
//!
//! The corpus here is the handful of passages returned by the vector index
//! for one query, so the index is rebuilt per search; no inverted index is
//! warranted at that size.

use std::collections::HashMap;

const K1: f32 = 1.5;
const B: f32 = 0.75;

/// Unicode-aware tokenizer: CJK ideographs become single-character tokens,
/// ASCII alphanumeric runs are lowered and kept whole, everything else
/// separates.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    for ch in text.chars() {
        if is_cjk(ch) {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            tokens.push(ch.to_string());
        } else if ch.is_alphanumeric() {
            word.extend(ch.to_lowercase());
        } else if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }

    tokens
}

fn is_cjk(ch: char) -> bool {
    matches!(ch, '\u{4e00}'..='\u{9fff}' | '\u{3400}'..='\u{4dbf}' | '\u{f900}'..='\u{faff}')
}

pub struct Bm25 {
    doc_tokens: Vec<Vec<String>>,
    doc_freq: HashMap<String, usize>,
    avg_len: f32,
}

impl Bm25 {
    pub fn fit<S: AsRef<str>>(documents: &[S]) -> Self {
        let doc_tokens: Vec<Vec<String>> = documents
            .iter()
            .map(|doc| tokenize(doc.as_ref()))
            .collect();

        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for tokens in &doc_tokens {
            let mut seen: Vec<&String> = tokens.iter().collect();
            seen.sort();
            seen.dedup();
            for token in seen {
                *doc_freq.entry(token.clone()).or_insert(0) += 1;
            }
        }

        let total: usize = doc_tokens.iter().map(Vec::len).sum();
        let avg_len = if doc_tokens.is_empty() {
            0.0
        } else {
            total as f32 / doc_tokens.len() as f32
        };

        Self {
            doc_tokens,
            doc_freq,
            avg_len,
        }
    }

    /// One score per fitted document; higher is better. All zeros when the
    /// query shares no terms with the corpus.
    pub fn scores(&self, query: &str) -> Vec<f32> {
        let query_tokens = tokenize(query);
        let n = self.doc_tokens.len();
        let mut scores = vec![0.0; n];
        if n == 0 || self.avg_len == 0.0 {
            return scores;
        }

        for token in &query_tokens {
            let Some(&df) = self.doc_freq.get(token) else {
                continue;
            };
            let idf = (((n as f32 - df as f32 + 0.5) / (df as f32 + 0.5)) + 1.0).ln();

            for (i, tokens) in self.doc_tokens.iter().enumerate() {
                let tf = tokens.iter().filter(|t| *t == token).count() as f32;
                if tf == 0.0 {
                    continue;
                }
                let len_norm = 1.0 - B + B * (tokens.len() as f32 / self.avg_len);
                scores[i] += idf * (tf * (K1 + 1.0)) / (tf + K1 * len_norm);
            }
        }

        scores
    }
}

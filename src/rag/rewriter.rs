//! Rule-driven query rewriting applied ahead of retrieval.
//!
//! Broad conceptual queries retrieve poorly against chunked corpora; a
//! rewrite that names the concrete terms the documents actually use fixes
//! the rank. Rules are ordered and the first match replaces the query.

/// A rule fires when the query contains at least one alternative from
/// every marker group.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub requires_all: Vec<Vec<String>>,
    pub replacement: String,
}

impl RewriteRule {
    pub fn new(groups: &[&[&str]], replacement: &str) -> Self {
        Self {
            requires_all: groups
                .iter()
                .map(|alts| alts.iter().map(|s| s.to_string()).collect())
                .collect(),
            replacement: replacement.to_string(),
        }
    }

    fn matches(&self, query: &str) -> bool {
        let lowered = query.to_lowercase();
        self.requires_all
            .iter()
            .all(|alts| alts.iter().any(|marker| lowered.contains(&marker.to_lowercase())))
    }
}

#[derive(Debug, Clone)]
pub struct QueryRewriter {
    rules: Vec<RewriteRule>,
}

impl QueryRewriter {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    /// The shipped lexicon: deep-learning architecture questions expand to
    /// the canonical architecture names found in the corpus.
    pub fn with_default_rules() -> Self {
        Self::new(vec![RewriteRule::new(
            &[
                &["深度学习", "deep learning"],
                &["架构", "architecture"],
            ],
            "CNN RNN Transformer GAN",
        )])
    }

    /// Pure, idempotent: no rule matches its own replacement.
    pub fn rewrite(&self, query: &str) -> String {
        for rule in &self.rules {
            if rule.matches(query) {
                tracing::debug!(original = query, rewritten = %rule.replacement, "query rewritten");
                return rule.replacement.clone();
            }
        }
        query.to_string()
    }
}

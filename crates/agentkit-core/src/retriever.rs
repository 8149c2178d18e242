//! Knowledge Retriever
//!
//! Boundary over a document or vector search backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A ranked context snippet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub text: String,
    pub score: f32,

    /// Where the snippet came from (document id, URI, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Snippet {
    pub fn new(text: impl Into<String>, score: f32) -> Self {
        Self {
            text: text.into(),
            score,
            source: None,
        }
    }
}

/// Search backend contract. An empty result means "no match", not failure.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Up to `top_k` snippets, best first
    async fn query(&self, text: &str, top_k: usize) -> anyhow::Result<Vec<Snippet>>;
}

/// Render snippets as a context block for the model
pub fn render_context(snippets: &[Snippet]) -> Option<String> {
    if snippets.is_empty() {
        return None;
    }
    let mut block = String::from("Relevant context:\n");
    for (i, snippet) in snippets.iter().enumerate() {
        block.push_str(&format!("[{}] {}\n", i + 1, snippet.text.trim()));
    }
    Some(block)
}

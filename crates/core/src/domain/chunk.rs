use serde::{Deserialize, Serialize};

/// A bounded slice of a source document, the unit of retrieval.
///
/// Identity is structural: two chunks with the same content and source are the same chunk.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub source: String,
}

impl Chunk {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self { content: content.into(), source: source.into() }
    }
}

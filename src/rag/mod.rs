pub mod chunker;
pub mod index;
pub mod ingest;
pub mod progress;
pub mod retriever;
pub mod rewriter;
pub mod sparse;

pub use index::{shared_index, SharedIndex, VectorIndex};
pub use progress::{BuildProgress, BuildProgressSnapshot};
pub use retriever::{dedup_by_source, Passage, PassageInput, Retriever, SearchMethod};
pub use rewriter::QueryRewriter;

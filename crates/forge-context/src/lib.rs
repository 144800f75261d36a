//! # forge-context
//!
//! Read-only views of the repository under change, and the retriever that
//! selects the fragments most relevant to a step. Retrieval is best-effort:
//! an empty bundle is a valid answer, never an error.

mod retriever;
mod snapshot;

pub use retriever::ContextRetriever;
pub use snapshot::{DirSnapshot, InMemorySnapshot, RepositorySnapshot};

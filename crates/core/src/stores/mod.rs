pub mod memory;
pub mod opensearch;
pub mod qdrant;

pub use memory::{MemoryRecordStore, MemoryVectorStore};
pub use opensearch::OpenSearchRecordStore;
pub use qdrant::QdrantVectorStore;

pub mod store;

pub use store::{HnswConfig, HnswStore, SearchResult, VectorStoreError};

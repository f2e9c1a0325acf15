pub mod embedder;

pub use embedder::{Embedder, EmbedderError, RemoteEmbedder};

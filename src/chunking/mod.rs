pub mod text_chunker;

pub use text_chunker::TextChunker;

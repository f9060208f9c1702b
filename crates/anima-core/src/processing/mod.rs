pub mod chunker;
pub mod parser;

pub use chunker::{ChunkSpan, Chunker};
pub use parser::{DocumentInput, DocumentParser, ParsedDocument};

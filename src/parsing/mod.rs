//! Multi-language incremental parsing
//!
//! Wraps tree-sitter grammars behind a pooled parser core, and turns parse
//! trees into per-file extraction results via language-specific node-type
//! mapping tables. Content fingerprints (see `hashing`) key the parse cache
//! so unchanged files never reach the parser.

pub mod extractor;
pub mod languages;
pub mod parser_core;

pub use extractor::{EntityExtractor, ExtractionResult};
pub use languages::{LanguageRegistry, LanguageSpec, SupportedLanguage};
pub use parser_core::{ParserCore, PreviousParse, SourceEdit};

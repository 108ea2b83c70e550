// Tree-sitter parser pool
// One parser per language, created lazily on first use and pooled for the
// process lifetime. Incremental reparses go through `parse_incremental`,
// which edits the previous tree so tree-sitter can reuse unchanged subtrees.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tree_sitter::{InputEdit, Parser, Point, Tree};

use crate::errors::CodeGraphError;
use crate::parsing::SupportedLanguage;
use crate::types::Fingerprint;

/// A byte-range replacement applied to a previously parsed source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceEdit {
    pub start_byte: usize,
    pub old_end_byte: usize,
    pub new_end_byte: usize,
}

/// Previous parse retained for incremental re-entry.
#[derive(Clone)]
pub struct PreviousParse {
    pub fingerprint: Fingerprint,
    pub tree: Tree,
    pub source: Vec<u8>,
}

/// Parser pool with a bounded per-path tree cache.
pub struct ParserCore {
    /// Idle parsers per language. A parser is checked out for the duration
    /// of one parse so concurrent files do not serialize on a single lock.
    parsers: Mutex<HashMap<SupportedLanguage, Vec<Parser>>>,
    /// Most recent parse per path, for incremental edits.
    trees: Mutex<HashMap<PathBuf, PreviousParse>>,
    max_file_size: u64,
    max_cached_trees: usize,
}

impl ParserCore {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            parsers: Mutex::new(HashMap::new()),
            trees: Mutex::new(HashMap::new()),
            max_file_size,
            max_cached_trees: 256,
        }
    }

    /// Parse source bytes for a language.
    ///
    /// Fails with `FileTooLarge` past the configured cap and
    /// `UnsupportedLanguage` when no grammar is registered. Wall-clock parse
    /// timeouts are enforced by the caller, which runs this on a blocking
    /// thread under `tokio::time::timeout`.
    pub fn parse(&self, path: &Path, source: &[u8], language: SupportedLanguage) -> Result<Tree> {
        self.check_size(path, source.len() as u64)?;
        self.with_parser(language, |parser| {
            parser.parse(source, None).ok_or_else(|| {
                CodeGraphError::ParseFailed {
                    path: path.to_path_buf(),
                    reason: "tree-sitter returned no tree".to_string(),
                }
                .into()
            })
        })
    }

    /// Reparse after an ordered list of byte-range edits.
    ///
    /// The previous tree is edited first so tree-sitter can reuse unchanged
    /// subtrees; for localized changes this is strictly cheaper than a cold
    /// parse.
    pub fn parse_incremental(
        &self,
        path: &Path,
        prev_tree: &Tree,
        prev_source: &[u8],
        edits: &[SourceEdit],
        new_source: &[u8],
        language: SupportedLanguage,
    ) -> Result<Tree> {
        self.check_size(path, new_source.len() as u64)?;

        let mut edited = prev_tree.clone();
        for edit in edits {
            edited.edit(&InputEdit {
                start_byte: edit.start_byte,
                old_end_byte: edit.old_end_byte,
                new_end_byte: edit.new_end_byte,
                start_position: point_at(prev_source, edit.start_byte),
                old_end_position: point_at(prev_source, edit.old_end_byte),
                new_end_position: point_at(new_source, edit.new_end_byte),
            });
        }

        self.with_parser(language, |parser| {
            parser.parse(new_source, Some(&edited)).ok_or_else(|| {
                CodeGraphError::ParseFailed {
                    path: path.to_path_buf(),
                    reason: "incremental reparse returned no tree".to_string(),
                }
                .into()
            })
        })
    }

    /// Remember a parse for later incremental re-entry.
    pub fn remember(&self, path: &Path, parse: PreviousParse) {
        let mut trees = self.trees.lock();
        if trees.len() >= self.max_cached_trees && !trees.contains_key(path) {
            // Evict an arbitrary entry; the tree cache is an optimization,
            // not a correctness requirement.
            if let Some(key) = trees.keys().next().cloned() {
                trees.remove(&key);
            }
        }
        trees.insert(path.to_path_buf(), parse);
    }

    /// Previous parse for a path, if still cached.
    pub fn previous(&self, path: &Path) -> Option<PreviousParse> {
        self.trees.lock().get(path).cloned()
    }

    pub fn forget(&self, path: &Path) {
        self.trees.lock().remove(path);
    }

    fn check_size(&self, path: &Path, size: u64) -> Result<()> {
        if size > self.max_file_size {
            return Err(CodeGraphError::FileTooLarge {
                path: path.to_path_buf(),
                size,
                limit: self.max_file_size,
            }
            .into());
        }
        Ok(())
    }

    fn with_parser<T>(
        &self,
        language: SupportedLanguage,
        f: impl FnOnce(&mut Parser) -> Result<T>,
    ) -> Result<T> {
        let mut parser = match self.parsers.lock().get_mut(&language).and_then(Vec::pop) {
            Some(parser) => parser,
            None => {
                let grammar = language
                    .tree_sitter_language()
                    .with_context(|| format!("loading grammar for {language}"))?;
                let mut parser = Parser::new();
                parser
                    .set_language(&grammar)
                    .with_context(|| format!("configuring parser for {language}"))?;
                parser
            }
        };

        let result = f(&mut parser);
        self.parsers.lock().entry(language).or_default().push(parser);
        result
    }
}

/// Row/column position of a byte offset. Columns are byte offsets within the
/// line, matching tree-sitter's convention.
fn point_at(source: &[u8], byte: usize) -> Point {
    let byte = byte.min(source.len());
    let mut row = 0usize;
    let mut line_start = 0usize;
    for (i, b) in source[..byte].iter().enumerate() {
        if *b == b'\n' {
            row += 1;
            line_start = i + 1;
        }
    }
    Point {
        row,
        column: byte - line_start,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::as_codegraph_error;

    #[test]
    fn parses_python() -> Result<()> {
        let core = ParserCore::new(1024 * 1024);
        let tree = core.parse(
            Path::new("sample.py"),
            b"def add(a, b):\n    return a + b\n",
            SupportedLanguage::Python,
        )?;
        assert_eq!(tree.root_node().kind(), "module");
        assert!(!tree.root_node().has_error());
        Ok(())
    }

    #[test]
    fn rejects_oversized_input() {
        let core = ParserCore::new(16);
        let err = core
            .parse(
                Path::new("big.py"),
                b"x = 1  # well beyond sixteen bytes",
                SupportedLanguage::Python,
            )
            .unwrap_err();
        assert_eq!(as_codegraph_error(&err).unwrap().code(), "FILE_TOO_LARGE");
    }

    #[test]
    fn incremental_reparse_matches_cold_parse() -> Result<()> {
        let core = ParserCore::new(1024 * 1024);
        let path = Path::new("lib.py");
        let old = b"def add(a, b):\n    return a + b\n".to_vec();
        let tree = core.parse(path, &old, SupportedLanguage::Python)?;

        let mut new = old.clone();
        let appended = b"\ndef sub(a, b):\n    return a - b\n";
        new.extend_from_slice(appended);

        let edit = SourceEdit {
            start_byte: old.len(),
            old_end_byte: old.len(),
            new_end_byte: new.len(),
        };
        let incremental =
            core.parse_incremental(path, &tree, &old, &[edit], &new, SupportedLanguage::Python)?;
        let cold = core.parse(path, &new, SupportedLanguage::Python)?;

        assert_eq!(
            incremental.root_node().to_sexp(),
            cold.root_node().to_sexp()
        );
        Ok(())
    }

    #[test]
    fn point_computation() {
        let source = b"abc\ndef\nxy";
        assert_eq!(point_at(source, 0), Point { row: 0, column: 0 });
        assert_eq!(point_at(source, 3), Point { row: 0, column: 3 });
        assert_eq!(point_at(source, 4), Point { row: 1, column: 0 });
        assert_eq!(point_at(source, 9), Point { row: 2, column: 1 });
    }

    #[test]
    fn tree_cache_round_trip() -> Result<()> {
        let core = ParserCore::new(1024 * 1024);
        let path = Path::new("cached.py");
        let source = b"x = 1\n".to_vec();
        let tree = core.parse(path, &source, SupportedLanguage::Python)?;
        core.remember(
            path,
            PreviousParse {
                fingerprint: Fingerprint(42),
                tree,
                source: source.clone(),
            },
        );
        let prev = core.previous(path).expect("cached parse");
        assert_eq!(prev.fingerprint, Fingerprint(42));
        assert_eq!(prev.source, source);
        core.forget(path);
        assert!(core.previous(path).is_none());
        Ok(())
    }
}

// Validated Types for the code graph
// Strongly-typed identifiers and records that cannot be constructed with
// invalid data. Entity and file identifiers are deterministic functions of
// their inputs so that independent indexing runs agree on every ID.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use xxhash_rust::xxh3::Xxh3;

use crate::parsing::SupportedLanguage;

/// Kind of indexed code entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Function,
    Method,
    Class,
    Interface,
    Type,
    Variable,
    Constant,
    Import,
    Export,
    Macro,
    Struct,
    Union,
    Enum,
    Namespace,
    Module,
    Field,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Function => "function",
            EntityKind::Method => "method",
            EntityKind::Class => "class",
            EntityKind::Interface => "interface",
            EntityKind::Type => "type",
            EntityKind::Variable => "variable",
            EntityKind::Constant => "constant",
            EntityKind::Import => "import",
            EntityKind::Export => "export",
            EntityKind::Macro => "macro",
            EntityKind::Struct => "struct",
            EntityKind::Union => "union",
            EntityKind::Enum => "enum",
            EntityKind::Namespace => "namespace",
            EntityKind::Module => "module",
            EntityKind::Field => "field",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "function" => Some(EntityKind::Function),
            "method" => Some(EntityKind::Method),
            "class" => Some(EntityKind::Class),
            "interface" => Some(EntityKind::Interface),
            "type" => Some(EntityKind::Type),
            "variable" => Some(EntityKind::Variable),
            "constant" => Some(EntityKind::Constant),
            "import" => Some(EntityKind::Import),
            "export" => Some(EntityKind::Export),
            "macro" => Some(EntityKind::Macro),
            "struct" => Some(EntityKind::Struct),
            "union" => Some(EntityKind::Union),
            "enum" => Some(EntityKind::Enum),
            "namespace" => Some(EntityKind::Namespace),
            "module" => Some(EntityKind::Module),
            "field" => Some(EntityKind::Field),
            _ => None,
        }
    }

    /// Kinds that open a new naming scope for entities nested inside them.
    pub fn is_scope(&self) -> bool {
        matches!(
            self,
            EntityKind::Function
                | EntityKind::Method
                | EntityKind::Class
                | EntityKind::Interface
                | EntityKind::Struct
                | EntityKind::Union
                | EntityKind::Enum
                | EntityKind::Namespace
                | EntityKind::Module
        )
    }

    /// Kinds that can be the source of a `calls` relationship.
    pub fn is_callable(&self) -> bool {
        matches!(self, EntityKind::Function | EntityKind::Method)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of directed relationship between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Calls,
    Imports,
    Extends,
    Implements,
    References,
    Contains,
    Overrides,
    Instantiates,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Calls => "calls",
            RelationKind::Imports => "imports",
            RelationKind::Extends => "extends",
            RelationKind::Implements => "implements",
            RelationKind::References => "references",
            RelationKind::Contains => "contains",
            RelationKind::Overrides => "overrides",
            RelationKind::Instantiates => "instantiates",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "calls" => Some(RelationKind::Calls),
            "imports" => Some(RelationKind::Imports),
            "extends" => Some(RelationKind::Extends),
            "implements" => Some(RelationKind::Implements),
            "references" => Some(RelationKind::References),
            "contains" => Some(RelationKind::Contains),
            "overrides" => Some(RelationKind::Overrides),
            "instantiates" => Some(RelationKind::Instantiates),
            _ => None,
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Source span of an entity or relationship site.
/// Lines are 1-based, columns and byte offsets 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start_line: u32,
    pub start_column: u32,
    pub start_byte: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub end_byte: u32,
}

impl Span {
    pub fn line_count(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line) + 1
    }
}

/// Content fingerprint: XXH3-128 over file bytes, language tag and the
/// grammar/extractor version constants. Used verbatim as the parse-cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u128);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Identifier of an indexed file, derived from its canonical path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(Uuid);

impl FileId {
    /// Derive the file ID from a path. The same path always yields the same ID.
    pub fn from_path(path: &Path) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(path.to_string_lossy().as_bytes());
        FileId(Uuid::from_u128(hasher.digest128()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an indexed entity.
///
/// Deterministic function of (file path, kind, qualified name, start byte):
/// two independent indexing runs over identical input produce identical IDs,
/// and an entity keeps its ID across edits that do not move its declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    pub fn new(path: &Path, kind: EntityKind, qualified_name: &str, start_byte: u32) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(&[0xff]);
        hasher.update(kind.as_str().as_bytes());
        hasher.update(&[0xff]);
        hasher.update(qualified_name.as_bytes());
        hasher.update(&[0xff]);
        hasher.update(&start_byte.to_le_bytes());
        EntityId(Uuid::from_u128(hasher.digest128()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)?;
        ensure!(!uuid.is_nil(), "Entity ID cannot be the nil UUID");
        Ok(EntityId(uuid))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One declared parameter of a function or method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub type_hint: Option<String>,
    pub default_value: Option<String>,
    /// `*args` / `**kwargs` / `...rest` style forms.
    pub variadic: bool,
}

/// An indexed code entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub file_id: FileId,
    pub file_path: PathBuf,
    pub kind: EntityKind,
    pub name: String,
    pub qualified_name: String,
    pub language: SupportedLanguage,
    pub span: Span,
    /// Lowercased modifier tokens present on the declaration, e.g. `async`,
    /// `static`, `public`. A BTreeSet keeps serialization deterministic.
    pub modifiers: BTreeSet<String>,
    pub parameters: Vec<Parameter>,
    pub return_type: Option<String>,
    /// Enclosing named entity (class for methods, outer function for nested
    /// functions), if any.
    pub parent_id: Option<EntityId>,
    pub doc_comment: Option<String>,
    /// Bounded source snippet used for embeddings and clone detection.
    pub snippet: String,
    /// AST node count of the body, a cyclomatic-complexity proxy.
    pub complexity: u32,
    /// Fingerprint of the file content this entity was extracted from.
    pub fingerprint: Fingerprint,
}

impl Entity {
    /// Hash of the snippet text; embeddings are invalidated when this changes.
    pub fn snippet_hash(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.snippet.as_bytes())
    }
}

/// Target endpoint of a relationship: either a resolved entity or a name
/// string awaiting resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelTarget {
    Entity(EntityId),
    Name(String),
}

impl RelTarget {
    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            RelTarget::Entity(id) => Some(*id),
            RelTarget::Name(_) => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            RelTarget::Entity(_) => None,
            RelTarget::Name(name) => Some(name),
        }
    }
}

/// A directed, typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: EntityId,
    pub target: RelTarget,
    pub kind: RelationKind,
    /// File the relationship was extracted from.
    pub file_id: FileId,
    pub span: Option<Span>,
}

/// Record of an indexed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub path: PathBuf,
    pub language: SupportedLanguage,
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

/// A query limit that is guaranteed to be positive and bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedLimit(usize);

impl ValidatedLimit {
    pub const MAX: usize = 10_000;

    pub fn new(limit: usize) -> Result<Self> {
        ensure!(limit > 0, "Limit must be positive");
        ensure!(limit <= Self::MAX, "Limit must be <= {}", Self::MAX);
        Ok(Self(limit))
    }

    pub fn with_default(limit: Option<usize>, default: usize) -> Result<Self> {
        Self::new(limit.unwrap_or(default))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

/// A traversal depth that is guaranteed to be at least 1 and bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedDepth(usize);

impl ValidatedDepth {
    pub const MAX: usize = 10;

    pub fn new(depth: usize) -> Result<Self> {
        ensure!(depth >= 1, "Depth must be >= 1");
        ensure!(depth <= Self::MAX, "Depth must be <= {}", Self::MAX);
        Ok(Self(depth))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

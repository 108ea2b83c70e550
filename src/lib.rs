// CodeGraph - A code intelligence graph with semantic search
// Root library module

pub mod analysis;
pub mod bus;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod graph_store;
pub mod hashing;
pub mod observability;
pub mod parse_cache;
pub mod resources;
pub mod task_queue;
pub mod types;
pub mod vector_store;
pub mod wal;

// Multi-language parsing and extraction
pub mod parsing;

// Agent pool and orchestration
pub mod agents;

// MCP tool surface
pub mod mcp;

// Re-export key types
pub use observability::{init_logging, init_logging_with_level, MetricsSnapshot};

pub use config::{ServerConfig, VectorBackendKind};

pub use errors::{exit_codes, CodeGraphError};

pub use types::{
    Entity, EntityId, EntityKind, FileId, FileRecord, Fingerprint, Parameter, RelTarget,
    RelationKind, Relationship, Span, ValidatedDepth, ValidatedLimit,
};

pub use parsing::{
    EntityExtractor, ExtractionResult, LanguageRegistry, ParserCore, SupportedLanguage,
};

pub use graph_store::{GraphStats, GraphStore, WriteSet, WriteStats, SCHEMA_VERSION};

pub use vector_store::{cosine_similarity, VectorFilter, VectorMeta, VectorStore};

pub use parse_cache::ParseCache;

pub use bus::{topics, BusEvent, BusPayload, KnowledgeBus};

pub use resources::{ResourceLease, ResourceLimits, ResourceManager, ResourceRequest};

pub use task_queue::{EnqueuePolicy, Task, TaskKind, TaskPayload, TaskQueue};

pub use embeddings::{BackoffEmbedder, EmbeddingConfig, EmbeddingProvider, HashEmbeddingProvider};

pub use agents::{
    AgentKind, AgentRegistry, Conductor, IndexReport, IndexerAgent, ParserAgent, QueryAgent,
    SemanticAgent,
};

pub use mcp::MCPServer;

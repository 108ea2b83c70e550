// Server configuration
// Established once at startup from environment variables and immutable
// thereafter. Runtime tuning goes through the documented reconfiguration
// paths on the affected components (e.g. ParseCache::resize), never through
// this struct.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which nearest-neighbour backend the vector store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackendKind {
    /// Portable linear scan. Exact, adequate up to ~10^4 vectors.
    Flat,
    /// HNSW-style accelerated graph search.
    Hnsw,
}

/// Complete server configuration with documented defaults.
///
/// Environment variables (all optional):
/// - `MAX_PARSER_AGENTS`: parser worker count (default 2)
/// - `MAX_QUERY_AGENTS`: query worker count (default 2)
/// - `MEMORY_LIMIT_MB`: resource-manager memory ceiling (default 1024)
/// - `VECTOR_BACKEND`: `flat` or `hnsw` (default `hnsw`)
/// - `DISABLE_VECTOR_ACCEL`: force the flat backend (default false)
/// - `CODEGRAPH_DATA_DIR`: persisted state location (default `.codegraph`)
/// - `LOG_LEVEL`: tracing filter (see observability)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub max_parser_agents: usize,
    pub max_query_agents: usize,
    pub memory_limit_mb: u64,
    pub vector_backend: VectorBackendKind,
    pub disable_vector_accel: bool,
    /// Maximum parseable file size in bytes (default 1 MiB).
    pub max_file_size: u64,
    /// Parse-cache memory budget in bytes (default 100 MiB).
    pub parse_cache_bytes: usize,
    /// Bounded task queue capacity (default 100).
    pub task_queue_capacity: usize,
    /// Files per parse batch (default 8).
    pub parse_batch_size: usize,
    /// Embedding vector dimension (default 384).
    pub embedding_dimension: usize,
    /// Per-file parse timeout (default 30 s).
    pub parse_timeout: Duration,
    /// Per-embedding timeout (default 10 s).
    pub embed_timeout: Duration,
    /// Per-request timeout (default 60 s).
    pub request_timeout: Duration,
    /// Ceiling on concurrently running CPU-bound tasks
    /// (default `min(cores, 5)`).
    pub max_parallel_tasks: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".codegraph"),
            max_parser_agents: 2,
            max_query_agents: 2,
            memory_limit_mb: 1024,
            vector_backend: VectorBackendKind::Hnsw,
            disable_vector_accel: false,
            max_file_size: 1024 * 1024,
            parse_cache_bytes: 100 * 1024 * 1024,
            task_queue_capacity: 100,
            parse_batch_size: 8,
            embedding_dimension: 384,
            parse_timeout: Duration::from_secs(30),
            embed_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            max_parallel_tasks: num_cpus::get().min(5),
        }
    }
}

impl ServerConfig {
    /// Build the configuration from the environment, falling back to the
    /// documented defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_usize("MAX_PARSER_AGENTS") {
            config.max_parser_agents = n.clamp(1, 32);
        }
        if let Some(n) = env_usize("MAX_QUERY_AGENTS") {
            config.max_query_agents = n.clamp(1, 32);
        }
        if let Some(mb) = env_u64("MEMORY_LIMIT_MB") {
            config.memory_limit_mb = mb.max(64);
        }
        if let Ok(backend) = std::env::var("VECTOR_BACKEND") {
            match backend.to_lowercase().as_str() {
                "flat" | "linear" => config.vector_backend = VectorBackendKind::Flat,
                "hnsw" => config.vector_backend = VectorBackendKind::Hnsw,
                other => {
                    tracing::warn!(backend = other, "unknown VECTOR_BACKEND, keeping default")
                }
            }
        }
        if let Some(flag) = env_bool("DISABLE_VECTOR_ACCEL") {
            config.disable_vector_accel = flag;
        }
        if let Ok(dir) = std::env::var("CODEGRAPH_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        config
    }

    /// Backend actually in effect once the accel kill-switch is applied.
    pub fn effective_vector_backend(&self) -> VectorBackendKind {
        if self.disable_vector_accel {
            VectorBackendKind::Flat
        } else {
            self.vector_backend
        }
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }

    pub fn graph_dir(&self) -> PathBuf {
        self.data_dir.join("graph")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

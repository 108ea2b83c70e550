// Conductor
// Pure orchestrator over the agent pool: it classifies external requests,
// fans complex ones out as queued tasks, waits for completion events on the
// bus, and composes the final response including per-file sub-failures. It
// never parses, indexes, or embeds anything itself. Per-request timeouts
// and cancellation propagate to every task it spawns.

use anyhow::{Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::agents::{
    AgentHealth, AgentKind, AgentRegistry, IndexerAgent, ParserAgent, QueryAgent, SemanticAgent,
};
use crate::bus::{topics, BusPayload, KnowledgeBus};
use crate::config::ServerConfig;
use crate::embeddings::{BackoffEmbedder, EmbeddingConfig, EmbeddingProvider, HashEmbeddingProvider};
use crate::errors::CodeGraphError;
use crate::graph_store::{GraphStats, GraphStore};
use crate::observability::MetricsSnapshot;
use crate::parse_cache::ParseCache;
use crate::parsing::{LanguageRegistry, ParserCore};
use crate::resources::{ResourceLimits, ResourceManager, ResourceUtilization};
use crate::task_queue::{priority, EnqueuePolicy, Task, TaskKind, TaskPayload, TaskQueue};
use crate::vector_store::VectorStore;

/// Directories never worth indexing.
const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    "target",
];

/// One failed file inside an otherwise successful request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexError {
    pub file: PathBuf,
    pub message: String,
}

/// Result of an `index` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexReport {
    pub files_indexed: usize,
    pub files_removed: usize,
    /// Total entities in the store after the request.
    pub entities: usize,
    /// Entities actually inserted or updated by this request; zero when
    /// nothing changed.
    pub entities_written: usize,
    pub duration_ms: u64,
    pub errors: Vec<IndexError>,
}

/// Full metrics view composed for `get_metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub counters: MetricsSnapshot,
    pub resources: ResourceUtilization,
    pub graph: GraphStats,
    pub vectors: usize,
    pub vector_backend: String,
    pub parse_cache_entries: usize,
    pub parse_cache_bytes: usize,
    pub queue_depth: usize,
    pub agents: Vec<AgentHealth>,
}

/// Owns the stores, the bus, the queue, and the agent registry.
pub struct Conductor {
    config: ServerConfig,
    bus: Arc<KnowledgeBus>,
    queue: Arc<TaskQueue>,
    cache: Arc<ParseCache>,
    graph: Arc<GraphStore>,
    vectors: Arc<VectorStore>,
    query_agent: Arc<QueryAgent>,
    registry: AgentRegistry,
    resources: ResourceManager,
    /// Bounds concurrent query execution to `MAX_QUERY_AGENTS`.
    query_permits: Arc<tokio::sync::Semaphore>,
    shutdown_token: CancellationToken,
}

impl Conductor {
    /// Wire up the full pipeline from configuration. Storage failures here
    /// are fatal to startup.
    pub fn build(config: ServerConfig) -> Result<Self> {
        let bus = Arc::new(KnowledgeBus::new(256));
        let queue = Arc::new(TaskQueue::new(config.task_queue_capacity));
        let cache = Arc::new(ParseCache::new(config.parse_cache_bytes));
        let parser_core = Arc::new(ParserCore::new(config.max_file_size));

        let graph = Arc::new(
            GraphStore::open(&config.graph_dir()).context("opening graph store")?,
        );
        let vectors = Arc::new(
            VectorStore::open(
                &config.vector_dir(),
                config.embedding_dimension,
                config.effective_vector_backend(),
            )
            .context("opening vector store")?,
        );

        // Warm the parse cache from the last snapshot, if compatible.
        let cache_snapshot = config.cache_dir().join("parse_cache.bin");
        if let Err(e) = cache.load_snapshot(&cache_snapshot) {
            warn!(error = %e, "parse cache snapshot ignored");
        }

        let resources = ResourceManager::new(ResourceLimits::new(
            config.memory_limit_bytes(),
            config.max_parallel_tasks,
        ));
        resources.attach_bus(Arc::clone(&bus));

        let provider: Arc<dyn EmbeddingProvider> = Arc::new(BackoffEmbedder::new(
            HashEmbeddingProvider::new(EmbeddingConfig {
                dimension: config.embedding_dimension,
                ..EmbeddingConfig::default()
            }),
            3,
            Duration::from_millis(100),
        ));

        let parser_agent = ParserAgent::new(
            Arc::clone(&parser_core),
            Arc::clone(&cache),
            Arc::clone(&bus),
            resources.clone(),
            Arc::clone(&queue),
            config.max_parser_agents,
            config.parse_timeout,
        );
        let indexer_agent = IndexerAgent::new(Arc::clone(&graph), Arc::clone(&bus));
        let semantic_agent = SemanticAgent::new(
            Arc::clone(&graph),
            Arc::clone(&vectors),
            Arc::clone(&provider),
            Arc::clone(&bus),
            config.embed_timeout,
        );
        let query_agent = QueryAgent::new(Arc::clone(&graph), Arc::clone(&vectors), provider);

        let mut registry = AgentRegistry::new();
        registry.register(AgentKind::Parser, parser_agent);
        registry.register(AgentKind::Indexer, indexer_agent);
        registry.register(AgentKind::Semantic, semantic_agent);
        let query_for_registry: Arc<QueryAgent> = Arc::clone(&query_agent);
        registry.register(AgentKind::Query, query_for_registry);

        let query_permits = Arc::new(tokio::sync::Semaphore::new(config.max_query_agents));
        Ok(Self {
            config,
            bus,
            queue,
            cache,
            graph,
            vectors,
            query_agent,
            registry,
            resources,
            query_permits,
            shutdown_token: CancellationToken::new(),
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.registry.start_all().await?;
        self.spawn_cache_evictor();
        info!("conductor started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_token.cancel();
        self.queue.close();
        self.registry.stop_all().await?;
        self.bus.shutdown();

        // Best-effort persistence on the way out.
        if let Err(e) = self.graph.snapshot() {
            warn!(error = %e, "graph snapshot on shutdown failed");
        }
        let cache_snapshot = self.config.cache_dir().join("parse_cache.bin");
        if let Err(e) = self.cache.save_snapshot(&cache_snapshot) {
            warn!(error = %e, "parse cache snapshot on shutdown failed");
        }
        info!("conductor stopped");
        Ok(())
    }

    pub fn query_agent(&self) -> Arc<QueryAgent> {
        Arc::clone(&self.query_agent)
    }

    pub fn graph(&self) -> Arc<GraphStore> {
        Arc::clone(&self.graph)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run a simple (single-agent, synchronous) request under the
    /// per-request timeout and the query-concurrency cap.
    pub async fn with_request_timeout<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let guarded = async {
            let _permit = self
                .query_permits
                .acquire()
                .await
                .map_err(|_| CodeGraphError::Cancelled)?;
            fut.await
        };
        match tokio::time::timeout(self.config.request_timeout, guarded).await {
            Ok(result) => result,
            Err(_) => {
                self.bus.publish(crate::bus::BusEvent {
                    topic: topics::TELEMETRY,
                    key: Some(operation.to_string()),
                    payload: BusPayload::Telemetry {
                        name: "request_timeout",
                        value: self.config.request_timeout.as_millis() as u64,
                    },
                });
                Err(CodeGraphError::Timeout {
                    operation: operation.to_string(),
                    ms: self.config.request_timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// The complex request: enumerate the tree, fan parse batches out to
    /// the parser pool, watch the bus until every file is accounted for,
    /// and compose the report. Failed files appear in `errors` without
    /// failing the request.
    pub async fn index_directory(
        &self,
        directory: &Path,
        incremental: bool,
        exclude_patterns: &[String],
    ) -> Result<IndexReport> {
        let start = Instant::now();
        if !directory.is_dir() {
            return Err(CodeGraphError::InvalidPath(format!(
                "{} is not a directory",
                directory.display()
            ))
            .into());
        }

        let excludes = compile_excludes(exclude_patterns)?;
        let files = enumerate_source_files(directory, &excludes);
        let removed = self.sweep_removed_files(directory, &files);
        info!(
            files = files.len(),
            removed = removed.len(),
            incremental,
            "index request"
        );

        // Subscribe before enqueueing so no completion can be missed.
        let completion = self.bus.subscribe_with_capacity(
            &[topics::INDEX_COMPLETE, topics::PARSE_FAILED],
            (files.len() + removed.len()).max(64) * 2,
        );

        let request_token = self.shutdown_token.child_token();
        let mut pending: HashSet<PathBuf> = files.iter().cloned().collect();
        let mut pending_removals: HashSet<PathBuf> = removed.iter().cloned().collect();

        if !removed.is_empty() {
            let task = Task::new(
                TaskKind::RemoveFiles,
                priority::INDEXING,
                TaskPayload::RemoveFiles {
                    files: removed.clone(),
                },
            )
            .with_cancel(request_token.child_token());
            self.queue.enqueue(task, EnqueuePolicy::Block).await?;
        }
        for chunk in files.chunks(self.config.parse_batch_size.max(1)) {
            let task = Task::new(
                TaskKind::ParseBatch,
                priority::INDEXING,
                TaskPayload::ParseBatch {
                    files: chunk.to_vec(),
                    incremental,
                },
            )
            .with_cancel(request_token.child_token());
            self.queue.enqueue(task, EnqueuePolicy::Block).await?;
        }

        // Deadline scales with request size; the configured request timeout
        // is the floor.
        let deadline = self.config.request_timeout
            + Duration::from_millis(50) * (files.len() as u32 + removed.len() as u32);
        let mut errors: Vec<IndexError> = Vec::new();
        let mut files_indexed = 0usize;
        let mut entities_written = 0usize;
        let deadline_at = Instant::now() + deadline;

        while !(pending.is_empty() && pending_removals.is_empty()) {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                request_token.cancel();
                for file in pending.iter().chain(pending_removals.iter()) {
                    errors.push(IndexError {
                        file: file.clone(),
                        message: "timed out waiting for indexing".to_string(),
                    });
                }
                break;
            }
            let event = match tokio::time::timeout(remaining, completion.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => continue,
            };
            match event.payload {
                BusPayload::IndexComplete { path, stats, .. } => {
                    if pending.remove(&path) {
                        files_indexed += 1;
                        entities_written += stats.entities_inserted + stats.entities_updated;
                    } else {
                        pending_removals.remove(&path);
                    }
                }
                BusPayload::ParseFailed { path, reason } => {
                    if pending.remove(&path) {
                        errors.push(IndexError {
                            file: path,
                            message: reason,
                        });
                    }
                }
                _ => {}
            }
        }

        let report = IndexReport {
            files_indexed,
            files_removed: removed.len() - pending_removals.len(),
            entities: self.graph.stats().entities,
            entities_written,
            duration_ms: start.elapsed().as_millis() as u64,
            errors,
        };
        info!(
            files = report.files_indexed,
            entities = report.entities,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "index request complete"
        );
        Ok(report)
    }

    /// Compose the metrics view.
    pub fn metrics(&self) -> MetricsReport {
        MetricsReport {
            counters: MetricsSnapshot::capture(),
            resources: self.resources.utilization(),
            graph: self.graph.stats(),
            vectors: self.vectors.len(),
            vector_backend: self.vectors.backend_name().to_string(),
            parse_cache_entries: self.cache.len(),
            parse_cache_bytes: self.cache.total_bytes(),
            queue_depth: self.queue.len(),
            agents: self.registry.health(),
        }
    }

    /// Files currently known to the store under `directory` but gone from
    /// disk: the removal half of an incremental sweep.
    fn sweep_removed_files(&self, directory: &Path, found: &[PathBuf]) -> Vec<PathBuf> {
        let found: HashSet<&PathBuf> = found.iter().collect();
        let mut removed: Vec<PathBuf> = self
            .graph
            .all_files()
            .into_iter()
            .map(|f| f.path)
            .filter(|path| path.starts_with(directory) && !found.contains(path))
            .collect();
        removed.sort();
        removed
    }

    /// React to emergency cache-eviction requests from the resource
    /// manager.
    fn spawn_cache_evictor(&self) {
        let subscriber = self.bus.subscribe(&[topics::CACHE_EVICT]);
        let cache = Arc::clone(&self.cache);
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = subscriber.recv() => {
                        let Some(event) = event else { break };
                        if let BusPayload::CacheEvict { fraction } = event.payload {
                            debug!(fraction, "evicting parse cache under pressure");
                            cache.evict_fraction(fraction);
                        }
                    }
                }
            }
        });
    }
}

fn compile_excludes(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| CodeGraphError::InvalidArgument(format!("bad glob '{p}': {e}")).into())
        })
        .collect()
}

/// Source files under `root` in registered languages, minus default and
/// caller excludes. Sorted for deterministic batching.
fn enumerate_source_files(root: &Path, excludes: &[Pattern]) -> Vec<PathBuf> {
    let registry = LanguageRegistry::global();
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !(DEFAULT_EXCLUDES.contains(&name.as_ref()) || name.starts_with('.'))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| registry.detect(path).is_some())
        .filter(|path| {
            let relative = path.strip_prefix(root).unwrap_or(path);
            !excludes.iter().any(|pattern| {
                pattern.matches_path(relative) || pattern.matches_path(path)
            })
        })
        .collect();
    files.sort();
    files
}

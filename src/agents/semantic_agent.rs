// Semantic agent
// Subscribes to index-complete events and keeps the vector store in step
// with the graph: entities whose snippet content changed (or which have no
// embedding yet) are embedded and upserted; entities removed from the graph
// lose their vectors. Embedding failures are retried with backoff inside
// the provider wrapper; after exhaustion the entity is skipped and an
// embedding-failed event is published. The structural path never waits on
// this agent.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agents::{AgentHealth, AgentKind, HealthReport, HealthState, Lifecycle, TaskHandler};
use crate::bus::{topics, BusEvent, BusPayload, KnowledgeBus};
use crate::embeddings::EmbeddingProvider;
use crate::errors::CodeGraphError;
use crate::graph_store::GraphStore;
use crate::observability::{record, Counter};
use crate::task_queue::{Task, TaskKind};
use crate::types::EntityId;
use crate::vector_store::{VectorMeta, VectorStore};

pub struct SemanticAgent {
    graph: Arc<GraphStore>,
    vectors: Arc<VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    bus: Arc<KnowledgeBus>,
    embed_timeout: Duration,
    health: Arc<HealthState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SemanticAgent {
    pub fn new(
        graph: Arc<GraphStore>,
        vectors: Arc<VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        bus: Arc<KnowledgeBus>,
        embed_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            graph,
            vectors,
            provider,
            bus,
            embed_timeout,
            health: Arc::new(HealthState::new(AgentKind::Semantic)),
            handle: Mutex::new(None),
        })
    }

    /// Embed every listed entity that needs it, and drop vectors for the
    /// removed ones. Public for the conductor's synchronous paths and tests.
    pub async fn process_entities(
        &self,
        entity_ids: &[EntityId],
        removed_ids: &[EntityId],
    ) -> Result<usize> {
        for removed in removed_ids {
            if let Err(e) = self.vectors.delete(*removed) {
                warn!(entity = %removed, error = %e, "vector delete failed");
            }
        }

        let mut embedded = 0usize;
        for id in entity_ids {
            let Some(entity) = self.graph.get_entity(*id) else {
                continue;
            };
            let snippet_hash = entity.snippet_hash();
            if !self.vectors.needs_embedding(*id, snippet_hash) {
                continue;
            }
            if entity.snippet.trim().is_empty() {
                continue;
            }

            let embed = tokio::time::timeout(
                self.embed_timeout,
                self.provider.embed_text(&entity.snippet),
            );
            let vector = match embed.await {
                Ok(Ok(vector)) => vector,
                Ok(Err(e)) => {
                    self.report_failure(*id, &e.to_string());
                    continue;
                }
                Err(_) => {
                    let e = CodeGraphError::Timeout {
                        operation: "embedding".to_string(),
                        ms: self.embed_timeout.as_millis() as u64,
                    };
                    self.report_failure(*id, &e.to_string());
                    continue;
                }
            };

            self.vectors.upsert(
                *id,
                vector,
                VectorMeta {
                    language: entity.language,
                    kind: entity.kind,
                    model: self.provider.model_name().to_string(),
                    snippet_hash,
                },
            )?;
            record(Counter::EmbeddingsGenerated);
            embedded += 1;
        }
        Ok(embedded)
    }

    fn report_failure(&self, entity_id: EntityId, reason: &str) {
        record(Counter::EmbeddingsFailed);
        debug!(entity = %entity_id, reason, "embedding skipped");
        self.bus.publish(BusEvent {
            topic: topics::EMBEDDING_FAILED,
            key: Some(entity_id.to_string()),
            payload: BusPayload::EmbeddingFailed {
                entity_id,
                reason: reason.to_string(),
            },
        });
    }

    async fn handle_event(&self, event: BusEvent) {
        if let BusPayload::IndexComplete {
            entity_ids,
            removed_ids,
            ..
        } = event.payload
        {
            self.health.begin();
            match self.process_entities(&entity_ids, &removed_ids).await {
                Ok(_) => self.health.complete(),
                Err(e) => {
                    record(Counter::Errors);
                    self.health.fail(&e.to_string());
                }
            }
        }
    }
}

#[async_trait]
impl Lifecycle for SemanticAgent {
    async fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        let subscriber = self
            .bus
            .subscribe_with_capacity(&[topics::INDEX_COMPLETE], 512);
        let agent = Arc::new(Self {
            graph: Arc::clone(&self.graph),
            vectors: Arc::clone(&self.vectors),
            provider: Arc::clone(&self.provider),
            bus: Arc::clone(&self.bus),
            embed_timeout: self.embed_timeout,
            health: Arc::clone(&self.health),
            handle: Mutex::new(None),
        });
        *handle = Some(tokio::spawn(async move {
            while let Some(event) = subscriber.recv().await {
                agent.handle_event(event).await;
            }
        }));
        debug!("semantic agent started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for SemanticAgent {
    fn accepts(&self, _kind: TaskKind) -> bool {
        false
    }

    async fn handle(&self, _task: Task) -> Result<()> {
        Ok(())
    }
}

impl HealthReport for SemanticAgent {
    fn snapshot(&self) -> AgentHealth {
        self.health.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VectorBackendKind;
    use crate::embeddings::{EmbeddingConfig, HashEmbeddingProvider};
    use crate::graph_store::WriteSet;
    use crate::hashing::fingerprint;
    use crate::parsing::{EntityExtractor, ExtractionResult, ParserCore, SupportedLanguage};
    use crate::vector_store::VectorFilter;
    use std::path::Path;

    fn extraction(source: &str, path: &str) -> ExtractionResult {
        let core = ParserCore::new(1024 * 1024);
        let path = Path::new(path);
        let tree = core
            .parse(path, source.as_bytes(), SupportedLanguage::Python)
            .unwrap();
        EntityExtractor::extract(
            &tree,
            source.as_bytes(),
            path,
            SupportedLanguage::Python,
            fingerprint(source.as_bytes(), SupportedLanguage::Python),
        )
    }

    async fn harness(
        dir: &Path,
    ) -> (Arc<SemanticAgent>, Arc<GraphStore>, Arc<VectorStore>) {
        let graph = Arc::new(GraphStore::open(&dir.join("graph")).unwrap());
        let vectors = Arc::new(
            VectorStore::open(&dir.join("vectors"), 384, VectorBackendKind::Flat).unwrap(),
        );
        let bus = Arc::new(KnowledgeBus::new(64));
        let provider = Arc::new(HashEmbeddingProvider::new(EmbeddingConfig::default()));
        let agent = SemanticAgent::new(
            Arc::clone(&graph),
            Arc::clone(&vectors),
            provider,
            bus,
            Duration::from_secs(10),
        );
        (agent, graph, vectors)
    }

    #[tokio::test]
    async fn embeds_new_entities() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, graph, vectors) = harness(dir.path()).await;

        let result = extraction("def embed_me():\n    return 1\n", "e.py");
        graph.apply_write_set(WriteSet {
            file: result.file.clone(),
            entities: result.entities.clone(),
            relationships: result.relationships.clone(),
        })?;

        let ids: Vec<EntityId> = result.entities.iter().map(|e| e.id).collect();
        let embedded = agent.process_entities(&ids, &[]).await?;
        assert_eq!(embedded, 1);
        assert_eq!(vectors.len(), 1);

        // Second pass: snippet unchanged, nothing to do.
        let embedded = agent.process_entities(&ids, &[]).await?;
        assert_eq!(embedded, 0);
        Ok(())
    }

    #[tokio::test]
    async fn removed_entities_lose_their_vectors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, graph, vectors) = harness(dir.path()).await;

        let result = extraction("def ephemeral():\n    return 1\n", "e.py");
        graph.apply_write_set(WriteSet {
            file: result.file.clone(),
            entities: result.entities.clone(),
            relationships: result.relationships.clone(),
        })?;
        let ids: Vec<EntityId> = result.entities.iter().map(|e| e.id).collect();
        agent.process_entities(&ids, &[]).await?;
        assert_eq!(vectors.len(), 1);

        agent.process_entities(&[], &ids).await?;
        assert_eq!(vectors.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn embedded_vectors_are_searchable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, graph, vectors) = harness(dir.path()).await;

        let result = extraction(
            "def read_config(path):\n    return open(path).read()\n\ndef start_server(port):\n    return port\n",
            "app.py",
        );
        graph.apply_write_set(WriteSet {
            file: result.file.clone(),
            entities: result.entities.clone(),
            relationships: result.relationships.clone(),
        })?;
        let ids: Vec<EntityId> = result.entities.iter().map(|e| e.id).collect();
        agent.process_entities(&ids, &[]).await?;

        let provider = HashEmbeddingProvider::new(EmbeddingConfig::default());
        let query = provider.embed_text("read a config file from path").await?;
        let hits = vectors.k_nearest(&query, 1, &VectorFilter::default());
        assert_eq!(hits.len(), 1);
        let best = graph.get_entity(hits[0].0).expect("entity");
        assert_eq!(best.name, "read_config");
        Ok(())
    }
}

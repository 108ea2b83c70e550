// Indexer agent
// Subscribes to parse-complete events and reconciles each extraction into
// the graph store: entities only in the prior set are deleted (with
// relationship cascade), new ones inserted, survivors updated in place so
// their IDs are preserved, and the file's relationship set fully replaced.
// Events for one path arrive in submission order and are applied by a
// single worker, so the store's view of any file is always a prefix of its
// parse sequence. Reapplying an already-applied payload is a no-op.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agents::{AgentHealth, AgentKind, HealthReport, HealthState, Lifecycle, TaskHandler};
use crate::bus::{topics, BusEvent, BusPayload, KnowledgeBus};
use crate::graph_store::{GraphStore, WriteSet, WriteStats};
use crate::observability::{record, Counter};
use crate::parsing::ExtractionResult;
use crate::task_queue::{Task, TaskKind};
use crate::types::EntityId;

pub struct IndexerAgent {
    graph: Arc<GraphStore>,
    bus: Arc<KnowledgeBus>,
    health: Arc<HealthState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IndexerAgent {
    pub fn new(graph: Arc<GraphStore>, bus: Arc<KnowledgeBus>) -> Arc<Self> {
        Arc::new(Self {
            graph,
            bus,
            health: Arc::new(HealthState::new(AgentKind::Indexer)),
            handle: Mutex::new(None),
        })
    }

    /// Apply one extraction to the store. Public for the conductor's
    /// synchronous paths and for tests.
    pub fn apply_extraction(&self, result: &ExtractionResult) -> Result<WriteStats> {
        let path = &result.file.path;

        // Unchanged content is a no-op: zero writes, but completion is
        // still announced for anyone waiting on this file.
        let prior = self.graph.file_fingerprint(path);
        if prior == Some(result.file.fingerprint) {
            debug!(file = %path.display(), "fingerprint unchanged, skipping write");
            self.publish_complete(result, Vec::new(), WriteStats::default());
            return Ok(WriteStats::default());
        }

        let prior_ids: Vec<EntityId> = self
            .graph
            .entities_in_file(path, None)
            .iter()
            .map(|e| e.id)
            .collect();
        let new_ids: std::collections::HashSet<EntityId> =
            result.entities.iter().map(|e| e.id).collect();
        let removed_ids: Vec<EntityId> = prior_ids
            .into_iter()
            .filter(|id| !new_ids.contains(id))
            .collect();

        let stats = self.graph.apply_write_set(WriteSet {
            file: result.file.clone(),
            entities: result.entities.clone(),
            relationships: result.relationships.clone(),
        })?;

        // index:complete strictly after the durable commit.
        self.publish_complete(result, removed_ids, stats);
        self.graph.resolve_names(&[result.file.id]);
        Ok(stats)
    }

    fn publish_complete(
        &self,
        result: &ExtractionResult,
        removed_ids: Vec<EntityId>,
        stats: WriteStats,
    ) {
        self.bus.publish(BusEvent {
            topic: topics::INDEX_COMPLETE,
            key: Some(result.file.path.display().to_string()),
            payload: BusPayload::IndexComplete {
                path: result.file.path.clone(),
                file_id: result.file.id,
                entity_ids: result.entities.iter().map(|e| e.id).collect(),
                removed_ids,
                stats,
            },
        });
    }

    fn handle_event(&self, event: BusEvent) {
        match event.payload {
            BusPayload::ParseComplete { result, .. } => {
                self.health.begin();
                match self.apply_extraction(&result) {
                    Ok(_) => self.health.complete(),
                    Err(e) => {
                        record(Counter::Errors);
                        warn!(file = %result.file.path.display(), error = %e, "indexing failed");
                        self.health.fail(&e.to_string());
                    }
                }
            }
            BusPayload::FileRemoved { path } => {
                self.health.begin();
                let removed_ids: Vec<EntityId> = self
                    .graph
                    .entities_in_file(&path, None)
                    .iter()
                    .map(|e| e.id)
                    .collect();
                match self.graph.remove_file(&path) {
                    Ok(stats) => {
                        debug!(file = %path.display(), deleted = stats.entities_deleted, "file removed");
                        self.bus.publish(BusEvent {
                            topic: topics::INDEX_COMPLETE,
                            key: Some(path.display().to_string()),
                            payload: BusPayload::IndexComplete {
                                file_id: crate::types::FileId::from_path(&path),
                                path,
                                entity_ids: Vec::new(),
                                removed_ids,
                                stats,
                            },
                        });
                        self.health.complete();
                    }
                    Err(e) => {
                        record(Counter::Errors);
                        self.health.fail(&e.to_string());
                    }
                }
            }
            other => debug!("indexer ignoring event {other:?}"),
        }
    }
}

#[async_trait]
impl Lifecycle for IndexerAgent {
    async fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        // One worker: the graph store is single-writer, and a single
        // consumer preserves per-file event order.
        let subscriber = self
            .bus
            .subscribe_with_capacity(&[topics::PARSE_COMPLETE, topics::FILE_REMOVED], 512);
        let agent = Arc::new(Self {
            graph: Arc::clone(&self.graph),
            bus: Arc::clone(&self.bus),
            health: Arc::clone(&self.health),
            handle: Mutex::new(None),
        });
        *handle = Some(tokio::spawn(async move {
            while let Some(event) = subscriber.recv().await {
                agent.handle_event(event);
            }
        }));
        debug!("indexer agent started");
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
impl TaskHandler for IndexerAgent {
    fn accepts(&self, _kind: TaskKind) -> bool {
        // Purely bus-driven.
        false
    }

    async fn handle(&self, _task: Task) -> Result<()> {
        Ok(())
    }
}

impl HealthReport for IndexerAgent {
    fn snapshot(&self) -> AgentHealth {
        self.health.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::fingerprint;
    use crate::parsing::{EntityExtractor, ParserCore, SupportedLanguage};
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

    fn harness(dir: &Path) -> (Arc<IndexerAgent>, Arc<KnowledgeBus>, Arc<GraphStore>) {
        let graph = Arc::new(GraphStore::open(dir).unwrap());
        let bus = Arc::new(KnowledgeBus::new(64));
        let agent = IndexerAgent::new(Arc::clone(&graph), Arc::clone(&bus));
        (agent, bus, graph)
    }

    #[tokio::test]
    async fn applies_extraction_and_publishes_completion() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, bus, graph) = harness(dir.path());
        let sub = bus.subscribe(&[topics::INDEX_COMPLETE]);

        let result = extraction(
            "def add(a, b):\n    return a + b\n\ndef main():\n    return add(1, 2)\n",
            "lib.py",
        );
        let stats = agent.apply_extraction(&result)?;
        assert_eq!(stats.entities_inserted, 2);
        assert_eq!(graph.stats().entities, 2);

        let event = sub.try_recv().expect("index:complete");
        match event.payload {
            BusPayload::IndexComplete {
                entity_ids, stats, ..
            } => {
                assert_eq!(entity_ids.len(), 2);
                assert_eq!(stats.entities_inserted, 2);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        // Calls resolved after the write landed.
        let add = graph.find_by_name("add").pop().expect("add");
        assert_eq!(graph.incoming(add.id).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn reapplying_same_payload_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, _bus, _graph) = harness(dir.path());

        let result = extraction("def f():\n    return 1\n", "f.py");
        let first = agent.apply_extraction(&result)?;
        assert_eq!(first.entities_inserted, 1);

        let second = agent.apply_extraction(&result)?;
        assert!(second.is_noop());
        Ok(())
    }

    #[tokio::test]
    async fn edit_diff_preserves_surviving_ids_and_reports_removed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, bus, graph) = harness(dir.path());
        let sub = bus.subscribe(&[topics::INDEX_COMPLETE]);

        let v1 = extraction(
            "def keep():\n    return 1\n\ndef drop():\n    return 2\n",
            "lib.py",
        );
        agent.apply_extraction(&v1)?;
        let keep_id = graph.find_by_name("keep").pop().expect("keep").id;
        let drop_id = graph.find_by_name("drop").pop().expect("drop").id;
        let _ = sub.try_recv();

        let v2 = extraction("def keep():\n    return 1\n", "lib.py");
        let stats = agent.apply_extraction(&v2)?;
        assert_eq!(stats.entities_deleted, 1);

        assert_eq!(graph.find_by_name("keep").pop().expect("keep").id, keep_id);
        assert!(graph.get_entity(drop_id).is_none());

        match sub.try_recv().expect("second index:complete").payload {
            BusPayload::IndexComplete { removed_ids, .. } => {
                assert_eq!(removed_ids, vec![drop_id]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn bus_driven_loop_indexes_parse_events() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, bus, graph) = harness(dir.path());
        agent.start().await?;

        let result = Arc::new(extraction("def live():\n    return 1\n", "live.py"));
        bus.publish(BusEvent {
            topic: topics::PARSE_COMPLETE,
            key: Some("live.py".into()),
            payload: BusPayload::ParseComplete {
                result,
                from_cache: false,
            },
        });

        // Wait for the worker to drain the event.
        for _ in 0..100 {
            if graph.stats().entities == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(graph.stats().entities, 1);
        agent.stop().await?;
        Ok(())
    }
}

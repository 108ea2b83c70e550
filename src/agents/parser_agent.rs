// Parser agent
// Consumes parse-batch tasks from the queue and drives the hashing →
// cache-probe → parse → extract pipeline per file:
//
//   New → Hashing → (Cached | Parsing) → Extracting → Published → Done
//
// A failure in any non-terminal state moves the file to Failed and is
// reported on the bus without aborting the rest of the batch. Cache hits
// publish a synthetic parse-complete immediately; misses acquire a resource
// lease sized by file length and run the CPU-bound work on a blocking
// thread under the parse timeout.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agents::{AgentKind, AgentHealth, HealthReport, HealthState, Lifecycle, TaskHandler};
use crate::bus::{topics, BusEvent, BusPayload, KnowledgeBus};
use crate::errors::CodeGraphError;
use crate::hashing;
use crate::observability::{record, Counter};
use crate::parse_cache::ParseCache;
use crate::parsing::{
    EntityExtractor, ExtractionResult, LanguageRegistry, ParserCore, PreviousParse, SourceEdit,
};
use crate::resources::{ResourceManager, ResourceRequest};
use crate::task_queue::{EnqueuePolicy, Task, TaskKind, TaskPayload, TaskQueue};

pub struct ParserAgent {
    parser_core: Arc<ParserCore>,
    cache: Arc<ParseCache>,
    bus: Arc<KnowledgeBus>,
    resources: ResourceManager,
    queue: Arc<TaskQueue>,
    workers: usize,
    parse_timeout: Duration,
    health: Arc<HealthState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ParserAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parser_core: Arc<ParserCore>,
        cache: Arc<ParseCache>,
        bus: Arc<KnowledgeBus>,
        resources: ResourceManager,
        queue: Arc<TaskQueue>,
        workers: usize,
        parse_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            parser_core,
            cache,
            bus,
            resources,
            queue,
            workers: workers.max(1),
            parse_timeout,
            health: Arc::new(HealthState::new(AgentKind::Parser)),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Enqueue a batch of files for parsing.
    pub async fn submit_batch(
        &self,
        task: Task,
        policy: EnqueuePolicy,
    ) -> Result<()> {
        self.queue.enqueue(task, policy).await
    }

    async fn worker_loop(self: Arc<Self>) {
        while let Some(task) = self.queue.dequeue().await {
            if !self.accepts(task.kind) {
                // Not ours; there is one queue per deployment and the parser
                // is its only consumer, so this is an internal logic error.
                warn!(kind = ?task.kind, "parser agent dequeued foreign task");
                continue;
            }
            self.health.begin();
            match self.handle_inner(task).await {
                Ok(()) => self.health.complete(),
                Err(e) => {
                    record(Counter::Errors);
                    self.health.fail(&e.to_string());
                }
            }
        }
    }

    async fn handle_inner(&self, task: Task) -> Result<()> {
        match task.payload {
            TaskPayload::ParseBatch { files, incremental } => {
                for file in files {
                    // Cancellation is checked between files, the per-file
                    // suspension point.
                    if task.cancel.is_cancelled() {
                        record(Counter::TasksCancelled);
                        return Err(CodeGraphError::Cancelled.into());
                    }
                    if let Err(e) = self.process_file(&file, incremental).await {
                        record(Counter::FilesFailed);
                        debug!(file = %file.display(), error = %e, "file failed, batch continues");
                        self.bus.publish(BusEvent {
                            topic: topics::PARSE_FAILED,
                            key: Some(file.display().to_string()),
                            payload: BusPayload::ParseFailed {
                                path: file.clone(),
                                reason: e.to_string(),
                            },
                        });
                    }
                }
                record(Counter::TasksCompleted);
                Ok(())
            }
            TaskPayload::RemoveFiles { files } => {
                for file in files {
                    self.parser_core.forget(&file);
                    self.bus.publish(BusEvent {
                        topic: topics::FILE_REMOVED,
                        key: Some(file.display().to_string()),
                        payload: BusPayload::FileRemoved { path: file },
                    });
                }
                record(Counter::TasksCompleted);
                Ok(())
            }
        }
    }

    /// One file through the state machine.
    async fn process_file(&self, path: &Path, incremental: bool) -> Result<()> {
        // Hashing.
        let language = LanguageRegistry::global()
            .detect(path)
            .ok_or_else(|| CodeGraphError::UnsupportedLanguage(path.display().to_string()))?;
        let source = tokio::fs::read(path)
            .await
            .map_err(|_| CodeGraphError::FileNotFound(path.to_path_buf()))?;
        let fingerprint = hashing::fingerprint(&source, language);

        // Cached: a hit publishes a synthetic parse-complete immediately.
        if let Some(result) = self.cache.get(fingerprint) {
            debug!(file = %path.display(), "parse cache hit");
            self.publish_complete(result, true);
            return Ok(());
        }

        // Parsing: lease sized by file length, work on a blocking thread.
        let lease = self
            .resources
            .request(ResourceRequest::for_parse(source.len() as u64))
            .await?;

        let previous = if incremental {
            self.parser_core.previous(path)
        } else {
            None
        };

        let core = Arc::clone(&self.parser_core);
        let task_path = path.to_path_buf();
        let parse_work = tokio::task::spawn_blocking(move || {
            parse_and_extract(&core, &task_path, source, previous, language, fingerprint)
        });

        let result = match tokio::time::timeout(self.parse_timeout, parse_work).await {
            Ok(joined) => joined.map_err(|e| anyhow!("parse task panicked: {e}"))??,
            Err(_) => {
                self.bus.publish(BusEvent {
                    topic: topics::TELEMETRY,
                    key: Some(path.display().to_string()),
                    payload: BusPayload::Telemetry {
                        name: "parse_timeout",
                        value: self.parse_timeout.as_millis() as u64,
                    },
                });
                return Err(CodeGraphError::ParseTimeout(path.to_path_buf()).into());
            }
        };
        drop(lease);

        // Extracting happened on the blocking thread; store and publish.
        let result = Arc::new(result);
        self.cache.put(fingerprint, Arc::clone(&result));
        record(Counter::FilesParsed);
        self.publish_complete(result, false);
        Ok(())
    }

    fn publish_complete(&self, result: Arc<ExtractionResult>, from_cache: bool) {
        self.bus.publish(BusEvent {
            topic: topics::PARSE_COMPLETE,
            key: Some(result.file.path.display().to_string()),
            payload: BusPayload::ParseComplete { result, from_cache },
        });
    }
}

/// CPU-bound half of the pipeline, run on a blocking thread: parse (cold or
/// incremental), extract, and remember the tree for the next edit.
fn parse_and_extract(
    core: &ParserCore,
    path: &PathBuf,
    source: Vec<u8>,
    previous: Option<PreviousParse>,
    language: crate::parsing::SupportedLanguage,
    fingerprint: crate::types::Fingerprint,
) -> Result<ExtractionResult> {
    let tree = match previous {
        Some(prev) if prev.fingerprint != fingerprint => {
            match diff_single_edit(&prev.source, &source) {
                Some(edit) => core.parse_incremental(
                    path,
                    &prev.tree,
                    &prev.source,
                    &[edit],
                    &source,
                    language,
                )?,
                None => core.parse(path, &source, language)?,
            }
        }
        _ => core.parse(path, &source, language)?,
    };

    let result = EntityExtractor::extract(&tree, &source, path, language, fingerprint);
    core.remember(
        path,
        PreviousParse {
            fingerprint,
            tree,
            source,
        },
    );
    Ok(result)
}

/// Model an arbitrary change as a single replaced byte range by trimming the
/// common prefix and suffix. Exact enough for tree-sitter's edit hints; the
/// reparse output is identical either way.
fn diff_single_edit(old: &[u8], new: &[u8]) -> Option<SourceEdit> {
    if old == new {
        return None;
    }
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take_while(|(a, b)| a == b)
        .count()
        .min(max_suffix);
    Some(SourceEdit {
        start_byte: prefix,
        old_end_byte: old.len() - suffix,
        new_end_byte: new.len() - suffix,
    })
}

#[async_trait]
impl Lifecycle for ParserAgent {
    async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Ok(());
        }
        for _ in 0..self.workers {
            let agent = Arc::new(self.clone_for_worker());
            handles.push(tokio::spawn(agent.worker_loop()));
        }
        debug!(workers = self.workers, "parser agent started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.queue.close();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl ParserAgent {
    fn clone_for_worker(&self) -> Self {
        Self {
            parser_core: Arc::clone(&self.parser_core),
            cache: Arc::clone(&self.cache),
            bus: Arc::clone(&self.bus),
            resources: self.resources.clone(),
            queue: Arc::clone(&self.queue),
            workers: self.workers,
            parse_timeout: self.parse_timeout,
            health: Arc::clone(&self.health),
            handles: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TaskHandler for ParserAgent {
    fn accepts(&self, kind: TaskKind) -> bool {
        matches!(kind, TaskKind::ParseBatch | TaskKind::RemoveFiles)
    }

    async fn handle(&self, task: Task) -> Result<()> {
        self.handle_inner(task).await
    }
}

impl HealthReport for ParserAgent {
    fn snapshot(&self) -> AgentHealth {
        self.health.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::resources::ResourceLimits;
    use std::io::Write;

    fn harness() -> (Arc<ParserAgent>, Arc<KnowledgeBus>) {
        let config = ServerConfig::default();
        let bus = Arc::new(KnowledgeBus::new(64));
        let mut limits = ResourceLimits::new(1 << 40, 8);
        limits.track_process_rss = false;
        let agent = ParserAgent::new(
            Arc::new(ParserCore::new(config.max_file_size)),
            Arc::new(ParseCache::new(config.parse_cache_bytes)),
            Arc::clone(&bus),
            ResourceManager::new(limits),
            Arc::new(TaskQueue::new(16)),
            1,
            config.parse_timeout,
        );
        (agent, bus)
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn batch_publishes_parse_complete_per_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, bus) = harness();
        let sub = bus.subscribe(&[topics::PARSE_COMPLETE]);

        let a = write_file(dir.path(), "a.py", "def a():\n    return 1\n");
        let b = write_file(dir.path(), "b.py", "def b():\n    return 2\n");

        agent
            .handle(Task::new(
                TaskKind::ParseBatch,
                50,
                TaskPayload::ParseBatch {
                    files: vec![a, b],
                    incremental: false,
                },
            ))
            .await?;

        let first = sub.try_recv().expect("first parse:complete");
        let second = sub.try_recv().expect("second parse:complete");
        for event in [first, second] {
            match event.payload {
                BusPayload::ParseComplete { result, from_cache } => {
                    assert!(!from_cache);
                    assert_eq!(result.entities.len(), 1);
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn second_parse_hits_cache() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, bus) = harness();
        let sub = bus.subscribe(&[topics::PARSE_COMPLETE]);
        let file = write_file(dir.path(), "hot.py", "def hot():\n    return 1\n");

        for _ in 0..2 {
            agent
                .handle(Task::new(
                    TaskKind::ParseBatch,
                    50,
                    TaskPayload::ParseBatch {
                        files: vec![file.clone()],
                        incremental: false,
                    },
                ))
                .await?;
        }

        let cold = sub.try_recv().expect("cold parse");
        let warm = sub.try_recv().expect("warm parse");
        match (cold.payload, warm.payload) {
            (
                BusPayload::ParseComplete {
                    from_cache: first, ..
                },
                BusPayload::ParseComplete {
                    from_cache: second,
                    result,
                },
            ) => {
                assert!(!first);
                assert!(second);
                assert_eq!(result.entities[0].name, "hot");
            }
            other => panic!("unexpected payloads {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn failed_file_does_not_abort_batch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, bus) = harness();
        let complete = bus.subscribe(&[topics::PARSE_COMPLETE]);
        let failed = bus.subscribe(&[topics::PARSE_FAILED]);

        let good = write_file(dir.path(), "good.py", "def good():\n    return 1\n");
        let missing = dir.path().join("missing.py");

        agent
            .handle(Task::new(
                TaskKind::ParseBatch,
                50,
                TaskPayload::ParseBatch {
                    files: vec![missing, good],
                    incremental: false,
                },
            ))
            .await?;

        assert!(failed.try_recv().is_some(), "missing file reported");
        assert!(complete.try_recv().is_some(), "good file still parsed");
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_batch_stops_early() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (agent, bus) = harness();
        let sub = bus.subscribe(&[topics::PARSE_COMPLETE]);
        let file = write_file(dir.path(), "skip.py", "def skip():\n    return 1\n");

        let task = Task::new(
            TaskKind::ParseBatch,
            50,
            TaskPayload::ParseBatch {
                files: vec![file],
                incremental: false,
            },
        );
        task.cancel.cancel();
        let err = agent.handle(task).await.unwrap_err();
        assert_eq!(
            crate::errors::as_codegraph_error(&err).map(|e| e.code()),
            Some("CANCELLED")
        );
        assert!(sub.try_recv().is_none());
        Ok(())
    }

    #[test]
    fn single_edit_diff() {
        let old = b"def a():\n    return 1\n";
        let new = b"def a():\n    return 1\n\ndef b():\n    return 2\n";
        let edit = diff_single_edit(old, new).expect("edit");
        assert_eq!(edit.start_byte, old.len());
        assert_eq!(edit.old_end_byte, old.len());
        assert_eq!(edit.new_end_byte, new.len());
        assert!(diff_single_edit(old, old).is_none());
    }

    #[tokio::test]
    async fn incremental_equivalence_through_agent() -> Result<()> {
        // The entity set from an incremental reparse equals a cold reparse
        // of the edited content.
        let dir = tempfile::tempdir()?;
        let (agent, bus) = harness();
        let sub = bus.subscribe(&[topics::PARSE_COMPLETE]);
        let file = write_file(dir.path(), "inc.py", "def add(a, b):\n    return a + b\n");

        let parse = |files: Vec<PathBuf>, incremental| {
            Task::new(
                TaskKind::ParseBatch,
                50,
                TaskPayload::ParseBatch { files, incremental },
            )
        };

        agent.handle(parse(vec![file.clone()], false)).await?;
        let _cold = sub.try_recv().expect("cold parse");

        write_file(
            dir.path(),
            "inc.py",
            "def add(a, b):\n    return a + b\n\ndef sub(a, b):\n    return a - b\n",
        );
        agent.handle(parse(vec![file.clone()], true)).await?;
        let incremental = match sub.try_recv().expect("incremental parse").payload {
            BusPayload::ParseComplete { result, .. } => result,
            other => panic!("unexpected payload {other:?}"),
        };

        let names: Vec<&str> = incremental
            .entities
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names, vec!["add", "sub"]);
        Ok(())
    }
}

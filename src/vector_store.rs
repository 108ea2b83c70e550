// Vector store
// Maps entity IDs to fixed-dimension embeddings and answers cosine
// k-nearest queries, optionally filtered by language or entity kind. Two
// backends sit behind one trait: a portable linear scan (exact, fine up to
// ~10^4 vectors) and an HNSW graph for larger stores. Persistence is an
// append-only log of upserts/deletes, compacted on open; each upsert is
// individually crash-safe.

use anyhow::{ensure, Context, Result};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use crate::config::VectorBackendKind;
use crate::parsing::SupportedLanguage;
use crate::types::{EntityId, EntityKind};

const LOG_FILE: &str = "vectors.log";
/// Compact when dead records exceed live ones by this factor.
const COMPACT_RATIO: usize = 2;

/// Metadata stored alongside each vector, used for filtered search and
/// embedding invalidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMeta {
    pub language: SupportedLanguage,
    pub kind: EntityKind,
    pub model: String,
    /// Hash of the snippet the embedding was computed from.
    pub snippet_hash: u64,
}

/// Optional filters applied to `k_nearest`.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub language: Option<SupportedLanguage>,
    pub kinds: Option<Vec<EntityKind>>,
}

impl VectorFilter {
    fn matches(&self, meta: &VectorMeta) -> bool {
        if let Some(language) = self.language {
            if meta.language != language {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&meta.kind) {
                return false;
            }
        }
        true
    }
}

/// Cosine similarity in [-1, 1]; zero vectors compare as wholly dissimilar.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return -1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        -1.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Nearest-neighbour backend contract. `VECTOR_BACKEND` selects the
/// implementation; `DISABLE_VECTOR_ACCEL` forces the flat scan.
trait VectorBackend: Send + Sync {
    fn insert(&mut self, id: EntityId, vector: Vec<f32>);
    fn remove(&mut self, id: EntityId);
    fn get(&self, id: EntityId) -> Option<Vec<f32>>;
    fn search(
        &self,
        query: &[f32],
        k: usize,
        allow: &dyn Fn(EntityId) -> bool,
    ) -> Vec<(EntityId, f32)>;
    fn len(&self) -> usize;
    fn name(&self) -> &'static str;
}

/// Exact linear scan.
#[derive(Default)]
struct FlatBackend {
    vectors: HashMap<EntityId, Vec<f32>>,
}

impl VectorBackend for FlatBackend {
    fn insert(&mut self, id: EntityId, vector: Vec<f32>) {
        self.vectors.insert(id, vector);
    }

    fn remove(&mut self, id: EntityId) {
        self.vectors.remove(&id);
    }

    fn get(&self, id: EntityId) -> Option<Vec<f32>> {
        self.vectors.get(&id).cloned()
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        allow: &dyn Fn(EntityId) -> bool,
    ) -> Vec<(EntityId, f32)> {
        let mut scored: Vec<(EntityId, f32)> = self
            .vectors
            .iter()
            .filter(|(id, _)| allow(**id))
            .map(|(id, vector)| (*id, cosine_similarity(query, vector)))
            .collect();
        sort_hits(&mut scored);
        scored.truncate(k);
        scored
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn name(&self) -> &'static str {
        "flat"
    }
}

/// HNSW-style navigable small-world graph.
struct HnswBackend {
    nodes: HashMap<EntityId, HnswNode>,
    entry_point: Option<EntityId>,
    max_connections: usize,
    ef_construction: usize,
    ef_search: usize,
}

struct HnswNode {
    vector: Vec<f32>,
    /// Neighbour sets per level; index 0 is the base layer.
    levels: Vec<HashSet<EntityId>>,
}

impl HnswBackend {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            entry_point: None,
            max_connections: 16,
            ef_construction: 200,
            ef_search: 128,
        }
    }

    fn random_level(&self) -> usize {
        let mut level = 0;
        let mut rng = rand::thread_rng();
        while rng.gen::<f64>() < 0.5 && level < 16 {
            level += 1;
        }
        level
    }

    fn top_level(&self, id: EntityId) -> usize {
        self.nodes.get(&id).map_or(0, |n| n.levels.len() - 1)
    }

    /// Greedy beam search on one level.
    fn search_level(
        &self,
        query: &[f32],
        entry: EntityId,
        level: usize,
        ef: usize,
    ) -> Vec<(EntityId, f32)> {
        let mut visited: HashSet<EntityId> = HashSet::new();
        let mut frontier: Vec<(EntityId, f32)> = Vec::new();
        let mut best: Vec<(EntityId, f32)> = Vec::new();

        let entry_sim = self
            .nodes
            .get(&entry)
            .map(|n| cosine_similarity(query, &n.vector))
            .unwrap_or(-1.0);
        visited.insert(entry);
        frontier.push((entry, entry_sim));
        best.push((entry, entry_sim));

        while let Some((current, _)) = frontier.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            let Some(neighbours) = node.levels.get(level) else {
                continue;
            };
            for neighbour in neighbours {
                if !visited.insert(*neighbour) {
                    continue;
                }
                let Some(nn) = self.nodes.get(neighbour) else {
                    continue;
                };
                let sim = cosine_similarity(query, &nn.vector);
                let worst = best.last().map(|(_, s)| *s).unwrap_or(-1.0);
                if best.len() < ef || sim > worst {
                    frontier.push((*neighbour, sim));
                    best.push((*neighbour, sim));
                    sort_hits(&mut best);
                    best.truncate(ef);
                }
            }
            // Visit most promising frontier entries first.
            frontier.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        }
        best
    }

    fn connect(&mut self, id: EntityId, neighbour: EntityId, level: usize) {
        for (a, b) in [(id, neighbour), (neighbour, id)] {
            let Some(base) = self.nodes.get(&a).map(|n| n.vector.clone()) else {
                continue;
            };
            let over_cap = match self
                .nodes
                .get_mut(&a)
                .and_then(|node| node.levels.get_mut(level))
            {
                Some(set) => {
                    set.insert(b);
                    set.len() > self.max_connections
                }
                None => continue,
            };
            if !over_cap {
                continue;
            }

            // Prune the most dissimilar link past the cap.
            let candidates: Vec<EntityId> = self
                .nodes
                .get(&a)
                .and_then(|node| node.levels.get(level))
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            let mut worst: Option<(EntityId, f32)> = None;
            for candidate in candidates {
                let sim = self
                    .nodes
                    .get(&candidate)
                    .map(|n| cosine_similarity(&base, &n.vector))
                    .unwrap_or(-1.0);
                if worst.map_or(true, |(_, worst_sim)| sim < worst_sim) {
                    worst = Some((candidate, sim));
                }
            }
            if let Some((worst_id, _)) = worst {
                if let Some(set) = self
                    .nodes
                    .get_mut(&a)
                    .and_then(|node| node.levels.get_mut(level))
                {
                    set.remove(&worst_id);
                }
            }
        }
    }
}

impl VectorBackend for HnswBackend {
    fn insert(&mut self, id: EntityId, vector: Vec<f32>) {
        self.remove(id);

        let level = self.random_level();
        self.nodes.insert(
            id,
            HnswNode {
                vector: vector.clone(),
                levels: vec![HashSet::new(); level + 1],
            },
        );

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(id);
            return;
        };

        // Descend from the global entry point to the insertion level.
        let mut current = entry;
        let entry_top = self.top_level(entry);
        for search_level in (level + 1..=entry_top).rev() {
            if let Some((best, _)) = self
                .search_level(&vector, current, search_level, 1)
                .first()
            {
                current = *best;
            }
        }

        // Connect at each level from the insertion level down.
        for connect_level in (0..=level.min(entry_top)).rev() {
            let candidates =
                self.search_level(&vector, current, connect_level, self.ef_construction);
            for (neighbour, _) in candidates.iter().take(self.max_connections) {
                if *neighbour != id {
                    self.connect(id, *neighbour, connect_level);
                }
            }
            if let Some((best, _)) = candidates.first() {
                current = *best;
            }
        }

        if level > entry_top {
            self.entry_point = Some(id);
        }
    }

    fn get(&self, id: EntityId) -> Option<Vec<f32>> {
        self.nodes.get(&id).map(|n| n.vector.clone())
    }

    fn remove(&mut self, id: EntityId) {
        if self.nodes.remove(&id).is_none() {
            return;
        }
        for node in self.nodes.values_mut() {
            for level in &mut node.levels {
                level.remove(&id);
            }
        }
        if self.entry_point == Some(id) {
            self.entry_point = self.nodes.keys().next().copied();
        }
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        allow: &dyn Fn(EntityId) -> bool,
    ) -> Vec<(EntityId, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };

        let mut current = entry;
        for level in (1..=self.top_level(entry)).rev() {
            if let Some((best, _)) = self.search_level(query, current, level, 1).first() {
                current = *best;
            }
        }

        let ef = self.ef_search.max(k * 4);
        let mut hits: Vec<(EntityId, f32)> = self
            .search_level(query, current, 0, ef)
            .into_iter()
            .filter(|(id, _)| allow(*id))
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn name(&self) -> &'static str {
        "hnsw"
    }
}

/// Descending similarity, ties broken by entity ID for determinism.
fn sort_hits(hits: &mut [(EntityId, f32)]) {
    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

#[derive(Serialize, Deserialize)]
enum VectorLogRecord {
    Upsert {
        id: EntityId,
        meta: VectorMeta,
        vector: Vec<f32>,
    },
    Delete {
        id: EntityId,
    },
}

/// Persistent embedding store.
pub struct VectorStore {
    backend: RwLock<Box<dyn VectorBackend>>,
    meta: RwLock<HashMap<EntityId, VectorMeta>>,
    log: Mutex<std::fs::File>,
    dimension: usize,
}

impl VectorStore {
    /// Open (or create) the store, replaying the upsert log and compacting
    /// it when it has accumulated enough dead records.
    pub fn open(dir: &Path, dimension: usize, backend_kind: VectorBackendKind) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating vector store directory {}", dir.display()))?;

        let mut backend: Box<dyn VectorBackend> = match backend_kind {
            VectorBackendKind::Flat => Box::<FlatBackend>::default(),
            VectorBackendKind::Hnsw => Box::new(HnswBackend::new()),
        };
        let mut meta: HashMap<EntityId, VectorMeta> = HashMap::new();

        let log_path = dir.join(LOG_FILE);
        let mut replayed = 0usize;
        let mut live: HashMap<EntityId, (VectorMeta, Vec<f32>)> = HashMap::new();
        for body in crate::wal::read_records(&log_path)? {
            match bincode::deserialize::<VectorLogRecord>(&body) {
                Ok(VectorLogRecord::Upsert {
                    id,
                    meta: record_meta,
                    vector,
                }) => {
                    live.insert(id, (record_meta, vector));
                }
                Ok(VectorLogRecord::Delete { id }) => {
                    live.remove(&id);
                }
                Err(_) => break,
            }
            replayed += 1;
        }
        for (id, (record_meta, vector)) in &live {
            backend.insert(*id, vector.clone());
            meta.insert(*id, record_meta.clone());
        }

        let needs_compaction = replayed > COMPACT_RATIO * live.len().max(1);
        if needs_compaction {
            compact_log(&log_path, &live)?;
            debug!(records = replayed, live = live.len(), "vector log compacted");
        }

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        info!(
            vectors = live.len(),
            backend = backend.name(),
            "vector store opened"
        );

        Ok(Self {
            backend: RwLock::new(backend),
            meta: RwLock::new(meta),
            log: Mutex::new(log),
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.backend.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.read().name()
    }

    /// Insert or replace the embedding for an entity. Durable once this
    /// returns: the log record is synced before the in-memory index changes.
    pub fn upsert(&self, id: EntityId, vector: Vec<f32>, meta: VectorMeta) -> Result<()> {
        ensure!(
            vector.len() == self.dimension,
            "vector dimension {} does not match store dimension {}",
            vector.len(),
            self.dimension
        );

        let record = VectorLogRecord::Upsert {
            id,
            meta: meta.clone(),
            vector: vector.clone(),
        };
        self.append(&record)?;

        self.backend.write().insert(id, vector);
        self.meta.write().insert(id, meta);
        Ok(())
    }

    pub fn delete(&self, id: EntityId) -> Result<()> {
        if !self.meta.read().contains_key(&id) {
            return Ok(());
        }
        self.append(&VectorLogRecord::Delete { id })?;
        self.backend.write().remove(id);
        self.meta.write().remove(&id);
        Ok(())
    }

    /// Stored embedding for one entity, if any.
    pub fn vector_of(&self, id: EntityId) -> Option<Vec<f32>> {
        self.backend.read().get(id)
    }

    /// Whether an entity needs (re-)embedding: missing, or its snippet
    /// content changed since the stored embedding was computed.
    pub fn needs_embedding(&self, id: EntityId, snippet_hash: u64) -> bool {
        self.meta
            .read()
            .get(&id)
            .map(|meta| meta.snippet_hash != snippet_hash)
            .unwrap_or(true)
    }

    /// The `k` entities most similar to `query` under cosine similarity,
    /// ordered by descending similarity with ties broken by entity ID.
    pub fn k_nearest(&self, query: &[f32], k: usize, filter: &VectorFilter) -> Vec<(EntityId, f32)> {
        let meta = self.meta.read();
        let allow = |id: EntityId| meta.get(&id).map(|m| filter.matches(m)).unwrap_or(false);
        self.backend.read().search(query, k, &allow)
    }

    fn append(&self, record: &VectorLogRecord) -> Result<()> {
        let bytes = bincode::serialize(record).context("serializing vector log record")?;
        let mut log = self.log.lock();
        crate::wal::append_record(&mut log, &bytes)
    }
}

fn compact_log(path: &Path, live: &HashMap<EntityId, (VectorMeta, Vec<f32>)>) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        for (id, (meta, vector)) in live {
            let record = VectorLogRecord::Upsert {
                id: *id,
                meta: meta.clone(),
                vector: vector.clone(),
            };
            let bytes = bincode::serialize(&record)?;
            crate::wal::append_record(&mut file, &bytes)?;
        }
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_meta(kind: EntityKind, language: SupportedLanguage) -> VectorMeta {
        VectorMeta {
            language,
            kind,
            model: "test-model".to_string(),
            snippet_hash: 1,
        }
    }

    fn id(n: u32) -> EntityId {
        EntityId::new(
            &PathBuf::from(format!("/v/{n}.py")),
            EntityKind::Function,
            "f",
            0,
        )
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot % dim] = 1.0;
        v
    }

    #[test]
    fn upsert_and_nearest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = VectorStore::open(dir.path(), 8, VectorBackendKind::Flat)?;

        for n in 0..4 {
            store.upsert(
                id(n),
                unit(8, n as usize),
                test_meta(EntityKind::Function, SupportedLanguage::Python),
            )?;
        }

        let hits = store.k_nearest(&unit(8, 2), 2, &VectorFilter::default());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, id(2));
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn filters_restrict_results() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = VectorStore::open(dir.path(), 4, VectorBackendKind::Flat)?;

        store.upsert(
            id(1),
            unit(4, 0),
            test_meta(EntityKind::Function, SupportedLanguage::Python),
        )?;
        store.upsert(
            id(2),
            unit(4, 0),
            test_meta(EntityKind::Class, SupportedLanguage::TypeScript),
        )?;

        let filter = VectorFilter {
            language: Some(SupportedLanguage::TypeScript),
            kinds: None,
        };
        let hits = store.k_nearest(&unit(4, 0), 10, &filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, id(2));

        let filter = VectorFilter {
            language: None,
            kinds: Some(vec![EntityKind::Function]),
        };
        let hits = store.k_nearest(&unit(4, 0), 10, &filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, id(1));
        Ok(())
    }

    #[test]
    fn persistence_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = VectorStore::open(dir.path(), 4, VectorBackendKind::Flat)?;
            store.upsert(
                id(7),
                unit(4, 1),
                test_meta(EntityKind::Function, SupportedLanguage::Python),
            )?;
            store.delete(id(7))?;
            store.upsert(
                id(8),
                unit(4, 2),
                test_meta(EntityKind::Function, SupportedLanguage::Python),
            )?;
        }

        let reopened = VectorStore::open(dir.path(), 4, VectorBackendKind::Flat)?;
        assert_eq!(reopened.len(), 1);
        let hits = reopened.k_nearest(&unit(4, 2), 1, &VectorFilter::default());
        assert_eq!(hits[0].0, id(8));
        Ok(())
    }

    #[test]
    fn needs_embedding_tracks_snippet_hash() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = VectorStore::open(dir.path(), 4, VectorBackendKind::Flat)?;

        assert!(store.needs_embedding(id(1), 42));
        let mut meta = test_meta(EntityKind::Function, SupportedLanguage::Python);
        meta.snippet_hash = 42;
        store.upsert(id(1), unit(4, 0), meta)?;
        assert!(!store.needs_embedding(id(1), 42));
        assert!(store.needs_embedding(id(1), 43));
        Ok(())
    }

    #[test]
    fn dimension_mismatch_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = VectorStore::open(dir.path(), 4, VectorBackendKind::Flat)?;
        let result = store.upsert(
            id(1),
            vec![1.0; 8],
            test_meta(EntityKind::Function, SupportedLanguage::Python),
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn hnsw_finds_exact_match() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = VectorStore::open(dir.path(), 16, VectorBackendKind::Hnsw)?;

        for n in 0..50 {
            store.upsert(
                id(n),
                unit(16, n as usize),
                test_meta(EntityKind::Function, SupportedLanguage::Python),
            )?;
        }

        let hits = store.k_nearest(&unit(16, 5), 3, &VectorFilter::default());
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0, id(5));
        Ok(())
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), -1.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), -1.0);
    }
}

// Graph store
// The structural half of the hybrid store: files, entities, and
// relationships, held in indexed in-memory tables behind a single-writer /
// many-reader lock, made durable by an append-only journal of per-file write
// sets plus periodic full snapshots. A write set is applied atomically under
// the write lock, so readers never observe a half-updated file; a torn
// journal tail is truncated on restart, which rolls the partial write set
// back.

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

use crate::errors::CodeGraphError;
use crate::observability::{record, record_by, Counter};
use crate::types::{
    Entity, EntityId, EntityKind, FileId, FileRecord, Fingerprint, RelTarget, RelationKind,
    Relationship,
};

/// Current on-disk schema version. The store refuses to open state written
/// by a newer version.
pub const SCHEMA_VERSION: u32 = 3;

const SNAPSHOT_MAGIC: u32 = 0x43_47_47_53; // "CGGS"
const SNAPSHOT_FILE: &str = "snapshot.bin";
const JOURNAL_FILE: &str = "journal.log";
/// Write sets between automatic snapshots.
const SNAPSHOT_INTERVAL: u64 = 256;

/// The full set of inserts, updates and deletes for one file in one indexing
/// cycle. Applied atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteSet {
    pub file: FileRecord,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

/// Net effect of applying a write set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub entities_inserted: usize,
    pub entities_updated: usize,
    pub entities_deleted: usize,
    pub relationships_written: usize,
}

impl WriteStats {
    pub fn is_noop(&self) -> bool {
        self.entities_inserted == 0
            && self.entities_updated == 0
            && self.entities_deleted == 0
            && self.relationships_written == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalRecord {
    Apply(Box<WriteSet>),
    RemoveFile(PathBuf),
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    schema_version: u32,
    files: Vec<FileRecord>,
    entities: Vec<Entity>,
    relationships: Vec<(u64, Relationship)>,
    next_rel_id: u64,
}

#[derive(Default, Debug)]
struct GraphState {
    files: HashMap<FileId, FileRecord>,
    files_by_path: HashMap<PathBuf, FileId>,
    entities: HashMap<EntityId, Entity>,
    relationships: HashMap<u64, Relationship>,
    next_rel_id: u64,

    // Secondary indexes, rebuilt from the tables on load.
    file_entities: HashMap<FileId, Vec<EntityId>>,
    file_relationships: HashMap<FileId, Vec<u64>>,
    outgoing: HashMap<EntityId, Vec<u64>>,
    incoming: HashMap<EntityId, Vec<u64>>,
    by_name: HashMap<String, Vec<EntityId>>,
    by_qualified: HashMap<String, Vec<EntityId>>,
    unresolved: HashMap<String, Vec<u64>>,
}

/// Aggregate statistics for `get_metrics` and the `stats` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    pub files: usize,
    pub entities: usize,
    pub relationships: usize,
    pub unresolved_targets: usize,
    pub entities_by_kind: HashMap<String, usize>,
}

/// Durable entity/relationship store.
#[derive(Debug)]
pub struct GraphStore {
    state: RwLock<GraphState>,
    journal: Mutex<std::fs::File>,
    dir: PathBuf,
    poisoned: AtomicBool,
    writes_since_snapshot: AtomicU64,
}

impl GraphStore {
    /// Open (or create) a store at `dir`, replaying any journal left by a
    /// previous process. Fails with `SchemaTooNew` if the on-disk state was
    /// written by a newer version of this code.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating graph store directory {}", dir.display()))?;

        let mut state = GraphState::default();
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let bytes = std::fs::read(&snapshot_path).context("reading graph snapshot")?;
            state = GraphState::from_persisted(parse_snapshot(&bytes)?)?;
            info!(
                files = state.files.len(),
                entities = state.entities.len(),
                "graph snapshot loaded"
            );
        }

        let journal_path = dir.join(JOURNAL_FILE);
        replay_journal(&journal_path, &mut state)?;

        let journal = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .with_context(|| format!("opening journal {}", journal_path.display()))?;

        let store = Self {
            state: RwLock::new(state),
            journal: Mutex::new(journal),
            dir: dir.to_path_buf(),
            poisoned: AtomicBool::new(false),
            writes_since_snapshot: AtomicU64::new(0),
        };

        // Resolution is deterministic and idempotent, so instead of
        // journaling resolved targets we re-derive them after replay.
        let all_files: Vec<FileId> = store.state.read().files.keys().copied().collect();
        if !all_files.is_empty() {
            store.resolve_names(&all_files);
        }

        Ok(store)
    }

    /// Apply one file's write set atomically: journal first, then mutate the
    /// in-memory tables under the write lock.
    pub fn apply_write_set(&self, write_set: WriteSet) -> Result<WriteStats> {
        self.check_poisoned()?;

        self.append_journal(&JournalRecord::Apply(Box::new(write_set.clone())))?;

        let stats = {
            let mut state = self.state.write();
            state.apply(write_set)
        };

        record_by(
            Counter::EntitiesWritten,
            (stats.entities_inserted + stats.entities_updated) as u64,
        );
        record_by(Counter::EntitiesDeleted, stats.entities_deleted as u64);
        record_by(
            Counter::RelationshipsWritten,
            stats.relationships_written as u64,
        );

        self.maybe_snapshot()?;
        Ok(stats)
    }

    /// Remove a file and everything extracted from it.
    pub fn remove_file(&self, path: &Path) -> Result<WriteStats> {
        self.check_poisoned()?;

        let exists = self.state.read().files_by_path.contains_key(path);
        if !exists {
            return Ok(WriteStats::default());
        }

        self.append_journal(&JournalRecord::RemoveFile(path.to_path_buf()))?;
        let stats = {
            let mut state = self.state.write();
            state.remove_file(path)
        };
        record_by(Counter::EntitiesDeleted, stats.entities_deleted as u64);
        self.maybe_snapshot()?;
        Ok(stats)
    }

    /// Bounded resolution pass over the given files: unresolved name targets
    /// inside them, plus unresolved targets elsewhere that name entities
    /// these files define. Idempotent; ambiguous names stay unresolved.
    pub fn resolve_names(&self, files: &[FileId]) -> usize {
        let mut state = self.state.write();
        let mut candidates: Vec<u64> = Vec::new();

        for file_id in files {
            if let Some(rel_ids) = state.file_relationships.get(file_id) {
                candidates.extend(rel_ids.iter().copied());
            }
            // Names newly defined by this file may unblock other files.
            if let Some(entity_ids) = state.file_entities.get(file_id) {
                for entity_id in entity_ids {
                    if let Some(entity) = state.entities.get(entity_id) {
                        for key in [entity.name.clone(), entity.qualified_name.clone()] {
                            if let Some(rel_ids) = state.unresolved.get(&key) {
                                candidates.extend(rel_ids.iter().copied());
                            }
                        }
                    }
                }
            }
        }

        candidates.sort_unstable();
        candidates.dedup();

        let mut resolved = 0usize;
        for rel_id in candidates {
            if state.try_resolve(rel_id) {
                resolved += 1;
            }
        }
        if resolved > 0 {
            record_by(Counter::NamesResolved, resolved as u64);
            debug!(resolved, "name resolution pass complete");
        }
        resolved
    }

    // ---- Read path -------------------------------------------------------

    pub fn get_entity(&self, id: EntityId) -> Option<Entity> {
        self.state.read().entities.get(&id).cloned()
    }

    /// Entities whose simple or qualified name matches exactly.
    pub fn find_by_name(&self, name: &str) -> Vec<Entity> {
        let state = self.state.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for index in [&state.by_name, &state.by_qualified] {
            if let Some(ids) = index.get(name) {
                for id in ids {
                    if seen.insert(*id) {
                        if let Some(entity) = state.entities.get(id) {
                            out.push(entity.clone());
                        }
                    }
                }
            }
        }
        out.sort_by(|a, b| {
            (&a.file_path, a.span.start_line, a.span.start_column).cmp(&(
                &b.file_path,
                b.span.start_line,
                b.span.start_column,
            ))
        });
        out
    }

    pub fn file_record(&self, path: &Path) -> Option<FileRecord> {
        let state = self.state.read();
        let id = state.files_by_path.get(path)?;
        state.files.get(id).cloned()
    }

    pub fn file_fingerprint(&self, path: &Path) -> Option<Fingerprint> {
        self.file_record(path).map(|f| f.fingerprint)
    }

    pub fn all_files(&self) -> Vec<FileRecord> {
        self.state.read().files.values().cloned().collect()
    }

    /// Entities in a file, ordered by (start line, start column).
    pub fn entities_in_file(&self, path: &Path, kinds: Option<&[EntityKind]>) -> Vec<Entity> {
        let state = self.state.read();
        let Some(file_id) = state.files_by_path.get(path) else {
            return Vec::new();
        };
        let mut out: Vec<Entity> = state
            .file_entities
            .get(file_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.entities.get(id))
                    .filter(|e| kinds.map_or(true, |ks| ks.contains(&e.kind)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|e| (e.span.start_line, e.span.start_column));
        out
    }

    /// Outgoing relationships of an entity.
    pub fn outgoing(&self, id: EntityId) -> Vec<Relationship> {
        let state = self.state.read();
        state
            .outgoing
            .get(&id)
            .map(|rel_ids| {
                rel_ids
                    .iter()
                    .filter_map(|rid| state.relationships.get(rid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Incoming (resolved) relationships of an entity.
    pub fn incoming(&self, id: EntityId) -> Vec<Relationship> {
        let state = self.state.read();
        state
            .incoming
            .get(&id)
            .map(|rel_ids| {
                rel_ids
                    .iter()
                    .filter_map(|rid| state.relationships.get(rid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// In/out degree of an entity over resolved relationships.
    pub fn degree(&self, id: EntityId) -> (usize, usize) {
        let state = self.state.read();
        (
            state.incoming.get(&id).map_or(0, Vec::len),
            state.outgoing.get(&id).map_or(0, Vec::len),
        )
    }

    /// Clone of every stored entity. Used by whole-graph analyses; bounded
    /// by the indexed-repository size.
    pub fn entities_snapshot(&self) -> Vec<Entity> {
        self.state.read().entities.values().cloned().collect()
    }

    /// Clone of every stored relationship.
    pub fn relationships_snapshot(&self) -> Vec<Relationship> {
        self.state.read().relationships.values().cloned().collect()
    }

    pub fn stats(&self) -> GraphStats {
        let state = self.state.read();
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        for entity in state.entities.values() {
            *by_kind.entry(entity.kind.as_str().to_string()).or_default() += 1;
        }
        GraphStats {
            files: state.files.len(),
            entities: state.entities.len(),
            relationships: state.relationships.len(),
            unresolved_targets: state.unresolved.values().map(Vec::len).sum(),
            entities_by_kind: by_kind,
        }
    }

    /// Write a fresh snapshot and truncate the journal.
    pub fn snapshot(&self) -> Result<()> {
        self.check_poisoned()?;
        let state = self.state.write();
        let persisted = state.to_persisted();
        drop_journal_and_write_snapshot(&self.dir, &persisted, &self.journal)?;
        self.writes_since_snapshot.store(0, Ordering::Relaxed);
        info!(entities = persisted.entities.len(), "graph snapshot written");
        Ok(())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }

    // ---- Internals -------------------------------------------------------

    fn check_poisoned(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(CodeGraphError::StorePoisoned.into());
        }
        Ok(())
    }

    fn append_journal(&self, record: &JournalRecord) -> Result<()> {
        let bytes = bincode::serialize(record).context("serializing journal record")?;
        let mut journal = self.journal.lock();
        let result = crate::wal::append_record(&mut journal, &bytes);
        if result.is_err() {
            // A partial append leaves a torn tail that replay will discard,
            // but this process can no longer trust its position.
            self.poisoned.store(true, Ordering::Relaxed);
        }
        result
    }

    fn maybe_snapshot(&self) -> Result<()> {
        let writes = self.writes_since_snapshot.fetch_add(1, Ordering::Relaxed) + 1;
        if writes >= SNAPSHOT_INTERVAL {
            self.snapshot()?;
        }
        Ok(())
    }
}

impl GraphState {
    fn from_persisted(persisted: PersistedState) -> Result<Self> {
        let mut state = GraphState {
            next_rel_id: persisted.next_rel_id,
            ..Default::default()
        };
        for file in persisted.files {
            state.files_by_path.insert(file.path.clone(), file.id);
            state.files.insert(file.id, file);
        }
        for entity in persisted.entities {
            state.index_entity(&entity);
            state.entities.insert(entity.id, entity);
        }
        for (rel_id, rel) in persisted.relationships {
            state.index_relationship(rel_id, &rel);
            state.relationships.insert(rel_id, rel);
        }
        Ok(state)
    }

    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            schema_version: SCHEMA_VERSION,
            files: self.files.values().cloned().collect(),
            entities: self.entities.values().cloned().collect(),
            relationships: self
                .relationships
                .iter()
                .map(|(id, rel)| (*id, rel.clone()))
                .collect(),
            next_rel_id: self.next_rel_id,
        }
    }

    fn apply(&mut self, write_set: WriteSet) -> WriteStats {
        let file_id = write_set.file.id;
        let mut stats = WriteStats::default();

        let prior: HashSet<EntityId> = self
            .file_entities
            .get(&file_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let new_ids: HashSet<EntityId> = write_set.entities.iter().map(|e| e.id).collect();

        // Entities present only in the prior set are deleted, with cascade.
        for id in prior.difference(&new_ids) {
            self.remove_entity(*id);
            stats.entities_deleted += 1;
        }

        // The file is the origin of all its outgoing relationships, so its
        // relationship set is fully replaced.
        if let Some(rel_ids) = self.file_relationships.remove(&file_id) {
            for rel_id in rel_ids {
                self.remove_relationship(rel_id);
            }
        }

        for entity in write_set.entities {
            let existed = prior.contains(&entity.id);
            if existed {
                let unchanged = self
                    .entities
                    .get(&entity.id)
                    .map(|current| *current == entity)
                    .unwrap_or(false);
                if !unchanged {
                    self.unindex_entity(entity.id);
                    self.index_entity(&entity);
                    self.entities.insert(entity.id, entity);
                    stats.entities_updated += 1;
                } else {
                    self.entities.insert(entity.id, entity);
                }
            } else {
                self.index_entity(&entity);
                self.entities.insert(entity.id, entity);
                stats.entities_inserted += 1;
            }
        }

        for rel in write_set.relationships {
            // A source that was filtered out upstream must never produce a
            // dangling edge.
            if !self.entities.contains_key(&rel.source) {
                continue;
            }
            let rel_id = self.next_rel_id;
            self.next_rel_id += 1;
            self.index_relationship(rel_id, &rel);
            self.relationships.insert(rel_id, rel);
            stats.relationships_written += 1;
        }

        self.files_by_path
            .insert(write_set.file.path.clone(), file_id);
        self.files.insert(file_id, write_set.file);
        stats
    }

    fn remove_file(&mut self, path: &Path) -> WriteStats {
        let mut stats = WriteStats::default();
        let Some(file_id) = self.files_by_path.remove(path) else {
            return stats;
        };
        self.files.remove(&file_id);

        if let Some(rel_ids) = self.file_relationships.remove(&file_id) {
            for rel_id in rel_ids {
                self.remove_relationship(rel_id);
            }
        }
        if let Some(entity_ids) = self.file_entities.remove(&file_id) {
            for id in entity_ids.clone() {
                self.remove_entity(id);
                stats.entities_deleted += 1;
            }
        }
        stats
    }

    fn index_entity(&mut self, entity: &Entity) {
        self.file_entities
            .entry(entity.file_id)
            .or_default()
            .push(entity.id);
        self.by_name
            .entry(entity.name.clone())
            .or_default()
            .push(entity.id);
        if entity.qualified_name != entity.name {
            self.by_qualified
                .entry(entity.qualified_name.clone())
                .or_default()
                .push(entity.id);
        }
    }

    fn unindex_entity(&mut self, id: EntityId) {
        let Some(entity) = self.entities.get(&id) else {
            return;
        };
        let (file_id, name, qualified) = (
            entity.file_id,
            entity.name.clone(),
            entity.qualified_name.clone(),
        );
        if let Some(ids) = self.file_entities.get_mut(&file_id) {
            ids.retain(|other| *other != id);
        }
        if let Some(ids) = self.by_name.get_mut(&name) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_name.remove(&name);
            }
        }
        if let Some(ids) = self.by_qualified.get_mut(&qualified) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_qualified.remove(&qualified);
            }
        }
    }

    /// Remove an entity and every relationship in which it is an endpoint.
    fn remove_entity(&mut self, id: EntityId) {
        self.unindex_entity(id);
        self.entities.remove(&id);

        let endpoint_rels: Vec<u64> = self
            .outgoing
            .get(&id)
            .into_iter()
            .flatten()
            .chain(self.incoming.get(&id).into_iter().flatten())
            .copied()
            .collect();
        for rel_id in endpoint_rels {
            self.remove_relationship(rel_id);
        }
        self.outgoing.remove(&id);
        self.incoming.remove(&id);
    }

    fn index_relationship(&mut self, rel_id: u64, rel: &Relationship) {
        self.file_relationships
            .entry(rel.file_id)
            .or_default()
            .push(rel_id);
        self.outgoing.entry(rel.source).or_default().push(rel_id);
        match &rel.target {
            RelTarget::Entity(target) => {
                self.incoming.entry(*target).or_default().push(rel_id);
            }
            RelTarget::Name(name) => {
                self.unresolved.entry(name.clone()).or_default().push(rel_id);
            }
        }
    }

    fn remove_relationship(&mut self, rel_id: u64) {
        let Some(rel) = self.relationships.remove(&rel_id) else {
            return;
        };
        if let Some(ids) = self.file_relationships.get_mut(&rel.file_id) {
            ids.retain(|other| *other != rel_id);
        }
        if let Some(ids) = self.outgoing.get_mut(&rel.source) {
            ids.retain(|other| *other != rel_id);
        }
        match &rel.target {
            RelTarget::Entity(target) => {
                if let Some(ids) = self.incoming.get_mut(target) {
                    ids.retain(|other| *other != rel_id);
                }
            }
            RelTarget::Name(name) => {
                if let Some(ids) = self.unresolved.get_mut(name) {
                    ids.retain(|other| *other != rel_id);
                    if ids.is_empty() {
                        self.unresolved.remove(name);
                    }
                }
            }
        }
    }

    /// Attempt to resolve one relationship's name target. Returns true when
    /// the target became an entity ID.
    fn try_resolve(&mut self, rel_id: u64) -> bool {
        let Some(rel) = self.relationships.get(&rel_id) else {
            return false;
        };
        let Some(name) = rel.target.as_name().map(str::to_string) else {
            return false;
        };
        let source_language = match self.entities.get(&rel.source) {
            Some(entity) => entity.language,
            None => return false,
        };
        let source_file = rel.file_id;

        let resolved = self.lookup_unique(&name, source_language, source_file);
        let Some(target_id) = resolved else {
            return false;
        };

        // Flip the target, then repair both indexes.
        if let Some(ids) = self.unresolved.get_mut(&name) {
            ids.retain(|other| *other != rel_id);
            if ids.is_empty() {
                self.unresolved.remove(&name);
            }
        }
        self.incoming.entry(target_id).or_default().push(rel_id);
        if let Some(rel) = self.relationships.get_mut(&rel_id) {
            rel.target = RelTarget::Entity(target_id);
        }
        true
    }

    /// Best-match lookup: exact qualified name in the same language, else a
    /// unique simple-name match, disambiguated through the source file's
    /// imports. Ambiguity resolves to nothing.
    fn lookup_unique(
        &self,
        name: &str,
        language: crate::parsing::SupportedLanguage,
        source_file: FileId,
    ) -> Option<EntityId> {
        let qualified: Vec<EntityId> = self
            .by_qualified
            .get(name)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.entities
                    .get(id)
                    .map(|e| e.language == language && e.kind != EntityKind::Import)
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        if qualified.len() == 1 {
            return Some(qualified[0]);
        }

        let simple = simple_name(name);
        let candidates: Vec<EntityId> = self
            .by_name
            .get(simple)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.entities
                    .get(id)
                    .map(|e| e.language == language && e.kind != EntityKind::Import)
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        match candidates.len() {
            0 => None,
            1 => Some(candidates[0]),
            _ => {
                // Disambiguate through the source file's imported modules.
                let imported: HashSet<String> = self
                    .file_entities
                    .get(&source_file)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.entities.get(id))
                    .filter(|e| e.kind == EntityKind::Import)
                    .map(|e| module_stem(&e.name).to_string())
                    .collect();
                let matched: Vec<EntityId> = candidates
                    .into_iter()
                    .filter(|id| {
                        self.entities
                            .get(id)
                            .and_then(|e| e.file_path.file_stem().and_then(|s| s.to_str()))
                            .map(|stem| imported.contains(stem))
                            .unwrap_or(false)
                    })
                    .collect();
                if matched.len() == 1 {
                    Some(matched[0])
                } else {
                    None
                }
            }
        }
    }
}

/// Last path segment of a possibly dotted or scoped name.
pub fn simple_name(name: &str) -> &str {
    let after_scope = name.rsplit("::").next().unwrap_or(name);
    let after_dot = after_scope.rsplit('.').next().unwrap_or(after_scope);
    after_dot.rsplit('/').next().unwrap_or(after_dot)
}

/// Module stem of an import path: `./utils/fs-extra` → `fs-extra`,
/// `stdio.h` → `stdio`.
pub fn module_stem(path: &str) -> &str {
    let last = path
        .trim_matches(['\'', '"'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path);
    last.split('.').next().unwrap_or(last)
}

fn parse_snapshot(bytes: &[u8]) -> Result<PersistedState> {
    #[derive(Deserialize)]
    struct Header {
        magic: u32,
        schema_version: u32,
    }
    let header: Header = bincode::deserialize(bytes)
        .map_err(|_| CodeGraphError::StorageCorrupted("unreadable snapshot header".into()))?;
    if header.magic != SNAPSHOT_MAGIC {
        return Err(CodeGraphError::StorageCorrupted("bad snapshot magic".into()).into());
    }
    if header.schema_version > SCHEMA_VERSION {
        return Err(CodeGraphError::SchemaTooNew {
            found: header.schema_version,
            supported: SCHEMA_VERSION,
        }
        .into());
    }
    let header_len = bincode::serialized_size(&(header.magic, header.schema_version))? as usize;
    let persisted: PersistedState = bincode::deserialize(&bytes[header_len..])
        .map_err(|_| CodeGraphError::StorageCorrupted("unreadable snapshot body".into()))?;
    Ok(persisted)
}

fn write_snapshot_file(path: &Path, persisted: &PersistedState) -> Result<()> {
    let mut bytes =
        bincode::serialize(&(SNAPSHOT_MAGIC, persisted.schema_version)).context("header")?;
    bytes.extend(bincode::serialize(persisted).context("snapshot body")?);
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn drop_journal_and_write_snapshot(
    dir: &Path,
    persisted: &PersistedState,
    journal: &Mutex<std::fs::File>,
) -> Result<()> {
    write_snapshot_file(&dir.join(SNAPSHOT_FILE), persisted)?;
    let mut guard = journal.lock();
    guard.set_len(0)?;
    guard.seek(SeekFrom::Start(0))?;
    Ok(())
}

/// Replay the journal into `state`. Torn or corrupt tails are truncated by
/// the log reader, so a partial write set is fully rolled back.
fn replay_journal(path: &Path, state: &mut GraphState) -> Result<()> {
    let mut replayed = 0usize;
    for body in crate::wal::read_records(path)? {
        match bincode::deserialize::<JournalRecord>(&body) {
            Ok(JournalRecord::Apply(write_set)) => {
                state.apply(*write_set);
                replayed += 1;
            }
            Ok(JournalRecord::RemoveFile(path)) => {
                state.remove_file(&path);
                replayed += 1;
            }
            Err(_) => break,
        }
    }
    if replayed > 0 {
        info!(records = replayed, "journal replayed");
        record(Counter::Operations);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::fingerprint;
    use crate::parsing::{EntityExtractor, ParserCore, SupportedLanguage};
    use anyhow::Result;
    use std::sync::Arc;

    fn extraction(source: &str, path: &str) -> crate::parsing::ExtractionResult {
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

    fn write_set_from(result: &crate::parsing::ExtractionResult) -> WriteSet {
        WriteSet {
            file: result.file.clone(),
            entities: result.entities.clone(),
            relationships: result.relationships.clone(),
        }
    }

    #[test]
    fn apply_and_query_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = GraphStore::open(dir.path())?;

        let result = extraction(
            "def add(a, b):\n    return a + b\n\ndef main():\n    return add(1, 2)\n",
            "lib.py",
        );
        let stats = store.apply_write_set(write_set_from(&result))?;
        assert_eq!(stats.entities_inserted, 2);

        let entities = store.entities_in_file(Path::new("lib.py"), None);
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].name, "add");
        assert_eq!(entities[1].name, "main");
        Ok(())
    }

    #[test]
    fn resolution_links_calls_to_entities() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = GraphStore::open(dir.path())?;

        let result = extraction(
            "def add(a, b):\n    return a + b\n\ndef main():\n    return add(1, 2)\n",
            "lib.py",
        );
        store.apply_write_set(write_set_from(&result))?;
        let resolved = store.resolve_names(&[result.file.id]);
        assert_eq!(resolved, 1);

        let add = store.find_by_name("add").pop().expect("add entity");
        let incoming = store.incoming(add.id);
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].kind, RelationKind::Calls);

        let main = store.find_by_name("main").pop().expect("main entity");
        assert_eq!(incoming[0].source, main.id);

        // Resolution is idempotent.
        assert_eq!(store.resolve_names(&[result.file.id]), 0);
        Ok(())
    }

    #[test]
    fn reapplying_identical_write_set_is_noop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = GraphStore::open(dir.path())?;

        let result = extraction("def f():\n    return 1\n", "f.py");
        store.apply_write_set(write_set_from(&result))?;
        let second = store.apply_write_set(write_set_from(&result))?;
        assert_eq!(second.entities_inserted, 0);
        assert_eq!(second.entities_updated, 0);
        assert_eq!(second.entities_deleted, 0);
        Ok(())
    }

    #[test]
    fn file_update_preserves_surviving_entity_ids() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = GraphStore::open(dir.path())?;

        let v1 = extraction("def add(a, b):\n    return a + b\n", "lib.py");
        store.apply_write_set(write_set_from(&v1))?;
        let add_v1 = store.find_by_name("add").pop().expect("add");

        let v2 = extraction(
            "def add(a, b):\n    return a + b\n\ndef sub(a, b):\n    return a - b\n",
            "lib.py",
        );
        let stats = store.apply_write_set(write_set_from(&v2))?;
        assert_eq!(stats.entities_inserted, 1);
        assert_eq!(stats.entities_deleted, 0);

        let add_v2 = store.find_by_name("add").pop().expect("add");
        assert_eq!(add_v1.id, add_v2.id);
        Ok(())
    }

    #[test]
    fn removing_a_file_cascades() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = GraphStore::open(dir.path())?;

        let result = extraction("def gone():\n    return 0\n", "gone.py");
        store.apply_write_set(write_set_from(&result))?;
        assert_eq!(store.stats().entities, 1);

        store.remove_file(Path::new("gone.py"))?;
        let stats = store.stats();
        assert_eq!(stats.entities, 0);
        assert_eq!(stats.relationships, 0);
        assert!(store.find_by_name("gone").is_empty());
        Ok(())
    }

    #[test]
    fn journal_replay_restores_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let result = extraction(
            "def add(a, b):\n    return a + b\n\ndef main():\n    return add(1, 2)\n",
            "lib.py",
        );
        {
            let store = GraphStore::open(dir.path())?;
            store.apply_write_set(write_set_from(&result))?;
        }

        let reopened = GraphStore::open(dir.path())?;
        assert_eq!(reopened.stats().entities, 2);
        // Resolution re-derived after replay.
        let add = reopened.find_by_name("add").pop().expect("add");
        assert_eq!(reopened.incoming(add.id).len(), 1);
        Ok(())
    }

    #[test]
    fn torn_journal_tail_is_rolled_back() -> Result<()> {
        use std::io::Write;

        let dir = tempfile::tempdir()?;
        let result = extraction("def solid():\n    return 1\n", "solid.py");
        {
            let store = GraphStore::open(dir.path())?;
            store.apply_write_set(write_set_from(&result))?;
        }

        // Simulate a crash mid-append: garbage after the valid record.
        let journal_path = dir.path().join(JOURNAL_FILE);
        let mut file = std::fs::OpenOptions::new().append(true).open(&journal_path)?;
        file.write_all(&[0x42, 0x00, 0x00, 0x00, 0xde, 0xad])?;
        drop(file);

        let reopened = GraphStore::open(dir.path())?;
        assert_eq!(reopened.stats().entities, 1);
        Ok(())
    }

    #[test]
    fn snapshot_then_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let result = extraction("def keep():\n    return 1\n", "keep.py");
        {
            let store = GraphStore::open(dir.path())?;
            store.apply_write_set(write_set_from(&result))?;
            store.snapshot()?;
        }
        assert!(dir.path().join(SNAPSHOT_FILE).exists());

        let reopened = GraphStore::open(dir.path())?;
        assert_eq!(reopened.stats().entities, 1);
        Ok(())
    }

    #[test]
    fn newer_schema_is_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let persisted = PersistedState {
            schema_version: SCHEMA_VERSION + 1,
            files: Vec::new(),
            entities: Vec::new(),
            relationships: Vec::new(),
            next_rel_id: 0,
        };
        write_snapshot_file(&dir.path().join(SNAPSHOT_FILE), &persisted)?;

        let err = GraphStore::open(dir.path()).unwrap_err();
        assert_eq!(
            crate::errors::as_codegraph_error(&err).map(|e| e.code()),
            Some("SCHEMA_TOO_NEW")
        );
        Ok(())
    }

    #[test]
    fn readers_see_consistent_file_views() -> Result<()> {
        // A write set applies under the write lock, so a reader sees either
        // the old fingerprint's entities or the new fingerprint's entities,
        // never a mixture.
        let dir = tempfile::tempdir()?;
        let store = Arc::new(GraphStore::open(dir.path())?);

        let v1 = extraction("def a():\n    return 1\n\ndef b():\n    return 2\n", "x.py");
        store.apply_write_set(write_set_from(&v1))?;

        let v2 = extraction("def c():\n    return 3\n\ndef d():\n    return 4\n", "x.py");

        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let entities = store.entities_in_file(Path::new("x.py"), None);
                    if entities.is_empty() {
                        continue;
                    }
                    let fp = entities[0].fingerprint;
                    assert!(
                        entities.iter().all(|e| e.fingerprint == fp),
                        "mixed fingerprints observed"
                    );
                }
            })
        };

        store.apply_write_set(write_set_from(&v2))?;
        reader.join().expect("reader thread");
        Ok(())
    }

    #[test]
    fn simple_name_and_module_stem() {
        assert_eq!(simple_name("pkg.mod.f"), "f");
        assert_eq!(simple_name("ns::Class"), "Class");
        assert_eq!(simple_name("plain"), "plain");
        assert_eq!(module_stem("./utils/fs-extra"), "fs-extra");
        assert_eq!(module_stem("stdio.h"), "stdio");
        assert_eq!(module_stem("b"), "b");
    }
}

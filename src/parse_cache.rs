// Parse cache
// Bounded LRU from content fingerprint to extraction result: a hash map over
// intrusively linked slots, with a memory accountant that evicts from the
// cold end until the configured budget holds. All operations are O(1)
// amortised. The cache snapshots to disk so a restart can warm it; a
// snapshot written by a different grammar or extractor version is discarded
// wholesale.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::hashing::{EXTRACTOR_VERSION, GRAMMAR_VERSION};
use crate::observability::{record, Counter};
use crate::parsing::ExtractionResult;
use crate::types::Fingerprint;

const SNAPSHOT_MAGIC: u32 = 0x43_47_50_43; // "CGPC"

/// Thread-safe LRU cache of extraction results keyed by fingerprint.
pub struct ParseCache {
    inner: Mutex<LruInner>,
}

struct LruInner {
    map: HashMap<u128, CacheSlot>,
    /// Most recently used.
    head: Option<u128>,
    /// Least recently used; eviction end.
    tail: Option<u128>,
    total_bytes: usize,
    capacity_bytes: usize,
}

struct CacheSlot {
    value: Arc<ExtractionResult>,
    cost: usize,
    prev: Option<u128>,
    next: Option<u128>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    magic: u32,
    grammar_version: u32,
    extractor_version: u32,
}

impl ParseCache {
    /// Create a cache with the given memory budget in bytes.
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                head: None,
                tail: None,
                total_bytes: 0,
                capacity_bytes,
            }),
        }
    }

    /// Look up an extraction result. A hit guarantees the stored value is
    /// identical to a fresh extraction at this fingerprint, because the
    /// fingerprint covers content, language, and both version constants.
    pub fn get(&self, fingerprint: Fingerprint) -> Option<Arc<ExtractionResult>> {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&fingerprint.0) {
            inner.unlink(fingerprint.0);
            inner.push_front(fingerprint.0);
            record(Counter::ParseCacheHits);
            Some(Arc::clone(&inner.map[&fingerprint.0].value))
        } else {
            record(Counter::ParseCacheMisses);
            None
        }
    }

    /// Insert an extraction result, evicting cold entries past the budget.
    pub fn put(&self, fingerprint: Fingerprint, value: Arc<ExtractionResult>) {
        let cost = value.estimated_bytes();
        let mut inner = self.inner.lock();

        if inner.map.contains_key(&fingerprint.0) {
            inner.unlink(fingerprint.0);
            let old = inner
                .map
                .remove(&fingerprint.0)
                .expect("slot present after contains_key");
            inner.total_bytes -= old.cost;
        }

        inner.map.insert(
            fingerprint.0,
            CacheSlot {
                value,
                cost,
                prev: None,
                next: None,
            },
        );
        inner.total_bytes += cost;
        inner.push_front(fingerprint.0);
        inner.evict_over_budget();
    }

    /// Number of cached extractions.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounted memory footprint in bytes.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    /// Reconfiguration interface: change the budget, evicting as needed.
    pub fn resize(&self, capacity_bytes: usize) {
        let mut inner = self.inner.lock();
        inner.capacity_bytes = capacity_bytes;
        inner.evict_over_budget();
    }

    /// Emergency eviction: drop roughly `fraction` of accounted bytes,
    /// starting from the cold end.
    pub fn evict_fraction(&self, fraction: f64) {
        let mut inner = self.inner.lock();
        let target = (inner.total_bytes as f64 * (1.0 - fraction.clamp(0.0, 1.0))) as usize;
        let mut evicted = 0usize;
        while inner.total_bytes > target {
            match inner.pop_tail() {
                Some(cost) => evicted += cost,
                None => break,
            }
        }
        if evicted > 0 {
            debug!(evicted_bytes = evicted, "parse cache emergency eviction");
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.head = None;
        inner.tail = None;
        inner.total_bytes = 0;
    }

    /// Persist the cache contents so a restart can warm from disk.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let inner = self.inner.lock();
        let header = SnapshotHeader {
            magic: SNAPSHOT_MAGIC,
            grammar_version: GRAMMAR_VERSION,
            extractor_version: EXTRACTOR_VERSION,
        };
        // Warmest first, so restore re-inserts in usefulness order.
        let mut entries: Vec<(u128, &ExtractionResult)> = Vec::with_capacity(inner.map.len());
        let mut cursor = inner.head;
        while let Some(key) = cursor {
            let slot = &inner.map[&key];
            entries.push((key, slot.value.as_ref()));
            cursor = slot.next;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let mut bytes = bincode::serialize(&header).context("serializing cache header")?;
        bytes.extend(bincode::serialize(&entries).context("serializing cache entries")?);
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        info!(entries = entries.len(), "parse cache snapshot written");
        Ok(())
    }

    /// Restore a snapshot. Snapshots from other grammar/extractor versions
    /// are ignored: a cache hit must always equal a fresh extraction.
    pub fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let header: SnapshotHeader = match bincode::deserialize(&bytes) {
            Ok(header) => header,
            Err(_) => {
                warn!("parse cache snapshot unreadable, ignoring");
                return Ok(0);
            }
        };
        if header.magic != SNAPSHOT_MAGIC
            || header.grammar_version != GRAMMAR_VERSION
            || header.extractor_version != EXTRACTOR_VERSION
        {
            warn!("parse cache snapshot from a different version, ignoring");
            return Ok(0);
        }

        let header_len = bincode::serialized_size(&header)? as usize;
        let entries: Vec<(u128, ExtractionResult)> = match bincode::deserialize(&bytes[header_len..])
        {
            Ok(entries) => entries,
            Err(_) => {
                warn!("parse cache snapshot body corrupt, ignoring");
                return Ok(0);
            }
        };

        let count = entries.len();
        // Re-insert coldest first so the final order matches the snapshot.
        for (key, value) in entries.into_iter().rev() {
            self.put(Fingerprint(key), Arc::new(value));
        }
        info!(entries = count, "parse cache warmed from snapshot");
        Ok(count)
    }
}

impl LruInner {
    fn unlink(&mut self, key: u128) {
        let (prev, next) = {
            let slot = &self.map[&key];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.map.get_mut(&p).expect("lru prev link").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.map.get_mut(&n).expect("lru next link").prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, key: u128) {
        let old_head = self.head;
        {
            let slot = self.map.get_mut(&key).expect("slot just inserted");
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            self.map.get_mut(&h).expect("lru head link").prev = Some(key);
        }
        self.head = Some(key);
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    /// Remove the least-recently-used entry, returning its cost.
    fn pop_tail(&mut self) -> Option<usize> {
        let tail = self.tail?;
        self.unlink(tail);
        let slot = self.map.remove(&tail).expect("tail slot present");
        self.total_bytes -= slot.cost;
        Some(slot.cost)
    }

    fn evict_over_budget(&mut self) {
        while self.total_bytes > self.capacity_bytes && self.map.len() > 1 {
            if self.pop_tail().is_none() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::fingerprint;
    use crate::parsing::{EntityExtractor, ParserCore, SupportedLanguage};

    fn sample_result(source: &str, path: &str) -> ExtractionResult {
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

    #[test]
    fn hit_returns_identical_extraction() {
        let cache = ParseCache::new(10 * 1024 * 1024);
        let source = "def f():\n    return 1\n";
        let fresh = sample_result(source, "f.py");
        let fp = fresh.file.fingerprint;
        cache.put(fp, Arc::new(fresh.clone()));

        let hit = cache.get(fp).expect("cache hit");
        assert_eq!(*hit, fresh);
        assert!(cache.get(Fingerprint(999)).is_none());
    }

    #[test]
    fn lru_evicts_cold_entries_when_over_budget() {
        let cache = ParseCache::new(2_000);
        let a = sample_result("def a():\n    return 1\n", "a.py");
        let b = sample_result("def b():\n    return 2\n", "b.py");
        let c = sample_result("def c():\n    return 3\n", "c.py");
        let (fa, fb, fc) = (a.file.fingerprint, b.file.fingerprint, c.file.fingerprint);

        cache.put(fa, Arc::new(a));
        cache.put(fb, Arc::new(b));
        // Touch `a` so `b` is the cold entry.
        assert!(cache.get(fa).is_some());
        cache.put(fc, Arc::new(c));

        assert!(cache.total_bytes() <= 2_000 || cache.len() == 1);
        assert!(cache.get(fb).is_none(), "cold entry should be evicted");
    }

    #[test]
    fn resize_evicts_to_new_budget() {
        let cache = ParseCache::new(1024 * 1024);
        for i in 0..20 {
            let source = format!("def f{i}():\n    return {i}\n");
            let result = sample_result(&source, &format!("f{i}.py"));
            cache.put(result.file.fingerprint, Arc::new(result));
        }
        assert_eq!(cache.len(), 20);
        cache.resize(1_000);
        assert!(cache.total_bytes() <= 1_000 || cache.len() == 1);
    }

    #[test]
    fn evict_fraction_drops_cold_end() {
        let cache = ParseCache::new(1024 * 1024);
        for i in 0..10 {
            let source = format!("def f{i}():\n    return {i}\n");
            let result = sample_result(&source, &format!("f{i}.py"));
            cache.put(result.file.fingerprint, Arc::new(result));
        }
        let before = cache.total_bytes();
        cache.evict_fraction(0.5);
        assert!(cache.total_bytes() <= before / 2 + 200);
    }

    #[test]
    fn snapshot_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("cache.bin");

        let cache = ParseCache::new(1024 * 1024);
        let result = sample_result("def f():\n    return 1\n", "f.py");
        let fp = result.file.fingerprint;
        cache.put(fp, Arc::new(result.clone()));
        cache.save_snapshot(&snapshot)?;

        let restored = ParseCache::new(1024 * 1024);
        assert_eq!(restored.load_snapshot(&snapshot)?, 1);
        assert_eq!(*restored.get(fp).expect("warm hit"), result);
        Ok(())
    }

    #[test]
    fn missing_snapshot_is_not_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = ParseCache::new(1024);
        assert_eq!(cache.load_snapshot(&dir.path().join("absent.bin"))?, 0);
        Ok(())
    }
}

// Query agent
// Owns the query catalogue over the graph and vector stores. Every query
// returns a deterministic total order, documented per method, so callers
// and tests can rely on byte-stable output. Names that match more than one
// entity are surfaced as ambiguity (all matches returned), never picked
// silently.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use crate::agents::{AgentHealth, AgentKind, HealthReport, HealthState, Lifecycle, TaskHandler};
use crate::analysis::{
    self, CloneCluster, HotspotMetric, ImpactedEntity, ModuleDependency, ModuleNode,
};
use crate::embeddings::EmbeddingProvider;
use crate::errors::CodeGraphError;
use crate::graph_store::GraphStore;
use crate::observability::{record, Counter};
use crate::parsing::SupportedLanguage;
use crate::task_queue::{Task, TaskKind};
use crate::types::{Entity, EntityId, EntityKind, RelTarget, RelationKind};
use crate::vector_store::{VectorFilter, VectorStore};

/// A catalogue input naming an entity either uniquely or by name.
#[derive(Debug, Clone)]
pub enum EntityRef {
    Id(EntityId),
    Name(String),
}

/// Edge direction relative to the queried entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// One edge reached by a relationship traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationRecord {
    pub relation: RelationKind,
    pub direction: Direction,
    /// Resolved endpoint, when the target is an entity.
    pub entity: Option<Entity>,
    /// Unresolved endpoint name, when it is not.
    pub target_name: Option<String>,
    pub hop: usize,
}

/// One refactoring advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefactoringSuggestion {
    pub entity: String,
    pub issue: String,
    pub suggestion: String,
}

pub struct QueryAgent {
    graph: Arc<GraphStore>,
    vectors: Arc<VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    health: Arc<HealthState>,
}

impl QueryAgent {
    pub fn new(
        graph: Arc<GraphStore>,
        vectors: Arc<VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            graph,
            vectors,
            provider,
            health: Arc::new(HealthState::new(AgentKind::Query)),
        })
    }

    /// All entities a reference names. Empty input is an input error; an
    /// unknown ID or name yields `EntityNotFound`. A name may legitimately
    /// return several matches; the caller decides what ambiguity means.
    pub fn resolve_ref(&self, entity_ref: &EntityRef) -> Result<Vec<Entity>> {
        let matches = match entity_ref {
            EntityRef::Id(id) => self.graph.get_entity(*id).into_iter().collect::<Vec<_>>(),
            EntityRef::Name(name) => {
                if name.trim().is_empty() {
                    return Err(
                        CodeGraphError::InvalidArgument("empty entity name".to_string()).into()
                    );
                }
                self.graph.find_by_name(name)
            }
        };
        if matches.is_empty() {
            let shown = match entity_ref {
                EntityRef::Id(id) => id.to_string(),
                EntityRef::Name(name) => name.clone(),
            };
            return Err(CodeGraphError::EntityNotFound(shown).into());
        }
        Ok(matches)
    }

    /// Entities in a file, ordered by (start line, start column).
    pub fn entities_in_file(
        &self,
        path: &Path,
        kinds: Option<&[EntityKind]>,
    ) -> Result<Vec<Entity>> {
        record(Counter::QueriesServed);
        if self.graph.file_record(path).is_none() {
            return Err(CodeGraphError::FileNotFound(path.to_path_buf()).into());
        }
        Ok(self.graph.entities_in_file(path, kinds))
    }

    /// BFS over relationships up to `depth` hops in both directions.
    /// Ordered by (hop, resolved-entity ID); unresolved name targets sort
    /// after resolved ones within a hop, by name.
    pub fn relationships_for(
        &self,
        root: EntityId,
        depth: usize,
        kinds: Option<&[RelationKind]>,
    ) -> Vec<RelationRecord> {
        record(Counter::QueriesServed);
        let mut records = Vec::new();
        let mut visited: HashSet<EntityId> = HashSet::from([root]);
        let mut frontier: VecDeque<(EntityId, usize)> = VecDeque::from([(root, 0)]);

        while let Some((current, hop)) = frontier.pop_front() {
            if hop >= depth {
                continue;
            }
            let next_hop = hop + 1;

            for rel in self.graph.outgoing(current) {
                if kinds.map_or(false, |ks| !ks.contains(&rel.kind)) {
                    continue;
                }
                match &rel.target {
                    RelTarget::Entity(target) => {
                        if let Some(entity) = self.graph.get_entity(*target) {
                            records.push(RelationRecord {
                                relation: rel.kind,
                                direction: Direction::Outgoing,
                                entity: Some(entity),
                                target_name: None,
                                hop: next_hop,
                            });
                            if visited.insert(*target) {
                                frontier.push_back((*target, next_hop));
                            }
                        }
                    }
                    RelTarget::Name(name) => {
                        records.push(RelationRecord {
                            relation: rel.kind,
                            direction: Direction::Outgoing,
                            entity: None,
                            target_name: Some(name.clone()),
                            hop: next_hop,
                        });
                    }
                }
            }

            for rel in self.graph.incoming(current) {
                if kinds.map_or(false, |ks| !ks.contains(&rel.kind)) {
                    continue;
                }
                if let Some(entity) = self.graph.get_entity(rel.source) {
                    records.push(RelationRecord {
                        relation: rel.kind,
                        direction: Direction::Incoming,
                        entity: Some(entity),
                        target_name: None,
                        hop: next_hop,
                    });
                    if visited.insert(rel.source) {
                        frontier.push_back((rel.source, next_hop));
                    }
                }
            }
        }

        records.sort_by(|a, b| {
            a.hop
                .cmp(&b.hop)
                .then_with(|| match (&a.entity, &b.entity) {
                    (Some(ea), Some(eb)) => ea.id.cmp(&eb.id),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => a.target_name.cmp(&b.target_name),
                })
        });
        records
    }

    /// Reverse `calls`: entities that call the referenced one, ordered by
    /// (file path, start line, start column). Name references are
    /// restricted to resolved targets by construction.
    pub fn callers(&self, entity_ref: &EntityRef) -> Result<Vec<Entity>> {
        record(Counter::QueriesServed);
        let targets = self.resolve_ref(entity_ref)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for target in targets {
            for rel in self.graph.incoming(target.id) {
                if rel.kind != RelationKind::Calls {
                    continue;
                }
                if seen.insert(rel.source) {
                    if let Some(entity) = self.graph.get_entity(rel.source) {
                        out.push(entity);
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
        Ok(out)
    }

    /// Transitive reverse closure; see `analysis::impacted_by_change`.
    pub fn impacted_by_change(&self, id: EntityId, depth: usize) -> Result<Vec<ImpactedEntity>> {
        record(Counter::QueriesServed);
        if self.graph.get_entity(id).is_none() {
            return Err(CodeGraphError::EntityNotFound(id.to_string()).into());
        }
        Ok(analysis::impacted_by_change(&self.graph, id, depth))
    }

    /// Import cycles; see `analysis::import_cycles`.
    pub fn cycles(&self, scope: Option<&Path>) -> Vec<Vec<ModuleNode>> {
        record(Counter::QueriesServed);
        analysis::import_cycles(&self.graph, scope)
    }

    /// Module dependency aggregation; see `analysis::module_dependencies`.
    pub fn module_dependencies(&self, path: &Path) -> Vec<ModuleDependency> {
        record(Counter::QueriesServed);
        analysis::module_dependencies(&self.graph, path)
    }

    /// Clone clusters; see `analysis::detect_clones`.
    pub fn clones(&self, min_similarity: f32, scope: Option<&Path>) -> Vec<CloneCluster> {
        record(Counter::QueriesServed);
        analysis::detect_clones(&self.graph, &self.vectors, min_similarity, scope)
    }

    /// Embed the query, take the nearest entities, then re-rank with a
    /// small structural-centrality boost (log of fan-in). Ordered by final
    /// score descending, ties by entity ID.
    pub async fn semantic_search(
        &self,
        query: &str,
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<(Entity, f32)>> {
        record(Counter::QueriesServed);
        let query_vector = self.provider.embed_text(query).await?;
        let hits = self.vectors.k_nearest(&query_vector, k * 2, filter);

        let mut scored: Vec<(Entity, f32, f32)> = hits
            .into_iter()
            .filter_map(|(id, similarity)| {
                let entity = self.graph.get_entity(id)?;
                let (fan_in, _) = self.graph.degree(id);
                let boosted = similarity + 0.02 * ((1 + fan_in) as f32).ln();
                Some((entity, similarity, boosted))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(k);
        Ok(scored
            .into_iter()
            .map(|(entity, similarity, _)| (entity, similarity))
            .collect())
    }

    /// Top-k entities whose embeddings clear `threshold` for the given
    /// code text. Ordered by similarity descending, ties by entity ID.
    pub async fn find_similar(
        &self,
        code: &str,
        threshold: f32,
        k: usize,
    ) -> Result<Vec<(Entity, f32)>> {
        record(Counter::QueriesServed);
        let query_vector = self.provider.embed_text(code).await?;
        let hits = self.vectors.k_nearest(&query_vector, k, &VectorFilter::default());
        Ok(hits
            .into_iter()
            .filter(|(_, similarity)| *similarity >= threshold)
            .filter_map(|(id, similarity)| Some((self.graph.get_entity(id)?, similarity)))
            .collect())
    }

    /// Free-text structural search: exact, wildcard, prefix, then substring
    /// matches on names and qualified names, ranked by match quality with
    /// fan-in and entity ID as tie-breaks.
    pub fn structural_query(
        &self,
        text: &str,
        limit: usize,
        languages: Option<&[SupportedLanguage]>,
    ) -> Vec<Entity> {
        record(Counter::QueriesServed);
        let needle = text.trim();
        if needle.is_empty() {
            return Vec::new();
        }
        let lowered = needle.to_lowercase();

        let mut scored: Vec<(Entity, u32, usize)> = self
            .graph
            .entities_snapshot()
            .into_iter()
            .filter(|e| languages.map_or(true, |ls| ls.contains(&e.language)))
            .filter_map(|entity| {
                let name = entity.name.to_lowercase();
                let qualified = entity.qualified_name.to_lowercase();
                let score = if name == lowered || qualified == lowered {
                    400
                } else if matches_wildcard_pattern(&name, &lowered)
                    || matches_wildcard_pattern(&qualified, &lowered)
                {
                    300
                } else if name.starts_with(&lowered) {
                    200
                } else if name.contains(&lowered) || qualified.contains(&lowered) {
                    100
                } else {
                    return None;
                };
                let (fan_in, _) = self.graph.degree(entity.id);
                Some((entity, score, fan_in))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(limit);
        scored.into_iter().map(|(entity, _, _)| entity).collect()
    }

    /// Structural matches first, then semantic hits not already present,
    /// all restricted to the requested languages.
    pub async fn cross_language_search(
        &self,
        query: &str,
        languages: Option<&[SupportedLanguage]>,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let mut out = self.structural_query(query, limit, languages);
        if out.len() < limit {
            let filter = VectorFilter {
                language: None,
                kinds: None,
            };
            let seen: HashSet<EntityId> = out.iter().map(|e| e.id).collect();
            for (entity, _) in self.semantic_search(query, limit, &filter).await? {
                if out.len() >= limit {
                    break;
                }
                if languages.map_or(true, |ls| ls.contains(&entity.language))
                    && !seen.contains(&entity.id)
                {
                    out.push(entity);
                }
            }
        }
        Ok(out)
    }

    /// Entities related to one entity: direct graph neighbours plus
    /// embedding neighbours, deduplicated keeping the higher score.
    /// Ordered by score descending, ties by entity ID.
    pub async fn related_concepts(&self, id: EntityId, limit: usize) -> Result<Vec<(Entity, f32)>> {
        record(Counter::QueriesServed);
        if self.graph.get_entity(id).is_none() {
            return Err(CodeGraphError::EntityNotFound(id.to_string()).into());
        }

        let mut scores: HashMap<EntityId, f32> = HashMap::new();
        for record in self.relationships_for(id, 1, None) {
            if let Some(neighbour) = record.entity {
                if neighbour.id != id {
                    scores.entry(neighbour.id).or_insert(0.8);
                }
            }
        }
        if let Some(vector) = self.vectors.vector_of(id) {
            for (hit, similarity) in
                self.vectors
                    .k_nearest(&vector, limit * 2, &VectorFilter::default())
            {
                if hit == id {
                    continue;
                }
                let entry = scores.entry(hit).or_insert(0.0);
                if similarity > *entry {
                    *entry = similarity;
                }
            }
        }
        let mut out: Vec<(Entity, f32)> = scores
            .into_iter()
            .filter_map(|(other, score)| Some((self.graph.get_entity(other)?, score)))
            .collect();
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        out.truncate(limit);
        Ok(out)
    }

    /// Hotspot ranking. `changes` depends on VCS history this store does
    /// not hold, and is rejected with a pointer at the missing data source.
    pub fn hotspots(&self, metric: &str, limit: usize) -> Result<Vec<(Entity, u64)>> {
        record(Counter::QueriesServed);
        if metric.eq_ignore_ascii_case("changes") {
            return Err(CodeGraphError::InvalidArgument(
                "metric 'changes' requires VCS history, which is not indexed; \
                 use 'complexity' or 'coupling'"
                    .to_string(),
            )
            .into());
        }
        let metric = HotspotMetric::parse(metric).ok_or_else(|| {
            CodeGraphError::InvalidArgument(format!("unknown hotspot metric '{metric}'"))
        })?;
        Ok(analysis::hotspots(&self.graph, metric, limit))
    }

    /// Advisory heuristics over one file: long bodies, wide parameter
    /// lists, high complexity, high fan-out. Ordered by source position.
    pub fn suggest_refactoring(
        &self,
        path: &Path,
        focus: Option<&str>,
    ) -> Result<Vec<RefactoringSuggestion>> {
        record(Counter::QueriesServed);
        let entities = self.entities_in_file(path, None)?;
        let mut suggestions = Vec::new();
        for entity in entities {
            if let Some(focus) = focus {
                if !entity.name.contains(focus) && !entity.qualified_name.contains(focus) {
                    continue;
                }
            }
            if !entity.kind.is_callable() {
                continue;
            }
            let lines = entity.span.line_count();
            if lines > 50 {
                suggestions.push(RefactoringSuggestion {
                    entity: entity.qualified_name.clone(),
                    issue: format!("{lines} lines long"),
                    suggestion: "split into smaller functions with single responsibilities"
                        .to_string(),
                });
            }
            if entity.parameters.len() > 5 {
                suggestions.push(RefactoringSuggestion {
                    entity: entity.qualified_name.clone(),
                    issue: format!("{} parameters", entity.parameters.len()),
                    suggestion: "group related parameters into a struct or options object"
                        .to_string(),
                });
            }
            if entity.complexity > 300 {
                suggestions.push(RefactoringSuggestion {
                    entity: entity.qualified_name.clone(),
                    issue: format!("complexity proxy {} AST nodes", entity.complexity),
                    suggestion: "extract nested branches into named helpers".to_string(),
                });
            }
            let (_, fan_out) = self.graph.degree(entity.id);
            if fan_out > 10 {
                suggestions.push(RefactoringSuggestion {
                    entity: entity.qualified_name.clone(),
                    issue: format!("fan-out of {fan_out} dependencies"),
                    suggestion: "introduce a facade or reduce direct dependencies".to_string(),
                });
            }
        }
        Ok(suggestions)
    }
}

/// Match a name against a wildcard pattern such as `parse_*` or
/// `*_handler`, via the same glob matcher the ingest path uses for exclude
/// patterns. Patterns without a `*` never match here; exact and substring
/// matches are scored separately by the caller.
fn matches_wildcard_pattern(text: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return false;
    }
    glob::Pattern::new(pattern)
        .map(|compiled| compiled.matches(text))
        .unwrap_or(false)
}

#[async_trait]
impl Lifecycle for QueryAgent {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for QueryAgent {
    fn accepts(&self, kind: TaskKind) -> bool {
        matches!(kind, TaskKind::Query | TaskKind::Analyze)
    }

    async fn handle(&self, _task: Task) -> Result<()> {
        // Queries run synchronously through the conductor; the queue path
        // exists for DAG scheduling of heavy analyses.
        Ok(())
    }
}

impl HealthReport for QueryAgent {
    fn snapshot(&self) -> AgentHealth {
        self.health.snapshot()
    }
}

// Graph analyses
// Pure algorithms over store snapshots: transitive impact closure, import
// cycle detection (Tarjan SCC at module granularity), module dependency
// aggregation, two-stage clone detection, and hotspot ranking. Every result
// carries a documented total order so repeated runs agree byte for byte.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use crate::graph_store::{module_stem, GraphStore};
use crate::parsing::SupportedLanguage;
use crate::types::{Entity, EntityId, EntityKind, RelTarget, RelationKind};
use crate::vector_store::{cosine_similarity, VectorStore};

/// One entity reached by the impact closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactedEntity {
    pub entity: Entity,
    /// Reverse-dependency distance from the changed entity.
    pub hop: usize,
}

/// Transitive reverse closure over `calls` + `references` + `imports`.
/// Cycle-safe via a visited set. Ordered by (hop, entity ID).
pub fn impacted_by_change(
    graph: &GraphStore,
    start: EntityId,
    max_depth: usize,
) -> Vec<ImpactedEntity> {
    let mut visited: HashSet<EntityId> = HashSet::from([start]);
    let mut queue: VecDeque<(EntityId, usize)> = VecDeque::from([(start, 0)]);
    let mut out = Vec::new();

    while let Some((current, hop)) = queue.pop_front() {
        if hop >= max_depth {
            continue;
        }
        for rel in graph.incoming(current) {
            if !matches!(
                rel.kind,
                RelationKind::Calls | RelationKind::References | RelationKind::Imports
            ) {
                continue;
            }
            if !visited.insert(rel.source) {
                continue;
            }
            if let Some(entity) = graph.get_entity(rel.source) {
                out.push(ImpactedEntity {
                    entity,
                    hop: hop + 1,
                });
                queue.push_back((rel.source, hop + 1));
            }
        }
    }

    out.sort_by(|a, b| a.hop.cmp(&b.hop).then_with(|| a.entity.id.cmp(&b.entity.id)));
    out
}

/// A module-granularity node in the import graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleNode {
    pub path: PathBuf,
    pub module: String,
}

/// Strongly connected components of the import graph among files under
/// `scope` (the whole repository when `None`), size > 1 only. Components
/// are ordered by their first member's path; members by path.
pub fn import_cycles(graph: &GraphStore, scope: Option<&Path>) -> Vec<Vec<ModuleNode>> {
    let files: Vec<_> = graph
        .all_files()
        .into_iter()
        .filter(|f| scope.map_or(true, |s| f.path.starts_with(s)))
        .collect();

    // Module name → file, for resolving import targets inside the scope.
    let mut by_stem: HashMap<String, PathBuf> = HashMap::new();
    for file in &files {
        if let Some(stem) = file.path.file_stem().and_then(|s| s.to_str()) {
            by_stem.insert(stem.to_string(), file.path.clone());
        }
    }

    let mut nodes: HashMap<PathBuf, NodeIndex> = HashMap::new();
    let mut digraph: DiGraph<ModuleNode, ()> = DiGraph::new();
    for file in &files {
        let module = file
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let index = digraph.add_node(ModuleNode {
            path: file.path.clone(),
            module,
        });
        nodes.insert(file.path.clone(), index);
    }

    let path_of_entity: HashMap<EntityId, PathBuf> = graph
        .entities_snapshot()
        .into_iter()
        .map(|e| (e.id, e.file_path))
        .collect();

    let mut edges: HashSet<(NodeIndex, NodeIndex)> = HashSet::new();
    for rel in graph.relationships_snapshot() {
        if rel.kind != RelationKind::Imports {
            continue;
        }
        let Some(source_path) = path_of_entity.get(&rel.source) else {
            continue;
        };
        let Some(&source_node) = nodes.get(source_path) else {
            continue;
        };
        let target_path = match &rel.target {
            RelTarget::Entity(id) => path_of_entity.get(id).cloned(),
            RelTarget::Name(name) => by_stem.get(module_stem(name)).cloned(),
        };
        let Some(target_path) = target_path else {
            continue;
        };
        let Some(&target_node) = nodes.get(&target_path) else {
            continue;
        };
        if source_node != target_node && edges.insert((source_node, target_node)) {
            digraph.add_edge(source_node, target_node, ());
        }
    }

    let mut components: Vec<Vec<ModuleNode>> = tarjan_scc(&digraph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .map(|component| {
            let mut members: Vec<ModuleNode> = component
                .into_iter()
                .map(|index| digraph[index].clone())
                .collect();
            members.sort_by(|a, b| a.path.cmp(&b.path));
            members
        })
        .collect();
    components.sort_by(|a, b| a[0].path.cmp(&b[0].path));
    components
}

/// One aggregated module dependency edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDependency {
    pub module: String,
    /// Path inside the indexed tree, when the import resolves there.
    pub resolved_path: Option<PathBuf>,
    /// Number of import sites coalesced into this edge.
    pub import_count: usize,
}

/// Imports of one file coalesced to module granularity, ordered by module
/// name.
pub fn module_dependencies(graph: &GraphStore, module_path: &Path) -> Vec<ModuleDependency> {
    let mut by_stem: HashMap<String, PathBuf> = HashMap::new();
    for file in graph.all_files() {
        if let Some(stem) = file.path.file_stem().and_then(|s| s.to_str()) {
            by_stem.insert(stem.to_string(), file.path.clone());
        }
    }

    let imports = graph.entities_in_file(module_path, Some(&[EntityKind::Import]));
    let mut aggregated: HashMap<String, ModuleDependency> = HashMap::new();
    for import in imports {
        let module = module_stem(&import.name).to_string();
        let entry = aggregated
            .entry(module.clone())
            .or_insert_with(|| ModuleDependency {
                resolved_path: by_stem.get(&module).cloned(),
                module,
                import_count: 0,
            });
        entry.import_count += 1;
    }

    let mut out: Vec<ModuleDependency> = aggregated.into_values().collect();
    out.sort_by(|a, b| a.module.cmp(&b.module));
    out
}

/// A cluster of near-identical entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneCluster {
    pub entities: Vec<Entity>,
    /// Minimum pairwise similarity inside the cluster.
    pub similarity: f32,
}

/// Two-stage clone detection.
///
/// Stage one is structural: snippets are normalized (identifiers and
/// literals collapsed) and compared as trigram multisets with the Dice
/// coefficient. Stage two confirms borderline pairs semantically against
/// their stored embeddings. A pair clusters when either stage clears
/// `min_similarity`. Clusters are ordered by size descending, then by
/// first entity ID.
pub fn detect_clones(
    graph: &GraphStore,
    vectors: &VectorStore,
    min_similarity: f32,
    scope: Option<&Path>,
) -> Vec<CloneCluster> {
    let candidates: Vec<Entity> = graph
        .entities_snapshot()
        .into_iter()
        .filter(|e| e.kind.is_callable())
        .filter(|e| scope.map_or(true, |s| e.file_path.starts_with(s)))
        .filter(|e| e.snippet.len() >= 24)
        .collect();

    let tokens: Vec<Vec<String>> = candidates
        .iter()
        .map(|e| normalized_tokens(&e.snippet, e.language))
        .collect();
    let trigrams: Vec<HashMap<String, usize>> = tokens.iter().map(|t| trigram_counts(t)).collect();

    // Union-find over candidate indexes.
    let mut parent: Vec<usize> = (0..candidates.len()).collect();
    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        if parent[i] != i {
            let root = find(parent, parent[i]);
            parent[i] = root;
        }
        parent[i]
    }

    let mut pair_similarity: HashMap<(usize, usize), f32> = HashMap::new();
    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            // Cheap length gate before the trigram comparison.
            let (len_i, len_j) = (tokens[i].len(), tokens[j].len());
            if len_i == 0 || len_j == 0 {
                continue;
            }
            let ratio = len_i.min(len_j) as f32 / len_i.max(len_j) as f32;
            if ratio < 0.5 {
                continue;
            }

            let structural = dice_coefficient(&trigrams[i], &trigrams[j]);
            let mut similarity = structural;
            if structural < min_similarity && structural >= min_similarity * 0.6 {
                // Semantic confirmation for borderline pairs.
                if let Some(semantic) =
                    embedding_similarity(vectors, candidates[i].id, candidates[j].id)
                {
                    similarity = similarity.max(semantic);
                }
            }
            if similarity >= min_similarity {
                pair_similarity.insert((i, j), similarity);
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri] = rj;
                }
            }
        }
    }

    let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..candidates.len() {
        let root = find(&mut parent, i);
        clusters.entry(root).or_default().push(i);
    }

    let mut out: Vec<CloneCluster> = clusters
        .into_values()
        .filter(|members| members.len() > 1)
        .map(|members| {
            let mut similarity = 1.0f32;
            for (a, &i) in members.iter().enumerate() {
                for &j in members.iter().skip(a + 1) {
                    let key = if i < j { (i, j) } else { (j, i) };
                    if let Some(s) = pair_similarity.get(&key) {
                        similarity = similarity.min(*s);
                    }
                }
            }
            let mut entities: Vec<Entity> =
                members.into_iter().map(|i| candidates[i].clone()).collect();
            entities.sort_by_key(|e| e.id);
            CloneCluster {
                entities,
                similarity,
            }
        })
        .collect();
    out.sort_by(|a, b| {
        b.entities
            .len()
            .cmp(&a.entities.len())
            .then_with(|| a.entities[0].id.cmp(&b.entities[0].id))
    });
    out
}

fn embedding_similarity(vectors: &VectorStore, a: EntityId, b: EntityId) -> Option<f32> {
    // A missing embedding on either side means no semantic signal.
    let vector_a = vectors.vector_of(a)?;
    let vector_b = vectors.vector_of(b)?;
    Some(cosine_similarity(&vector_a, &vector_b))
}

/// Metrics available for hotspot ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HotspotMetric {
    /// AST node count of the body (cyclomatic proxy).
    Complexity,
    /// Incoming relationship count.
    FanIn,
    /// Outgoing relationship count.
    FanOut,
    /// Fan-in plus fan-out.
    Coupling,
}

impl HotspotMetric {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "complexity" => Some(HotspotMetric::Complexity),
            "fan-in" | "fanin" => Some(HotspotMetric::FanIn),
            "fan-out" | "fanout" => Some(HotspotMetric::FanOut),
            "coupling" => Some(HotspotMetric::Coupling),
            _ => None,
        }
    }
}

/// Entities ranked by a metric, descending, ties broken by entity ID.
pub fn hotspots(graph: &GraphStore, metric: HotspotMetric, k: usize) -> Vec<(Entity, u64)> {
    let mut scored: Vec<(Entity, u64)> = graph
        .entities_snapshot()
        .into_iter()
        .filter(|e| !matches!(e.kind, EntityKind::Import | EntityKind::Export))
        .map(|entity| {
            let (fan_in, fan_out) = graph.degree(entity.id);
            let score = match metric {
                HotspotMetric::Complexity => entity.complexity as u64,
                HotspotMetric::FanIn => fan_in as u64,
                HotspotMetric::FanOut => fan_out as u64,
                HotspotMetric::Coupling => (fan_in + fan_out) as u64,
            };
            (entity, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
    scored.truncate(k);
    scored
}

/// Normalize a snippet into a token sequence where identifiers and literals
/// are collapsed, so renaming does not defeat clone detection.
pub fn normalized_tokens(snippet: &str, language: SupportedLanguage) -> Vec<String> {
    let keywords = keyword_set(language);
    let mut tokens = Vec::new();
    let mut chars = snippet.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' || c == '\'' || c == '`' {
            let quote = c;
            chars.next();
            while let Some(&n) = chars.peek() {
                chars.next();
                if n == quote {
                    break;
                }
            }
            tokens.push("str".to_string());
        } else if c.is_ascii_digit() {
            while chars.peek().map_or(false, |n| n.is_alphanumeric() || *n == '.') {
                chars.next();
            }
            tokens.push("num".to_string());
        } else if c.is_alphanumeric() || c == '_' {
            let mut word = String::new();
            while chars
                .peek()
                .map_or(false, |n| n.is_alphanumeric() || *n == '_')
            {
                word.push(chars.next().expect("peeked"));
            }
            if keywords.contains(&word.as_str()) {
                tokens.push(word);
            } else {
                tokens.push("id".to_string());
            }
        } else {
            tokens.push(c.to_string());
            chars.next();
        }
    }
    tokens
}

fn keyword_set(language: SupportedLanguage) -> &'static [&'static str] {
    match language {
        SupportedLanguage::Python => &[
            "def", "class", "return", "if", "elif", "else", "for", "while", "import", "from",
            "as", "with", "try", "except", "finally", "raise", "yield", "lambda", "pass", "and",
            "or", "not", "in", "is", "None", "True", "False", "async", "await", "global",
        ],
        SupportedLanguage::JavaScript | SupportedLanguage::TypeScript | SupportedLanguage::Tsx => {
            &[
                "function", "class", "return", "if", "else", "for", "while", "import", "export",
                "from", "const", "let", "var", "new", "try", "catch", "finally", "throw",
                "yield", "async", "await", "this", "null", "undefined", "true", "false",
                "typeof", "instanceof", "extends", "implements", "interface", "type", "enum",
            ]
        }
        SupportedLanguage::C | SupportedLanguage::Cpp => &[
            "int", "char", "float", "double", "void", "long", "short", "unsigned", "signed",
            "struct", "union", "enum", "typedef", "return", "if", "else", "for", "while", "do",
            "switch", "case", "break", "continue", "static", "const", "extern", "sizeof",
            "class", "namespace", "template", "typename", "public", "private", "protected",
            "virtual", "new", "delete", "nullptr", "true", "false",
        ],
    }
}

fn trigram_counts(tokens: &[String]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    if tokens.len() < 3 {
        if !tokens.is_empty() {
            *counts.entry(tokens.join(" ")).or_insert(0) += 1;
        }
        return counts;
    }
    for window in tokens.windows(3) {
        *counts.entry(window.join(" ")).or_insert(0) += 1;
    }
    counts
}

/// Dice coefficient over trigram multisets.
fn dice_coefficient(a: &HashMap<String, usize>, b: &HashMap<String, usize>) -> f32 {
    let total: usize = a.values().sum::<usize>() + b.values().sum::<usize>();
    if total == 0 {
        return 0.0;
    }
    let mut shared = 0usize;
    for (gram, count_a) in a {
        if let Some(count_b) = b.get(gram) {
            shared += count_a.min(count_b);
        }
    }
    (2 * shared) as f32 / total as f32
}

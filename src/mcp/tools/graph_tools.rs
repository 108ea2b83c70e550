// Structural graph tools: file listings, relationship traversal, impact,
// clones, hotspots, and the refactoring advisory.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

use crate::agents::query_agent::{Direction, EntityRef};
use crate::errors::CodeGraphError;
use crate::mcp::tools::ToolContext;
use crate::mcp::types::EntityProjection;
use crate::types::{EntityId, EntityKind, RelationKind, ValidatedDepth, ValidatedLimit};

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| CodeGraphError::InvalidArgument(e.to_string()).into())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEntitiesArgs {
    file_path: PathBuf,
    entity_types: Option<Vec<String>>,
}

pub async fn list_file_entities(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: ListEntitiesArgs = parse_args(args)?;
    let kinds = match &args.entity_types {
        Some(types) => Some(parse_kinds(types)?),
        None => None,
    };

    let agent = context.conductor.query_agent();
    let entities = context
        .conductor
        .with_request_timeout("list_file_entities", async {
            agent.entities_in_file(&args.file_path, kinds.as_deref())
        })
        .await?;

    Ok(json!({
        "success": true,
        "entities": entities.iter().map(EntityProjection::from).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelationshipsArgs {
    entity_id: Option<String>,
    entity_name: Option<String>,
    depth: Option<usize>,
    relationship_types: Option<Vec<String>>,
}

pub async fn list_entity_relationships(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: RelationshipsArgs = parse_args(args)?;
    let entity_ref = entity_ref_from(args.entity_id.as_deref(), args.entity_name.as_deref())?;
    let depth = ValidatedDepth::new(args.depth.unwrap_or(1))?;
    let kinds = match &args.relationship_types {
        Some(types) => Some(parse_relation_kinds(types)?),
        None => None,
    };

    let agent = context.conductor.query_agent();
    // A name may match several entities; every match is returned with its
    // own traversal rather than picking one.
    let matches = agent.resolve_ref(&entity_ref)?;
    let mut out = Vec::new();
    for entity in matches {
        let records = agent.relationships_for(entity.id, depth.get(), kinds.as_deref());
        out.push(json!({
            "entity": EntityProjection::from(&entity),
            "relationships": records.iter().map(|r| json!({
                "relation": r.relation.as_str(),
                "direction": match r.direction {
                    Direction::Outgoing => "outgoing",
                    Direction::Incoming => "incoming",
                },
                "entity": r.entity.as_ref().map(EntityProjection::from),
                "target_name": r.target_name,
                "hop": r.hop,
            })).collect::<Vec<_>>(),
        }));
    }

    Ok(json!({
        "success": true,
        "ambiguous": out.len() > 1,
        "matches": out,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImpactArgs {
    entity_id: String,
    depth: Option<usize>,
}

pub async fn analyze_code_impact(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: ImpactArgs = parse_args(args)?;
    let id = EntityId::parse(&args.entity_id)
        .map_err(|_| CodeGraphError::InvalidArgument("malformed entityId".to_string()))?;
    let depth = ValidatedDepth::new(args.depth.unwrap_or(5))?;

    let agent = context.conductor.query_agent();
    let impacted = context
        .conductor
        .with_request_timeout("analyze_code_impact", async {
            agent.impacted_by_change(id, depth.get())
        })
        .await?;

    Ok(json!({
        "success": true,
        "impacted": impacted.iter().map(|i| json!({
            "entity": EntityProjection::from(&i.entity),
            "hop": i.hop,
        })).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClonesArgs {
    min_similarity: Option<f32>,
    scope: Option<PathBuf>,
}

pub async fn detect_code_clones(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: ClonesArgs = parse_args(args)?;
    let min_similarity = args.min_similarity.unwrap_or(0.85);
    if !(0.0..=1.0).contains(&min_similarity) {
        return Err(
            CodeGraphError::InvalidArgument("minSimilarity must be in [0, 1]".to_string()).into(),
        );
    }

    let agent = context.conductor.query_agent();
    let clusters = context
        .conductor
        .with_request_timeout("detect_code_clones", async {
            Ok(agent.clones(min_similarity, args.scope.as_deref()))
        })
        .await?;

    Ok(json!({
        "success": true,
        "clusters": clusters.iter().map(|c| json!({
            "similarity": c.similarity,
            "entities": c.entities.iter().map(EntityProjection::from).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HotspotsArgs {
    metric: Option<String>,
    limit: Option<usize>,
}

pub async fn analyze_hotspots(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: HotspotsArgs = parse_args(args)?;
    let metric = args.metric.unwrap_or_else(|| "complexity".to_string());
    let limit = ValidatedLimit::with_default(args.limit, 10)?;

    let agent = context.conductor.query_agent();
    let ranked = agent.hotspots(&metric, limit.get())?;

    Ok(json!({
        "success": true,
        "metric": metric,
        "hotspots": ranked.iter().map(|(entity, score)| json!({
            "entity": EntityProjection::from(entity),
            "score": score,
        })).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefactorArgs {
    file_path: PathBuf,
    focus_area: Option<String>,
}

pub async fn suggest_refactoring(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: RefactorArgs = parse_args(args)?;
    let agent = context.conductor.query_agent();
    let suggestions = agent.suggest_refactoring(&args.file_path, args.focus_area.as_deref())?;
    Ok(json!({
        "success": true,
        "advisory": true,
        "suggestions": suggestions,
    }))
}

pub(super) fn entity_ref_from(id: Option<&str>, name: Option<&str>) -> Result<EntityRef> {
    match (id, name) {
        (Some(id), _) => {
            let parsed = EntityId::parse(id)
                .map_err(|_| CodeGraphError::InvalidArgument("malformed entityId".to_string()))?;
            Ok(EntityRef::Id(parsed))
        }
        (None, Some(name)) => Ok(EntityRef::Name(name.to_string())),
        (None, None) => {
            Err(CodeGraphError::InvalidArgument(
                "one of entityId or entityName is required".to_string(),
            )
            .into())
        }
    }
}

fn parse_kinds(types: &[String]) -> Result<Vec<EntityKind>> {
    types
        .iter()
        .map(|t| {
            EntityKind::parse(t).ok_or_else(|| {
                CodeGraphError::InvalidArgument(format!("unknown entity type '{t}'")).into()
            })
        })
        .collect()
}

fn parse_relation_kinds(types: &[String]) -> Result<Vec<RelationKind>> {
    types
        .iter()
        .map(|t| {
            RelationKind::parse(t).ok_or_else(|| {
                CodeGraphError::InvalidArgument(format!("unknown relationship type '{t}'")).into()
            })
        })
        .collect()
}

// Search tools: structural text query, semantic search, similarity, and
// related-concept discovery.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::CodeGraphError;
use crate::mcp::tools::ToolContext;
use crate::mcp::types::EntityProjection;
use crate::parsing::SupportedLanguage;
use crate::types::{EntityId, ValidatedLimit};
use crate::vector_store::VectorFilter;

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| CodeGraphError::InvalidArgument(e.to_string()).into())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryArgs {
    query: String,
    limit: Option<usize>,
}

pub async fn query(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: QueryArgs = parse_args(args)?;
    let limit = ValidatedLimit::with_default(args.limit, 20)?;

    let agent = context.conductor.query_agent();
    let results = context
        .conductor
        .with_request_timeout("query", async {
            Ok(agent.structural_query(&args.query, limit.get(), None))
        })
        .await?;

    Ok(json!({
        "success": true,
        "results": results.iter().map(EntityProjection::from).collect::<Vec<_>>(),
    }))
}

pub async fn semantic_search(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: QueryArgs = parse_args(args)?;
    let limit = ValidatedLimit::with_default(args.limit, 10)?;

    let agent = context.conductor.query_agent();
    let results = context
        .conductor
        .with_request_timeout("semantic_search", async {
            agent
                .semantic_search(&args.query, limit.get(), &VectorFilter::default())
                .await
        })
        .await?;

    Ok(json!({
        "success": true,
        "results": results.iter().map(|(entity, similarity)| json!({
            "entity": EntityProjection::from(entity),
            "similarity": similarity,
        })).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimilarCodeArgs {
    code: String,
    threshold: Option<f32>,
    limit: Option<usize>,
}

pub async fn find_similar_code(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: SimilarCodeArgs = parse_args(args)?;
    let threshold = args.threshold.unwrap_or(0.7);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(
            CodeGraphError::InvalidArgument("threshold must be in [0, 1]".to_string()).into(),
        );
    }
    let limit = ValidatedLimit::with_default(args.limit, 10)?;

    let agent = context.conductor.query_agent();
    let results = context
        .conductor
        .with_request_timeout("find_similar_code", async {
            agent.find_similar(&args.code, threshold, limit.get()).await
        })
        .await?;

    Ok(json!({
        "success": true,
        "results": results.iter().map(|(entity, similarity)| json!({
            "entity": EntityProjection::from(entity),
            "similarity": similarity,
        })).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrossLanguageArgs {
    query: String,
    languages: Option<Vec<String>>,
    limit: Option<usize>,
}

pub async fn cross_language_search(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: CrossLanguageArgs = parse_args(args)?;
    let limit = ValidatedLimit::with_default(args.limit, 20)?;
    let languages = match &args.languages {
        Some(names) => Some(
            names
                .iter()
                .map(|name| {
                    SupportedLanguage::from_name(name).ok_or_else(|| {
                        CodeGraphError::UnsupportedLanguage(name.clone()).into()
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        None => None,
    };

    let agent = context.conductor.query_agent();
    let results = context
        .conductor
        .with_request_timeout("cross_language_search", async {
            agent
                .cross_language_search(&args.query, languages.as_deref(), limit.get())
                .await
        })
        .await?;

    Ok(json!({
        "success": true,
        "results": results.iter().map(EntityProjection::from).collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelatedArgs {
    entity_id: String,
    limit: Option<usize>,
}

pub async fn find_related_concepts(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: RelatedArgs = parse_args(args)?;
    let id = EntityId::parse(&args.entity_id)
        .map_err(|_| CodeGraphError::InvalidArgument("malformed entityId".to_string()))?;
    let limit = ValidatedLimit::with_default(args.limit, 10)?;

    let agent = context.conductor.query_agent();
    let related = context
        .conductor
        .with_request_timeout("find_related_concepts", async {
            agent.related_concepts(id, limit.get()).await
        })
        .await?;

    Ok(json!({
        "success": true,
        "related": related.iter().map(|(entity, score)| json!({
            "entity": EntityProjection::from(entity),
            "score": score,
        })).collect::<Vec<_>>(),
    }))
}

//! MCP tool surface
//!
//! Tool definitions, argument schemas, and the dispatch table. Every tool
//! result is a JSON object carrying `success`; failures add
//! `error: {code, message}` with the stable error code from the taxonomy,
//! and partial failures return their results plus an `errors` array.

pub mod graph_tools;
pub mod index_tools;
pub mod search_tools;

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::agents::Conductor;
use crate::errors::as_codegraph_error;
use crate::mcp::types::ToolDefinition;

/// Shared state handed to every tool handler.
#[derive(Clone)]
pub struct ToolContext {
    pub conductor: Arc<Conductor>,
}

impl ToolContext {
    pub fn new(conductor: Arc<Conductor>) -> Self {
        Self { conductor }
    }

    /// Dispatch one tool call. Unknown names and handler failures both
    /// come back as `success: false` payloads, never transport errors.
    pub async fn call(&self, name: &str, args: &Value) -> Value {
        debug!(tool = name, "tool call");
        let result = match name {
            "index" => index_tools::index(self, args).await,
            "get_metrics" => index_tools::get_metrics(self).await,
            "list_file_entities" => graph_tools::list_file_entities(self, args).await,
            "list_entity_relationships" => {
                graph_tools::list_entity_relationships(self, args).await
            }
            "analyze_code_impact" => graph_tools::analyze_code_impact(self, args).await,
            "detect_code_clones" => graph_tools::detect_code_clones(self, args).await,
            "analyze_hotspots" => graph_tools::analyze_hotspots(self, args).await,
            "suggest_refactoring" => graph_tools::suggest_refactoring(self, args).await,
            "query" => search_tools::query(self, args).await,
            "semantic_search" => search_tools::semantic_search(self, args).await,
            "find_similar_code" => search_tools::find_similar_code(self, args).await,
            "cross_language_search" => search_tools::cross_language_search(self, args).await,
            "find_related_concepts" => search_tools::find_related_concepts(self, args).await,
            other => Err(crate::errors::CodeGraphError::InvalidArgument(format!(
                "unknown tool '{other}'"
            ))
            .into()),
        };
        match result {
            Ok(value) => value,
            Err(e) => failure(&e),
        }
    }
}

/// Uniform failure payload.
pub fn failure(error: &anyhow::Error) -> Value {
    let code = as_codegraph_error(error)
        .map(|e| e.code())
        .unwrap_or("INTERNAL");
    json!({
        "success": false,
        "error": { "code": code, "message": error.to_string() },
    })
}

fn tool(name: &str, description: &str, schema: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: schema,
    }
}

/// The advertised tool catalogue.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        tool(
            "index",
            "Index a source directory into the code graph",
            json!({
                "type": "object",
                "properties": {
                    "directory": { "type": "string", "description": "Absolute path of the tree to index" },
                    "incremental": { "type": "boolean", "default": false },
                    "excludePatterns": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["directory"]
            }),
        ),
        tool(
            "list_file_entities",
            "List the entities declared in one file",
            json!({
                "type": "object",
                "properties": {
                    "filePath": { "type": "string" },
                    "entityTypes": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["filePath"]
            }),
        ),
        tool(
            "list_entity_relationships",
            "Traverse relationships of an entity up to a depth",
            json!({
                "type": "object",
                "properties": {
                    "entityId": { "type": "string" },
                    "entityName": { "type": "string" },
                    "depth": { "type": "integer", "minimum": 1, "default": 1 },
                    "relationshipTypes": { "type": "array", "items": { "type": "string" } }
                }
            }),
        ),
        tool(
            "query",
            "Free-text structural search over indexed entities",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "default": 20 }
                },
                "required": ["query"]
            }),
        ),
        tool(
            "get_metrics",
            "Snapshot of resource and throughput counters",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            "semantic_search",
            "Embedding search over indexed entities",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "default": 10 }
                },
                "required": ["query"]
            }),
        ),
        tool(
            "find_similar_code",
            "Find entities similar to a code fragment",
            json!({
                "type": "object",
                "properties": {
                    "code": { "type": "string" },
                    "threshold": { "type": "number", "default": 0.7 },
                    "limit": { "type": "integer", "default": 10 }
                },
                "required": ["code"]
            }),
        ),
        tool(
            "analyze_code_impact",
            "Transitive reverse-dependency closure of an entity",
            json!({
                "type": "object",
                "properties": {
                    "entityId": { "type": "string" },
                    "depth": { "type": "integer", "default": 5 }
                },
                "required": ["entityId"]
            }),
        ),
        tool(
            "detect_code_clones",
            "Find clusters of near-identical code",
            json!({
                "type": "object",
                "properties": {
                    "minSimilarity": { "type": "number", "default": 0.85 },
                    "scope": { "type": "string" }
                }
            }),
        ),
        tool(
            "suggest_refactoring",
            "Advisory refactoring heuristics for a file",
            json!({
                "type": "object",
                "properties": {
                    "filePath": { "type": "string" },
                    "focusArea": { "type": "string" }
                },
                "required": ["filePath"]
            }),
        ),
        tool(
            "cross_language_search",
            "Search entities across selected languages",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "languages": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["query"]
            }),
        ),
        tool(
            "analyze_hotspots",
            "Rank entities by complexity or coupling",
            json!({
                "type": "object",
                "properties": {
                    "metric": { "type": "string", "enum": ["complexity", "changes", "coupling"], "default": "complexity" },
                    "limit": { "type": "integer", "default": 10 }
                }
            }),
        ),
        tool(
            "find_related_concepts",
            "Entities related to one entity, structurally and semantically",
            json!({
                "type": "object",
                "properties": {
                    "entityId": { "type": "string" },
                    "limit": { "type": "integer", "default": 10 }
                },
                "required": ["entityId"]
            }),
        ),
    ]
}

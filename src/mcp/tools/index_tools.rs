// Ingest and metrics tools.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

use crate::mcp::tools::ToolContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexArgs {
    directory: PathBuf,
    #[serde(default)]
    incremental: bool,
    #[serde(default)]
    exclude_patterns: Vec<String>,
}

pub async fn index(context: &ToolContext, args: &Value) -> Result<Value> {
    let args: IndexArgs = serde_json::from_value(args.clone())
        .map_err(|e| crate::errors::CodeGraphError::InvalidArgument(e.to_string()))?;

    let report = context
        .conductor
        .index_directory(&args.directory, args.incremental, &args.exclude_patterns)
        .await?;

    Ok(json!({
        "success": true,
        "files_indexed": report.files_indexed,
        "files_removed": report.files_removed,
        "entities": report.entities,
        "entities_written": report.entities_written,
        "duration_ms": report.duration_ms,
        "errors": report.errors.iter().map(|e| json!({
            "file": e.file.display().to_string(),
            "message": e.message,
        })).collect::<Vec<_>>(),
    }))
}

pub async fn get_metrics(context: &ToolContext) -> Result<Value> {
    let metrics = context.conductor.metrics();
    Ok(json!({
        "success": true,
        "metrics": metrics,
    }))
}

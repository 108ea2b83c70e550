// End-to-end scenarios over the full pipeline: conductor, agent pool, bus,
// and both stores, driven the way an MCP client would drive them.

use anyhow::Result;
use codegraph::agents::query_agent::{Direction, EntityRef};
use codegraph::{Conductor, EntityKind, RelationKind, ServerConfig};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

async fn started_conductor(data_dir: &Path) -> Arc<Conductor> {
    let config = ServerConfig {
        data_dir: data_dir.to_path_buf(),
        ..ServerConfig::default()
    };
    let conductor = Arc::new(Conductor::build(config).unwrap());
    conductor.start().await.unwrap();
    conductor
}

const LIB_PY: &str = "def add(a, b):\n    return a+b\n\ndef main():\n    return add(1, 2)\n";

#[tokio::test]
async fn scenario_index_and_list() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    let lib = write_file(workspace.path(), "lib.py", LIB_PY);

    let conductor = started_conductor(data.path()).await;
    let report = conductor
        .index_directory(workspace.path(), false, &[])
        .await?;
    assert_eq!(report.files_indexed, 1);
    assert_eq!(report.entities, 2);

    let entities = conductor
        .query_agent()
        .entities_in_file(&lib, Some(&[EntityKind::Function]))?;
    assert_eq!(entities.len(), 2);
    assert_eq!(entities[0].name, "add");
    assert_eq!(entities[0].kind, EntityKind::Function);
    assert_eq!(entities[1].name, "main");
    assert_eq!(entities[1].kind, EntityKind::Function);

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn scenario_callers_of_add() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_file(workspace.path(), "lib.py", LIB_PY);

    let conductor = started_conductor(data.path()).await;
    conductor
        .index_directory(workspace.path(), false, &[])
        .await?;

    let agent = conductor.query_agent();
    let matches = agent.resolve_ref(&EntityRef::Name("add".to_string()))?;
    assert_eq!(matches.len(), 1);

    let records = agent.relationships_for(matches[0].id, 1, None);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].relation, RelationKind::Calls);
    assert_eq!(records[0].direction, Direction::Incoming);
    assert_eq!(
        records[0].entity.as_ref().map(|e| e.name.as_str()),
        Some("main")
    );

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn scenario_incremental_noop() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_file(workspace.path(), "lib.py", LIB_PY);

    let conductor = started_conductor(data.path()).await;
    let first = conductor
        .index_directory(workspace.path(), false, &[])
        .await?;
    assert_eq!(first.entities_written, 2);

    let second = conductor
        .index_directory(workspace.path(), true, &[])
        .await?;
    assert_eq!(second.entities_written, 0, "unchanged tree writes nothing");
    assert_eq!(second.entities, 2);

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn scenario_incremental_edit_preserves_ids() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    let lib = write_file(workspace.path(), "lib.py", LIB_PY);

    let conductor = started_conductor(data.path()).await;
    conductor
        .index_directory(workspace.path(), false, &[])
        .await?;

    let agent = conductor.query_agent();
    let before: Vec<_> = agent.entities_in_file(&lib, None)?;
    let add_id = before.iter().find(|e| e.name == "add").unwrap().id;
    let main_id = before.iter().find(|e| e.name == "main").unwrap().id;

    let mut appended = LIB_PY.to_string();
    appended.push_str("\ndef sub(a, b):\n    return a-b\n");
    write_file(workspace.path(), "lib.py", &appended);

    let report = conductor
        .index_directory(workspace.path(), true, &[])
        .await?;
    assert_eq!(report.entities, 3);

    let after = agent.entities_in_file(&lib, None)?;
    let names: Vec<&str> = after.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["add", "main", "sub"]);
    assert_eq!(after.iter().find(|e| e.name == "add").unwrap().id, add_id);
    assert_eq!(after.iter().find(|e| e.name == "main").unwrap().id, main_id);

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn scenario_import_cycle() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_file(workspace.path(), "a.py", "import b\n");
    write_file(workspace.path(), "b.py", "import a\n");

    let conductor = started_conductor(data.path()).await;
    conductor
        .index_directory(workspace.path(), false, &[])
        .await?;

    let cycles = conductor.query_agent().cycles(None);
    assert_eq!(cycles.len(), 1);
    let modules: Vec<&str> = cycles[0].iter().map(|m| m.module.as_str()).collect();
    assert_eq!(modules, vec!["a", "b"]);

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn scenario_renamed_clone_detection() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_file(
        workspace.path(),
        "one.py",
        "def total(values):\n    acc = 0\n    for v in values:\n        acc = acc + v\n    return acc\n",
    );
    write_file(
        workspace.path(),
        "two.py",
        "def sum_all(items):\n    result = 0\n    for item in items:\n        result = result + item\n    return result\n",
    );

    let conductor = started_conductor(data.path()).await;
    conductor
        .index_directory(workspace.path(), false, &[])
        .await?;

    let clusters = conductor.query_agent().clones(0.9, None);
    assert_eq!(clusters.len(), 1);
    let names: Vec<&str> = clusters[0]
        .entities
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    assert!(names.contains(&"total"));
    assert!(names.contains(&"sum_all"));

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn deterministic_ids_across_independent_runs() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    write_file(workspace.path(), "lib.py", LIB_PY);

    let mut id_sets = Vec::new();
    for _ in 0..2 {
        let data = tempfile::tempdir()?;
        let conductor = started_conductor(data.path()).await;
        conductor
            .index_directory(workspace.path(), false, &[])
            .await?;
        let mut ids: Vec<String> = conductor
            .graph()
            .entities_snapshot()
            .iter()
            .map(|e| e.id.to_string())
            .collect();
        ids.sort();
        id_sets.push(ids);
        conductor.shutdown().await?;
    }
    assert_eq!(id_sets[0], id_sets[1]);
    Ok(())
}

#[tokio::test]
async fn semantic_search_finds_indexed_code() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_file(
        workspace.path(),
        "io.py",
        "def read_settings(path):\n    \"\"\"Load settings from a file.\"\"\"\n    return open(path).read()\n\ndef render_page(template):\n    return template.format()\n",
    );

    let conductor = started_conductor(data.path()).await;
    conductor
        .index_directory(workspace.path(), false, &[])
        .await?;

    // Embeddings land asynchronously behind index:complete.
    let agent = conductor.query_agent();
    let mut hits = Vec::new();
    for _ in 0..100 {
        hits = agent
            .semantic_search(
                "load settings from a file path",
                2,
                &codegraph::VectorFilter::default(),
            )
            .await?;
        if !hits.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!hits.is_empty());
    assert_eq!(hits[0].0.name, "read_settings");

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn restart_preserves_graph_and_ids() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    let lib = write_file(workspace.path(), "lib.py", LIB_PY);

    let first_ids: Vec<String> = {
        let conductor = started_conductor(data.path()).await;
        conductor
            .index_directory(workspace.path(), false, &[])
            .await?;
        let ids = conductor
            .query_agent()
            .entities_in_file(&lib, None)?
            .iter()
            .map(|e| e.id.to_string())
            .collect();
        conductor.shutdown().await?;
        ids
    };

    let conductor = started_conductor(data.path()).await;
    let reopened_ids: Vec<String> = conductor
        .query_agent()
        .entities_in_file(&lib, None)?
        .iter()
        .map(|e| e.id.to_string())
        .collect();
    assert_eq!(first_ids, reopened_ids);

    // A fresh incremental pass over the unchanged tree writes nothing.
    let report = conductor
        .index_directory(workspace.path(), true, &[])
        .await?;
    assert_eq!(report.entities_written, 0);

    conductor.shutdown().await?;
    Ok(())
}

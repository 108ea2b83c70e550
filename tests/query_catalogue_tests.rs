// Query catalogue behaviour over a small mixed-language tree.

use anyhow::Result;
use codegraph::agents::query_agent::EntityRef;
use codegraph::{Conductor, EntityKind, ServerConfig, SupportedLanguage};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

async fn indexed_workspace(workspace: &Path, data: &Path) -> Arc<Conductor> {
    let config = ServerConfig {
        data_dir: data.to_path_buf(),
        ..ServerConfig::default()
    };
    let conductor = Arc::new(Conductor::build(config).unwrap());
    conductor.start().await.unwrap();
    conductor
        .index_directory(workspace, false, &[])
        .await
        .unwrap();
    conductor
}

fn python_tree(workspace: &Path) {
    write_file(
        workspace,
        "core.py",
        "def fetch(url):\n    return url\n\ndef fetch_all(urls):\n    return [fetch(u) for u in urls]\n",
    );
    write_file(
        workspace,
        "app.py",
        "import core\n\ndef run():\n    return core.fetch_all([])\n",
    );
}

#[tokio::test]
async fn impact_analysis_crosses_files() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    python_tree(workspace.path());

    let conductor = indexed_workspace(workspace.path(), data.path()).await;
    let agent = conductor.query_agent();

    let fetch = agent
        .resolve_ref(&EntityRef::Name("fetch".to_string()))?
        .pop()
        .expect("fetch");
    let impacted = agent.impacted_by_change(fetch.id, 5)?;
    let names: Vec<&str> = impacted.iter().map(|i| i.entity.name.as_str()).collect();
    assert!(names.contains(&"fetch_all"), "direct caller impacted");
    assert!(names.contains(&"run"), "transitive caller impacted");

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn module_dependencies_resolve_in_tree() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    python_tree(workspace.path());

    let conductor = indexed_workspace(workspace.path(), data.path()).await;
    let deps = conductor
        .query_agent()
        .module_dependencies(&workspace.path().join("app.py"));
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].module, "core");
    assert!(deps[0].resolved_path.is_some());

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn typescript_entities_flow_through_pipeline() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    let shapes = write_file(
        workspace.path(),
        "shapes.ts",
        "export interface Shape {\n  area(): number;\n}\n\nexport class Circle implements Shape {\n  area(): number {\n    return 3.14;\n  }\n}\n",
    );

    let conductor = indexed_workspace(workspace.path(), data.path()).await;
    let agent = conductor.query_agent();

    let interfaces = agent.entities_in_file(&shapes, Some(&[EntityKind::Interface]))?;
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].name, "Shape");

    let circle = agent
        .resolve_ref(&EntityRef::Name("Circle".to_string()))?
        .pop()
        .expect("Circle");
    let records = agent.relationships_for(circle.id, 1, None);
    assert!(records
        .iter()
        .any(|r| r.relation == codegraph::RelationKind::Implements));

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn cross_language_search_filters_by_language() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_file(
        workspace.path(),
        "parse.py",
        "def parse_input(raw):\n    return raw\n",
    );
    write_file(
        workspace.path(),
        "parse.js",
        "function parseInput(raw) {\n  return raw;\n}\n",
    );

    let conductor = indexed_workspace(workspace.path(), data.path()).await;
    let agent = conductor.query_agent();

    let python_only = agent
        .cross_language_search("parse", Some(&[SupportedLanguage::Python]), 10)
        .await?;
    assert!(!python_only.is_empty());
    assert!(python_only
        .iter()
        .all(|e| e.language == SupportedLanguage::Python));

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn hotspots_rank_by_coupling() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_file(
        workspace.path(),
        "hub.py",
        "def hub():\n    return 1\n\ndef a():\n    return hub()\n\ndef b():\n    return hub()\n\ndef c():\n    return hub()\n",
    );

    let conductor = indexed_workspace(workspace.path(), data.path()).await;
    let ranked = conductor.query_agent().hotspots("coupling", 1)?;
    assert_eq!(ranked[0].0.name, "hub");
    assert_eq!(ranked[0].1, 3);

    conductor.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn ambiguous_name_surfaces_all_matches() -> Result<()> {
    let workspace = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_file(workspace.path(), "m1.py", "def shared():\n    return 1\n");
    write_file(workspace.path(), "m2.py", "def shared():\n    return 2\n");

    let conductor = indexed_workspace(workspace.path(), data.path()).await;
    let matches = conductor
        .query_agent()
        .resolve_ref(&EntityRef::Name("shared".to_string()))?;
    assert_eq!(matches.len(), 2);
    let files: Vec<String> = matches
        .iter()
        .map(|e| e.file_path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files, vec!["m1.py", "m2.py"]);

    conductor.shutdown().await?;
    Ok(())
}

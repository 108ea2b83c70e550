//! Agent pool
//!
//! Each agent kind (parser, indexer, semantic, query) is a value behind a
//! small capability set: `Lifecycle` for start/stop, `TaskHandler` for queue
//! consumption, and `HealthReport` for metrics. The conductor holds them in
//! a registry keyed by kind and never does their work itself.

pub mod conductor;
pub mod indexer_agent;
pub mod parser_agent;
pub mod query_agent;
pub mod semantic_agent;

pub use conductor::{Conductor, IndexReport};
pub use indexer_agent::IndexerAgent;
pub use parser_agent::ParserAgent;
pub use query_agent::QueryAgent;
pub use semantic_agent::SemanticAgent;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::task_queue::{Task, TaskKind};

/// Agent kinds known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Parser,
    Indexer,
    Semantic,
    Query,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Parser => "parser",
            AgentKind::Indexer => "indexer",
            AgentKind::Semantic => "semantic",
            AgentKind::Query => "query",
        }
    }
}

/// Start/stop contract shared by all agents.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Queue-task contract. Agents driven purely by bus subscriptions accept no
/// task kinds.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn accepts(&self, kind: TaskKind) -> bool;
    async fn handle(&self, task: Task) -> Result<()>;
}

/// Health snapshot contract.
pub trait HealthReport: Send + Sync {
    fn snapshot(&self) -> AgentHealth;
}

/// A full agent is all three capabilities.
pub trait Agent: Lifecycle + TaskHandler + HealthReport {}
impl<T: Lifecycle + TaskHandler + HealthReport> Agent for T {}

/// Point-in-time health of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub kind: AgentKind,
    pub in_flight: usize,
    pub processed: u64,
    pub failed: u64,
    pub last_error: Option<String>,
}

/// Shared mutable health state, updated by agent workers.
pub struct HealthState {
    kind: AgentKind,
    in_flight: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl HealthState {
    pub fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            in_flight: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn complete(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fail(&self, error: &str) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn snapshot(&self) -> AgentHealth {
        AgentHealth {
            kind: self.kind,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Registry of running agents, keyed by kind.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentKind, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: AgentKind, agent: Arc<dyn Agent>) {
        self.agents.insert(kind, agent);
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn Agent>> {
        self.agents.get(&kind).cloned()
    }

    pub async fn start_all(&self) -> Result<()> {
        for agent in self.agents.values() {
            agent.start().await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<()> {
        for agent in self.agents.values() {
            agent.stop().await?;
        }
        Ok(())
    }

    pub fn health(&self) -> Vec<AgentHealth> {
        let mut health: Vec<AgentHealth> =
            self.agents.values().map(|agent| agent.snapshot()).collect();
        health.sort_by_key(|h| h.kind.as_str());
        health
    }
}

// Centralized Observability Infrastructure
// Structured logging via tracing plus a process-wide metrics registry whose
// only mutation is atomic increment. The registry backs the `get_metrics`
// tool and the `stats` CLI subcommand.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Global atomic counters. Incremented from any thread, read by snapshot().
static OPERATIONS: AtomicU64 = AtomicU64::new(0);
static ERRORS: AtomicU64 = AtomicU64::new(0);
static FILES_PARSED: AtomicU64 = AtomicU64::new(0);
static FILES_FAILED: AtomicU64 = AtomicU64::new(0);
static PARSE_CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static PARSE_CACHE_MISSES: AtomicU64 = AtomicU64::new(0);
static ENTITIES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static ENTITIES_DELETED: AtomicU64 = AtomicU64::new(0);
static RELATIONSHIPS_WRITTEN: AtomicU64 = AtomicU64::new(0);
static NAMES_RESOLVED: AtomicU64 = AtomicU64::new(0);
static EMBEDDINGS_GENERATED: AtomicU64 = AtomicU64::new(0);
static EMBEDDINGS_FAILED: AtomicU64 = AtomicU64::new(0);
static QUERIES_SERVED: AtomicU64 = AtomicU64::new(0);
static TASKS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static TASKS_CANCELLED: AtomicU64 = AtomicU64::new(0);
static BUS_EVENTS_PUBLISHED: AtomicU64 = AtomicU64::new(0);
static BUS_EVENTS_COALESCED: AtomicU64 = AtomicU64::new(0);
static BUS_EVENTS_DROPPED: AtomicU64 = AtomicU64::new(0);
static LEASES_GRANTED: AtomicU64 = AtomicU64::new(0);
static LEASES_DENIED: AtomicU64 = AtomicU64::new(0);

/// Initialize the logging and tracing infrastructure.
/// Called once at application startup; later calls are no-ops.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
///
/// `LOG_LEVEL` or `RUST_LOG` override the flag-derived default unless quiet
/// is set, which always wins.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let default_filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("codegraph=debug,info")
    } else {
        EnvFilter::new("codegraph=warn,error")
    };

    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if let Ok(spec) = std::env::var("LOG_LEVEL") {
        EnvFilter::try_new(spec).unwrap_or(default_filter)
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(default_filter)
    } else {
        default_filter
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_writer(std::io::stderr)
        .with_ansi(false);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("codegraph observability initialized");
            }
            Ok(())
        }
        // Already initialized, which is fine in test environments.
        Err(_) => Ok(()),
    }
}

/// Named metric counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Operations,
    Errors,
    FilesParsed,
    FilesFailed,
    ParseCacheHits,
    ParseCacheMisses,
    EntitiesWritten,
    EntitiesDeleted,
    RelationshipsWritten,
    NamesResolved,
    EmbeddingsGenerated,
    EmbeddingsFailed,
    QueriesServed,
    TasksCompleted,
    TasksCancelled,
    BusEventsPublished,
    BusEventsCoalesced,
    BusEventsDropped,
    LeasesGranted,
    LeasesDenied,
}

fn cell(counter: Counter) -> &'static AtomicU64 {
    match counter {
        Counter::Operations => &OPERATIONS,
        Counter::Errors => &ERRORS,
        Counter::FilesParsed => &FILES_PARSED,
        Counter::FilesFailed => &FILES_FAILED,
        Counter::ParseCacheHits => &PARSE_CACHE_HITS,
        Counter::ParseCacheMisses => &PARSE_CACHE_MISSES,
        Counter::EntitiesWritten => &ENTITIES_WRITTEN,
        Counter::EntitiesDeleted => &ENTITIES_DELETED,
        Counter::RelationshipsWritten => &RELATIONSHIPS_WRITTEN,
        Counter::NamesResolved => &NAMES_RESOLVED,
        Counter::EmbeddingsGenerated => &EMBEDDINGS_GENERATED,
        Counter::EmbeddingsFailed => &EMBEDDINGS_FAILED,
        Counter::QueriesServed => &QUERIES_SERVED,
        Counter::TasksCompleted => &TASKS_COMPLETED,
        Counter::TasksCancelled => &TASKS_CANCELLED,
        Counter::BusEventsPublished => &BUS_EVENTS_PUBLISHED,
        Counter::BusEventsCoalesced => &BUS_EVENTS_COALESCED,
        Counter::BusEventsDropped => &BUS_EVENTS_DROPPED,
        Counter::LeasesGranted => &LEASES_GRANTED,
        Counter::LeasesDenied => &LEASES_DENIED,
    }
}

/// Increment a counter by one.
pub fn record(counter: Counter) {
    record_by(counter, 1);
}

/// Increment a counter by an arbitrary amount.
pub fn record_by(counter: Counter, amount: u64) {
    cell(counter).fetch_add(amount, Ordering::Relaxed);
}

/// Current value of a counter.
pub fn counter_value(counter: Counter) -> u64 {
    cell(counter).load(Ordering::Relaxed)
}

/// Reset every counter to zero. Test-only hook.
pub fn reset_counters() {
    for counter in [
        Counter::Operations,
        Counter::Errors,
        Counter::FilesParsed,
        Counter::FilesFailed,
        Counter::ParseCacheHits,
        Counter::ParseCacheMisses,
        Counter::EntitiesWritten,
        Counter::EntitiesDeleted,
        Counter::RelationshipsWritten,
        Counter::NamesResolved,
        Counter::EmbeddingsGenerated,
        Counter::EmbeddingsFailed,
        Counter::QueriesServed,
        Counter::TasksCompleted,
        Counter::TasksCancelled,
        Counter::BusEventsPublished,
        Counter::BusEventsCoalesced,
        Counter::BusEventsDropped,
        Counter::LeasesGranted,
        Counter::LeasesDenied,
    ] {
        cell(counter).store(0, Ordering::Relaxed);
    }
}

/// Serializable view of all counters, returned by `get_metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub operations: u64,
    pub errors: u64,
    pub files_parsed: u64,
    pub files_failed: u64,
    pub parse_cache_hits: u64,
    pub parse_cache_misses: u64,
    pub entities_written: u64,
    pub entities_deleted: u64,
    pub relationships_written: u64,
    pub names_resolved: u64,
    pub embeddings_generated: u64,
    pub embeddings_failed: u64,
    pub queries_served: u64,
    pub tasks_completed: u64,
    pub tasks_cancelled: u64,
    pub bus_events_published: u64,
    pub bus_events_coalesced: u64,
    pub bus_events_dropped: u64,
    pub leases_granted: u64,
    pub leases_denied: u64,
}

impl MetricsSnapshot {
    pub fn capture() -> Self {
        Self {
            operations: counter_value(Counter::Operations),
            errors: counter_value(Counter::Errors),
            files_parsed: counter_value(Counter::FilesParsed),
            files_failed: counter_value(Counter::FilesFailed),
            parse_cache_hits: counter_value(Counter::ParseCacheHits),
            parse_cache_misses: counter_value(Counter::ParseCacheMisses),
            entities_written: counter_value(Counter::EntitiesWritten),
            entities_deleted: counter_value(Counter::EntitiesDeleted),
            relationships_written: counter_value(Counter::RelationshipsWritten),
            names_resolved: counter_value(Counter::NamesResolved),
            embeddings_generated: counter_value(Counter::EmbeddingsGenerated),
            embeddings_failed: counter_value(Counter::EmbeddingsFailed),
            queries_served: counter_value(Counter::QueriesServed),
            tasks_completed: counter_value(Counter::TasksCompleted),
            tasks_cancelled: counter_value(Counter::TasksCancelled),
            bus_events_published: counter_value(Counter::BusEventsPublished),
            bus_events_coalesced: counter_value(Counter::BusEventsCoalesced),
            bus_events_dropped: counter_value(Counter::BusEventsDropped),
            leases_granted: counter_value(Counter::LeasesGranted),
            leases_denied: counter_value(Counter::LeasesDenied),
        }
    }
}

/// Run an operation, logging its duration and bumping the operation counter.
pub async fn time_operation<T, F>(name: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let start = Instant::now();
    record(Counter::Operations);
    let result = fut.await;
    let elapsed = start.elapsed();
    match &result {
        Ok(_) => debug!(operation = name, elapsed_ms = elapsed.as_millis() as u64, "operation complete"),
        Err(e) => {
            record(Counter::Errors);
            debug!(operation = name, elapsed_ms = elapsed.as_millis() as u64, error = %e, "operation failed");
        }
    }
    result
}

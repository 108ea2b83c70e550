// Resource manager
// Tracks granted memory, in-flight tasks per agent, and a CPU proxy, and
// admits work through leases. Requests under the soft limits are granted
// immediately; everything else waits on release notifications with a
// periodic re-check. Crossing the critical thresholds enters an emergency
// regime: caches are asked to shed weight over the bus and non-essential
// requests are refused outright.

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::bus::{topics, BusEvent, BusPayload, KnowledgeBus};
use crate::errors::CodeGraphError;
use crate::observability::{record, Counter};

/// I/O class declared by a resource request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoClass {
    Interactive,
    Batch,
}

/// Declared budget for one unit of work.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    /// Estimated peak memory in bytes.
    pub memory_bytes: u64,
    /// CPU slots (whole worker threads) the task will occupy.
    pub cpu_slots: usize,
    pub io_class: IoClass,
    /// Agent kind, for per-agent in-flight accounting.
    pub agent: &'static str,
    /// Essential work is still admitted during an emergency.
    pub essential: bool,
}

impl ResourceRequest {
    /// A parse-sized request, scaled by file length.
    pub fn for_parse(file_len: u64) -> Self {
        Self {
            // Tree + extraction typically cost a small multiple of the input.
            memory_bytes: (file_len * 8).max(256 * 1024),
            cpu_slots: 1,
            io_class: IoClass::Batch,
            agent: "parser",
            essential: false,
        }
    }
}

/// Limits and thresholds; defaults follow the documented policy.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_ceiling_bytes: u64,
    pub max_parallel_tasks: usize,
    pub soft_memory_fraction: f64,
    pub critical_memory_fraction: f64,
    pub soft_cpu_fraction: f64,
    pub critical_cpu_fraction: f64,
    /// How long CPU must stay critical before the emergency path fires.
    pub critical_cpu_sustain: Duration,
    pub recheck_interval: Duration,
    /// Fold process RSS into memory pressure, alongside lease accounting.
    pub track_process_rss: bool,
}

impl ResourceLimits {
    pub fn new(memory_ceiling_bytes: u64, max_parallel_tasks: usize) -> Self {
        Self {
            memory_ceiling_bytes,
            max_parallel_tasks,
            soft_memory_fraction: 0.60,
            critical_memory_fraction: 0.85,
            soft_cpu_fraction: 0.80,
            critical_cpu_fraction: 0.95,
            critical_cpu_sustain: Duration::from_secs(3),
            recheck_interval: Duration::from_millis(100),
            track_process_rss: true,
        }
    }
}

#[derive(Default, Debug)]
struct ResState {
    granted_memory: u64,
    active_cpu_slots: usize,
    active_leases: usize,
    in_flight_by_agent: HashMap<&'static str, usize>,
    over_cpu_since: Option<Instant>,
}

/// Serializable utilisation view for `get_metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub granted_memory_bytes: u64,
    pub memory_ceiling_bytes: u64,
    pub process_rss_bytes: u64,
    pub active_leases: usize,
    pub active_cpu_slots: usize,
    pub max_parallel_tasks: usize,
    pub in_flight_by_agent: HashMap<String, usize>,
    pub emergency: bool,
}

struct ManagerInner {
    limits: ResourceLimits,
    state: Mutex<ResState>,
    notify: Notify,
    bus: RwLock<Option<Arc<KnowledgeBus>>>,
    emergency: AtomicBool,
    next_lease_id: AtomicU64,
}

/// Grants and tracks resource leases. Cheap to clone.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

/// RAII grant: dropping it releases the budget and wakes queued requests.
pub struct ResourceLease {
    id: u64,
    request: ResourceRequest,
    inner: Arc<ManagerInner>,
    released: bool,
}

impl std::fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLease")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("released", &self.released)
            .finish()
    }
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                limits,
                state: Mutex::new(ResState::default()),
                notify: Notify::new(),
                bus: RwLock::new(None),
                emergency: AtomicBool::new(false),
                next_lease_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach the bus used for eviction requests and budget warnings.
    pub fn attach_bus(&self, bus: Arc<KnowledgeBus>) {
        *self.inner.bus.write() = Some(bus);
    }

    /// Request a lease, waiting while the system is saturated.
    ///
    /// Queued requests wake on lease release and on the periodic re-check.
    /// During an emergency, non-essential requests fail with
    /// `ResourceExhausted` instead of queueing.
    pub async fn request(&self, request: ResourceRequest) -> Result<ResourceLease> {
        loop {
            {
                let mut state = self.inner.state.lock();
                self.update_emergency(&mut state);

                if self.inner.emergency.load(Ordering::Relaxed) && !request.essential {
                    record(Counter::LeasesDenied);
                    return Err(CodeGraphError::ResourceExhausted(format!(
                        "emergency thresholds active, refusing {} work",
                        request.agent
                    ))
                    .into());
                }

                if self.fits(&state, &request) {
                    state.granted_memory += request.memory_bytes;
                    state.active_cpu_slots += request.cpu_slots;
                    state.active_leases += 1;
                    *state.in_flight_by_agent.entry(request.agent).or_default() += 1;
                    record(Counter::LeasesGranted);
                    let id = self.inner.next_lease_id.fetch_add(1, Ordering::Relaxed);
                    debug!(lease = id, agent = request.agent, "lease granted");
                    return Ok(ResourceLease {
                        id,
                        request,
                        inner: Arc::clone(&self.inner),
                        released: false,
                    });
                }
            }

            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep(self.inner.limits.recheck_interval) => {}
            }
        }
    }

    /// Report actual usage against a lease's declared budget. Overruns emit
    /// a soft warning on the bus; egregious overruns revoke the lease.
    pub fn report_usage(&self, lease: &mut ResourceLease, actual_memory_bytes: u64) {
        if actual_memory_bytes <= lease.request.memory_bytes {
            return;
        }
        let message = format!(
            "lease {} ({}) exceeded budget: used {} of {} bytes",
            lease.id, lease.request.agent, actual_memory_bytes, lease.request.memory_bytes
        );
        warn!("{message}");
        if let Some(bus) = self.inner.bus.read().as_ref() {
            bus.publish(BusEvent {
                topic: topics::RESOURCE_WARNING,
                key: Some(lease.request.agent.to_string()),
                payload: BusPayload::ResourceWarning { message },
            });
        }
        if actual_memory_bytes > lease.request.memory_bytes.saturating_mul(2) {
            lease.release_now();
        }
    }

    pub fn utilization(&self) -> ResourceUtilization {
        let state = self.inner.state.lock();
        ResourceUtilization {
            granted_memory_bytes: state.granted_memory,
            memory_ceiling_bytes: self.inner.limits.memory_ceiling_bytes,
            process_rss_bytes: process_rss_bytes(),
            active_leases: state.active_leases,
            active_cpu_slots: state.active_cpu_slots,
            max_parallel_tasks: self.inner.limits.max_parallel_tasks,
            in_flight_by_agent: state
                .in_flight_by_agent
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            emergency: self.inner.emergency.load(Ordering::Relaxed),
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.inner.emergency.load(Ordering::Relaxed)
    }

    fn fits(&self, state: &ResState, request: &ResourceRequest) -> bool {
        let limits = &self.inner.limits;
        let soft_memory =
            (limits.memory_ceiling_bytes as f64 * limits.soft_memory_fraction) as u64;
        let soft_cpu =
            (limits.max_parallel_tasks as f64 * limits.soft_cpu_fraction).ceil() as usize;
        state.granted_memory + request.memory_bytes <= soft_memory
            && state.active_cpu_slots + request.cpu_slots <= soft_cpu.max(1)
    }

    fn update_emergency(&self, state: &mut ResState) {
        let limits = &self.inner.limits;
        let memory_used = if limits.track_process_rss {
            state.granted_memory.max(process_rss_bytes())
        } else {
            state.granted_memory
        };
        let memory_fraction = memory_used as f64 / limits.memory_ceiling_bytes.max(1) as f64;
        let cpu_fraction =
            state.active_cpu_slots as f64 / limits.max_parallel_tasks.max(1) as f64;

        let cpu_critical = if cpu_fraction >= limits.critical_cpu_fraction {
            let since = state.over_cpu_since.get_or_insert_with(Instant::now);
            since.elapsed() >= limits.critical_cpu_sustain
        } else {
            state.over_cpu_since = None;
            false
        };

        let critical = memory_fraction >= limits.critical_memory_fraction || cpu_critical;
        let was = self.inner.emergency.swap(critical, Ordering::Relaxed);
        if critical && !was {
            warn!(
                memory_fraction = format!("{memory_fraction:.2}"),
                cpu_fraction = format!("{cpu_fraction:.2}"),
                "resource emergency: shedding caches and refusing non-essential work"
            );
            if let Some(bus) = self.inner.bus.read().as_ref() {
                bus.publish(BusEvent {
                    topic: topics::CACHE_EVICT,
                    key: None,
                    payload: BusPayload::CacheEvict { fraction: 0.5 },
                });
            }
        }
    }
}

impl ResourceLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn memory_budget(&self) -> u64 {
        self.request.memory_bytes
    }

    fn release_now(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut state = self.inner.state.lock();
            state.granted_memory = state.granted_memory.saturating_sub(self.request.memory_bytes);
            state.active_cpu_slots = state.active_cpu_slots.saturating_sub(self.request.cpu_slots);
            state.active_leases = state.active_leases.saturating_sub(1);
            if let Some(count) = state.in_flight_by_agent.get_mut(self.request.agent) {
                *count = count.saturating_sub(1);
            }
        }
        self.inner.notify.notify_waiters();
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.release_now();
    }
}

/// Resident set size of this process, in bytes. Zero where unavailable.
fn process_rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse::<u64>().ok())
            {
                return rss_pages * 4096;
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::as_codegraph_error;

    fn big_limits() -> ResourceLimits {
        let mut limits = ResourceLimits::new(1 << 40, 4);
        limits.track_process_rss = false;
        limits
    }

    fn request(memory: u64) -> ResourceRequest {
        ResourceRequest {
            memory_bytes: memory,
            cpu_slots: 1,
            io_class: IoClass::Batch,
            agent: "parser",
            essential: false,
        }
    }

    #[tokio::test]
    async fn grants_under_soft_limits() -> Result<()> {
        let manager = ResourceManager::new(big_limits());
        let lease = manager.request(request(1024)).await?;
        let util = manager.utilization();
        assert_eq!(util.active_leases, 1);
        assert_eq!(util.granted_memory_bytes, 1024);
        assert_eq!(util.in_flight_by_agent.get("parser"), Some(&1));
        drop(lease);
        assert_eq!(manager.utilization().active_leases, 0);
        Ok(())
    }

    #[tokio::test]
    async fn queued_request_wakes_on_release() -> Result<()> {
        // soft cpu = ceil(4 * 0.8) = 4 slots.
        let manager = ResourceManager::new(big_limits());
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(manager.request(request(1)).await?);
        }

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.request(request(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "request should be queued");

        held.pop();
        let lease = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken in time")
            .expect("task")?;
        assert!(lease.id() > 0);
        Ok(())
    }

    #[tokio::test]
    async fn memory_emergency_refuses_non_essential() -> Result<()> {
        // Tiny ceiling: one granted lease takes memory over 85%.
        let mut limits = ResourceLimits::new(1000, 64);
        limits.soft_memory_fraction = 1.0;
        limits.track_process_rss = false;
        let manager = ResourceManager::new(limits);

        let _hog = manager.request(request(900)).await?;
        let err = manager.request(request(10)).await.unwrap_err();
        assert_eq!(
            as_codegraph_error(&err).map(|e| e.code()),
            Some("RESOURCE_EXHAUSTED")
        );
        assert!(manager.is_emergency());

        // Essential work is still admitted.
        let essential = manager
            .request(ResourceRequest {
                essential: true,
                ..request(10)
            })
            .await?;
        drop(essential);
        Ok(())
    }

    #[tokio::test]
    async fn emergency_publishes_cache_eviction() -> Result<()> {
        let mut limits = ResourceLimits::new(1000, 64);
        limits.soft_memory_fraction = 1.0;
        limits.track_process_rss = false;
        let manager = ResourceManager::new(limits);
        let bus = Arc::new(KnowledgeBus::new(16));
        manager.attach_bus(Arc::clone(&bus));
        let sub = bus.subscribe(&[topics::CACHE_EVICT]);

        let _hog = manager.request(request(900)).await?;
        let _ = manager.request(request(10)).await;

        let event = sub.try_recv().expect("eviction event");
        match event.payload {
            BusPayload::CacheEvict { fraction } => assert!(fraction > 0.0),
            other => panic!("unexpected payload {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn budget_overrun_warns_and_revokes() -> Result<()> {
        let manager = ResourceManager::new(big_limits());
        let bus = Arc::new(KnowledgeBus::new(16));
        manager.attach_bus(Arc::clone(&bus));
        let sub = bus.subscribe(&[topics::RESOURCE_WARNING]);

        let mut lease = manager.request(request(1000)).await?;
        manager.report_usage(&mut lease, 1500);
        assert!(sub.try_recv().is_some(), "soft warning published");
        assert_eq!(manager.utilization().active_leases, 1);

        // Egregious overrun revokes the lease.
        manager.report_usage(&mut lease, 5000);
        assert_eq!(manager.utilization().active_leases, 0);
        Ok(())
    }
}

//! Tenant lifecycle control.
//!
//! One [`TenantSlot`] exists per tenant key ever observed. Each slot owns a
//! small state machine (`Stopped → Starting → Started → Stopped`) and the
//! manager enforces the global rules around it: ids are allocated once and
//! never recycled, at most `max_procs` workers are alive at any instant, and
//! concurrent first-touches of the same tenant produce exactly one spawn.
//!
//! Writer discipline: the request path is the only writer of
//! `Stopped → Starting` and `Starting → Started`; the supervising task of a
//! worker is the only writer of `→ Stopped`. The reaper never touches state,
//! it only signals kills.

use crate::config::{AttrMap, Config};
use crate::probe::{Readiness, ReadyProbe};
use crate::template;
use crate::worker::{self, WorkerHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Interval between readiness probes while a worker starts.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on how long a requester waits for a starting worker. A worker
/// that listens but never answers below 500 would otherwise be polled
/// forever.
pub const STARTUP_DEADLINE: Duration = Duration::from_secs(60);

/// Interval between idle reap sweeps.
pub const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// State of a tenant's worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TenantState {
    /// No process is running
    #[default]
    Stopped,
    /// A process was spawned and is being probed for readiness
    Starting,
    /// The process answered a readiness probe and accepts traffic
    Started,
}

/// Mutable per-tenant fields, guarded by the slot mutex.
#[derive(Default)]
struct TenantRecord {
    state: TenantState,
    worker: Option<WorkerHandle>,
    last_activity: Option<Instant>,
}

/// One tenant: immutable identity plus the guarded record.
pub struct TenantSlot {
    key: String,
    id: u16,
    /// User-supplied attributes unioned with the controller-assigned
    /// `id` and `key` fields; what the template expander reads.
    attrs: AttrMap,
    record: Mutex<TenantRecord>,
}

impl TenantSlot {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Tenant id, doubling as the worker's TCP port.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> TenantState {
        self.record.lock().state
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.record.lock().worker.as_ref().map(|w| w.pid())
    }

    /// Record traffic for this tenant. Only meaningful while a worker runs;
    /// a stopped tenant keeps `last_activity` empty.
    pub fn touch(&self) {
        let mut record = self.record.lock();
        if record.state == TenantState::Started {
            record.last_activity = Some(Instant::now());
        }
    }
}

/// Why the state machine refused to produce a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureError {
    /// Global live-worker cap reached while the tenant was stopped
    CapacityDenied,
    /// Worker exited before it became ready
    WorkerDied,
    /// Worker never became ready within the startup deadline
    StartupTimedOut,
}

/// Manages every tenant slot and the workers behind them.
///
/// Designed to live behind an `Arc` shared by the request path, the
/// supervising tasks and the reap loop; [`new`](TenantManager::new) returns
/// `Arc<Self>` directly to enforce this.
pub struct TenantManager {
    config: Arc<Config>,
    tenants: DashMap<String, Arc<TenantSlot>>,
    /// Next id to hand out; also guards registry insertion ordering.
    next_id: Mutex<u32>,
    /// Number of tenants with a live worker. Reserved before a slot leaves
    /// `Stopped`, released by the supervising task after exit.
    live_workers: AtomicUsize,
    probe: ReadyProbe,
}

impl TenantManager {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let next_id = Mutex::new(config.id_start);
        Arc::new(Self {
            config,
            tenants: DashMap::new(),
            next_id,
            live_workers: AtomicUsize::new(0),
            probe: ReadyProbe::new(),
        })
    }

    /// Current number of live workers.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Look up a tenant slot without creating it.
    pub fn lookup(&self, key: &str) -> Option<Arc<TenantSlot>> {
        self.tenants.get(key).map(|slot| Arc::clone(slot.value()))
    }

    /// Fetch the slot for a tenant key, allocating an id on first sight.
    ///
    /// Returns `None` once the id space `[id_start, id_start + max_procs)`
    /// is exhausted. Ids are stable for the lifetime of the controller and
    /// never recycled, so a tenant keeps its port across worker restarts.
    pub fn slot(&self, key: &str, user_attrs: &AttrMap) -> Option<Arc<TenantSlot>> {
        match self.tenants.entry(key.to_string()) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let id = self.allocate_id()?;
                info!(key, id, "allocated tenant id");

                let mut attrs = user_attrs.clone();
                attrs.insert("id".to_string(), serde_yaml::Value::from(u64::from(id)));
                attrs.insert("key".to_string(), serde_yaml::Value::from(key));

                let slot = Arc::new(TenantSlot {
                    key: key.to_string(),
                    id,
                    attrs,
                    record: Mutex::new(TenantRecord::default()),
                });
                entry.insert(Arc::clone(&slot));
                Some(slot)
            }
        }
    }

    fn allocate_id(&self) -> Option<u16> {
        let mut next = self.next_id.lock();
        if *next >= self.config.id_start + self.config.max_procs {
            info!(
                id_start = self.config.id_start,
                max_procs = self.config.max_procs,
                "tenant id space exhausted"
            );
            return None;
        }
        let id = *next as u16;
        *next += 1;
        Some(id)
    }

    /// Drive the tenant to `Started`, spawning its worker if necessary, and
    /// wait until it can serve traffic.
    pub async fn ensure_started(self: &Arc<Self>, slot: &Arc<TenantSlot>) -> Result<(), EnsureError> {
        enum Action {
            Serve,
            Wait,
            Spawn,
        }

        let action = {
            let mut record = slot.record.lock();
            match record.state {
                TenantState::Started => Action::Serve,
                TenantState::Starting => Action::Wait,
                TenantState::Stopped => {
                    // Reserve a live-worker slot atomically with the capacity
                    // check; concurrent first-touches of different tenants
                    // cannot overshoot the cap this way.
                    let max = self.config.max_procs as usize;
                    let reserved = self
                        .live_workers
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                            (n < max).then_some(n + 1)
                        })
                        .is_ok();
                    if !reserved {
                        info!(
                            key = slot.key(),
                            max_procs = max,
                            "tenant has no running worker but the live worker cap is reached"
                        );
                        return Err(EnsureError::CapacityDenied);
                    }
                    record.state = TenantState::Starting;
                    Action::Spawn
                }
            }
        };

        match action {
            Action::Serve => return Ok(()),
            Action::Spawn => self.spawn_for(slot),
            Action::Wait => {}
        }

        self.wait_ready(slot).await
    }

    /// Spawn the tenant's worker and its supervising task. The handle is
    /// stored before this returns, so kill paths never miss a fresh child.
    fn spawn_for(self: &Arc<Self>, slot: &Arc<TenantSlot>) {
        let program = &self.config.program;
        let args = template::expand_all(&program.args, &slot.attrs);
        let env = template::expand_all(&program.env, &slot.attrs);

        let spawned = worker::spawn(slot.id(), &program.binary, &args, &env);
        info!(
            key = slot.key(),
            id = slot.id(),
            pid = spawned.handle.pid(),
            "worker spawned"
        );
        slot.record.lock().worker = Some(spawned.handle);

        let manager = Arc::clone(self);
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            let status = worker::supervise(spawned.child, spawned.kill_rx).await;
            info!(
                key = slot.key(),
                id = slot.id(),
                status = ?status,
                "worker exited"
            );

            // Sole writer of the `→ Stopped` transition. The proxy cache
            // entry for the id is left alone; the port never changes.
            {
                let mut record = slot.record.lock();
                record.state = TenantState::Stopped;
                record.worker = None;
                record.last_activity = None;
            }
            manager.live_workers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Poll the slot until the worker is ready.
    ///
    /// Every waiting requester runs this loop; the first probe to observe
    /// readiness promotes the slot and the rest short-circuit on the next
    /// state check. Leaving `Starting` for anything but `Started` fails the
    /// request.
    async fn wait_ready(&self, slot: &Arc<TenantSlot>) -> Result<(), EnsureError> {
        let deadline = Instant::now() + STARTUP_DEADLINE;

        loop {
            match slot.state() {
                TenantState::Started => return Ok(()),
                TenantState::Stopped => {
                    info!(key = slot.key(), id = slot.id(), "worker died before becoming ready");
                    return Err(EnsureError::WorkerDied);
                }
                TenantState::Starting => {}
            }

            if Instant::now() >= deadline {
                info!(
                    key = slot.key(),
                    id = slot.id(),
                    deadline_secs = STARTUP_DEADLINE.as_secs(),
                    "worker did not become ready before the startup deadline"
                );
                return Err(EnsureError::StartupTimedOut);
            }

            if self.probe.check(slot.id()).await == Readiness::Ready {
                if self.mark_started(slot) {
                    return Ok(());
                }
                // State moved under us while probing; loop to observe where.
                continue;
            }

            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// Promote `Starting` to `Started`. Returns true when the slot is
    /// `Started` after the call, whether this caller or a concurrent one
    /// performed the promotion.
    fn mark_started(&self, slot: &TenantSlot) -> bool {
        let mut record = slot.record.lock();
        match record.state {
            TenantState::Starting => {
                record.state = TenantState::Started;
                record.last_activity = Some(Instant::now());
                info!(key = slot.key(), id = slot.id(), "worker is ready");
                true
            }
            TenantState::Started => true,
            TenantState::Stopped => false,
        }
    }

    /// One idle sweep: kill every worker whose last activity is older than
    /// the configured threshold.
    ///
    /// No state is written here; cleanup happens in the supervising task once
    /// the process is actually gone. A slot with no worker handle (spawn in
    /// progress, or already exited) is skipped.
    pub fn reap_idle(&self) {
        let threshold = self.config.idle_reap_threshold();

        for entry in self.tenants.iter() {
            let slot = entry.value();
            let record = slot.record.lock();
            let Some(last) = record.last_activity else {
                continue;
            };
            let idle = last.elapsed();
            if idle <= threshold {
                continue;
            }
            match &record.worker {
                Some(handle) => {
                    info!(
                        key = slot.key(),
                        id = slot.id(),
                        pid = handle.pid(),
                        idle_secs = idle.as_secs(),
                        "reaping idle worker"
                    );
                    handle.kill();
                }
                None => {
                    debug!(key = slot.key(), "idle tenant has no worker handle, skipping");
                }
            }
        }
    }

    /// Kill every live worker. Used during controller shutdown; the
    /// supervising tasks drain as usual.
    pub fn kill_all(&self) {
        for entry in self.tenants.iter() {
            let record = entry.value().record.lock();
            if let Some(handle) = &record.worker {
                handle.kill();
            }
        }
    }
}

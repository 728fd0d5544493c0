//! VM lease pool.
//!
//! Each workpool owns a roster of instances. A job acquires a [`Lease`] on
//! one free instance, holds it for the duration of its capture, and releases
//! it exactly once. Jobs that cannot be served immediately wait in a FIFO
//! queue; growable workpools provision new instances for them up to their
//! maximum size, and every in-flight provisioning is reserved for one
//! waiter.

mod provisioner;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use capturerun_core::{
    Instance, InstanceId, InstanceState, Lease, LeaseId, WorkpoolId, WorkpoolSpec,
    WorkpoolSummary,
};

pub use provisioner::{ManualProvisioner, ProvisionError, Provisioner};

/// Lease pool errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("Unknown workpool: {0}")]
    UnknownWorkpool(WorkpoolId),

    #[error("Workpool already exists: {0}")]
    WorkpoolExists(WorkpoolId),

    #[error("No instance of workpool {workpool} became available within {waited:?}")]
    LeaseUnavailable {
        workpool: WorkpoolId,
        waited: Duration,
    },

    #[error("Workpool {0} was deleted")]
    WorkpoolDeleted(WorkpoolId),

    #[error("Workpool {0} has outstanding leases")]
    WorkpoolBusy(WorkpoolId),

    #[error("Lease {0} was never issued")]
    UnknownLease(LeaseId),

    #[error("Unknown instance {instance} in workpool {workpool}")]
    UnknownInstance {
        workpool: WorkpoolId,
        instance: InstanceId,
    },
}

/// Result of asking for an instance to be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The instance left the roster.
    Removed(Instance),
    /// The instance is busy; it leaves once released or provisioned.
    Deferred,
}

type LeaseResult = Result<Lease, LeaseError>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<LeaseResult>,
}

struct Workpool {
    spec: WorkpoolSpec,
    instances: BTreeMap<InstanceId, Instance>,
    leases: HashMap<LeaseId, InstanceId>,
    waiters: VecDeque<Waiter>,
    last_error: Option<String>,
}

impl Workpool {
    fn new(spec: WorkpoolSpec) -> Self {
        Self {
            spec,
            instances: BTreeMap::new(),
            leases: HashMap::new(),
            waiters: VecDeque::new(),
            last_error: None,
        }
    }

    fn count(&self, state: InstanceState) -> usize {
        self.instances.values().filter(|i| i.state == state).count()
    }

    fn first_free(&self) -> Option<InstanceId> {
        self.instances
            .values()
            .find(|instance| instance.is_free())
            .map(|instance| instance.id)
    }

    fn summary(&self) -> WorkpoolSummary {
        WorkpoolSummary {
            spec: self.spec.clone(),
            instances: self.instances.values().cloned().collect(),
            leases: self.leases.len(),
            waiters: self.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            last_error: self.last_error.clone(),
        }
    }

    /// Return a leased instance to the pool, or drop it if removal is pending.
    fn return_instance(&mut self, id: InstanceId) {
        let pending_removal = match self.instances.get_mut(&id) {
            Some(instance) if instance.pending_removal => true,
            Some(instance) => {
                instance.state = InstanceState::Available;
                false
            }
            None => false,
        };
        if pending_removal {
            self.instances.remove(&id);
            info!(workpool = %self.spec.id, instance = %id, "Removed released instance");
        }
    }
}

struct PoolInner {
    workpools: Mutex<HashMap<WorkpoolId, Workpool>>,
    provisioner: Arc<dyn Provisioner>,
    wait_timeout: Duration,
    next_lease: AtomicU64,
    next_instance: AtomicU64,
    next_waiter: AtomicU64,
}

/// Registry of workpools and the leases issued on their instances.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct LeasePool {
    inner: Arc<PoolInner>,
}

impl LeasePool {
    /// Create a pool whose acquisitions give up after `wait_timeout`.
    pub fn new(provisioner: Arc<dyn Provisioner>, wait_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                workpools: Mutex::new(HashMap::new()),
                provisioner,
                wait_timeout,
                next_lease: AtomicU64::new(1),
                next_instance: AtomicU64::new(1),
                next_waiter: AtomicU64::new(1),
            }),
        }
    }

    pub fn create_workpool(&self, spec: WorkpoolSpec) -> Result<(), LeaseError> {
        let mut pools = self.inner.lock();
        if pools.contains_key(&spec.id) {
            return Err(LeaseError::WorkpoolExists(spec.id));
        }
        info!(
            workpool = %spec.id,
            max_instances = spec.max_instances,
            growable = spec.growable,
            "Created workpool"
        );
        pools.insert(spec.id.clone(), Workpool::new(spec));
        Ok(())
    }

    /// Delete a workpool that has no outstanding leases.
    ///
    /// Jobs still waiting for one of its instances fail with
    /// [`LeaseError::WorkpoolDeleted`].
    pub fn delete_workpool(&self, id: &WorkpoolId) -> Result<WorkpoolSummary, LeaseError> {
        let mut pools = self.inner.lock();
        let pool = pools
            .get(id)
            .ok_or_else(|| LeaseError::UnknownWorkpool(id.clone()))?;
        if !pool.leases.is_empty() {
            return Err(LeaseError::WorkpoolBusy(id.clone()));
        }

        let mut pool = match pools.remove(id) {
            Some(pool) => pool,
            None => return Err(LeaseError::UnknownWorkpool(id.clone())),
        };
        drop(pools);

        let summary = pool.summary();
        for waiter in pool.waiters.drain(..) {
            let _ = waiter.tx.send(Err(LeaseError::WorkpoolDeleted(id.clone())));
        }
        for instance in pool.instances.into_values() {
            if instance.state != InstanceState::Provisioning {
                self.inner.deprovision(instance);
            }
        }
        info!(workpool = %id, "Deleted workpool");
        Ok(summary)
    }

    /// Change the maximum size of a workpool.
    ///
    /// Free instances above the new maximum of a growable workpool are
    /// deprovisioned.
    pub fn set_max_instances(&self, id: &WorkpoolId, max_instances: usize) -> Result<(), LeaseError> {
        let mut pools = self.inner.lock();
        let pool = pools
            .get_mut(id)
            .ok_or_else(|| LeaseError::UnknownWorkpool(id.clone()))?;
        pool.spec.max_instances = max_instances;

        if pool.spec.growable {
            while pool.instances.len() > max_instances {
                let Some(free) = pool
                    .instances
                    .values()
                    .rev()
                    .find(|instance| instance.is_free())
                    .map(|instance| instance.id)
                else {
                    break;
                };
                if let Some(instance) = pool.instances.remove(&free) {
                    info!(workpool = %id, instance = %free, "Reclaiming instance above maximum");
                    self.inner.deprovision(instance);
                }
            }
        }

        self.inner.process(pool);
        Ok(())
    }

    /// Register an existing VM with a workpool.
    pub fn add_instance(
        &self,
        workpool: &WorkpoolId,
        name: impl Into<String>,
    ) -> Result<Instance, LeaseError> {
        let mut pools = self.inner.lock();
        let pool = pools
            .get_mut(workpool)
            .ok_or_else(|| LeaseError::UnknownWorkpool(workpool.clone()))?;

        let id = InstanceId::new(self.inner.next_instance.fetch_add(1, Ordering::Relaxed));
        let instance = Instance::new(id, workpool.clone(), name);
        pool.instances.insert(id, instance.clone());
        info!(workpool = %workpool, instance = %id, name = %instance.name, "Added instance");

        self.inner.process(pool);
        Ok(instance)
    }

    /// Remove an instance from its workpool.
    ///
    /// An instance backing an outstanding lease, or still being provisioned,
    /// is marked and removed once it becomes idle.
    pub fn remove_instance(
        &self,
        workpool: &WorkpoolId,
        instance: InstanceId,
    ) -> Result<RemoveOutcome, LeaseError> {
        let mut pools = self.inner.lock();
        let pool = pools
            .get_mut(workpool)
            .ok_or_else(|| LeaseError::UnknownWorkpool(workpool.clone()))?;
        let entry = pool
            .instances
            .get_mut(&instance)
            .ok_or_else(|| LeaseError::UnknownInstance {
                workpool: workpool.clone(),
                instance,
            })?;

        match entry.state {
            InstanceState::Leased | InstanceState::Provisioning => {
                entry.pending_removal = true;
                info!(workpool = %workpool, instance = %instance, "Instance busy, removal deferred");
                Ok(RemoveOutcome::Deferred)
            }
            InstanceState::Available | InstanceState::Broken => {
                let removed = pool.instances.remove(&instance).ok_or_else(|| {
                    LeaseError::UnknownInstance {
                        workpool: workpool.clone(),
                        instance,
                    }
                })?;
                info!(workpool = %workpool, instance = %instance, "Removed instance");
                Ok(RemoveOutcome::Removed(removed))
            }
        }
    }

    /// Lease a free instance, waiting in line if none is available.
    ///
    /// Fails with [`LeaseError::LeaseUnavailable`] once the pool's wait
    /// timeout elapses. Dropping the returned future gives up the place in
    /// line; a lease granted concurrently is released again.
    pub async fn acquire(&self, workpool: &WorkpoolId) -> Result<Lease, LeaseError> {
        let waiter_id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pools = self.inner.lock();
            let pool = pools
                .get_mut(workpool)
                .ok_or_else(|| LeaseError::UnknownWorkpool(workpool.clone()))?;
            pool.waiters.push_back(Waiter { id: waiter_id, tx });
            debug!(workpool = %workpool, waiters = pool.waiters.len(), "Waiting for instance");
            self.inner.process(pool);
        }

        let mut pending = PendingLease { pool: self, rx };
        match tokio::time::timeout(self.inner.wait_timeout, &mut pending.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LeaseError::WorkpoolDeleted(workpool.clone())),
            Err(_) => {
                {
                    let mut pools = self.inner.lock();
                    if let Some(pool) = pools.get_mut(workpool) {
                        pool.waiters.retain(|waiter| waiter.id != waiter_id);
                    }
                }
                // Granted right before the waiter was withdrawn
                if let Ok(result) = pending.rx.try_recv() {
                    return result;
                }
                warn!(workpool = %workpool, "Timed out waiting for an instance");
                Err(LeaseError::LeaseUnavailable {
                    workpool: workpool.clone(),
                    waited: self.inner.wait_timeout,
                })
            }
        }
    }

    /// Like [`LeasePool::acquire`], but the lease goes back to the pool
    /// when the returned guard is dropped.
    /// This includes a holder that is aborted or unwinds from a panic.
    pub async fn lease(&self, workpool: &WorkpoolId) -> Result<LeaseGuard, LeaseError> {
        let lease = self.acquire(workpool).await?;
        Ok(LeaseGuard {
            pool: self.clone(),
            lease,
            released: false,
        })
    }

    /// Return a leased instance to its workpool.
    ///
    /// Releasing the same lease twice is a no-op; releasing a lease this
    /// pool never issued is an error.
    pub fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        if lease.id.get() >= self.inner.next_lease.load(Ordering::Relaxed) {
            return Err(LeaseError::UnknownLease(lease.id));
        }

        let mut pools = self.inner.lock();
        let Some(pool) = pools.get_mut(&lease.workpool) else {
            debug!(lease = %lease.id, "Lease released after its workpool was deleted");
            return Ok(());
        };
        let Some(instance) = pool.leases.remove(&lease.id) else {
            debug!(lease = %lease.id, "Lease already released");
            return Ok(());
        };

        pool.return_instance(instance);
        info!(
            workpool = %lease.workpool,
            lease = %lease.id,
            instance = %instance,
            "Released lease"
        );
        self.inner.process(pool);
        Ok(())
    }

    pub fn has_workpool(&self, id: &WorkpoolId) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn workpool(&self, id: &WorkpoolId) -> Option<WorkpoolSummary> {
        self.inner.lock().get(id).map(Workpool::summary)
    }

    /// Summaries of every workpool, ordered by id.
    pub fn workpools(&self) -> Vec<WorkpoolSummary> {
        let mut summaries: Vec<WorkpoolSummary> =
            self.inner.lock().values().map(Workpool::summary).collect();
        summaries.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        summaries
    }
}

/// Receiving end of a queued acquisition; releases a lease nobody took.
struct PendingLease<'a> {
    pool: &'a LeasePool,
    rx: oneshot::Receiver<LeaseResult>,
}

impl Drop for PendingLease<'_> {
    fn drop(&mut self) {
        if let Ok(Ok(lease)) = self.rx.try_recv() {
            debug!(lease = %lease.id, "Acquisition abandoned, releasing lease");
            let _ = self.pool.release(&lease);
        }
    }
}

/// A held lease that is released when dropped.
pub struct LeaseGuard {
    pool: LeasePool,
    lease: Lease,
    released: bool,
}

impl LeaseGuard {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Release the lease now, reporting any error.
    pub fn release(mut self) -> Result<(), LeaseError> {
        self.released = true;
        self.pool.release(&self.lease)
    }
}

impl Deref for LeaseGuard {
    type Target = Lease;

    fn deref(&self) -> &Lease {
        &self.lease
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            workpool = %self.lease.workpool,
            lease = %self.lease.id,
            "Lease dropped by its holder, releasing it"
        );
        if let Err(e) = self.pool.release(&self.lease) {
            warn!(lease = %self.lease.id, error = %e, "Failed to release dropped lease");
        }
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<WorkpoolId, Workpool>> {
        match self.workpools.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Serve waiters in order: free instances first, then instances being
    /// provisioned, then new instances while the workpool may grow.
    fn process(self: &Arc<Self>, pool: &mut Workpool) {
        pool.waiters.retain(|waiter| !waiter.tx.is_closed());

        let mut in_flight = pool.count(InstanceState::Provisioning);
        let mut idx = 0;
        while idx < pool.waiters.len() {
            if let Some(instance) = pool.first_free() {
                let Some(waiter) = pool.waiters.remove(idx) else {
                    break;
                };
                let lease = self.grant(pool, instance);
                if let Err(Ok(lease)) = waiter.tx.send(Ok(lease)) {
                    // Waiter gave up in the meantime
                    pool.leases.remove(&lease.id);
                    pool.return_instance(lease.instance);
                }
                continue;
            }

            if in_flight > 0 {
                in_flight -= 1;
            } else if pool.spec.growable && pool.instances.len() < pool.spec.max_instances {
                self.provision(pool);
            } else {
                break;
            }
            idx += 1;
        }
    }

    fn grant(&self, pool: &mut Workpool, instance: InstanceId) -> Lease {
        let id = LeaseId::new(self.next_lease.fetch_add(1, Ordering::Relaxed));
        let name = match pool.instances.get_mut(&instance) {
            Some(entry) => {
                entry.state = InstanceState::Leased;
                entry.name.clone()
            }
            None => String::new(),
        };
        pool.leases.insert(id, instance);
        info!(workpool = %pool.spec.id, lease = %id, instance = %instance, "Granted lease");

        Lease {
            id,
            workpool: pool.spec.id.clone(),
            instance,
            instance_name: name,
            acquired_at: chrono::Utc::now(),
        }
    }

    fn provision(self: &Arc<Self>, pool: &mut Workpool) {
        let id = InstanceId::new(self.next_instance.fetch_add(1, Ordering::Relaxed));
        let workpool = pool.spec.id.clone();
        let placeholder = format!("{workpool}-{id}");
        pool.instances.insert(
            id,
            Instance::new(id, workpool.clone(), placeholder).with_state(InstanceState::Provisioning),
        );
        info!(workpool = %workpool, instance = %id, "Provisioning instance");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.provisioner.provision(&workpool, id).await;
            inner.provisioned(&workpool, id, result);
        });
    }

    fn provisioned(
        self: &Arc<Self>,
        workpool: &WorkpoolId,
        id: InstanceId,
        result: Result<String, ProvisionError>,
    ) {
        let mut pools = self.lock();
        let Some(pool) = pools.get_mut(workpool) else {
            if let Ok(name) = result {
                self.deprovision(Instance::new(id, workpool.clone(), name));
            }
            return;
        };

        let pending_removal = pool
            .instances
            .get(&id)
            .map_or(true, |instance| instance.pending_removal);
        match result {
            Ok(name) if pending_removal => {
                pool.instances.remove(&id);
                info!(workpool = %workpool, instance = %id, "Provisioned instance was removed");
                self.deprovision(Instance::new(id, workpool.clone(), name));
            }
            Ok(name) => {
                if let Some(instance) = pool.instances.get_mut(&id) {
                    instance.name = name;
                    instance.state = InstanceState::Available;
                }
                info!(workpool = %workpool, instance = %id, "Instance available");
            }
            Err(e) => {
                warn!(workpool = %workpool, instance = %id, error = %e, "Provisioning failed");
                pool.last_error = Some(e.to_string());
                if pending_removal {
                    pool.instances.remove(&id);
                } else if let Some(instance) = pool.instances.get_mut(&id) {
                    instance.state = InstanceState::Broken;
                }
            }
        }

        self.process(pool);
    }

    fn deprovision(&self, instance: Instance) {
        let provisioner = Arc::clone(&self.provisioner);
        tokio::spawn(async move {
            if let Err(e) = provisioner.deprovision(&instance).await {
                warn!(
                    workpool = %instance.workpool,
                    instance = %instance.id,
                    error = %e,
                    "Deprovisioning failed"
                );
            }
        });
    }
}

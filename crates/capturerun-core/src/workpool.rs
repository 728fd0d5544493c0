//! Workpool, instance, and lease records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{InstanceId, LeaseId, WorkpoolId};

/// State of a VM instance within its workpool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Being created by the provisioner.
    #[default]
    Provisioning,
    /// Ready and not leased.
    Available,
    /// Bound to an outstanding lease.
    Leased,
    /// Provisioning failed; unusable until removed.
    Broken,
}

/// A VM instance belonging to exactly one workpool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub workpool: WorkpoolId,
    /// Hypervisor-side name of the VM.
    pub name: String,
    pub state: InstanceState,
    /// Removal requested while the instance was busy.
    pub pending_removal: bool,
}

impl Instance {
    pub fn new(id: InstanceId, workpool: WorkpoolId, name: impl Into<String>) -> Self {
        Self {
            id,
            workpool,
            name: name.into(),
            state: InstanceState::Available,
            pending_removal: false,
        }
    }

    pub fn with_state(mut self, state: InstanceState) -> Self {
        self.state = state;
        self
    }

    /// Returns true if the instance can be handed to a new lease.
    pub fn is_free(&self) -> bool {
        self.state == InstanceState::Available && !self.pending_removal
    }
}

/// Exclusive claim on one instance for the duration of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub workpool: WorkpoolId,
    pub instance: InstanceId,
    pub instance_name: String,
    pub acquired_at: DateTime<Utc>,
}

/// Definition of a workpool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkpoolSpec {
    pub id: WorkpoolId,
    pub name: String,
    /// Upper bound on instances, counting provisioning and broken ones.
    pub max_instances: usize,
    /// Whether new instances may be provisioned on demand.
    pub growable: bool,
}

impl WorkpoolSpec {
    pub fn new(id: impl Into<WorkpoolId>, max_instances: usize) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            max_instances,
            growable: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn growable(mut self) -> Self {
        self.growable = true;
        self
    }
}

/// Point-in-time view of a workpool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkpoolSummary {
    pub spec: WorkpoolSpec,
    pub instances: Vec<Instance>,
    pub leases: usize,
    pub waiters: usize,
    pub last_error: Option<String>,
}

impl WorkpoolSummary {
    pub fn count(&self, state: InstanceState) -> usize {
        self.instances.iter().filter(|i| i.state == state).count()
    }
}

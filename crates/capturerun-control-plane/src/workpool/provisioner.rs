//! Hypervisor-facing side of the lease pool.

use async_trait::async_trait;
use thiserror::Error;

use capturerun_core::{Instance, InstanceId, WorkpoolId};

/// Failure reported by a provisioner.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProvisionError(pub String);

/// Creates and destroys the VMs backing workpool instances.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Create the VM for a new instance and return its hypervisor name.
    async fn provision(
        &self,
        workpool: &WorkpoolId,
        instance: InstanceId,
    ) -> Result<String, ProvisionError>;

    /// Destroy the VM behind an instance that left the pool.
    async fn deprovision(&self, instance: &Instance) -> Result<(), ProvisionError>;
}

/// Provisioner for workpools whose instances are all registered by hand.
pub struct ManualProvisioner;

#[async_trait]
impl Provisioner for ManualProvisioner {
    async fn provision(
        &self,
        workpool: &WorkpoolId,
        _instance: InstanceId,
    ) -> Result<String, ProvisionError> {
        Err(ProvisionError(format!(
            "workpool {workpool} cannot provision instances"
        )))
    }

    async fn deprovision(&self, _instance: &Instance) -> Result<(), ProvisionError> {
        Ok(())
    }
}

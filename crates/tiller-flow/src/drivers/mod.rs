//! Provisioning collaborator traits.
//!
//! Compute and network provisioning are external services consumed
//! through narrow create/delete/attach/detach operations. Their failure
//! and timeout semantics are treated identically to agent-protocol
//! failures for revert purposes. The spares pool is a shared resource
//! guarded by the coordination service; tasks reach it through
//! [`SparePool`] so the exclusion lives outside this crate.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tiller_store::Amphora;

use crate::task::TaskError;

/// Errors from provisioning collaborators.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Hard(String),
}

impl From<DriverError> for TaskError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Transient(msg) => TaskError::Transient(msg),
            DriverError::Hard(msg) => TaskError::Hard(msg),
        }
    }
}

/// A booted compute instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeInstance {
    pub compute_id: String,
    /// Management-network address assigned at boot.
    pub management_ip: String,
}

/// Lifecycle state of a compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeStatus {
    Building,
    Active,
    Error,
}

/// A VIP allocation on the tenant network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VipAllocation {
    pub address: String,
    pub port_id: String,
    pub subnet_id: String,
}

/// A port plugged into an amphora's compute instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortInfo {
    pub port_id: String,
    pub address: String,
    pub subnet_id: String,
}

/// Narrow compute provisioning surface.
#[async_trait]
pub trait ComputeDriver: Send + Sync {
    /// Boot a new instance. The instance may still be building on return.
    async fn boot_instance(&self, name: &str) -> Result<ComputeInstance, DriverError>;

    /// Delete an instance by compute ID.
    async fn delete_instance(&self, compute_id: &str) -> Result<(), DriverError>;

    /// Current lifecycle status of an instance.
    async fn instance_status(&self, compute_id: &str) -> Result<ComputeStatus, DriverError>;
}

/// Narrow network provisioning surface.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Allocate a VIP for a load balancer.
    async fn allocate_vip(&self, lb_id: &str) -> Result<VipAllocation, DriverError>;

    /// Release a VIP port.
    async fn deallocate_vip(&self, port_id: &str) -> Result<(), DriverError>;

    /// Attach a port on the given subnet to a compute instance.
    async fn plug_port(&self, compute_id: &str, subnet_id: &str) -> Result<PortInfo, DriverError>;

    /// Detach a port from a compute instance.
    async fn unplug_port(&self, compute_id: &str, port_id: &str) -> Result<(), DriverError>;

    /// Subnets currently plumbed into a compute instance.
    async fn plumbed_subnets(&self, compute_id: &str) -> Result<Vec<String>, DriverError>;

    /// Find the port attaching a compute instance to a subnet, if any.
    async fn find_port(
        &self,
        compute_id: &str,
        subnet_id: &str,
    ) -> Result<Option<PortInfo>, DriverError>;
}

/// Exclusive access to the pool of unallocated spare amphorae.
///
/// `acquire` removes a spare from the pool and hands it to exactly one
/// caller; `release` returns an amphora to the pool. Implementations
/// must guarantee a spare is never handed to two concurrent flows.
#[async_trait]
pub trait SparePool: Send + Sync {
    async fn acquire(&self) -> Result<Option<Amphora>, DriverError>;

    async fn release(&self, amphora_id: &str) -> Result<(), DriverError>;
}

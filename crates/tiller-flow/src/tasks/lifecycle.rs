//! Load-balancer bookkeeping tasks.
//!
//! Terminal status transitions sit at the edges of every flow. The
//! activation task is the last node of create/update/failover flows;
//! its revert pins the record in Error so operators see a faulted
//! balancer rather than a half-provisioned one reported Active.

use async_trait::async_trait;
use tracing::info;

use tiller_store::{OperatingStatus, ProvisioningStatus};

use crate::task::{epoch_secs, require_str, Bindings, Task, TaskContext, TaskError};
use crate::tasks::network::LOADBALANCER_ID;

/// Mark the load balancer Active and clear any recorded fault.
pub struct MarkLbActive;

#[async_trait]
impl Task for MarkLbActive {
    fn name(&self) -> String {
        "mark-lb-active".to_string()
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let lb_id = require_str(inputs, LOADBALANCER_ID)?;
        let mut lb = ctx
            .store
            .get_load_balancer(lb_id)?
            .ok_or_else(|| TaskError::Hard(format!("unknown load balancer {lb_id}")))?;
        lb.provisioning_status = ProvisioningStatus::Active;
        lb.operating_status = OperatingStatus::Active;
        lb.fault_reason = None;
        lb.updated_at = epoch_secs();
        ctx.store.put_load_balancer(&lb)?;
        info!(%lb_id, "load balancer active");
        Ok(Bindings::new())
    }

    async fn revert(
        &self,
        ctx: &TaskContext,
        inputs: &Bindings,
        _outputs: &Bindings,
    ) -> Result<(), TaskError> {
        let lb_id = require_str(inputs, LOADBALANCER_ID)?;
        if let Some(mut lb) = ctx.store.get_load_balancer(lb_id)? {
            lb.provisioning_status = ProvisioningStatus::Error;
            lb.updated_at = epoch_secs();
            ctx.store.put_load_balancer(&lb)?;
        }
        Ok(())
    }
}

/// Tombstone the load balancer record at the end of the delete flow.
pub struct MarkLbDeleted;

#[async_trait]
impl Task for MarkLbDeleted {
    fn name(&self) -> String {
        "mark-lb-deleted".to_string()
    }

    async fn execute(&self, ctx: &TaskContext, inputs: &Bindings) -> Result<Bindings, TaskError> {
        let lb_id = require_str(inputs, LOADBALANCER_ID)?;
        let Some(mut lb) = ctx.store.get_load_balancer(lb_id)? else {
            return Ok(Bindings::new());
        };
        lb.provisioning_status = ProvisioningStatus::Deleted;
        lb.updated_at = epoch_secs();
        ctx.store.put_load_balancer(&lb)?;
        info!(%lb_id, "load balancer deleted");
        Ok(Bindings::new())
    }
}

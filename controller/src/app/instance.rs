// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instance operations and agent lifecycle notifications

use super::agent_error;
use super::Controller;
use crate::datastore::subnet_for_key;
use chrono::Utc;
use corral_common::api::external::Error;
use corral_common::api::external::Instance;
use corral_common::api::external::InstanceState;
use corral_common::api::external::ListResultVec;
use corral_common::api::external::RequestedResource;
use corral_common::api::external::Resource;
use corral_common::api::external::Workload;
use corral_common::api::external::WorkloadRequest;
use corral_common::api::internal::agent::AttachVolumeFailureReason;
use corral_common::api::internal::agent::DetachVolumeFailureReason;
use corral_common::api::internal::agent::RestartFailureReason;
use corral_common::api::internal::agent::StartFailureReason;
use corral_common::api::internal::agent::Stat;
use corral_common::api::internal::agent::StopFailureReason;
use corral_common::api::internal::agent::Trace;
use rand::Rng;
use slog::info;
use slog::warn;
use uuid::Uuid;

/// A locally administered, unicast MAC for a new instance.
fn new_mac_address() -> String {
    let mut octets = [0u8; 5];
    rand::thread_rng().fill(&mut octets[..]);
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3], octets[4]
    )
}

fn launch_resources(workload: &Workload) -> Vec<RequestedResource> {
    vec![
        RequestedResource::new(Resource::Instance, 1, true),
        RequestedResource::new(
            Resource::VCpus,
            workload.default_for(Resource::VCpus).unwrap_or(1),
            false,
        ),
        RequestedResource::new(
            Resource::MemMb,
            workload.default_for(Resource::MemMb).unwrap_or(0),
            false,
        ),
    ]
}

impl Controller {
    /// Launches instances of a workload.  Quota is consumed per instance;
    /// for ordinary instances an address is allocated, which in turn
    /// blocks until the subnet's concentrator is active.  Failures after
    /// the first instance return what was launched so far.
    pub async fn start_workload(
        &self,
        request: WorkloadRequest,
    ) -> Result<Vec<Instance>, Error> {
        if request.instances == 0 {
            return Err(Error::invalid_value(
                "instances",
                "at least one instance must be requested",
            ));
        }

        let workload =
            self.ds.get_workload(&request.tenant_id, request.workload_id)?;
        let is_cnci =
            self.ds.cnci_workload_id().map(|id| id == workload.id) == Ok(true);

        let mut instances = Vec::new();
        for _ in 0..request.instances {
            match self.start_one(&request, &workload, is_cnci).await {
                Ok(instance) => instances.push(instance),
                Err(error) if instances.is_empty() => return Err(error),
                Err(error) => {
                    warn!(self.log, "workload launch cut short";
                        "workload_id" => %workload.id,
                        "launched" => instances.len(),
                        "error" => %error);
                    break;
                }
            }
        }

        Ok(instances)
    }

    async fn start_one(
        &self,
        request: &WorkloadRequest,
        workload: &Workload,
        is_cnci: bool,
    ) -> Result<Instance, Error> {
        let tenant_id = &request.tenant_id;
        let resources = launch_resources(workload);

        /* Concentrators are not billed against tenant quota. */
        if !is_cnci && !self.quotas.consume(tenant_id, &resources).await {
            self.quotas.release(tenant_id, &resources).await;
            return Err(Error::forbidden("tenant over quota"));
        }

        let (ip_address, subnet) = if is_cnci {
            (None, request.subnet)
        } else {
            match self.ds.allocate_tenant_ip(tenant_id).await {
                Ok(ip) => {
                    let octets = ip.octets();
                    let key = u16::from_be_bytes([octets[1], octets[2]]);
                    (Some(ip), Some(subnet_for_key(key)))
                }
                Err(error) => {
                    self.quotas.release(tenant_id, &resources).await;
                    return Err(error);
                }
            }
        };

        let instance = Instance {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.clone(),
            workload_id: workload.id,
            name: request
                .name
                .clone()
                .unwrap_or_else(|| format!("instance-{}", Uuid::new_v4())),
            node_id: None,
            state: InstanceState::Pending,
            ip_address,
            subnet,
            mac_address: new_mac_address(),
            cnci: is_cnci,
            ssh_ip: None,
            ssh_port: None,
            create_time: Utc::now(),
        };

        let instance = match self.ds.add_instance(instance).await {
            Ok(instance) => instance,
            Err(error) => {
                if let Some(ip) = ip_address {
                    let _ = self.ds.release_tenant_ip(tenant_id, ip).await;
                }
                if !is_cnci {
                    self.quotas.release(tenant_id, &resources).await;
                }
                return Err(error);
            }
        };

        if let Err(error) =
            self.client.start_instance(&instance, workload).await
        {
            let _ = self.ds.delete_instance_inner(instance.id).await;
            if !is_cnci {
                self.quotas.release(tenant_id, &resources).await;
            }
            return Err(agent_error(error));
        }

        info!(self.log, "instance launch dispatched";
            "tenant_id" => tenant_id.clone(),
            "instance_id" => %instance.id,
            "workload_id" => %workload.id);

        Ok(instance)
    }

    /// Stops a running instance.
    pub async fn stop_instance(
        &self,
        caller: &str,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        let instance = self.instance_for(caller, instance_id)?;

        if instance.state == InstanceState::Exited {
            return Err(Error::invalid_request("instance already stopped"));
        }
        let Some(node_id) = instance.node_id.as_deref() else {
            return Err(Error::forbidden("instance not assigned to a node"));
        };

        self.ds
            .transition_instance(instance_id, InstanceState::Stopping)?;
        self.client
            .stop_instance(instance_id, node_id)
            .await
            .map_err(agent_error)
    }

    /// Restarts an exited instance within the caller's scope.
    pub async fn restart_instance(
        &self,
        caller: &str,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        self.instance_for(caller, instance_id)?;
        self.restart_instance_inner(instance_id).await
    }

    pub(crate) async fn restart_instance_inner(
        &self,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        let instance = self.ds.get_instance(instance_id)?;

        if instance.state != InstanceState::Exited {
            return Err(Error::invalid_request("instance not stopped"));
        }

        let workload = self
            .ds
            .get_workload(&instance.tenant_id, instance.workload_id)?;

        self.ds.instance_restarting(instance_id).await?;
        self.client
            .restart_instance(&instance, &workload)
            .await
            .map_err(agent_error)
    }

    /// Deletes an instance within the caller's scope, releasing its quota.
    pub async fn delete_instance(
        &self,
        caller: &str,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        let instance = self.instance_for(caller, instance_id)?;
        let workload = self
            .ds
            .get_workload(&instance.tenant_id, instance.workload_id)
            .ok();

        self.delete_instance_inner(instance_id).await?;

        if !instance.cnci {
            if let Some(workload) = workload {
                self.quotas
                    .release(
                        &instance.tenant_id,
                        &launch_resources(&workload),
                    )
                    .await;
            }
        }

        Ok(())
    }

    pub(crate) async fn delete_instance_inner(
        &self,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        let instance = self.ds.get_instance(instance_id)?;

        if let Some(node_id) = instance.node_id.as_deref() {
            if let Err(error) =
                self.client.delete_instance(instance_id, node_id).await
            {
                warn!(self.log, "error sending instance delete";
                    "instance_id" => %instance_id, "error" => %error);
            }
        }

        self.ds.delete_instance(instance_id).await
    }

    /// Lists a tenant's instances.
    pub fn list_instances(&self, tenant_id: &str) -> ListResultVec<Instance> {
        Ok(self.ds.get_tenant_instances(tenant_id))
    }

    /// Looks one instance up within the caller's scope.
    pub fn get_instance(
        &self,
        caller: &str,
        instance_id: Uuid,
    ) -> Result<Instance, Error> {
        self.instance_for(caller, instance_id)
    }

    /// Maps an instance name (or id string) to its id within a tenant.
    pub fn resolve_instance(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<Uuid>, Error> {
        self.ds.resolve_instance(tenant_id, name)
    }

    /*
     * Lifecycle notifications from the agent layer.
     */

    /// An instance came up on a node.  Concentrator arrivals unblock
    /// waiting allocations.
    pub fn instance_added(&self, instance_id: Uuid) -> Result<(), Error> {
        let instance = self.ds.get_instance(instance_id)?;
        if instance.cnci {
            self.cnci_manager_for_instance(&instance)?
                .cnci_added(instance_id)?;
        }
        Ok(())
    }

    /// An instance went away entirely.
    pub async fn instance_removed(
        &self,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        let instance = match self.ds.get_instance(instance_id) {
            Ok(instance) => instance,
            Err(error) => {
                /* A concentrator torn down by subnet removal is deleted
                 * from the datastore before the agent confirms; its
                 * manager still tracks it and is waiting on this event. */
                for tenant in self.ds.get_all_tenants()? {
                    if let Some(manager) = self.ds.cnci_manager(&tenant.id) {
                        if manager.cnci_removed(instance_id).is_ok() {
                            return Ok(());
                        }
                    }
                }
                return Err(error);
            }
        };

        if instance.cnci {
            self.cnci_manager_for_instance(&instance)?
                .cnci_removed(instance_id)?;
        }
        self.ds.delete_instance(instance_id).await
    }

    /// An instance stopped without being asked to go away.  Ordinary
    /// instances just transition; a concentrator that is still wanted is
    /// restarted.
    pub async fn instance_stopped(
        &self,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        let instance = self.ds.get_instance(instance_id)?;
        if instance.cnci {
            self.cnci_manager_for_instance(&instance)?
                .cnci_stopped(instance_id)
                .await
        } else {
            self.ds.instance_stopped(instance_id).await
        }
    }

    /// An instance failed to start.
    pub async fn start_failure(
        &self,
        instance_id: Uuid,
        reason: StartFailureReason,
        migration: bool,
    ) -> Result<(), Error> {
        let instance = self.ds.get_instance(instance_id)?;

        /* Concentrator bookkeeping has to land: it terminates any
         * allocation blocked on the launch.  The agent redelivers the
         * event if we fail here. */
        if instance.cnci {
            self.cnci_manager_for_instance(&instance)?
                .cnci_start_failure(instance_id)?;
        }

        self.ds.start_failure(instance_id, reason, migration).await?;

        if !instance.cnci && reason.is_fatal() && !migration {
            if let Ok(workload) = self
                .ds
                .get_workload(&instance.tenant_id, instance.workload_id)
            {
                self.quotas
                    .release(
                        &instance.tenant_id,
                        &launch_resources(&workload),
                    )
                    .await;
            }
        }

        Ok(())
    }

    /// An instance failed to restart.
    pub async fn restart_failure(
        &self,
        instance_id: Uuid,
        reason: RestartFailureReason,
    ) -> Result<(), Error> {
        self.ds.restart_failure(instance_id, reason).await
    }

    /// An instance failed to stop.
    pub async fn stop_failure(
        &self,
        instance_id: Uuid,
        reason: StopFailureReason,
    ) -> Result<(), Error> {
        self.ds.stop_failure(instance_id, reason).await
    }

    /// A volume failed to attach.
    pub async fn attach_volume_failure(
        &self,
        instance_id: Uuid,
        volume_id: Uuid,
        reason: AttachVolumeFailureReason,
    ) -> Result<(), Error> {
        self.ds
            .attach_volume_failure(instance_id, volume_id, reason)
            .await
    }

    /// A volume failed to detach.
    pub async fn detach_volume_failure(
        &self,
        instance_id: Uuid,
        volume_id: Uuid,
        reason: DetachVolumeFailureReason,
    ) -> Result<(), Error> {
        self.ds
            .detach_volume_failure(instance_id, volume_id, reason)
            .await
    }

    /// A statistics frame arrived from a node.
    pub async fn handle_stats(&self, stat: Stat) -> Result<(), Error> {
        self.ds.handle_stats(stat).await
    }

    /// A trace report arrived from a node.
    pub async fn handle_trace_report(
        &self,
        trace: Trace,
    ) -> Result<(), Error> {
        self.ds.handle_trace_report(trace).await
    }
}

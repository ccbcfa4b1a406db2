// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller façade
//!
//! [`Controller`] is thin operations glue: it validates inputs, enforces
//! the admin/tenant privilege split, and sequences the datastore, the
//! per-tenant concentrator managers and the external collaborators (agent
//! transport, block storage driver, quota service).  Everything stateful
//! lives in [`crate::datastore::DataStore`].

mod external_ip;
mod image;
mod instance;
mod node;
mod tenant;
mod volume;

pub use image::ImageCreate;
pub use volume::VolumeCreate;

use crate::cnci::CnciManager;
use crate::cnci::CnciOps;
use crate::datastore::subnet_key;
use crate::datastore::DataStore;
use async_trait::async_trait;
use corral_common::api::external::Error;
use corral_common::api::external::Instance;
use corral_common::api::external::InstanceState;
use corral_common::api::external::LookupResult;
use corral_common::api::external::MappedIp;
use corral_common::api::external::RequestedResource;
use corral_common::api::external::Workload;
use corral_common::api::external::WorkloadRequest;
use corral_common::api::external::ADMIN_TENANT_ID;
use slog::o;
use slog::Logger;
use std::sync::Arc;
use uuid::Uuid;

/// The agent-messaging transport, owned by the façade.  Commands are
/// fire-and-forget at the protocol level; outcomes come back as the
/// lifecycle notifications on [`Controller`].
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn start_instance(
        &self,
        instance: &Instance,
        workload: &Workload,
    ) -> Result<(), Error>;
    async fn stop_instance(
        &self,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<(), Error>;
    async fn restart_instance(
        &self,
        instance: &Instance,
        workload: &Workload,
    ) -> Result<(), Error>;
    async fn delete_instance(
        &self,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<(), Error>;
    async fn attach_volume(
        &self,
        volume_id: Uuid,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<(), Error>;
    async fn detach_volume(
        &self,
        volume_id: Uuid,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<(), Error>;
    async fn assign_external_ip(&self, mapping: &MappedIp)
        -> Result<(), Error>;
    async fn release_external_ip(
        &self,
        mapping: &MappedIp,
    ) -> Result<(), Error>;
    async fn evacuate_node(&self, node_id: &str) -> Result<(), Error>;
    async fn restore_node(&self, node_id: &str) -> Result<(), Error>;
}

/// The block storage driver.  Image blobs and volume data never pass
/// through the controller core; only identifiers and sizes do.
#[async_trait]
pub trait BlockDriver: Send + Sync {
    /// Creates a device, optionally initialized from an image, returning
    /// its id.
    async fn create_block_device(
        &self,
        volume_id: Option<Uuid>,
        image_id: Option<Uuid>,
        size_gb: u64,
    ) -> Result<Uuid, Error>;
    /// Creates a device holding the given data, returning its size in GiB.
    async fn create_block_device_from_data(
        &self,
        volume_id: Uuid,
        data: &[u8],
    ) -> Result<u64, Error>;
    async fn create_block_device_snapshot(
        &self,
        volume_id: Uuid,
        name: &str,
    ) -> Result<(), Error>;
    async fn delete_block_device_snapshot(
        &self,
        volume_id: Uuid,
        name: &str,
    ) -> Result<(), Error>;
    async fn delete_block_device(&self, volume_id: Uuid) -> Result<(), Error>;
    async fn block_device_size(&self, volume_id: Uuid) -> Result<u64, Error>;
}

/// The per-tenant quota counter.  `consume` answers whether the tenant may
/// take the resources; a denial obliges the caller to `release` what it
/// speculatively took.
#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn consume(
        &self,
        tenant_id: &str,
        resources: &[RequestedResource],
    ) -> bool;
    async fn release(&self, tenant_id: &str, resources: &[RequestedResource]);
}

/// Snapshot name under which image blobs are kept by the block driver.
pub(crate) const IMAGE_SNAPSHOT: &str = "corral-image";

/// Static controller configuration, loaded by the caller.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// vCPU default for concentrator instances.
    pub cnci_vcpus: i64,
    /// Memory default for concentrator instances, in MiB.
    pub cnci_mem_mb: i64,
    /// SSH public key installed on concentrators.
    pub cnci_ssh_key: String,
    /// Hashed password of the concentrator admin account.
    pub cnci_password_hash: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            cnci_vcpus: 4,
            cnci_mem_mb: 2048,
            cnci_ssh_key: String::new(),
            cnci_password_hash: String::from("*"),
        }
    }
}

/// The controller core's operations façade.
pub struct Controller {
    pub(crate) log: Logger,
    pub(crate) ds: Arc<DataStore>,
    pub(crate) client: Arc<dyn AgentClient>,
    pub(crate) block_driver: Arc<dyn BlockDriver>,
    pub(crate) quotas: Arc<dyn QuotaService>,
}

impl Controller {
    /// Assembles a controller over an initialized datastore, generates the
    /// concentrator workload, and attaches a concentrator manager to every
    /// known tenant.  Concentrators left over from a previous run are
    /// adopted; those whose subnets no longer host instances go on the
    /// removal clock.
    pub fn new(
        log: &Logger,
        config: &ControllerConfig,
        ds: Arc<DataStore>,
        client: Arc<dyn AgentClient>,
        block_driver: Arc<dyn BlockDriver>,
        quotas: Arc<dyn QuotaService>,
    ) -> Result<Arc<Controller>, Error> {
        let controller = Arc::new(Controller {
            log: log.new(o!("component" => "Controller")),
            ds,
            client,
            block_driver,
            quotas,
        });

        controller.ds.generate_cnci_workload(
            config.cnci_vcpus,
            config.cnci_mem_mb,
            &config.cnci_ssh_key,
            &config.cnci_password_hash,
        );

        for tenant in controller.ds.get_all_tenants()? {
            controller.init_cnci_manager(&tenant.id)?;
        }

        Ok(controller)
    }

    /// Builds and attaches the concentrator manager for one tenant.
    pub(crate) fn init_cnci_manager(
        self: &Arc<Self>,
        tenant_id: &str,
    ) -> Result<(), Error> {
        let ops =
            Arc::downgrade(&(Arc::clone(self) as Arc<dyn CnciOps>));
        let manager = CnciManager::new(
            &self.log,
            tenant_id,
            self.ds.cnci_workload_id()?,
            ops,
        );

        let cncis = self.ds.get_tenant_cncis(tenant_id);
        let instances = self.ds.get_tenant_instances(tenant_id);
        let survivors = cncis
            .into_iter()
            .map(|cnci| {
                let live = instances
                    .iter()
                    .filter(|i| i.subnet == cnci.subnet)
                    .count();
                (cnci, live)
            })
            .collect();
        manager.restore(survivors)?;

        self.ds.set_cnci_manager(tenant_id, manager)
    }

    /// Cancels pending concentrator timers and disconnects the store.
    pub async fn shutdown(&self) {
        if let Ok(tenants) = self.ds.get_all_tenants() {
            for tenant in tenants {
                if let Some(manager) = self.ds.cnci_manager(&tenant.id) {
                    manager.shutdown();
                }
            }
        }
        self.ds.exit().await;
    }

    /// The datastore behind this controller.
    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.ds
    }

    /// Whether the caller acts with administrative scope.
    pub(crate) fn is_admin(tenant_id: &str) -> bool {
        tenant_id == ADMIN_TENANT_ID
    }

    /// Admin may act on any scope; a regular tenant only on its own
    /// resources.
    pub(crate) fn ensure_scope(
        caller: &str,
        resource_tenant: &str,
    ) -> Result<(), Error> {
        if Controller::is_admin(caller) || caller == resource_tenant {
            Ok(())
        } else {
            Err(Error::forbidden("resource belongs to another tenant"))
        }
    }

    /// Looks up an instance within the caller's scope.  Admin sees every
    /// instance, concentrators included.
    pub(crate) fn instance_for(
        &self,
        caller: &str,
        instance_id: Uuid,
    ) -> LookupResult<Instance> {
        if Controller::is_admin(caller) {
            self.ds.get_instance(instance_id)
        } else {
            self.ds.get_tenant_instance(caller, instance_id)
        }
    }

    /// The concentrator manager of a tenant, or an error if the tenant is
    /// unknown.
    pub(crate) fn cnci_manager_for(
        &self,
        tenant_id: &str,
    ) -> LookupResult<Arc<CnciManager>> {
        self.ds.cnci_manager(tenant_id).ok_or_else(|| {
            Error::internal_error(&format!(
                "tenant {} has no concentrator manager",
                tenant_id
            ))
        })
    }
}

/* The concentrator managers drive launches, restarts and teardowns back
 * through the façade. */
#[async_trait]
impl CnciOps for Controller {
    async fn start_workload(
        &self,
        request: WorkloadRequest,
    ) -> Result<Vec<Instance>, Error> {
        Controller::start_workload(self, request).await
    }

    async fn restart_instance(&self, instance_id: Uuid) -> Result<(), Error> {
        self.restart_instance_inner(instance_id).await
    }

    async fn delete_instance(&self, instance_id: Uuid) -> Result<(), Error> {
        self.delete_instance_inner(instance_id).await
    }

    fn transition_instance(
        &self,
        instance_id: Uuid,
        state: InstanceState,
    ) -> Result<(), Error> {
        self.ds.transition_instance(instance_id, state)
    }
}

/// Routes a concentrator lifecycle event to the owning tenant's manager.
impl Controller {
    pub(crate) fn cnci_manager_for_instance(
        &self,
        instance: &Instance,
    ) -> LookupResult<Arc<CnciManager>> {
        self.cnci_manager_for(&instance.tenant_id)
    }

    /// The subnet key an instance's address lives on.
    pub(crate) fn instance_subnet_key(
        instance: &Instance,
    ) -> Result<u16, Error> {
        instance.subnet.as_ref().map(subnet_key).ok_or_else(|| {
            Error::internal_error("instance has no subnet assigned")
        })
    }

    /// Returns the concentrator instance serving a tenant instance's
    /// subnet.
    pub fn instance_cnci(
        &self,
        tenant_id: &str,
        instance_id: Uuid,
    ) -> LookupResult<Instance> {
        let instance = self.instance_for(tenant_id, instance_id)?;
        let manager = self.cnci_manager_for(&instance.tenant_id)?;
        manager.subnet_cnci(Controller::instance_subnet_key(&instance)?)
    }
}

pub(crate) fn agent_error(error: Error) -> Error {
    Error::unavail(&format!("agent call failed: {}", error))
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tenant, workload, quota and event-log operations

use super::Controller;
use chrono::DateTime;
use chrono::Utc;
use corral_common::api::external::CreateResult;
use corral_common::api::external::DeleteResult;
use corral_common::api::external::Error;
use corral_common::api::external::ListResultVec;
use corral_common::api::external::LogEntry;
use corral_common::api::external::LookupResult;
use corral_common::api::external::QuotaDetails;
use corral_common::api::external::Tenant;
use corral_common::api::external::TenantConfig;
use corral_common::api::external::TenantUsage;
use corral_common::api::external::UpdateResult;
use corral_common::api::external::Workload;
use corral_common::api::external::PUBLIC_TENANT_ID;
use std::sync::Arc;
use uuid::Uuid;

impl Controller {
    /// Creates a tenant and attaches a fresh concentrator manager to it.
    /// When no id is supplied one is generated.
    pub async fn create_tenant(
        self: &Arc<Self>,
        tenant_id: Option<&str>,
        config: TenantConfig,
    ) -> CreateResult<Tenant> {
        let id = match tenant_id {
            Some(id) => {
                /* Tenant ids in API paths must be UUIDs; the reserved
                 * scopes are created through bootstrap, not this path. */
                Uuid::parse_str(id)
                    .map_err(|_| {
                        Error::invalid_value("tenant_id", "malformed UUID")
                    })?
                    .to_string()
            }
            None => Uuid::new_v4().to_string(),
        };

        let tenant = self.ds.add_tenant(&id, config).await?;
        self.init_cnci_manager(&id)?;
        Ok(tenant)
    }

    /// Removes a tenant once every artifact it owns is gone.
    pub async fn delete_tenant(&self, tenant_id: &str) -> DeleteResult {
        if !self.ds.get_tenant_instances(tenant_id).is_empty()
            || !self.ds.get_tenant_cncis(tenant_id).is_empty()
        {
            return Err(Error::forbidden("tenant still has instances"));
        }
        if !self.ds.get_tenant_workloads(tenant_id)?.is_empty() {
            return Err(Error::forbidden("tenant still has workloads"));
        }
        if !self.ds.get_block_devices(tenant_id)?.is_empty() {
            return Err(Error::forbidden("tenant still has volumes"));
        }
        if !self.ds.get_mapped_ips(Some(tenant_id)).is_empty() {
            return Err(Error::forbidden("tenant still has mapped addresses"));
        }

        if let Some(manager) = self.ds.cnci_manager(tenant_id) {
            manager.shutdown();
        }

        self.ds.delete_tenant(tenant_id).await
    }

    /// Applies a JSON merge patch to a tenant's configuration.
    pub async fn patch_tenant(
        &self,
        tenant_id: &str,
        patch: &[u8],
    ) -> UpdateResult<Tenant> {
        self.ds.json_patch_tenant(tenant_id, patch).await
    }

    pub fn get_tenant(&self, tenant_id: &str) -> LookupResult<Tenant> {
        self.ds.get_tenant(tenant_id)
    }

    pub fn list_tenants(&self) -> ListResultVec<Tenant> {
        self.ds.get_all_tenants()
    }

    /// A tenant's actual resource usage between two points in time.
    pub fn tenant_usage(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ListResultVec<TenantUsage> {
        self.ds.get_tenant_usage(tenant_id, start, end)
    }

    /*
     * Workloads
     */

    /// Creates a workload.  Admin callers may create globally visible
    /// workloads by targeting the public tenant.
    pub async fn create_workload(
        &self,
        caller: &str,
        tenant_id: &str,
        mut workload: Workload,
    ) -> CreateResult<Workload> {
        if tenant_id == PUBLIC_TENANT_ID && !Controller::is_admin(caller) {
            return Err(Error::forbidden(
                "only admin may create public workloads",
            ));
        }
        Controller::ensure_scope(caller, tenant_id)?;

        workload.id = Uuid::new_v4();
        workload.tenant_id = tenant_id.to_owned();
        self.ds.add_workload(workload).await
    }

    /// Deletes a workload that no instance references.
    pub async fn delete_workload(
        &self,
        caller: &str,
        tenant_id: &str,
        workload_id: Uuid,
    ) -> DeleteResult {
        Controller::ensure_scope(caller, tenant_id)?;
        self.ds.delete_workload(tenant_id, workload_id).await
    }

    pub fn get_workload(
        &self,
        tenant_id: &str,
        workload_id: Uuid,
    ) -> LookupResult<Workload> {
        self.ds.get_workload(tenant_id, workload_id)
    }

    /// The workloads a tenant may launch: its own plus the public set.
    pub fn list_workloads(&self, tenant_id: &str) -> ListResultVec<Workload> {
        self.ds.get_workloads(tenant_id)
    }

    /*
     * Quotas
     */

    pub async fn list_quotas(
        &self,
        tenant_id: &str,
    ) -> ListResultVec<QuotaDetails> {
        self.ds.get_quotas(tenant_id).await
    }

    pub async fn update_quotas(
        &self,
        tenant_id: &str,
        quotas: &[QuotaDetails],
    ) -> Result<(), Error> {
        self.ds.update_quotas(tenant_id, quotas).await
    }

    /*
     * Event log
     */

    pub async fn list_events(&self) -> ListResultVec<LogEntry> {
        self.ds.get_event_log().await
    }

    pub async fn clear_events(&self) -> Result<(), Error> {
        self.ds.clear_log().await
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on tenants and workloads

use super::store_error;
use super::tenant_not_found;
use super::DataStore;
use super::TenantState;
use crate::cnci::CnciManager;
use corral_common::api::external::CreateResult;
use corral_common::api::external::DeleteResult;
use corral_common::api::external::Error;
use corral_common::api::external::ListResultVec;
use corral_common::api::external::LookupResult;
use corral_common::api::external::ResourceType;
use corral_common::api::external::Tenant;
use corral_common::api::external::TenantConfig;
use corral_common::api::external::UpdateResult;
use corral_common::api::external::Workload;
use corral_common::api::external::PUBLIC_TENANT_ID;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

impl DataStore {
    /// Stores information about a new tenant and caches it.
    pub async fn add_tenant(
        &self,
        id: &str,
        config: TenantConfig,
    ) -> CreateResult<Tenant> {
        {
            let tenants = self.tenants.read().unwrap();
            if tenants.contains_key(id) {
                return Err(Error::already_exists(ResourceType::Tenant, id));
            }
        }

        self.store
            .add_tenant(id, config.clone())
            .await
            .map_err(store_error)?;

        let tenant = Tenant {
            id: id.to_owned(),
            name: config.name,
            subnet_bits: config.subnet_bits,
        };

        let mut tenants = self.tenants.write().unwrap();
        if tenants.contains_key(id) {
            return Err(Error::already_exists(ResourceType::Tenant, id));
        }
        tenants.insert(
            id.to_owned(),
            TenantState {
                tenant: tenant.clone(),
                network: BTreeMap::new(),
                subnets: Vec::new(),
                instances: HashSet::new(),
                devices: HashSet::new(),
                workloads: Vec::new(),
                cnci_mgr: None,
            },
        );

        Ok(tenant)
    }

    /// Removes a tenant.  It is the caller's responsibility to ensure all
    /// tenant artifacts are removed first.
    pub async fn delete_tenant(&self, id: &str) -> DeleteResult {
        {
            let mut tenants = self.tenants.write().unwrap();
            if tenants.remove(id).is_none() {
                return Err(tenant_not_found(id));
            }
        }

        self.store.delete_tenant(id).await.map_err(store_error)
    }

    /// Returns details about the tenant with the given id.
    pub fn get_tenant(&self, id: &str) -> LookupResult<Tenant> {
        let tenants = self.tenants.read().unwrap();
        tenants
            .get(id)
            .map(|t| t.tenant.clone())
            .ok_or_else(|| tenant_not_found(id))
    }

    /// Returns all tenants.
    pub fn get_all_tenants(&self) -> ListResultVec<Tenant> {
        let tenants = self.tenants.read().unwrap();
        Ok(tenants.values().map(|t| t.tenant.clone()).collect())
    }

    /// Updates a tenant with changes from a JSON merge patch over its
    /// configuration.  A patch whose shape does not match the configuration
    /// is rejected.
    pub async fn json_patch_tenant(
        &self,
        id: &str,
        patch: &[u8],
    ) -> UpdateResult<Tenant> {
        let current = {
            let tenants = self.tenants.read().unwrap();
            let state = tenants.get(id).ok_or_else(|| tenant_not_found(id))?;
            TenantConfig {
                name: state.tenant.name.clone(),
                subnet_bits: state.tenant.subnet_bits,
            }
        };

        let mut merged = serde_json::to_value(&current)
            .map_err(|e| Error::internal_error(&e.to_string()))?;
        let patch: serde_json::Value = serde_json::from_slice(patch)
            .map_err(|e| Error::invalid_value("patch", &e.to_string()))?;
        merge_patch(&mut merged, &patch);
        let config: TenantConfig = serde_json::from_value(merged)
            .map_err(|e| Error::invalid_value("patch", &e.to_string()))?;

        let tenant = Tenant {
            id: id.to_owned(),
            name: config.name,
            subnet_bits: config.subnet_bits,
        };

        self.store.update_tenant(&tenant).await.map_err(store_error)?;

        let mut tenants = self.tenants.write().unwrap();
        let state = tenants.get_mut(id).ok_or_else(|| tenant_not_found(id))?;
        state.tenant = tenant.clone();

        Ok(tenant)
    }

    /// Hands a tenant its concentrator manager.  Called once at controller
    /// initialization and again when tenants are created at runtime.
    pub fn set_cnci_manager(
        &self,
        tenant_id: &str,
        manager: Arc<CnciManager>,
    ) -> Result<(), Error> {
        let mut tenants = self.tenants.write().unwrap();
        let state = tenants
            .get_mut(tenant_id)
            .ok_or_else(|| tenant_not_found(tenant_id))?;
        state.cnci_mgr = Some(manager);
        Ok(())
    }

    /// Returns the tenant's concentrator manager, if one has been attached.
    pub fn cnci_manager(&self, tenant_id: &str) -> Option<Arc<CnciManager>> {
        let tenants = self.tenants.read().unwrap();
        tenants.get(tenant_id).and_then(|t| t.cnci_mgr.clone())
    }

    /*
     * Workloads
     */

    /// Adds a new workload.  The owning tenant must already exist.
    pub async fn add_workload(&self, workload: Workload) -> CreateResult<Workload> {
        {
            let tenants = self.tenants.read().unwrap();
            if !tenants.contains_key(&workload.tenant_id) {
                return Err(tenant_not_found(&workload.tenant_id));
            }
        }

        self.store
            .update_workload(workload.clone())
            .await
            .map_err(store_error)?;

        let mut tenants = self.tenants.write().unwrap();
        let state = tenants
            .get_mut(&workload.tenant_id)
            .ok_or_else(|| tenant_not_found(&workload.tenant_id))?;
        state.workloads.push(workload.clone());

        Ok(workload)
    }

    /// Deletes an unused workload.  Fails while any instance references it.
    pub async fn delete_workload(
        &self,
        tenant_id: &str,
        workload_id: Uuid,
    ) -> DeleteResult {
        {
            let instances = self.instances.read().unwrap();
            if instances.values().any(|i| i.workload_id == workload_id) {
                return Err(Error::forbidden("workload is in use"));
            }
        }

        let found = {
            let tenants = self.tenants.read().unwrap();
            let state = tenants
                .get(tenant_id)
                .ok_or_else(|| tenant_not_found(tenant_id))?;
            state.workloads.iter().any(|w| w.id == workload_id)
        };
        if !found {
            return Err(Error::not_found_by_id(
                ResourceType::Workload,
                &workload_id,
            ));
        }

        self.store
            .delete_workload(workload_id)
            .await
            .map_err(store_error)?;

        let mut tenants = self.tenants.write().unwrap();
        if let Some(state) = tenants.get_mut(tenant_id) {
            state.workloads.retain(|w| w.id != workload_id);
        }

        Ok(())
    }

    /// Returns details about a specific workload.  Public workloads are
    /// visible from any tenant.
    pub fn get_workload(
        &self,
        tenant_id: &str,
        workload_id: Uuid,
    ) -> LookupResult<Workload> {
        if let Some(cnci) = self.cnci_workload() {
            if cnci.id == workload_id {
                return Ok(cnci);
            }
        }

        let tenants = self.tenants.read().unwrap();

        if let Some(public) = tenants.get(PUBLIC_TENANT_ID) {
            if let Some(workload) =
                public.workloads.iter().find(|w| w.id == workload_id)
            {
                return Ok(workload.clone());
            }
        }

        let state =
            tenants.get(tenant_id).ok_or_else(|| tenant_not_found(tenant_id))?;
        state
            .workloads
            .iter()
            .find(|w| w.id == workload_id)
            .cloned()
            .ok_or_else(|| {
                Error::not_found_by_id(ResourceType::Workload, &workload_id)
            })
    }

    /// Retrieves the workloads visible to a tenant, public ones included.
    pub fn get_workloads(&self, tenant_id: &str) -> ListResultVec<Workload> {
        self.workloads_for(tenant_id, true)
    }

    /// Retrieves a tenant's private workloads.
    pub fn get_tenant_workloads(
        &self,
        tenant_id: &str,
    ) -> ListResultVec<Workload> {
        self.workloads_for(tenant_id, false)
    }

    fn workloads_for(
        &self,
        tenant_id: &str,
        include_public: bool,
    ) -> ListResultVec<Workload> {
        let tenants = self.tenants.read().unwrap();
        let mut workloads = Vec::new();

        if include_public && tenant_id != PUBLIC_TENANT_ID {
            if let Some(public) = tenants.get(PUBLIC_TENANT_ID) {
                workloads.extend(public.workloads.iter().cloned());
            }
        }

        /* A missing tenant isn't necessarily an error here; the caller may
         * only be after the public set. */
        if let Some(state) = tenants.get(tenant_id) {
            workloads.extend(state.workloads.iter().cloned());
        }

        Ok(workloads)
    }
}

/// RFC 7396 JSON merge patch.
fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(entries) => {
            if !target.is_object() {
                *target = serde_json::Value::Object(Default::default());
            }
            let map = target.as_object_mut().unwrap();
            for (key, value) in entries {
                if value.is_null() {
                    map.remove(key);
                } else {
                    merge_patch(
                        map.entry(key.clone())
                            .or_insert(serde_json::Value::Null),
                        value,
                    );
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;
    use corral_common::dev::test_setup_log;

    async fn test_datastore() -> DataStore {
        let log = test_setup_log("datastore_tenant");
        DataStore::init(log, Arc::new(MemStore::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_tenant_rejects_duplicates() {
        let ds = test_datastore().await;
        let config =
            TenantConfig { name: String::from("one"), subnet_bits: 24 };

        ds.add_tenant("t1", config.clone()).await.unwrap();
        let error = ds.add_tenant("t1", config).await.unwrap_err();
        assert_eq!(
            error,
            Error::already_exists(ResourceType::Tenant, "t1")
        );
    }

    #[tokio::test]
    async fn test_json_patch_tenant() {
        let ds = test_datastore().await;
        ds.add_tenant(
            "t1",
            TenantConfig { name: String::from("one"), subnet_bits: 24 },
        )
        .await
        .unwrap();

        let tenant = ds
            .json_patch_tenant("t1", br#"{"name": "renamed"}"#)
            .await
            .unwrap();
        assert_eq!(tenant.name, "renamed");
        assert_eq!(tenant.subnet_bits, 24);

        /* Shape mismatches are rejected and nothing is committed. */
        assert!(ds
            .json_patch_tenant("t1", br#"{"subnet_bits": "wide"}"#)
            .await
            .is_err());
        assert!(ds
            .json_patch_tenant("t1", br#"{"unknown_knob": 3}"#)
            .await
            .is_err());
        assert_eq!(ds.get_tenant("t1").unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn test_workload_visibility() {
        let ds = test_datastore().await;
        for id in [PUBLIC_TENANT_ID, "t1", "t2"] {
            ds.add_tenant(
                id,
                TenantConfig { name: id.to_owned(), subnet_bits: 24 },
            )
            .await
            .unwrap();
        }

        let public = test_workload(PUBLIC_TENANT_ID);
        let private = test_workload("t1");
        ds.add_workload(public.clone()).await.unwrap();
        ds.add_workload(private.clone()).await.unwrap();

        /* Any tenant sees the public workload. */
        assert!(ds.get_workload("t2", public.id).is_ok());
        /* Only the owner sees the private workload. */
        assert!(ds.get_workload("t2", private.id).is_err());
        assert!(ds.get_workload("t1", private.id).is_ok());

        let visible = ds.get_workloads("t1").unwrap();
        assert_eq!(visible.len(), 2);
        let private_only = ds.get_tenant_workloads("t1").unwrap();
        assert_eq!(private_only.len(), 1);
    }

    fn test_workload(tenant_id: &str) -> Workload {
        use corral_common::api::external::FwType;
        use corral_common::api::external::RequestedResource;
        use corral_common::api::external::Resource;
        use corral_common::api::external::VmType;

        Workload {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_owned(),
            description: String::from("test workload"),
            vm_type: VmType::Qemu,
            fw_type: FwType::Efi,
            image_name: None,
            defaults: vec![
                RequestedResource::new(Resource::VCpus, 2, false),
                RequestedResource::new(Resource::MemMb, 512, false),
            ],
            storage: Vec::new(),
            config: String::from("#cloud-config\n"),
        }
    }
}

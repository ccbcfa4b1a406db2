// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on instances and nodes

use super::now;
use super::store_error;
use super::DataStore;
use super::NodeState;
use corral_common::api::external::CreateResult;
use corral_common::api::external::DeleteResult;
use corral_common::api::external::Error;
use corral_common::api::external::Instance;
use corral_common::api::external::InstanceState;
use corral_common::api::external::LookupResult;
use corral_common::api::external::Node;
use corral_common::api::external::NodeRole;
use corral_common::api::external::Resource;
use corral_common::api::external::ResourceType;
use corral_common::api::external::ServerStats;
use corral_common::api::internal::agent::InstanceStat;
use corral_common::api::internal::agent::RestartFailureReason;
use corral_common::api::internal::agent::StartFailureReason;
use corral_common::api::internal::agent::StopFailureReason;
use slog::warn;
use std::collections::HashSet;
use uuid::Uuid;

fn instance_not_found(instance_id: &Uuid) -> Error {
    Error::not_found_by_id(ResourceType::Instance, instance_id)
}

impl DataStore {
    /// Stores a new instance, updating the cache, the tenant and node
    /// indexes, and seeding the last-statistics entry.
    pub async fn add_instance(
        &self,
        instance: Instance,
    ) -> CreateResult<Instance> {
        self.store.add_instance(&instance).await.map_err(store_error)?;

        self.instances.write().unwrap().insert(instance.id, instance.clone());

        self.instance_last_stats.write().unwrap().insert(
            instance.id,
            ServerStats {
                id: instance.id,
                tenant_id: instance.tenant_id.clone(),
                node_id: instance.node_id.clone(),
                timestamp: now(),
                state: instance.state,
                vcpu_usage: 0,
                mem_usage_mb: 0,
                disk_usage_mb: 0,
            },
        );

        {
            let mut tenants = self.tenants.write().unwrap();
            if let Some(tenant) = tenants.get_mut(&instance.tenant_id) {
                tenant.instances.insert(instance.id);
            }
        }

        if let Some(node_id) = &instance.node_id {
            let mut nodes = self.nodes.write().unwrap();
            let node =
                nodes.entry(node_id.clone()).or_insert_with(|| NodeState {
                    node: Node { id: node_id.clone(), ..Default::default() },
                    instances: HashSet::new(),
                });
            node.instances.insert(instance.id);
        }

        Ok(instance)
    }

    /// Removes an instance from the datastore and logs a user-visible
    /// event.
    pub async fn delete_instance(&self, instance_id: Uuid) -> DeleteResult {
        let tenant_id = self.delete_instance_inner(instance_id).await?;
        self.log_event(
            &tenant_id,
            format!("Deleted Instance {}", instance_id),
        )
        .await
    }

    /// Removes an instance from every index, releases its tenant IP (for
    /// non-concentrators) and reconciles its attachments away.
    pub(crate) async fn delete_instance_inner(
        &self,
        instance_id: Uuid,
    ) -> Result<String, Error> {
        let instance = self.get_instance(instance_id)?;

        self.store
            .delete_instance(instance_id)
            .await
            .map_err(store_error)?;

        self.instance_last_stats.write().unwrap().remove(&instance_id);
        self.instances.write().unwrap().remove(&instance_id);

        {
            let mut tenants = self.tenants.write().unwrap();
            if let Some(tenant) = tenants.get_mut(&instance.tenant_id) {
                tenant.instances.remove(&instance_id);
            }
        }

        /* We may never have received node stats for this instance. */
        if let Some(node_id) = &instance.node_id {
            let mut nodes = self.nodes.write().unwrap();
            if let Some(node) = nodes.get_mut(node_id) {
                node.instances.remove(&instance_id);
            }
        }

        if !instance.cnci {
            if let Some(ip) = instance.ip_address {
                if let Err(error) =
                    self.release_tenant_ip(&instance.tenant_id, ip).await
                {
                    warn!(self.log, "error releasing IP for instance";
                        "instance_id" => %instance_id,
                        "error" => %error);
                }
            }
        }

        self.update_storage_attachments(instance_id, &[]).await;

        Ok(instance.tenant_id)
    }

    /// Retrieves an instance.  Concentrators can be retrieved this way.
    pub fn get_instance(&self, instance_id: Uuid) -> LookupResult<Instance> {
        self.instances
            .read()
            .unwrap()
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| instance_not_found(&instance_id))
    }

    /// Retrieves a tenant instance; concentrators are excluded from this
    /// search.
    pub fn get_tenant_instance(
        &self,
        tenant_id: &str,
        instance_id: Uuid,
    ) -> LookupResult<Instance> {
        let instances = self.instances.read().unwrap();
        match instances.get(&instance_id) {
            Some(instance)
                if instance.tenant_id == tenant_id && !instance.cnci =>
            {
                Ok(instance.clone())
            }
            _ => Err(instance_not_found(&instance_id)),
        }
    }

    fn instances_where<F>(&self, filter: F) -> Vec<Instance>
    where
        F: Fn(&Instance) -> bool,
    {
        self.instances
            .read()
            .unwrap()
            .values()
            .filter(|i| filter(i))
            .cloned()
            .collect()
    }

    /// Retrieves all tenant instances, concentrators excluded.
    pub fn get_all_instances(&self) -> Vec<Instance> {
        self.instances_where(|i| !i.cnci)
    }

    /// Retrieves all concentrator instances.
    pub fn get_all_cnci_instances(&self) -> Vec<Instance> {
        self.instances_where(|i| i.cnci)
    }

    fn tenant_instances(&self, tenant_id: &str, cncis: bool) -> Vec<Instance> {
        let ids: Vec<Uuid> = {
            let tenants = self.tenants.read().unwrap();
            match tenants.get(tenant_id) {
                Some(state) => state.instances.iter().copied().collect(),
                None => return Vec::new(),
            }
        };

        let instances = self.instances.read().unwrap();
        ids.iter()
            .filter_map(|id| instances.get(id))
            .filter(|i| i.cnci == cncis)
            .cloned()
            .collect()
    }

    /// Retrieves all instances belonging to a tenant, concentrators
    /// excluded.
    pub fn get_tenant_instances(&self, tenant_id: &str) -> Vec<Instance> {
        self.tenant_instances(tenant_id, false)
    }

    /// Retrieves a tenant's concentrator instances.
    pub fn get_tenant_cncis(&self, tenant_id: &str) -> Vec<Instance> {
        self.tenant_instances(tenant_id, true)
    }

    /// Retrieves the instances placed on a specific node, concentrators
    /// excluded.
    pub fn get_instances_by_node(&self, node_id: &str) -> Vec<Instance> {
        let ids: Vec<Uuid> = {
            let nodes = self.nodes.read().unwrap();
            match nodes.get(node_id) {
                Some(node) => node.instances.iter().copied().collect(),
                None => return Vec::new(),
            }
        };

        let instances = self.instances.read().unwrap();
        ids.iter()
            .filter_map(|id| instances.get(id))
            .filter(|i| !i.cnci)
            .cloned()
            .collect()
    }

    /// Writes updated instance fields through to the persistent store.
    pub async fn update_instance(
        &self,
        instance: &Instance,
    ) -> Result<(), Error> {
        self.store.update_instance(instance).await.map_err(store_error)
    }

    /// Updates the cached state of an instance without touching the
    /// persistent store; agent events carry the durable truth.
    pub fn transition_instance(
        &self,
        instance_id: Uuid,
        state: InstanceState,
    ) -> Result<(), Error> {
        let mut instances = self.instances.write().unwrap();
        let instance = instances
            .get_mut(&instance_id)
            .ok_or_else(|| instance_not_found(&instance_id))?;
        instance.state = state;
        Ok(())
    }

    async fn update_instance_status(
        &self,
        instance_id: Uuid,
        state: InstanceState,
    ) -> Result<(), Error> {
        let stat = InstanceStat {
            instance_uuid: instance_id,
            state,
            ssh_ip: None,
            ssh_port: None,
            cpu_usage: 0,
            memory_usage_mb: 0,
            disk_usage_mb: 0,
            volumes: Vec::new(),
        };
        self.store
            .add_instance_stats(&[stat], "")
            .await
            .map_err(store_error)?;

        let mut stats = self.instance_last_stats.write().unwrap();
        let tenant_id = stats
            .get(&instance_id)
            .map(|s| s.tenant_id.clone())
            .unwrap_or_default();
        stats.insert(
            instance_id,
            ServerStats {
                id: instance_id,
                tenant_id,
                node_id: None,
                timestamp: now(),
                state,
                vcpu_usage: 0,
                mem_usage_mb: 0,
                disk_usage_mb: 0,
            },
        );

        Ok(())
    }

    /// Resets a restarting instance's state to pending.
    pub async fn instance_restarting(
        &self,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        self.update_instance_status(instance_id, InstanceState::Pending)
            .await?;
        self.transition_instance(instance_id, InstanceState::Pending)
    }

    /// Marks an instance exited and severs the link to its node.
    pub async fn instance_stopped(
        &self,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        self.update_instance_status(instance_id, InstanceState::Exited)
            .await?;

        let old_node_id = {
            let mut instances = self.instances.write().unwrap();
            let instance = instances
                .get_mut(&instance_id)
                .ok_or_else(|| instance_not_found(&instance_id))?;
            instance.state = InstanceState::Exited;
            instance.node_id.take()
        };

        if let Some(node_id) = old_node_id {
            let mut nodes = self.nodes.write().unwrap();
            if let Some(node) = nodes.get_mut(&node_id) {
                node.instances.remove(&instance_id);
            }
        }

        Ok(())
    }

    /// Maps an instance name to its id within a tenant, returning `None`
    /// when nothing matches.
    pub fn resolve_instance(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> LookupResult<Option<Uuid>> {
        let ids: Vec<Uuid> = {
            let tenants = self.tenants.read().unwrap();
            let state = tenants
                .get(tenant_id)
                .ok_or_else(|| super::tenant_not_found(tenant_id))?;
            state.instances.iter().copied().collect()
        };

        let instances = self.instances.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| instances.get(id))
            .find(|i| i.name == name || i.id.to_string() == name)
            .map(|i| i.id))
    }

    /*
     * Nodes
     */

    /// Adds a node to the node cache, updating the node's tracked role
    /// bitmask if the node is already present to be the superset of all
    /// reported roles.
    pub fn add_node(&self, node_id: &str, node_type: Resource) {
        let role = match node_type {
            Resource::ComputeNode => NodeRole::COMPUTE,
            Resource::NetworkNode => NodeRole::NETWORK,
            _ => NodeRole::NONE,
        };

        let mut nodes = self.nodes.write().unwrap();
        let node = nodes.entry(node_id.to_owned()).or_insert_with(|| {
            NodeState {
                node: Node { id: node_id.to_owned(), ..Default::default() },
                instances: HashSet::new(),
            }
        });
        node.node.role |= role;
    }

    /// Removes a node from the node cache.
    pub fn delete_node(&self, node_id: &str) {
        self.nodes.write().unwrap().remove(node_id);
        self.node_last_stats.write().unwrap().remove(node_id);
    }

    /// Retrieves a node from the node cache.
    pub fn get_node(&self, node_id: &str) -> LookupResult<Node> {
        self.nodes
            .read()
            .unwrap()
            .get(node_id)
            .map(|n| n.node.clone())
            .ok_or_else(|| {
                Error::not_found_by_name(ResourceType::Node, node_id)
            })
    }

    /*
     * Failure events
     */

    /// Cleans up after a failure to start an instance and logs a
    /// user-visible error.
    ///
    /// Only fatal failures remove the pending instance.  Start failures are
    /// also generated when restarting an exited instance, and a failure to
    /// restart must not delete it; `migration` guards that path.
    pub async fn start_failure(
        &self,
        instance_id: Uuid,
        reason: StartFailureReason,
        migration: bool,
    ) -> Result<(), Error> {
        let instance = self.get_instance(instance_id)?;

        if instance.cnci {
            warn!(self.log, "concentrator failed to start";
                "instance_id" => %instance_id);
        }

        if reason.is_fatal() && !migration {
            self.delete_instance_inner(instance_id).await?;
        }

        self.log_error(
            &instance.tenant_id,
            format!("Start Failure {}: {}", instance_id, reason),
        )
        .await
    }

    /// Logs a restart failure in the event log.
    pub async fn restart_failure(
        &self,
        instance_id: Uuid,
        reason: RestartFailureReason,
    ) -> Result<(), Error> {
        let instance = self.get_instance(instance_id)?;
        self.log_error(
            &instance.tenant_id,
            format!("Restart Failure {}: {}", instance_id, reason),
        )
        .await
    }

    /// Logs a stop failure in the event log.
    pub async fn stop_failure(
        &self,
        instance_id: Uuid,
        reason: StopFailureReason,
    ) -> Result<(), Error> {
        let instance = self.get_instance(instance_id)?;
        self.log_error(
            &instance.tenant_id,
            format!("Stop Failure {}: {}", instance_id, reason),
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;
    use corral_common::api::external::EventSeverity;
    use corral_common::api::external::TenantConfig;
    use corral_common::dev::test_setup_log;
    use std::sync::Arc;

    pub(crate) fn test_instance(tenant_id: &str, node: Option<&str>) -> Instance {
        Instance {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_owned(),
            workload_id: Uuid::new_v4(),
            name: format!("instance-{}", Uuid::new_v4()),
            node_id: node.map(str::to_owned),
            state: InstanceState::Pending,
            ip_address: None,
            subnet: None,
            mac_address: String::from("02:00:de:ad:be:ef"),
            cnci: false,
            ssh_ip: None,
            ssh_port: None,
            create_time: now(),
        }
    }

    async fn test_datastore() -> DataStore {
        let log = test_setup_log("datastore_instance");
        let ds =
            DataStore::init(log, Arc::new(MemStore::new())).await.unwrap();
        ds.add_tenant(
            "t1",
            TenantConfig { name: String::from("one"), subnet_bits: 24 },
        )
        .await
        .unwrap();
        ds
    }

    #[tokio::test]
    async fn test_add_and_delete_updates_indexes() {
        let ds = test_datastore().await;
        let instance = test_instance("t1", Some("node-1"));
        let id = instance.id;

        ds.add_instance(instance).await.unwrap();
        assert_eq!(ds.get_tenant_instances("t1").len(), 1);
        assert_eq!(ds.get_instances_by_node("node-1").len(), 1);
        assert!(ds.instance_last_stats.read().unwrap().contains_key(&id));

        ds.delete_instance(id).await.unwrap();
        assert!(ds.get_tenant_instances("t1").is_empty());
        assert!(ds.get_instances_by_node("node-1").is_empty());
        assert!(!ds.instance_last_stats.read().unwrap().contains_key(&id));
        assert!(ds.get_instance(id).is_err());
    }

    #[tokio::test]
    async fn test_delete_releases_tenant_ip() {
        let ds = test_datastore().await;
        let ip = ds.allocate_tenant_ip("t1").await.unwrap();

        let mut instance = test_instance("t1", None);
        instance.ip_address = Some(ip);
        let id = instance.id;
        ds.add_instance(instance).await.unwrap();
        ds.delete_instance(id).await.unwrap();

        /* The released address must be the next one handed out. */
        assert_eq!(ds.allocate_tenant_ip("t1").await.unwrap(), ip);
    }

    #[tokio::test]
    async fn test_instance_stopped_severs_node_link() {
        let ds = test_datastore().await;
        let mut instance = test_instance("t1", Some("node-1"));
        instance.state = InstanceState::Running;
        let id = instance.id;
        ds.add_instance(instance).await.unwrap();

        ds.instance_stopped(id).await.unwrap();
        let stopped = ds.get_instance(id).unwrap();
        assert_eq!(stopped.state, InstanceState::Exited);
        assert_eq!(stopped.node_id, None);
        assert!(ds.get_instances_by_node("node-1").is_empty());
    }

    #[tokio::test]
    async fn test_fatal_start_failure_removes_instance() {
        let ds = test_datastore().await;
        let instance = test_instance("t1", None);
        let id = instance.id;
        ds.add_instance(instance).await.unwrap();

        ds.start_failure(id, StartFailureReason::LaunchFailure, false)
            .await
            .unwrap();
        assert!(ds.get_instance(id).is_err());

        let events = ds.get_event_log().await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.severity == EventSeverity::Error
                && e.message.contains("Start Failure")));
    }

    #[tokio::test]
    async fn test_transient_start_failure_keeps_instance() {
        let ds = test_datastore().await;
        let instance = test_instance("t1", None);
        let id = instance.id;
        ds.add_instance(instance).await.unwrap();

        ds.start_failure(id, StartFailureReason::FullCloud, false)
            .await
            .unwrap();
        assert!(ds.get_instance(id).is_ok());
    }

    #[tokio::test]
    async fn test_node_roles_accumulate() {
        let ds = test_datastore().await;
        ds.add_node("node-1", Resource::ComputeNode);
        ds.add_node("node-1", Resource::NetworkNode);

        let node = ds.get_node("node-1").unwrap();
        assert!(node.role.contains(NodeRole::COMPUTE));
        assert!(node.role.contains(NodeRole::NETWORK));

        ds.delete_node("node-1");
        assert!(ds.get_node("node-1").is_err());
    }

    #[tokio::test]
    async fn test_resolve_instance() {
        let ds = test_datastore().await;
        let mut instance = test_instance("t1", None);
        instance.name = String::from("web-0");
        let id = instance.id;
        ds.add_instance(instance).await.unwrap();

        assert_eq!(ds.resolve_instance("t1", "web-0").unwrap(), Some(id));
        assert_eq!(
            ds.resolve_instance("t1", &id.to_string()).unwrap(),
            Some(id)
        );
        assert_eq!(ds.resolve_instance("t1", "nope").unwrap(), None);
    }
}

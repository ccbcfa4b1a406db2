// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods for statistics ingestion
//!
//! Each node publishes one frame at a time, so ingestion is serialized per
//! node; nothing is assumed about ordering across nodes.

use super::now;
use super::store_error;
use super::DataStore;
use super::NodeState;
use corral_common::api::external::Error;
use corral_common::api::external::ListResultVec;
use corral_common::api::external::Node;
use corral_common::api::external::NodeStats;
use corral_common::api::external::NodeSummary;
use corral_common::api::external::InstanceState;
use corral_common::api::external::ServerStats;
use corral_common::api::external::TenantUsage;
use corral_common::api::internal::agent::InstanceStat;
use corral_common::api::internal::agent::Stat;
use corral_common::api::internal::agent::Trace;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use std::collections::HashSet;

/// At most one usage entry is created per tenant in any five-minute window;
/// inside the window the last entry is updated in place.
fn tenant_usage_period() -> Duration {
    Duration::minutes(5)
}

fn clamped(value: i64) -> i64 {
    value.max(0)
}

impl DataStore {
    /// Stores the data from a statistics frame.  Node aggregates are
    /// carried only when `load` is not -1.
    pub async fn handle_stats(&self, stat: Stat) -> Result<(), Error> {
        if stat.load != -1 {
            self.add_node_stat(&stat).await?;
        }

        self.add_instance_stats(&stat.instances, &stat.node_uuid).await
    }

    async fn add_node_stat(&self, stat: &Stat) -> Result<(), Error> {
        {
            let mut nodes = self.nodes.write().unwrap();
            let node = nodes
                .entry(stat.node_uuid.clone())
                .or_insert_with(|| NodeState {
                    node: Node::default(),
                    instances: HashSet::new(),
                });
            node.node.id = stat.node_uuid.clone();
            node.node.hostname = stat.node_hostname.clone();
        }

        self.node_last_stats.write().unwrap().insert(
            stat.node_uuid.clone(),
            NodeStats {
                id: stat.node_uuid.clone(),
                hostname: stat.node_hostname.clone(),
                load: stat.load,
                mem_total_mb: stat.mem_total_mb,
                mem_available_mb: stat.mem_available_mb,
                disk_total_mb: stat.disk_total_mb,
                disk_available_mb: stat.disk_available_mb,
                cpus_online: stat.cpus_online,
                timestamp: now(),
            },
        );

        self.store.add_node_stat(stat.clone()).await.map_err(store_error)
    }

    /// Folds per-instance statistics into the caches: the last-stat entry,
    /// the tenant usage deltas, the live instance record and the node
    /// index, then reconciles the reported volume list.
    pub(crate) async fn add_instance_stats(
        &self,
        stats: &[InstanceStat],
        node_id: &str,
    ) -> Result<(), Error> {
        for stat in stats {
            let entry = ServerStats {
                id: stat.instance_uuid,
                tenant_id: String::new(),
                node_id: (!node_id.is_empty()).then(|| node_id.to_owned()),
                timestamp: now(),
                state: stat.state,
                vcpu_usage: clamped(stat.cpu_usage),
                mem_usage_mb: clamped(stat.memory_usage_mb),
                disk_usage_mb: clamped(stat.disk_usage_mb),
            };

            let (delta, tenant_id) = {
                let mut cache = self.instance_last_stats.write().unwrap();
                let last = cache.remove(&stat.instance_uuid);
                let (delta, tenant_id) = match last {
                    Some(last) => (
                        TenantUsage {
                            vcpu: entry.vcpu_usage - last.vcpu_usage,
                            memory: entry.mem_usage_mb - last.mem_usage_mb,
                            disk: entry.disk_usage_mb - last.disk_usage_mb,
                            timestamp: entry.timestamp,
                        },
                        last.tenant_id,
                    ),
                    None => (
                        TenantUsage {
                            vcpu: 0,
                            memory: 0,
                            disk: 0,
                            timestamp: entry.timestamp,
                        },
                        String::new(),
                    ),
                };
                let mut entry = entry;
                entry.tenant_id = tenant_id.clone();
                cache.insert(stat.instance_uuid, entry);
                (delta, tenant_id)
            };

            self.update_tenant_usage(&tenant_id, delta);

            let placed = {
                let mut instances = self.instances.write().unwrap();
                match instances.get_mut(&stat.instance_uuid) {
                    Some(instance) => {
                        instance.state = stat.state;
                        if !node_id.is_empty() {
                            instance.node_id = Some(node_id.to_owned());
                        }
                        instance.ssh_ip = stat.ssh_ip;
                        instance.ssh_port = stat.ssh_port;
                        true
                    }
                    None => false,
                }
            };

            if placed && !node_id.is_empty() {
                let mut nodes = self.nodes.write().unwrap();
                let node = nodes
                    .entry(node_id.to_owned())
                    .or_insert_with(|| NodeState {
                        node: Node {
                            id: node_id.to_owned(),
                            ..Default::default()
                        },
                        instances: HashSet::new(),
                    });
                node.instances.insert(stat.instance_uuid);
            }

            self.update_storage_attachments(stat.instance_uuid, &stat.volumes)
                .await;
        }

        self.store
            .add_instance_stats(stats, node_id)
            .await
            .map_err(store_error)
    }

    fn update_tenant_usage(&self, tenant_id: &str, delta: TenantUsage) {
        if delta.vcpu == 0 && delta.memory == 0 && delta.disk == 0 {
            return;
        }

        let mut usage = self.tenant_usage.write().unwrap();
        let history = usage.entry(tenant_id.to_owned()).or_default();

        match history.last().cloned() {
            Some(last) if now() - last.timestamp < tenant_usage_period() => {
                /* Still inside the window; fold into the last entry. */
                *history.last_mut().unwrap() = TenantUsage {
                    vcpu: last.vcpu + delta.vcpu,
                    memory: last.memory + delta.memory,
                    disk: last.disk + delta.disk,
                    timestamp: last.timestamp,
                };
            }
            Some(last) => history.push(TenantUsage {
                vcpu: last.vcpu + delta.vcpu,
                memory: last.memory + delta.memory,
                disk: last.disk + delta.disk,
                timestamp: now(),
            }),
            None => history.push(TenantUsage { timestamp: now(), ..delta }),
        }
    }

    /// Provides a tenant's actual resource usage between two points in
    /// time.
    pub fn get_tenant_usage(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ListResultVec<TenantUsage> {
        let usage = self.tenant_usage.read().unwrap();
        let Some(history) = usage.get(tenant_id) else {
            return Ok(Vec::new());
        };

        Ok(history
            .iter()
            .filter(|u| u.timestamp >= start && u.timestamp <= end)
            .cloned()
            .collect())
    }

    /// Retrieves the last statistics received for the instances placed on
    /// one node, concentrators excluded.
    pub fn get_instance_last_stats(&self, node_id: &str) -> Vec<ServerStats> {
        let entries: Vec<ServerStats> = {
            let stats = self.instance_last_stats.read().unwrap();
            stats
                .values()
                .filter(|s| s.node_id.as_deref() == Some(node_id))
                .cloned()
                .collect()
        };

        let instances = self.instances.read().unwrap();
        entries
            .into_iter()
            .filter(|s| instances.get(&s.id).is_some_and(|i| !i.cnci))
            .collect()
    }

    /// Retrieves the last statistics received for every node.
    pub fn get_node_last_stats(&self) -> Vec<NodeStats> {
        self.node_last_stats.read().unwrap().values().cloned().collect()
    }

    /// Summarizes the state and count of instances running per node,
    /// concentrators excluded.
    pub fn get_node_summary(&self) -> ListResultVec<NodeSummary> {
        let nodes: Vec<(String, Vec<uuid::Uuid>)> = {
            let cache = self.nodes.read().unwrap();
            cache
                .iter()
                .map(|(id, state)| {
                    (id.clone(), state.instances.iter().copied().collect())
                })
                .collect()
        };

        let instances = self.instances.read().unwrap();
        let mut summaries = Vec::new();
        for (node_id, ids) in nodes {
            let mut summary =
                NodeSummary { node_id, ..Default::default() };
            for instance in ids.iter().filter_map(|id| instances.get(id)) {
                if instance.cnci {
                    continue;
                }
                summary.total_instances += 1;
                match instance.state {
                    InstanceState::Pending => {
                        summary.total_pending_instances += 1
                    }
                    InstanceState::Running => {
                        summary.total_running_instances += 1
                    }
                    InstanceState::Exited => {
                        summary.total_paused_instances += 1
                    }
                    _ => (),
                }
            }
            summaries.push(summary);
        }

        Ok(summaries)
    }

    /// Stores the timing frames of a trace report.  Individual frame
    /// failures do not stop the rest of the report from landing; the first
    /// error is returned.
    pub async fn handle_trace_report(&self, trace: Trace) -> Result<(), Error> {
        let mut first_error = None;
        for frame in trace.frames {
            if let Err(error) = self.store.add_frame_stat(frame).await {
                first_error.get_or_insert(store_error(error));
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;
    use corral_common::api::external::Instance;
    use corral_common::api::external::TenantConfig;
    use corral_common::dev::test_setup_log;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn test_datastore() -> DataStore {
        let log = test_setup_log("datastore_stats");
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

    async fn add_test_instance(ds: &DataStore) -> Uuid {
        let instance = Instance {
            id: Uuid::new_v4(),
            tenant_id: String::from("t1"),
            workload_id: Uuid::new_v4(),
            name: String::from("web-0"),
            node_id: None,
            state: InstanceState::Pending,
            ip_address: None,
            subnet: None,
            mac_address: String::from("02:00:de:ad:be:ef"),
            cnci: false,
            ssh_ip: None,
            ssh_port: None,
            create_time: now(),
        };
        let id = instance.id;
        ds.add_instance(instance).await.unwrap();
        id
    }

    fn frame(node: &str, instances: Vec<InstanceStat>) -> Stat {
        Stat {
            node_uuid: node.to_owned(),
            node_hostname: format!("{}.example.com", node),
            load: 2,
            mem_total_mb: 16384,
            mem_available_mb: 8192,
            disk_total_mb: 204800,
            disk_available_mb: 102400,
            cpus_online: 8,
            instances,
        }
    }

    fn instance_stat(id: Uuid, cpu: i64) -> InstanceStat {
        InstanceStat {
            instance_uuid: id,
            state: InstanceState::Running,
            ssh_ip: Some("10.0.0.5".parse().unwrap()),
            ssh_port: Some(33002),
            cpu_usage: cpu,
            memory_usage_mb: 256,
            disk_usage_mb: 1024,
            volumes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_stats_reflect_into_live_instance() {
        let ds = test_datastore().await;
        let id = add_test_instance(&ds).await;

        ds.handle_stats(frame("node-1", vec![instance_stat(id, 50)]))
            .await
            .unwrap();

        let instance = ds.get_instance(id).unwrap();
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.node_id.as_deref(), Some("node-1"));
        assert_eq!(instance.ssh_port, Some(33002));
        assert_eq!(ds.get_instances_by_node("node-1").len(), 1);

        let last = ds.get_instance_last_stats("node-1");
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].vcpu_usage, 50);
        assert_eq!(last[0].tenant_id, "t1");
    }

    #[tokio::test]
    async fn test_node_aggregates_skipped_when_absent() {
        let ds = test_datastore().await;
        let mut stat = frame("node-1", Vec::new());
        stat.load = -1;
        ds.handle_stats(stat).await.unwrap();
        assert!(ds.get_node_last_stats().is_empty());

        ds.handle_stats(frame("node-1", Vec::new())).await.unwrap();
        let nodes = ds.get_node_last_stats();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].hostname, "node-1.example.com");
    }

    #[tokio::test]
    async fn test_usage_deltas_are_clamped_and_accumulated() {
        let ds = test_datastore().await;
        let id = add_test_instance(&ds).await;

        ds.handle_stats(frame("node-1", vec![instance_stat(id, 50)]))
            .await
            .unwrap();
        /* A negative gauge reads as zero usage. */
        ds.handle_stats(frame("node-1", vec![instance_stat(id, -1)]))
            .await
            .unwrap();

        let usage = ds
            .get_tenant_usage(
                "t1",
                now() - Duration::minutes(10),
                now() + Duration::minutes(10),
            )
            .unwrap();
        assert!(!usage.is_empty());
        assert_eq!(usage.last().unwrap().vcpu, 0);
        assert_eq!(usage.last().unwrap().memory, 256);
    }

    #[tokio::test]
    async fn test_node_summary_counts_states() {
        let ds = test_datastore().await;
        let id = add_test_instance(&ds).await;
        ds.handle_stats(frame("node-1", vec![instance_stat(id, 10)]))
            .await
            .unwrap();

        let summaries = ds.get_node_summary().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].total_instances, 1);
        assert_eq!(summaries[0].total_running_instances, 1);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory [`PersistentStore`] implementation
//!
//! Used by the test suite and by development servers that do not need
//! durability.  One mutex guards all tables; every trait call locks, copies
//! and releases, which trivially satisfies the atomicity contract.

use crate::store::IpClaim;
use crate::store::PersistentStore;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::store::StoredTenant;
use async_trait::async_trait;
use corral_common::api::external::BatchFrameStat;
use corral_common::api::external::BatchFrameSummary;
use corral_common::api::external::BlockData;
use corral_common::api::external::Image;
use corral_common::api::external::Instance;
use corral_common::api::external::LogEntry;
use corral_common::api::external::MappedIp;
use corral_common::api::external::Pool;
use corral_common::api::external::QuotaDetails;
use corral_common::api::external::StorageAttachment;
use corral_common::api::external::Tenant;
use corral_common::api::external::TenantConfig;
use corral_common::api::external::Workload;
use corral_common::api::internal::agent::FrameTrace;
use corral_common::api::internal::agent::InstanceStat;
use corral_common::api::internal::agent::Stat;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    tenants: BTreeMap<String, Tenant>,
    workloads: BTreeMap<Uuid, Workload>,
    instances: BTreeMap<Uuid, Instance>,
    block_devices: BTreeMap<Uuid, BlockData>,
    storage_attachments: BTreeMap<Uuid, StorageAttachment>,
    pools: BTreeMap<Uuid, Pool>,
    mapped_ips: BTreeMap<Uuid, MappedIp>,
    images: BTreeMap<Uuid, Image>,
    quotas: BTreeMap<String, Vec<QuotaDetails>>,
    events: Vec<LogEntry>,
    ip_claims: BTreeMap<String, BTreeSet<IpClaim>>,
    stats_node: Vec<Stat>,
    stats_instance: Vec<(String, InstanceStat)>,
    stats_frame: Vec<FrameTrace>,
}

/// An in-memory persistent store.
#[derive(Default)]
pub struct MemStore {
    tables: Mutex<Tables>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    fn stored_tenant(tables: &Tables, tenant: &Tenant) -> StoredTenant {
        StoredTenant {
            tenant: tenant.clone(),
            workloads: tables
                .workloads
                .values()
                .filter(|w| w.tenant_id == tenant.id)
                .cloned()
                .collect(),
            ip_claims: tables
                .ip_claims
                .get(&tenant.id)
                .map(|claims| claims.iter().copied().collect())
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl PersistentStore for MemStore {
    async fn init(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn log_event(&self, entry: LogEntry) -> StoreResult<()> {
        self.tables.lock().unwrap().events.push(entry);
        Ok(())
    }

    async fn clear_log(&self) -> StoreResult<()> {
        self.tables.lock().unwrap().events.clear();
        Ok(())
    }

    async fn get_event_log(&self) -> StoreResult<Vec<LogEntry>> {
        Ok(self.tables.lock().unwrap().events.clone())
    }

    async fn update_workload(&self, workload: Workload) -> StoreResult<()> {
        self.tables.lock().unwrap().workloads.insert(workload.id, workload);
        Ok(())
    }

    async fn delete_workload(&self, workload_id: Uuid) -> StoreResult<()> {
        self.tables.lock().unwrap().workloads.remove(&workload_id);
        Ok(())
    }

    async fn add_tenant(
        &self,
        id: &str,
        config: TenantConfig,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.tenants.insert(
            id.to_owned(),
            Tenant {
                id: id.to_owned(),
                name: config.name,
                subnet_bits: config.subnet_bits,
            },
        );
        Ok(())
    }

    async fn get_tenant(&self, id: &str) -> StoreResult<Option<StoredTenant>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .tenants
            .get(id)
            .map(|tenant| MemStore::stored_tenant(&tables, tenant)))
    }

    async fn get_tenants(&self) -> StoreResult<Vec<StoredTenant>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .tenants
            .values()
            .map(|tenant| MemStore::stored_tenant(&tables, tenant))
            .collect())
    }

    async fn update_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.tenants.contains_key(&tenant.id) {
            return Err(StoreError::NoSuchRow {
                table: "tenants",
                key: tenant.id.clone(),
            });
        }
        tables.tenants.insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn delete_tenant(&self, id: &str) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.tenants.remove(id);
        tables.ip_claims.remove(id);
        tables.quotas.remove(id);
        Ok(())
    }

    async fn claim_tenant_ip(
        &self,
        tenant_id: &str,
        claim: IpClaim,
    ) -> StoreResult<()> {
        self.tables
            .lock()
            .unwrap()
            .ip_claims
            .entry(tenant_id.to_owned())
            .or_default()
            .insert(claim);
        Ok(())
    }

    async fn release_tenant_ip(
        &self,
        tenant_id: &str,
        claim: IpClaim,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(claims) = tables.ip_claims.get_mut(tenant_id) {
            claims.remove(&claim);
            if claims.is_empty() {
                tables.ip_claims.remove(tenant_id);
            }
        }
        Ok(())
    }

    async fn get_instances(&self) -> StoreResult<Vec<Instance>> {
        Ok(self.tables.lock().unwrap().instances.values().cloned().collect())
    }

    async fn add_instance(&self, instance: &Instance) -> StoreResult<()> {
        self.tables
            .lock()
            .unwrap()
            .instances
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update_instance(&self, instance: &Instance) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.instances.contains_key(&instance.id) {
            return Err(StoreError::NoSuchRow {
                table: "instances",
                key: instance.id.to_string(),
            });
        }
        tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn delete_instance(&self, instance_id: Uuid) -> StoreResult<()> {
        self.tables.lock().unwrap().instances.remove(&instance_id);
        Ok(())
    }

    async fn add_node_stat(&self, stat: Stat) -> StoreResult<()> {
        self.tables.lock().unwrap().stats_node.push(stat);
        Ok(())
    }

    async fn add_instance_stats(
        &self,
        stats: &[InstanceStat],
        node_id: &str,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        for stat in stats {
            tables.stats_instance.push((node_id.to_owned(), stat.clone()));
        }
        Ok(())
    }

    async fn add_frame_stat(&self, frame: FrameTrace) -> StoreResult<()> {
        self.tables.lock().unwrap().stats_frame.push(frame);
        Ok(())
    }

    async fn get_batch_frame_summary(
        &self,
    ) -> StoreResult<Vec<BatchFrameSummary>> {
        let tables = self.tables.lock().unwrap();
        let mut by_label: BTreeMap<String, BTreeSet<Uuid>> = BTreeMap::new();
        for frame in &tables.stats_frame {
            by_label
                .entry(frame.label.clone())
                .or_default()
                .insert(frame.instance_uuid);
        }
        Ok(by_label
            .into_iter()
            .map(|(batch_id, instances)| BatchFrameSummary {
                batch_id,
                num_instances: instances.len(),
            })
            .collect())
    }

    async fn get_batch_frame_statistics(
        &self,
        label: &str,
    ) -> StoreResult<BatchFrameStat> {
        let tables = self.tables.lock().unwrap();
        let frames: Vec<&FrameTrace> = tables
            .stats_frame
            .iter()
            .filter(|f| f.label == label)
            .collect();
        if frames.is_empty() {
            return Ok(BatchFrameStat::default());
        }

        let count = frames.len() as f64;
        let total_elapsed_ms: f64 = frames
            .iter()
            .map(|f| {
                (f.end_timestamp - f.start_timestamp).num_milliseconds() as f64
            })
            .sum();
        let sum_controller: f64 =
            frames.iter().map(|f| f.controller_elapsed_ms).sum();
        let sum_launcher: f64 =
            frames.iter().map(|f| f.launcher_elapsed_ms).sum();
        let sum_scheduler: f64 =
            frames.iter().map(|f| f.scheduler_elapsed_ms).sum();

        let instances: BTreeSet<Uuid> =
            frames.iter().map(|f| f.instance_uuid).collect();

        Ok(BatchFrameStat {
            num_instances: instances.len(),
            total_elapsed_ms,
            average_elapsed_ms: total_elapsed_ms / count,
            average_controller_elapsed_ms: sum_controller / count,
            average_launcher_elapsed_ms: sum_launcher / count,
            average_scheduler_elapsed_ms: sum_scheduler / count,
        })
    }

    async fn get_block_devices(&self) -> StoreResult<Vec<BlockData>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .block_devices
            .values()
            .cloned()
            .collect())
    }

    async fn add_block_device(&self, data: &BlockData) -> StoreResult<()> {
        self.tables
            .lock()
            .unwrap()
            .block_devices
            .insert(data.id, data.clone());
        Ok(())
    }

    async fn update_block_device(&self, data: &BlockData) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.block_devices.contains_key(&data.id) {
            return Err(StoreError::NoSuchRow {
                table: "block_devices",
                key: data.id.to_string(),
            });
        }
        tables.block_devices.insert(data.id, data.clone());
        Ok(())
    }

    async fn delete_block_device(&self, id: Uuid) -> StoreResult<()> {
        self.tables.lock().unwrap().block_devices.remove(&id);
        Ok(())
    }

    async fn get_storage_attachments(
        &self,
    ) -> StoreResult<Vec<StorageAttachment>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .storage_attachments
            .values()
            .cloned()
            .collect())
    }

    async fn add_storage_attachment(
        &self,
        attachment: &StorageAttachment,
    ) -> StoreResult<()> {
        self.tables
            .lock()
            .unwrap()
            .storage_attachments
            .insert(attachment.id, attachment.clone());
        Ok(())
    }

    async fn delete_storage_attachment(&self, id: Uuid) -> StoreResult<()> {
        self.tables.lock().unwrap().storage_attachments.remove(&id);
        Ok(())
    }

    async fn add_pool(&self, pool: &Pool) -> StoreResult<()> {
        self.tables.lock().unwrap().pools.insert(pool.id, pool.clone());
        Ok(())
    }

    async fn update_pool(&self, pool: &Pool) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.pools.contains_key(&pool.id) {
            return Err(StoreError::NoSuchRow {
                table: "pools",
                key: pool.id.to_string(),
            });
        }
        tables.pools.insert(pool.id, pool.clone());
        Ok(())
    }

    async fn get_pools(&self) -> StoreResult<Vec<Pool>> {
        Ok(self.tables.lock().unwrap().pools.values().cloned().collect())
    }

    async fn delete_pool(&self, id: Uuid) -> StoreResult<()> {
        self.tables.lock().unwrap().pools.remove(&id);
        Ok(())
    }

    async fn add_mapped_ip(&self, mapping: &MappedIp) -> StoreResult<()> {
        self.tables
            .lock()
            .unwrap()
            .mapped_ips
            .insert(mapping.id, mapping.clone());
        Ok(())
    }

    async fn delete_mapped_ip(&self, id: Uuid) -> StoreResult<()> {
        self.tables.lock().unwrap().mapped_ips.remove(&id);
        Ok(())
    }

    async fn get_mapped_ips(&self) -> StoreResult<Vec<MappedIp>> {
        Ok(self.tables.lock().unwrap().mapped_ips.values().cloned().collect())
    }

    async fn add_image(&self, image: &Image) -> StoreResult<()> {
        self.tables.lock().unwrap().images.insert(image.id, image.clone());
        Ok(())
    }

    async fn update_image(&self, image: &Image) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.images.contains_key(&image.id) {
            return Err(StoreError::NoSuchRow {
                table: "images",
                key: image.id.to_string(),
            });
        }
        tables.images.insert(image.id, image.clone());
        Ok(())
    }

    async fn delete_image(&self, id: Uuid) -> StoreResult<()> {
        self.tables.lock().unwrap().images.remove(&id);
        Ok(())
    }

    async fn get_images(&self) -> StoreResult<Vec<Image>> {
        Ok(self.tables.lock().unwrap().images.values().cloned().collect())
    }

    async fn update_quotas(
        &self,
        tenant_id: &str,
        quotas: &[QuotaDetails],
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let existing = tables.quotas.entry(tenant_id.to_owned()).or_default();
        for quota in quotas {
            match existing.iter_mut().find(|q| q.name == quota.name) {
                Some(q) => *q = quota.clone(),
                None => existing.push(quota.clone()),
            }
        }
        Ok(())
    }

    async fn get_quotas(
        &self,
        tenant_id: &str,
    ) -> StoreResult<Vec<QuotaDetails>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .quotas
            .get(tenant_id)
            .cloned()
            .unwrap_or_default())
    }
}

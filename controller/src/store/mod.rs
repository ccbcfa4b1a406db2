// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persistent store contract consumed by the datastore
//!
//! The datastore caches all cluster state in memory and writes every
//! mutation through one of these per-domain calls.  Implementations must
//! make each call atomic: after `add`/`update`/`delete` returns success, a
//! subsequent `get`/`get_all` reflects the change.  No cross-call
//! transactions are required or assumed.
//!
//! The datastore is the only component that talks to the persistent store.

mod memory;

pub use memory::MemStore;

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
use uuid::Uuid;

/// Errors surfaced by a persistent store implementation.
///
/// The datastore maps these onto the transient kind of the external error
/// type; callers are expected to retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no such row in table {table}: {key}")]
    NoSuchRow { table: &'static str, key: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store corruption: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A tenant row together with the per-tenant state a store keeps alongside
/// it: the tenant's workloads and its outstanding IP claims.  The datastore
/// rebuilds the tenant's network maps from the claims at initialization.
#[derive(Clone, Debug)]
pub struct StoredTenant {
    pub tenant: Tenant,
    pub workloads: Vec<Workload>,
    pub ip_claims: Vec<IpClaim>,
}

/// One claimed host address inside a tenant subnet.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct IpClaim {
    pub subnet: u16,
    pub host: u8,
}

/// The key-value-per-table contract the controller persists through.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn init(&self) -> StoreResult<()>;
    async fn disconnect(&self);

    /* event log */
    async fn log_event(&self, entry: LogEntry) -> StoreResult<()>;
    async fn clear_log(&self) -> StoreResult<()>;
    async fn get_event_log(&self) -> StoreResult<Vec<LogEntry>>;

    /* workloads */
    async fn update_workload(&self, workload: Workload) -> StoreResult<()>;
    async fn delete_workload(&self, workload_id: Uuid) -> StoreResult<()>;

    /* tenants */
    async fn add_tenant(
        &self,
        id: &str,
        config: TenantConfig,
    ) -> StoreResult<()>;
    async fn get_tenant(&self, id: &str) -> StoreResult<Option<StoredTenant>>;
    async fn get_tenants(&self) -> StoreResult<Vec<StoredTenant>>;
    async fn update_tenant(&self, tenant: &Tenant) -> StoreResult<()>;
    async fn delete_tenant(&self, id: &str) -> StoreResult<()>;
    async fn claim_tenant_ip(
        &self,
        tenant_id: &str,
        claim: IpClaim,
    ) -> StoreResult<()>;
    async fn release_tenant_ip(
        &self,
        tenant_id: &str,
        claim: IpClaim,
    ) -> StoreResult<()>;

    /* instances */
    async fn get_instances(&self) -> StoreResult<Vec<Instance>>;
    async fn add_instance(&self, instance: &Instance) -> StoreResult<()>;
    async fn update_instance(&self, instance: &Instance) -> StoreResult<()>;
    async fn delete_instance(&self, instance_id: Uuid) -> StoreResult<()>;

    /* statistics */
    async fn add_node_stat(&self, stat: Stat) -> StoreResult<()>;
    async fn add_instance_stats(
        &self,
        stats: &[InstanceStat],
        node_id: &str,
    ) -> StoreResult<()>;
    async fn add_frame_stat(&self, frame: FrameTrace) -> StoreResult<()>;
    async fn get_batch_frame_summary(
        &self,
    ) -> StoreResult<Vec<BatchFrameSummary>>;
    async fn get_batch_frame_statistics(
        &self,
        label: &str,
    ) -> StoreResult<BatchFrameStat>;

    /* storage */
    async fn get_block_devices(&self) -> StoreResult<Vec<BlockData>>;
    async fn add_block_device(&self, data: &BlockData) -> StoreResult<()>;
    async fn update_block_device(&self, data: &BlockData) -> StoreResult<()>;
    async fn delete_block_device(&self, id: Uuid) -> StoreResult<()>;
    async fn get_storage_attachments(
        &self,
    ) -> StoreResult<Vec<StorageAttachment>>;
    async fn add_storage_attachment(
        &self,
        attachment: &StorageAttachment,
    ) -> StoreResult<()>;
    async fn delete_storage_attachment(&self, id: Uuid) -> StoreResult<()>;

    /* external IPs */
    async fn add_pool(&self, pool: &Pool) -> StoreResult<()>;
    async fn update_pool(&self, pool: &Pool) -> StoreResult<()>;
    async fn get_pools(&self) -> StoreResult<Vec<Pool>>;
    async fn delete_pool(&self, id: Uuid) -> StoreResult<()>;
    async fn add_mapped_ip(&self, mapping: &MappedIp) -> StoreResult<()>;
    async fn delete_mapped_ip(&self, id: Uuid) -> StoreResult<()>;
    async fn get_mapped_ips(&self) -> StoreResult<Vec<MappedIp>>;

    /* images */
    async fn add_image(&self, image: &Image) -> StoreResult<()>;
    async fn update_image(&self, image: &Image) -> StoreResult<()>;
    async fn delete_image(&self, id: Uuid) -> StoreResult<()>;
    async fn get_images(&self) -> StoreResult<Vec<Image>>;

    /* quotas */
    async fn update_quotas(
        &self,
        tenant_id: &str,
        quotas: &[QuotaDetails],
    ) -> StoreResult<()>;
    async fn get_quotas(&self, tenant_id: &str)
        -> StoreResult<Vec<QuotaDetails>>;
}

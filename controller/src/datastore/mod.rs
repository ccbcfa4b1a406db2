// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory authoritative state for the cluster
//!
//! The datastore caches most data in memory and writes every mutation
//! through the pluggable [`PersistentStore`].  Each domain (tenants,
//! instances, nodes, block devices, attachments, pools, statistics) has its
//! own reader/writer lock.  When more than one lock is held the acquisition
//! order is fixed: tenants, instances, nodes, block devices, attachments,
//! pools, then the statistics locks.  Guards are never held across an
//! `.await`; a persistent call therefore never blocks another domain.

mod image;
mod instance;
mod network;
mod pool;
mod stats;
mod storage;
mod tenant;

pub use network::subnet_for_key;
pub use network::subnet_key;

use crate::cnci::CnciManager;
use crate::store::PersistentStore;
use crate::store::StoreError;
use chrono::DateTime;
use chrono::Utc;
use corral_common::api::external::BatchFrameStat;
use corral_common::api::external::BatchFrameSummary;
use corral_common::api::external::BlockData;
use corral_common::api::external::Error;
use corral_common::api::external::EventSeverity;
use corral_common::api::external::FwType;
use corral_common::api::external::Image;
use corral_common::api::external::Instance;
use corral_common::api::external::ListResultVec;
use corral_common::api::external::LogEntry;
use corral_common::api::external::LookupResult;
use corral_common::api::external::MappedIp;
use corral_common::api::external::NodeStats;
use corral_common::api::external::Pool;
use corral_common::api::external::QuotaDetails;
use corral_common::api::external::RequestedResource;
use corral_common::api::external::Resource;
use corral_common::api::external::ResourceType;
use corral_common::api::external::ServerStats;
use corral_common::api::external::StorageAttachment;
use corral_common::api::external::StorageResource;
use corral_common::api::external::StorageSource;
use corral_common::api::external::Tenant;
use corral_common::api::external::TenantCnci;
use corral_common::api::external::TenantUsage;
use corral_common::api::external::VmType;
use corral_common::api::external::Workload;
use ipnetwork::Ipv4Network;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::RwLock;
use uuid::Uuid;

/// Image holding the concentrator root filesystem.  Fixed by the deployment
/// tooling; referenced by the synthesized concentrator workload.
pub const CNCI_IMAGE_ID: Uuid =
    Uuid::from_u128(0x4e16e743_265a_4bf2_9fd1_57ada0b28904);

/// Per-tenant state kept alongside the externally visible [`Tenant`].
pub(crate) struct TenantState {
    pub tenant: Tenant,
    /// Claimed host bytes per subnet key.  Octets 2-3 of the subnet's
    /// network address form the 16-bit key.
    pub network: BTreeMap<u16, BTreeSet<u8>>,
    /// Subnet keys allocated to this tenant, unsorted.
    pub subnets: Vec<u16>,
    /// Derived index; the global instances map is the owner.
    pub instances: HashSet<Uuid>,
    /// Derived index; the global block-device map is the owner.
    pub devices: HashSet<Uuid>,
    pub workloads: Vec<Workload>,
    pub cnci_mgr: Option<Arc<CnciManager>>,
}

pub(crate) struct NodeState {
    pub node: corral_common::api::external::Node,
    /// Derived index; the global instances map is the owner.
    pub instances: HashSet<Uuid>,
}

/// Attachments and the uniqueness index over `(instance, volume)` share one
/// lock; the index must never disagree with the attachment map.
#[derive(Default)]
pub(crate) struct AttachmentTables {
    pub attachments: HashMap<Uuid, StorageAttachment>,
    pub instance_volumes: HashMap<(Uuid, Uuid), Uuid>,
}

/// Pools, the cluster-wide subnet/address admission sets and the active
/// mappings share one lock.
#[derive(Default)]
pub(crate) struct PoolTables {
    pub pools: HashMap<Uuid, Pool>,
    pub external_subnets: HashSet<Ipv4Network>,
    pub external_ips: HashSet<Ipv4Addr>,
    pub mapped_ips: HashMap<Ipv4Addr, MappedIp>,
}

/// The single in-process source of truth for cluster state.
pub struct DataStore {
    pub(crate) log: Logger,
    pub(crate) store: Arc<dyn PersistentStore>,

    pub(crate) tenants: RwLock<HashMap<String, TenantState>>,
    pub(crate) instances: RwLock<HashMap<Uuid, Instance>>,
    pub(crate) nodes: RwLock<HashMap<String, NodeState>>,
    pub(crate) block_devices: RwLock<HashMap<Uuid, BlockData>>,
    pub(crate) attachments: RwLock<AttachmentTables>,
    pub(crate) pools: RwLock<PoolTables>,
    pub(crate) images: RwLock<HashMap<Uuid, Image>>,

    pub(crate) instance_last_stats: RwLock<HashMap<Uuid, ServerStats>>,
    pub(crate) node_last_stats: RwLock<HashMap<String, NodeStats>>,
    pub(crate) tenant_usage: RwLock<HashMap<String, Vec<TenantUsage>>>,

    cnci_workload: RwLock<Option<Workload>>,
}

pub(crate) fn store_error(error: StoreError) -> Error {
    Error::unavail(&format!("persistent store: {}", error))
}

impl DataStore {
    /// Initializes the datastore, filling every cache from the persistent
    /// store.
    pub async fn init(
        log: Logger,
        store: Arc<dyn PersistentStore>,
    ) -> Result<DataStore, Error> {
        store.init().await.map_err(store_error)?;

        let ds = DataStore {
            log: log.new(o!("component" => "DataStore")),
            store,
            tenants: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            block_devices: RwLock::new(HashMap::new()),
            attachments: RwLock::new(AttachmentTables::default()),
            pools: RwLock::new(PoolTables::default()),
            images: RwLock::new(HashMap::new()),
            instance_last_stats: RwLock::new(HashMap::new()),
            node_last_stats: RwLock::new(HashMap::new()),
            tenant_usage: RwLock::new(HashMap::new()),
            cnci_workload: RwLock::new(None),
        };

        /* Instances are cached before tenants so the tenant-side indexes
         * can be rebuilt in one pass below. */
        let instances =
            ds.store.get_instances().await.map_err(store_error)?;
        {
            let mut cache = ds.instances.write().unwrap();
            for instance in instances {
                cache.insert(instance.id, instance);
            }
        }

        let tenants = ds.store.get_tenants().await.map_err(store_error)?;
        {
            let mut cache = ds.tenants.write().unwrap();
            for stored in tenants {
                let mut network: BTreeMap<u16, BTreeSet<u8>> = BTreeMap::new();
                for claim in &stored.ip_claims {
                    network.entry(claim.subnet).or_default().insert(claim.host);
                }
                let subnets: Vec<u16> = network.keys().copied().collect();
                cache.insert(
                    stored.tenant.id.clone(),
                    TenantState {
                        tenant: stored.tenant,
                        network,
                        subnets,
                        instances: HashSet::new(),
                        devices: HashSet::new(),
                        workloads: stored.workloads,
                        cnci_mgr: None,
                    },
                );
            }
        }

        ds.rebuild_indexes();

        let devices =
            ds.store.get_block_devices().await.map_err(store_error)?;
        {
            let mut tenants = ds.tenants.write().unwrap();
            let mut cache = ds.block_devices.write().unwrap();
            for device in devices {
                if let Some(tenant) = tenants.get_mut(&device.tenant_id) {
                    tenant.devices.insert(device.id);
                }
                cache.insert(device.id, device);
            }
        }

        let attachments =
            ds.store.get_storage_attachments().await.map_err(store_error)?;
        {
            let mut tables = ds.attachments.write().unwrap();
            for attachment in attachments {
                tables.instance_volumes.insert(
                    (attachment.instance_id, attachment.block_id),
                    attachment.id,
                );
                tables.attachments.insert(attachment.id, attachment);
            }
        }

        let pools = ds.store.get_pools().await.map_err(store_error)?;
        let mappings =
            ds.store.get_mapped_ips().await.map_err(store_error)?;
        {
            let mut tables = ds.pools.write().unwrap();
            for pool in pools {
                for subnet in &pool.subnets {
                    tables.external_subnets.insert(subnet.cidr);
                }
                for ip in &pool.ips {
                    tables.external_ips.insert(ip.address);
                }
                tables.pools.insert(pool.id, pool);
            }
            for mapping in mappings {
                tables.mapped_ips.insert(mapping.external_ip, mapping);
            }
        }

        let images = ds.store.get_images().await.map_err(store_error)?;
        {
            let mut cache = ds.images.write().unwrap();
            for image in images {
                cache.insert(image.id, image);
            }
        }

        Ok(ds)
    }

    /// Rebuilds the tenant and node instance indexes from the global
    /// instance map.
    fn rebuild_indexes(&self) {
        let instances: Vec<Instance> =
            self.instances.read().unwrap().values().cloned().collect();
        let mut tenants = self.tenants.write().unwrap();
        let mut nodes = self.nodes.write().unwrap();

        for instance in &instances {
            if let Some(tenant) = tenants.get_mut(&instance.tenant_id) {
                tenant.instances.insert(instance.id);
            }
            if let Some(node_id) = &instance.node_id {
                let node =
                    nodes.entry(node_id.clone()).or_insert_with(|| NodeState {
                        node: corral_common::api::external::Node {
                            id: node_id.clone(),
                            ..Default::default()
                        },
                        instances: HashSet::new(),
                    });
                node.instances.insert(instance.id);
            }
        }
    }

    /// Disconnects the backing store.
    pub async fn exit(&self) {
        self.store.disconnect().await;
    }

    /*
     * Event log
     */

    /// Adds a message to the persistent event log.
    pub async fn log_event(
        &self,
        tenant_id: &str,
        message: String,
    ) -> Result<(), Error> {
        self.log_event_at(tenant_id, EventSeverity::Info, message).await
    }

    /// Adds a message to the persistent event log as an error.
    pub async fn log_error(
        &self,
        tenant_id: &str,
        message: String,
    ) -> Result<(), Error> {
        self.log_event_at(tenant_id, EventSeverity::Error, message).await
    }

    async fn log_event_at(
        &self,
        tenant_id: &str,
        severity: EventSeverity,
        message: String,
    ) -> Result<(), Error> {
        self.store
            .log_event(LogEntry {
                timestamp: Utc::now(),
                tenant_id: tenant_id.to_owned(),
                severity,
                message,
            })
            .await
            .map_err(store_error)
    }

    /// Retrieves all the log entries stored in the datastore.  Events are
    /// not cached; reads go straight through.
    pub async fn get_event_log(&self) -> ListResultVec<LogEntry> {
        self.store.get_event_log().await.map_err(store_error)
    }

    /// Removes all entries from the event log.
    pub async fn clear_log(&self) -> Result<(), Error> {
        self.store.clear_log().await.map_err(store_error)
    }

    /*
     * Quotas: persisted pass-throughs, no caching.
     */

    pub async fn get_quotas(
        &self,
        tenant_id: &str,
    ) -> ListResultVec<QuotaDetails> {
        self.store.get_quotas(tenant_id).await.map_err(store_error)
    }

    pub async fn update_quotas(
        &self,
        tenant_id: &str,
        quotas: &[QuotaDetails],
    ) -> Result<(), Error> {
        self.store
            .update_quotas(tenant_id, quotas)
            .await
            .map_err(store_error)
    }

    /*
     * Concentrator workload
     */

    /// Creates the workload definition used to launch concentrators.  Must
    /// be called before any workload launch.
    pub fn generate_cnci_workload(
        &self,
        vcpus: i64,
        mem_mb: i64,
        ssh_key: &str,
        password_hash: &str,
    ) {
        let config = format!(
            "---\n\
             #cloud-config\n\
             users:\n\
             \x20 - name: cloud-admin\n\
             \x20   gecos: Corral Cloud Admin\n\
             \x20   lock-passwd: false\n\
             \x20   passwd: {}\n\
             \x20   sudo: ALL=(ALL) NOPASSWD:ALL\n\
             \x20   ssh-authorized-keys:\n\
             \x20   - {}\n\
             ...\n",
            password_hash, ssh_key
        );

        let workload = Workload {
            id: Uuid::new_v4(),
            tenant_id: String::from(
                corral_common::api::external::INTERNAL_TENANT_ID,
            ),
            description: String::from("CNCI"),
            vm_type: VmType::Qemu,
            fw_type: FwType::Efi,
            image_name: None,
            defaults: vec![
                RequestedResource::new(Resource::VCpus, vcpus, false),
                RequestedResource::new(Resource::MemMb, mem_mb, false),
                RequestedResource::new(Resource::NetworkNode, 1, true),
            ],
            storage: vec![StorageResource {
                id: None,
                bootable: true,
                ephemeral: true,
                size_gb: 0,
                source_type: StorageSource::ImageService,
                source_id: Some(CNCI_IMAGE_ID),
                internal: true,
            }],
            config,
        };

        *self.cnci_workload.write().unwrap() = Some(workload);
    }

    /// Returns the id of the concentrator workload template.
    pub fn cnci_workload_id(&self) -> LookupResult<Uuid> {
        self.cnci_workload
            .read()
            .unwrap()
            .as_ref()
            .map(|w| w.id)
            .ok_or_else(|| {
                Error::internal_error("no CNCI workload in datastore")
            })
    }

    pub(crate) fn cnci_workload(&self) -> Option<Workload> {
        self.cnci_workload.read().unwrap().clone()
    }

    /// Retrieves summaries for the given concentrator instance, or for all
    /// of them when `cnci_id` is `None`.
    pub fn get_tenant_cnci_summary(
        &self,
        cnci_id: Option<Uuid>,
    ) -> ListResultVec<TenantCnci> {
        let mut summaries = Vec::new();

        for instance in self.get_all_cnci_instances() {
            if let Some(want) = cnci_id {
                if want != instance.id {
                    continue;
                }
            }

            summaries.push(TenantCnci {
                tenant_id: instance.tenant_id.clone(),
                instance_id: instance.id,
                ip_address: instance.ip_address,
                mac_address: instance.mac_address.clone(),
                subnets: instance.subnet.into_iter().collect(),
            });

            if cnci_id.is_some() {
                break;
            }
        }

        Ok(summaries)
    }

    /*
     * Trace frames: persisted pass-throughs, no caching.
     */

    pub async fn get_batch_frame_summary(
        &self,
    ) -> ListResultVec<BatchFrameSummary> {
        self.store.get_batch_frame_summary().await.map_err(store_error)
    }

    pub async fn get_batch_frame_statistics(
        &self,
        label: &str,
    ) -> LookupResult<BatchFrameStat> {
        self.store
            .get_batch_frame_statistics(label)
            .await
            .map_err(store_error)
    }
}

pub(crate) fn tenant_not_found(tenant_id: &str) -> Error {
    Error::not_found_by_name(ResourceType::Tenant, tenant_id)
}

/// Timestamp helper used by the statistics caches.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and related facilities for representing resources in the
//! API
//!
//! This includes all representations over the wire for the external API.
//! The contents here are all HTTP-agnostic.

mod error;
pub use error::*;

use chrono::DateTime;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::str::FromStr;
use uuid::Uuid;

/*
 * The type aliases below exist primarily to ensure consistency among return
 * types for functions in the `app::Controller` and `datastore::DataStore`.
 */

/// Result of a create operation for the specified type
pub type CreateResult<T> = Result<T, Error>;
/// Result of a delete operation for the specified type
pub type DeleteResult = Result<(), Error>;
/// Result of a list operation that returns a vector
pub type ListResultVec<T> = Result<Vec<T>, Error>;
/// Result of a lookup operation for the specified type
pub type LookupResult<T> = Result<T, Error>;
/// Result of an update operation for the specified type
pub type UpdateResult<T> = Result<T, Error>;

/// Identifies a type of API resource
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum ResourceType {
    Tenant,
    Workload,
    Instance,
    Node,
    BlockDevice,
    StorageAttachment,
    Pool,
    ExternalIp,
    MappedIp,
    Image,
    Subnet,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ResourceType::Tenant => "tenant",
                ResourceType::Workload => "workload",
                ResourceType::Instance => "instance",
                ResourceType::Node => "node",
                ResourceType::BlockDevice => "block device",
                ResourceType::StorageAttachment => "storage attachment",
                ResourceType::Pool => "pool",
                ResourceType::ExternalIp => "external IP",
                ResourceType::MappedIp => "mapped IP",
                ResourceType::Image => "image",
                ResourceType::Subnet => "subnet",
            }
        )
    }
}

/// The tenant id under which globally visible workloads are stored.
pub const PUBLIC_TENANT_ID: &str = "public";
/// The tenant id under which admin-only workloads are stored.
pub const INTERNAL_TENANT_ID: &str = "internal";
/// The scope identifier with which an administrator may act on any tenant.
pub const ADMIN_TENANT_ID: &str = "admin";

/// Runtime state of an instance, as reported by the agent owning it.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Exited,
    ExitFailed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                InstanceState::Pending => "pending",
                InstanceState::Running => "running",
                InstanceState::Stopping => "stopping",
                InstanceState::Exited => "exited",
                InstanceState::ExitFailed => "exit_failed",
            }
        )
    }
}

impl FromStr for InstanceState {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(InstanceState::Pending),
            "running" => Ok(InstanceState::Running),
            "stopping" => Ok(InstanceState::Stopping),
            "exited" => Ok(InstanceState::Exited),
            "exit_failed" => Ok(InstanceState::ExitFailed),
            _ => Err(Error::invalid_value("state", "unknown instance state")),
        }
    }
}

/// Per-tenant configuration.
///
/// `deny_unknown_fields` matters here: tenant configuration is updated with
/// a JSON merge patch, and a patch whose shape doesn't match this struct
/// must be rejected rather than silently dropped.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    pub name: String,
    /// CIDR prefix length used for this tenant's private networks.
    pub subnet_bits: u8,
}

/// An isolation boundary for workloads, networking and quotas.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub subnet_bits: u8,
}

/// The hypervisor type used to realize a workload.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    Qemu,
    Docker,
}

/// Firmware type for VM workloads.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FwType {
    Efi,
    Legacy,
}

/// A resource requested by (or consumed on behalf of) a workload.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    VCpus,
    MemMb,
    DiskMb,
    NetworkNode,
    ComputeNode,
    Instance,
    Volume,
    Image,
    ExternalIp,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RequestedResource {
    #[serde(rename = "type")]
    pub resource: Resource,
    pub value: i64,
    pub mandatory: bool,
}

impl RequestedResource {
    pub fn new(resource: Resource, value: i64, mandatory: bool) -> Self {
        RequestedResource { resource, value, mandatory }
    }
}

/// Where the data backing a storage resource comes from.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageSource {
    ImageService,
    VolumeService,
    Empty,
}

/// A block storage resource attached to a workload template.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StorageResource {
    /// Existing block device to use, if any.
    pub id: Option<Uuid>,
    pub bootable: bool,
    pub ephemeral: bool,
    pub size_gb: u64,
    pub source_type: StorageSource,
    pub source_id: Option<Uuid>,
    /// Internal resources are never exposed to tenants.
    pub internal: bool,
}

/// A template from which instances are launched.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Workload {
    pub id: Uuid,
    pub tenant_id: String,
    pub description: String,
    pub vm_type: VmType,
    pub fw_type: FwType,
    pub image_name: Option<String>,
    pub defaults: Vec<RequestedResource>,
    pub storage: Vec<StorageResource>,
    /// cloud-init user data handed to the launched instance.
    pub config: String,
}

impl Workload {
    /// The value of a defaulted resource, if the template carries one.
    pub fn default_for(&self, resource: Resource) -> Option<i64> {
        self.defaults
            .iter()
            .find(|r| r.resource == resource)
            .map(|r| r.value)
    }
}

/// A request to launch instances of a workload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkloadRequest {
    pub workload_id: Uuid,
    pub tenant_id: String,
    pub instances: usize,
    /// Subnet to place the instances on; only set for concentrator launches.
    pub subnet: Option<Ipv4Network>,
    pub name: Option<String>,
    pub trace_label: Option<String>,
}

/// One running materialization of a workload, placed on a node.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Instance {
    pub id: Uuid,
    pub tenant_id: String,
    pub workload_id: Uuid,
    pub name: String,
    /// Unset until the scheduler places the instance.
    pub node_id: Option<String>,
    pub state: InstanceState,
    pub ip_address: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Network>,
    pub mac_address: String,
    /// Concentrator instances are indexed by the CNCI manager and are not
    /// billed against tenant quota.
    pub cnci: bool,
    pub ssh_ip: Option<IpAddr>,
    pub ssh_port: Option<u16>,
    pub create_time: DateTime<Utc>,
}

/// Roles a node may advertise.  The mask accumulates as different role
/// advertisements arrive.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(transparent)]
pub struct NodeRole(u8);

impl NodeRole {
    pub const NONE: NodeRole = NodeRole(0);
    pub const COMPUTE: NodeRole = NodeRole(1 << 0);
    pub const NETWORK: NodeRole = NodeRole(1 << 1);

    pub fn contains(&self, role: NodeRole) -> bool {
        self.0 & role.0 == role.0
    }
}

impl std::ops::BitOr for NodeRole {
    type Output = NodeRole;
    fn bitor(self, rhs: NodeRole) -> NodeRole {
        NodeRole(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for NodeRole {
    fn bitor_assign(&mut self, rhs: NodeRole) {
        self.0 |= rhs.0;
    }
}

/// A host advertising one or more roles.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub role: NodeRole,
}

/// Lifecycle state of a block device.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Available,
    Attaching,
    InUse,
    Detaching,
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                BlockState::Available => "available",
                BlockState::Attaching => "attaching",
                BlockState::InUse => "in-use",
                BlockState::Detaching => "detaching",
            }
        )
    }
}

/// A block device owned by a tenant.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BlockData {
    pub id: Uuid,
    pub tenant_id: String,
    pub state: BlockState,
    pub name: String,
    pub description: String,
    pub size_gb: u64,
    pub bootable: bool,
    pub create_time: DateTime<Utc>,
}

/// An instance-to-block-device association.  Attachments also drive the
/// device's `Available`/`InUse` state.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StorageAttachment {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub block_id: Uuid,
    pub ephemeral: bool,
    pub boot: bool,
}

/// A subnet belonging to an external IP pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExternalSubnet {
    pub id: Uuid,
    pub cidr: Ipv4Network,
}

/// An individual address belonging to an external IP pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExternalIp {
    pub id: Uuid,
    pub address: Ipv4Addr,
}

/// Number of host addresses a pool subnet contributes.  The network and
/// broadcast addresses are deducted.
pub fn subnet_usable_hosts(cidr: &Ipv4Network) -> i64 {
    (1i64 << (32 - u32::from(cidr.prefix()))) - 2
}

/// An administrator-owned collection of externally routable subnets and
/// addresses.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Pool {
    pub id: Uuid,
    pub name: String,
    pub subnets: Vec<ExternalSubnet>,
    pub ips: Vec<ExternalIp>,
    pub total_ips: u32,
    pub free: u32,
}

impl Pool {
    /// Assembles a new pool from raw subnets and addresses, computing the
    /// capacity counters.  Admission (overlap and duplicate checks) is the
    /// datastore's business.
    pub fn new(
        name: String,
        subnets: Vec<Ipv4Network>,
        ips: Vec<Ipv4Addr>,
    ) -> Pool {
        let subnets: Vec<ExternalSubnet> = subnets
            .into_iter()
            .map(|cidr| ExternalSubnet { id: Uuid::new_v4(), cidr })
            .collect();
        let ips: Vec<ExternalIp> = ips
            .into_iter()
            .map(|address| ExternalIp { id: Uuid::new_v4(), address })
            .collect();

        let total: i64 = subnets
            .iter()
            .map(|s| subnet_usable_hosts(&s.cidr).max(0))
            .sum::<i64>()
            + ips.len() as i64;
        let total = u32::try_from(total).unwrap_or(u32::MAX);

        Pool {
            id: Uuid::new_v4(),
            name,
            subnets,
            ips,
            total_ips: total,
            free: total,
        }
    }
}

/// An allocation binding one external address to one instance's private IP.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MappedIp {
    pub id: Uuid,
    pub external_ip: Ipv4Addr,
    pub internal_ip: Ipv4Addr,
    pub instance_id: Uuid,
    pub tenant_id: String,
    pub pool_id: Uuid,
    pub pool_name: String,
}

/// Lifecycle state of an image.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    Created,
    Saving,
    Active,
    Killed,
}

/// Who may see and use an image.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
    Internal,
}

/// Image metadata.  The image blob itself lives with the external block
/// storage driver.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Image {
    pub id: Uuid,
    pub tenant_id: String,
    pub state: ImageState,
    pub name: String,
    pub size: u64,
    pub visibility: Visibility,
    pub create_time: DateTime<Utc>,
}

/// Severity of a user-visible event-log record.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Error,
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSeverity::Info => write!(f, "info"),
            EventSeverity::Error => write!(f, "error"),
        }
    }
}

/// One record in the persistent event log.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub severity: EventSeverity,
    pub message: String,
}

/// One named quota limit with its current usage.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct QuotaDetails {
    pub name: String,
    pub value: i64,
    pub usage: i64,
}

/// Summary of a tenant's concentrator instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TenantCnci {
    pub tenant_id: String,
    pub instance_id: Uuid,
    pub ip_address: Option<Ipv4Addr>,
    pub mac_address: String,
    pub subnets: Vec<Ipv4Network>,
}

/// State and count of instances running on one node.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub total_instances: usize,
    pub total_running_instances: usize,
    pub total_pending_instances: usize,
    pub total_paused_instances: usize,
}

/// A point-in-time record of a tenant's aggregate resource usage.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TenantUsage {
    pub vcpu: i64,
    pub memory: i64,
    pub disk: i64,
    pub timestamp: DateTime<Utc>,
}

/// The last statistics received for one instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ServerStats {
    pub id: Uuid,
    pub tenant_id: String,
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub state: InstanceState,
    pub vcpu_usage: i64,
    pub mem_usage_mb: i64,
    pub disk_usage_mb: i64,
}

/// The last statistics received for one node.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NodeStats {
    pub id: String,
    pub hostname: String,
    pub load: i64,
    pub mem_total_mb: i64,
    pub mem_available_mb: i64,
    pub disk_total_mb: i64,
    pub disk_available_mb: i64,
    pub cpus_online: i64,
    pub timestamp: DateTime<Utc>,
}

/// Count of trace frames recorded under one label.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BatchFrameSummary {
    pub batch_id: String,
    pub num_instances: usize,
}

/// Aggregated trace timings for a batch of launches under one label.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BatchFrameStat {
    pub num_instances: usize,
    pub total_elapsed_ms: f64,
    pub average_elapsed_ms: f64,
    pub average_controller_elapsed_ms: f64,
    pub average_launcher_elapsed_ms: f64,
    pub average_scheduler_elapsed_ms: f64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_instance_state_round_trip() {
        for state in [
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::Stopping,
            InstanceState::Exited,
            InstanceState::ExitFailed,
        ] {
            assert_eq!(state.to_string().parse::<InstanceState>(), Ok(state));
        }
        assert!("paused".parse::<InstanceState>().is_err());
    }

    #[test]
    fn test_node_role_accumulates() {
        let mut role = NodeRole::COMPUTE;
        assert!(role.contains(NodeRole::COMPUTE));
        assert!(!role.contains(NodeRole::NETWORK));
        role |= NodeRole::NETWORK;
        assert!(role.contains(NodeRole::COMPUTE));
        assert!(role.contains(NodeRole::NETWORK));
    }

    #[test]
    fn test_pool_capacity() {
        let subnet: Ipv4Network = "10.0.0.0/30".parse().unwrap();
        assert_eq!(subnet_usable_hosts(&subnet), 2);

        let pool = Pool::new(
            String::from("external"),
            vec![subnet],
            vec!["192.168.0.7".parse().unwrap()],
        );
        assert_eq!(pool.total_ips, 3);
        assert_eq!(pool.free, 3);
    }

    #[test]
    fn test_tenant_config_rejects_unknown_fields() {
        let patched: Result<TenantConfig, _> = serde_json::from_value(
            serde_json::json!({ "name": "t", "subnet_bits": 24, "extra": 1 }),
        );
        assert!(patched.is_err());
    }
}

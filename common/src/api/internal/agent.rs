// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire payloads exchanged with the compute and network agents
//!
//! The agent transport itself is an external collaborator; the controller
//! only consumes the decoded payloads defined here.  Statistics frames are
//! published per node; the controller assumes per-node ordering and nothing
//! across nodes.

use crate::api::external::InstanceState;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Statistics for one instance, carried inside a node's [`Stat`] frame.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct InstanceStat {
    pub instance_uuid: Uuid,
    pub state: InstanceState,
    pub ssh_ip: Option<IpAddr>,
    pub ssh_port: Option<u16>,
    /// Usage gauges may be reported as -1 when the agent cannot sample them.
    pub cpu_usage: i64,
    pub memory_usage_mb: i64,
    pub disk_usage_mb: i64,
    /// Volumes the agent currently sees attached to this instance.
    pub volumes: Vec<Uuid>,
}

/// A statistics frame published by a node agent.  Carries node aggregates
/// plus an entry per instance placed on the node.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Stat {
    pub node_uuid: String,
    pub node_hostname: String,
    /// -1 indicates the node aggregates are absent from this frame.
    pub load: i64,
    pub mem_total_mb: i64,
    pub mem_available_mb: i64,
    pub disk_total_mb: i64,
    pub disk_available_mb: i64,
    pub cpus_online: i64,
    pub instances: Vec<InstanceStat>,
}

/// One timing frame from a traced launch.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FrameTrace {
    pub label: String,
    pub instance_uuid: Uuid,
    pub controller_elapsed_ms: f64,
    pub launcher_elapsed_ms: f64,
    pub scheduler_elapsed_ms: f64,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
}

/// A trace report carrying a batch of timing frames.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Trace {
    pub frames: Vec<FrameTrace>,
}

/// Why an instance failed to start.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFailureReason {
    FullCloud,
    FullComputeNode,
    NoComputeNodes,
    NoNetworkNodes,
    InvalidPayload,
    InvalidData,
    AlreadyRunning,
    InstanceExists,
    ImageFailure,
    LaunchFailure,
    NetworkFailure,
}

impl StartFailureReason {
    /// Fatal failures remove the pending instance; transient ones leave it
    /// for a retry.
    pub fn is_fatal(&self) -> bool {
        match self {
            StartFailureReason::FullCloud
            | StartFailureReason::FullComputeNode
            | StartFailureReason::NoComputeNodes
            | StartFailureReason::NoNetworkNodes => false,

            StartFailureReason::InvalidPayload
            | StartFailureReason::InvalidData
            | StartFailureReason::AlreadyRunning
            | StartFailureReason::InstanceExists
            | StartFailureReason::ImageFailure
            | StartFailureReason::LaunchFailure
            | StartFailureReason::NetworkFailure => true,
        }
    }
}

impl fmt::Display for StartFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StartFailureReason::FullCloud => "Cloud is full",
            StartFailureReason::FullComputeNode => "Compute node is full",
            StartFailureReason::NoComputeNodes => "No compute node available",
            StartFailureReason::NoNetworkNodes => "No network node available",
            StartFailureReason::InvalidPayload => "Workload definition invalid",
            StartFailureReason::InvalidData => "Workload definition corrupt",
            StartFailureReason::AlreadyRunning => "Instance is already running",
            StartFailureReason::InstanceExists => "Instance already exists",
            StartFailureReason::ImageFailure => "Failed to access image",
            StartFailureReason::LaunchFailure => "Failed to launch instance",
            StartFailureReason::NetworkFailure => {
                "Failed to create instance network"
            }
        };
        write!(f, "{}", reason)
    }
}

/// Why an instance failed to restart.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartFailureReason {
    AlreadyRunning,
    InstanceNotFound,
    LaunchFailure,
}

impl fmt::Display for RestartFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RestartFailureReason::AlreadyRunning => {
                "Instance is already running"
            }
            RestartFailureReason::InstanceNotFound => "Instance not found",
            RestartFailureReason::LaunchFailure => {
                "Failed to restart instance"
            }
        };
        write!(f, "{}", reason)
    }
}

/// Why an instance failed to stop.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopFailureReason {
    InstanceNotFound,
    AlreadyStopped,
}

impl fmt::Display for StopFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopFailureReason::InstanceNotFound => "Instance not found",
            StopFailureReason::AlreadyStopped => "Instance already stopped",
        };
        write!(f, "{}", reason)
    }
}

/// Why a volume failed to attach.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachVolumeFailureReason {
    InstanceNotFound,
    VolumeNotFound,
    AttachFailure,
    VolumeAlreadyAttached,
}

impl fmt::Display for AttachVolumeFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AttachVolumeFailureReason::InstanceNotFound => "Instance not found",
            AttachVolumeFailureReason::VolumeNotFound => "Volume not found",
            AttachVolumeFailureReason::AttachFailure => {
                "Failed to attach volume"
            }
            AttachVolumeFailureReason::VolumeAlreadyAttached => {
                "Volume already attached"
            }
        };
        write!(f, "{}", reason)
    }
}

/// Why a volume failed to detach.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachVolumeFailureReason {
    InstanceNotFound,
    VolumeNotFound,
    DetachFailure,
    VolumeNotAttached,
}

impl fmt::Display for DetachVolumeFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DetachVolumeFailureReason::InstanceNotFound => "Instance not found",
            DetachVolumeFailureReason::VolumeNotFound => "Volume not found",
            DetachVolumeFailureReason::DetachFailure => {
                "Failed to detach volume"
            }
            DetachVolumeFailureReason::VolumeNotAttached => {
                "Volume not attached"
            }
        };
        write!(f, "{}", reason)
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node operations

use super::Controller;
use corral_common::api::external::ListResultVec;
use corral_common::api::external::LookupResult;
use corral_common::api::external::Node;
use corral_common::api::external::NodeStats;
use corral_common::api::external::NodeSummary;
use corral_common::api::external::Resource;
use corral_common::api::external::ServerStats;
use corral_common::api::external::TenantCnci;
use slog::warn;
use std::sync::Arc;
use uuid::Uuid;

impl Controller {
    /// A node connected and advertised a role.
    pub fn node_connected(&self, node_id: &str, node_type: Resource) {
        self.ds.add_node(node_id, node_type);
    }

    /// A node went away.
    pub fn node_disconnected(&self, node_id: &str) {
        self.ds.delete_node(node_id);
    }

    pub fn get_node(&self, node_id: &str) -> LookupResult<Node> {
        self.ds.get_node(node_id)
    }

    /// Asks the agent layer to move every instance off a node.  The
    /// request is dispatched in the background; failures are logged, not
    /// surfaced.
    pub fn evacuate_node(self: &Arc<Self>, node_id: &str) {
        let controller = Arc::clone(self);
        let node_id = node_id.to_owned();
        tokio::spawn(async move {
            if let Err(error) = controller.client.evacuate_node(&node_id).await
            {
                warn!(controller.log, "error evacuating node";
                    "node_id" => node_id, "error" => %error);
            }
        });
    }

    /// Asks the agent layer to return an evacuated node to service.
    pub fn restore_node(self: &Arc<Self>, node_id: &str) {
        let controller = Arc::clone(self);
        let node_id = node_id.to_owned();
        tokio::spawn(async move {
            if let Err(error) = controller.client.restore_node(&node_id).await
            {
                warn!(controller.log, "error restoring node";
                    "node_id" => node_id, "error" => %error);
            }
        });
    }

    /// Per-node instance counts by state.
    pub fn node_summaries(&self) -> ListResultVec<NodeSummary> {
        self.ds.get_node_summary()
    }

    /// The last statistics frame received from every node.
    pub fn node_stats(&self) -> Vec<NodeStats> {
        self.ds.get_node_last_stats()
    }

    /// The last per-instance statistics received for one node.
    pub fn instance_stats(&self, node_id: &str) -> Vec<ServerStats> {
        self.ds.get_instance_last_stats(node_id)
    }

    /// Concentrator summaries, optionally restricted to one instance.
    pub fn cnci_summaries(
        &self,
        cnci_id: Option<Uuid>,
    ) -> ListResultVec<TenantCnci> {
        self.ds.get_tenant_cnci_summary(cnci_id)
    }

    /// Count of trace frames recorded per batch label.
    pub async fn trace_summaries(
        &self,
    ) -> ListResultVec<corral_common::api::external::BatchFrameSummary> {
        self.ds.get_batch_frame_summary().await
    }

    /// Aggregated trace timings for one batch label.
    pub async fn trace_statistics(
        &self,
        label: &str,
    ) -> LookupResult<corral_common::api::external::BatchFrameStat> {
        self.ds.get_batch_frame_statistics(label).await
    }
}

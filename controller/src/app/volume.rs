// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Volume operations: block devices and their attachments

use super::agent_error;
use super::Controller;
use chrono::Utc;
use corral_common::api::external::BlockData;
use corral_common::api::external::BlockState;
use corral_common::api::external::CreateResult;
use corral_common::api::external::DeleteResult;
use corral_common::api::external::Error;
use corral_common::api::external::ListResultVec;
use corral_common::api::external::LookupResult;
use corral_common::api::external::RequestedResource;
use corral_common::api::external::Resource;
use corral_common::api::internal::agent::AttachVolumeFailureReason;
use uuid::Uuid;

/// Parameters for creating a volume.
#[derive(Clone, Debug)]
pub struct VolumeCreate {
    pub name: String,
    pub description: String,
    pub size_gb: u64,
    /// Image to initialize the volume from, if any.
    pub source_image: Option<Uuid>,
    pub bootable: bool,
}

fn volume_resources(size_gb: u64) -> Vec<RequestedResource> {
    vec![
        RequestedResource::new(Resource::Volume, 1, true),
        RequestedResource::new(Resource::DiskMb, (size_gb * 1024) as i64, false),
    ]
}

impl Controller {
    /// Creates a block device through the storage driver and records it
    /// for the tenant.
    pub async fn create_volume(
        &self,
        tenant_id: &str,
        params: VolumeCreate,
    ) -> CreateResult<BlockData> {
        self.ds.get_tenant(tenant_id)?;

        let resources = volume_resources(params.size_gb);
        if !self.quotas.consume(tenant_id, &resources).await {
            self.quotas.release(tenant_id, &resources).await;
            return Err(Error::forbidden("tenant over quota"));
        }

        let volume_id = match self
            .block_driver
            .create_block_device(None, params.source_image, params.size_gb)
            .await
        {
            Ok(id) => id,
            Err(error) => {
                self.quotas.release(tenant_id, &resources).await;
                return Err(error);
            }
        };

        let device = BlockData {
            id: volume_id,
            tenant_id: tenant_id.to_owned(),
            state: BlockState::Available,
            name: params.name,
            description: params.description,
            size_gb: params.size_gb,
            bootable: params.bootable,
            create_time: Utc::now(),
        };

        match self.ds.add_block_device(device).await {
            Ok(device) => Ok(device),
            Err(error) => {
                let _ = self.block_driver.delete_block_device(volume_id).await;
                self.quotas.release(tenant_id, &resources).await;
                Err(error)
            }
        }
    }

    /// Deletes an unattached volume.
    pub async fn delete_volume(
        &self,
        caller: &str,
        volume_id: Uuid,
    ) -> DeleteResult {
        let device = self.ds.get_block_device(volume_id)?;
        Controller::ensure_scope(caller, &device.tenant_id)?;

        if device.state != BlockState::Available {
            return Err(Error::forbidden("volume is in use"));
        }
        if !self.ds.get_volume_attachments(volume_id).is_empty() {
            return Err(Error::forbidden("volume is attached"));
        }

        self.ds.delete_block_device(volume_id).await?;
        self.block_driver.delete_block_device(volume_id).await?;
        self.quotas
            .release(&device.tenant_id, &volume_resources(device.size_gb))
            .await;

        Ok(())
    }

    pub fn get_volume(
        &self,
        caller: &str,
        volume_id: Uuid,
    ) -> LookupResult<BlockData> {
        let device = self.ds.get_block_device(volume_id)?;
        Controller::ensure_scope(caller, &device.tenant_id)?;
        Ok(device)
    }

    pub fn list_volumes(&self, tenant_id: &str) -> ListResultVec<BlockData> {
        self.ds.get_block_devices(tenant_id)
    }

    /// Attaches an available volume to a placed instance.
    pub async fn attach_volume(
        &self,
        caller: &str,
        volume_id: Uuid,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        let device = self.ds.get_block_device(volume_id)?;
        Controller::ensure_scope(caller, &device.tenant_id)?;
        let instance = self.instance_for(caller, instance_id)?;

        if device.tenant_id != instance.tenant_id {
            return Err(Error::forbidden(
                "volume and instance belong to different tenants",
            ));
        }
        if device.state != BlockState::Available {
            return Err(Error::forbidden("volume is in use"));
        }
        let Some(node_id) = instance.node_id.as_deref() else {
            return Err(Error::forbidden("instance not assigned to a node"));
        };

        let attachment = self
            .ds
            .create_storage_attachment(instance_id, volume_id, false, false)
            .await?;

        if let Err(error) =
            self.client.attach_volume(volume_id, instance_id, node_id).await
        {
            let _ = self.ds.delete_storage_attachment(attachment.id).await;
            let _ = self
                .ds
                .attach_volume_failure(
                    instance_id,
                    volume_id,
                    AttachVolumeFailureReason::AttachFailure,
                )
                .await;
            return Err(agent_error(error));
        }

        Ok(())
    }

    /// Asks the agent to detach a volume.  The attachment itself is
    /// reconciled away once the agent stops reporting the volume.
    pub async fn detach_volume(
        &self,
        caller: &str,
        volume_id: Uuid,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        let device = self.ds.get_block_device(volume_id)?;
        Controller::ensure_scope(caller, &device.tenant_id)?;
        let instance = self.instance_for(caller, instance_id)?;

        /* The attachment must exist before a detach makes sense. */
        self.ds.get_storage_attachment(instance_id, volume_id)?;

        if device.state != BlockState::InUse {
            return Err(Error::forbidden("volume not in use"));
        }
        let Some(node_id) = instance.node_id.as_deref() else {
            return Err(Error::forbidden("instance not assigned to a node"));
        };

        self.client
            .detach_volume(volume_id, instance_id, node_id)
            .await
            .map_err(agent_error)
    }
}

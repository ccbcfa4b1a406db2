// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on block devices and storage attachments
//!
//! Attachments are reconciled against the volume lists the agents report;
//! reconciliation is idempotent and per-volume errors never abort it.

use super::store_error;
use super::tenant_not_found;
use super::DataStore;
use corral_common::api::external::BlockData;
use corral_common::api::external::BlockState;
use corral_common::api::external::CreateResult;
use corral_common::api::external::DeleteResult;
use corral_common::api::external::Error;
use corral_common::api::external::ListResultVec;
use corral_common::api::external::LookupResult;
use corral_common::api::external::ResourceType;
use corral_common::api::external::StorageAttachment;
use corral_common::api::internal::agent::AttachVolumeFailureReason;
use corral_common::api::internal::agent::DetachVolumeFailureReason;
use slog::warn;
use uuid::Uuid;

fn device_not_found(device_id: &Uuid) -> Error {
    Error::not_found_by_id(ResourceType::BlockDevice, device_id)
}

fn attachment_not_found(id: &Uuid) -> Error {
    Error::not_found_by_id(ResourceType::StorageAttachment, id)
}

impl DataStore {
    /// Stores information about a block device.  An existing device with
    /// the same id is replaced.
    pub async fn add_block_device(
        &self,
        device: BlockData,
    ) -> CreateResult<BlockData> {
        let update = {
            let devices = self.block_devices.read().unwrap();
            devices.contains_key(&device.id)
        };

        if update {
            self.store
                .update_block_device(&device)
                .await
                .map_err(store_error)?;
        } else {
            self.store
                .add_block_device(&device)
                .await
                .map_err(store_error)?;
        }

        self.block_devices
            .write()
            .unwrap()
            .insert(device.id, device.clone());

        let mut tenants = self.tenants.write().unwrap();
        if let Some(tenant) = tenants.get_mut(&device.tenant_id) {
            tenant.devices.insert(device.id);
        }

        Ok(device)
    }

    /// Replaces existing information about a block device.
    pub async fn update_block_device(
        &self,
        device: BlockData,
    ) -> Result<(), Error> {
        {
            let devices = self.block_devices.read().unwrap();
            if !devices.contains_key(&device.id) {
                return Err(device_not_found(&device.id));
            }
        }
        self.add_block_device(device).await.map(|_| ())
    }

    /// Deletes a volume from the datastore and the owning tenant's device
    /// list.
    pub async fn delete_block_device(&self, device_id: Uuid) -> DeleteResult {
        let device = self.get_block_device(device_id)?;

        self.store
            .delete_block_device(device_id)
            .await
            .map_err(store_error)?;

        self.block_devices.write().unwrap().remove(&device_id);
        let mut tenants = self.tenants.write().unwrap();
        if let Some(tenant) = tenants.get_mut(&device.tenant_id) {
            tenant.devices.remove(&device_id);
        }

        Ok(())
    }

    /// Returns information about a block device.
    pub fn get_block_device(&self, device_id: Uuid) -> LookupResult<BlockData> {
        self.block_devices
            .read()
            .unwrap()
            .get(&device_id)
            .cloned()
            .ok_or_else(|| device_not_found(&device_id))
    }

    /// Returns all block devices associated with a tenant.
    pub fn get_block_devices(
        &self,
        tenant_id: &str,
    ) -> ListResultVec<BlockData> {
        let ids: Vec<Uuid> = {
            let tenants = self.tenants.read().unwrap();
            let state = tenants
                .get(tenant_id)
                .ok_or_else(|| tenant_not_found(tenant_id))?;
            state.devices.iter().copied().collect()
        };

        let devices = self.block_devices.read().unwrap();
        Ok(ids.iter().filter_map(|id| devices.get(id)).cloned().collect())
    }

    async fn set_device_state(
        &self,
        device_id: Uuid,
        state: BlockState,
    ) -> Result<(), Error> {
        let mut device = self.get_block_device(device_id)?;
        device.state = state;
        self.update_block_device(device).await
    }

    /*
     * Attachments
     */

    /// Associates an instance with a block device, marking the device in
    /// use.
    pub async fn create_storage_attachment(
        &self,
        instance_id: Uuid,
        block_id: Uuid,
        ephemeral: bool,
        boot: bool,
    ) -> CreateResult<StorageAttachment> {
        let attachment = StorageAttachment {
            id: Uuid::new_v4(),
            instance_id,
            block_id,
            ephemeral,
            boot,
        };

        self.store
            .add_storage_attachment(&attachment)
            .await
            .map_err(store_error)?;

        if let Err(error) =
            self.set_device_state(block_id, BlockState::InUse).await
        {
            let _ = self.store.delete_storage_attachment(attachment.id).await;
            return Err(error);
        }

        let mut tables = self.attachments.write().unwrap();
        tables.attachments.insert(attachment.id, attachment.clone());
        tables
            .instance_volumes
            .insert((instance_id, block_id), attachment.id);

        Ok(attachment)
    }

    /// Returns the attachments for one instance.
    pub fn get_storage_attachments(
        &self,
        instance_id: Uuid,
    ) -> Vec<StorageAttachment> {
        self.attachments
            .read()
            .unwrap()
            .attachments
            .values()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Returns the attachment binding an instance to a volume, if any.
    pub fn get_storage_attachment(
        &self,
        instance_id: Uuid,
        block_id: Uuid,
    ) -> LookupResult<StorageAttachment> {
        let tables = self.attachments.read().unwrap();
        tables
            .instance_volumes
            .get(&(instance_id, block_id))
            .and_then(|id| tables.attachments.get(id))
            .cloned()
            .ok_or_else(|| {
                Error::not_found_other(
                    ResourceType::StorageAttachment,
                    format!("no volume {} on instance {}", block_id, instance_id),
                )
            })
    }

    /// Returns the attachments referencing one volume.
    pub fn get_volume_attachments(
        &self,
        block_id: Uuid,
    ) -> Vec<StorageAttachment> {
        self.attachments
            .read()
            .unwrap()
            .attachments
            .values()
            .filter(|a| a.block_id == block_id)
            .cloned()
            .collect()
    }

    /// Deletes the attachment with the given id.
    pub async fn delete_storage_attachment(&self, id: Uuid) -> DeleteResult {
        self.store
            .delete_storage_attachment(id)
            .await
            .map_err(store_error)?;

        let mut tables = self.attachments.write().unwrap();
        match tables.attachments.remove(&id) {
            Some(attachment) => {
                tables
                    .instance_volumes
                    .remove(&(attachment.instance_id, attachment.block_id));
                Ok(())
            }
            None => Err(attachment_not_found(&id)),
        }
    }

    /// Reconciles an instance's attachments against the volume list its
    /// agent reported.  Unknown volumes gain attachments and become in-use;
    /// attachments whose volume disappeared are released.  Errors on
    /// individual volumes are logged and the reconciliation carries on.
    pub(crate) async fn update_storage_attachments(
        &self,
        instance_id: Uuid,
        volumes: &[Uuid],
    ) {
        let (to_add, to_remove) = {
            let mut tables = self.attachments.write().unwrap();

            let mut to_add = Vec::new();
            for volume in volumes {
                if tables
                    .instance_volumes
                    .contains_key(&(instance_id, *volume))
                {
                    continue;
                }
                let attachment = StorageAttachment {
                    id: Uuid::new_v4(),
                    instance_id,
                    block_id: *volume,
                    ephemeral: false,
                    boot: false,
                };
                tables.attachments.insert(attachment.id, attachment.clone());
                tables
                    .instance_volumes
                    .insert((instance_id, *volume), attachment.id);
                to_add.push(attachment);
            }

            let to_remove: Vec<StorageAttachment> = tables
                .attachments
                .values()
                .filter(|a| {
                    a.instance_id == instance_id
                        && !volumes.contains(&a.block_id)
                })
                .cloned()
                .collect();
            for attachment in &to_remove {
                tables.attachments.remove(&attachment.id);
                tables
                    .instance_volumes
                    .remove(&(attachment.instance_id, attachment.block_id));
            }

            (to_add, to_remove)
        };

        for attachment in to_add {
            if let Err(error) =
                self.store.add_storage_attachment(&attachment).await
            {
                warn!(self.log, "error persisting storage attachment";
                    "attachment_id" => %attachment.id, "error" => %error);
                continue;
            }

            if let Err(error) = self
                .set_device_state(attachment.block_id, BlockState::InUse)
                .await
            {
                warn!(self.log, "error updating block device";
                    "block_id" => %attachment.block_id, "error" => %error);
            }
        }

        for attachment in to_remove {
            if let Err(error) = self
                .set_device_state(attachment.block_id, BlockState::Available)
                .await
            {
                warn!(self.log, "error updating block device";
                    "block_id" => %attachment.block_id, "error" => %error);
            }

            if let Err(error) =
                self.store.delete_storage_attachment(attachment.id).await
            {
                warn!(self.log, "error removing storage attachment";
                    "attachment_id" => %attachment.id, "error" => %error);
            }
        }
    }

    /*
     * Failure events
     */

    /// Cleans up after a failure to attach a volume: the device goes back
    /// to available and a user-visible error is logged.
    pub async fn attach_volume_failure(
        &self,
        instance_id: Uuid,
        volume_id: Uuid,
        reason: AttachVolumeFailureReason,
    ) -> Result<(), Error> {
        self.set_device_state(volume_id, BlockState::Available).await?;

        let instance = self.get_instance(instance_id)?;
        self.log_error(
            &instance.tenant_id,
            format!(
                "Attach Volume Failure {} to {}: {}",
                volume_id, instance_id, reason
            ),
        )
        .await
    }

    /// Cleans up after a failure to detach a volume.  A detach is only ever
    /// issued for an in-use device, so the state goes straight back to
    /// in-use.
    pub async fn detach_volume_failure(
        &self,
        instance_id: Uuid,
        volume_id: Uuid,
        reason: DetachVolumeFailureReason,
    ) -> Result<(), Error> {
        self.set_device_state(volume_id, BlockState::InUse).await?;

        let instance = self.get_instance(instance_id)?;
        self.log_error(
            &instance.tenant_id,
            format!(
                "Detach Volume Failure {} from {}: {}",
                volume_id, instance_id, reason
            ),
        )
        .await
    }
}

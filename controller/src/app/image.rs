// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image metadata operations
//!
//! Only the metadata lives in the controller; blobs are handed to the
//! block storage driver, which keeps them as devices plus a snapshot.

use super::Controller;
use super::IMAGE_SNAPSHOT;
use chrono::Utc;
use corral_common::api::external::CreateResult;
use corral_common::api::external::DeleteResult;
use corral_common::api::external::Error;
use corral_common::api::external::Image;
use corral_common::api::external::ImageState;
use corral_common::api::external::LookupResult;
use corral_common::api::external::RequestedResource;
use corral_common::api::external::Resource;
use corral_common::api::external::ResourceType;
use corral_common::api::external::Visibility;
use slog::info;
use slog::warn;
use uuid::Uuid;

/// Parameters for creating an image.
#[derive(Clone, Debug)]
pub struct ImageCreate {
    /// Caller-chosen id; must be a UUID when present.
    pub id: Option<String>,
    pub name: String,
    pub visibility: Visibility,
}

fn image_resources() -> Vec<RequestedResource> {
    vec![RequestedResource::new(Resource::Image, 1, true)]
}

impl Controller {
    /// Whether the caller may see an image at all.  Public images are
    /// visible to everyone; private and internal ones only to the owning
    /// tenant or an administrator.
    fn image_visible(caller: &str, image: &Image) -> bool {
        image.visibility == Visibility::Public
            || Controller::is_admin(caller)
            || image.tenant_id == caller
    }

    /// Creates an empty image record.  Non-admin callers may only create
    /// private images.
    pub async fn create_image(
        &self,
        caller: &str,
        params: ImageCreate,
    ) -> CreateResult<Image> {
        let id = match &params.id {
            Some(id) => Uuid::parse_str(id).map_err(|_| {
                Error::invalid_value("id", "malformed UUID")
            })?,
            None => Uuid::new_v4(),
        };

        if params.visibility != Visibility::Private
            && !Controller::is_admin(caller)
        {
            return Err(Error::invalid_value(
                "visibility",
                "only admin may create public or internal images",
            ));
        }

        let image = Image {
            id,
            tenant_id: caller.to_owned(),
            state: ImageState::Created,
            name: params.name,
            size: 0,
            visibility: params.visibility,
            create_time: Utc::now(),
        };

        let image = self.ds.add_image(image).await?;

        if !self.quotas.consume(caller, &image_resources()).await {
            let _ = self.ds.delete_image(image.id).await;
            self.quotas.release(caller, &image_resources()).await;
            return Err(Error::forbidden("tenant over quota"));
        }

        info!(self.log, "image created"; "image_id" => %image.id);
        Ok(image)
    }

    /// Uploads image data, delegating the blob to the block storage
    /// driver.  The image moves Created → Saving → Active, or to Killed
    /// when the blob cannot be stored.
    pub async fn upload_image(
        &self,
        caller: &str,
        image_id: Uuid,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut image = self.get_image(caller, image_id)?;
        if !Controller::is_admin(caller) && image.tenant_id != caller {
            /* Public images are readable by anyone but writable only by
             * their owner. */
            return Err(Error::not_found_by_id(
                ResourceType::Image,
                &image_id,
            ));
        }

        image.state = ImageState::Saving;
        self.ds.update_image(image.clone()).await?;

        let stored = async {
            self.block_driver
                .create_block_device_from_data(image_id, data)
                .await?;
            self.block_driver
                .create_block_device_snapshot(image_id, IMAGE_SNAPSHOT)
                .await?;
            self.block_driver.block_device_size(image_id).await
        }
        .await;

        match stored {
            Ok(size) => {
                image.size = size;
                image.state = ImageState::Active;
                self.ds.update_image(image).await?;
                info!(self.log, "image uploaded"; "image_id" => %image_id);
                Ok(())
            }
            Err(error) => {
                warn!(self.log, "image upload failed";
                    "image_id" => %image_id, "error" => %error);
                let _ = self
                    .block_driver
                    .delete_block_device(image_id)
                    .await;
                image.state = ImageState::Killed;
                let _ = self.ds.update_image(image).await;
                Err(Error::unavail("error saving image"))
            }
        }
    }

    /// Deletes an image and its blob.
    pub async fn delete_image(
        &self,
        caller: &str,
        image_id: Uuid,
    ) -> DeleteResult {
        let image = self.ds.get_image(image_id)?;
        if !Controller::is_admin(caller) && image.tenant_id != caller {
            /* Non-owners cannot probe for other tenants' images. */
            return Err(Error::not_found_by_id(
                ResourceType::Image,
                &image_id,
            ));
        }

        self.ds.delete_image(image_id).await?;
        self.quotas.release(&image.tenant_id, &image_resources()).await;

        if image.state == ImageState::Active {
            if let Err(error) = self
                .block_driver
                .delete_block_device_snapshot(image_id, IMAGE_SNAPSHOT)
                .await
            {
                warn!(self.log, "error deleting image snapshot";
                    "image_id" => %image_id, "error" => %error);
            }
            if let Err(error) =
                self.block_driver.delete_block_device(image_id).await
            {
                warn!(self.log, "error deleting image device";
                    "image_id" => %image_id, "error" => %error);
            }
        }

        info!(self.log, "image deleted"; "image_id" => %image_id);
        Ok(())
    }

    /// Fetches an image's metadata.  Only the owning tenant or admin may
    /// fetch non-public images.
    pub fn get_image(
        &self,
        caller: &str,
        image_id: Uuid,
    ) -> LookupResult<Image> {
        let image = self.ds.get_image(image_id)?;
        if !Controller::image_visible(caller, &image) {
            return Err(Error::not_found_by_id(ResourceType::Image, &image_id));
        }
        Ok(image)
    }

    /// Lists the images visible to the caller.
    pub fn list_images(&self, caller: &str) -> Vec<Image> {
        self.ds.get_images(caller, Controller::is_admin(caller))
    }
}

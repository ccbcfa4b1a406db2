// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on image metadata
//!
//! Only metadata lives here; the image blobs themselves belong to the
//! external block storage driver.

use super::store_error;
use super::DataStore;
use corral_common::api::external::CreateResult;
use corral_common::api::external::DeleteResult;
use corral_common::api::external::Error;
use corral_common::api::external::Image;
use corral_common::api::external::LookupResult;
use corral_common::api::external::ResourceType;
use corral_common::api::external::Visibility;
use uuid::Uuid;

fn image_not_found(image_id: &Uuid) -> Error {
    Error::not_found_by_id(ResourceType::Image, image_id)
}

impl DataStore {
    /// Stores metadata for a new image.
    pub async fn add_image(&self, image: Image) -> CreateResult<Image> {
        {
            let images = self.images.read().unwrap();
            if images.contains_key(&image.id) {
                return Err(Error::already_exists(
                    ResourceType::Image,
                    &image.id.to_string(),
                ));
            }
        }

        self.store.add_image(&image).await.map_err(store_error)?;
        self.images.write().unwrap().insert(image.id, image.clone());
        Ok(image)
    }

    /// Replaces the stored metadata for an image.
    pub async fn update_image(&self, image: Image) -> Result<(), Error> {
        {
            let images = self.images.read().unwrap();
            if !images.contains_key(&image.id) {
                return Err(image_not_found(&image.id));
            }
        }

        self.store.update_image(&image).await.map_err(store_error)?;
        self.images.write().unwrap().insert(image.id, image);
        Ok(())
    }

    /// Deletes an image's metadata.
    pub async fn delete_image(&self, image_id: Uuid) -> DeleteResult {
        {
            let images = self.images.read().unwrap();
            if !images.contains_key(&image_id) {
                return Err(image_not_found(&image_id));
            }
        }

        self.store.delete_image(image_id).await.map_err(store_error)?;
        self.images.write().unwrap().remove(&image_id);
        Ok(())
    }

    /// Returns an image's metadata.
    pub fn get_image(&self, image_id: Uuid) -> LookupResult<Image> {
        self.images
            .read()
            .unwrap()
            .get(&image_id)
            .cloned()
            .ok_or_else(|| image_not_found(&image_id))
    }

    /// Returns the images visible to a tenant: its own plus the public
    /// ones.  Administrators see everything.
    pub fn get_images(&self, tenant_id: &str, admin: bool) -> Vec<Image> {
        self.images
            .read()
            .unwrap()
            .values()
            .filter(|image| {
                admin
                    || image.visibility == Visibility::Public
                    || (image.tenant_id == tenant_id
                        && image.visibility != Visibility::Internal)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;
    use corral_common::api::external::ImageState;
    use corral_common::dev::test_setup_log;
    use std::sync::Arc;

    fn test_image(tenant_id: &str, visibility: Visibility) -> Image {
        Image {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_owned(),
            state: ImageState::Created,
            name: String::from("cirros"),
            size: 0,
            visibility,
            create_time: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_image_visibility() {
        let log = test_setup_log("datastore_image");
        let ds =
            DataStore::init(log, Arc::new(MemStore::new())).await.unwrap();

        let public = test_image("admin", Visibility::Public);
        let private = test_image("t1", Visibility::Private);
        let internal = test_image("internal", Visibility::Internal);
        for image in [&public, &private, &internal] {
            ds.add_image(image.clone()).await.unwrap();
        }

        let t1 = ds.get_images("t1", false);
        assert_eq!(t1.len(), 2);
        assert!(t1.iter().all(|i| i.id != internal.id));

        let t2 = ds.get_images("t2", false);
        assert_eq!(t2.len(), 1);
        assert_eq!(t2[0].id, public.id);

        assert_eq!(ds.get_images("admin", true).len(), 3);
    }

    #[tokio::test]
    async fn test_image_lifecycle() {
        let log = test_setup_log("datastore_image");
        let ds =
            DataStore::init(log, Arc::new(MemStore::new())).await.unwrap();

        let image = test_image("t1", Visibility::Private);
        let id = image.id;
        ds.add_image(image.clone()).await.unwrap();
        assert!(ds.add_image(image.clone()).await.is_err());

        let mut saved = image;
        saved.state = ImageState::Active;
        saved.size = 512;
        ds.update_image(saved).await.unwrap();
        assert_eq!(ds.get_image(id).unwrap().state, ImageState::Active);

        ds.delete_image(id).await.unwrap();
        assert!(ds.get_image(id).is_err());
        assert!(ds.delete_image(id).await.is_err());
    }
}

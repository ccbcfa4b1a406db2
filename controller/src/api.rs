// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Constants and response shapes consumed by the HTTP router collaborator
//!
//! The router owns listening, authentication and dispatch; the pieces the
//! controller dictates live here: the versioned content types, the path
//! constraints, the resource-index links, and the error body shape along
//! with the status code each error kind maps to.

use corral_common::api::external::Error;
use http::StatusCode;
use serde::Deserialize;
use serde::Serialize;

/// Default port the controller API is served on.
pub const PORT: u16 = 8889;

/// Content-type string for v1 of the pools resource.
pub const POOLS_V1: &str = "x.corral.pools.v1";
/// Content-type string for v1 of the external-ips resource.
pub const EXTERNAL_IPS_V1: &str = "x.corral.external-ips.v1";
/// Content-type string for v1 of the workloads resource.
pub const WORKLOADS_V1: &str = "x.corral.workloads.v1";
/// Content-type string for v1 of the tenants resource.
pub const TENANTS_V1: &str = "x.corral.tenants.v1";
/// Content-type string for v1 of the node resource.
pub const NODE_V1: &str = "x.corral.node.v1";
/// Content-type string for v1 of the images resource.
pub const IMAGES_V1: &str = "x.corral.images.v1";

/// Every versioned resource must also be reachable with this content type.
pub const JSON_ALIAS: &str = "application/json";

/// Pattern tenant ids in API paths must match.
pub const UUID_PATTERN: &str =
    "[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}";

/// Status the router answers with when a non-privileged caller reaches a
/// privileged route.  The privilege extractor runs before requests reach
/// the controller, so this mapping is the router's to enforce.
pub const UNPRIVILEGED_STATUS: StatusCode = StatusCode::UNAUTHORIZED;

/// Renders a versioned resource content type as a full media type.
pub fn media_type(resource: &str) -> String {
    format!("application/{}", resource)
}

/// Content type expected on raw image uploads
/// (`PUT .../images/{id}/file`).
pub fn image_upload_media_type() -> String {
    format!("{}/octet-stream", IMAGES_V1)
}

/// One entry in the resource index served at `/` and `/{tenant}`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ApiLink {
    pub rel: String,
    pub href: String,
    pub version: String,
    pub minimum_version: String,
}

impl ApiLink {
    pub fn new(rel: &str, href: String, version: &str) -> ApiLink {
        ApiLink {
            rel: rel.to_owned(),
            href,
            version: version.to_owned(),
            minimum_version: version.to_owned(),
        }
    }
}

/// The resource index for a scope: one link per resource the router
/// serves, tenant-prefixed when a tenant is given.
pub fn resource_links(base_url: &str, tenant: Option<&str>) -> Vec<ApiLink> {
    let resources = [
        ("pools", POOLS_V1),
        ("external-ips", EXTERNAL_IPS_V1),
        ("workloads", WORKLOADS_V1),
        ("tenants", TENANTS_V1),
        ("node", NODE_V1),
        ("images", IMAGES_V1),
    ];

    resources
        .iter()
        .map(|(rel, version)| {
            let href = match tenant {
                Some(tenant) => format!("{}/{}/{}", base_url, tenant, rel),
                None => format!("{}/{}", base_url, rel),
            };
            ApiLink::new(rel, href, version)
        })
        .collect()
}

/// The payload of an error response body.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HttpErrorData {
    pub code: u16,
    pub name: String,
    pub message: String,
}

/// The error response body: `{"error": {code, name, message}}`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HttpErrorBody {
    pub error: HttpErrorData,
}

impl HttpErrorBody {
    /// Builds the response body for an error, using the status text of the
    /// mapped code as the error name.
    pub fn new(error: &Error) -> HttpErrorBody {
        let status = error.status_code();
        HttpErrorBody {
            error: HttpErrorData {
                code: status.as_u16(),
                name: status
                    .canonical_reason()
                    .unwrap_or("Unknown")
                    .to_owned(),
                message: error.to_string(),
            },
        }
    }

    /// The status code the router must answer with.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.error.code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

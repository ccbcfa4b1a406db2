// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Corral control plane: common facilities
//!
//! This crate implements types and facilities shared between the corral
//! controller and the collaborators that feed it (the HTTP router, the agent
//! transport, the CLI).  Everything here is HTTP-agnostic; the router maps
//! [`api::external::Error`] values onto status codes using the helpers the
//! error type provides.

pub mod api;
pub mod dev;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External IP pool and mapping operations

use super::agent_error;
use super::Controller;
use corral_common::api::external::CreateResult;
use corral_common::api::external::DeleteResult;
use corral_common::api::external::Error;
use corral_common::api::external::ListResultVec;
use corral_common::api::external::LookupResult;
use corral_common::api::external::MappedIp;
use corral_common::api::external::Pool;
use corral_common::api::external::ResourceType;
use ipnetwork::Ipv4Network;
use slog::warn;
use std::net::Ipv4Addr;
use uuid::Uuid;

fn parse_subnet(subnet: &str) -> Result<Ipv4Network, Error> {
    subnet
        .parse()
        .map_err(|_| Error::invalid_value("subnet", "unparseable CIDR"))
}

fn parse_address(address: &str) -> Result<Ipv4Addr, Error> {
    address
        .parse()
        .map_err(|_| Error::invalid_value("address", "invalid IPv4 address"))
}

impl Controller {
    /// Creates a pool from an optional subnet and a list of individual
    /// addresses.  Pool names are unique.
    pub async fn create_pool(
        &self,
        name: &str,
        subnet: Option<&str>,
        ips: &[String],
    ) -> CreateResult<Pool> {
        if self.ds.get_pools()?.iter().any(|p| p.name == name) {
            return Err(Error::already_exists(ResourceType::Pool, name));
        }

        let subnets = match subnet {
            Some(subnet) => vec![parse_subnet(subnet)?],
            None => Vec::new(),
        };
        let ips = ips
            .iter()
            .map(|ip| parse_address(ip))
            .collect::<Result<Vec<_>, _>>()?;

        self.ds.add_pool(Pool::new(name.to_owned(), subnets, ips)).await
    }

    pub async fn delete_pool(&self, pool_id: Uuid) -> DeleteResult {
        self.ds.delete_pool(pool_id).await
    }

    pub fn get_pool(&self, pool_id: Uuid) -> LookupResult<Pool> {
        self.ds.get_pool(pool_id)
    }

    pub fn list_pools(&self) -> ListResultVec<Pool> {
        self.ds.get_pools()
    }

    pub(crate) fn pool_by_name(&self, name: &str) -> LookupResult<Pool> {
        self.ds
            .get_pools()?
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::not_found_by_name(ResourceType::Pool, name))
    }

    /// Adds a subnet to a pool.
    pub async fn add_pool_subnet(
        &self,
        pool_id: Uuid,
        subnet: &str,
    ) -> Result<(), Error> {
        self.ds.add_external_subnet(pool_id, parse_subnet(subnet)?).await
    }

    /// Adds individual addresses to a pool.
    pub async fn add_pool_addresses(
        &self,
        pool_id: Uuid,
        ips: &[String],
    ) -> Result<(), Error> {
        let ips = ips
            .iter()
            .map(|ip| parse_address(ip))
            .collect::<Result<Vec<_>, _>>()?;
        self.ds.add_external_ips(pool_id, &ips).await
    }

    pub async fn delete_pool_subnet(
        &self,
        pool_id: Uuid,
        subnet_id: Uuid,
    ) -> DeleteResult {
        self.ds.delete_subnet(pool_id, subnet_id).await
    }

    pub async fn delete_pool_address(
        &self,
        pool_id: Uuid,
        address_id: Uuid,
    ) -> DeleteResult {
        self.ds.delete_external_ip(pool_id, address_id).await
    }

    /// Maps an external address from the named pool onto an instance's
    /// private address and tells the instance's network agent about the
    /// binding.
    pub async fn map_external_ip(
        &self,
        caller: &str,
        pool_name: &str,
        instance_id: Uuid,
    ) -> CreateResult<MappedIp> {
        let instance = self.instance_for(caller, instance_id)?;
        let pool = self.pool_by_name(pool_name)?;

        let mapping = self.ds.map_external_ip(pool.id, instance_id).await?;

        if let Err(error) = self.client.assign_external_ip(&mapping).await {
            let _ = self.ds.unmap_external_ip(mapping.external_ip).await;
            return Err(agent_error(error));
        }

        if let Err(error) = self
            .ds
            .log_event(
                &instance.tenant_id,
                format!(
                    "Mapped {} to {}",
                    mapping.external_ip, mapping.internal_ip
                ),
            )
            .await
        {
            warn!(self.log, "error logging event"; "error" => %error);
        }

        Ok(mapping)
    }

    /// Releases an external address mapping.
    pub async fn unmap_external_ip(
        &self,
        caller: &str,
        address: &str,
    ) -> DeleteResult {
        let address = parse_address(address)?;
        let mapping = self.ds.get_mapped_ip(address)?;
        Controller::ensure_scope(caller, &mapping.tenant_id)?;

        if let Err(error) = self.client.release_external_ip(&mapping).await {
            return Err(agent_error(error));
        }

        self.ds.unmap_external_ip(address).await?;

        if let Err(error) = self
            .ds
            .log_event(
                &mapping.tenant_id,
                format!(
                    "Unmapped {} from {}",
                    mapping.external_ip, mapping.internal_ip
                ),
            )
            .await
        {
            warn!(self.log, "error logging event"; "error" => %error);
        }

        Ok(())
    }

    /// The active mappings visible to the caller: everything for admin,
    /// the tenant's own otherwise.
    pub fn list_mapped_ips(&self, caller: &str) -> Vec<MappedIp> {
        if Controller::is_admin(caller) {
            self.ds.get_mapped_ips(None)
        } else {
            self.ds.get_mapped_ips(Some(caller))
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on external IP pools and mappings
//!
//! Admission is cluster-wide: no two pools may own overlapping subnets or a
//! shared individual address, and an individual address may not fall inside
//! any pool subnet.  The `external_subnets` and `external_ips` sets under
//! the pools lock enforce this.

use super::store_error;
use super::DataStore;
use super::PoolTables;
use corral_common::api::external::CreateResult;
use corral_common::api::external::DeleteResult;
use corral_common::api::external::Error;
use corral_common::api::external::ExternalIp;
use corral_common::api::external::ExternalSubnet;
use corral_common::api::external::ListResultVec;
use corral_common::api::external::LookupResult;
use corral_common::api::external::MappedIp;
use corral_common::api::external::Pool;
use corral_common::api::external::ResourceType;
use corral_common::api::external::subnet_usable_hosts;
use ipnetwork::Ipv4Network;
use slog::warn;
use std::net::Ipv4Addr;
use uuid::Uuid;

fn pool_not_found(pool_id: &Uuid) -> Error {
    Error::not_found_by_id(ResourceType::Pool, pool_id)
}

fn address_not_found(address: Ipv4Addr) -> Error {
    Error::not_found_other(
        ResourceType::ExternalIp,
        format!("address {} not mapped", address),
    )
}

fn pool_empty() -> Error {
    Error::forbidden("pool is empty")
}

fn pool_not_empty() -> Error {
    Error::forbidden("pool is not empty")
}

/// Rejects subnets that cannot contribute addresses to a pool.  `/32`
/// prefixes must be added as individual addresses instead.
fn check_subnet_size(cidr: &Ipv4Network) -> Result<i64, Error> {
    if cidr.prefix() == 32 {
        return Err(Error::invalid_value(
            "subnet",
            "/32 subnets must be added as individual addresses",
        ));
    }
    let usable = subnet_usable_hosts(cidr);
    if usable <= 0 {
        return Err(Error::invalid_value("subnet", "subnet too small"));
    }
    Ok(usable)
}

/// Caller holds the pools lock.  `staged` carries subnets admitted earlier
/// in the same request.
fn is_duplicate_subnet(
    tables: &PoolTables,
    staged: &[Ipv4Network],
    new: &Ipv4Network,
) -> bool {
    tables
        .external_subnets
        .iter()
        .chain(staged.iter())
        .any(|s| s.contains(new.network()) || new.contains(s.network()))
}

/// Caller holds the pools lock.
fn is_duplicate_ip(
    tables: &PoolTables,
    staged: &[Ipv4Addr],
    new: Ipv4Addr,
) -> bool {
    if tables.external_subnets.iter().any(|s| s.contains(new)) {
        return true;
    }
    tables.external_ips.contains(&new) || staged.contains(&new)
}

impl DataStore {
    /// Returns an external IP pool.
    pub fn get_pool(&self, pool_id: Uuid) -> LookupResult<Pool> {
        self.pools
            .read()
            .unwrap()
            .pools
            .get(&pool_id)
            .cloned()
            .ok_or_else(|| pool_not_found(&pool_id))
    }

    /// Returns all external IP pools.
    pub fn get_pools(&self) -> ListResultVec<Pool> {
        Ok(self.pools.read().unwrap().pools.values().cloned().collect())
    }

    /// Adds a brand new pool.  Either every subnet and address is admitted
    /// or no state changes at all.
    pub async fn add_pool(&self, pool: Pool) -> CreateResult<Pool> {
        {
            let mut tables = self.pools.write().unwrap();

            let mut staged_subnets: Vec<Ipv4Network> = Vec::new();
            for subnet in &pool.subnets {
                check_subnet_size(&subnet.cidr)?;
                if is_duplicate_subnet(&tables, &staged_subnets, &subnet.cidr)
                {
                    return Err(Error::already_exists(
                        ResourceType::Subnet,
                        &subnet.cidr.to_string(),
                    ));
                }
                staged_subnets.push(subnet.cidr);
            }

            let mut staged_ips: Vec<Ipv4Addr> = Vec::new();
            for ip in &pool.ips {
                if staged_subnets.iter().any(|s| s.contains(ip.address))
                    || is_duplicate_ip(&tables, &staged_ips, ip.address)
                {
                    return Err(Error::already_exists(
                        ResourceType::ExternalIp,
                        &ip.address.to_string(),
                    ));
                }
                staged_ips.push(ip.address);
            }

            /* The whole request is admitted; commit the caches. */
            for cidr in staged_subnets {
                tables.external_subnets.insert(cidr);
            }
            for ip in staged_ips {
                tables.external_ips.insert(ip);
            }
            tables.pools.insert(pool.id, pool.clone());
        }

        if let Err(error) = self.store.add_pool(&pool).await {
            /* The lock must not be held when compensating. */
            let _ = self.delete_pool(pool.id).await;
            return Err(store_error(error));
        }

        Ok(pool)
    }

    /// Deletes an unused pool.  A pool may be deleted only while every one
    /// of its addresses is unmapped.
    pub async fn delete_pool(&self, pool_id: Uuid) -> DeleteResult {
        let removed = {
            let mut tables = self.pools.write().unwrap();
            let pool = tables
                .pools
                .get(&pool_id)
                .ok_or_else(|| pool_not_found(&pool_id))?;
            if pool.free != pool.total_ips {
                return Err(pool_not_empty());
            }

            let pool = tables.pools.remove(&pool_id).unwrap();
            for subnet in &pool.subnets {
                tables.external_subnets.remove(&subnet.cidr);
            }
            for ip in &pool.ips {
                tables.external_ips.remove(&ip.address);
            }
            pool
        };

        if let Err(error) = self.store.delete_pool(pool_id).await {
            let mut tables = self.pools.write().unwrap();
            for subnet in &removed.subnets {
                tables.external_subnets.insert(subnet.cidr);
            }
            for ip in &removed.ips {
                tables.external_ips.insert(ip.address);
            }
            tables.pools.insert(pool_id, removed);
            return Err(store_error(error));
        }

        Ok(())
    }

    /// Adds a new subnet to an existing pool.
    pub async fn add_external_subnet(
        &self,
        pool_id: Uuid,
        cidr: Ipv4Network,
    ) -> Result<(), Error> {
        let usable = check_subnet_size(&cidr)?;

        let updated = {
            let mut tables = self.pools.write().unwrap();
            if !tables.pools.contains_key(&pool_id) {
                return Err(pool_not_found(&pool_id));
            }
            if is_duplicate_subnet(&tables, &[], &cidr) {
                return Err(Error::already_exists(
                    ResourceType::Subnet,
                    &cidr.to_string(),
                ));
            }

            let pool = tables.pools.get_mut(&pool_id).unwrap();
            pool.subnets.push(ExternalSubnet { id: Uuid::new_v4(), cidr });
            pool.total_ips += usable as u32;
            pool.free += usable as u32;
            let updated = pool.clone();
            tables.external_subnets.insert(cidr);
            updated
        };

        if let Err(error) = self.store.update_pool(&updated).await {
            let mut tables = self.pools.write().unwrap();
            tables.external_subnets.remove(&cidr);
            if let Some(pool) = tables.pools.get_mut(&pool_id) {
                pool.subnets.retain(|s| s.cidr != cidr);
                pool.total_ips -= usable as u32;
                pool.free -= usable as u32;
            }
            return Err(store_error(error));
        }

        Ok(())
    }

    /// Adds a list of individual addresses to an existing pool.
    pub async fn add_external_ips(
        &self,
        pool_id: Uuid,
        ips: &[Ipv4Addr],
    ) -> Result<(), Error> {
        let updated = {
            let mut tables = self.pools.write().unwrap();
            if !tables.pools.contains_key(&pool_id) {
                return Err(pool_not_found(&pool_id));
            }

            let mut staged: Vec<Ipv4Addr> = Vec::new();
            for ip in ips {
                if is_duplicate_ip(&tables, &staged, *ip) {
                    return Err(Error::already_exists(
                        ResourceType::ExternalIp,
                        &ip.to_string(),
                    ));
                }
                staged.push(*ip);
            }

            let pool = tables.pools.get_mut(&pool_id).unwrap();
            for ip in &staged {
                pool.ips
                    .push(ExternalIp { id: Uuid::new_v4(), address: *ip });
                pool.total_ips += 1;
                pool.free += 1;
            }
            let updated = pool.clone();
            for ip in staged {
                tables.external_ips.insert(ip);
            }
            updated
        };

        if let Err(error) = self.store.update_pool(&updated).await {
            let mut tables = self.pools.write().unwrap();
            for ip in ips {
                tables.external_ips.remove(ip);
            }
            if let Some(pool) = tables.pools.get_mut(&pool_id) {
                pool.ips.retain(|i| !ips.contains(&i.address));
                pool.total_ips -= ips.len() as u32;
                pool.free -= ips.len() as u32;
            }
            return Err(store_error(error));
        }

        Ok(())
    }

    /// Removes an unused subnet from an existing pool.  Fails while any
    /// address inside the subnet is mapped.
    pub async fn delete_subnet(
        &self,
        pool_id: Uuid,
        subnet_id: Uuid,
    ) -> DeleteResult {
        let (cidr, usable, updated) = {
            let mut tables = self.pools.write().unwrap();
            let pool = tables
                .pools
                .get(&pool_id)
                .ok_or_else(|| pool_not_found(&pool_id))?;
            let subnet = pool
                .subnets
                .iter()
                .find(|s| s.id == subnet_id)
                .ok_or_else(|| Error::forbidden("invalid pool address"))?;
            let cidr = subnet.cidr;

            let base = u32::from(cidr.network());
            let broadcast = u32::from(cidr.broadcast());
            for addr in base..=broadcast {
                if tables.mapped_ips.contains_key(&Ipv4Addr::from(addr)) {
                    return Err(pool_not_empty());
                }
            }

            let usable = subnet_usable_hosts(&cidr) as u32;
            let pool = tables.pools.get_mut(&pool_id).unwrap();
            pool.subnets.retain(|s| s.id != subnet_id);
            pool.total_ips -= usable;
            pool.free -= usable;
            let updated = pool.clone();
            tables.external_subnets.remove(&cidr);
            (cidr, usable, updated)
        };

        if let Err(error) = self.store.update_pool(&updated).await {
            let mut tables = self.pools.write().unwrap();
            tables.external_subnets.insert(cidr);
            if let Some(pool) = tables.pools.get_mut(&pool_id) {
                pool.subnets
                    .push(ExternalSubnet { id: subnet_id, cidr });
                pool.total_ips += usable;
                pool.free += usable;
            }
            return Err(store_error(error));
        }

        Ok(())
    }

    /// Removes an individual address from a pool.  Fails while the address
    /// is mapped.
    pub async fn delete_external_ip(
        &self,
        pool_id: Uuid,
        address_id: Uuid,
    ) -> DeleteResult {
        let (address, updated) = {
            let mut tables = self.pools.write().unwrap();
            let pool = tables
                .pools
                .get(&pool_id)
                .ok_or_else(|| pool_not_found(&pool_id))?;
            let ip = pool
                .ips
                .iter()
                .find(|i| i.id == address_id)
                .ok_or_else(|| Error::forbidden("invalid pool address"))?;
            let address = ip.address;

            if tables.mapped_ips.contains_key(&address) {
                return Err(pool_not_empty());
            }

            let pool = tables.pools.get_mut(&pool_id).unwrap();
            pool.ips.retain(|i| i.id != address_id);
            pool.total_ips -= 1;
            pool.free -= 1;
            let updated = pool.clone();
            tables.external_ips.remove(&address);
            (address, updated)
        };

        if let Err(error) = self.store.update_pool(&updated).await {
            let mut tables = self.pools.write().unwrap();
            tables.external_ips.insert(address);
            if let Some(pool) = tables.pools.get_mut(&pool_id) {
                pool.ips.push(ExternalIp { id: address_id, address });
                pool.total_ips += 1;
                pool.free += 1;
            }
            return Err(store_error(error));
        }

        Ok(())
    }

    /// Returns the mapped external IPs, optionally restricted to one
    /// tenant.
    pub fn get_mapped_ips(&self, tenant_id: Option<&str>) -> Vec<MappedIp> {
        self.pools
            .read()
            .unwrap()
            .mapped_ips
            .values()
            .filter(|m| match tenant_id {
                Some(tenant) => m.tenant_id == tenant,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Returns the mapping for the given external address.
    pub fn get_mapped_ip(&self, address: Ipv4Addr) -> LookupResult<MappedIp> {
        self.pools
            .read()
            .unwrap()
            .mapped_ips
            .get(&address)
            .cloned()
            .ok_or_else(|| address_not_found(address))
    }

    /// Allocates an external IP from the given pool to an instance.
    ///
    /// Subnets are scanned in list order, host by host upward from the
    /// first address past the network address; individual pool addresses
    /// follow in list order.  The first unmapped address wins.
    pub async fn map_external_ip(
        &self,
        pool_id: Uuid,
        instance_id: Uuid,
    ) -> CreateResult<MappedIp> {
        let instance = self.get_instance(instance_id)?;
        let internal_ip = instance.ip_address.ok_or_else(|| {
            Error::forbidden("instance has no assigned address")
        })?;

        let (mapping, updated) = {
            let mut tables = self.pools.write().unwrap();
            let pool = tables
                .pools
                .get(&pool_id)
                .ok_or_else(|| pool_not_found(&pool_id))?;

            if pool.free == 0 {
                return Err(pool_empty());
            }

            let mut found: Option<Ipv4Addr> = None;
            'subnets: for subnet in &pool.subnets {
                /* Host addresses run from past the network address up to,
                 * excluding, the broadcast address. */
                let base = u32::from(subnet.cidr.network()) + 1;
                let broadcast = u32::from(subnet.cidr.broadcast());
                for addr in base..broadcast {
                    let addr = Ipv4Addr::from(addr);
                    if !tables.mapped_ips.contains_key(&addr) {
                        found = Some(addr);
                        break 'subnets;
                    }
                }
            }
            if found.is_none() {
                found = pool
                    .ips
                    .iter()
                    .map(|i| i.address)
                    .find(|a| !tables.mapped_ips.contains_key(a));
            }

            let Some(external_ip) = found else {
                /* The pool counter says there is room but no address was
                 * found: counter drift.  Surface it as an empty pool and
                 * leave repair to a future reconciler. */
                warn!(self.log, "pool reports free addresses but none found";
                    "pool_id" => %pool_id, "free" => pool.free);
                return Err(pool_empty());
            };

            let mapping = MappedIp {
                id: Uuid::new_v4(),
                external_ip,
                internal_ip,
                instance_id,
                tenant_id: instance.tenant_id.clone(),
                pool_id,
                pool_name: pool.name.clone(),
            };

            let pool = tables.pools.get_mut(&pool_id).unwrap();
            pool.free -= 1;
            let updated = pool.clone();
            tables.mapped_ips.insert(external_ip, mapping.clone());
            (mapping, updated)
        };

        /* Persist the mapping, then the pool, in that order. */
        let persisted = match self.store.add_mapped_ip(&mapping).await {
            Ok(()) => self.store.update_pool(&updated).await.map_err(|e| {
                (Some(mapping.id), e)
            }),
            Err(e) => Err((None, e)),
        };

        if let Err((mapped_row, error)) = persisted {
            if let Some(id) = mapped_row {
                let _ = self.store.delete_mapped_ip(id).await;
            }
            let mut tables = self.pools.write().unwrap();
            tables.mapped_ips.remove(&mapping.external_ip);
            if let Some(pool) = tables.pools.get_mut(&pool_id) {
                pool.free += 1;
            }
            return Err(store_error(error));
        }

        Ok(mapping)
    }

    /// Stops associating the given external address with an instance.
    pub async fn unmap_external_ip(&self, address: Ipv4Addr) -> DeleteResult {
        let (mapping, updated) = {
            let mut tables = self.pools.write().unwrap();
            let mapping = tables
                .mapped_ips
                .get(&address)
                .cloned()
                .ok_or_else(|| address_not_found(address))?;
            let pool = tables
                .pools
                .get_mut(&mapping.pool_id)
                .ok_or_else(|| pool_not_found(&mapping.pool_id))?;

            pool.free += 1;
            let updated = pool.clone();
            tables.mapped_ips.remove(&address);
            (mapping, updated)
        };

        if let Err(error) = self.store.delete_mapped_ip(mapping.id).await {
            let mut tables = self.pools.write().unwrap();
            if let Some(pool) = tables.pools.get_mut(&mapping.pool_id) {
                pool.free -= 1;
            }
            tables.mapped_ips.insert(address, mapping);
            return Err(store_error(error));
        }

        if let Err(error) = self.store.update_pool(&updated).await {
            warn!(self.log, "pool counter not persisted after unmap";
                "pool_id" => %updated.id, "error" => %error);
            return Err(store_error(error));
        }

        Ok(())
    }
}

/// Checks invariant: a pool's free counter always equals its capacity less
/// the mappings drawn from it.
#[cfg(test)]
pub(crate) fn check_free_counter(ds: &DataStore, pool_id: Uuid) {
    let tables = ds.pools.read().unwrap();
    let pool = tables.pools.get(&pool_id).unwrap();
    let mapped = tables
        .mapped_ips
        .values()
        .filter(|m| m.pool_id == pool_id)
        .count() as u32;
    assert_eq!(pool.free, pool.total_ips - mapped);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;
    use corral_common::api::external::InstanceState;
    use corral_common::api::external::TenantConfig;
    use corral_common::dev::test_setup_log;
    use std::collections::HashSet as StdHashSet;
    use std::sync::Arc;

    async fn test_datastore() -> DataStore {
        let log = test_setup_log("datastore_pool");
        DataStore::init(log, Arc::new(MemStore::new())).await.unwrap()
    }

    fn subnet(cidr: &str) -> Ipv4Network {
        cidr.parse().unwrap()
    }

    async fn instance_with_address(ds: &DataStore) -> Uuid {
        ds.add_tenant(
            "t1",
            TenantConfig { name: String::from("one"), subnet_bits: 24 },
        )
        .await
        .unwrap();
        let ip = ds.allocate_tenant_ip("t1").await.unwrap();

        let instance = corral_common::api::external::Instance {
            id: Uuid::new_v4(),
            tenant_id: String::from("t1"),
            workload_id: Uuid::new_v4(),
            name: String::from("web-0"),
            node_id: None,
            state: InstanceState::Running,
            ip_address: Some(ip),
            subnet: None,
            mac_address: String::from("02:00:de:ad:be:ef"),
            cnci: false,
            ssh_ip: None,
            ssh_port: None,
            create_time: chrono::Utc::now(),
        };
        let id = instance.id;
        ds.add_instance(instance).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_pool_admission() {
        let ds = test_datastore().await;

        let pool = Pool::new(
            String::from("external"),
            vec![subnet("10.0.0.0/30")],
            Vec::new(),
        );
        ds.add_pool(pool).await.unwrap();

        /* An overlapping subnet is rejected in either direction. */
        let overlapping = Pool::new(
            String::from("wider"),
            vec![subnet("10.0.0.0/29")],
            Vec::new(),
        );
        assert_eq!(
            ds.add_pool(overlapping).await.unwrap_err(),
            Error::already_exists(ResourceType::Subnet, "10.0.0.0/29")
        );

        /* An individual IP inside an existing pool subnet is rejected. */
        let contained = Pool::new(
            String::from("contained"),
            Vec::new(),
            vec!["10.0.0.2".parse().unwrap()],
        );
        assert_eq!(
            ds.add_pool(contained).await.unwrap_err(),
            Error::already_exists(ResourceType::ExternalIp, "10.0.0.2")
        );
    }

    #[tokio::test]
    async fn test_admission_commits_nothing_on_error() {
        let ds = test_datastore().await;
        ds.add_pool(Pool::new(
            String::from("a"),
            vec![subnet("10.1.0.0/24")],
            Vec::new(),
        ))
        .await
        .unwrap();

        let before: StdHashSet<Ipv4Network> =
            ds.pools.read().unwrap().external_subnets.iter().copied().collect();

        /* Second subnet collides; the first must not linger. */
        let partial = Pool::new(
            String::from("b"),
            vec![subnet("10.2.0.0/24"), subnet("10.1.0.0/28")],
            Vec::new(),
        );
        assert!(ds.add_pool(partial).await.is_err());

        let after: StdHashSet<Ipv4Network> =
            ds.pools.read().unwrap().external_subnets.iter().copied().collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_map_and_unmap() {
        let ds = test_datastore().await;
        let instance_id = instance_with_address(&ds).await;

        let pool = Pool::new(
            String::from("external"),
            vec![subnet("10.0.0.0/30")],
            Vec::new(),
        );
        let pool_id = pool.id;
        ds.add_pool(pool).await.unwrap();

        let mapping = ds.map_external_ip(pool_id, instance_id).await.unwrap();
        assert_eq!(mapping.external_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ds.get_pool(pool_id).unwrap().free, 1);
        check_free_counter(&ds, pool_id);

        ds.unmap_external_ip(mapping.external_ip).await.unwrap();
        assert_eq!(ds.get_pool(pool_id).unwrap().free, 2);
        check_free_counter(&ds, pool_id);
    }

    #[tokio::test]
    async fn test_mapping_prefers_subnets_then_individual_ips() {
        let ds = test_datastore().await;
        let instance_id = instance_with_address(&ds).await;

        let pool = Pool::new(
            String::from("external"),
            vec![subnet("10.0.0.0/30")],
            vec!["192.168.9.9".parse().unwrap()],
        );
        let pool_id = pool.id;
        ds.add_pool(pool).await.unwrap();

        let expected = ["10.0.0.1", "10.0.0.2", "192.168.9.9"];
        for want in expected {
            let mapping =
                ds.map_external_ip(pool_id, instance_id).await.unwrap();
            assert_eq!(mapping.external_ip, want.parse::<Ipv4Addr>().unwrap());
            check_free_counter(&ds, pool_id);
        }

        assert_eq!(
            ds.map_external_ip(pool_id, instance_id).await.unwrap_err(),
            Error::forbidden("pool is empty")
        );
    }

    #[tokio::test]
    async fn test_deletion_blocked_while_mapped() {
        let ds = test_datastore().await;
        let instance_id = instance_with_address(&ds).await;

        let pool = Pool::new(
            String::from("external"),
            vec![subnet("10.0.0.0/30")],
            Vec::new(),
        );
        let pool_id = pool.id;
        let subnet_id = pool.subnets[0].id;
        ds.add_pool(pool).await.unwrap();

        let mapping = ds.map_external_ip(pool_id, instance_id).await.unwrap();

        assert_eq!(
            ds.delete_subnet(pool_id, subnet_id).await.unwrap_err(),
            Error::forbidden("pool is not empty")
        );
        assert_eq!(
            ds.delete_pool(pool_id).await.unwrap_err(),
            Error::forbidden("pool is not empty")
        );

        ds.unmap_external_ip(mapping.external_ip).await.unwrap();
        ds.delete_subnet(pool_id, subnet_id).await.unwrap();
        ds.delete_pool(pool_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_admission_and_deletion_compose_to_identity() {
        let ds = test_datastore().await;

        let pool = Pool::new(
            String::from("external"),
            vec![subnet("10.0.0.0/24")],
            vec!["192.168.9.9".parse().unwrap()],
        );
        let pool_id = pool.id;
        ds.add_pool(pool).await.unwrap();
        ds.delete_pool(pool_id).await.unwrap();

        let tables = ds.pools.read().unwrap();
        assert!(tables.pools.is_empty());
        assert!(tables.external_subnets.is_empty());
        assert!(tables.external_ips.is_empty());
    }

    #[tokio::test]
    async fn test_subnet_too_small() {
        let ds = test_datastore().await;
        let pool =
            Pool::new(String::from("external"), Vec::new(), Vec::new());
        let pool_id = pool.id;
        ds.add_pool(pool).await.unwrap();

        assert!(ds
            .add_external_subnet(pool_id, subnet("10.0.0.1/32"))
            .await
            .is_err());
        assert!(ds
            .add_external_subnet(pool_id, subnet("10.0.0.0/31"))
            .await
            .is_err());
        ds.add_external_subnet(pool_id, subnet("10.0.0.0/30"))
            .await
            .unwrap();
        assert_eq!(ds.get_pool(pool_id).unwrap().total_ips, 2);
    }

    #[tokio::test]
    async fn test_add_external_ips_rejects_duplicates_in_input() {
        let ds = test_datastore().await;
        let pool =
            Pool::new(String::from("external"), Vec::new(), Vec::new());
        let pool_id = pool.id;
        ds.add_pool(pool).await.unwrap();

        let dup: Vec<Ipv4Addr> =
            vec!["10.2.0.1".parse().unwrap(), "10.2.0.1".parse().unwrap()];
        assert!(ds.add_external_ips(pool_id, &dup).await.is_err());
        assert_eq!(ds.get_pool(pool_id).unwrap().total_ips, 0);
    }
}

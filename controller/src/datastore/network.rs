// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tenant IP allocation
//!
//! Per-tenant IPv4 subnets are carved dynamically out of 172.16.0.0/12.
//! Octets 2-3 of a subnet's network address form its 16-bit key; the final
//! octet is the host byte.  Host bytes 0 and 1 are reserved for the network
//! and gateway addresses.  Allocation is deterministic: the lowest-numbered
//! subnet with space wins, then the lowest free host byte.

use super::store_error;
use super::tenant_not_found;
use super::DataStore;
use crate::store::IpClaim;
use corral_common::api::external::Error;
use corral_common::api::external::LookupResult;
use ipnetwork::Ipv4Network;
use slog::warn;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// First subnet key scanned for a tenant: 172.16.0.0.
const FIRST_SUBNET: [u8; 2] = [16, 0];
/// Last subnet key available: 172.31.255.0.
const LAST_SUBNET: [u8; 2] = [31, 255];

/// The 16-bit subnet key for a tenant subnet, taken from octets 2-3 of the
/// network address.
pub fn subnet_key(subnet: &Ipv4Network) -> u16 {
    let octets = subnet.network().octets();
    u16::from_be_bytes([octets[1], octets[2]])
}

/// The tenant subnet a 16-bit key denotes.
pub fn subnet_for_key(key: u16) -> Ipv4Network {
    let bytes = key.to_be_bytes();
    Ipv4Network::new(Ipv4Addr::new(172, bytes[0], bytes[1], 0), 24).unwrap()
}

/// Number of host addresses a tenant subnet offers.  The network, gateway
/// and broadcast addresses are deducted.
fn max_hosts(subnet_bits: u8) -> Result<usize, Error> {
    if subnet_bits >= 31 {
        return Err(Error::invalid_value(
            "subnet_bits",
            "tenant subnets must hold at least one host",
        ));
    }
    Ok((1usize << (32 - u32::from(subnet_bits))) - 3)
}

impl DataStore {
    /// Finds a free IP address within a tenant network, claiming it in the
    /// persistent store and making sure a concentrator is active for the
    /// chosen subnet before the address is returned.
    pub async fn allocate_tenant_ip(
        &self,
        tenant_id: &str,
    ) -> LookupResult<Ipv4Addr> {
        let (key, host, new_subnet) = {
            let mut tenants = self.tenants.write().unwrap();
            let state = tenants
                .get_mut(tenant_id)
                .ok_or_else(|| tenant_not_found(tenant_id))?;
            let max_hosts = max_hosts(state.tenant.subnet_bits)?;

            let mut subnets = state.subnets.clone();
            subnets.sort_unstable();
            let existing = subnets.into_iter().find(|k| {
                state.network.get(k).map_or(0, |hosts| hosts.len()) < max_hosts
            });

            let (key, new_subnet) = match existing {
                Some(key) => (key, false),
                None => {
                    let mut bytes = FIRST_SUBNET;
                    let key = loop {
                        let key = u16::from_be_bytes(bytes);
                        if !state.network.contains_key(&key) {
                            break key;
                        }
                        if bytes == LAST_SUBNET {
                            warn!(self.log, "out of subnets";
                                "tenant_id" => tenant_id);
                            return Err(Error::unavail("out of subnets"));
                        }
                        if bytes[1] == 255 {
                            bytes[0] += 1;
                            bytes[1] = 0;
                        } else {
                            bytes[1] += 1;
                        }
                    };
                    state.network.insert(key, BTreeSet::new());
                    state.subnets.push(key);
                    (key, true)
                }
            };

            let hosts = state.network.get_mut(&key).unwrap();
            let mut host = 2u8;
            let host = loop {
                if !hosts.contains(&host) {
                    hosts.insert(host);
                    break host;
                }
                if host == 255 {
                    warn!(self.log, "out of host numbers";
                        "tenant_id" => tenant_id, "subnet" => key);
                    return Err(Error::unavail("out of host numbers"));
                }
                host += 1;
            };

            (key, host, new_subnet)
        };

        if let Err(error) = self
            .store
            .claim_tenant_ip(tenant_id, IpClaim { subnet: key, host })
            .await
        {
            self.forget_allocation(tenant_id, key, host, new_subnet);
            return Err(store_error(error));
        }

        /* If the subnet already has a concentrator this confirms it is
         * active; a fresh subnet blocks here until the new concentrator
         * comes up.  An address on a subnet without a concentrator is
         * useless, so the slot is returned when the wait fails. */
        if let Some(mgr) = self.cnci_manager(tenant_id) {
            if let Err(error) = mgr.wait_for_active(key).await {
                self.forget_allocation(tenant_id, key, host, new_subnet);
                let _ = self
                    .store
                    .release_tenant_ip(
                        tenant_id,
                        IpClaim { subnet: key, host },
                    )
                    .await;
                return Err(error);
            }
        }

        let bytes = key.to_be_bytes();
        Ok(Ipv4Addr::new(172, bytes[0], bytes[1], host))
    }

    /// Undoes a cache-side allocation whose claim or concentrator wait
    /// failed.  The address was never handed out.
    fn forget_allocation(
        &self,
        tenant_id: &str,
        key: u16,
        host: u8,
        new_subnet: bool,
    ) {
        let mut tenants = self.tenants.write().unwrap();
        if let Some(state) = tenants.get_mut(tenant_id) {
            if let Some(hosts) = state.network.get_mut(&key) {
                hosts.remove(&host);
                if new_subnet && hosts.is_empty() {
                    state.network.remove(&key);
                    state.subnets.retain(|k| *k != key);
                }
            }
        }
    }

    /// Returns a previously allocated address to the tenant network.  When
    /// the last address of a subnet goes away the subnet itself is
    /// reclaimed and its concentrator is scheduled for lazy removal.
    pub async fn release_tenant_ip(
        &self,
        tenant_id: &str,
        ip: Ipv4Addr,
    ) -> Result<(), Error> {
        let octets = ip.octets();
        let key = u16::from_be_bytes([octets[1], octets[2]]);
        let host = octets[3];

        let mut removed_subnet = false;
        let mgr = {
            let mut tenants = self.tenants.write().unwrap();
            match tenants.get_mut(tenant_id) {
                Some(state) => {
                    if let Some(hosts) = state.network.get_mut(&key) {
                        hosts.remove(&host);
                        if hosts.is_empty() {
                            state.network.remove(&key);
                            state.subnets.retain(|k| *k != key);
                            removed_subnet = true;
                        }
                    }
                    state.cnci_mgr.clone()
                }
                None => None,
            }
        };

        if removed_subnet {
            if let Some(mgr) = mgr {
                if let Err(error) = mgr.schedule_remove_subnet(key) {
                    warn!(self.log, "unable to schedule subnet removal";
                        "tenant_id" => tenant_id,
                        "subnet" => key,
                        "error" => %error);
                }
            }
        }

        self.store
            .release_tenant_ip(tenant_id, IpClaim { subnet: key, host })
            .await
            .map_err(store_error)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;
    use corral_common::api::external::TenantConfig;
    use corral_common::dev::test_setup_log;
    use std::sync::Arc;

    async fn datastore_with_tenant(subnet_bits: u8) -> DataStore {
        let log = test_setup_log("datastore_network");
        let ds =
            DataStore::init(log, Arc::new(MemStore::new())).await.unwrap();
        ds.add_tenant(
            "t1",
            TenantConfig { name: String::from("one"), subnet_bits },
        )
        .await
        .unwrap();
        ds
    }

    #[test]
    fn test_subnet_key_round_trip() {
        let subnet: Ipv4Network = "172.16.4.0/24".parse().unwrap();
        let key = subnet_key(&subnet);
        assert_eq!(key, 0x1004);
        assert_eq!(subnet_for_key(key), subnet);
    }

    #[tokio::test]
    async fn test_allocation_is_deterministic() {
        let ds = datastore_with_tenant(24).await;

        let first = ds.allocate_tenant_ip("t1").await.unwrap();
        assert_eq!(first, Ipv4Addr::new(172, 16, 0, 2));
        let second = ds.allocate_tenant_ip("t1").await.unwrap();
        assert_eq!(second, Ipv4Addr::new(172, 16, 0, 3));

        /* Freed addresses are the first to be handed out again. */
        ds.release_tenant_ip("t1", first).await.unwrap();
        let third = ds.allocate_tenant_ip("t1").await.unwrap();
        assert_eq!(third, Ipv4Addr::new(172, 16, 0, 2));
    }

    #[tokio::test]
    async fn test_small_subnets_overflow_to_new_subnet() {
        /* subnet_bits 30 leaves exactly one usable host per subnet. */
        let ds = datastore_with_tenant(30).await;

        let first = ds.allocate_tenant_ip("t1").await.unwrap();
        assert_eq!(first, Ipv4Addr::new(172, 16, 0, 2));
        let second = ds.allocate_tenant_ip("t1").await.unwrap();
        assert_eq!(second, Ipv4Addr::new(172, 16, 1, 2));
    }

    #[tokio::test]
    async fn test_release_restores_pre_state() {
        let ds = datastore_with_tenant(24).await;

        let ip = ds.allocate_tenant_ip("t1").await.unwrap();
        ds.release_tenant_ip("t1", ip).await.unwrap();

        let tenants = ds.tenants.read().unwrap();
        let state = tenants.get("t1").unwrap();
        assert!(state.network.is_empty());
        assert!(state.subnets.is_empty());
    }

    #[tokio::test]
    async fn test_allocation_rejects_unknown_tenant() {
        let ds = datastore_with_tenant(24).await;
        assert!(ds.allocate_tenant_ip("nope").await.is_err());
    }
}

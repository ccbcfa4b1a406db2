// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-tenant concentrator lifecycle management
//!
//! Every tenant subnet needs exactly one live concentrator (CNCI) instance
//! before workloads on that subnet may run.  The manager launches
//! concentrators on demand, lets callers block until one is active,
//! reference-counts them against live instances through the datastore's
//! subnet reclamation, and tears them down lazily on a timer.
//!
//! Lifecycle events (`added`, `removed`, `start failure`, unsolicited stop)
//! arrive from the agent layer through the controller façade.  Waiters and
//! publishers meet on a `watch` channel per concentrator record: publishers
//! store the new phase under the lock, waiters block outside it with a
//! timeout.

use crate::datastore::subnet_for_key;
use async_trait::async_trait;
use corral_common::api::external::Error;
use corral_common::api::external::Instance;
use corral_common::api::external::InstanceState;
use corral_common::api::external::LookupResult;
use corral_common::api::external::ResourceType;
use corral_common::api::external::WorkloadRequest;
use rand::RngCore;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use uuid::Uuid;

/// How long a waiter blocks for a concentrator lifecycle event.
pub const CNCI_EVENT_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// How long an unused subnet keeps its concentrator before removal.
pub const REMOVE_SUBNET_DELAY: Duration = Duration::from_secs(5 * 60);

/// The façade operations the manager drives.  Implemented by
/// [`crate::app::Controller`]; held weakly to avoid keeping the controller
/// alive from its own tenants.
#[async_trait]
pub trait CnciOps: Send + Sync {
    /// Launches instances of a workload, returning them in pending state.
    async fn start_workload(
        &self,
        request: WorkloadRequest,
    ) -> Result<Vec<Instance>, Error>;

    /// Restarts an exited instance.
    async fn restart_instance(&self, instance_id: Uuid) -> Result<(), Error>;

    /// Tears an instance down.
    async fn delete_instance(&self, instance_id: Uuid) -> Result<(), Error>;

    /// Reflects a state change into the live instance record.
    fn transition_instance(
        &self,
        instance_id: Uuid,
        state: InstanceState,
    ) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CnciPhase {
    Launching,
    Active,
    Exited,
    Failed,
}

impl CnciPhase {
    fn instance_state(&self) -> InstanceState {
        match self {
            CnciPhase::Launching => InstanceState::Pending,
            CnciPhase::Active => InstanceState::Running,
            CnciPhase::Exited => InstanceState::Exited,
            CnciPhase::Failed => InstanceState::ExitFailed,
        }
    }
}

/// One concentrator, serving a single subnet.
struct Cnci {
    subnet: u16,
    /// Unset between the launch decision and the launch completing.
    instance: Option<Instance>,
    phase_tx: watch::Sender<CnciPhase>,
    remove_timer: Option<JoinHandle<()>>,
}

/// Both maps reference the same records; `by_subnet` carries records from
/// the launch decision on, `by_instance` only once the launch returned an
/// instance.
#[derive(Default)]
struct CnciMaps {
    by_subnet: HashMap<u16, Arc<Mutex<Cnci>>>,
    by_instance: HashMap<Uuid, Arc<Mutex<Cnci>>>,
}

/// Manages the concentrators of one tenant.
///
/// Lock discipline: the maps lock first, then at most one record lock.
/// Neither is ever held across an `.await`.
pub struct CnciManager {
    tenant_id: String,
    cnci_workload_id: Uuid,
    log: Logger,
    ops: Weak<dyn CnciOps>,
    maps: Mutex<CnciMaps>,
    event_timeout: Duration,
    remove_delay: Duration,
}

fn cnci_not_active() -> Error {
    Error::unavail("concentrator not active")
}

fn no_cnci(instance_id: Uuid) -> Error {
    Error::not_found_other(
        ResourceType::Instance,
        format!("no concentrator with instance id {}", instance_id),
    )
}

fn subnet_not_found(subnet: u16) -> Error {
    Error::not_found_other(
        ResourceType::Subnet,
        format!("no concentrator for subnet {}", subnet),
    )
}

enum WaitPlan {
    AlreadyActive,
    NotActive,
    Wait(watch::Receiver<CnciPhase>),
    Launch(Arc<Mutex<Cnci>>, watch::Receiver<CnciPhase>),
}

impl CnciManager {
    pub fn new(
        log: &Logger,
        tenant_id: &str,
        cnci_workload_id: Uuid,
        ops: Weak<dyn CnciOps>,
    ) -> Arc<CnciManager> {
        CnciManager::with_timeouts(
            log,
            tenant_id,
            cnci_workload_id,
            ops,
            CNCI_EVENT_TIMEOUT,
            REMOVE_SUBNET_DELAY,
        )
    }

    pub(crate) fn with_timeouts(
        log: &Logger,
        tenant_id: &str,
        cnci_workload_id: Uuid,
        ops: Weak<dyn CnciOps>,
        event_timeout: Duration,
        remove_delay: Duration,
    ) -> Arc<CnciManager> {
        Arc::new(CnciManager {
            tenant_id: tenant_id.to_owned(),
            cnci_workload_id,
            log: log.new(
                o!("component" => "CnciManager", "tenant_id" => tenant_id.to_owned()),
            ),
            ops,
            maps: Mutex::new(CnciMaps::default()),
            event_timeout,
            remove_delay,
        })
    }

    /// Repopulates the manager from concentrator instances that survived a
    /// controller restart.  `instances` pairs each concentrator with the
    /// number of live tenant instances on its subnet; subnets that no
    /// longer host anything are scheduled for removal.
    pub fn restore(
        self: &Arc<Self>,
        instances: Vec<(Instance, usize)>,
    ) -> Result<(), Error> {
        for (instance, live_count) in instances {
            let subnet = instance
                .subnet
                .map(|s| crate::datastore::subnet_key(&s))
                .ok_or_else(|| {
                    Error::internal_error("concentrator without subnet")
                })?;

            let phase = if instance.state == InstanceState::Running {
                CnciPhase::Active
            } else {
                CnciPhase::Exited
            };
            let (phase_tx, _) = watch::channel(phase);
            let record = Arc::new(Mutex::new(Cnci {
                subnet,
                instance: Some(instance.clone()),
                phase_tx,
                remove_timer: None,
            }));

            {
                let mut maps = self.maps.lock().unwrap();
                maps.by_instance.insert(instance.id, record.clone());
                maps.by_subnet.insert(subnet, record);
            }

            /* A shutdown may have raced subnet teardown; concentrators
             * without tenant instances go back on the removal clock. */
            if live_count == 0 {
                if let Err(error) = self.schedule_remove_subnet(subnet) {
                    warn!(self.log, "unable to schedule subnet removal";
                        "subnet" => subnet, "error" => %error);
                }
            }
        }

        Ok(())
    }

    fn ops(&self) -> Result<Arc<dyn CnciOps>, Error> {
        self.ops
            .upgrade()
            .ok_or_else(|| Error::unavail("controller is shutting down"))
    }

    /// Returns whether the concentrator with the given instance id has been
    /// launched successfully.
    pub fn active(&self, instance_id: Uuid) -> bool {
        let record = {
            let maps = self.maps.lock().unwrap();
            maps.by_instance.get(&instance_id).cloned()
        };
        match record {
            Some(record) => {
                let c = record.lock().unwrap();
                let is_active = *c.phase_tx.borrow() == CnciPhase::Active;
                is_active
            }
            None => false,
        }
    }

    /// Like [`CnciManager::wait_for_active`], keyed by the subnet CIDR.
    pub async fn wait_for_active_subnet(
        &self,
        subnet: &ipnetwork::Ipv4Network,
    ) -> Result<(), Error> {
        self.wait_for_active(crate::datastore::subnet_key(subnet)).await
    }

    /// Launches a concentrator for the subnet if none exists, then blocks
    /// until it is active.  A pending removal timer is cancelled: the
    /// subnet is clearly wanted again.
    pub async fn wait_for_active(&self, subnet: u16) -> Result<(), Error> {
        let plan = {
            let mut maps = self.maps.lock().unwrap();
            match maps.by_subnet.get(&subnet) {
                Some(record) => {
                    let mut c = record.lock().unwrap();
                    if let Some(timer) = c.remove_timer.take() {
                        timer.abort();
                    }
                    let plan = match *c.phase_tx.borrow() {
                        CnciPhase::Active => WaitPlan::AlreadyActive,
                        CnciPhase::Launching => {
                            WaitPlan::Wait(c.phase_tx.subscribe())
                        }
                        CnciPhase::Exited | CnciPhase::Failed => {
                            WaitPlan::NotActive
                        }
                    };
                    plan
                }
                None => {
                    let (phase_tx, phase_rx) =
                        watch::channel(CnciPhase::Launching);
                    let record = Arc::new(Mutex::new(Cnci {
                        subnet,
                        instance: None,
                        phase_tx,
                        remove_timer: None,
                    }));
                    maps.by_subnet.insert(subnet, record.clone());
                    WaitPlan::Launch(record, phase_rx)
                }
            }
        };

        match plan {
            WaitPlan::AlreadyActive => Ok(()),
            WaitPlan::NotActive => Err(cnci_not_active()),
            WaitPlan::Wait(rx) => self.wait_for_added(rx).await,
            WaitPlan::Launch(record, rx) => {
                info!(self.log, "launching concentrator"; "subnet" => subnet);

                match self.launch(subnet).await {
                    Ok(instance) => {
                        info!(self.log, "concentrator instance launched";
                            "subnet" => subnet,
                            "instance_id" => %instance.id);
                        let mut maps = self.maps.lock().unwrap();
                        maps.by_instance.insert(instance.id, record.clone());
                        record.lock().unwrap().instance = Some(instance);
                    }
                    Err(error) => {
                        /* Clear the record so the next allocation on this
                         * subnet launches afresh, and wake any concurrent
                         * waiters. */
                        let mut maps = self.maps.lock().unwrap();
                        maps.by_subnet.remove(&subnet);
                        let c = record.lock().unwrap();
                        c.phase_tx.send_replace(CnciPhase::Failed);
                        return Err(error);
                    }
                }

                self.wait_for_added(rx).await
            }
        }
    }

    async fn launch(&self, subnet: u16) -> Result<Instance, Error> {
        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);
        let mut name = format!("cnci-{}-", self.tenant_id);
        for byte in suffix {
            write!(name, "{:02x}", byte).unwrap();
        }

        let request = WorkloadRequest {
            workload_id: self.cnci_workload_id,
            tenant_id: self.tenant_id.clone(),
            instances: 1,
            subnet: Some(subnet_for_key(subnet)),
            name: Some(name),
            trace_label: None,
        };

        let mut instances =
            self.ops()?.start_workload(request).await.map_err(|error| {
                Error::unavail(&format!(
                    "failed to launch concentrator: {}",
                    error
                ))
            })?;

        instances.pop().ok_or_else(|| {
            Error::internal_error("concentrator launch returned no instance")
        })
    }

    /// Blocks until the launch concludes one way or the other.  A timed-out
    /// wait leaves the record behind; a later start-failure event cleans it
    /// up.
    async fn wait_for_added(
        &self,
        mut rx: watch::Receiver<CnciPhase>,
    ) -> Result<(), Error> {
        let waited = timeout(
            self.event_timeout,
            rx.wait_for(|phase| *phase != CnciPhase::Launching),
        )
        .await;

        match waited {
            Err(_) => Err(Error::unavail(
                "timeout waiting for concentrator to become active",
            )),
            Ok(Err(_)) => Err(cnci_not_active()),
            Ok(Ok(phase)) if *phase == CnciPhase::Active => Ok(()),
            Ok(Ok(_)) => Err(cnci_not_active()),
        }
    }

    fn record_for_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Arc<Mutex<Cnci>>, Error> {
        self.maps
            .lock()
            .unwrap()
            .by_instance
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| no_cnci(instance_id))
    }

    /// Applies a phase change to a record and fans it out to any waiter.
    fn transition(&self, record: &Arc<Mutex<Cnci>>, phase: CnciPhase) {
        let mut c = record.lock().unwrap();
        if let Some(instance) = &mut c.instance {
            info!(self.log, "concentrator state transition";
                "instance_id" => %instance.id,
                "state" => %phase.instance_state());
            instance.state = phase.instance_state();

            if let Ok(ops) = self.ops() {
                if let Err(error) = ops
                    .transition_instance(instance.id, phase.instance_state())
                {
                    warn!(self.log, "error transitioning concentrator instance";
                        "instance_id" => %instance.id, "error" => %error);
                }
            }
        }
        c.phase_tx.send_replace(phase);
    }

    /// Agent notification: the concentrator is up.  Duplicate events are
    /// idempotent.
    pub fn cnci_added(&self, instance_id: Uuid) -> Result<(), Error> {
        let record = self.record_for_instance(instance_id)?;
        self.transition(&record, CnciPhase::Active);
        Ok(())
    }

    /// Agent notification: the concentrator instance went away.
    pub fn cnci_removed(&self, instance_id: Uuid) -> Result<(), Error> {
        let record = self.record_for_instance(instance_id)?;
        self.transition(&record, CnciPhase::Exited);
        self.maps.lock().unwrap().by_instance.remove(&instance_id);
        Ok(())
    }

    /// Agent notification: the concentrator exited while its subnet still
    /// needs it.  Mark it exited and ask the façade to restart it.
    pub async fn cnci_stopped(&self, instance_id: Uuid) -> Result<(), Error> {
        let record = self.record_for_instance(instance_id)?;
        self.transition(&record, CnciPhase::Exited);
        self.ops()?.restart_instance(instance_id).await
    }

    /// Agent notification: the concentrator failed to start.  The record is
    /// dropped entirely so the next allocation re-launches, and any
    /// outstanding wait concludes with "not active".
    pub fn cnci_start_failure(&self, instance_id: Uuid) -> Result<(), Error> {
        let record = {
            let mut maps = self.maps.lock().unwrap();
            let record = maps
                .by_instance
                .remove(&instance_id)
                .ok_or_else(|| no_cnci(instance_id))?;
            let subnet = record.lock().unwrap().subnet;
            maps.by_subnet.remove(&subnet);
            record
        };
        self.transition(&record, CnciPhase::Failed);
        Ok(())
    }

    /// Kicks off a timer to remove a subnet's concentrator after the lazy
    /// teardown delay.  If the subnet is wanted again before the timer
    /// fires, [`CnciManager::wait_for_active`] cancels it.  Scheduling
    /// twice arms a single timer.
    pub fn schedule_remove_subnet(
        self: &Arc<Self>,
        subnet: u16,
    ) -> Result<(), Error> {
        let record = {
            let maps = self.maps.lock().unwrap();
            maps.by_subnet
                .get(&subnet)
                .cloned()
                .ok_or_else(|| subnet_not_found(subnet))?
        };

        let mut c = record.lock().unwrap();
        if c.remove_timer.is_some() {
            return Ok(());
        }

        let mgr = Arc::clone(self);
        c.remove_timer = Some(tokio::spawn(async move {
            sleep(mgr.remove_delay).await;

            /* Re-read the record: only proceed if the removal is still
             * scheduled.  wait_for_active may have raced us. */
            let proceed = {
                let record = {
                    let maps = mgr.maps.lock().unwrap();
                    maps.by_subnet.get(&subnet).cloned()
                };
                match record {
                    Some(record) => {
                        record.lock().unwrap().remove_timer.take().is_some()
                    }
                    None => false,
                }
            };

            if proceed {
                if let Err(error) = mgr.remove_subnet(subnet).await {
                    warn!(mgr.log, "unable to remove subnet";
                        "subnet" => subnet, "error" => %error);
                }
            }
        }));

        Ok(())
    }

    /// Tears down the concentrator of a subnet that is no longer needed,
    /// waiting for the agent to confirm the removal.
    pub async fn remove_subnet(&self, subnet: u16) -> Result<(), Error> {
        info!(self.log, "removing subnet"; "subnet" => subnet);

        let record = {
            let mut maps = self.maps.lock().unwrap();
            maps.by_subnet
                .remove(&subnet)
                .ok_or_else(|| subnet_not_found(subnet))?
        };

        let (instance_id, mut rx) = {
            let mut c = record.lock().unwrap();
            let instance = c.instance.as_mut().ok_or_else(|| {
                Error::internal_error("concentrator record has no instance")
            })?;
            instance.state = InstanceState::Stopping;
            (instance.id, c.phase_tx.subscribe())
        };

        let ops = self.ops()?;
        if let Err(error) =
            ops.transition_instance(instance_id, InstanceState::Stopping)
        {
            warn!(self.log, "error transitioning concentrator instance";
                "instance_id" => %instance_id, "error" => %error);
        }
        ops.delete_instance(instance_id).await?;

        let waited = timeout(
            self.event_timeout,
            rx.wait_for(|phase| {
                matches!(phase, CnciPhase::Exited | CnciPhase::Failed)
            }),
        )
        .await;

        match waited {
            Err(_) => Err(Error::unavail(
                "timeout waiting for concentrator removal",
            )),
            Ok(Err(_)) => Err(Error::unavail("concentrator manager shut down")),
            Ok(Ok(phase)) if *phase == CnciPhase::Exited => Ok(()),
            Ok(Ok(_)) => Err(cnci_not_active()),
        }
    }

    /// Returns the concentrator instance serving the given subnet.
    pub fn subnet_cnci(&self, subnet: u16) -> LookupResult<Instance> {
        let record = {
            let maps = self.maps.lock().unwrap();
            maps.by_subnet
                .get(&subnet)
                .cloned()
                .ok_or_else(|| subnet_not_found(subnet))?
        };
        let c = record.lock().unwrap();
        c.instance.clone().ok_or_else(|| subnet_not_found(subnet))
    }

    /// Cancels all pending removal timers in anticipation of a shutdown.
    /// In-flight waits are not cancelled; they complete or time out.
    pub fn shutdown(&self) {
        let maps = self.maps.lock().unwrap();
        for record in maps.by_subnet.values() {
            let mut c = record.lock().unwrap();
            if let Some(timer) = c.remove_timer.take() {
                timer.abort();
            }
        }
    }

    #[cfg(test)]
    fn remove_timer_armed(&self, subnet: u16) -> bool {
        let maps = self.maps.lock().unwrap();
        match maps.by_subnet.get(&subnet) {
            Some(record) => record.lock().unwrap().remove_timer.is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use corral_common::dev::test_setup_log;
    use std::sync::Mutex as StdMutex;

    struct FakeOps {
        fail_launch: bool,
        launched: StdMutex<Vec<Instance>>,
        deleted: StdMutex<Vec<Uuid>>,
        restarted: StdMutex<Vec<Uuid>>,
    }

    impl FakeOps {
        fn new(fail_launch: bool) -> Arc<FakeOps> {
            Arc::new(FakeOps {
                fail_launch,
                launched: StdMutex::new(Vec::new()),
                deleted: StdMutex::new(Vec::new()),
                restarted: StdMutex::new(Vec::new()),
            })
        }

        fn last_launched(&self) -> Option<Uuid> {
            self.launched.lock().unwrap().last().map(|i| i.id)
        }
    }

    #[async_trait]
    impl CnciOps for FakeOps {
        async fn start_workload(
            &self,
            request: WorkloadRequest,
        ) -> Result<Vec<Instance>, Error> {
            if self.fail_launch {
                return Err(Error::unavail("no network nodes"));
            }
            let instance = Instance {
                id: Uuid::new_v4(),
                tenant_id: request.tenant_id,
                workload_id: request.workload_id,
                name: request.name.unwrap_or_default(),
                node_id: None,
                state: InstanceState::Pending,
                ip_address: None,
                subnet: request.subnet,
                mac_address: String::from("02:00:de:ad:be:ef"),
                cnci: true,
                ssh_ip: None,
                ssh_port: None,
                create_time: Utc::now(),
            };
            self.launched.lock().unwrap().push(instance.clone());
            Ok(vec![instance])
        }

        async fn restart_instance(
            &self,
            instance_id: Uuid,
        ) -> Result<(), Error> {
            self.restarted.lock().unwrap().push(instance_id);
            Ok(())
        }

        async fn delete_instance(
            &self,
            instance_id: Uuid,
        ) -> Result<(), Error> {
            self.deleted.lock().unwrap().push(instance_id);
            Ok(())
        }

        fn transition_instance(
            &self,
            _instance_id: Uuid,
            _state: InstanceState,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    fn test_manager(
        ops: &Arc<FakeOps>,
        event_timeout: Duration,
        remove_delay: Duration,
    ) -> Arc<CnciManager> {
        let log = test_setup_log("cnci");
        let weak = Arc::downgrade(
            &(Arc::clone(ops) as Arc<dyn CnciOps>),
        );
        CnciManager::with_timeouts(
            &log,
            "t1",
            Uuid::new_v4(),
            weak,
            event_timeout,
            remove_delay,
        )
    }

    async fn launched_instance(ops: &Arc<FakeOps>) -> Uuid {
        loop {
            if let Some(id) = ops.last_launched() {
                return id;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_wait_blocks_until_added() {
        let ops = FakeOps::new(false);
        let mgr = test_manager(
            &ops,
            Duration::from_secs(5),
            REMOVE_SUBNET_DELAY,
        );

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.wait_for_active(0x1000).await })
        };

        let id = launched_instance(&ops).await;
        assert!(!waiter.is_finished());

        /* The added event may beat the waiter's bookkeeping; retry until
         * the record is registered. */
        while mgr.cnci_added(id).is_err() {
            sleep(Duration::from_millis(5)).await;
        }

        waiter.await.unwrap().unwrap();
        assert!(mgr.active(id));

        /* A second wait on the active subnet returns immediately. */
        mgr.wait_for_active(0x1000).await.unwrap();
        assert_eq!(ops.launched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_unblocks_and_clears_record() {
        let ops = FakeOps::new(false);
        let mgr = test_manager(
            &ops,
            Duration::from_secs(5),
            REMOVE_SUBNET_DELAY,
        );

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.wait_for_active(0x1000).await })
        };

        let id = launched_instance(&ops).await;
        while mgr.cnci_start_failure(id).is_err() {
            sleep(Duration::from_millis(5)).await;
        }

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), cnci_not_active());

        /* The record is gone; the next allocation launches afresh. */
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.wait_for_active(0x1000).await })
        };
        let second = launched_instance_after(&ops, id).await;
        while mgr.cnci_added(second).is_err() {
            sleep(Duration::from_millis(5)).await;
        }
        waiter.await.unwrap().unwrap();
        assert_eq!(ops.launched.lock().unwrap().len(), 2);
    }

    async fn launched_instance_after(ops: &Arc<FakeOps>, prev: Uuid) -> Uuid {
        loop {
            let id = ops.last_launched();
            if let Some(id) = id {
                if id != prev {
                    return id;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_failed_launch_propagates() {
        let ops = FakeOps::new(true);
        let mgr = test_manager(
            &ops,
            Duration::from_secs(5),
            REMOVE_SUBNET_DELAY,
        );

        assert!(mgr.wait_for_active(0x1000).await.is_err());
        /* No record lingers after a failed launch call. */
        assert!(mgr.subnet_cnci(0x1000).is_err());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let ops = FakeOps::new(false);
        let mgr = test_manager(
            &ops,
            Duration::from_millis(50),
            REMOVE_SUBNET_DELAY,
        );

        /* Nobody ever reports the concentrator up. */
        let result = mgr.wait_for_active(0x1000).await;
        assert_eq!(
            result.unwrap_err(),
            Error::unavail("timeout waiting for concentrator to become active")
        );
    }

    #[tokio::test]
    async fn test_schedule_remove_is_idempotent_and_cancellable() {
        let ops = FakeOps::new(false);
        let mgr = test_manager(
            &ops,
            Duration::from_secs(5),
            Duration::from_secs(60),
        );

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.wait_for_active(0x1000).await })
        };
        let id = launched_instance(&ops).await;
        while mgr.cnci_added(id).is_err() {
            sleep(Duration::from_millis(5)).await;
        }
        waiter.await.unwrap().unwrap();

        mgr.schedule_remove_subnet(0x1000).unwrap();
        mgr.schedule_remove_subnet(0x1000).unwrap();
        assert!(mgr.remove_timer_armed(0x1000));

        /* Asking for the subnet again cancels the pending removal. */
        mgr.wait_for_active(0x1000).await.unwrap();
        assert!(!mgr.remove_timer_armed(0x1000));
        assert!(ops.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_removal_tears_down_concentrator() {
        let ops = FakeOps::new(false);
        let mgr = test_manager(
            &ops,
            Duration::from_secs(5),
            Duration::from_millis(20),
        );

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.wait_for_active(0x1000).await })
        };
        let id = launched_instance(&ops).await;
        while mgr.cnci_added(id).is_err() {
            sleep(Duration::from_millis(5)).await;
        }
        waiter.await.unwrap().unwrap();

        mgr.schedule_remove_subnet(0x1000).unwrap();

        /* The timer fires, the instance is deleted, and the agent's
         * removed event concludes the teardown. */
        while ops.deleted.lock().unwrap().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
        mgr.cnci_removed(id).unwrap();

        while mgr.subnet_cnci(0x1000).is_ok() {
            sleep(Duration::from_millis(5)).await;
        }
        assert!(!mgr.active(id));
    }

    #[tokio::test]
    async fn test_stopped_concentrator_is_restarted() {
        let ops = FakeOps::new(false);
        let mgr = test_manager(
            &ops,
            Duration::from_secs(5),
            REMOVE_SUBNET_DELAY,
        );

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.wait_for_active(0x1000).await })
        };
        let id = launched_instance(&ops).await;
        while mgr.cnci_added(id).is_err() {
            sleep(Duration::from_millis(5)).await;
        }
        waiter.await.unwrap().unwrap();

        mgr.cnci_stopped(id).await.unwrap();
        assert_eq!(ops.restarted.lock().unwrap().as_slice(), &[id]);
        assert!(!mgr.active(id));
    }
}

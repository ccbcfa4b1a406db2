// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios driven through the controller façade with fake
//! agent, storage and quota collaborators.

use async_trait::async_trait;
use corral_common::api::external::BlockState;
use corral_common::api::external::Error;
use corral_common::api::external::FwType;
use corral_common::api::external::ImageState;
use corral_common::api::external::Instance;
use corral_common::api::external::MappedIp;
use corral_common::api::external::RequestedResource;
use corral_common::api::external::Resource;
use corral_common::api::external::TenantConfig;
use corral_common::api::external::Visibility;
use corral_common::api::external::VmType;
use corral_common::api::external::Workload;
use corral_common::api::external::WorkloadRequest;
use corral_common::api::internal::agent::StartFailureReason;
use corral_common::dev::test_setup_log;
use corral_controller::app::AgentClient;
use corral_controller::app::BlockDriver;
use corral_controller::app::Controller;
use corral_controller::app::ControllerConfig;
use corral_controller::app::ImageCreate;
use corral_controller::app::QuotaService;
use corral_controller::app::VolumeCreate;
use corral_controller::datastore::DataStore;
use corral_controller::store::MemStore;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tokio::time::timeout;
use uuid::Uuid;

#[derive(Default)]
struct FakeAgent {
    started: Mutex<Vec<Instance>>,
    deleted: Mutex<Vec<Uuid>>,
    assigned: Mutex<Vec<MappedIp>>,
    released: Mutex<Vec<MappedIp>>,
    evacuated: Mutex<Vec<String>>,
}

impl FakeAgent {
    fn started_cnci(&self) -> Option<Uuid> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.cnci)
            .map(|i| i.id)
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn start_instance(
        &self,
        instance: &Instance,
        _workload: &Workload,
    ) -> Result<(), Error> {
        self.started.lock().unwrap().push(instance.clone());
        Ok(())
    }

    async fn stop_instance(
        &self,
        _instance_id: Uuid,
        _node_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn restart_instance(
        &self,
        _instance: &Instance,
        _workload: &Workload,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn delete_instance(
        &self,
        instance_id: Uuid,
        _node_id: &str,
    ) -> Result<(), Error> {
        self.deleted.lock().unwrap().push(instance_id);
        Ok(())
    }

    async fn attach_volume(
        &self,
        _volume_id: Uuid,
        _instance_id: Uuid,
        _node_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn detach_volume(
        &self,
        _volume_id: Uuid,
        _instance_id: Uuid,
        _node_id: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn assign_external_ip(
        &self,
        mapping: &MappedIp,
    ) -> Result<(), Error> {
        self.assigned.lock().unwrap().push(mapping.clone());
        Ok(())
    }

    async fn release_external_ip(
        &self,
        mapping: &MappedIp,
    ) -> Result<(), Error> {
        self.released.lock().unwrap().push(mapping.clone());
        Ok(())
    }

    async fn evacuate_node(&self, node_id: &str) -> Result<(), Error> {
        self.evacuated.lock().unwrap().push(node_id.to_owned());
        Ok(())
    }

    async fn restore_node(&self, _node_id: &str) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeDriver;

#[async_trait]
impl BlockDriver for FakeDriver {
    async fn create_block_device(
        &self,
        volume_id: Option<Uuid>,
        _image_id: Option<Uuid>,
        _size_gb: u64,
    ) -> Result<Uuid, Error> {
        Ok(volume_id.unwrap_or_else(Uuid::new_v4))
    }

    async fn create_block_device_from_data(
        &self,
        _volume_id: Uuid,
        data: &[u8],
    ) -> Result<u64, Error> {
        Ok(data.len() as u64)
    }

    async fn create_block_device_snapshot(
        &self,
        _volume_id: Uuid,
        _name: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn delete_block_device_snapshot(
        &self,
        _volume_id: Uuid,
        _name: &str,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn delete_block_device(&self, _volume_id: Uuid) -> Result<(), Error> {
        Ok(())
    }

    async fn block_device_size(&self, _volume_id: Uuid) -> Result<u64, Error> {
        Ok(1)
    }
}

struct FakeQuotas {
    deny: bool,
    consumed: Mutex<usize>,
    released: Mutex<usize>,
}

impl FakeQuotas {
    fn new(deny: bool) -> FakeQuotas {
        FakeQuotas {
            deny,
            consumed: Mutex::new(0),
            released: Mutex::new(0),
        }
    }
}

#[async_trait]
impl QuotaService for FakeQuotas {
    async fn consume(
        &self,
        _tenant_id: &str,
        _resources: &[RequestedResource],
    ) -> bool {
        *self.consumed.lock().unwrap() += 1;
        !self.deny
    }

    async fn release(
        &self,
        _tenant_id: &str,
        _resources: &[RequestedResource],
    ) {
        *self.released.lock().unwrap() += 1;
    }
}

struct TestContext {
    controller: Arc<Controller>,
    agent: Arc<FakeAgent>,
    quotas: Arc<FakeQuotas>,
}

async fn test_context(test_name: &str, deny_quota: bool) -> TestContext {
    let log = test_setup_log(test_name);
    let ds = Arc::new(
        DataStore::init(log.clone(), Arc::new(MemStore::new()))
            .await
            .unwrap(),
    );

    let agent = Arc::new(FakeAgent::default());
    let quotas = Arc::new(FakeQuotas::new(deny_quota));
    let controller = Controller::new(
        &log,
        &ControllerConfig::default(),
        ds,
        agent.clone(),
        Arc::new(FakeDriver),
        quotas.clone(),
    )
    .unwrap();

    TestContext { controller, agent, quotas }
}

async fn create_tenant(ctx: &TestContext, subnet_bits: u8) -> String {
    let tenant = ctx
        .controller
        .create_tenant(
            None,
            TenantConfig { name: String::from("one"), subnet_bits },
        )
        .await
        .unwrap();
    tenant.id
}

async fn create_workload(ctx: &TestContext, tenant_id: &str) -> Workload {
    let workload = Workload {
        id: Uuid::nil(),
        tenant_id: String::new(),
        description: String::from("small VM"),
        vm_type: VmType::Qemu,
        fw_type: FwType::Efi,
        image_name: None,
        defaults: vec![
            RequestedResource::new(Resource::VCpus, 2, false),
            RequestedResource::new(Resource::MemMb, 512, false),
        ],
        storage: Vec::new(),
        config: String::from("#cloud-config\n"),
    };
    ctx.controller
        .create_workload(tenant_id, tenant_id, workload)
        .await
        .unwrap()
}

/// Polls `check` until it yields a value or five seconds pass.
async fn eventually<T, F: Fn() -> Option<T>>(check: F) -> T {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Launches one instance of the workload, acknowledging the concentrator
/// launch that the first allocation on a subnet triggers.
async fn launch_instance(
    ctx: &TestContext,
    tenant_id: &str,
    workload_id: Uuid,
) -> Instance {
    let launch = {
        let controller = Arc::clone(&ctx.controller);
        let request = WorkloadRequest {
            workload_id,
            tenant_id: tenant_id.to_owned(),
            instances: 1,
            subnet: None,
            name: None,
            trace_label: None,
        };
        tokio::spawn(async move { controller.start_workload(request).await })
    };

    /* If this launch needs a new concentrator, acknowledge it; the added
     * event is idempotent for concentrators already acknowledged. */
    while !launch.is_finished() {
        let cncis: Vec<Uuid> = ctx
            .agent
            .started
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.cnci)
            .map(|i| i.id)
            .collect();
        for cnci_id in cncis {
            let _ = ctx.controller.instance_added(cnci_id);
        }
        sleep(Duration::from_millis(5)).await;
    }

    let mut instances = launch.await.unwrap().unwrap();
    assert_eq!(instances.len(), 1);
    instances.pop().unwrap()
}

#[tokio::test]
async fn test_tenant_ip_lifecycle() {
    let ctx = test_context("tenant_ip_lifecycle", false).await;
    let tenant_id = create_tenant(&ctx, 24).await;
    let workload = create_workload(&ctx, &tenant_id).await;

    let first = launch_instance(&ctx, &tenant_id, workload.id).await;
    assert_eq!(first.ip_address, Some(Ipv4Addr::new(172, 16, 0, 2)));

    /* The subnet's concentrator is up; no second launch, next host byte. */
    let second = launch_instance(&ctx, &tenant_id, workload.id).await;
    assert_eq!(second.ip_address, Some(Ipv4Addr::new(172, 16, 0, 3)));
    let cncis = ctx
        .agent
        .started
        .lock()
        .unwrap()
        .iter()
        .filter(|i| i.cnci)
        .count();
    assert_eq!(cncis, 1);

    /* Releasing the first address makes it the next one handed out. */
    ctx.controller
        .delete_instance(&tenant_id, first.id)
        .await
        .unwrap();
    let third = launch_instance(&ctx, &tenant_id, workload.id).await;
    assert_eq!(third.ip_address, Some(Ipv4Addr::new(172, 16, 0, 2)));
}

#[tokio::test]
async fn test_subnet_overflow() {
    let ctx = test_context("subnet_overflow", false).await;
    /* subnet_bits 30 leaves exactly one usable host per subnet. */
    let tenant_id = create_tenant(&ctx, 30).await;
    let workload = create_workload(&ctx, &tenant_id).await;

    let first = launch_instance(&ctx, &tenant_id, workload.id).await;
    assert_eq!(first.ip_address, Some(Ipv4Addr::new(172, 16, 0, 2)));

    let second = launch_instance(&ctx, &tenant_id, workload.id).await;
    assert_eq!(second.ip_address, Some(Ipv4Addr::new(172, 16, 1, 2)));

    /* A fresh subnet means a second concentrator. */
    let cncis = ctx
        .agent
        .started
        .lock()
        .unwrap()
        .iter()
        .filter(|i| i.cnci)
        .count();
    assert_eq!(cncis, 2);
}

#[tokio::test]
async fn test_cnci_start_failure_unblocks_launch() {
    let ctx = test_context("cnci_start_failure", false).await;
    let tenant_id = create_tenant(&ctx, 24).await;
    let workload = create_workload(&ctx, &tenant_id).await;

    let launch = {
        let controller = Arc::clone(&ctx.controller);
        let request = WorkloadRequest {
            workload_id: workload.id,
            tenant_id: tenant_id.clone(),
            instances: 1,
            subnet: None,
            name: None,
            trace_label: None,
        };
        tokio::spawn(async move { controller.start_workload(request).await })
    };

    let cnci_id = eventually(|| ctx.agent.started_cnci()).await;
    loop {
        match ctx
            .controller
            .start_failure(cnci_id, StartFailureReason::LaunchFailure, false)
            .await
        {
            Ok(()) => break,
            Err(_) => sleep(Duration::from_millis(5)).await,
        }
    }

    let result = launch.await.unwrap();
    assert!(result.is_err());

    /* The record was cleared: the next allocation relaunches. */
    let instance = launch_instance(&ctx, &tenant_id, workload.id).await;
    assert_eq!(instance.ip_address, Some(Ipv4Addr::new(172, 16, 0, 2)));
}

#[tokio::test]
async fn test_workload_in_use() {
    let ctx = test_context("workload_in_use", false).await;
    let tenant_id = create_tenant(&ctx, 24).await;
    let workload = create_workload(&ctx, &tenant_id).await;

    let instance = launch_instance(&ctx, &tenant_id, workload.id).await;

    assert_eq!(
        ctx.controller
            .delete_workload(&tenant_id, &tenant_id, workload.id)
            .await
            .unwrap_err(),
        Error::forbidden("workload is in use")
    );

    ctx.controller
        .delete_instance(&tenant_id, instance.id)
        .await
        .unwrap();
    ctx.controller
        .delete_workload(&tenant_id, &tenant_id, workload.id)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_quota_denial_compensates() {
    let ctx = test_context("quota_denial", true).await;
    let tenant_id = create_tenant(&ctx, 24).await;
    let workload = create_workload(&ctx, &tenant_id).await;

    let request = WorkloadRequest {
        workload_id: workload.id,
        tenant_id: tenant_id.clone(),
        instances: 1,
        subnet: None,
        name: None,
        trace_label: None,
    };
    let result = ctx.controller.start_workload(request).await;
    assert_eq!(result.unwrap_err(), Error::forbidden("tenant over quota"));

    /* The speculative consumption was compensated. */
    assert_eq!(*ctx.quotas.consumed.lock().unwrap(), 1);
    assert_eq!(*ctx.quotas.released.lock().unwrap(), 1);
    assert!(ctx.agent.started.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_map_and_unmap_external_ip() {
    let ctx = test_context("map_unmap", false).await;
    let tenant_id = create_tenant(&ctx, 24).await;
    let workload = create_workload(&ctx, &tenant_id).await;
    let instance = launch_instance(&ctx, &tenant_id, workload.id).await;

    let pool = ctx
        .controller
        .create_pool("external", Some("10.0.0.0/30"), &[])
        .await
        .unwrap();
    assert_eq!(pool.free, 2);

    let mapping = ctx
        .controller
        .map_external_ip(&tenant_id, "external", instance.id)
        .await
        .unwrap();
    assert_eq!(mapping.external_ip, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(mapping.internal_ip, instance.ip_address.unwrap());
    assert_eq!(ctx.controller.get_pool(pool.id).unwrap().free, 1);
    assert_eq!(ctx.agent.assigned.lock().unwrap().len(), 1);

    ctx.controller
        .unmap_external_ip(&tenant_id, "10.0.0.1")
        .await
        .unwrap();
    assert_eq!(ctx.controller.get_pool(pool.id).unwrap().free, 2);
    assert_eq!(ctx.agent.released.lock().unwrap().len(), 1);

    /* Tenants cannot release other tenants' mappings. */
    let mapping = ctx
        .controller
        .map_external_ip(&tenant_id, "external", instance.id)
        .await
        .unwrap();
    assert!(ctx
        .controller
        .unmap_external_ip("other-tenant", &mapping.external_ip.to_string())
        .await
        .is_err());
}

#[tokio::test]
async fn test_image_lifecycle_and_visibility() {
    let ctx = test_context("image_lifecycle", false).await;

    let image = ctx
        .controller
        .create_image(
            "admin",
            ImageCreate {
                id: None,
                name: String::from("cirros"),
                visibility: Visibility::Private,
            },
        )
        .await
        .unwrap();
    assert_eq!(image.state, ImageState::Created);

    ctx.controller
        .upload_image("admin", image.id, b"not really a disk image")
        .await
        .unwrap();
    let uploaded = ctx.controller.get_image("admin", image.id).unwrap();
    assert_eq!(uploaded.state, ImageState::Active);
    assert!(uploaded.size > 0);

    /* Private images are invisible to other tenants. */
    assert!(ctx.controller.get_image("someone-else", image.id).is_err());
    assert!(ctx.controller.list_images("someone-else").is_empty());

    ctx.controller.delete_image("admin", image.id).await.unwrap();
    assert!(ctx.controller.get_image("admin", image.id).is_err());

    /* Malformed explicit ids are rejected. */
    assert!(ctx
        .controller
        .create_image(
            "admin",
            ImageCreate {
                id: Some(String::from("not-a-uuid")),
                name: String::from("bad"),
                visibility: Visibility::Private,
            },
        )
        .await
        .is_err());
}

#[tokio::test]
async fn test_volume_lifecycle() {
    let ctx = test_context("volume_lifecycle", false).await;
    let tenant_id = create_tenant(&ctx, 24).await;

    let volume = ctx
        .controller
        .create_volume(
            &tenant_id,
            VolumeCreate {
                name: String::from("data"),
                description: String::from("scratch space"),
                size_gb: 20,
                source_image: None,
                bootable: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(volume.state, BlockState::Available);

    assert_eq!(
        ctx.controller.list_volumes(&tenant_id).unwrap().len(),
        1
    );

    /* Another tenant cannot delete it. */
    assert!(ctx
        .controller
        .delete_volume("other-tenant", volume.id)
        .await
        .is_err());

    ctx.controller.delete_volume(&tenant_id, volume.id).await.unwrap();
    assert!(ctx.controller.list_volumes(&tenant_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_subnet_removal_confirms_through_controller() {
    let ctx = test_context("subnet_removal", false).await;
    let tenant_id = create_tenant(&ctx, 24).await;
    let workload = create_workload(&ctx, &tenant_id).await;
    let instance = launch_instance(&ctx, &tenant_id, workload.id).await;
    let cnci_id = ctx.agent.started_cnci().unwrap();

    /* Deleting the only instance empties the subnet.  Tear the
     * concentrator down directly rather than on the lazy timer. */
    ctx.controller
        .delete_instance(&tenant_id, instance.id)
        .await
        .unwrap();
    let manager = ctx
        .controller
        .datastore()
        .cnci_manager(&tenant_id)
        .unwrap();

    let removal = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.remove_subnet(0x1000).await })
    };

    /* The teardown deletes the concentrator from the datastore before
     * the agent confirms; the removed event must still find the
     * manager and conclude the removal. */
    eventually(|| {
        ctx.controller
            .datastore()
            .get_instance(cnci_id)
            .is_err()
            .then_some(())
    })
    .await;
    ctx.controller.instance_removed(cnci_id).await.unwrap();

    removal.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_evacuate_node() {
    let ctx = test_context("evacuate_node", false).await;
    ctx.controller.node_connected("node-1", Resource::ComputeNode);

    ctx.controller.evacuate_node("node-1");
    let evacuated = eventually(|| {
        ctx.agent.evacuated.lock().unwrap().first().cloned()
    })
    .await;
    assert_eq!(evacuated, "node-1");
}

//! Master lifecycle: discovery, boot milestones, reset semantics and the
//! pre-reset table hooks

mod utils;

use std::sync::{Arc, Mutex};

use canmotion_common::nmt::{NmtCommand, NmtState};
use canmotion_common::objects::{index, ObjectValue};
use canmotion_common::sdo::SdoError;
use canmotion_common::ObjectDictionary;
use canmotion_master::{
    ClearConfigurationStrategy, ErrorCallback, GenericDriver, Master, MasterHandle, NodeDriver,
};
use futures::FutureExt;
use integration_tests::loader::MapLoader;
use integration_tests::sim_bus::SimBus;
use utils::*;

fn boot_log_master(
    bus: &Arc<SimBus>,
    master_od: ObjectDictionary,
    loader: Arc<MapLoader>,
    errors: Option<ErrorCallback>,
) -> (MasterHandle, Arc<Mutex<Vec<u8>>>) {
    init_logging();
    let boots: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let boot_sink = boots.clone();

    let mut master = Master::new(bus.clone(), master_od, loader);
    if let Some(errors) = errors {
        master.set_driver_factory(Box::new(move |config| {
            let mut driver = GenericDriver::new(config);
            driver.set_error_callback(errors.clone());
            Box::new(driver) as Box<dyn NodeDriver<SimBus>>
        }));
    }
    master.configure_drivers().unwrap();
    master.set_boot_completed_callback(Box::new(move |node| {
        boot_sink.lock().unwrap().push(node);
    }));
    let (handle, _task) = master.start();
    (handle, boots)
}

fn empty_loader_for(nodes: &[u8]) -> Arc<MapLoader> {
    let loader = Arc::new(MapLoader::new());
    for &node in nodes {
        loader.insert(&description_path(node), ObjectDictionary::new());
    }
    loader
}

#[tokio::test]
async fn test_boot_milestone_fires_once() {
    let bus = Arc::new(SimBus::new());
    let (handle, boots) = boot_log_master(
        &bus,
        master_od_with_textual(&[2, 3]),
        empty_loader_for(&[2, 3]),
        None,
    );

    handle.on_boot(2, NmtState::Operational, None, "");
    wait_for("first boot", || boots.lock().unwrap().len() == 1).await;
    handle.on_boot(3, NmtState::Operational, None, "");
    wait_for("milestone", || boots.lock().unwrap().ends_with(&[0])).await;
    assert_eq!(vec![2, 3, 0], *boots.lock().unwrap());

    // A duplicate boot report fires the per-node callback only
    handle.on_boot(3, NmtState::Operational, None, "");
    wait_for("duplicate boot", || boots.lock().unwrap().len() == 4).await;
    assert_eq!(vec![2, 3, 0, 3], *boots.lock().unwrap());
}

#[tokio::test]
async fn test_boot_milestone_with_zero_slaves() {
    let bus = Arc::new(SimBus::new());
    let (handle, boots) = boot_log_master(
        &bus,
        ObjectDictionary::new(),
        Arc::new(MapLoader::new()),
        None,
    );

    // No slave entries at all: the first boot pump reports completion
    handle.on_boot(7, NmtState::Operational, None, "");
    wait_for("milestone", || boots.lock().unwrap().ends_with(&[0])).await;
    assert_eq!(vec![7, 0], *boots.lock().unwrap());
}

#[tokio::test]
async fn test_boot_errors_reported_and_not_counted() {
    let bus = Arc::new(SimBus::new());
    let (errors, log) = error_collector();
    let (handle, boots) = boot_log_master(
        &bus,
        master_od_with_textual(&[2, 3]),
        empty_loader_for(&[2, 3]),
        Some(errors),
    );

    // 'B' is the CiA-302 "slave does not exist" status
    handle.on_boot(2, NmtState::Stopped, Some('B'), "no response");
    wait_for("node missing error", || {
        log.lock().unwrap().iter().any(|(code, _)| *code == 0xAF04)
    })
    .await;

    handle.on_boot(3, NmtState::Stopped, Some('C'), "wrong device type");
    wait_for("boot failed error", || {
        log.lock().unwrap().iter().any(|(code, _)| *code == 0xAF02)
    })
    .await;

    // Neither failure emptied the pending set
    assert!(!boots.lock().unwrap().contains(&0));
}

#[tokio::test]
async fn test_reset_refills_pending_boots() {
    let bus = Arc::new(SimBus::new());
    let (handle, boots) = boot_log_master(
        &bus,
        master_od_with_textual(&[2, 3]),
        empty_loader_for(&[2, 3]),
        None,
    );

    handle.on_boot(2, NmtState::Operational, None, "");
    handle.on_boot(3, NmtState::Operational, None, "");
    wait_for("first milestone", || boots.lock().unwrap().ends_with(&[0])).await;

    handle.reset();
    wait_for("broadcast reset", || {
        bus.nmt_count(NmtCommand::ResetNode, 0) == 1
    })
    .await;

    handle.on_boot(2, NmtState::Operational, None, "");
    handle.on_boot(3, NmtState::Operational, None, "");
    wait_for("second milestone", || {
        boots.lock().unwrap().iter().filter(|&&n| n == 0).count() == 2
    })
    .await;
}

#[tokio::test]
async fn test_reset_comm_blanks_upload_tables() {
    let bus = Arc::new(SimBus::new());
    let loader = empty_loader_for(&[2, 3]);

    let mut master = Master::new(bus.clone(), master_od_with_textual(&[2, 3]), loader);
    master.set_driver_factory(Box::new(|config| {
        let node = config.node.raw();
        let mut driver = GenericDriver::new(config);
        if node == 3 {
            let strategy: ClearConfigurationStrategy =
                Arc::new(|| async { Ok::<(), SdoError>(()) }.boxed());
            driver.set_clear_configuration_strategy(strategy);
        }
        Box::new(driver) as Box<dyn NodeDriver<SimBus>>
    }));
    master.configure_drivers().unwrap();
    let (handle, _task) = master.start();

    handle.on_nmt_command(NmtCommand::ResetComm);
    wait_for("textual table blanked", || {
        handle.master_object(index::SLAVE_DCF_TABLE, 2)
            == Some(ObjectValue::VisibleString(String::new()))
            && handle.master_object(index::SLAVE_DCF_TABLE, 3)
                == Some(ObjectValue::VisibleString(String::new()))
    })
    .await;

    // The binary table is only blanked for the driver with a custom clear
    // strategy, which then owns the download itself
    assert_eq!(
        Some(ObjectValue::VisibleString(String::new())),
        handle.master_object(index::SLAVE_CONCISE_DCF_TABLE, 3)
    );
    assert_eq!(None, handle.master_object(index::SLAVE_CONCISE_DCF_TABLE, 2));
}

#[tokio::test]
async fn test_software_file_lookup() {
    let bus = Arc::new(SimBus::new());
    let mut master_od = ObjectDictionary::new();
    master_od.set(
        index::SLAVE_SOFTWARE_TABLE,
        3,
        ObjectValue::VisibleString("firmware-v8.47.bin".into()),
    );

    let master = Master::new(bus, master_od, Arc::new(MapLoader::new()));
    assert_eq!(
        Some("firmware-v8.47.bin".to_owned()),
        master.software_file_for_slave(3)
    );
    assert_eq!(None, master.software_file_for_slave(4));

    let (handle, _task) = master.start();
    assert_eq!(
        Some("firmware-v8.47.bin".to_owned()),
        handle.software_file_for_slave(3)
    );
}

#[tokio::test]
async fn test_configuration_callbacks() {
    let bus = Arc::new(SimBus::new());
    let loader = empty_loader_for(&[2, 3]);

    let loads: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let configs: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    let mut master = Master::new(bus.clone(), master_od_with_textual(&[2, 3]), loader);
    let load_sink = loads.clone();
    master.set_load_config_started_callback(Box::new(move |node| {
        load_sink.lock().unwrap().push(node);
    }));
    let config_sink = configs.clone();
    master.set_node_config_started_callback(Box::new(move |node| {
        config_sink.lock().unwrap().push(node);
    }));

    master.configure_drivers().unwrap();
    assert_eq!(vec![2, 3], *loads.lock().unwrap());

    let (handle, _task) = master.start();
    handle.configure_all().await.unwrap();
    assert_eq!(vec![2, 3], *configs.lock().unwrap());
}

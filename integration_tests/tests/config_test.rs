//! Configuration-engine scenarios against the simulated bus

mod utils;

use std::sync::Arc;

use canmotion_common::objects::{index, ObjectValue};
use canmotion_common::sdo::SdoError;
use canmotion_common::ObjectDictionary;
use canmotion_master::{
    ClearConfigurationStrategy, ConfigError, GenericDriver, Master, MasterHandle, NodeDriver,
};
use futures::FutureExt;
use integration_tests::loader::MapLoader;
use integration_tests::sim_bus::{BusOp, SimBus};
use utils::*;

fn start_master(
    bus: &Arc<SimBus>,
    master_od: ObjectDictionary,
    loader: Arc<MapLoader>,
) -> MasterHandle {
    init_logging();
    let mut master = Master::new(bus.clone(), master_od, loader);
    master.configure_drivers().unwrap();
    let (handle, _task) = master.start();
    handle
}

fn start_master_with_clear(
    bus: &Arc<SimBus>,
    master_od: ObjectDictionary,
    loader: Arc<MapLoader>,
    strategy: ClearConfigurationStrategy,
) -> MasterHandle {
    let mut master = Master::new(bus.clone(), master_od, loader);
    master.set_driver_factory(Box::new(move |config| {
        let mut driver = GenericDriver::new(config);
        driver.set_clear_configuration_strategy(strategy.clone());
        Box::new(driver) as Box<dyn NodeDriver<SimBus>>
    }));
    master.configure_drivers().unwrap();
    let (handle, _task) = master.start();
    handle
}

#[tokio::test]
async fn test_pdo_activation_sequence() {
    const NODE: u8 = 5;
    let bus = Arc::new(SimBus::new());
    bus.set_remote(NODE, 0x1400, 1, le32(0x0000_0205));

    let loader = Arc::new(MapLoader::new());
    loader.insert_toml(
        &description_path(NODE),
        r#"
        [[object]]
        index = 0x1400
        sub = 1
        type = "u32"
        value = 0x205

        [[object]]
        index = 0x1400
        sub = 2
        type = "u8"
        value = 254

        [[object]]
        index = 0x1600
        sub = 0
        type = "u8"
        value = 2

        [[object]]
        index = 0x1600
        sub = 1
        type = "u32"
        value = 0x60410010

        [[object]]
        index = 0x1600
        sub = 2
        type = "u32"
        value = 0x60640020

        [[object]]
        index = 0x6083
        sub = 0
        type = "u32"
        value = 1000
        "#,
    );

    let handle = start_master(&bus, master_od_with_textual(&[NODE]), loader);
    handle
        .on_config(NODE)
        .await
        .unwrap()
        .expect("configuration should succeed");

    let expected = vec![
        BusOp::Upload { node: NODE, object: 0x1400, sub: 1 },
        BusOp::Download { node: NODE, object: 0x1400, sub: 1, data: le32(0x8000_0205) },
        BusOp::Download { node: NODE, object: 0x1400, sub: 2, data: leu8(254) },
        // No inhibit time in the description: 0x1400:3 is skipped entirely
        BusOp::Download { node: NODE, object: 0x1600, sub: 0, data: leu8(0) },
        BusOp::Download { node: NODE, object: 0x1600, sub: 1, data: le32(0x6041_0010) },
        BusOp::Download { node: NODE, object: 0x1600, sub: 2, data: le32(0x6064_0020) },
        BusOp::Download { node: NODE, object: 0x1600, sub: 0, data: leu8(2) },
        BusOp::Download { node: NODE, object: 0x1400, sub: 1, data: le32(0x0000_0205) },
        BusOp::Download { node: NODE, object: 0x6083, sub: 0, data: le32(1000) },
    ];
    assert_eq!(expected, bus.sdo_ops_for(NODE));

    // The PDO ends up enabled: valid bit (bit 31) clear on the device
    assert_eq!(Some(le32(0x0000_0205)), bus.remote_value(NODE, 0x1400, 1));
}

#[tokio::test]
async fn test_inhibit_time_copied_when_present() {
    const NODE: u8 = 5;
    let bus = Arc::new(SimBus::new());
    bus.set_remote(NODE, 0x1400, 1, le32(0x0000_0205));

    let loader = Arc::new(MapLoader::new());
    let mut od = ObjectDictionary::new();
    od.set(0x1400, 1, ObjectValue::U32(0x205));
    od.set(0x1400, 2, ObjectValue::U8(254));
    od.set(0x1400, 3, ObjectValue::U16(100));
    loader.insert(&description_path(NODE), od);

    let handle = start_master(&bus, master_od_with_textual(&[NODE]), loader);
    handle.on_config(NODE).await.unwrap().unwrap();

    assert!(bus.has_download(NODE, 0x1400, 3, &le16(100)));
}

#[tokio::test]
async fn test_mapping_count_zero_still_committed() {
    const NODE: u8 = 5;
    let bus = Arc::new(SimBus::new());
    bus.set_remote(NODE, 0x1400, 1, le32(0x0000_0205));

    let loader = Arc::new(MapLoader::new());
    let mut od = ObjectDictionary::new();
    od.set(0x1400, 1, ObjectValue::U32(0x205));
    od.set(0x1400, 2, ObjectValue::U8(254));
    od.set(0x1600, 0, ObjectValue::U8(0));
    loader.insert(&description_path(NODE), od);

    let handle = start_master(&bus, master_od_with_textual(&[NODE]), loader);
    handle.on_config(NODE).await.unwrap().unwrap();

    // The count is cleared for the rewrite and then committed from the local
    // dictionary, with no mapping entries in between
    assert_eq!(2, bus.download_data_count(NODE, 0x1600, 0, &leu8(0)));
    assert_eq!(0, bus.download_count(NODE, 0x1600, 1));
}

#[tokio::test]
async fn test_empty_config_produces_no_traffic() {
    const NODE: u8 = 6;
    let bus = Arc::new(SimBus::new());
    let loader = Arc::new(MapLoader::new());
    loader.insert(&description_path(NODE), ObjectDictionary::new());

    let handle = start_master(&bus, master_od_with_textual(&[NODE]), loader);
    handle.on_config(NODE).await.unwrap().unwrap();

    assert!(bus.sdo_ops_for(NODE).is_empty());
}

#[tokio::test]
async fn test_unsupported_parameter_type_aborts() {
    const NODE: u8 = 7;
    let bus = Arc::new(SimBus::new());
    let loader = Arc::new(MapLoader::new());
    let mut od = ObjectDictionary::new();
    od.set(0x2000, 0, ObjectValue::VisibleString("bad".into()));
    od.set(0x6083, 0, ObjectValue::U32(1000));
    loader.insert(&description_path(NODE), od);

    let handle = start_master(&bus, master_od_with_textual(&[NODE]), loader);
    let error = handle
        .on_config(NODE)
        .await
        .unwrap()
        .expect_err("string parameters cannot be transferred");

    match error {
        ConfigError::WriteRemote { index: 0x2000, sub: 0, source } => {
            assert_eq!(Some(0x0607_0010), source.abort_code());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // Processing stopped before anything was written
    assert!(bus.sdo_ops_for(NODE).is_empty());
}

#[tokio::test]
async fn test_first_error_aborts_configuration() {
    const NODE: u8 = 8;
    let bus = Arc::new(SimBus::new());
    bus.set_remote(NODE, 0x1400, 1, le32(0x0000_0208));
    bus.fail_download(
        NODE,
        0x1400,
        2,
        canmotion_common::sdo::AbortCode::ReadOnly,
    );

    let loader = Arc::new(MapLoader::new());
    let mut od = ObjectDictionary::new();
    od.set(0x1400, 1, ObjectValue::U32(0x208));
    od.set(0x1400, 2, ObjectValue::U8(254));
    od.set(0x6083, 0, ObjectValue::U32(1000));
    loader.insert(&description_path(NODE), od);

    let handle = start_master(&bus, master_od_with_textual(&[NODE]), loader);
    let error = handle.on_config(NODE).await.unwrap().expect_err("download fails");

    assert!(matches!(
        error,
        ConfigError::WriteRemote { index: 0x1400, sub: 2, .. }
    ));
    // The PDO was never re-enabled and the parameter was never pushed
    assert_eq!(1, bus.download_count(NODE, 0x1400, 1));
    assert_eq!(0, bus.download_count(NODE, 0x6083, 0));
}

#[tokio::test]
async fn test_primitive_types_round_trip_through_configuration() {
    const NODE: u8 = 9;
    let bus = Arc::new(SimBus::new());
    let loader = Arc::new(MapLoader::new());

    let values = [
        (0x2000u16, ObjectValue::Bool(true)),
        (0x2001, ObjectValue::I8(-5)),
        (0x2002, ObjectValue::I16(-30000)),
        (0x2003, ObjectValue::I32(-100000)),
        (0x2004, ObjectValue::U8(0xAB)),
        (0x2005, ObjectValue::U16(0xBEEF)),
        (0x2006, ObjectValue::U32(0xDEAD_BEEF)),
    ];
    let mut od = ObjectDictionary::new();
    for (object, value) in &values {
        od.set(*object, 0, value.clone());
    }
    loader.insert(&description_path(NODE), od);

    let handle = start_master(&bus, master_od_with_textual(&[NODE]), loader);
    handle.on_config(NODE).await.unwrap().unwrap();

    for (object, value) in values {
        let remote = bus.remote_value(NODE, object, 0).unwrap();
        let decoded = ObjectValue::from_le_bytes(value.type_code(), &remote).unwrap();
        assert_eq!(value, decoded, "object 0x{object:04X}");
    }
}

#[tokio::test]
async fn test_clear_configuration_canceled_skips_everything() {
    const NODE: u8 = 10;
    let bus = Arc::new(SimBus::new());
    let loader = Arc::new(MapLoader::new());
    let mut od = ObjectDictionary::new();
    od.set(0x6083, 0, ObjectValue::U32(1000));
    loader.insert(&description_path(NODE), od);

    let strategy: ClearConfigurationStrategy =
        Arc::new(|| async { Err::<(), SdoError>(SdoError::Canceled) }.boxed());
    let handle = start_master_with_clear(&bus, master_od_with_textual(&[NODE]), loader, strategy);

    handle
        .on_config(NODE)
        .await
        .unwrap()
        .expect("canceled clear completes the configuration successfully");
    assert!(bus.sdo_ops_for(NODE).is_empty());
    assert!(bus.dcf_downloads().is_empty());
}

#[tokio::test]
async fn test_clear_configuration_error_surfaces() {
    const NODE: u8 = 10;
    let bus = Arc::new(SimBus::new());
    let loader = Arc::new(MapLoader::new());
    let mut od = ObjectDictionary::new();
    od.set(0x6083, 0, ObjectValue::U32(1000));
    loader.insert(&description_path(NODE), od);

    let strategy: ClearConfigurationStrategy = Arc::new(|| {
        async {
            Err::<(), SdoError>(SdoError::abort(
                canmotion_common::sdo::AbortCode::HardwareError,
            ))
        }
        .boxed()
    });
    let handle = start_master_with_clear(&bus, master_od_with_textual(&[NODE]), loader, strategy);

    let error = handle.on_config(NODE).await.unwrap().expect_err("clear fails");
    assert!(matches!(error, ConfigError::ClearConfiguration { .. }));
    assert!(bus.sdo_ops_for(NODE).is_empty());
}

#[tokio::test]
async fn test_binary_dcf_downloaded_after_clear_and_config() {
    const NODE: u8 = 11;
    let bus = Arc::new(SimBus::new());
    let loader = Arc::new(MapLoader::new());

    let mut master_od = ObjectDictionary::new();
    master_od.set(
        index::SLAVE_CONCISE_DCF_TABLE,
        NODE,
        ObjectValue::VisibleString("node11.bin".into()),
    );

    let strategy: ClearConfigurationStrategy =
        Arc::new(|| async { Ok::<(), SdoError>(()) }.boxed());
    let handle = start_master_with_clear(&bus, master_od, loader, strategy);

    handle.on_config(NODE).await.unwrap().unwrap();
    assert_eq!(vec![(NODE, "node11.bin".to_owned())], bus.dcf_downloads());
}

#[tokio::test]
async fn test_binary_dcf_left_to_the_stack_without_clear_strategy() {
    const NODE: u8 = 12;
    let bus = Arc::new(SimBus::new());
    let loader = Arc::new(MapLoader::new());

    let mut master_od = ObjectDictionary::new();
    master_od.set(
        index::SLAVE_CONCISE_DCF_TABLE,
        NODE,
        ObjectValue::VisibleString("node12.bin".into()),
    );

    let handle = start_master(&bus, master_od, loader);
    handle.on_config(NODE).await.unwrap().unwrap();

    // Without a custom clear strategy the bus stack performs the automatic
    // download itself; the engine must not issue a second one
    assert!(bus.dcf_downloads().is_empty());
}

#[tokio::test]
async fn test_description_types_survive_the_loader() {
    // The loader path exercised end to end: declared types drive the wire
    // encoding widths
    const NODE: u8 = 13;
    let bus = Arc::new(SimBus::new());
    let loader = Arc::new(MapLoader::new());
    loader.insert_toml(
        &description_path(NODE),
        r#"
        [[object]]
        index = 0x6060
        sub = 0
        type = "i8"
        value = 1

        [[object]]
        index = 0x6081
        sub = 0
        type = "u32"
        value = 20000
        "#,
    );

    let handle = start_master(&bus, master_od_with_textual(&[NODE]), loader);
    handle.on_config(NODE).await.unwrap().unwrap();

    assert_eq!(
        vec![
            BusOp::Download { node: NODE, object: 0x6060, sub: 0, data: lei8(1) },
            BusOp::Download { node: NODE, object: 0x6081, sub: 0, data: le32(20000) },
        ],
        bus.sdo_ops_for(NODE)
    );
}

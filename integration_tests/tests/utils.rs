//! Shared fixtures for the scenario tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canmotion_common::nmt::{NmtCommand, NmtState};
use canmotion_common::objects::{index, ObjectValue};
use canmotion_common::ObjectDictionary;
use canmotion_master::{DriverFactory, ErrorCallback, MasterHandle, MotorDriver, NodeDriver};

use integration_tests::sim_bus::SimBus;

/// Drive switched off: ready-to-switch-on and voltage only
pub const OFF_SW: u16 = 0x0011;
/// Drive switched on, operation disabled
pub const IDLE_SW: u16 = 0x0013;
/// Operation enabled
pub const OP_SW: u16 = 0x0017;
/// Operation enabled with the setpoint acknowledged (bit 12)
pub const ACK_SW: u16 = 0x1017;
/// Operation enabled with target reached
pub const DONE_SW: u16 = 0x0417;
/// Homing attained: target reached plus bit 12
pub const HOMED_SW: u16 = 0x1417;
/// Fault bit only
pub const FAULT_SW: u16 = 0x0008;

pub fn le16(value: u16) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn le32(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn lei32(value: i32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn leu8(value: u8) -> Vec<u8> {
    vec![value]
}

pub fn lei8(value: i8) -> Vec<u8> {
    vec![value as u8]
}

/// Route log output into the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll until `condition` holds, panicking after a timeout
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    if result.is_err() {
        panic!("timeout waiting for {what}");
    }
}

/// Wait until the given download was recorded on the bus
pub async fn wait_download(bus: &Arc<SimBus>, node: u8, object: u16, sub: u8, data: &[u8]) {
    wait_for(
        &format!("download 0x{object:04X}:0x{sub:02X} to node 0x{node:02X}"),
        || bus.has_download(node, object, sub, data),
    )
    .await;
}

/// A master description naming a textual slave entry for each node
pub fn master_od_with_textual(nodes: &[u8]) -> ObjectDictionary {
    let mut od = ObjectDictionary::new();
    for &node in nodes {
        od.set(
            index::SLAVE_DCF_TABLE,
            node,
            ObjectValue::VisibleString(description_path(node)),
        );
    }
    od
}

/// The loader path used for a node's device description
pub fn description_path(node: u8) -> String {
    format!("node{node}.toml")
}

/// An error callback collecting (code, message) pairs
pub fn error_collector() -> (ErrorCallback, Arc<Mutex<Vec<(u16, String)>>>) {
    let log: Arc<Mutex<Vec<(u16, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let callback: ErrorCallback = Arc::new(move |code, message| {
        sink.lock().unwrap().push((code, message.to_owned()));
    });
    (callback, log)
}

/// A driver factory creating motor drivers with the given error callback
pub fn motor_factory(errors: ErrorCallback) -> DriverFactory<SimBus> {
    Box::new(move |config| {
        let mut driver = MotorDriver::new(config);
        driver.set_error_callback(errors.clone());
        Box::new(driver) as Box<dyn NodeDriver<SimBus>>
    })
}

/// Seed the remote objects a motor node needs during bring-up
pub fn seed_motor_remote(bus: &SimBus, node: u8) {
    bus.set_remote(node, index::STATUS_WORD, 0, le16(OFF_SW));
    bus.set_remote(node, index::ERROR_CODE, 0, le16(0));
}

/// Deliver a status word through the node's mapped RPDO
pub fn pump_status(handle: &MasterHandle, node: u8, status_word: u16) {
    handle.rpdo_written(node, index::STATUS_WORD, 0, ObjectValue::U16(status_word));
}

/// Wait until the motor reaches idle, by queueing a probe continuation
///
/// recover_from_fault drains one continuation immediately when the motor is
/// already idle, which makes it a convenient synchronization point.
pub async fn wait_idle(handle: &MasterHandle, node: u8) {
    let reached = Arc::new(AtomicBool::new(false));
    let flag = reached.clone();
    handle.motor(node).recover_from_fault(move || {
        flag.store(true, Ordering::SeqCst);
    });
    wait_for(&format!("node 0x{node:02X} idle"), || {
        reached.load(Ordering::SeqCst)
    })
    .await;
}

/// Run one motor node through configuration and boot until it is idle
pub async fn boot_to_idle(handle: &MasterHandle, bus: &Arc<SimBus>, node: u8) {
    handle
        .on_config(node)
        .await
        .expect("master stopped")
        .expect("configuration failed");
    handle.on_nmt_command(NmtCommand::Start);
    handle.on_boot(node, NmtState::Operational, None, "");
    // InitialPowerOff resolves into PowerOnDisableOperation, visible as the
    // control word write
    wait_download(bus, node, index::CONTROL_WORD, 0, &le16(0x0007)).await;
    pump_status(handle, node, IDLE_SW);
    wait_idle(handle, node).await;
}

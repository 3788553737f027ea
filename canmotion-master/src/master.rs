//! The CANopen master
//!
//! The master owns the per-node drivers, the pending-boot set and the
//! COB-ID/follower registry, and routes every bus-level callback to the
//! right driver. All routing runs on one event-loop task fed by an mpsc
//! channel; bus ingress and user commands alike arrive as [MasterEvent]s, so
//! state transitions are observed strictly in arrival order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canmotion_common::device_description::LoadError;
use canmotion_common::nmt::{NmtCommand, NmtState};
use canmotion_common::objects::{index, ObjectValue};
use canmotion_common::traits::{ConfigLoader, MasterBus};
use canmotion_common::{NodeId, ObjectDictionary};
use futures::future::{join_all, BoxFuture};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config_engine::{self, ConfigError};
use crate::driver::{DriverCore, DriverFactory, GenericDriver, NodeDriver};
use crate::motor::{DeferredAction, MotorCommand};
use crate::pdo_fabric::PdoFabric;
use crate::sdo_client::{SdoClient, DEFAULT_SDO_TIMEOUT};

/// An event processed by the master loop
///
/// Bus ingress, user commands and deferred driver work all travel through
/// this type; the variants map one-to-one onto the inbound callback surface.
pub enum MasterEvent {
    /// A node completed (or failed) the CiA-302 boot process
    Boot {
        /// The booted node
        node: u8,
        /// The NMT state the node reported
        state: NmtState,
        /// The CiA-302 error status character; None on success
        status: Option<char>,
        /// Human readable detail from the boot process
        detail: String,
    },
    /// A node's NMT state changed
    NmtStateChanged {
        /// The node whose state changed
        node: u8,
        /// The new state
        state: NmtState,
    },
    /// The master issued an NMT command
    NmtCommandIssued {
        /// The issued command
        command: NmtCommand,
    },
    /// The bus requests the configuration of a node
    ConfigureNode {
        /// The node to configure
        node: u8,
        /// Completion channel for the configuration result
        done: Option<oneshot::Sender<Result<(), ConfigError>>>,
    },
    /// An EMCY frame was received
    Emergency {
        /// The node that raised the emergency
        node: u8,
        /// The CiA-301 emergency error code
        code: u16,
        /// The error register
        register: u8,
        /// The five manufacturer-specific bytes
        manufacturer: [u8; 5],
    },
    /// An object in the master's own dictionary was written
    MasterObjectWritten {
        /// Index of the written object
        index: u16,
        /// Sub-index of the written object
        sub: u8,
    },
    /// An RPDO value for a node was received
    RpdoWritten {
        /// The node the RPDO belongs to
        node: u8,
        /// Index of the mapped object
        index: u16,
        /// Sub-index of the mapped object
        sub: u8,
    },
    /// A user-level motor command
    Motor {
        /// The target node
        node: u8,
        /// The command
        command: MotorCommand,
    },
    /// Reset all slaves and expect them to boot again
    Reset,
    /// A deferred driver action posted back onto the loop
    Deferred {
        /// The node the action belongs to
        node: u8,
        /// The action
        action: DeferredAction,
    },
    /// Stop the event loop
    Shutdown,
}

/// Registry of RPDO COB-ID claims and the follower pairs inferred from them
///
/// First claim on a COB-ID wins; later claimants are linked to the first.
/// The invariant `following(a) == b ⇔ follows(b) == a` is maintained by
/// construction, and the main of a pair is always the smaller node ID.
#[derive(Debug, Default)]
pub struct PairRegistry {
    cob_claims: HashMap<u32, u8>,
    following: HashMap<u8, u8>,
    follows: HashMap<u8, u8>,
}

impl PairRegistry {
    /// The first node that claimed this COB-ID, if any
    pub fn claimant(&self, cob: u32) -> Option<u8> {
        self.cob_claims.get(&cob).copied()
    }

    /// Claim a COB-ID for a node
    pub fn claim(&mut self, cob: u32, node: u8) {
        self.cob_claims.insert(cob, node);
    }

    /// Record a main/follower pair
    pub fn link(&mut self, main: u8, follower: u8) {
        self.following.insert(main, follower);
        self.follows.insert(follower, main);
    }

    /// The node following this one, or 0 if none
    pub fn following(&self, node: u8) -> u8 {
        self.following.get(&node).copied().unwrap_or(0)
    }

    /// The node this one follows, or 0 if none
    pub fn follows(&self, node: u8) -> u8 {
        self.follows.get(&node).copied().unwrap_or(0)
    }
}

/// State shared between the master loop, its handles and spawned work
pub(crate) struct MasterShared<B> {
    pub(crate) bus: Arc<B>,
    pub(crate) fabric: Arc<PdoFabric>,
    pub(crate) registry: Arc<Mutex<PairRegistry>>,
    pub(crate) events: mpsc::UnboundedSender<MasterEvent>,
    pub(crate) sdo_timeout: Mutex<Duration>,
}

impl<B: MasterBus> MasterShared<B> {
    pub(crate) fn sdo_client(&self, node: NodeId) -> SdoClient<B> {
        SdoClient::new(self.bus.clone(), node).with_timeout(*self.sdo_timeout.lock().unwrap())
    }

    pub(crate) fn following(&self, node: u8) -> u8 {
        self.registry.lock().unwrap().following(node)
    }

    pub(crate) fn follows(&self, node: u8) -> u8 {
        self.registry.lock().unwrap().follows(node)
    }
}

/// The view of the master a driver gets while handling an event
pub struct DriverContext<B> {
    shared: Arc<MasterShared<B>>,
}

impl<B: MasterBus> DriverContext<B> {
    pub(crate) fn new(shared: Arc<MasterShared<B>>) -> Self {
        Self { shared }
    }

    /// The bus collaborator
    pub fn bus(&self) -> &Arc<B> {
        &self.shared.bus
    }

    /// The master's process-data image
    pub fn fabric(&self) -> &Arc<PdoFabric> {
        &self.shared.fabric
    }

    /// An SDO client for the given node, carrying the master-wide timeout
    pub fn sdo_client(&self, node: NodeId) -> SdoClient<B> {
        self.shared.sdo_client(node)
    }

    /// The node following the given one, or 0
    pub fn following(&self, node: u8) -> u8 {
        self.shared.following(node)
    }

    /// The node the given one follows, or 0
    pub fn follows(&self, node: u8) -> u8 {
        self.shared.follows(node)
    }

    /// A sender for posting events back onto the master loop
    pub fn events(&self) -> mpsc::UnboundedSender<MasterEvent> {
        self.shared.events.clone()
    }

    /// Post a deferred action for a node
    ///
    /// On-enter effects that require another state transition must go
    /// through here rather than transitioning recursively.
    pub fn post_deferred(&self, node: u8, action: DeferredAction) {
        self.shared
            .events
            .send(MasterEvent::Deferred { node, action })
            .ok();
    }

    /// The standard configuration future for a driver core
    pub fn node_config_future(
        &self,
        core: &DriverCore,
    ) -> BoxFuture<'static, Result<(), ConfigError>> {
        config_engine::node_config_future(core, &self.shared)
    }

    pub(crate) fn shared(&self) -> &Arc<MasterShared<B>> {
        &self.shared
    }
}

/// The master of a system configured by device descriptions
///
/// Construction and driver discovery happen synchronously; [Master::start]
/// then moves the master onto its event-loop task and hands back a
/// [MasterHandle] for bus ingress and user commands.
pub struct Master<B: MasterBus> {
    shared: Arc<MasterShared<B>>,
    loader: Arc<dyn ConfigLoader>,
    factory: Option<DriverFactory<B>>,
    drivers: BTreeMap<u8, Box<dyn NodeDriver<B>>>,
    registered: Arc<Mutex<BTreeSet<u8>>>,
    pending_boot: BTreeSet<u8>,
    all_booted_reported: bool,
    boot_completed: Option<Box<dyn FnMut(u8) + Send>>,
    load_config_started: Option<Box<dyn FnMut(u8) + Send>>,
    node_config_started: Option<Box<dyn FnMut(u8) + Send>>,
    events_rx: Option<mpsc::UnboundedReceiver<MasterEvent>>,
}

impl<B: MasterBus> Master<B> {
    /// Create a master from its own dictionary (the parsed master
    /// description) and the loader used to read slave descriptions
    pub fn new(bus: Arc<B>, master_od: ObjectDictionary, loader: Arc<dyn ConfigLoader>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let fabric = Arc::new(PdoFabric::new(master_od, events_tx.clone()));
        let shared = Arc::new(MasterShared {
            bus,
            fabric,
            registry: Arc::new(Mutex::new(PairRegistry::default())),
            events: events_tx,
            sdo_timeout: Mutex::new(DEFAULT_SDO_TIMEOUT),
        });
        Self {
            shared,
            loader,
            factory: None,
            drivers: BTreeMap::new(),
            registered: Arc::new(Mutex::new(BTreeSet::new())),
            pending_boot: BTreeSet::new(),
            all_booted_reported: false,
            boot_completed: None,
            load_config_started: None,
            node_config_started: None,
            events_rx: Some(events_rx),
        }
    }

    /// Set the factory used to create drivers for discovered slaves
    ///
    /// Without a factory every slave gets a [GenericDriver].
    pub fn set_driver_factory(&mut self, factory: DriverFactory<B>) {
        self.factory = Some(factory);
    }

    /// Set the callback fired once per completed node boot, and with node 0
    /// when all expected nodes have booted
    pub fn set_boot_completed_callback(&mut self, callback: Box<dyn FnMut(u8) + Send>) {
        self.boot_completed = Some(callback);
    }

    /// Set the callback fired when a slave's description starts loading
    pub fn set_load_config_started_callback(&mut self, callback: Box<dyn FnMut(u8) + Send>) {
        self.load_config_started = Some(callback);
    }

    /// Set the callback fired when a node's configuration begins
    pub fn set_node_config_started_callback(&mut self, callback: Box<dyn FnMut(u8) + Send>) {
        self.node_config_started = Some(callback);
    }

    /// Override the master-wide per-request SDO timeout (default 1 s)
    pub fn set_sdo_timeout(&self, timeout: Duration) {
        *self.shared.sdo_timeout.lock().unwrap() = timeout;
    }

    /// Discover the slaves named by the master description and register a
    /// driver for each
    ///
    /// Scans the textual table (0x1F20) and the concise table (0x1F22).
    pub fn configure_drivers(&mut self) -> Result<(), LoadError> {
        self.discover_from_table(index::SLAVE_DCF_TABLE, true)?;
        self.discover_from_table(index::SLAVE_CONCISE_DCF_TABLE, false)?;
        Ok(())
    }

    fn discover_from_table(&mut self, table: u16, textual: bool) -> Result<(), LoadError> {
        // The full sub-index range is scanned even when intermediate entries
        // are absent; generated master descriptions may be sparse.
        for sub in 1..=127u8 {
            let Some(filename) = self.shared.fabric.master_string(table, sub) else {
                continue;
            };
            if filename.is_empty() {
                continue;
            }
            let Ok(node) = NodeId::new(sub) else { continue };
            log::info!("0x{table:04X}:0x{sub:02X}: loading slave device description {filename}");
            if let Some(callback) = &mut self.load_config_started {
                callback(sub);
            }
            let dictionary = if textual {
                self.loader.load_dictionary(&filename, node)?
            } else {
                ObjectDictionary::new()
            };
            let config = Arc::new(crate::driver::DriverConfig {
                node,
                dictionary,
                textual_dcf: textual.then(|| filename.clone()),
                binary_dcf: (!textual).then(|| filename.clone()),
            });
            let driver: Box<dyn NodeDriver<B>> = match &mut self.factory {
                Some(factory) => factory(config),
                None => Box::new(GenericDriver::new(config)),
            };
            self.register_driver(sub, driver);
        }
        Ok(())
    }

    fn register_driver(&mut self, node: u8, driver: Box<dyn NodeDriver<B>>) {
        self.drivers.insert(node, driver);
        self.pending_boot.insert(node);
        self.registered.lock().unwrap().insert(node);
    }

    /// Access a registered driver, e.g. to install callbacks before start
    pub fn driver_mut(&mut self, node: u8) -> Option<&mut Box<dyn NodeDriver<B>>> {
        self.drivers.get_mut(&node)
    }

    /// The firmware file name stored for a slave at 0x1F58, if any
    pub fn software_file_for_slave(&self, node: u8) -> Option<String> {
        self.shared
            .fabric
            .master_string(index::SLAVE_SOFTWARE_TABLE, node)
            .filter(|s| !s.is_empty())
    }

    /// A handle onto the master loop
    pub fn handle(&self) -> MasterHandle {
        MasterHandle {
            events: self.shared.events.clone(),
            fabric: self.shared.fabric.clone(),
            registry: self.shared.registry.clone(),
            registered: self.registered.clone(),
        }
    }

    /// Move the master onto its event-loop task
    pub fn start(mut self) -> (MasterHandle, JoinHandle<()>) {
        let handle = self.handle();
        let events_rx = self
            .events_rx
            .take()
            .expect("master event receiver already taken");
        let task = tokio::spawn(async move { self.run(events_rx).await });
        (handle, task)
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<MasterEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        log::debug!("master event loop stopped");
    }

    fn handle_event(&mut self, event: MasterEvent) -> bool {
        let ctx = DriverContext::new(self.shared.clone());
        match event {
            MasterEvent::Boot {
                node,
                state,
                status,
                detail,
            } => {
                log::info!(
                    "boot: node 0x{node:02X} state {state} status {:?}",
                    status
                );
                if let Some(driver) = self.drivers.get_mut(&node) {
                    driver.on_boot(&ctx, state, status, &detail);
                }
                if let Some(callback) = &mut self.boot_completed {
                    callback(node);
                }
                if status.is_none() && !self.all_booted_reported {
                    if !self.pending_boot.remove(&node) && !self.pending_boot.is_empty() {
                        log::warn!("node 0x{node:02X} was not expected to boot");
                    }
                    if self.pending_boot.is_empty() {
                        self.all_booted_reported = true;
                        for driver in self.drivers.values_mut() {
                            driver.on_system_boot_completed();
                        }
                        if let Some(callback) = &mut self.boot_completed {
                            callback(0);
                        }
                    }
                }
            }
            MasterEvent::NmtStateChanged { node, state } => {
                if let Some(driver) = self.drivers.get_mut(&node) {
                    driver.on_nmt_state(&ctx, state);
                }
            }
            MasterEvent::NmtCommandIssued { command } => {
                self.dispatch_nmt_command(&ctx, command);
            }
            MasterEvent::ConfigureNode { node, done } => {
                if let Some(callback) = &mut self.node_config_started {
                    callback(node);
                }
                match self.drivers.get_mut(&node) {
                    Some(driver) => {
                        let future = driver.on_config(&ctx);
                        tokio::spawn(async move {
                            let result = future.await;
                            if let Err(e) = &result {
                                log::error!("node 0x{node:02X}: configuration failed: {e}");
                            }
                            if let Some(done) = done {
                                done.send(result).ok();
                            }
                        });
                    }
                    None => {
                        if let Some(done) = done {
                            done.send(Ok(())).ok();
                        }
                    }
                }
            }
            MasterEvent::Emergency {
                node,
                code,
                register,
                manufacturer,
            } => {
                if let Some(driver) = self.drivers.get_mut(&node) {
                    driver.on_emergency(&ctx, code, register, manufacturer);
                }
            }
            MasterEvent::MasterObjectWritten { index, sub } => {
                // Fan out to every driver; each one filters
                for driver in self.drivers.values_mut() {
                    driver.on_master_sdo_change(&ctx, index, sub);
                }
            }
            MasterEvent::RpdoWritten { node, index, sub } => {
                if let Some(driver) = self.drivers.get_mut(&node) {
                    driver.on_rpdo_write(&ctx, index, sub);
                }
                // A follower's PDO traffic is mirrored to its main
                let main = self.shared.follows(node);
                if main != 0 {
                    if let Some(driver) = self.drivers.get_mut(&main) {
                        driver.on_follower_rpdo_write(&ctx, index, sub);
                    }
                }
            }
            MasterEvent::Motor { node, command } => {
                if let Some(driver) = self.drivers.get_mut(&node) {
                    driver.on_motor_command(&ctx, command);
                }
            }
            MasterEvent::Reset => {
                for &node in self.drivers.keys() {
                    self.pending_boot.insert(node);
                }
                self.all_booted_reported = false;
                // Let the other nodes listen again; also triggers the
                // reconfiguration as each slave reboots.
                self.shared.bus.send_nmt(NmtCommand::ResetNode, 0);
                self.dispatch_nmt_command(&ctx, NmtCommand::ResetNode);
            }
            MasterEvent::Deferred { node, action } => {
                if let Some(driver) = self.drivers.get_mut(&node) {
                    driver.on_deferred(&ctx, action);
                }
            }
            MasterEvent::Shutdown => return false,
        }
        true
    }

    fn dispatch_nmt_command(&mut self, ctx: &DriverContext<B>, command: NmtCommand) {
        if command == NmtCommand::ResetComm {
            for (&node, driver) in &self.drivers {
                // The automatic textual upload of the underlying stack is
                // broken for PDO configuration, so it is always disabled.
                self.shared
                    .fabric
                    .blank_master_string(index::SLAVE_DCF_TABLE, node);
                // With a custom clear strategy the driver issues the binary
                // download itself after its clear step.
                if driver.core().has_clear_configuration_strategy() {
                    self.shared
                        .fabric
                        .blank_master_string(index::SLAVE_CONCISE_DCF_TABLE, node);
                }
            }
        }
        for driver in self.drivers.values_mut() {
            driver.on_nmt_command(ctx, command);
        }
    }
}

/// A cloneable handle onto a running master
///
/// The bus collaborator reports ingress through the `on_*` methods; the
/// application uses the remaining surface. All methods enqueue onto the
/// master loop and return promptly.
#[derive(Clone)]
pub struct MasterHandle {
    events: mpsc::UnboundedSender<MasterEvent>,
    fabric: Arc<PdoFabric>,
    registry: Arc<Mutex<PairRegistry>>,
    registered: Arc<Mutex<BTreeSet<u8>>>,
}

impl MasterHandle {
    /// Report a completed (or failed) node boot
    pub fn on_boot(&self, node: u8, state: NmtState, status: Option<char>, detail: impl Into<String>) {
        self.events
            .send(MasterEvent::Boot {
                node,
                state,
                status,
                detail: detail.into(),
            })
            .ok();
    }

    /// Report an NMT state change of a node
    pub fn on_nmt_state(&self, node: u8, state: NmtState) {
        self.events
            .send(MasterEvent::NmtStateChanged { node, state })
            .ok();
    }

    /// Report an NMT command issued on the bus
    pub fn on_nmt_command(&self, command: NmtCommand) {
        self.events
            .send(MasterEvent::NmtCommandIssued { command })
            .ok();
    }

    /// Request the configuration of a node; the receiver resolves with the
    /// configuration result
    pub fn on_config(&self, node: u8) -> oneshot::Receiver<Result<(), ConfigError>> {
        let (done, result) = oneshot::channel();
        self.events
            .send(MasterEvent::ConfigureNode {
                node,
                done: Some(done),
            })
            .ok();
        result
    }

    /// Report a received EMCY frame
    pub fn on_emergency(&self, node: u8, code: u16, register: u8, manufacturer: [u8; 5]) {
        self.events
            .send(MasterEvent::Emergency {
                node,
                code,
                register,
                manufacturer,
            })
            .ok();
    }

    /// Report an RPDO value received for a node
    pub fn rpdo_written(&self, node: u8, index: u16, sub: u8, value: ObjectValue) {
        self.fabric.write_rpdo(node, index, sub, value);
    }

    /// Report a write into the master's own dictionary (an RPDO mapped into
    /// the master fired)
    pub fn master_object_written(&self, index: u16, sub: u8, value: ObjectValue) {
        self.fabric.write_master_object(index, sub, value);
    }

    /// Request the configuration of every registered node and await the
    /// combined result
    pub async fn configure_all(&self) -> Result<(), ConfigError> {
        let nodes: Vec<u8> = self.registered.lock().unwrap().iter().copied().collect();
        let receivers: Vec<_> = nodes.iter().map(|&node| self.on_config(node)).collect();
        for result in join_all(receivers).await {
            // A dropped channel means the master went away; nothing to report
            if let Ok(result) = result {
                result?;
            }
        }
        Ok(())
    }

    /// Reset all slaves with an NMT broadcast and expect them to boot again
    pub fn reset(&self) {
        self.events.send(MasterEvent::Reset).ok();
    }

    /// The firmware file name stored for a slave at 0x1F58, if any
    pub fn software_file_for_slave(&self, node: u8) -> Option<String> {
        self.fabric
            .master_string(index::SLAVE_SOFTWARE_TABLE, node)
            .filter(|s| !s.is_empty())
    }

    /// Read an object from the master's own dictionary
    pub fn master_object(&self, object: u16, sub: u8) -> Option<ObjectValue> {
        self.fabric.master_object(object, sub)
    }

    /// The node following the given one, or 0 if none
    pub fn following(&self, node: u8) -> u8 {
        self.registry.lock().unwrap().following(node)
    }

    /// The node the given one follows, or 0 if none
    pub fn follows(&self, node: u8) -> u8 {
        self.registry.lock().unwrap().follows(node)
    }

    /// A handle for the motor driver of the given node
    pub fn motor(&self, node: u8) -> MotorHandle {
        MotorHandle {
            node,
            events: self.events.clone(),
        }
    }

    /// Stop the master event loop
    pub fn shutdown(&self) {
        self.events.send(MasterEvent::Shutdown).ok();
    }
}

/// A handle for issuing motion commands to one motor driver
///
/// May be used from any thread; commands enqueue onto the master loop.
#[derive(Clone)]
pub struct MotorHandle {
    node: u8,
    events: mpsc::UnboundedSender<MasterEvent>,
}

impl MotorHandle {
    /// The node this handle addresses
    pub fn node(&self) -> u8 {
        self.node
    }

    /// Trigger a profile-position move
    ///
    /// `mode` is ORed into the control word, see [crate::MOVE_ABSOLUTE] and
    /// [crate::MOVE_RELATIVE]. `on_idle` fires when the motor is back in its
    /// idle state after the move.
    pub fn move_to(
        &self,
        mode: u16,
        position: i32,
        velocity: u32,
        acceleration: u32,
        deceleration: u32,
        on_idle: impl FnOnce() + Send + 'static,
    ) {
        self.send(MotorCommand::Move {
            mode,
            position,
            velocity,
            acceleration,
            deceleration,
            on_idle: Some(Box::new(on_idle)),
        });
    }

    /// Trigger the homing procedure
    ///
    /// The drive searches its reference sensor with the given method; once
    /// found the motor sits at the given offset position. `on_idle` fires
    /// when homing has finished.
    pub fn home(
        &self,
        method: i8,
        search_speed: u32,
        release_speed: u32,
        acceleration: u32,
        offset: i32,
        on_idle: impl FnOnce() + Send + 'static,
    ) {
        self.send(MotorCommand::Home {
            method,
            search_speed,
            release_speed,
            acceleration,
            offset,
            on_idle: Some(Box::new(on_idle)),
        });
    }

    /// Bring the motor back to normal operation after a fault
    pub fn recover_from_fault(&self, on_idle: impl FnOnce() + Send + 'static) {
        self.send(MotorCommand::RecoverFromFault {
            on_idle: Some(Box::new(on_idle)),
        });
    }

    fn send(&self, command: MotorCommand) {
        self.events
            .send(MasterEvent::Motor {
                node: self.node,
                command,
            })
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_registry_linking() {
        let mut registry = PairRegistry::default();
        assert_eq!(None, registry.claimant(0x203));
        registry.claim(0x203, 3);
        assert_eq!(Some(3), registry.claimant(0x203));

        registry.link(3, 4);
        assert_eq!(4, registry.following(3));
        assert_eq!(3, registry.follows(4));
        assert_eq!(0, registry.following(4));
        assert_eq!(0, registry.follows(3));
    }
}

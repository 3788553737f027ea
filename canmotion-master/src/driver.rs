//! Per-node drivers
//!
//! Every slave discovered by the master is owned by exactly one driver. The
//! [NodeDriver] trait is the dispatch surface the master routes bus events
//! through; [GenericDriver] handles plain devices, [crate::MotorDriver]
//! layers the CiA-402 state machine on top.

use std::collections::HashMap;
use std::sync::Arc;

use canmotion_common::nmt::{NmtCommand, NmtState};
use canmotion_common::sdo::{DriveErrorCode, SdoError};
use canmotion_common::traits::MasterBus;
use canmotion_common::{NodeId, ObjectDictionary};
use futures::future::BoxFuture;

use crate::config_engine::{self, ConfigError};
use crate::master::DriverContext;
use crate::motor::{DeferredAction, MotorCommand};

/// Callback used to report errors to the application
///
/// The u16 carries a CANopen emergency error code or one of the
/// manufacturer-specific codes in [DriveErrorCode]; the string carries a
/// human readable message.
pub type ErrorCallback = Arc<dyn Fn(u16, &str) + Send + Sync>;

/// A process which resets a node's configuration to default values
///
/// Typically writes object 0x1011 and performs a node reset. Resolving with
/// [SdoError::Canceled] skips the subsequent configuration without an error.
pub type ClearConfigurationStrategy =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), SdoError>> + Send + Sync>;

/// Creates concrete drivers for discovered slaves, depending on the config
pub type DriverFactory<B> =
    Box<dyn FnMut(Arc<DriverConfig>) -> Box<dyn NodeDriver<B>> + Send>;

/// The configuration of one slave, as discovered from the master tables
#[derive(Debug)]
pub struct DriverConfig {
    /// The node this configuration belongs to
    pub node: NodeId,
    /// The node's dictionary, with explicitly set values to be pushed
    pub dictionary: ObjectDictionary,
    /// The textual device description file the dictionary was loaded from
    pub textual_dcf: Option<String>,
    /// The concise (binary) DCF file for the node, if any
    pub binary_dcf: Option<String>,
}

/// State shared by all driver variants
pub struct DriverCore {
    node: NodeId,
    config: Arc<DriverConfig>,
    error_callback: Option<ErrorCallback>,
    clear_configuration: Option<ClearConfigurationStrategy>,
    nmt_state_callback: Option<Box<dyn FnMut(NmtState) + Send>>,
    rpdo_mapped: HashMap<(u16, u8), Box<dyn FnMut() + Send>>,
    emergency_active: bool,
}

impl DriverCore {
    /// Create the core for a discovered slave
    pub fn new(config: Arc<DriverConfig>) -> Self {
        Self {
            node: config.node,
            config,
            error_callback: None,
            clear_configuration: None,
            nmt_state_callback: None,
            rpdo_mapped: HashMap::new(),
            emergency_active: false,
        }
    }

    /// The node owned by this driver
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The node ID as a raw u8
    pub fn raw_node(&self) -> u8 {
        self.node.raw()
    }

    /// The driver's configuration
    pub fn config(&self) -> &Arc<DriverConfig> {
        &self.config
    }

    /// Install the error callback
    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.error_callback = Some(callback);
    }

    /// Install an external strategy to clear the node configuration before
    /// it is pushed
    pub fn set_clear_configuration_strategy(&mut self, strategy: ClearConfigurationStrategy) {
        self.clear_configuration = Some(strategy);
    }

    /// Whether a custom clear-configuration strategy was installed
    pub fn has_clear_configuration_strategy(&self) -> bool {
        self.clear_configuration.is_some()
    }

    /// Install a callback fired whenever the node's NMT state changes
    pub fn set_nmt_state_changed_callback(
        &mut self,
        callback: Box<dyn FnMut(NmtState) + Send>,
    ) {
        self.nmt_state_callback = Some(callback);
    }

    /// Register a callback fired when the given master object changes
    /// because an RPDO for this node was received
    pub fn set_rpdo_mapped_callback(
        &mut self,
        index: u16,
        sub: u8,
        callback: Box<dyn FnMut() + Send>,
    ) {
        self.rpdo_mapped.insert((index, sub), callback);
    }

    pub(crate) fn error_callback(&self) -> Option<ErrorCallback> {
        self.error_callback.clone()
    }

    pub(crate) fn clear_configuration(&self) -> Option<ClearConfigurationStrategy> {
        self.clear_configuration.clone()
    }

    pub(crate) fn report_error(&self, code: impl Into<u16>, message: &str) {
        if let Some(callback) = &self.error_callback {
            callback(code.into(), message);
        }
    }

    pub(crate) fn emergency_active(&self) -> bool {
        self.emergency_active
    }

    pub(crate) fn clear_emergency(&mut self) {
        self.emergency_active = false;
    }

    pub(crate) fn fire_nmt_state(&mut self, state: NmtState) {
        if let Some(callback) = &mut self.nmt_state_callback {
            callback(state);
        }
    }

    pub(crate) fn fire_rpdo_mapped(&mut self, index: u16, sub: u8) {
        if let Some(callback) = self.rpdo_mapped.get_mut(&(index, sub)) {
            callback();
        }
    }

    pub(crate) fn handle_emergency(&mut self, code: u16, register: u8, manufacturer: [u8; 5]) {
        self.emergency_active = code != 0;
        if !self.emergency_active {
            return;
        }
        let mut message = format!(
            "EMERGENCY: code: 0x{code:04X} error register: 0x{register:02X} manufacturer specific message (hex): "
        );
        for byte in manufacturer {
            message.push_str(&format!("{byte:02x} "));
        }
        message.push_str(" string: ");
        for byte in manufacturer {
            message.push(if (32..=126).contains(&byte) {
                byte as char
            } else {
                '.'
            });
        }
        self.report_error(code, &message);
    }

    pub(crate) fn report_boot_error(&self, state: NmtState, status: Option<char>, detail: &str) {
        let Some(es) = status else { return };
        let message = format!("In NMT state {state}: CiA-302 slave boot error status: {es} ({detail})");
        if es == 'B' {
            self.report_error(DriveErrorCode::NodeMissing, &message);
        } else {
            self.report_error(DriveErrorCode::NodeBootFailed, &message);
        }
    }
}

impl std::fmt::Debug for DriverCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverCore")
            .field("node", &self.node)
            .field("emergency_active", &self.emergency_active)
            .finish_non_exhaustive()
    }
}

/// The per-node driver dispatch surface
///
/// The master routes every bus-level event for a node through its driver.
/// All methods run on the master's event loop; long-running work (the
/// configuration sequence, SDO traffic) is returned as futures or spawned.
pub trait NodeDriver<B: MasterBus>: Send {
    /// The shared driver core
    fn core(&self) -> &DriverCore;

    /// The shared driver core, mutably
    fn core_mut(&mut self) -> &mut DriverCore;

    /// Build the configuration future for this node
    ///
    /// Called when the bus requests the node's configuration during boot.
    /// The returned future runs concurrently with other drivers'
    /// configurations.
    fn on_config(&mut self, ctx: &DriverContext<B>) -> BoxFuture<'static, Result<(), ConfigError>> {
        config_engine::node_config_future(self.core(), ctx.shared())
    }

    /// The node completed (or failed) the CiA-302 boot process
    fn on_boot(
        &mut self,
        ctx: &DriverContext<B>,
        state: NmtState,
        status: Option<char>,
        detail: &str,
    ) {
        let _ = ctx;
        self.core().report_boot_error(state, status, detail);
    }

    /// The node's NMT state changed
    fn on_nmt_state(&mut self, ctx: &DriverContext<B>, state: NmtState) {
        let _ = ctx;
        log::info!("node {}: NMT state {state}", self.core().node());
        self.core_mut().fire_nmt_state(state);
    }

    /// The master issued an NMT command (broadcast observation)
    fn on_nmt_command(&mut self, ctx: &DriverContext<B>, command: NmtCommand) {
        let _ = (ctx, command);
    }

    /// An EMCY frame was received from the node
    fn on_emergency(
        &mut self,
        ctx: &DriverContext<B>,
        code: u16,
        register: u8,
        manufacturer: [u8; 5],
    ) {
        let _ = ctx;
        self.core_mut().handle_emergency(code, register, manufacturer);
    }

    /// A write to the master's own dictionary occurred
    fn on_master_sdo_change(&mut self, ctx: &DriverContext<B>, index: u16, sub: u8) {
        let _ = (ctx, index, sub);
    }

    /// An RPDO for this node was received and stored in the fabric
    fn on_rpdo_write(&mut self, ctx: &DriverContext<B>, index: u16, sub: u8) {
        let _ = ctx;
        self.core_mut().fire_rpdo_mapped(index, sub);
    }

    /// The driver's follower received an RPDO (forwarded by the master)
    fn on_follower_rpdo_write(&mut self, ctx: &DriverContext<B>, index: u16, sub: u8) {
        let _ = (ctx, index, sub);
    }

    /// Every expected node completed its boot
    fn on_system_boot_completed(&mut self) {}

    /// A user-level motor command arrived for this node
    fn on_motor_command(&mut self, ctx: &DriverContext<B>, command: MotorCommand) {
        let _ = (ctx, command);
        log::warn!(
            "node {}: received a motor command but this is not a motor driver",
            self.core().node()
        );
    }

    /// A deferred action posted by this driver came back around
    fn on_deferred(&mut self, ctx: &DriverContext<B>, action: DeferredAction) {
        let _ = (ctx, action);
    }
}

/// Driver for a slave with no device-specific behavior
///
/// Runs the configuration sequence and surfaces boot errors and emergencies,
/// nothing more.
#[derive(Debug)]
pub struct GenericDriver {
    core: DriverCore,
}

impl GenericDriver {
    /// Create a driver from the discovered configuration
    pub fn new(config: Arc<DriverConfig>) -> Self {
        Self {
            core: DriverCore::new(config),
        }
    }

    /// Install the error callback
    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.core.set_error_callback(callback);
    }

    /// Install a clear-configuration strategy
    pub fn set_clear_configuration_strategy(&mut self, strategy: ClearConfigurationStrategy) {
        self.core.set_clear_configuration_strategy(strategy);
    }

    /// Install a callback fired on NMT state changes
    pub fn set_nmt_state_changed_callback(&mut self, callback: Box<dyn FnMut(NmtState) + Send>) {
        self.core.set_nmt_state_changed_callback(callback);
    }

    /// Register a callback for a master object written by this node's RPDOs
    pub fn set_rpdo_mapped_callback(
        &mut self,
        index: u16,
        sub: u8,
        callback: Box<dyn FnMut() + Send>,
    ) {
        self.core.set_rpdo_mapped_callback(index, sub, callback);
    }
}

impl<B: MasterBus> NodeDriver<B> for GenericDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }
}

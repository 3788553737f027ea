//! The CiA-402 motor driver
//!
//! Sequences power-up, homing, profile-position moves and fault recovery for
//! one drive, tracking its internal state from status words. When two drives
//! share an RPDO COB-ID the pair acts in lockstep: the main drive aggregates
//! its own and its follower's state so the pair appears as one logical
//! motor.

pub mod comm;
pub mod state;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use canmotion_common::nmt::{NmtCommand, NmtState};
use canmotion_common::objects::{index, ObjectValue};
use canmotion_common::sdo::DriveErrorCode;
use canmotion_common::traits::MasterBus;
use canmotion_common::NodeId;
use futures::future::BoxFuture;
use futures::FutureExt;
use snafu::ResultExt;

use crate::config_engine::{ConfigError, ReadRemoteSnafu};
use crate::driver::{
    ClearConfigurationStrategy, DriverConfig, DriverCore, ErrorCallback, NodeDriver,
};
use crate::master::{DriverContext, MasterEvent, MasterShared};
use comm::{CommunicationConfig, SetterStrategy};
use state::{derive_state, MotorState};

/// A continuation serviced when the motor reaches its idle state
pub type IdleCallback = Box<dyn FnOnce() + Send>;

/// Move mode for absolute positioning (control word bit 6 clear)
pub const MOVE_ABSOLUTE: u16 = 0x0000;
/// Move mode for relative positioning (control word bit 6 set)
pub const MOVE_RELATIVE: u16 = 0x0040;

/// Predefined homing methods, see object 0x6098 in CiA-402
///
/// [MotorHandle::home](crate::MotorHandle::home) accepts raw integers since
/// vendor specific methods exist as well.
pub mod homing_method {
    /// Backward to the homing switch, rising edge
    pub const BACKWARD_RISING_EDGE: i8 = 19;
    /// Backward to the homing switch, falling edge
    pub const BACKWARD_FALLING_EDGE: i8 = 20;
    /// Forward to the homing switch, rising edge
    pub const FORWARD_RISING_EDGE: i8 = 21;
    /// Forward to the homing switch, falling edge
    pub const FORWARD_FALLING_EDGE: i8 = 22;
    /// Marker cycle towards decreasing positions
    pub const FORWARD_MARKER_CYCLE: i8 = 33;
    /// Marker cycle towards increasing positions
    pub const BACKWARD_MARKER_CYCLE: i8 = 34;
}

/// A user-level command for a motor driver
pub enum MotorCommand {
    /// Trigger a profile-position move
    Move {
        /// Move mode bits ORed into the control word
        mode: u16,
        /// Target position in steps
        position: i32,
        /// Profile velocity
        velocity: u32,
        /// Profile acceleration
        acceleration: u32,
        /// Profile deceleration
        deceleration: u32,
        /// Continuation fired on return to idle
        on_idle: Option<IdleCallback>,
    },
    /// Trigger the homing procedure
    Home {
        /// Homing method (object 0x6098)
        method: i8,
        /// Speed while searching the switch (0x6099:1)
        search_speed: u32,
        /// Speed while searching the zero position (0x6099:2)
        release_speed: u32,
        /// Homing acceleration (0x609A)
        acceleration: u32,
        /// Position offset after homing (0x607C)
        offset: i32,
        /// Continuation fired on return to idle
        on_idle: Option<IdleCallback>,
    },
    /// Bring the motor back to normal operation after a fault
    RecoverFromFault {
        /// Continuation fired on return to idle
        on_idle: Option<IdleCallback>,
    },
}

/// Work a motor driver posted back onto the master loop
///
/// On-enter effects that require another transition never call back into the
/// state machine directly; they travel through the loop as one of these.
pub enum DeferredAction {
    /// Perform a state transition
    SetState(MotorState),
    /// Adopt the status word read after configuration completed
    InitialStatusWord(u16),
    /// The fault-reset watchdog fired
    RetriggerFaultReset,
    /// Start a prepared move (queued behind an earlier command)
    StartMove,
    /// Start a homing procedure (queued behind an earlier command)
    StartHoming {
        /// Homing method (object 0x6098)
        method: i8,
        /// Speed while searching the switch
        search_speed: u32,
        /// Speed while searching the zero position
        release_speed: u32,
        /// Homing acceleration
        acceleration: u32,
        /// Position offset after homing
        offset: i32,
    },
}

/// Driver for a CiA-402 compliant motor
pub struct MotorDriver {
    core: DriverCore,
    comm: CommunicationConfig,
    /// The aggregated state (identical with the main state if the node has
    /// no follower)
    state: MotorState,
    /// The state of this node when it is the main of a pair
    main_state: MotorState,
    /// The state of the following node, if any
    follower_state: MotorState,
    /// The last CiA-402 status word received for this node
    status_word: u16,
    move_mode: u16,
    move_position: i32,
    move_velocity: u32,
    move_acceleration: u32,
    move_deceleration: u32,
    master_nmt: Option<NmtCommand>,
    node_nmt: NmtState,
    idle_callbacks: Arc<Mutex<VecDeque<IdleCallback>>>,
    job_started: Option<Instant>,
}

impl MotorDriver {
    /// Create a motor driver from the discovered configuration
    pub fn new(config: Arc<DriverConfig>) -> Self {
        Self {
            core: DriverCore::new(config),
            comm: CommunicationConfig::default(),
            state: MotorState::InitialState,
            main_state: MotorState::Idle,
            follower_state: MotorState::Idle,
            status_word: 0,
            move_mode: 0,
            move_position: 0,
            move_velocity: 0,
            move_acceleration: 0,
            move_deceleration: 0,
            master_nmt: None,
            node_nmt: NmtState::Stopped,
            idle_callbacks: Arc::new(Mutex::new(VecDeque::new())),
            job_started: None,
        }
    }

    /// Configure how the driver communicates with the drive
    pub fn set_communication_config(&mut self, config: CommunicationConfig) {
        self.comm = config;
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
        object: u16,
        sub: u8,
        callback: Box<dyn FnMut() + Send>,
    ) {
        self.core.set_rpdo_mapped_callback(object, sub, callback);
    }

    /// The current internal state
    pub fn state(&self) -> MotorState {
        self.state
    }

    fn push_idle_callback(&self, callback: IdleCallback) {
        self.idle_callbacks.lock().unwrap().push_front(callback);
    }

    fn process_oldest_idle_callback(&self) {
        let callback = self.idle_callbacks.lock().unwrap().pop_back();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.job_started
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    /// Transition to a new state and run its on-enter effect
    ///
    /// Self-transitions are ignored. Effects never call back into set_state;
    /// anything needing a further transition goes through the master loop.
    fn set_state<B: MasterBus>(&mut self, ctx: &DriverContext<B>, new_state: MotorState) {
        let node = self.core.raw_node();
        if self.state == new_state {
            log::debug!(
                "node 0x{node:02X}: NOT switching {:?} --> {new_state:?}",
                self.state
            );
            return;
        }
        log::info!("node 0x{node:02X}: switching {:?} --> {new_state:?}", self.state);

        match new_state {
            MotorState::InitialState => {}
            MotorState::InitialPowerOn | MotorState::InitialPowerOff => {
                self.job_started = Some(Instant::now());
            }
            MotorState::CyclePowerShutdown => {
                log::info!(
                    "node 0x{node:02X}: entering CyclePowerShutdown after {:.3}ms",
                    self.elapsed_ms()
                );
                self.spawn_control_word_sdo(ctx, 0x0006);
            }
            MotorState::PowerOnDisableOperation => {
                log::info!(
                    "node 0x{node:02X}: entering PowerOnDisableOperation after {:.3}ms",
                    self.elapsed_ms()
                );
                self.spawn_setter(ctx, self.comm.control_word, ObjectValue::U16(0x0007));
            }
            MotorState::PrepareMove => {
                self.job_started = Some(Instant::now());
                self.prepare_move(ctx);
            }
            MotorState::ReadyToMove => {
                log::info!(
                    "node 0x{node:02X}: ReadyToMove after {:.3}ms",
                    self.elapsed_ms()
                );
                self.execute_move(ctx);
            }
            MotorState::Moving => {
                log::info!("node 0x{node:02X}: start Moving after {:.3}ms", self.elapsed_ms());
            }
            MotorState::PrepareHoming => {
                self.job_started = Some(Instant::now());
            }
            MotorState::ReadyForHoming => {
                // Start homing
                self.spawn_control_word_sdo(ctx, 0x001F);
            }
            MotorState::Homing => {
                log::info!("node 0x{node:02X}: start Homing after {:.3}ms", self.elapsed_ms());
            }
            MotorState::Idle => {
                log::info!("node 0x{node:02X}: entering Idle after {:.3}ms", self.elapsed_ms());
                self.process_oldest_idle_callback();
            }
            MotorState::FaultState => {
                self.idle_callbacks.lock().unwrap().clear();
                if self.state != MotorState::InitialState {
                    self.handle_fault(ctx);
                }
            }
            MotorState::FaultReset => {
                self.perform_fault_reset(ctx);
            }
            MotorState::NodeReset => {
                ctx.bus().send_nmt(NmtCommand::ResetNode, node);
            }
        }
        self.state = new_state;
    }

    /// Write the control word directly over SDO, outside the setter strategy
    fn spawn_control_word_sdo<B: MasterBus>(&self, ctx: &DriverContext<B>, value: u16) {
        let client = ctx.sdo_client(self.core.node());
        let node = self.core.raw_node();
        tokio::spawn(async move {
            if let Err(e) = client.write::<u16>(index::CONTROL_WORD, 0, value).await {
                log::warn!("node 0x{node:02X}: control word write 0x{value:04X} failed: {e}");
            }
        });
    }

    /// Apply a setter strategy, logging failures
    fn spawn_setter<B: MasterBus>(
        &self,
        ctx: &DriverContext<B>,
        setter: SetterStrategy,
        value: ObjectValue,
    ) {
        let shared = ctx.shared().clone();
        let node = self.core.node();
        tokio::spawn(async move {
            if let Err(e) = setter.apply(&shared, node, value).await {
                log::warn!("node {node}: setter write failed: {e}");
            }
        });
    }

    fn begin_prepare_move<B: MasterBus>(&mut self, ctx: &DriverContext<B>) {
        if ctx.following(self.core.raw_node()) != 0 {
            self.main_state = MotorState::PrepareMove;
        }
        self.set_state(ctx, MotorState::PrepareMove);
    }

    /// Write the full move setup through the configured setters
    ///
    /// Runs as its own task; the state machine proceeds when the drive
    /// acknowledges the setpoint through its status word.
    fn prepare_move<B: MasterBus>(&mut self, ctx: &DriverContext<B>) {
        let node = self.core.node();
        // The following node is triggered by the shared PDOs, so its state
        // slot is moved along manually.
        if ctx.following(node.raw()) != 0 {
            self.follower_state = MotorState::PrepareMove;
        }
        self.core.clear_emergency();

        let shared = ctx.shared().clone();
        let comm = self.comm.clone();
        let error_callback = self.core.error_callback();
        let mode = self.move_mode;
        let position = self.move_position;
        let velocity = self.move_velocity;
        let acceleration = self.move_acceleration;
        let deceleration = self.move_deceleration;
        tokio::spawn(async move {
            let steps: [(SetterStrategy, ObjectValue, &str); 7] = [
                (
                    comm.operation_mode,
                    ObjectValue::I8(1),
                    "While setting operation mode to 'Profile Position Mode'",
                ),
                (
                    comm.control_word,
                    ObjectValue::U16(0x0007),
                    "While setting the control word to 'Disable Operation'",
                ),
                (comm.position, ObjectValue::I32(position), "While setting the position"),
                (comm.velocity, ObjectValue::U32(velocity), "While setting the velocity"),
                (
                    comm.acceleration,
                    ObjectValue::U32(acceleration),
                    "While setting the acceleration",
                ),
                (
                    comm.deceleration,
                    ObjectValue::U32(deceleration),
                    "While setting the deceleration",
                ),
                // Both halt and enable-operation are set: drives starting on
                // either control word edge then move together once the halt
                // bit drops.
                (
                    comm.control_word,
                    ObjectValue::U16(mode | 0x011F),
                    "While setting the control word to 'Enable Operation' + move mode",
                ),
            ];
            for (setter, value, what) in steps {
                if !apply_move_step(&shared, node, setter, value, &error_callback, what).await {
                    return;
                }
            }
        });
    }

    /// Drop the halt bit, starting the motion
    ///
    /// Entered once every drive of the pair acknowledged the setpoint, so
    /// paired motors start on the same PDO.
    fn execute_move<B: MasterBus>(&self, ctx: &DriverContext<B>) {
        let shared = ctx.shared().clone();
        let node = self.core.node();
        let setter = self.comm.control_word;
        let value = ObjectValue::U16(self.move_mode | 0x000F);
        let error_callback = self.core.error_callback();
        log::info!(
            "node {node}: move setup finished after {:.3}ms",
            self.elapsed_ms()
        );
        tokio::spawn(async move {
            apply_move_step(
                &shared,
                node,
                setter,
                value,
                &error_callback,
                "While switching the motor through the control word",
            )
            .await;
        });
    }

    fn begin_prepare_homing<B: MasterBus>(
        &mut self,
        ctx: &DriverContext<B>,
        method: i8,
        search_speed: u32,
        release_speed: u32,
        acceleration: u32,
        offset: i32,
    ) {
        self.set_state(ctx, MotorState::PrepareHoming);
        let client = ctx.sdo_client(self.core.node());
        let node = self.core.raw_node();
        tokio::spawn(async move {
            // Position mode first so the homing offset can be written
            let steps: [(u16, u8, ObjectValue); 8] = [
                (index::OPERATION_MODE, 0, ObjectValue::U8(1)),
                (index::HOMING_METHOD, 0, ObjectValue::I8(method)),
                (index::HOMING_SPEEDS, 1, ObjectValue::U32(search_speed)),
                (index::HOMING_SPEEDS, 2, ObjectValue::U32(release_speed)),
                (index::HOMING_ACCELERATION, 0, ObjectValue::U32(acceleration)),
                (index::HOME_OFFSET, 0, ObjectValue::I32(offset)),
                (index::OPERATION_MODE, 0, ObjectValue::U8(6)),
                // Operation has to be cycled for homing to start reliably,
                // and in idle operation is disabled
                (index::CONTROL_WORD, 0, ObjectValue::U16(0x000F)),
            ];
            for (object, sub, value) in steps {
                if let Err(e) = client.write_value(object, sub, &value).await {
                    log::warn!(
                        "node 0x{node:02X}: homing setup write 0x{object:04X}:0x{sub:02X} failed: {e}"
                    );
                }
            }
        });
    }

    fn handle_recover_from_fault<B: MasterBus>(
        &mut self,
        ctx: &DriverContext<B>,
        on_idle: Option<IdleCallback>,
    ) {
        let node = self.core.raw_node();
        log::info!(
            "recover_from_fault: node 0x{node:02X}: recovering in state {:?}",
            self.state
        );
        match self.state {
            MotorState::FaultState => {
                if let Some(callback) = on_idle {
                    self.push_idle_callback(callback);
                }
                // The CiA-402 fault reset itself happens after the NMT reset,
                // driven from the boot handler.
                self.set_state(ctx, MotorState::NodeReset);
            }
            MotorState::FaultReset => {
                if let Some(callback) = on_idle {
                    self.push_idle_callback(callback);
                }
                // Already in progress; when done the motor becomes idle and
                // the callback fires. Watchdog in case the reset hangs:
                let events = ctx.events();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                    events
                        .send(MasterEvent::Deferred {
                            node,
                            action: DeferredAction::RetriggerFaultReset,
                        })
                        .ok();
                });
            }
            MotorState::Idle => {
                if let Some(callback) = on_idle {
                    self.push_idle_callback(callback);
                }
                self.process_oldest_idle_callback();
            }
            _ => {
                // No recovery path from the remaining states yet; the
                // continuation is dropped rather than left queued against an
                // unrelated idle transition.
                // TODO: decide whether a power cycle is needed to reach idle
                // from the remaining states
            }
        }
    }

    /// Decide how to clear the fault, based on the latest status word
    fn perform_fault_reset<B: MasterBus>(&mut self, ctx: &DriverContext<B>) {
        let node = self.core.raw_node();
        let recovery_from = derive_state(MotorState::InitialState, self.status_word, node);
        match recovery_from {
            MotorState::FaultState => {
                // Fault-reset edge; the rest follows from the status word
                self.spawn_control_word_sdo(ctx, 0x0080);
            }
            MotorState::InitialPowerOn => {
                ctx.post_deferred(node, DeferredAction::SetState(MotorState::CyclePowerShutdown));
            }
            MotorState::InitialPowerOff => {
                ctx.post_deferred(
                    node,
                    DeferredAction::SetState(MotorState::PowerOnDisableOperation),
                );
            }
            _ => {}
        }
    }

    /// Surface the CiA-402 error register, unless an EMCY already did
    fn handle_fault<B: MasterBus>(&self, ctx: &DriverContext<B>) {
        if self.core.emergency_active() {
            return;
        }
        let client = ctx.sdo_client(self.core.node());
        let error_callback = self.core.error_callback();
        tokio::spawn(async move {
            match client.read::<u16>(index::ERROR_CODE, 0).await {
                Ok(0) => {}
                Ok(code) => {
                    if let Some(callback) = &error_callback {
                        callback(code, &format!("Motor Fault: code: 0x{code:04X}"));
                    }
                }
                Err(e) => {
                    if let Some(callback) = &error_callback {
                        callback(
                            DriveErrorCode::ReadError.into(),
                            &format!("Error while reading the Fault Register: {e}"),
                        );
                    }
                }
            }
        });
    }

    /// Drive the first transitions once both the master command state and
    /// the node state report operational
    fn handle_initial_state_switching<B: MasterBus>(&mut self, ctx: &DriverContext<B>) {
        if self.master_nmt == Some(NmtCommand::Start) && self.node_nmt == NmtState::Operational {
            log::info!(
                "initial state switching: node 0x{:02X} in {:?}",
                self.core.raw_node(),
                self.state
            );
            match self.state {
                // FaultState: recover directly; NodeReset: continue the
                // recovery that required the node reset
                MotorState::FaultState | MotorState::NodeReset => {
                    self.set_state(ctx, MotorState::FaultReset);
                }
                MotorState::InitialPowerOn => {
                    self.set_state(ctx, MotorState::CyclePowerShutdown);
                }
                MotorState::InitialPowerOff => {
                    self.set_state(ctx, MotorState::PowerOnDisableOperation);
                }
                _ => {}
            }
        }
    }

    /// Process a status word for the main or the follower side
    fn handle_status_word_change<B: MasterBus>(
        &mut self,
        ctx: &DriverContext<B>,
        status_word: u16,
        from_follower: bool,
    ) {
        let node = self.core.raw_node();
        if !from_follower {
            self.status_word = status_word;
        }

        let following = ctx.following(node);
        let follows = ctx.follows(node);

        if follows == 0 {
            if following == 0 {
                // No pair; fault handling happens in set_state
                let next = derive_state(self.state, status_word, node);
                self.set_state(ctx, next);
            } else {
                // Main of a pair: aggregate both sides
                if !from_follower {
                    self.main_state = derive_state(self.main_state, status_word, node);
                } else {
                    self.follower_state =
                        derive_state(self.follower_state, status_word, following);
                }
                log::info!(
                    "aggregate state for 0x{node:02X}: main: {:?}, follower: {:?}, current: {:?}",
                    self.main_state,
                    self.follower_state,
                    self.state
                );
                if self.main_state == MotorState::ReadyToMove
                    && self.follower_state == MotorState::ReadyToMove
                    && self.state == MotorState::PrepareMove
                {
                    self.set_state(ctx, MotorState::ReadyToMove);
                } else if (self.main_state == MotorState::Moving
                    || self.follower_state == MotorState::Moving)
                    && self.state == MotorState::ReadyToMove
                {
                    self.set_state(ctx, MotorState::Moving);
                } else if self.main_state == MotorState::Idle
                    && self.follower_state == MotorState::Idle
                    && self.state == MotorState::PowerOnDisableOperation
                {
                    self.set_state(ctx, MotorState::Idle);
                } else if !from_follower && !pair_relevant(self.main_state) {
                    // Faults, power cycling and homing stay main-only
                    self.set_state(ctx, self.main_state);
                }
            }
        } else if !from_follower {
            // A follower runs its own machine only outside the pair-relevant
            // states, plus the single promotion to idle
            let next = derive_state(self.state, status_word, node);
            if !pair_relevant(next)
                || (self.state == MotorState::PowerOnDisableOperation && next == MotorState::Idle)
            {
                log::info!(
                    "local follower handling 0x{node:02X}: 0x{status_word:04X} {:?} --> {next:?}",
                    self.state
                );
                self.set_state(ctx, next);
            }
        }
    }
}

/// The states owned by the pair aggregation on the main driver
fn pair_relevant(state: MotorState) -> bool {
    matches!(
        state,
        MotorState::PrepareMove | MotorState::ReadyToMove | MotorState::Moving | MotorState::Idle
    )
}

async fn apply_move_step<B: MasterBus>(
    shared: &Arc<MasterShared<B>>,
    node: NodeId,
    setter: SetterStrategy,
    value: ObjectValue,
    error_callback: &Option<ErrorCallback>,
    what: &str,
) -> bool {
    match setter.apply(shared, node, value).await {
        Ok(()) => true,
        Err(e) => {
            log::error!("node {node}: {what}: {e}");
            if let Some(callback) = error_callback {
                callback(DriveErrorCode::WriteToNode.into(), what);
            }
            false
        }
    }
}

impl<B: MasterBus> NodeDriver<B> for MotorDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn on_config(&mut self, ctx: &DriverContext<B>) -> BoxFuture<'static, Result<(), ConfigError>> {
        let base = ctx.node_config_future(&self.core);
        let client = ctx.sdo_client(self.core.node());
        let events = ctx.events();
        let error_callback = self.core.error_callback();
        let node = self.core.raw_node();
        let needs_state_sync = self.state == MotorState::InitialState;
        async move {
            match base.await {
                Ok(()) => {
                    if needs_state_sync {
                        // Adopt the drive's actual power state before any
                        // recovery logic runs
                        let status = client
                            .read::<u16>(index::STATUS_WORD, 0)
                            .await
                            .context(ReadRemoteSnafu {
                                index: index::STATUS_WORD,
                                sub: 0u8,
                            })?;
                        events
                            .send(MasterEvent::Deferred {
                                node,
                                action: DeferredAction::InitialStatusWord(status),
                            })
                            .ok();
                    }
                    Ok(())
                }
                Err(e) => {
                    if let Some(callback) = &error_callback {
                        callback(
                            DriveErrorCode::NodeConfigurationFailed.into(),
                            &format!("Failed to send the configuration to the motor: {e}"),
                        );
                    }
                    Err(e)
                }
            }
        }
        .boxed()
    }

    fn on_boot(
        &mut self,
        ctx: &DriverContext<B>,
        state: NmtState,
        status: Option<char>,
        detail: &str,
    ) {
        self.core.report_boot_error(state, status, detail);
        if status.is_none() {
            log::info!(
                "boot: node 0x{:02X} reached {state}",
                self.core.raw_node()
            );
            self.node_nmt = NmtState::Operational;
            self.handle_initial_state_switching(ctx);
        }
    }

    fn on_nmt_state(&mut self, ctx: &DriverContext<B>, state: NmtState) {
        log::info!("node {}: NMT state {state}", self.core.node());
        self.core.fire_nmt_state(state);
        self.node_nmt = state;
        self.handle_initial_state_switching(ctx);
    }

    fn on_nmt_command(&mut self, ctx: &DriverContext<B>, command: NmtCommand) {
        self.master_nmt = Some(command);
        self.handle_initial_state_switching(ctx);
    }

    fn on_master_sdo_change(&mut self, ctx: &DriverContext<B>, object: u16, sub: u8) {
        let Some(check) = self.comm.status_word_check.clone() else {
            return;
        };
        let node = self.core.raw_node();
        let following = ctx.following(node);
        let for_self = check(object, sub, node);
        let for_follower = following != 0 && check(object, sub, following);
        if !for_self && !for_follower {
            return;
        }
        let Some(status) = ctx.fabric().master_object(object, sub).and_then(|v| v.as_u16())
        else {
            return;
        };
        log::info!("master object 0x{object:04X}/0x{sub:02X} = 0x{status:04X}");
        self.handle_status_word_change(ctx, status, for_follower);
    }

    fn on_rpdo_write(&mut self, ctx: &DriverContext<B>, object: u16, sub: u8) {
        self.core.fire_rpdo_mapped(object, sub);
        if object == index::STATUS_WORD && sub == 0 {
            let node = self.core.raw_node();
            let Some(status) = ctx.fabric().rpdo_value(node, object, sub).and_then(|v| v.as_u16())
            else {
                return;
            };
            self.handle_status_word_change(ctx, status, false);
        }
    }

    fn on_follower_rpdo_write(&mut self, ctx: &DriverContext<B>, object: u16, sub: u8) {
        if object == index::STATUS_WORD && sub == 0 {
            let follower = ctx.following(self.core.raw_node());
            if follower == 0 {
                return;
            }
            let Some(status) = ctx
                .fabric()
                .rpdo_value(follower, object, sub)
                .and_then(|v| v.as_u16())
            else {
                return;
            };
            self.handle_status_word_change(ctx, status, true);
        }
    }

    fn on_motor_command(&mut self, ctx: &DriverContext<B>, command: MotorCommand) {
        match command {
            MotorCommand::Move {
                mode,
                position,
                velocity,
                acceleration,
                deceleration,
                on_idle,
            } => {
                self.move_mode = mode;
                self.move_position = position;
                self.move_velocity = velocity;
                self.move_acceleration = acceleration;
                self.move_deceleration = deceleration;

                if self.state == MotorState::Idle {
                    if let Some(callback) = on_idle {
                        self.push_idle_callback(callback);
                    }
                    self.begin_prepare_move(ctx);
                } else {
                    // Busy: queue the move start behind the current job, then
                    // the caller's continuation behind that
                    let events = ctx.events();
                    let node = self.core.raw_node();
                    self.push_idle_callback(Box::new(move || {
                        events
                            .send(MasterEvent::Deferred {
                                node,
                                action: DeferredAction::StartMove,
                            })
                            .ok();
                    }));
                    if let Some(callback) = on_idle {
                        self.push_idle_callback(callback);
                    }
                }
            }
            MotorCommand::Home {
                method,
                search_speed,
                release_speed,
                acceleration,
                offset,
                on_idle,
            } => {
                if self.state == MotorState::Idle {
                    if let Some(callback) = on_idle {
                        self.push_idle_callback(callback);
                    }
                    self.begin_prepare_homing(
                        ctx,
                        method,
                        search_speed,
                        release_speed,
                        acceleration,
                        offset,
                    );
                } else {
                    let events = ctx.events();
                    let node = self.core.raw_node();
                    self.push_idle_callback(Box::new(move || {
                        events
                            .send(MasterEvent::Deferred {
                                node,
                                action: DeferredAction::StartHoming {
                                    method,
                                    search_speed,
                                    release_speed,
                                    acceleration,
                                    offset,
                                },
                            })
                            .ok();
                    }));
                    if let Some(callback) = on_idle {
                        self.push_idle_callback(callback);
                    }
                }
            }
            MotorCommand::RecoverFromFault { on_idle } => {
                self.handle_recover_from_fault(ctx, on_idle);
            }
        }
    }

    fn on_deferred(&mut self, ctx: &DriverContext<B>, action: DeferredAction) {
        match action {
            DeferredAction::SetState(state) => self.set_state(ctx, state),
            DeferredAction::InitialStatusWord(status) => {
                self.status_word = status;
                let next = derive_state(self.state, status, self.core.raw_node());
                self.set_state(ctx, next);
            }
            DeferredAction::RetriggerFaultReset => {
                if self.state == MotorState::FaultReset {
                    self.set_state(ctx, MotorState::NodeReset);
                }
            }
            DeferredAction::StartMove => self.begin_prepare_move(ctx),
            DeferredAction::StartHoming {
                method,
                search_speed,
                release_speed,
                acceleration,
                offset,
            } => {
                self.begin_prepare_homing(
                    ctx,
                    method,
                    search_speed,
                    release_speed,
                    acceleration,
                    offset,
                );
            }
        }
    }
}

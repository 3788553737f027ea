//! The internal motor state and its derivation from CiA-402 status words
//!
//! [derive_state] is a pure, total function: same inputs, same result, over
//! all 2^16 status words. The effectful side of the state machine lives on
//! [crate::MotorDriver].

/// CiA-402 status word bits
pub mod status {
    /// Ready to switch on
    pub const READY_TO_SWITCH_ON: u16 = 0x0001;
    /// Switched on
    pub const SWITCHED_ON: u16 = 0x0002;
    /// Operation enabled
    pub const OPERATION_ENABLED: u16 = 0x0004;
    /// Fault
    pub const FAULT: u16 = 0x0008;
    /// Voltage enabled
    pub const VOLTAGE_ENABLED: u16 = 0x0010;
    /// Quick stop
    pub const QUICK_STOP: u16 = 0x0020;
    /// Switch on disabled
    pub const SWITCH_ON_DISABLED: u16 = 0x0040;
    /// Warning
    pub const WARNING: u16 = 0x0080;
    /// Manufacturer specific bit 8
    pub const MANUFACTURER_SPECIFIC_1: u16 = 0x0100;
    /// Remote
    pub const REMOTE: u16 = 0x0200;
    /// Target reached
    pub const TARGET_REACHED: u16 = 0x0400;
    /// Internal limit active
    pub const INTERNAL_LIMIT_ACTIVE: u16 = 0x0800;
    /// Operation mode specific bit 12 (homing attained / setpoint ack)
    pub const OPERATION_MODE_SPECIFIC_1: u16 = 0x1000;
    /// Operation mode specific bit 13 (homing error / following error)
    pub const OPERATION_MODE_SPECIFIC_2: u16 = 0x2000;
    /// Manufacturer specific bit 14
    pub const MANUFACTURER_SPECIFIC_2: u16 = 0x4000;
    /// Manufacturer specific bit 15
    pub const MANUFACTURER_SPECIFIC_3: u16 = 0x8000;
}

use status::*;

/// The internal state of a motor driver
///
/// This state sequences power-up, homing, moves and fault recovery; it is
/// not the CiA-402 state itself, but is derived from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotorState {
    /// Nothing is known about the drive yet
    InitialState,
    /// The drive reported power on before the first transition
    InitialPowerOn,
    /// The drive reported power off before the first transition
    InitialPowerOff,
    /// A shutdown is being cycled through the control word
    CyclePowerShutdown,
    /// Powered on with operation disabled
    PowerOnDisableOperation,
    /// At rest, ready for commands
    Idle,
    /// The move parameters are being written
    PrepareMove,
    /// All setpoints acknowledged, ready to release the halt bit
    ReadyToMove,
    /// The drive is moving
    Moving,
    /// The homing parameters are being written
    PrepareHoming,
    /// Operation enabled, homing about to start
    ReadyForHoming,
    /// The drive is homing
    Homing,
    /// The drive reported a fault
    FaultState,
    /// A fault reset is in progress
    FaultReset,
    /// The node is being reset over NMT
    NodeReset,
}

/// Derive the next internal state from a status word
///
/// Unmatched inputs return `current`; the fault bit always wins.
pub fn derive_state(current: MotorState, status_word: u16, node: u8) -> MotorState {
    if status_word & FAULT != 0 {
        log::debug!("node 0x{node:02X}: entering FaultState, status word: 0x{status_word:04X}");
        return MotorState::FaultState;
    }

    if status_word & READY_TO_SWITCH_ON != 0
        && status_word & SWITCHED_ON == 0
        && status_word & OPERATION_ENABLED == 0
    {
        // Drive switched off
        return if current == MotorState::InitialState {
            log::debug!("node 0x{node:02X}: switching to InitialPowerOff, status word: 0x{status_word:04X}");
            MotorState::InitialPowerOff
        } else {
            log::debug!("node 0x{node:02X}: switching to PowerOnDisableOperation, status word: 0x{status_word:04X}");
            MotorState::PowerOnDisableOperation
        };
    }

    if current == MotorState::InitialState {
        log::debug!("node 0x{node:02X}: switching to InitialPowerOn, status word: 0x{status_word:04X}");
        return MotorState::InitialPowerOn;
    }

    if status_word & READY_TO_SWITCH_ON != 0
        && status_word & SWITCHED_ON != 0
        && status_word & VOLTAGE_ENABLED != 0
    {
        // Drive switched on
        if status_word & OPERATION_ENABLED == 0 {
            if current == MotorState::PowerOnDisableOperation {
                log::debug!("node 0x{node:02X}: switching PowerOnDisableOperation --> Idle");
                return MotorState::Idle;
            }
            if current == MotorState::FaultState && status_word & MANUFACTURER_SPECIFIC_1 == 0 {
                log::debug!("node 0x{node:02X}: switching FaultState --> FaultReset");
                return MotorState::FaultReset;
            }
            if current == MotorState::FaultReset && status_word & MANUFACTURER_SPECIFIC_1 == 0 {
                log::debug!("node 0x{node:02X}: switching FaultReset --> CyclePowerShutdown");
                return MotorState::CyclePowerShutdown;
            }
        } else {
            // Operation enabled
            if current == MotorState::PrepareHoming {
                log::debug!("node 0x{node:02X}: switching PrepareHoming --> ReadyForHoming");
                return MotorState::ReadyForHoming;
            }
            if current == MotorState::ReadyForHoming
                && status_word & TARGET_REACHED == 0
                && status_word & OPERATION_MODE_SPECIFIC_1 == 0
                && status_word & OPERATION_MODE_SPECIFIC_2 == 0
            {
                log::debug!("node 0x{node:02X}: switching ReadyForHoming --> Homing");
                return MotorState::Homing;
            }
            if current == MotorState::Homing && status_word & TARGET_REACHED != 0 {
                if status_word & OPERATION_MODE_SPECIFIC_1 != 0 {
                    // Homing attained
                    log::debug!("node 0x{node:02X}: switching Homing --> PowerOnDisableOperation");
                    return MotorState::PowerOnDisableOperation;
                }
                if status_word & OPERATION_MODE_SPECIFIC_2 != 0 {
                    // Homing error
                    log::debug!("node 0x{node:02X}: switching Homing --> FaultState");
                    return MotorState::FaultState;
                }
            }
            if current == MotorState::PrepareMove && status_word & OPERATION_MODE_SPECIFIC_1 != 0 {
                log::debug!("node 0x{node:02X}: switching PrepareMove --> ReadyToMove");
                return MotorState::ReadyToMove;
            }
            if current == MotorState::ReadyToMove
                && status_word & TARGET_REACHED == 0
                && status_word & OPERATION_MODE_SPECIFIC_1 == 0
            {
                log::debug!("node 0x{node:02X}: switching ReadyToMove --> Moving");
                return MotorState::Moving;
            }
            if current == MotorState::Moving && status_word & TARGET_REACHED != 0 {
                log::debug!("node 0x{node:02X}: switching Moving --> PowerOnDisableOperation");
                return MotorState::PowerOnDisableOperation;
            }
        }
    }

    log::debug!(
        "node 0x{node:02X}: cannot determine state switch from 0x{status_word:04X}, staying in {current:?}"
    );
    current
}

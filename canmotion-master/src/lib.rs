//! A CANopen master integration layer for fleets of CiA-402 drives
//!
//! The crate orchestrates a set of CiA-301/302/402 compliant slaves behind
//! one master:
//!
//! - A [configuration engine](ConfigError) which pushes each slave's
//!   device-description values over SDO, rewires its PDOs, and infers
//!   main/follower pairs from shared RPDO COB-IDs
//! - A [Master] owning the NMT lifecycle, the per-node drivers and the boot
//!   milestone tracking, driven by a single event-loop task
//! - A [MotorDriver] layering homing, profile-position moves and fault
//!   recovery on top of CiA-402 status-word semantics, with main+follower
//!   aggregation so a synchronized drive pair acts as one logical motor
//!
//! The raw CAN channel, SDO framing and NMT encoding are consumed through
//! [canmotion_common::traits::MasterBus]; any bus stack providing those
//! primitives can sit underneath.
#![warn(missing_docs)]

mod config_engine;
mod driver;
mod master;
mod motor;
mod pdo_fabric;
mod sdo_client;

pub use canmotion_common as common;

pub use config_engine::ConfigError;
pub use driver::{
    ClearConfigurationStrategy, DriverConfig, DriverCore, DriverFactory, ErrorCallback,
    GenericDriver, NodeDriver,
};
pub use master::{
    DriverContext, Master, MasterEvent, MasterHandle, MotorHandle, PairRegistry,
};
pub use motor::comm::{CommunicationConfig, SetterStrategy, StatusWordCheck};
pub use motor::state::{derive_state, status, MotorState};
pub use motor::{
    homing_method, DeferredAction, IdleCallback, MotorCommand, MotorDriver, MOVE_ABSOLUTE,
    MOVE_RELATIVE,
};
pub use pdo_fabric::PdoFabric;
pub use sdo_client::{SdoClient, DEFAULT_SDO_TIMEOUT};

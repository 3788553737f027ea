//! Communication strategies for driving a motor
//!
//! Each motor value (control word, setpoints, ...) can reach the drive three
//! ways: a plain SDO write, a write into a master object that an RPDO picks
//! up (optionally kicking a TPDO), or a write into the master's mapped TPDO
//! image. Which one applies depends entirely on the PDO layout of the
//! system, so the choice is configuration, not code.

use std::sync::Arc;

use canmotion_common::objects::{index, ObjectValue};
use canmotion_common::sdo::SdoError;
use canmotion_common::traits::MasterBus;
use canmotion_common::NodeId;

use crate::master::MasterShared;

/// Decides whether a master object change carries the status word of a node
///
/// Called with `(master_index, master_sub, node)`; only needed when a custom
/// PDO mapping routes status words through master objects.
pub type StatusWordCheck = Arc<dyn Fn(u16, u8, u8) -> bool + Send + Sync>;

/// One way of delivering a value to the drive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetterStrategy {
    /// Write the drive's object directly over SDO
    ///
    /// Slow, and unusable for follower pairs (each drive would move on its
    /// own schedule), but needs no PDO layout at all.
    Sdo {
        /// The object index on the drive (sub-index 0)
        index: u16,
    },
    /// Write a master object picked up by an RPDO mapping
    ///
    /// Optionally triggers the given master TPDO after the write.
    MasterObject {
        /// The master-side object index
        index: u16,
        /// The master-side sub-index
        sub: u8,
        /// TPDO number to trigger after the write, if any
        tpdo: Option<u16>,
    },
    /// Write the master's TPDO image for the drive's object
    ///
    /// With `event` set the write also triggers the transmission.
    MappedTpdo {
        /// The object index on the drive (sub-index 0)
        index: u16,
        /// Trigger a write event after updating the image
        event: bool,
    },
}

impl SetterStrategy {
    pub(crate) async fn apply<B: MasterBus>(
        &self,
        shared: &Arc<MasterShared<B>>,
        node: NodeId,
        value: ObjectValue,
    ) -> Result<(), SdoError> {
        match *self {
            SetterStrategy::Sdo { index } => {
                shared.sdo_client(node).write_value(index, 0, &value).await
            }
            SetterStrategy::MasterObject { index, sub, tpdo } => {
                shared.fabric.write_master_object(index, sub, value);
                if let Some(tpdo) = tpdo {
                    shared.bus.trigger_tpdo(tpdo);
                }
                Ok(())
            }
            SetterStrategy::MappedTpdo { index, event } => {
                shared
                    .bus
                    .write_mapped_tpdo(node, index, 0, &value.to_le_bytes(), event)
            }
        }
    }
}

/// How a motor driver talks to its drive
///
/// Six setters cover the values written during moves and power sequencing;
/// the status-word check classifies master object changes. Defaults use
/// plain SDO writes to the standard CiA-402 objects.
#[derive(Clone)]
pub struct CommunicationConfig {
    /// Delivery of the control word (0x6040)
    pub control_word: SetterStrategy,
    /// Delivery of the operation mode (0x6060)
    pub operation_mode: SetterStrategy,
    /// Delivery of the target position (0x607A)
    pub position: SetterStrategy,
    /// Delivery of the profile velocity (0x6081)
    pub velocity: SetterStrategy,
    /// Delivery of the profile acceleration (0x6083)
    pub acceleration: SetterStrategy,
    /// Delivery of the profile deceleration (0x6084)
    pub deceleration: SetterStrategy,
    /// Classifier for status words arriving through master objects
    pub status_word_check: Option<StatusWordCheck>,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            control_word: SetterStrategy::Sdo {
                index: index::CONTROL_WORD,
            },
            operation_mode: SetterStrategy::Sdo {
                index: index::OPERATION_MODE,
            },
            position: SetterStrategy::Sdo {
                index: index::TARGET_POSITION,
            },
            velocity: SetterStrategy::Sdo {
                index: index::PROFILE_VELOCITY,
            },
            acceleration: SetterStrategy::Sdo {
                index: index::PROFILE_ACCELERATION,
            },
            deceleration: SetterStrategy::Sdo {
                index: index::PROFILE_DECELERATION,
            },
            status_word_check: None,
        }
    }
}

impl std::fmt::Debug for CommunicationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationConfig")
            .field("control_word", &self.control_word)
            .field("operation_mode", &self.operation_mode)
            .field("position", &self.position)
            .field("velocity", &self.velocity)
            .field("acceleration", &self.acceleration)
            .field("deceleration", &self.deceleration)
            .field("status_word_check", &self.status_word_check.is_some())
            .finish()
    }
}

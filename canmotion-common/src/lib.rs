//! Common functionality shared among the canmotion crates.
//!
//! This crate holds the protocol vocabulary of the master integration layer:
//! node IDs, NMT commands and states, CANopen primitive value types, SDO
//! abort codes, the in-memory object dictionary, the TOML device-description
//! loader, and the traits through which the core consumes its bus-level
//! collaborators.
//!
//! Most users will have no reason to depend on this crate directly, as it is
//! re-exported by `canmotion-master`.
#![warn(missing_docs, missing_copy_implementations)]

pub mod device_description;
pub mod nmt;
pub mod node_id;
pub mod object_dictionary;
pub mod objects;
pub mod sdo;
pub mod traits;

pub use node_id::NodeId;
pub use object_dictionary::ObjectDictionary;
pub use objects::{CanopenType, ObjectValue, Primitive};
pub use sdo::{AbortCode, DriveErrorCode, SdoError};

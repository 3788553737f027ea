//! Traits through which the core consumes its collaborators
//!
//! The raw CAN driver, SDO framing, NMT encoding and DCF parsing all live
//! behind these traits. The master and its drivers are generic over
//! [MasterBus]; tests substitute an in-process simulation.

use core::future::Future;

use crate::nmt::NmtCommand;
use crate::node_id::NodeId;
use crate::object_dictionary::ObjectDictionary;
use crate::device_description::LoadError;
use crate::sdo::SdoError;

/// The bus-level services consumed by the master
///
/// An implementation wraps one CAN channel and one SDO request/response
/// pipeline per node. All SDO methods resolve once the remote node confirmed
/// or aborted the transfer; request timeouts are enforced by the caller.
pub trait MasterBus: Send + Sync + 'static {
    /// Read the value of a remote object
    fn sdo_upload(
        &self,
        node: NodeId,
        index: u16,
        sub: u8,
    ) -> impl Future<Output = Result<Vec<u8>, SdoError>> + Send;

    /// Write a value to a remote object
    fn sdo_download(
        &self,
        node: NodeId,
        index: u16,
        sub: u8,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<(), SdoError>> + Send;

    /// Push a concise (binary) DCF file to a remote node
    fn download_dcf(
        &self,
        node: NodeId,
        path: &str,
    ) -> impl Future<Output = Result<(), SdoError>> + Send;

    /// Issue an NMT command; node 0 broadcasts to all nodes
    fn send_nmt(&self, command: NmtCommand, node: u8);

    /// Trigger transmission of a master TPDO by PDO number
    fn trigger_tpdo(&self, tpdo: u16);

    /// Write into the master's TPDO image for a node's object, optionally
    /// triggering the transmission event
    fn write_mapped_tpdo(
        &self,
        node: NodeId,
        index: u16,
        sub: u8,
        data: &[u8],
        event: bool,
    ) -> Result<(), SdoError>;
}

/// The device-description loader consumed by the master during discovery
pub trait ConfigLoader: Send + Sync + 'static {
    /// Parse the description stored under `path` into the dictionary of the
    /// given node
    fn load_dictionary(&self, path: &str, node: NodeId) -> Result<ObjectDictionary, LoadError>;
}

//! An in-process simulation of the bus collaborator

use std::collections::HashMap;
use std::sync::Mutex;

use canmotion_common::nmt::NmtCommand;
use canmotion_common::sdo::{AbortCode, SdoError};
use canmotion_common::traits::MasterBus;
use canmotion_common::NodeId;

/// One recorded bus operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    /// An SDO upload (read) from a remote object
    Upload {
        /// Target node
        node: u8,
        /// Object index
        object: u16,
        /// Object sub-index
        sub: u8,
    },
    /// An SDO download (write) to a remote object
    Download {
        /// Target node
        node: u8,
        /// Object index
        object: u16,
        /// Object sub-index
        sub: u8,
        /// The written bytes
        data: Vec<u8>,
    },
    /// An NMT command
    Nmt {
        /// The command
        command: NmtCommand,
        /// Target node, 0 for broadcast
        node: u8,
    },
    /// A triggered master TPDO
    Tpdo {
        /// The PDO number
        tpdo: u16,
    },
    /// A write into the master's mapped TPDO image
    MappedTpdo {
        /// Target node
        node: u8,
        /// Object index
        object: u16,
        /// Object sub-index
        sub: u8,
        /// The written bytes
        data: Vec<u8>,
        /// Whether the transmission event was triggered
        event: bool,
    },
    /// A concise DCF download
    Dcf {
        /// Target node
        node: u8,
        /// The pushed file
        path: String,
    },
}

/// The simulated bus
///
/// Holds the remote dictionaries of all simulated slaves as raw bytes and a
/// log of every operation in issue order.
#[derive(Debug, Default)]
pub struct SimBus {
    remote: Mutex<HashMap<(u8, u16, u8), Vec<u8>>>,
    upload_failures: Mutex<HashMap<(u8, u16, u8), AbortCode>>,
    download_failures: Mutex<HashMap<(u8, u16, u8), AbortCode>>,
    log: Mutex<Vec<BusOp>>,
}

impl SimBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a remote dictionary entry
    pub fn set_remote(&self, node: u8, object: u16, sub: u8, data: Vec<u8>) {
        self.remote
            .lock()
            .unwrap()
            .insert((node, object, sub), data);
    }

    /// The current remote value of an object, if any
    pub fn remote_value(&self, node: u8, object: u16, sub: u8) -> Option<Vec<u8>> {
        self.remote.lock().unwrap().get(&(node, object, sub)).cloned()
    }

    /// Abort all uploads of the given object with a code
    pub fn fail_upload(&self, node: u8, object: u16, sub: u8, code: AbortCode) {
        self.upload_failures
            .lock()
            .unwrap()
            .insert((node, object, sub), code);
    }

    /// Abort all downloads of the given object with a code
    pub fn fail_download(&self, node: u8, object: u16, sub: u8, code: AbortCode) {
        self.download_failures
            .lock()
            .unwrap()
            .insert((node, object, sub), code);
    }

    /// A snapshot of all recorded operations
    pub fn ops(&self) -> Vec<BusOp> {
        self.log.lock().unwrap().clone()
    }

    /// The recorded SDO operations (uploads and downloads) for one node
    pub fn sdo_ops_for(&self, node: u8) -> Vec<BusOp> {
        self.ops()
            .into_iter()
            .filter(|op| {
                matches!(op, BusOp::Upload { node: n, .. } | BusOp::Download { node: n, .. } if *n == node)
            })
            .collect()
    }

    /// The recorded downloads for one node as (object, sub, data)
    pub fn downloads_for(&self, node: u8) -> Vec<(u16, u8, Vec<u8>)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                BusOp::Download {
                    node: n,
                    object,
                    sub,
                    data,
                } if n == node => Some((object, sub, data)),
                _ => None,
            })
            .collect()
    }

    /// Whether a download of exactly these bytes was recorded
    pub fn has_download(&self, node: u8, object: u16, sub: u8, data: &[u8]) -> bool {
        self.downloads_for(node)
            .iter()
            .any(|(o, s, d)| *o == object && *s == sub && d == data)
    }

    /// Number of downloads recorded for one object
    pub fn download_count(&self, node: u8, object: u16, sub: u8) -> usize {
        self.downloads_for(node)
            .iter()
            .filter(|(o, s, _)| *o == object && *s == sub)
            .count()
    }

    /// Number of downloads recorded for one object with exactly these bytes
    pub fn download_data_count(&self, node: u8, object: u16, sub: u8, data: &[u8]) -> usize {
        self.downloads_for(node)
            .iter()
            .filter(|(o, s, d)| *o == object && *s == sub && d == data)
            .count()
    }

    /// Number of uploads recorded for one object
    pub fn upload_count(&self, node: u8, object: u16, sub: u8) -> usize {
        self.ops()
            .iter()
            .filter(|op| {
                matches!(op, BusOp::Upload { node: n, object: o, sub: s } if *n == node && *o == object && *s == sub)
            })
            .count()
    }

    /// Number of recorded NMT commands matching command and node
    pub fn nmt_count(&self, command: NmtCommand, node: u8) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, BusOp::Nmt { command: c, node: n } if *c == command && *n == node))
            .count()
    }

    /// The recorded concise DCF downloads
    pub fn dcf_downloads(&self) -> Vec<(u8, String)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                BusOp::Dcf { node, path } => Some((node, path)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: BusOp) {
        self.log.lock().unwrap().push(op);
    }
}

impl MasterBus for SimBus {
    fn sdo_upload(
        &self,
        node: NodeId,
        object: u16,
        sub: u8,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, SdoError>> + Send {
        async move {
            let node = node.raw();
            self.record(BusOp::Upload { node, object, sub });
            if let Some(code) = self
                .upload_failures
                .lock()
                .unwrap()
                .get(&(node, object, sub))
            {
                return Err(SdoError::abort(*code));
            }
            self.remote_value(node, object, sub)
                .ok_or(SdoError::abort(AbortCode::NoSuchObject))
        }
    }

    fn sdo_download(
        &self,
        node: NodeId,
        object: u16,
        sub: u8,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<(), SdoError>> + Send {
        async move {
            let node = node.raw();
            self.record(BusOp::Download {
                node,
                object,
                sub,
                data: data.clone(),
            });
            if let Some(code) = self
                .download_failures
                .lock()
                .unwrap()
                .get(&(node, object, sub))
            {
                return Err(SdoError::abort(*code));
            }
            self.remote
                .lock()
                .unwrap()
                .insert((node, object, sub), data);
            Ok(())
        }
    }

    fn download_dcf(
        &self,
        node: NodeId,
        path: &str,
    ) -> impl std::future::Future<Output = Result<(), SdoError>> + Send {
        let path = path.to_owned();
        async move {
            self.record(BusOp::Dcf {
                node: node.raw(),
                path,
            });
            Ok(())
        }
    }

    fn send_nmt(&self, command: NmtCommand, node: u8) {
        self.record(BusOp::Nmt { command, node });
    }

    fn trigger_tpdo(&self, tpdo: u16) {
        self.record(BusOp::Tpdo { tpdo });
    }

    fn write_mapped_tpdo(
        &self,
        node: NodeId,
        object: u16,
        sub: u8,
        data: &[u8],
        event: bool,
    ) -> Result<(), SdoError> {
        self.record(BusOp::MappedTpdo {
            node: node.raw(),
            object,
            sub,
            data: data.to_vec(),
            event,
        });
        Ok(())
    }
}

//! Typed SDO access to one remote node

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use canmotion_common::objects::{CanopenType, ObjectValue, Primitive};
use canmotion_common::sdo::{AbortCode, SdoError};
use canmotion_common::traits::MasterBus;
use canmotion_common::NodeId;

/// The default per-request timeout applied to every SDO transfer
pub const DEFAULT_SDO_TIMEOUT: Duration = Duration::from_secs(1);

/// A typed request/response shim for the SDO server of one node
///
/// All drivers talk to their slave through one of these. Every call is
/// asynchronous and resolves with the transfer result; expiry of the
/// master-wide timeout surfaces as [SdoError::Timeout].
pub struct SdoClient<B> {
    bus: Arc<B>,
    node: NodeId,
    timeout: Duration,
}

impl<B> Clone for SdoClient<B> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            node: self.node,
            timeout: self.timeout,
        }
    }
}

impl<B: MasterBus> SdoClient<B> {
    /// Create a new client for the given node
    pub fn new(bus: Arc<B>, node: NodeId) -> Self {
        Self {
            bus,
            node,
            timeout: DEFAULT_SDO_TIMEOUT,
        }
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The node this client talks to
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Read a remote object as a primitive type
    pub async fn read<T: Primitive>(&self, index: u16, sub: u8) -> Result<T, SdoError> {
        let bytes = self
            .request(self.bus.sdo_upload(self.node, index, sub))
            .await?;
        T::from_le_slice(&bytes).ok_or(SdoError::abort(AbortCode::DataTypeMismatch))
    }

    /// Write a primitive value to a remote object
    pub async fn write<T: Primitive>(&self, index: u16, sub: u8, value: T) -> Result<(), SdoError> {
        self.request(self.bus.sdo_download(self.node, index, sub, value.to_le_vec()))
            .await
    }

    /// Read a remote object, decoding it as the given declared type
    pub async fn read_value(
        &self,
        index: u16,
        sub: u8,
        ty: CanopenType,
    ) -> Result<ObjectValue, SdoError> {
        let bytes = self
            .request(self.bus.sdo_upload(self.node, index, sub))
            .await?;
        ObjectValue::from_le_bytes(ty, &bytes).map_err(SdoError::from)
    }

    /// Write a typed value to a remote object
    pub async fn write_value(
        &self,
        index: u16,
        sub: u8,
        value: &ObjectValue,
    ) -> Result<(), SdoError> {
        self.request(
            self.bus
                .sdo_download(self.node, index, sub, value.to_le_bytes()),
        )
        .await
    }

    /// Push a concise DCF file to the node
    ///
    /// Not subject to the per-request timeout: a concise DCF is a segmented
    /// transfer whose duration depends on the file size.
    pub async fn download_dcf(&self, path: &str) -> Result<(), SdoError> {
        self.bus.download_dcf(self.node, path).await
    }

    async fn request<T>(
        &self,
        fut: impl Future<Output = Result<T, SdoError>>,
    ) -> Result<T, SdoError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SdoError::Timeout),
        }
    }
}

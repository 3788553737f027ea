//! The per-driver configuration engine
//!
//! Transforms a slave's remote dictionary to match its device description
//! and activates its PDOs. The whole sequence is serialized per driver (one
//! SDO in flight at a time); configurations of different drivers run
//! concurrently. Processing stops at the first error, which carries the
//! phase, index and sub-index of the failing step.

use std::sync::Arc;

use canmotion_common::objects::{
    index, COB_ID_CAN_MASK, COB_ID_VALUE_MASK, PDO_INVALID_BIT, PDO_MAPPING_OFFSET,
};
use canmotion_common::sdo::{AbortCode, SdoError};
use canmotion_common::traits::MasterBus;
use futures::future::BoxFuture;
use futures::FutureExt;
use snafu::{ResultExt, Snafu};

use crate::driver::{ClearConfigurationStrategy, DriverConfig, DriverCore};
use crate::master::MasterShared;
use crate::sdo_client::SdoClient;

/// Error produced by a node configuration, pinpointing the failing step
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// Reading the locally configured value failed
    #[snafu(display("While reading the local SDO value from 0x{index:04X}/0x{sub:02X}: {source}"))]
    ReadLocal {
        /// Index of the failing object
        index: u16,
        /// Sub-index of the failing object
        sub: u8,
        /// The underlying error
        source: SdoError,
    },
    /// Reading a remote object failed
    #[snafu(display("While reading from SDO 0x{index:04X}/0x{sub:02X}: {source}"))]
    ReadRemote {
        /// Index of the failing object
        index: u16,
        /// Sub-index of the failing object
        sub: u8,
        /// The underlying error
        source: SdoError,
    },
    /// Writing a remote object failed
    #[snafu(display("While writing to SDO 0x{index:04X}/0x{sub:02X}: {source}"))]
    WriteRemote {
        /// Index of the failing object
        index: u16,
        /// Sub-index of the failing object
        sub: u8,
        /// The underlying error
        source: SdoError,
    },
    /// The clear-configuration strategy failed
    #[snafu(display("While clearing the node configuration: {source}"))]
    ClearConfiguration {
        /// The underlying error
        source: SdoError,
    },
    /// Pushing the concise DCF failed
    #[snafu(display("While downloading the concise DCF: {source}"))]
    DcfDownload {
        /// The underlying error
        source: SdoError,
    },
}

/// Build the configuration future for one driver
///
/// The future owns clones of everything it needs so it can be spawned while
/// the driver stays behind on the master loop.
pub(crate) fn node_config_future<B: MasterBus>(
    core: &DriverCore,
    shared: &Arc<MasterShared<B>>,
) -> BoxFuture<'static, Result<(), ConfigError>> {
    let shared = shared.clone();
    let config = core.config().clone();
    let clear = core.clear_configuration();
    async move { run_node_config(shared, config, clear).await }.boxed()
}

async fn run_node_config<B: MasterBus>(
    shared: Arc<MasterShared<B>>,
    config: Arc<DriverConfig>,
    clear: Option<ClearConfigurationStrategy>,
) -> Result<(), ConfigError> {
    if config.binary_dcf.is_some() {
        infer_pair_from_master_tables(&shared, config.node.raw());
    }

    let engine = ConfigEngine {
        shared: &shared,
        config: &config,
        client: shared.sdo_client(config.node),
    };

    match clear {
        None => engine.run().await,
        Some(strategy) => match strategy().await {
            Err(SdoError::Canceled) => {
                log::info!(
                    "node {}: configuration canceled by the clear strategy",
                    config.node
                );
                Ok(())
            }
            Err(source) => Err(ConfigError::ClearConfiguration { source }),
            Ok(()) => {
                engine.run().await?;
                if let Some(path) = &config.binary_dcf {
                    engine
                        .client
                        .download_dcf(path)
                        .await
                        .context(DcfDownloadSnafu)?;
                }
                Ok(())
            }
        },
    }
}

struct ConfigEngine<'a, B: MasterBus> {
    shared: &'a Arc<MasterShared<B>>,
    config: &'a DriverConfig,
    client: SdoClient<B>,
}

impl<B: MasterBus> ConfigEngine<'_, B> {
    async fn run(&self) -> Result<(), ConfigError> {
        for (object, subs) in self.config.dictionary.configured_objects() {
            match object {
                index::RPDO_COMM_START..=index::RPDO_COMM_END => {
                    self.infer_pair_from_cob(object);
                    self.activate_pdo(object).await?;
                }
                index::TPDO_COMM_START..=index::TPDO_COMM_END => {
                    self.activate_pdo(object).await?;
                }
                // Mapping objects are pulled in by their control object
                index::RPDO_MAPPING_START..=index::RPDO_MAPPING_END
                | index::TPDO_MAPPING_START..=index::TPDO_MAPPING_END => {}
                _ => self.push_parameters(object, &subs).await?,
            }
        }
        Ok(())
    }

    /// Run the eight-step PDO activation protocol for one control object
    async fn activate_pdo(&self, control: u16) -> Result<(), ConfigError> {
        let mapping = control + PDO_MAPPING_OFFSET;

        // Disable the PDO on the device before touching its parameters
        let device_cob: u32 = self
            .client
            .read(control, 1)
            .await
            .context(ReadRemoteSnafu { index: control, sub: 1u8 })?;
        self.client
            .write(control, 1, device_cob | PDO_INVALID_BIT)
            .await
            .context(WriteRemoteSnafu { index: control, sub: 1u8 })?;

        // Transmission type, then inhibit time (which may be absent locally)
        self.copy_object(control, 2, false).await?;
        self.copy_object(control, 3, true).await?;

        // Clear the mapping count so the entries can be rewritten
        self.client
            .write::<u8>(mapping, 0, 0)
            .await
            .context(WriteRemoteSnafu { index: mapping, sub: 0u8 })?;

        let mapping_subs = self.config.dictionary.configured_subs(mapping);
        if !mapping_subs.is_empty() {
            for &sub in mapping_subs.iter().filter(|&&s| s != 0) {
                self.copy_object(mapping, sub, false).await?;
            }
            // Commit the new mapping count last
            self.copy_object(mapping, 0, false).await?;
        }

        // Rewrite the COB-ID with its valid bit, re-enabling the PDO
        self.copy_object(control, 1, false).await
    }

    /// Copy one value from the local dictionary to the remote node
    ///
    /// With `ignore_missing_local`, an absent local entry is skipped without
    /// an error; any other local failure aborts with a ReadLocal context.
    async fn copy_object(
        &self,
        object: u16,
        sub: u8,
        ignore_missing_local: bool,
    ) -> Result<(), ConfigError> {
        let value = match self.config.dictionary.read(object, sub) {
            Ok(value) => value,
            Err(code @ (AbortCode::NoSuchObject | AbortCode::NoSuchSubIndex))
                if ignore_missing_local =>
            {
                log::debug!(
                    "node {}: no local value for 0x{object:04X}:0x{sub:02X} ({code:?}), skipping",
                    self.config.node
                );
                return Ok(());
            }
            Err(code) => {
                return Err(SdoError::from(code)).context(ReadLocalSnafu { index: object, sub })
            }
        };
        self.client
            .write_value(object, sub, value)
            .await
            .context(WriteRemoteSnafu { index: object, sub })
    }

    /// Push the explicitly configured sub-indices of a parameter object
    async fn push_parameters(&self, object: u16, subs: &[u8]) -> Result<(), ConfigError> {
        for &sub in subs {
            let ty = self.config.dictionary.type_of(object, sub);
            match ty {
                Some(ty) if ty.is_transferable() => {
                    self.copy_object(object, sub, false).await?;
                }
                other => {
                    log::error!(
                        "cannot transfer data type {other:?} for SDO 0x{object:04X}/0x{sub:02X}, this data type is not supported"
                    );
                    return Err(ConfigError::WriteRemote {
                        index: object,
                        sub,
                        source: SdoError::abort(AbortCode::DataTypeMismatch),
                    });
                }
            }
        }
        Ok(())
    }

    /// Detect a main/follower pair through a shared RPDO COB-ID
    ///
    /// First claim on a COB-ID wins; a later claimant is paired with the
    /// first one, the smaller node ID becoming the main.
    fn infer_pair_from_cob(&self, control: u16) {
        let Ok(cob) = self.config.dictionary.read_as::<u32>(control, 1) else {
            return;
        };
        let cob = cob & COB_ID_VALUE_MASK;
        let node = self.config.node.raw();

        let mut registry = self.shared.registry.lock().unwrap();
        match registry.claimant(cob) {
            None => registry.claim(cob, node),
            Some(first) if first < node => {
                registry.link(first, node);
                log::info!("follower inference: 0x{node:02X} follows 0x{first:02X}");
            }
            Some(first) if first > node => {
                registry.link(node, first);
                log::info!("follower inference: 0x{first:02X} follows 0x{node:02X}");
            }
            Some(_) => {}
        }
    }
}

/// Follower inference for concise-DCF configurations
///
/// These carry no enumerable PDO parameters, so the pair is found through
/// the master's own description: the selector table at 0x5C00 names the node
/// and RPDO number behind each master TPDO; two master TPDOs sharing a CAN
/// ID mean two drives listening to the same PDO.
fn infer_pair_from_master_tables<B: MasterBus>(shared: &Arc<MasterShared<B>>, node: u8) {
    let fabric = &shared.fabric;

    for selector in index::PDO_SELECTOR_START..=index::PDO_SELECTOR_END {
        let Some(value) = fabric.master_u32(selector, 0) else {
            return; // end of the selector table
        };

        // bits 0-7: node ID, bits 8-15: PDO number
        if (value & 0xFFFF) != (0x0100 | node as u32) {
            continue;
        }

        let cob_index = selector - index::PDO_SELECTOR_START + index::TPDO_COMM_START;
        let Some(cob) = fabric.master_u32(cob_index, 1) else {
            return; // no PDO config on the master side, so no COB-ID
        };
        let cob = cob & COB_ID_CAN_MASK;

        for other_cob_index in index::TPDO_COMM_START..=index::TPDO_COMM_END {
            if other_cob_index == cob_index {
                continue;
            }
            let Some(other_cob) = fabric.master_u32(other_cob_index, 1) else {
                return;
            };
            if (other_cob & COB_ID_CAN_MASK) != cob {
                continue;
            }

            let other_selector =
                other_cob_index - index::TPDO_COMM_START + index::PDO_SELECTOR_START;
            let Some(other_config) = fabric.master_u32(other_selector, 0) else {
                return;
            };
            let other_config = other_config & 0xFFFF;
            if (other_config & 0xFF00) != 0x0100 {
                return; // entry is for a different RPDO number
            }

            let other_node = (other_config & 0xFF) as u8;
            let mut registry = shared.registry.lock().unwrap();
            if other_node < node {
                registry.link(other_node, node);
                log::info!("follower inference: 0x{node:02X} follows 0x{other_node:02X}");
            } else if other_node > node {
                registry.link(node, other_node);
                log::info!("follower inference: 0x{other_node:02X} follows 0x{node:02X}");
            }
            return;
        }
    }
}

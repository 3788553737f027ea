//! SDO error vocabulary
//!
//! Defines the CiA-301 abort codes the configuration engine cares about, the
//! error type carried by every asynchronous SDO operation, and the
//! manufacturer-specific error codes reported through driver error callbacks.

use int_enum::IntEnum;
use snafu::Snafu;

/// SDO Abort Code
///
/// Defines the various reasons an SDO transfer can be aborted
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnallowedPdo = 0x0604_0041,
    /// The number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored because of the device state
    CantStoreDeviceState = 0x0800_0022,
    /// No data available
    NoData = 0x0800_0024,
}

/// Error produced by an asynchronous SDO operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum SdoError {
    /// The transfer was aborted by the server or the local dictionary
    #[snafu(display("SDO abort 0x{code:08X}"))]
    Abort {
        /// The raw CiA-301 abort code
        code: u32,
    },
    /// No response was received within the master SDO timeout
    #[snafu(display("SDO request timed out"))]
    Timeout,
    /// The operation was canceled before completion
    #[snafu(display("operation canceled"))]
    Canceled,
}

impl SdoError {
    /// Shorthand for an abort with a well-known code
    pub fn abort(code: AbortCode) -> Self {
        SdoError::Abort { code: code.into() }
    }

    /// The raw abort code, if this error is an abort
    pub fn abort_code(&self) -> Option<u32> {
        match self {
            SdoError::Abort { code } => Some(*code),
            _ => None,
        }
    }

    /// True for the two abort codes which report an absent object or
    /// sub-index rather than a failed transfer
    pub fn is_missing_entry(&self) -> bool {
        matches!(
            self.abort_code().and_then(|c| AbortCode::try_from(c).ok()),
            Some(AbortCode::NoSuchObject) | Some(AbortCode::NoSuchSubIndex)
        )
    }
}

impl From<AbortCode> for SdoError {
    fn from(code: AbortCode) -> Self {
        SdoError::abort(code)
    }
}

/// Additional error codes in the manufacturer specific range (0xAF00-0xAFFF)
///
/// These are reported through driver error callbacks alongside any CiA-301
/// emergency codes received over EMCY.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u16)]
pub enum DriveErrorCode {
    /// Sending the configuration to the node failed
    NodeConfigurationFailed = 0xAF01,
    /// The node reported a CiA-302 boot error
    NodeBootFailed = 0xAF02,
    /// Reading the fault register failed
    ReadError = 0xAF03,
    /// The node did not appear on the bus
    NodeMissing = 0xAF04,
    /// Writing a value to the node failed
    WriteToNode = 0xAF05,
    /// A firmware update could not be performed
    FirmwareUpdateFailed = 0xAF06,
    /// The paired motor reported an error
    OtherMotorHadError = 0xAFFF,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_entry_detection() {
        assert!(SdoError::abort(AbortCode::NoSuchObject).is_missing_entry());
        assert!(SdoError::abort(AbortCode::NoSuchSubIndex).is_missing_entry());
        assert!(!SdoError::abort(AbortCode::GeneralError).is_missing_entry());
        assert!(!SdoError::Timeout.is_missing_entry());
    }

    #[test]
    fn test_error_code_values() {
        assert_eq!(0xAF05, u16::from(DriveErrorCode::WriteToNode));
        assert_eq!(0xAFFF, u16::from(DriveErrorCode::OtherMotorHadError));
        assert_eq!(0x0602_0000, u32::from(AbortCode::NoSuchObject));
        assert_eq!(0x0609_0011, u32::from(AbortCode::NoSuchSubIndex));
    }
}

//! CANopen object types and well-known addresses

use int_enum::IntEnum;

use crate::sdo::AbortCode;

/// Standard object index ranges and well-known indices
pub mod index {
    /// First RPDO communication parameter object
    pub const RPDO_COMM_START: u16 = 0x1400;
    /// Last RPDO communication parameter object
    pub const RPDO_COMM_END: u16 = 0x15FF;
    /// First RPDO mapping parameter object
    pub const RPDO_MAPPING_START: u16 = 0x1600;
    /// Last RPDO mapping parameter object
    pub const RPDO_MAPPING_END: u16 = 0x17FF;
    /// First TPDO communication parameter object
    pub const TPDO_COMM_START: u16 = 0x1800;
    /// Last TPDO communication parameter object
    pub const TPDO_COMM_END: u16 = 0x19FF;
    /// First TPDO mapping parameter object
    pub const TPDO_MAPPING_START: u16 = 0x1A00;
    /// Last TPDO mapping parameter object
    pub const TPDO_MAPPING_END: u16 = 0x1BFF;

    /// CiA-302 table of textual slave DCF file names, one sub-index per node
    pub const SLAVE_DCF_TABLE: u16 = 0x1F20;
    /// CiA-302 table of concise (binary) slave DCF file names
    pub const SLAVE_CONCISE_DCF_TABLE: u16 = 0x1F22;
    /// CiA-302 table of slave firmware file names
    pub const SLAVE_SOFTWARE_TABLE: u16 = 0x1F58;

    /// Per-node/per-PDO selector table used by generated master descriptions
    pub const PDO_SELECTOR_START: u16 = 0x5C00;
    /// End of the selector table
    pub const PDO_SELECTOR_END: u16 = 0x5DFF;

    /// CiA-402 error code register
    pub const ERROR_CODE: u16 = 0x603F;
    /// CiA-402 control word
    pub const CONTROL_WORD: u16 = 0x6040;
    /// CiA-402 status word
    pub const STATUS_WORD: u16 = 0x6041;
    /// CiA-402 operation mode
    pub const OPERATION_MODE: u16 = 0x6060;
    /// CiA-402 homing offset
    pub const HOME_OFFSET: u16 = 0x607C;
    /// CiA-402 profile position target
    pub const TARGET_POSITION: u16 = 0x607A;
    /// CiA-402 profile velocity
    pub const PROFILE_VELOCITY: u16 = 0x6081;
    /// CiA-402 profile acceleration
    pub const PROFILE_ACCELERATION: u16 = 0x6083;
    /// CiA-402 profile deceleration
    pub const PROFILE_DECELERATION: u16 = 0x6084;
    /// CiA-402 homing method
    pub const HOMING_METHOD: u16 = 0x6098;
    /// CiA-402 homing speeds (sub 1: switch search, sub 2: zero search)
    pub const HOMING_SPEEDS: u16 = 0x6099;
    /// CiA-402 homing acceleration
    pub const HOMING_ACCELERATION: u16 = 0x609A;
}

/// Offset between a PDO communication parameter and its mapping parameter
pub const PDO_MAPPING_OFFSET: u16 = 0x200;

/// High bit of a PDO COB-ID entry; set while the PDO is invalid
pub const PDO_INVALID_BIT: u32 = 0x8000_0000;

/// Mask stripping the flag bits of a PDO COB-ID entry
pub const COB_ID_VALUE_MASK: u32 = 0x1FFF_FFFF;

/// Mask extracting the 11-bit CAN arbitration ID of a COB-ID entry
pub const COB_ID_CAN_MASK: u32 = 0x0000_07FF;

/// CANopen static data type codes, as declared by a device description
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u16)]
pub enum CanopenType {
    /// BOOLEAN
    Boolean = 0x0001,
    /// INTEGER8
    Int8 = 0x0002,
    /// INTEGER16
    Int16 = 0x0003,
    /// INTEGER32
    Int32 = 0x0004,
    /// UNSIGNED8
    UInt8 = 0x0005,
    /// UNSIGNED16
    UInt16 = 0x0006,
    /// UNSIGNED32
    UInt32 = 0x0007,
    /// VISIBLE_STRING
    VisibleString = 0x0009,
}

impl CanopenType {
    /// True for the primitive types the configuration engine can transfer
    pub fn is_transferable(&self) -> bool {
        !matches!(self, CanopenType::VisibleString)
    }
}

/// A typed CANopen object value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectValue {
    /// BOOLEAN value
    Bool(bool),
    /// INTEGER8 value
    I8(i8),
    /// INTEGER16 value
    I16(i16),
    /// INTEGER32 value
    I32(i32),
    /// UNSIGNED8 value
    U8(u8),
    /// UNSIGNED16 value
    U16(u16),
    /// UNSIGNED32 value
    U32(u32),
    /// VISIBLE_STRING value
    VisibleString(String),
}

impl ObjectValue {
    /// The declared type of this value
    pub fn type_code(&self) -> CanopenType {
        match self {
            ObjectValue::Bool(_) => CanopenType::Boolean,
            ObjectValue::I8(_) => CanopenType::Int8,
            ObjectValue::I16(_) => CanopenType::Int16,
            ObjectValue::I32(_) => CanopenType::Int32,
            ObjectValue::U8(_) => CanopenType::UInt8,
            ObjectValue::U16(_) => CanopenType::UInt16,
            ObjectValue::U32(_) => CanopenType::UInt32,
            ObjectValue::VisibleString(_) => CanopenType::VisibleString,
        }
    }

    /// Little-endian wire encoding of the value
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            ObjectValue::Bool(v) => vec![*v as u8],
            ObjectValue::I8(v) => vec![*v as u8],
            ObjectValue::I16(v) => v.to_le_bytes().to_vec(),
            ObjectValue::I32(v) => v.to_le_bytes().to_vec(),
            ObjectValue::U8(v) => vec![*v],
            ObjectValue::U16(v) => v.to_le_bytes().to_vec(),
            ObjectValue::U32(v) => v.to_le_bytes().to_vec(),
            ObjectValue::VisibleString(s) => s.as_bytes().to_vec(),
        }
    }

    /// Decode a value of the given declared type from its wire encoding
    pub fn from_le_bytes(ty: CanopenType, bytes: &[u8]) -> Result<Self, AbortCode> {
        fn take<const N: usize>(bytes: &[u8]) -> Result<[u8; N], AbortCode> {
            if bytes.len() < N {
                Err(AbortCode::DataTypeMismatchLengthLow)
            } else if bytes.len() > N {
                Err(AbortCode::DataTypeMismatchLengthHigh)
            } else {
                let mut buf = [0u8; N];
                buf.copy_from_slice(bytes);
                Ok(buf)
            }
        }

        match ty {
            CanopenType::Boolean => Ok(ObjectValue::Bool(take::<1>(bytes)?[0] != 0)),
            CanopenType::Int8 => Ok(ObjectValue::I8(take::<1>(bytes)?[0] as i8)),
            CanopenType::Int16 => Ok(ObjectValue::I16(i16::from_le_bytes(take(bytes)?))),
            CanopenType::Int32 => Ok(ObjectValue::I32(i32::from_le_bytes(take(bytes)?))),
            CanopenType::UInt8 => Ok(ObjectValue::U8(take::<1>(bytes)?[0])),
            CanopenType::UInt16 => Ok(ObjectValue::U16(u16::from_le_bytes(take(bytes)?))),
            CanopenType::UInt32 => Ok(ObjectValue::U32(u32::from_le_bytes(take(bytes)?))),
            CanopenType::VisibleString => Ok(ObjectValue::VisibleString(
                String::from_utf8_lossy(bytes).into_owned(),
            )),
        }
    }

    /// The value as u16, if it is one
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            ObjectValue::U16(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as u32, if it is one
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ObjectValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a string slice, if it is a VISIBLE_STRING
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ObjectValue::VisibleString(s) => Some(s),
            _ => None,
        }
    }
}

/// A CANopen primitive data type with a fixed wire encoding
///
/// Implemented for the seven primitive types the configuration engine can
/// push to a remote dictionary. Used by the typed SDO client and the typed
/// object dictionary accessors.
pub trait Primitive: Sized + Copy + Send + 'static {
    /// The CANopen type code of this primitive
    const TYPE: CanopenType;

    /// Wrap into an [ObjectValue]
    fn into_value(self) -> ObjectValue;

    /// Extract from an [ObjectValue] of the matching variant
    fn from_value(value: &ObjectValue) -> Option<Self>;

    /// Decode from a little-endian wire encoding of exactly the right length
    fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        match ObjectValue::from_le_bytes(Self::TYPE, bytes) {
            Ok(v) => Self::from_value(&v),
            Err(_) => None,
        }
    }

    /// Little-endian wire encoding
    fn to_le_vec(self) -> Vec<u8> {
        self.into_value().to_le_bytes()
    }
}

macro_rules! impl_primitive {
    ($ty:ty, $code:expr, $variant:ident) => {
        impl Primitive for $ty {
            const TYPE: CanopenType = $code;

            fn into_value(self) -> ObjectValue {
                ObjectValue::$variant(self)
            }

            fn from_value(value: &ObjectValue) -> Option<Self> {
                match value {
                    ObjectValue::$variant(v) => Some(*v),
                    _ => None,
                }
            }
        }
    };
}

impl_primitive!(bool, CanopenType::Boolean, Bool);
impl_primitive!(i8, CanopenType::Int8, I8);
impl_primitive!(i16, CanopenType::Int16, I16);
impl_primitive!(i32, CanopenType::Int32, I32);
impl_primitive!(u8, CanopenType::UInt8, U8);
impl_primitive!(u16, CanopenType::UInt16, U16);
impl_primitive!(u32, CanopenType::UInt32, U32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trips() {
        let cases = [
            ObjectValue::Bool(true),
            ObjectValue::I8(-5),
            ObjectValue::I16(-30000),
            ObjectValue::I32(-100000),
            ObjectValue::U8(0xAB),
            ObjectValue::U16(0xBEEF),
            ObjectValue::U32(0xDEAD_BEEF),
        ];
        for value in cases {
            let bytes = value.to_le_bytes();
            let decoded = ObjectValue::from_le_bytes(value.type_code(), &bytes).unwrap();
            assert_eq!(value, decoded);
        }
    }

    #[test]
    fn test_length_mismatch_rejected() {
        assert_eq!(
            Err(AbortCode::DataTypeMismatchLengthLow),
            ObjectValue::from_le_bytes(CanopenType::UInt32, &[1, 2])
        );
        assert_eq!(
            Err(AbortCode::DataTypeMismatchLengthHigh),
            ObjectValue::from_le_bytes(CanopenType::UInt8, &[1, 2])
        );
    }
}

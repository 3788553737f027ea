//! Device description files
//!
//! A [DeviceDescription] is the TOML rendition of a slave's DCF: the list of
//! object values the master pushes to the node during configuration, plus any
//! defaults the application wants readable locally. Parsing a description
//! produces an [ObjectDictionary] for the node's driver.
//!
//! # An example TOML file
//!
//! ```toml
//! # RPDO 1: drive listens on COB-ID 0x203
//! [[object]]
//! index = 0x1400
//! sub = 1
//! type = "u32"
//! value = 0x203
//!
//! [[object]]
//! index = 0x1400
//! sub = 2
//! type = "u8"
//! value = 254
//!
//! # Profile acceleration, declared but not pushed during configuration
//! [[object]]
//! index = 0x6083
//! sub = 0
//! type = "u32"
//! value = 1000
//! default = true
//! ```

use std::path::Path;

use serde::{de, Deserialize, Deserializer};
use snafu::{ResultExt, Snafu};

use crate::object_dictionary::ObjectDictionary;
use crate::objects::ObjectValue;

/// Error returned when loading device description files
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// Reading the file failed
    #[snafu(display("IO error loading {path}: {source:?}"))]
    Io {
        /// The path that could not be read
        path: String,
        /// The underlying IO error
        source: std::io::Error,
    },
    /// The file is not valid TOML or violates the description schema
    #[snafu(display("Error parsing TOML: {source}"))]
    TomlDeserialization {
        /// The underlying TOML error
        source: toml::de::Error,
    },
}

/// A parsed device description
#[derive(Debug, Clone)]
pub struct DeviceDescription {
    objects: Vec<ObjectEntry>,
}

impl DeviceDescription {
    /// Read a description from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<DeviceDescription, LoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read a description from a string
    pub fn load_from_str(s: &str) -> Result<DeviceDescription, LoadError> {
        let raw: DescriptionSerializer = toml::from_str(s).context(TomlDeserializationSnafu)?;
        Ok(DeviceDescription {
            objects: raw.object,
        })
    }

    /// Build the object dictionary described by this file
    pub fn into_dictionary(self) -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        for entry in self.objects {
            if entry.default {
                od.set_default(entry.index, entry.sub, entry.value);
            } else {
                od.set(entry.index, entry.sub, entry.value);
            }
        }
        od
    }

    /// The number of object entries in the description
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if the description declares no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptionSerializer {
    #[serde(default, deserialize_with = "deserialize_objects")]
    object: Vec<ObjectEntry>,
}

#[derive(Clone, Debug)]
struct ObjectEntry {
    index: u16,
    sub: u8,
    value: ObjectValue,
    default: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryType {
    Bool,
    I8,
    I16,
    I32,
    U8,
    U16,
    U32,
    String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntrySerializer {
    pub index: u16,
    pub sub: u8,
    pub value: toml::Value,
    #[serde(rename = "type")]
    pub ty: EntryType,
    #[serde(default)]
    pub default: bool,
}

fn integer_value<'de, D, T>(value: &toml::Value) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let value = value.as_integer().ok_or(de::Error::invalid_type(
        de::Unexpected::Str(&value.to_string()),
        &"an integer",
    ))?;
    T::try_from(value).map_err(|_| {
        de::Error::invalid_value(de::Unexpected::Signed(value), &"an integer in range")
    })
}

fn deserialize_objects<'de, D>(deserializer: D) -> Result<Vec<ObjectEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<EntrySerializer>::deserialize(deserializer)?;

    raw.into_iter()
        .map(|entry| {
            let value = match entry.ty {
                EntryType::Bool => {
                    let value = entry.value.as_bool().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&entry.value.to_string()),
                        &"a boolean",
                    ))?;
                    ObjectValue::Bool(value)
                }
                EntryType::I8 => ObjectValue::I8(integer_value::<D, i8>(&entry.value)?),
                EntryType::I16 => ObjectValue::I16(integer_value::<D, i16>(&entry.value)?),
                EntryType::I32 => ObjectValue::I32(integer_value::<D, i32>(&entry.value)?),
                EntryType::U8 => ObjectValue::U8(integer_value::<D, u8>(&entry.value)?),
                EntryType::U16 => ObjectValue::U16(integer_value::<D, u16>(&entry.value)?),
                EntryType::U32 => ObjectValue::U32(integer_value::<D, u32>(&entry.value)?),
                EntryType::String => {
                    let value = entry.value.as_str().ok_or(de::Error::invalid_type(
                        de::Unexpected::Str(&entry.value.to_string()),
                        &"a string",
                    ))?;
                    ObjectValue::VisibleString(value.to_string())
                }
            };
            Ok(ObjectEntry {
                index: entry.index,
                sub: entry.sub,
                value,
                default: entry.default,
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_description_parse() {
        let str = r#"
        [[object]]
        index = 0x1400
        sub = 1
        type = "u32"
        value = 0x203

        [[object]]
        index = 0x6083
        sub = 0
        type = "u32"
        value = 1000
        default = true
        "#;

        let description = match DeviceDescription::load_from_str(str) {
            Ok(description) => description,
            Err(e) => {
                println!("{}", e);
                panic!("Failed to parse description");
            }
        };
        assert_eq!(2, description.len());

        let od = description.into_dictionary();
        assert_eq!(0x203u32, od.read_as::<u32>(0x1400, 1).unwrap());
        assert_eq!(vec![(0x1400, vec![1])], od.configured_objects());
    }

    #[test]
    fn test_out_of_range_integer() {
        let str = r#"
        [[object]]
        index = 0x1000
        sub = 0
        type = "u8"
        value = 256
        "#;

        let result = DeviceDescription::load_from_str(str);
        assert!(result.is_err());
    }
}

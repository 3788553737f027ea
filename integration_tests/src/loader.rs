//! An in-memory device-description loader

use std::collections::HashMap;
use std::sync::Mutex;

use canmotion_common::device_description::{DeviceDescription, LoadError};
use canmotion_common::traits::ConfigLoader;
use canmotion_common::{NodeId, ObjectDictionary};

/// A [ConfigLoader] serving dictionaries from a map instead of the file
/// system
#[derive(Debug, Default)]
pub struct MapLoader {
    dictionaries: Mutex<HashMap<String, ObjectDictionary>>,
}

impl MapLoader {
    /// Create an empty loader
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dictionary under a path
    pub fn insert(&self, path: &str, dictionary: ObjectDictionary) {
        self.dictionaries
            .lock()
            .unwrap()
            .insert(path.to_owned(), dictionary);
    }

    /// Register a dictionary parsed from TOML device-description text
    pub fn insert_toml(&self, path: &str, toml: &str) {
        let dictionary = DeviceDescription::load_from_str(toml)
            .expect("invalid device description in test")
            .into_dictionary();
        self.insert(path, dictionary);
    }
}

impl ConfigLoader for MapLoader {
    fn load_dictionary(&self, path: &str, _node: NodeId) -> Result<ObjectDictionary, LoadError> {
        self.dictionaries
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| LoadError::Io {
                path: path.to_owned(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "unknown description"),
            })
    }
}

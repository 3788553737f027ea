//! In-memory object dictionary
//!
//! Each node known to the master has one dictionary, derived from its device
//! description. The dictionary stores typed values keyed by index and
//! sub-index and remembers which entries were set explicitly; only explicit
//! entries participate in the slave configuration protocol.

use std::collections::BTreeMap;

use crate::objects::{CanopenType, ObjectValue, Primitive};
use crate::sdo::AbortCode;

#[derive(Clone, Debug)]
struct Entry {
    value: ObjectValue,
    explicit: bool,
}

/// A per-node in-memory object dictionary
#[derive(Clone, Debug, Default)]
pub struct ObjectDictionary {
    entries: BTreeMap<(u16, u8), Entry>,
}

impl ObjectDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an entry, marking it as explicitly configured
    pub fn set(&mut self, index: u16, sub: u8, value: ObjectValue) {
        self.entries.insert((index, sub), Entry { value, explicit: true });
    }

    /// Set an entry without marking it as explicitly configured
    ///
    /// Default values declared by a device description land here; they are
    /// readable but are not pushed to the remote node.
    pub fn set_default(&mut self, index: u16, sub: u8, value: ObjectValue) {
        self.entries.insert((index, sub), Entry { value, explicit: false });
    }

    /// Remove an entry
    pub fn clear(&mut self, index: u16, sub: u8) {
        self.entries.remove(&(index, sub));
    }

    /// Read an entry
    ///
    /// Reports `NoSuchObject` when no sub-index exists at all for the index
    /// and `NoSuchSubIndex` when the index exists but the sub-index does not.
    pub fn read(&self, index: u16, sub: u8) -> Result<&ObjectValue, AbortCode> {
        match self.entries.get(&(index, sub)) {
            Some(entry) => Ok(&entry.value),
            None if self.contains_index(index) => Err(AbortCode::NoSuchSubIndex),
            None => Err(AbortCode::NoSuchObject),
        }
    }

    /// Read an entry as a specific primitive type
    pub fn read_as<T: Primitive>(&self, index: u16, sub: u8) -> Result<T, AbortCode> {
        T::from_value(self.read(index, sub)?).ok_or(AbortCode::DataTypeMismatch)
    }

    /// Read a VISIBLE_STRING entry
    pub fn read_string(&self, index: u16, sub: u8) -> Result<&str, AbortCode> {
        self.read(index, sub)?
            .as_str()
            .ok_or(AbortCode::DataTypeMismatch)
    }

    /// The declared type of an entry, if present
    pub fn type_of(&self, index: u16, sub: u8) -> Option<CanopenType> {
        self.entries.get(&(index, sub)).map(|e| e.value.type_code())
    }

    /// True if any sub-index exists for the given index
    pub fn contains_index(&self, index: u16) -> bool {
        self.entries
            .range((index, 0)..=(index, 255))
            .next()
            .is_some()
    }

    /// Enumerate the explicitly configured objects
    ///
    /// Returns one entry per index carrying at least one explicit value, in
    /// ascending index order, each with its explicit sub-indices in ascending
    /// order. This is the iteration order of the configuration engine.
    pub fn configured_objects(&self) -> Vec<(u16, Vec<u8>)> {
        let mut result: Vec<(u16, Vec<u8>)> = Vec::new();
        for (&(index, sub), entry) in &self.entries {
            if !entry.explicit {
                continue;
            }
            match result.last_mut() {
                Some((last, subs)) if *last == index => subs.push(sub),
                _ => result.push((index, vec![sub])),
            }
        }
        result
    }

    /// The explicit sub-indices of one object, ascending
    pub fn configured_subs(&self, index: u16) -> Vec<u8> {
        self.entries
            .range((index, 0)..=(index, 255))
            .filter(|(_, e)| e.explicit)
            .map(|(&(_, sub), _)| sub)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_entry_codes() {
        let mut od = ObjectDictionary::new();
        od.set(0x1400, 1, ObjectValue::U32(0x203));

        assert_eq!(Err(AbortCode::NoSuchObject), od.read(0x1401, 1).map(|_| ()));
        assert_eq!(
            Err(AbortCode::NoSuchSubIndex),
            od.read(0x1400, 3).map(|_| ())
        );
        assert_eq!(0x203u32, od.read_as::<u32>(0x1400, 1).unwrap());
    }

    #[test]
    fn test_typed_read_mismatch() {
        let mut od = ObjectDictionary::new();
        od.set(0x2000, 0, ObjectValue::U16(7));
        assert_eq!(
            Err(AbortCode::DataTypeMismatch),
            od.read_as::<u32>(0x2000, 0)
        );
    }

    #[test]
    fn test_configured_objects_order_and_explicitness() {
        let mut od = ObjectDictionary::new();
        od.set(0x6083, 0, ObjectValue::U32(1000));
        od.set(0x1400, 2, ObjectValue::U8(254));
        od.set(0x1400, 1, ObjectValue::U32(0x203));
        od.set_default(0x6084, 0, ObjectValue::U32(1000));

        assert_eq!(
            vec![(0x1400, vec![1, 2]), (0x6083, vec![0])],
            od.configured_objects()
        );
        assert!(od.configured_subs(0x6084).is_empty());
    }
}

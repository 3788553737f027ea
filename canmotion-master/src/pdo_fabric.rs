//! The master's local process-data image
//!
//! The fabric holds two things: the master's own object dictionary (where
//! RPDOs mapped into the master land, and where the CiA-302 file tables
//! live) and a per-node image of the RPDO values most recently received for
//! each slave. Every externally visible write raises an event on the master
//! loop so drivers observe changes in bus-arrival order.

use std::collections::HashMap;
use std::sync::Mutex;

use canmotion_common::objects::ObjectValue;
use canmotion_common::ObjectDictionary;
use tokio::sync::mpsc::UnboundedSender;

use crate::master::MasterEvent;

/// The master-side SDO/PDO image
pub struct PdoFabric {
    master_od: Mutex<ObjectDictionary>,
    rpdo_images: Mutex<HashMap<(u8, u16, u8), ObjectValue>>,
    events: UnboundedSender<MasterEvent>,
}

impl PdoFabric {
    pub(crate) fn new(master_od: ObjectDictionary, events: UnboundedSender<MasterEvent>) -> Self {
        Self {
            master_od: Mutex::new(master_od),
            rpdo_images: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Read an object from the master's own dictionary
    pub fn master_object(&self, index: u16, sub: u8) -> Option<ObjectValue> {
        self.master_od.lock().unwrap().read(index, sub).ok().cloned()
    }

    /// Read a string entry from the master's own dictionary
    pub fn master_string(&self, index: u16, sub: u8) -> Option<String> {
        self.master_object(index, sub)
            .and_then(|v| v.as_str().map(str::to_owned))
    }

    /// Read an unsigned 32-bit entry from the master's own dictionary
    pub fn master_u32(&self, index: u16, sub: u8) -> Option<u32> {
        self.master_object(index, sub).and_then(|v| v.as_u32())
    }

    /// Write an object in the master's own dictionary and notify the drivers
    ///
    /// This is the path taken both by bus ingress (an RPDO mapped into the
    /// master fired) and by master-object setter strategies.
    pub fn write_master_object(&self, index: u16, sub: u8, value: ObjectValue) {
        self.master_od.lock().unwrap().set(index, sub, value);
        self.events
            .send(MasterEvent::MasterObjectWritten { index, sub })
            .ok();
    }

    /// Blank a string entry in the master's own dictionary without raising a
    /// change event (used by the pre-reset hooks on the file tables)
    pub(crate) fn blank_master_string(&self, index: u16, sub: u8) {
        self.master_od
            .lock()
            .unwrap()
            .set(index, sub, ObjectValue::VisibleString(String::new()));
    }

    /// The most recent RPDO value received for a node's object
    pub fn rpdo_value(&self, node: u8, index: u16, sub: u8) -> Option<ObjectValue> {
        self.rpdo_images
            .lock()
            .unwrap()
            .get(&(node, index, sub))
            .cloned()
    }

    /// Record an RPDO value received for a node and notify its driver
    pub fn write_rpdo(&self, node: u8, index: u16, sub: u8, value: ObjectValue) {
        self.rpdo_images
            .lock()
            .unwrap()
            .insert((node, index, sub), value);
        self.events
            .send(MasterEvent::RpdoWritten { node, index, sub })
            .ok();
    }
}

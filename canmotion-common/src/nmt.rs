//! NMT command and state vocabulary
//!
//! The master never frames NMT messages itself; the bus collaborator does.
//! These types are the shared language between the master, the drivers and
//! the bus for the CiA-301 network management lifecycle.

/// The command specifier of an NMT command message
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    /// Start remote node
    Start = 1,
    /// Stop remote node
    Stop = 2,
    /// Enter pre-operational state
    EnterPreOp = 128,
    /// Reset the node application
    ResetNode = 129,
    /// Reset node communications
    ResetComm = 130,
}

impl NmtCommand {
    /// Parse a command specifier byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Start),
            2 => Some(Self::Stop),
            128 => Some(Self::EnterPreOp),
            129 => Some(Self::ResetNode),
            130 => Some(Self::ResetComm),
            _ => None,
        }
    }
}

/// The NMT state of a node, as reported by heartbeat or boot-up messages
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// The node has just booted
    Bootup = 0,
    /// The node is stopped
    Stopped = 4,
    /// The node is operational
    Operational = 5,
    /// The node is pre-operational
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            NmtState::Bootup => "Bootup",
            NmtState::Stopped => "Stopped",
            NmtState::Operational => "Operational",
            NmtState::PreOperational => "PreOperational",
        };
        write!(f, "{s}")
    }
}

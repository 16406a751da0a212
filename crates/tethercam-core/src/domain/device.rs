//! Device identity and the redirection state machine.
//!
//! A tethered camera is identified by its USB vendor/product pair, which is
//! stable, and located by its bus address, which is not: re-plugging the
//! cable (or the host re-enumerating the hub) can move it to a new port.
//!
//! # Redirection lifecycle
//!
//! ```text
//!            bind            attach
//! Unbound ──────────► Bound ──────────► Attached
//!    ▲                  ▲                   │
//!    │                  │ bind              │ detach (from any state)
//!    │                  │                   ▼
//!    └─────────────── Detached ◄────────────┘
//! ```
//!
//! - `bind` shares the device with the host redirection facility.
//! - `attach` hands a shared device to the guest.
//! - `detach` pulls the device back from the guest.  A detached device must be
//!   bound again before it can be re-attached.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing identifiers from configuration or tool output.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceParseError {
    #[error("invalid USB id {0:?}: expected vvvv:pppp in hexadecimal")]
    InvalidUsbId(String),
    #[error("invalid bus address {0:?}: expected <bus>-<port>[.<port>...]")]
    InvalidBusAddress(String),
}

// ── UsbId ─────────────────────────────────────────────────────────────────────

/// USB vendor/product identity (e.g. `04b0:0454` for a Nikon Z6_3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl FromStr for UsbId {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DeviceParseError::InvalidUsbId(s.to_string());
        let (vendor, product) = s.trim().split_once(':').ok_or_else(invalid)?;
        let parse = |part: &str| {
            if part.is_empty() || part.len() > 4 {
                return Err(invalid());
            }
            u16::from_str_radix(part, 16).map_err(|_| invalid())
        };
        Ok(Self::new(parse(vendor)?, parse(product)?))
    }
}

impl TryFrom<String> for UsbId {
    type Error = DeviceParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UsbId> for String {
    fn from(id: UsbId) -> Self {
        id.to_string()
    }
}

// ── BusAddress ────────────────────────────────────────────────────────────────

/// Host-assigned attachment point of a USB device, e.g. `1-4` or `2-1.3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusAddress(String);

impl BusAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BusAddress {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || DeviceParseError::InvalidBusAddress(s.to_string());
        let is_number = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());

        let (bus, ports) = s.split_once('-').ok_or_else(invalid)?;
        if !is_number(bus) || !ports.split('.').all(is_number) {
            return Err(invalid());
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for BusAddress {
    type Error = DeviceParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BusAddress> for String {
    fn from(addr: BusAddress) -> Self {
        addr.0
    }
}

// ── Redirection state machine ─────────────────────────────────────────────────

/// Where a device currently sits in the host → guest redirection lifecycle.
///
/// `Attached` implies the device is also shared (bound); there is no way to
/// represent an attached-but-unbound device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectionState {
    /// Not shared with the redirection facility.
    Unbound,
    /// Shared and available for attachment.
    Bound,
    /// Attached to the guest.
    Attached,
    /// Pulled back from the guest; re-binding is required before attach.
    Detached,
}

impl RedirectionState {
    /// `true` for `Bound` and `Attached`.
    pub fn is_bound(self) -> bool {
        matches!(self, Self::Bound | Self::Attached)
    }

    pub fn is_attached(self) -> bool {
        self == Self::Attached
    }

    /// Applies `transition`, returning the resulting state.
    ///
    /// Re-applying a transition the device has already made (or gone beyond)
    /// is a no-op that returns the current state unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for `attach` from `Unbound` or `Detached`.
    pub fn apply(self, transition: Transition) -> Result<Self, InvalidTransition> {
        use RedirectionState::*;
        match (self, transition) {
            (Unbound | Detached, Transition::Bind) => Ok(Bound),
            (Bound | Attached, Transition::Bind) => Ok(self),
            (Bound | Attached, Transition::Attach) => Ok(Attached),
            (Unbound | Detached, Transition::Attach) => Err(InvalidTransition {
                from: self,
                transition,
            }),
            (_, Transition::Detach) => Ok(Detached),
        }
    }

    /// `true` when `transition` would leave the state unchanged.
    pub fn is_noop(self, transition: Transition) -> bool {
        match transition {
            Transition::Bind => self.is_bound(),
            Transition::Attach => self.is_attached(),
            Transition::Detach => self == Self::Detached,
        }
    }
}

impl fmt::Display for RedirectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Attached => "attached",
            Self::Detached => "detached",
        };
        f.write_str(s)
    }
}

/// A redirection transition requested by the passthrough controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Bind,
    Attach,
    Detach,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bind => "bind",
            Self::Attach => "attach",
            Self::Detach => "detach",
        };
        f.write_str(s)
    }
}

/// A transition that is not legal from the device's current state.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("cannot {transition} a device that is {from}")]
pub struct InvalidTransition {
    pub from: RedirectionState,
    pub transition: Transition,
}

// ── Device ────────────────────────────────────────────────────────────────────

/// The target camera as last resolved from the host device listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: UsbId,
    /// Re-resolved on every attempt; drift after a re-plug is expected.
    pub bus_address: BusAddress,
    /// Free-form description from the host listing (e.g. `"Z6_3, USB PTP Class"`).
    pub description: String,
    pub state: RedirectionState,
}

impl Device {
    pub fn new(id: UsbId, bus_address: BusAddress, state: RedirectionState) -> Self {
        Self {
            id,
            bus_address,
            description: String::new(),
            state,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Applies `transition` to the device's redirection state.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when the transition is out of order; the
    /// device state is left untouched in that case.
    pub fn apply(&mut self, transition: Transition) -> Result<RedirectionState, InvalidTransition> {
        self.state = self.state.apply(transition)?;
        Ok(self.state)
    }
}

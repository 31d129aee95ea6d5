//! Instrument protocols layered on [`crate::transport::SerialEndpoint`].
//!
//! - [`scpi`]: ASCII command/response, used by the multimeter and as the base of the
//!   oscilloscope and power-supply adapters
//! - [`fy6900`]: FeelTech FY6900 generator frames
//! - [`dos1102`]: OWON DOS1102 oscilloscope
//! - [`power_supply`]: OWON SPE-series programmable DC supply

pub mod dos1102;
pub mod fy6900;
pub mod power_supply;
pub mod scpi;

use crate::error::BenchError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel of a two-channel instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Channel {
    One,
    Two,
}

impl Channel {
    pub fn number(self) -> u8 {
        match self {
            Channel::One => 1,
            Channel::Two => 2,
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = BenchError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Channel::One),
            2 => Ok(Channel::Two),
            other => Err(BenchError::InvalidConfig(format!(
                "channel must be 1 or 2, got {other}"
            ))),
        }
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> Self {
        channel.number()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}", self.number())
    }
}

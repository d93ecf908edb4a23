//! Frames streamed by a radio bridge that forwards raw advertisements to the gateway.

use serde::{Deserialize, Serialize};

use crate::adv::MAX_ADV_LEN;
use crate::error::{ParseResult, ProtocolError};

pub const BRIDGE_PREAMBLE: u16 = 0xE45A;
pub const BRIDGE_VERSION: u8 = 0x01;
/// Longest encoding of a valid frame: varint preamble, version, address,
/// rssi, varint data length and a maximal advertisement.
pub const MAX_FRAME_LEN: usize = 3 + 1 + 6 + 1 + 2 + MAX_ADV_LEN;

/// One observed advertisement, postcard-encoded on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObservationFrame<'a> {
    pub preamble: u16,
    pub version: u8,
    /// Advertiser address, most significant byte first.
    pub address: [u8; 6],
    pub rssi: i8,
    pub data: &'a [u8],
}

impl<'a> ObservationFrame<'a> {
    pub fn new(address: [u8; 6], rssi: i8, data: &'a [u8]) -> Self {
        Self {
            preamble: BRIDGE_PREAMBLE,
            version: BRIDGE_VERSION,
            address,
            rssi,
            data,
        }
    }

    pub fn validate(&self) -> ParseResult<()> {
        if self.preamble != BRIDGE_PREAMBLE {
            return Err(ProtocolError::InvalidPreamble(self.preamble));
        }
        if self.version != BRIDGE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        if self.data.len() > MAX_ADV_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.data.len(),
                max: MAX_ADV_LEN,
            });
        }
        Ok(())
    }
}

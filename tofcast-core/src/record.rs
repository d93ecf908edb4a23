//! The measurement record and its fixed binary layout.
//!
//! Layout (all multi-byte fields little-endian). The scalar header is
//! packed; every zone keeps its distance on a 2-byte boundary, so one pad byte
//! follows the confidence:
//!
//! ```text
//! result_number:u8 temperature:i8 valid_results:u8
//! ambient_light:u32 photon_count:u32 reference_count:u32 sys_tick_sec:f32
//! object_map_1[64] x { confidence:u8 _pad:u8 distance_mm:u16 }
//! object_map_2[64] x { confidence:u8 _pad:u8 distance_mm:u16 }
//! ```

use crate::error::{ParseResult, ProtocolError};

/// Width and height of an object map.
pub const GRID_SIDE: usize = 8;
/// Number of cells in one object map.
pub const ZONES_PER_MAP: usize = GRID_SIDE * GRID_SIDE;
/// Encoded size of a single zone.
pub const ZONE_SIZE: usize = 4;
/// Encoded size of the scalar fields in front of the maps.
pub const RECORD_HEADER_SIZE: usize = 19;
/// Encoded size of a whole record.
pub const RECORD_SIZE: usize = RECORD_HEADER_SIZE + 2 * ZONES_PER_MAP * ZONE_SIZE;

/// One (confidence, distance) reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Zone {
    pub confidence: u8,
    pub distance_mm: u16,
}

impl Zone {
    pub const EMPTY: Zone = Zone {
        confidence: 0,
        distance_mm: 0,
    };

    pub const fn new(confidence: u8, distance_mm: u16) -> Self {
        Self {
            confidence,
            distance_mm,
        }
    }
}

/// An 8x8 grid of zones, row-major (`cell = row * 8 + col`).
pub type ObjectMap = [Zone; ZONES_PER_MAP];

/// A complete spatial measurement assembled from four sub-captures.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeasurementRecord {
    pub result_number: u8,
    /// Die temperature in degrees Celsius.
    pub temperature: i8,
    pub valid_results: u8,
    pub ambient_light: u32,
    pub photon_count: u32,
    pub reference_count: u32,
    /// Sensor system tick converted to seconds.
    pub sys_tick_sec: f32,
    pub object_map_1: ObjectMap,
    pub object_map_2: ObjectMap,
}

impl Default for MeasurementRecord {
    fn default() -> Self {
        Self {
            result_number: 0,
            temperature: 0,
            valid_results: 0,
            ambient_light: 0,
            photon_count: 0,
            reference_count: 0,
            sys_tick_sec: 0.0,
            object_map_1: [Zone::EMPTY; ZONES_PER_MAP],
            object_map_2: [Zone::EMPTY; ZONES_PER_MAP],
        }
    }
}

impl MeasurementRecord {
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];

        bytes[0] = self.result_number;
        bytes[1] = self.temperature as u8;
        bytes[2] = self.valid_results;
        bytes[3..7].copy_from_slice(&self.ambient_light.to_le_bytes());
        bytes[7..11].copy_from_slice(&self.photon_count.to_le_bytes());
        bytes[11..15].copy_from_slice(&self.reference_count.to_le_bytes());
        bytes[15..19].copy_from_slice(&self.sys_tick_sec.to_le_bytes());

        let maps = self.object_map_1.iter().chain(self.object_map_2.iter());
        let cells = bytes[RECORD_HEADER_SIZE..].chunks_exact_mut(ZONE_SIZE);
        for (zone, cell) in maps.zip(cells) {
            cell[0] = zone.confidence;
            cell[2..4].copy_from_slice(&zone.distance_mm.to_le_bytes());
        }

        bytes
    }

    /// Decode a record. Trailing bytes past [`RECORD_SIZE`] are ignored.
    pub fn from_bytes(bytes: &[u8]) -> ParseResult<Self> {
        if bytes.len() < RECORD_SIZE {
            return Err(ProtocolError::InsufficientData {
                needed: RECORD_SIZE,
                available: bytes.len(),
            });
        }

        let mut record = Self {
            result_number: bytes[0],
            temperature: bytes[1] as i8,
            valid_results: bytes[2],
            ambient_light: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
            photon_count: u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]),
            reference_count: u32::from_le_bytes([bytes[11], bytes[12], bytes[13], bytes[14]]),
            sys_tick_sec: f32::from_le_bytes([bytes[15], bytes[16], bytes[17], bytes[18]]),
            ..Self::default()
        };

        let cells = bytes[RECORD_HEADER_SIZE..RECORD_SIZE].chunks_exact(ZONE_SIZE);
        let maps = record
            .object_map_1
            .iter_mut()
            .chain(record.object_map_2.iter_mut());
        for (zone, cell) in maps.zip(cells) {
            *zone = Zone::new(cell[0], u16::from_le_bytes([cell[2], cell[3]]));
        }

        Ok(record)
    }
}

//! Folding four sub-captures into one spatial measurement record.
//!
//! Each sub-capture delivers 36 result slots. Slots 8, 17, 26 and 35 carry no
//! spatial data; the remaining 32 are split at slot 18 between the two object
//! maps. Four sub-captures cover each 8x8 map exactly once.

use tofcast_core::MeasurementRecord;
use tofcast_core::record::GRID_SIDE;

use crate::sensor::RawCapture;
use crate::sensor::registers::RESULT_SLOTS;

/// Sub-captures that make up one record.
pub const SUB_CAPTURES: u8 = 4;

const SLOTS_PER_GROUP: usize = 9;
const SLOTS_PER_MAP: usize = 2 * SLOTS_PER_GROUP;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AssemblyError {
    #[error("expected sub-capture {expected}, got {actual}")]
    OutOfSequence { expected: u8, actual: u8 },

    #[error("sub-capture index {0} out of range")]
    InvalidSubCapture(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MapSelect {
    First,
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GridPosition {
    pub map: MapSelect,
    pub row: usize,
    pub col: usize,
}

impl GridPosition {
    /// Row-major cell index inside the map.
    pub fn cell(&self) -> usize {
        self.row * GRID_SIDE + self.col
    }
}

/// Where result slot `index` of sub-capture `sub_capture` lands, or `None`
/// for the non-spatial slots.
pub fn remap(index: usize, sub_capture: u8) -> Option<GridPosition> {
    let ordinal = index % SLOTS_PER_GROUP;
    if index >= RESULT_SLOTS || ordinal == SLOTS_PER_GROUP - 1 || sub_capture >= SUB_CAPTURES {
        return None;
    }

    let half = (index % SLOTS_PER_MAP) / SLOTS_PER_GROUP;
    let sub = usize::from(sub_capture);

    Some(GridPosition {
        map: if index < SLOTS_PER_MAP {
            MapSelect::First
        } else {
            MapSelect::Second
        },
        row: (ordinal / 2) * 2 + sub / 2,
        col: (ordinal % 2) * 4 + half + (sub % 2) * 2,
    })
}

#[derive(Debug, Default)]
pub struct CaptureAssembler {
    record: MeasurementRecord,
    next: u8,
}

impl CaptureAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sub-capture index the next fold expects.
    pub fn expected(&self) -> u8 {
        self.next
    }

    pub fn reset(&mut self) {
        self.record = MeasurementRecord::default();
        self.next = 0;
    }

    /// Fold one capture into the working record.
    ///
    /// Returns the finished record after sub-capture 3. A capture whose index
    /// is not the expected one drops the partial record; an index of 0 then
    /// starts a new record with it, anything else is rejected.
    pub fn fold(
        &mut self,
        capture: &RawCapture,
    ) -> Result<Option<MeasurementRecord>, AssemblyError> {
        let sub = capture.sub_capture;
        if sub >= SUB_CAPTURES {
            return Err(AssemblyError::InvalidSubCapture(sub));
        }

        if sub != self.next {
            let expected = self.next;
            warn!(
                "sub-capture {} out of sequence (expected {}), dropping partial record",
                sub, expected
            );
            self.reset();
            if sub != 0 {
                return Err(AssemblyError::OutOfSequence {
                    expected,
                    actual: sub,
                });
            }
        }

        for (index, zone) in capture.results.iter().enumerate() {
            let Some(position) = remap(index, sub) else {
                continue;
            };
            let map = match position.map {
                MapSelect::First => &mut self.record.object_map_1,
                MapSelect::Second => &mut self.record.object_map_2,
            };
            map[position.cell()] = *zone;
        }

        self.next += 1;
        if self.next < SUB_CAPTURES {
            return Ok(None);
        }

        self.record.result_number = capture.result_number;
        self.record.temperature = capture.temperature;
        self.record.valid_results = capture.valid_results;
        self.record.ambient_light = capture.ambient_light;
        self.record.photon_count = capture.photon_count;
        self.record.reference_count = capture.reference_count;
        self.record.sys_tick_sec = capture.sys_tick_sec;

        let record = self.record;
        self.reset();
        debug!("record {} assembled", record.result_number);
        Ok(Some(record))
    }
}

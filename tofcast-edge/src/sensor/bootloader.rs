//! Checksummed command/status frames spoken by the sensor bootloader.
//!
//! A command frame is `[command, length, payload..., checksum]` and a status
//! frame is `[status, size, checksum]`. The checksum is the one's complement
//! of the low byte of the sum of every preceding byte in the frame.

use super::SensorError;
use super::registers::{BL_CHUNK_SIZE, BL_STATUS_READY, CMD_STAT};

/// Register byte + command + length + payload + checksum.
const FRAME_CAPACITY: usize = 1 + 2 + BL_CHUNK_SIZE + 1;

pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Bootloader stage, reported when a step times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootStage {
    DownloadInit,
    SetAddress,
    WriteRam,
    RemapReset,
}

/// Progress of a firmware download. Lives only for the duration of the bootstrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootstrapSession {
    /// Bytes of the image written so far.
    pub offset: usize,
    /// Status polls that did not report ready, across all commands.
    pub retries: u32,
    pub last_status: u8,
}

/// A command frame prefixed with the register it is written to.
pub struct CommandFrame {
    buf: [u8; FRAME_CAPACITY],
    len: usize,
}

impl CommandFrame {
    pub fn new(command: u8, payload: &[u8]) -> Result<Self, SensorError> {
        if payload.len() > BL_CHUNK_SIZE {
            return Err(SensorError::FrameTooLarge {
                size: payload.len(),
            });
        }

        let mut buf = [0u8; FRAME_CAPACITY];
        buf[0] = CMD_STAT;
        buf[1] = command;
        buf[2] = payload.len() as u8;
        buf[3..3 + payload.len()].copy_from_slice(payload);

        let end = 3 + payload.len();
        buf[end] = checksum(&buf[1..end]);

        Ok(Self { buf, len: end + 1 })
    }

    /// The frame as sent on the bus, register byte first.
    pub fn as_write(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The frame without the register byte.
    pub fn frame(&self) -> &[u8] {
        &self.buf[1..self.len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFrame {
    pub status: u8,
    pub size: u8,
}

impl StatusFrame {
    pub fn parse(raw: [u8; 3]) -> Result<Self, SensorError> {
        let expected = checksum(&raw[..2]);
        if raw[2] != expected {
            return Err(SensorError::ChecksumMismatch {
                expected,
                actual: raw[2],
            });
        }

        Ok(Self {
            status: raw[0],
            size: raw[1],
        })
    }

    pub fn is_ready(&self) -> bool {
        self.status == BL_STATUS_READY && self.size == 0
    }
}

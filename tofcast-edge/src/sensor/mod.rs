mod bootloader;
mod driver;
pub mod registers;

pub use bootloader::{BootStage, BootstrapSession, CommandFrame, StatusFrame, checksum};
pub use driver::TofSensor;

use embassy_time::Duration;
use tofcast_core::Zone;

use registers::*;

/// Confidence below which a distance is reported as 0.
pub const DEFAULT_CONFIDENCE_THRESHOLD: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    #[error("bus communication failed")]
    Communication,

    #[error("unexpected device id {id:#04x}")]
    UnexpectedDevice { id: u8 },

    #[error("sensor cpu did not become ready")]
    PowerUpTimeout,

    #[error("unexpected application id {app_id:#04x}")]
    UnexpectedApplication { app_id: u8 },

    #[error("status checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("bootstrap timed out in {stage:?} (last status {last_status:#04x})")]
    BootstrapTimeout { stage: BootStage, last_status: u8 },

    #[error("bootloader payload of {size} bytes does not fit a frame")]
    FrameTooLarge { size: usize },

    #[error("command {command:#04x} rejected with status {status:#04x}")]
    CommandRejected { command: u8, status: u8 },

    #[error("command {command:#04x} was not acknowledged")]
    CommandTimeout { command: u8 },

    #[error("result read failed")]
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorConfig {
    /// 7-bit bus address.
    pub address: u8,
    /// Wait after raising the enable line before talking to the device.
    pub settle_time: Duration,
    /// Cadence of every status, application id and interrupt poll.
    pub poll_interval: Duration,
    /// Polls per step before giving up.
    pub max_retries: u16,
    /// RAM address the firmware image is downloaded to (low 16 bits).
    pub ram_address: u16,
    pub measurement_period_ms: u16,
    pub confidence_threshold: u8,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            address: registers::DEFAULT_ADDRESS,
            settle_time: Duration::from_millis(2),
            poll_interval: Duration::from_millis(1),
            max_retries: 5000,
            ram_address: 0x0000,
            measurement_period_ms: DEFAULT_MEASUREMENT_PERIOD_MS,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

/// One decoded result block. Four of them, sub-captures 0 to 3, make a record.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawCapture {
    pub sub_capture: u8,
    pub result_number: u8,
    pub temperature: i8,
    pub valid_results: u8,
    pub ambient_light: u32,
    pub photon_count: u32,
    pub reference_count: u32,
    pub sys_tick_sec: f32,
    pub results: [Zone; RESULT_SLOTS],
}

impl RawCapture {
    /// Decode a result block read from [`registers::CONFIG_RESULT`].
    ///
    /// Distances whose confidence is below `confidence_threshold` are zeroed.
    pub fn decode(block: &[u8; RESULT_BLOCK_LEN], confidence_threshold: u8) -> Self {
        let word = |at: usize| {
            u32::from_le_bytes([block[at], block[at + 1], block[at + 2], block[at + 3]])
        };

        let mut results = [Zone::EMPTY; RESULT_SLOTS];
        for (zone, raw) in results
            .iter_mut()
            .zip(block[RESULTS_OFFSET..].chunks_exact(3))
        {
            let confidence = raw[0];
            let distance_mm = if confidence < confidence_threshold {
                0
            } else {
                u16::from_le_bytes([raw[1], raw[2]])
            };
            *zone = Zone::new(confidence, distance_mm);
        }

        let number = block[RESULT_NUMBER_OFFSET];
        Self {
            sub_capture: number & SUB_CAPTURE_MASK,
            result_number: (number >> 2) & RESULT_NUMBER_MASK,
            temperature: block[TEMPERATURE_OFFSET] as i8,
            valid_results: block[VALID_RESULTS_OFFSET],
            ambient_light: word(AMBIENT_LIGHT_OFFSET),
            photon_count: word(PHOTON_COUNT_OFFSET),
            reference_count: word(REFERENCE_COUNT_OFFSET),
            sys_tick_sec: (f64::from(word(SYS_TICK_OFFSET)) * TICK_SECONDS) as f32,
            results,
        }
    }
}

pub trait Sensor {
    /// Block until the sensor signals that a result is ready.
    fn wait_for_capture(&mut self) -> impl Future<Output = Result<(), SensorError>>;

    /// Read and decode the pending result.
    fn sample_fetch(&mut self) -> impl Future<Output = Result<RawCapture, SensorError>>;
}

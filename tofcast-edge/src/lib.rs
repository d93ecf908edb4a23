#![cfg_attr(not(test), no_std)]

mod fmt; // must stay the first module

pub mod assembler;
pub mod engine;
pub mod sensor;
pub mod transport;

pub use assembler::{AssemblyError, CaptureAssembler};
pub use engine::{Engine, Step};
pub use sensor::{RawCapture, Sensor, SensorConfig, SensorError, TofSensor};
pub use transport::{
    Broadcaster, FragmentTransmitter, SendReport, TransmitterConfig, TransportError,
};

use embassy_time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub(crate) fn as_micros(duration: Duration) -> u32 {
    u32::try_from(duration.as_micros()).unwrap_or(u32::MAX)
}

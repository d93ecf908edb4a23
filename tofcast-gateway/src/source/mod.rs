pub mod mock;
pub mod tcp;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr(pub [u8; 6]);

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub address: BdAddr,
    pub rssi: i8,
    /// Raw advertising data: a sequence of `[len, type, data...]` structures.
    pub data: Box<[u8]>,
}

/// Trait for anything that delivers observed advertisements.
///
/// Implementations spawn background tasks feeding an mpsc channel whose
/// receiver is returned from `start`. The tasks run until the token is cancelled.
#[async_trait]
pub trait ObservationSource: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Observation>, Self::Error>;
}

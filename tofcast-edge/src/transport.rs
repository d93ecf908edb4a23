use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use rand_core::RngCore;

use tofcast_core::adv::{MAX_ADV_LEN, encode_advertisement};
use tofcast_core::fragment::MAX_PAYLOAD_LIMIT;
use tofcast_core::{Chunking, DEFAULT_PAYLOAD_LIMIT, MeasurementRecord, ProtocolError, SessionId};

use crate::as_micros;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    #[error("broadcast handle unavailable")]
    Unavailable,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A radio that keeps re-broadcasting whatever payload it was last given.
pub trait Broadcaster {
    /// Replace the advertising data being broadcast.
    fn set_payload(&mut self, adv: &[u8]) -> impl Future<Output = Result<(), TransportError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransmitterConfig {
    /// Complete local name appended to every advertisement.
    pub device_name: &'static str,
    /// Header plus chunk bytes per broadcast. Must match the receiver.
    pub payload_limit: usize,
    /// How long each part stays on air before the next replaces it.
    pub dwell: Duration,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            device_name: "tofcast",
            payload_limit: DEFAULT_PAYLOAD_LIMIT,
            dwell: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SendReport {
    pub session_id: SessionId,
    pub parts: u8,
}

/// Puts one record on air at a time, part by part.
pub struct FragmentTransmitter<B, D, R> {
    broadcaster: Option<B>,
    delay: D,
    rng: R,
    chunking: Chunking,
    config: TransmitterConfig,
    last_session: Option<SessionId>,
}

impl<B, D, R> FragmentTransmitter<B, D, R>
where
    B: Broadcaster,
    D: DelayNs,
    R: RngCore,
{
    pub fn new(config: TransmitterConfig, delay: D, rng: R) -> Result<Self, TransportError> {
        let chunking = Chunking::for_payload_limit(config.payload_limit)?;

        Ok(Self {
            broadcaster: None,
            delay,
            rng,
            chunking,
            config,
            last_session: None,
        })
    }

    pub fn attach(&mut self, broadcaster: B) {
        self.broadcaster = Some(broadcaster);
    }

    pub fn detach(&mut self) -> Option<B> {
        self.broadcaster.take()
    }

    pub fn is_attached(&self) -> bool {
        self.broadcaster.is_some()
    }

    pub fn chunking(&self) -> Chunking {
        self.chunking
    }

    /// Broadcast `record` under a fresh session id, dwelling on every part.
    ///
    /// Returns once the last part has been on air for the full dwell.
    pub async fn send(&mut self, record: &MeasurementRecord) -> Result<SendReport, TransportError> {
        if self.broadcaster.is_none() {
            return Err(TransportError::Unavailable);
        }

        let session_id = self.next_session_id();
        let bytes = record.to_bytes();
        let fragments = self.chunking.fragments(session_id, &bytes)?;
        let parts = fragments.parts_total();

        let mut frame = [0u8; MAX_PAYLOAD_LIMIT];
        let mut adv = [0u8; MAX_ADV_LEN];

        for fragment in fragments {
            let len = fragment.encode(&mut frame)?;
            let payload = encode_advertisement(&mut adv, &frame[..len], self.config.device_name)?;

            let broadcaster = self
                .broadcaster
                .as_mut()
                .ok_or(TransportError::Unavailable)?;
            broadcaster.set_payload(payload).await?;
            trace!(
                "session {} part {}/{} on air",
                session_id, fragment.header.part_no, parts
            );

            self.delay.delay_us(as_micros(self.config.dwell)).await;
        }

        self.last_session = Some(session_id);
        debug!("session {} sent in {} parts", session_id, parts);

        Ok(SendReport { session_id, parts })
    }

    fn next_session_id(&mut self) -> SessionId {
        loop {
            let id = SessionId(self.rng.next_u32() as u16);
            if Some(id) != self.last_session {
                return id;
            }
        }
    }
}

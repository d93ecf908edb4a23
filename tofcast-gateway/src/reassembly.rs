//! Turning repeated broadcast fragments back into measurement records.
//!
//! The receiver first waits for an advertisement whose name starts with the
//! configured device name, pins that sender's address, and from then on only looks at
//! that address. Each session id is one record; a new id drops whatever
//! partial record was being assembled.

use tofcast_core::adv::Advertisement;
use tofcast_core::{Chunking, Fragment, MeasurementRecord, ProtocolError, RECORD_SIZE, SessionId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::source::{BdAddr, Observation};
use crate::state::GatewayState;

/// What one observation did to the receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not from the target, or carries no fragment.
    Ignored,
    /// From the target but malformed.
    Rejected(ProtocolError),
    /// A part already stored for the current session, or a late repeat of
    /// the session just completed.
    Duplicate,
    Stored {
        session_id: SessionId,
        part_no: u8,
        received: u8,
        parts_total: u8,
        /// A partial record of an earlier session was dropped to make room.
        superseded: bool,
    },
    Complete {
        session_id: SessionId,
        record: Box<MeasurementRecord>,
        superseded: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Discovering,
    Locked(BdAddr),
}

/// Set of part numbers received for the current session.
#[derive(Debug, Clone, Copy, Default)]
struct PartSet([u64; 4]);

impl PartSet {
    fn contains(&self, part_no: u8) -> bool {
        self.0[usize::from(part_no / 64)] & (1 << (part_no % 64)) != 0
    }

    fn insert(&mut self, part_no: u8) {
        self.0[usize::from(part_no / 64)] |= 1 << (part_no % 64);
    }
}

/// Working buffer for the record of one session.
struct ReassemblyBuffer {
    session_id: Option<SessionId>,
    parts_total: u8,
    received: u8,
    parts: PartSet,
    bytes: Box<[u8; RECORD_SIZE]>,
}

impl ReassemblyBuffer {
    fn new() -> Self {
        Self {
            session_id: None,
            parts_total: 0,
            received: 0,
            parts: PartSet::default(),
            bytes: Box::new([0; RECORD_SIZE]),
        }
    }

    fn start(&mut self, session_id: SessionId, parts_total: u8) {
        self.session_id = Some(session_id);
        self.parts_total = parts_total;
        self.received = 0;
        self.parts = PartSet::default();
        self.bytes.fill(0);
    }

    fn clear(&mut self) {
        self.session_id = None;
        self.parts_total = 0;
        self.received = 0;
        self.parts = PartSet::default();
    }

    fn is_partial(&self) -> bool {
        self.session_id.is_some() && self.received > 0
    }
}

pub struct FragmentReceiver {
    target_name: String,
    chunking: Chunking,
    state: ReceiverState,
    buffer: ReassemblyBuffer,
    last_completed: Option<SessionId>,
}

impl FragmentReceiver {
    /// `payload_limit` must equal the emitter's, since it fixes where each
    /// part lands in the record.
    pub fn new(
        target_name: impl Into<String>,
        payload_limit: usize,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            target_name: target_name.into(),
            chunking: Chunking::for_payload_limit(payload_limit)?,
            state: ReceiverState::Discovering,
            buffer: ReassemblyBuffer::new(),
            last_completed: None,
        })
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn locked_to(&self) -> Option<BdAddr> {
        match self.state {
            ReceiverState::Discovering => None,
            ReceiverState::Locked(address) => Some(address),
        }
    }

    /// Forget the pinned emitter and any partial record.
    pub fn reset(&mut self) {
        self.state = ReceiverState::Discovering;
        self.buffer.clear();
        self.last_completed = None;
    }

    pub fn observe(&mut self, observation: &Observation) -> Outcome {
        match self.state {
            ReceiverState::Discovering => self.discover(observation),
            ReceiverState::Locked(address) if address == observation.address => {
                self.accept(&observation.data)
            }
            ReceiverState::Locked(_) => Outcome::Ignored,
        }
    }

    fn discover(&mut self, observation: &Observation) -> Outcome {
        let Ok(adv) = Advertisement::parse(&observation.data) else {
            return Outcome::Ignored;
        };
        if adv.manufacturer_data.is_none() || !adv.name_starts_with(&self.target_name) {
            return Outcome::Ignored;
        }

        info!(
            address = %observation.address,
            rssi = observation.rssi,
            device = %self.target_name,
            "Emitter found, locking on"
        );
        self.state = ReceiverState::Locked(observation.address);

        // The discovery broadcast is itself a fragment.
        self.accept(&observation.data)
    }

    fn accept(&mut self, data: &[u8]) -> Outcome {
        let adv = match Advertisement::parse(data) {
            Ok(adv) => adv,
            Err(e) => return Outcome::Rejected(e),
        };
        let Some(payload) = adv.manufacturer_data else {
            return Outcome::Ignored;
        };
        match Fragment::from_bytes(payload) {
            Ok(fragment) => self.store(fragment),
            Err(e) => Outcome::Rejected(e),
        }
    }

    fn store(&mut self, fragment: Fragment<'_>) -> Outcome {
        let header = fragment.header;

        if self.last_completed == Some(header.session_id) {
            return Outcome::Duplicate;
        }

        let offset = self.chunking.offset(header.part_no);
        let end = offset + fragment.chunk.len();
        if fragment.chunk.len() > self.chunking.chunk_size() || end > RECORD_SIZE {
            return Outcome::Rejected(ProtocolError::PayloadTooLarge {
                size: end,
                max: RECORD_SIZE,
            });
        }

        let mut superseded = false;
        if self.buffer.session_id != Some(header.session_id) {
            superseded = self.buffer.is_partial();
            if superseded {
                debug!(
                    previous = ?self.buffer.session_id,
                    received = self.buffer.received,
                    "Partial record superseded by new session"
                );
            }
            self.buffer.start(header.session_id, header.parts_total);
        } else if self.buffer.parts_total != header.parts_total {
            warn!(
                session = %header.session_id,
                expected_parts = self.buffer.parts_total,
                parts_total = header.parts_total,
                "Part count changed within a session, suspected session id collision"
            );
            superseded = self.buffer.is_partial();
            self.buffer.start(header.session_id, header.parts_total);
        }

        if self.buffer.parts.contains(header.part_no) {
            return Outcome::Duplicate;
        }

        self.buffer.bytes[offset..end].copy_from_slice(fragment.chunk);
        self.buffer.parts.insert(header.part_no);
        self.buffer.received += 1;

        if self.buffer.received < header.parts_total {
            return Outcome::Stored {
                session_id: header.session_id,
                part_no: header.part_no,
                received: self.buffer.received,
                parts_total: header.parts_total,
                superseded,
            };
        }

        let record = match MeasurementRecord::from_bytes(&self.buffer.bytes[..]) {
            Ok(record) => record,
            Err(e) => {
                self.buffer.clear();
                return Outcome::Rejected(e);
            }
        };
        self.buffer.clear();
        self.last_completed = Some(header.session_id);

        Outcome::Complete {
            session_id: header.session_id,
            record: Box::new(record),
            superseded,
        }
    }
}

/// Feed observations through the receiver and hand completed records to the
/// publish task.
///
/// `records` is expected to have a single slot: a completed record is moved
/// into it and reassembly waits while the publisher is still busy.
#[instrument(name = "reassembler", skip_all, fields(device = %receiver.target_name))]
pub async fn run_reassembler(
    mut observations: mpsc::Receiver<Observation>,
    mut receiver: FragmentReceiver,
    records: mpsc::Sender<MeasurementRecord>,
    state: GatewayState,
    cancel: CancellationToken,
) {
    info!("Reassembler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Reassembler shutting down");
                break;
            }
            observation = observations.recv() => {
                let Some(observation) = observation else {
                    info!("Observation source closed");
                    break;
                };

                let was_locked = receiver.locked_to();
                let outcome = receiver.observe(&observation);
                state.record_outcome(&outcome).await;

                if let Some(address) = receiver.locked_to().filter(|_| was_locked.is_none()) {
                    state.emitter_locked(address).await;
                }

                match outcome {
                    Outcome::Rejected(e) => {
                        debug!(address = %observation.address, error = %e, "Malformed fragment");
                    }
                    Outcome::Stored {
                        session_id,
                        part_no,
                        received,
                        parts_total,
                        ..
                    } => {
                        debug!(
                            session = %session_id,
                            part_no,
                            received,
                            parts_total,
                            "Fragment stored"
                        );
                    }
                    Outcome::Complete {
                        session_id, record, ..
                    } => {
                        info!(
                            session = %session_id,
                            result_number = record.result_number,
                            "Record reassembled"
                        );
                        if records.send(*record).await.is_err() {
                            info!("Publisher gone, reassembler shutting down");
                            break;
                        }
                    }
                    Outcome::Ignored | Outcome::Duplicate => {}
                }
            }
        }
    }
}

#![cfg_attr(not(test), no_std)]

pub mod adv;
pub mod bridge;
pub mod fragment;
pub mod record;

mod error;

pub use error::{ParseResult, ProtocolError};
pub use fragment::{
    Chunking, DEFAULT_PAYLOAD_LIMIT, FRAGMENT_HEADER_SIZE, Fragment, FragmentHeader, Fragments,
    SessionId,
};
pub use record::{MeasurementRecord, ObjectMap, RECORD_SIZE, ZONES_PER_MAP, Zone};

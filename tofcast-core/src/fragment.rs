//! Splitting a serialized record into broadcast-sized fragments.
//!
//! Every fragment starts with a 4-byte header `[id_hi, id_lo, part_no, parts_total]`
//! followed by one chunk of the record. Part numbers are 1-based.

use crate::error::{ParseResult, ProtocolError};

pub const FRAGMENT_HEADER_SIZE: usize = 4;
/// Payload budget of one broadcast packet unless configured otherwise.
pub const DEFAULT_PAYLOAD_LIMIT: usize = 210;
/// Largest fragment that fits in a single advertising structure.
pub const MAX_PAYLOAD_LIMIT: usize = 254;

/// Random per-record identifier carried in every fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionId(pub u16);

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FragmentHeader {
    pub session_id: SessionId,
    pub part_no: u8,
    pub parts_total: u8,
}

impl FragmentHeader {
    pub fn new(session_id: SessionId, part_no: u8, parts_total: u8) -> ParseResult<Self> {
        if part_no == 0 || part_no > parts_total {
            return Err(ProtocolError::InvalidPartNumber {
                part_no,
                parts_total,
            });
        }

        Ok(Self {
            session_id,
            part_no,
            parts_total,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> ParseResult<Self> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(ProtocolError::InsufficientData {
                needed: FRAGMENT_HEADER_SIZE,
                available: bytes.len(),
            });
        }

        Self::new(
            SessionId(u16::from_be_bytes([bytes[0], bytes[1]])),
            bytes[2],
            bytes[3],
        )
    }

    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let id = self.session_id.0.to_be_bytes();
        [id[0], id[1], self.part_no, self.parts_total]
    }
}

/// A header plus the slice of the record it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub header: FragmentHeader,
    pub chunk: &'a [u8],
}

impl<'a> Fragment<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> ParseResult<Self> {
        let header = FragmentHeader::from_bytes(bytes)?;

        Ok(Self {
            header,
            chunk: &bytes[FRAGMENT_HEADER_SIZE..],
        })
    }

    pub fn encoded_len(&self) -> usize {
        FRAGMENT_HEADER_SIZE + self.chunk.len()
    }

    /// Write header and chunk into `buf`, returning the number of bytes used.
    pub fn encode(&self, buf: &mut [u8]) -> ParseResult<usize> {
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: buf.len(),
            });
        }

        buf[..FRAGMENT_HEADER_SIZE].copy_from_slice(&self.header.to_bytes());
        buf[FRAGMENT_HEADER_SIZE..len].copy_from_slice(self.chunk);
        Ok(len)
    }
}

/// Chunk arithmetic shared by the transmitter and the receiver.
///
/// Both ends must be built from the same payload limit, since the receiver
/// places chunk `n` at offset `(n - 1) * chunk_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Chunking {
    chunk_size: usize,
}

impl Default for Chunking {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_PAYLOAD_LIMIT - FRAGMENT_HEADER_SIZE,
        }
    }
}

impl Chunking {
    pub fn for_payload_limit(limit: usize) -> ParseResult<Self> {
        if limit <= FRAGMENT_HEADER_SIZE {
            return Err(ProtocolError::PayloadLimitTooSmall { limit });
        }
        if limit > MAX_PAYLOAD_LIMIT {
            return Err(ProtocolError::PayloadTooLarge {
                size: limit,
                max: MAX_PAYLOAD_LIMIT,
            });
        }

        Ok(Self {
            chunk_size: limit - FRAGMENT_HEADER_SIZE,
        })
    }

    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub const fn payload_limit(&self) -> usize {
        self.chunk_size + FRAGMENT_HEADER_SIZE
    }

    pub const fn part_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }

    /// Byte offset of a 1-based part within the record.
    pub const fn offset(&self, part_no: u8) -> usize {
        (part_no as usize).saturating_sub(1) * self.chunk_size
    }

    /// Length of the given part for a record of `len` bytes.
    pub fn part_len(&self, len: usize, part_no: u8) -> usize {
        len.saturating_sub(self.offset(part_no)).min(self.chunk_size)
    }

    pub fn fragments<'a>(
        &self,
        session_id: SessionId,
        data: &'a [u8],
    ) -> ParseResult<Fragments<'a>> {
        let parts = self.part_count(data.len());
        let parts_total = u8::try_from(parts).map_err(|_| ProtocolError::TooManyParts { parts })?;

        Ok(Fragments {
            session_id,
            data,
            chunking: *self,
            parts_total,
            next: 1,
        })
    }
}

/// Iterator over the fragments of one record, in part order.
#[derive(Debug, Clone)]
pub struct Fragments<'a> {
    session_id: SessionId,
    data: &'a [u8],
    chunking: Chunking,
    parts_total: u8,
    next: u16,
}

impl Fragments<'_> {
    pub fn parts_total(&self) -> u8 {
        self.parts_total
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl<'a> Iterator for Fragments<'a> {
    type Item = Fragment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > u16::from(self.parts_total) {
            return None;
        }

        let part_no = self.next as u8;
        let start = self.chunking.offset(part_no);
        let end = start + self.chunking.part_len(self.data.len(), part_no);
        self.next += 1;

        Some(Fragment {
            header: FragmentHeader {
                session_id: self.session_id,
                part_no,
                parts_total: self.parts_total,
            },
            chunk: &self.data[start..end],
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (usize::from(self.parts_total) + 1).saturating_sub(usize::from(self.next));
        (left, Some(left))
    }
}

impl ExactSizeIterator for Fragments<'_> {}

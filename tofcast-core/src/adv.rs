//! Advertising data as a sequence of `[len, type, data...]` structures.
//!
//! An emitter advertisement carries the current fragment as manufacturer
//! specific data, followed by the device's complete local name.

use crate::error::{ParseResult, ProtocolError};

pub const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Largest data part of a single structure (the length byte also counts the type).
pub const MAX_AD_DATA_LEN: usize = u8::MAX as usize - 1;
/// Room for one maximal fragment plus a device name.
pub const MAX_ADV_LEN: usize = 2 * (MAX_AD_DATA_LEN + 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    pub ad_type: u8,
    pub data: &'a [u8],
}

/// Iterates the structures of an advertising payload.
///
/// A zero length byte ends the significant part of the payload; a structure
/// running past the end of the buffer yields an error and stops iteration.
#[derive(Debug, Clone)]
pub struct AdStructures<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> AdStructures<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = ParseResult<AdStructure<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.bytes.get(self.offset)? as usize;
        if len == 0 {
            self.offset = self.bytes.len();
            return None;
        }

        let start = self.offset + 1;
        let end = start + len;
        if end > self.bytes.len() {
            let offset = self.offset;
            self.offset = self.bytes.len();
            return Some(Err(ProtocolError::MalformedAdStructure { offset }));
        }

        self.offset = end;
        Some(Ok(AdStructure {
            ad_type: self.bytes[start],
            data: &self.bytes[start + 1..end],
        }))
    }
}

/// The fields of an advertisement the receiver cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Advertisement<'a> {
    pub manufacturer_data: Option<&'a [u8]>,
    pub local_name: Option<&'a [u8]>,
}

impl<'a> Advertisement<'a> {
    pub fn parse(bytes: &'a [u8]) -> ParseResult<Self> {
        let mut adv = Self::default();

        for structure in AdStructures::new(bytes) {
            let structure = structure?;
            match structure.ad_type {
                AD_TYPE_MANUFACTURER_DATA if adv.manufacturer_data.is_none() => {
                    adv.manufacturer_data = Some(structure.data);
                }
                AD_TYPE_COMPLETE_LOCAL_NAME => adv.local_name = Some(structure.data),
                AD_TYPE_SHORT_LOCAL_NAME if adv.local_name.is_none() => {
                    adv.local_name = Some(structure.data);
                }
                _ => {}
            }
        }

        Ok(adv)
    }

    /// True when the advertisement names the given device.
    pub fn is_named(&self, name: &str) -> bool {
        self.local_name == Some(name.as_bytes())
    }

    /// True when the advertised name begins with `prefix`.
    pub fn name_starts_with(&self, prefix: &str) -> bool {
        self.local_name
            .is_some_and(|name| name.starts_with(prefix.as_bytes()))
    }
}

/// Writes advertising structures into a caller-provided buffer.
pub struct AdvBuilder<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> AdvBuilder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    pub fn push(&mut self, ad_type: u8, data: &[u8]) -> ParseResult<&mut Self> {
        if data.len() > MAX_AD_DATA_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: data.len(),
                max: MAX_AD_DATA_LEN,
            });
        }

        let needed = self.len + 2 + data.len();
        if needed > self.buf.len() {
            return Err(ProtocolError::PayloadTooLarge {
                size: needed,
                max: self.buf.len(),
            });
        }

        self.buf[self.len] = (data.len() + 1) as u8;
        self.buf[self.len + 1] = ad_type;
        self.buf[self.len + 2..needed].copy_from_slice(data);
        self.len = needed;

        Ok(self)
    }

    pub fn finish(self) -> &'a [u8] {
        let buf: &'a [u8] = self.buf;
        &buf[..self.len]
    }
}

/// Build the advertisement for one fragment: manufacturer data, then the name.
pub fn encode_advertisement<'a>(
    buf: &'a mut [u8],
    fragment: &[u8],
    name: &str,
) -> ParseResult<&'a [u8]> {
    let mut builder = AdvBuilder::new(buf);
    builder
        .push(AD_TYPE_MANUFACTURER_DATA, fragment)?
        .push(AD_TYPE_COMPLETE_LOCAL_NAME, name.as_bytes())?;
    Ok(builder.finish())
}

pub type ParseResult<T> = core::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    #[error("insufficient data: needed {needed} bytes, {available} available")]
    InsufficientData { needed: usize, available: usize },

    #[error("invalid part number {part_no} of {parts_total}")]
    InvalidPartNumber { part_no: u8, parts_total: u8 },

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("record would need {parts} parts, more than a header can count")]
    TooManyParts { parts: usize },

    #[error("payload limit of {limit} bytes leaves no room for data")]
    PayloadLimitTooSmall { limit: usize },

    #[error("malformed advertising structure at offset {offset}")]
    MalformedAdStructure { offset: usize },

    #[error("invalid bridge preamble: {0:#06X}")]
    InvalidPreamble(u16),

    #[error("unsupported bridge protocol version {0}")]
    UnsupportedVersion(u8),
}

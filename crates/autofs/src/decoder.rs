use std::{ffi::OsStr, fmt, mem, os::unix::prelude::*};
use zerocopy::FromBytes;

/// The error returned when a packet buffer does not hold the expected layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => f.write_str("packet is shorter than its declared layout"),
        }
    }
}

impl std::error::Error for DecodeError {}

pub(crate) struct Decoder<'a> {
    bytes: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn fetch_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() < count {
            return Err(DecodeError::UnexpectedEof);
        }

        let (bytes, remaining) = self.bytes.split_at(count);
        self.bytes = remaining;

        Ok(bytes)
    }

    /// Fetch a copy of a Plain-Old-Data (POD) value.
    ///
    /// The packet buffer has no alignment guarantee, so the value is read
    /// out instead of referenced in place.
    pub(crate) fn fetch<T>(&mut self) -> Result<T, DecodeError>
    where
        T: FromBytes,
    {
        let bytes = self.fetch_bytes(mem::size_of::<T>())?;
        T::read_from_bytes(bytes).map_err(|_| DecodeError::UnexpectedEof)
    }
}

/// Extract the name field of a packet.
///
/// The declared length is clamped to the buffer and the name ends at the
/// first nul byte, whichever comes first.
pub(crate) fn packet_name(len: i32, raw: &[u8]) -> &OsStr {
    let len = usize::try_from(len).unwrap_or(0).min(raw.len());
    let raw = &raw[..len];
    let end = raw.iter().position(|&b| b == b'\0').unwrap_or(raw.len());
    OsStr::from_bytes(&raw[..end])
}

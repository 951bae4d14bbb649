//! Packets sent by the kernel over the autofs pipe.

use crate::decoder::{packet_name, DecodeError, Decoder};
use autofs_kernel::*;
use std::{ffi::OsString, fmt, io};

/// The raw content of a single packet read from the kernel pipe.
#[derive(Clone)]
pub struct RawPacket([u8; AUTOFS_PACKET_SIZE]);

impl RawPacket {
    /// Wrap an already received buffer.
    pub fn new(bytes: [u8; AUTOFS_PACKET_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    /// Decode the packet into its typed representation.
    pub fn decode(&self) -> Result<Packet, DecodeError> {
        Packet::decode(&self.0[..])
    }
}

impl fmt::Debug for RawPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPacket")
            .field("len", &self.0.len())
            .finish()
    }
}

/// A request from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A lookup of `name` blocked and waits for the mount to appear.
    Missing {
        token: autofs_wqt_t,
        name: OsString,
    },

    /// The entry `name` is a candidate for unmounting.
    Expire { name: OsString },

    /// A packet type this side does not understand.
    Unknown { kind: i32 },
}

impl Packet {
    /// Decode a packet from the bytes read from the kernel pipe.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let hdr = Decoder::new(bytes).fetch::<autofs_packet_hdr>()?;
        match hdr.type_ {
            autofs_kernel::autofs_ptype_missing => {
                let pkt = Decoder::new(bytes).fetch::<autofs_packet_missing>()?;
                Ok(Self::Missing {
                    token: pkt.wait_queue_token,
                    name: packet_name(pkt.len, &pkt.name[..]).to_owned(),
                })
            }
            autofs_kernel::autofs_ptype_expire => {
                let pkt = Decoder::new(bytes).fetch::<autofs_packet_expire>()?;
                Ok(Self::Expire {
                    name: packet_name(pkt.len, &pkt.name[..]).to_owned(),
                })
            }
            kind => Ok(Self::Unknown { kind }),
        }
    }
}

/// Read exactly one packet from the kernel pipe.
///
/// `Ok(None)` means the pipe delivered less than a whole packet before
/// reaching end-of-file. Interrupted reads are retried.
pub fn read_packet<R>(mut reader: R) -> io::Result<Option<RawPacket>>
where
    R: io::Read,
{
    let mut buf = [0u8; AUTOFS_PACKET_SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                tracing::debug!(filled, "short read on the kernel pipe");
                return Ok(None);
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(Some(RawPacket(buf)))
}

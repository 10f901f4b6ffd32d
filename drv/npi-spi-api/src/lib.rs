// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the NPI SPI transport.
//!
//! The Network Processor Interface exchanges RPC frames with a tethered
//! network processor over a SPI bus paced by the MRDY/SRDY handshake
//! lines. This crate defines the wire frame, the error model, the typed
//! transport configuration, and the upward interface consumed by the RPC
//! layer. The transport itself lives in `drv-npi-spi-server-core`.

#![deny(elided_lifetimes_in_paths)]

pub mod config;
mod error;

pub use error::{CallbackError, LineName, NpiError};

use core::fmt;
use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of the RPC frame header on the wire.
pub const RPC_FRAME_HDR_SZ: usize = core::mem::size_of::<MsgHeader>();

/// Largest payload a single frame may carry.
pub const RPC_MAX_PAYLOAD: usize = 250;

/// Largest complete frame: header plus payload.
pub const RPC_MAX_FRAME: usize = RPC_FRAME_HDR_SZ + RPC_MAX_PAYLOAD;

const_assert!(RPC_MAX_FRAME <= u8::MAX as usize + RPC_FRAME_HDR_SZ);

/// The frame type lives in the top three bits of `cmd0`; the subsystem in
/// the remaining five.
pub const RPC_CMD_TYPE_MASK: u8 = 0xE0;
pub const RPC_SUBSYSTEM_MASK: u8 = 0x1F;

/// RPC frame types carried in `cmd0`.
///
/// `Poll` doubles as the 3-byte preamble the host clocks out to let the
/// slave drain one queued asynchronous frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Poll = 0x00,
    Sreq = 0x20,
    Areq = 0x40,
    Srsp = 0x60,
    /// One of the reserved type encodings.
    Unknown = 0xFF,
}

impl From<u8> for MsgType {
    fn from(cmd0: u8) -> Self {
        match cmd0 & RPC_CMD_TYPE_MASK {
            0x00 => MsgType::Poll,
            0x20 => MsgType::Sreq,
            0x40 => MsgType::Areq,
            0x60 => MsgType::Srsp,
            _ => MsgType::Unknown,
        }
    }
}

/// The 3-byte RPC frame header.
///
/// `cmd0` packs the frame type and subsystem; `cmd1` is the command id
/// within the subsystem. `{0xFF, 0xFF, 0xFF}` is reserved as the illegal
/// header and must never escape the transport as a frame.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(C)]
pub struct MsgHeader {
    pub len: u8,
    pub cmd0: u8,
    pub cmd1: u8,
}

impl MsgHeader {
    pub fn msg_type(&self) -> MsgType {
        MsgType::from(self.cmd0)
    }

    pub fn subsystem(&self) -> u8 {
        self.cmd0 & RPC_SUBSYSTEM_MASK
    }

    /// The reserved all-0xFF header.
    pub fn is_illegal(&self) -> bool {
        self.len == 0xFF && self.cmd0 == 0xFF && self.cmd1 == 0xFF
    }
}

/// An owned RPC frame with in-place storage for the largest legal payload.
///
/// The struct layout is the wire layout, so `wire()` is simply a prefix of
/// the underlying bytes. A synchronous request is overwritten in place by
/// its response, so one buffer serves the whole round trip.
#[derive(
    Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct NpiMsg {
    header: MsgHeader,
    payload: [u8; RPC_MAX_PAYLOAD],
}

impl NpiMsg {
    /// Builds a frame. Fails with `BadLength` if the payload exceeds
    /// [`RPC_MAX_PAYLOAD`].
    pub fn new(
        msg_type: MsgType,
        subsys: u8,
        cmd: u8,
        payload: &[u8],
    ) -> Result<Self, NpiError> {
        if payload.len() > RPC_MAX_PAYLOAD {
            return Err(NpiError::BadLength);
        }
        let mut msg = Self {
            header: MsgHeader {
                len: payload.len() as u8,
                cmd0: (msg_type as u8 & RPC_CMD_TYPE_MASK)
                    | (subsys & RPC_SUBSYSTEM_MASK),
                cmd1: cmd,
            },
            payload: [0; RPC_MAX_PAYLOAD],
        };
        msg.payload[..payload.len()].copy_from_slice(payload);
        Ok(msg)
    }

    /// The 3-byte poll preamble: `{len=0, cmd0=POLL, cmd1=0}`.
    pub fn poll() -> Self {
        Self {
            header: MsgHeader {
                len: 0,
                cmd0: MsgType::Poll as u8,
                cmd1: 0,
            },
            payload: [0; RPC_MAX_PAYLOAD],
        }
    }

    /// Decodes a complete wire image. The byte count must match the
    /// header's `len` exactly, and the illegal header is rejected.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, NpiError> {
        let (header, payload) = bytes
            .split_at_checked(RPC_FRAME_HDR_SZ)
            .ok_or(NpiError::BadLength)?;
        let header = MsgHeader {
            len: header[0],
            cmd0: header[1],
            cmd1: header[2],
        };
        if header.is_illegal() {
            return Err(NpiError::IllegalHeader);
        }
        if header.len as usize > RPC_MAX_PAYLOAD
            || payload.len() != header.len as usize
        {
            return Err(NpiError::BadLength);
        }
        let mut msg = Self {
            header,
            payload: [0; RPC_MAX_PAYLOAD],
        };
        msg.payload[..payload.len()].copy_from_slice(payload);
        Ok(msg)
    }

    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.header.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.len == 0
    }

    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type()
    }

    pub fn subsystem(&self) -> u8 {
        self.header.subsystem()
    }

    pub fn cmd(&self) -> u8 {
        self.header.cmd1
    }

    /// Retags the frame type, preserving the subsystem bits. The transport
    /// applies this before transmission so clients cannot smuggle a frame
    /// type that disagrees with the operation used to send it.
    pub fn set_msg_type(&mut self, msg_type: MsgType) {
        self.header.cmd0 = (self.header.cmd0 & RPC_SUBSYSTEM_MASK)
            | (msg_type as u8 & RPC_CMD_TYPE_MASK);
    }

    pub fn payload(&self) -> &[u8] {
        // A wire header can claim more than the frame may carry; callers
        // reject such frames, but the accessor must not index past the
        // buffer either way.
        let n = (self.header.len as usize).min(RPC_MAX_PAYLOAD);
        &self.payload[..n]
    }

    /// The exact wire image: header plus `len` payload bytes.
    pub fn wire(&self) -> &[u8] {
        let n = RPC_FRAME_HDR_SZ + (self.header.len as usize).min(RPC_MAX_PAYLOAD);
        &self.as_bytes()[..n]
    }

    /// Zeroes the header and hands it out as a writable region, for
    /// reading a header off the wire in place.
    pub fn header_region_mut(&mut self) -> &mut [u8] {
        self.header = MsgHeader {
            len: 0,
            cmd0: 0,
            cmd1: 0,
        };
        &mut self.as_mut_bytes()[..RPC_FRAME_HDR_SZ]
    }

    /// Zeroes the first `len` payload bytes and hands them out as a
    /// writable region. Fails with `BadLength` when a wire header claims
    /// more payload than a frame may carry.
    pub fn payload_region_mut(
        &mut self,
        len: usize,
    ) -> Result<&mut [u8], NpiError> {
        let region = self
            .payload
            .get_mut(..len)
            .ok_or(NpiError::BadLength)?;
        region.fill(0);
        Ok(region)
    }
}

impl fmt::Debug for NpiMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NpiMsg")
            .field("header", &self.header)
            .field("payload", &self.payload())
            .finish()
    }
}

/// Host-side transport statistics.
///
/// All of the counters wrap around.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkStats {
    /// Number of frames sent successfully
    pub tx_sent: u32,

    /// Number of frames that failed to be sent
    pub tx_errors: u32,

    /// Number of frames received successfully (responses and polled)
    pub rx_received: u32,

    /// Number of invalid frames received (illegal or oversized headers)
    pub rx_invalid: u32,

    /// Number of poll transactions issued
    pub polls: u32,

    /// Number of SRDY interrupts the event thread had to recover by level
    pub missed_interrupts: u32,

    /// Number of timeouts waiting on a handshake edge
    pub timeouts: u32,

    /// Number of slow SRDY rises flagged as a probable slave reset
    pub possible_resets: u32,
}

/// The interface the transport consumes upward: delivery of
/// slave-initiated frames and notification of fatal transport faults.
///
/// `areq` is called from the poll thread, in SRDY-edge order, while the
/// transport lock is held; a slow implementation stalls the wire. An error
/// return terminates the poll thread.
pub trait NpiHandler: Send + Sync {
    fn areq(&self, msg: &NpiMsg) -> Result<(), CallbackError>;

    /// Reports a fatal transport fault: the module-tagged code plus a
    /// human-readable detail line.
    fn fault(&self, err: NpiError, detail: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn type_bits_round_trip() {
        let msg = NpiMsg::new(MsgType::Sreq, 0x01, 0x0A, &[0x01, 0x02]).unwrap();
        assert_eq!(msg.msg_type(), MsgType::Sreq);
        assert_eq!(msg.subsystem(), 0x01);
        assert_eq!(msg.cmd(), 0x0A);
        assert_eq!(msg.wire(), &[0x02, 0x21, 0x0A, 0x01, 0x02]);
    }

    #[test]
    fn retag_preserves_subsystem() {
        let mut msg = NpiMsg::new(MsgType::Sreq, 0x15, 0x07, &[]).unwrap();
        msg.set_msg_type(MsgType::Areq);
        assert_eq!(msg.msg_type(), MsgType::Areq);
        assert_eq!(msg.subsystem(), 0x15);
    }

    #[test]
    fn poll_preamble_is_all_zero() {
        assert_eq!(NpiMsg::poll().wire(), &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn payload_bounds() {
        assert!(NpiMsg::new(MsgType::Areq, 1, 1, &[0; RPC_MAX_PAYLOAD]).is_ok());
        assert_eq!(
            NpiMsg::new(MsgType::Areq, 1, 1, &[0; RPC_MAX_PAYLOAD + 1]),
            Err(NpiError::BadLength)
        );
    }

    #[test]
    fn len_boundaries_decode() {
        for len in [0usize, 1, RPC_MAX_PAYLOAD] {
            let payload = vec![0xA5; len];
            let msg = NpiMsg::new(MsgType::Areq, 2, 3, &payload).unwrap();
            let decoded = NpiMsg::from_wire(msg.wire()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn illegal_header_rejected() {
        assert_eq!(
            NpiMsg::from_wire(&[0xFF, 0xFF, 0xFF]),
            Err(NpiError::IllegalHeader)
        );
    }

    #[test]
    fn truncated_or_oversized_wire_rejected() {
        assert_eq!(NpiMsg::from_wire(&[0x01, 0x41]), Err(NpiError::BadLength));
        // Header claims one byte more than the buffer carries.
        assert_eq!(
            NpiMsg::from_wire(&[0x02, 0x41, 0x07, 0xAA]),
            Err(NpiError::BadLength)
        );
        // Header claims more than any frame may carry.
        let huge = [0xFE; 300];
        assert_eq!(NpiMsg::from_wire(&huge), Err(NpiError::BadLength));
    }

    proptest! {
        #[test]
        fn wire_round_trip(
            ty in prop_oneof![
                Just(MsgType::Poll),
                Just(MsgType::Sreq),
                Just(MsgType::Areq),
                Just(MsgType::Srsp),
            ],
            subsys in 0u8..=0x1F,
            cmd in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=RPC_MAX_PAYLOAD),
        ) {
            let msg = NpiMsg::new(ty, subsys, cmd, &payload).unwrap();
            let bytes = msg.wire().to_vec();
            let decoded = NpiMsg::from_wire(&bytes).unwrap();
            prop_assert_eq!(decoded.wire(), &bytes[..]);
            prop_assert_eq!(decoded.payload(), &payload[..]);
        }
    }
}

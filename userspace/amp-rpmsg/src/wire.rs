// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RPMsg on-the-wire layouts (message header, name service, flow control)
//!
//! All fields are little-endian and packed; codecs are `scroll` contexts.
//!
//! INVARIANTS:
//!   - Never panics on malformed/truncated input
//!   - The header `reserved` field is written as zero and ignored on receive

use scroll::ctx::{TryFromCtx, TryIntoCtx};
use scroll::{Endian, Pread, Pwrite, LE};

use crate::RPMSG_NAME_SIZE;

/// Size of `RpmsgHeader` on the wire.
pub const RPMSG_HEADER_SIZE: usize = 16;
/// Size of `NsMessage` on the wire.
pub const RPMSG_NS_MSG_SIZE: usize = RPMSG_NAME_SIZE + 8;
/// Size of `FcMessage` on the wire.
pub const RPMSG_FC_MSG_SIZE: usize = 12;

/// Name-service flag: endpoint created.
pub const RPMSG_NS_CREATE: u32 = 0;
/// Name-service flag: endpoint destroyed.
pub const RPMSG_NS_DESTROY: u32 = 1;

/// Flow-control flag: stop sending to me.
pub const RPMSG_EPT_OFF: u32 = 0;
/// Flow-control flag: resume sending to me.
pub const RPMSG_EPT_ON: u32 = 1;

/// Errors when encoding or decoding rpmsg frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireError {
    /// Buffer is shorter than the structure.
    Truncated,
    /// Message has the wrong length for its type.
    BadLength(usize),
}

impl From<scroll::Error> for WireError {
    fn from(_: scroll::Error) -> Self {
        WireError::Truncated
    }
}

impl From<WireError> for crate::Error {
    fn from(_: WireError) -> Self {
        crate::Error::Param
    }
}

/// Header in front of every rpmsg payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpmsgHeader {
    /// Sender address.
    pub src: u32,
    /// Recipient address.
    pub dst: u32,
    /// Payload length in bytes.
    pub len: u16,
    /// Message flags (unused, zero).
    pub flags: u16,
}

impl<'a> TryFromCtx<'a, Endian> for RpmsgHeader {
    type Error = scroll::Error;

    fn try_from_ctx(buf: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let off = &mut 0;
        let src = buf.gread_with(off, endian)?;
        let dst = buf.gread_with(off, endian)?;
        let _reserved: u32 = buf.gread_with(off, endian)?;
        let len = buf.gread_with(off, endian)?;
        let flags = buf.gread_with(off, endian)?;
        Ok((Self { src, dst, len, flags }, *off))
    }
}

impl TryIntoCtx<Endian> for RpmsgHeader {
    type Error = scroll::Error;

    fn try_into_ctx(self, buf: &mut [u8], endian: Endian) -> Result<usize, Self::Error> {
        let off = &mut 0;
        buf.gwrite_with(self.src, off, endian)?;
        buf.gwrite_with(self.dst, off, endian)?;
        buf.gwrite_with(0u32, off, endian)?;
        buf.gwrite_with(self.len, off, endian)?;
        buf.gwrite_with(self.flags, off, endian)?;
        Ok(*off)
    }
}

impl RpmsgHeader {
    /// Encodes the header; `reserved` is always zero.
    pub fn encode(&self) -> Result<[u8; RPMSG_HEADER_SIZE], WireError> {
        let mut out = [0u8; RPMSG_HEADER_SIZE];
        out.pwrite_with(*self, 0, LE)?;
        Ok(out)
    }

    /// Decodes a header from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        Ok(buf.pread_with(0, LE)?)
    }
}

/// Name-service announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NsMessage {
    /// NUL-padded service name; not terminated when exactly 32 bytes long.
    pub name: [u8; RPMSG_NAME_SIZE],
    /// Address of the announcing endpoint.
    pub addr: u32,
    /// `RPMSG_NS_CREATE` or `RPMSG_NS_DESTROY`.
    pub flags: u32,
}

impl<'a> TryFromCtx<'a, Endian> for NsMessage {
    type Error = scroll::Error;

    fn try_from_ctx(buf: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let off = &mut 0;
        let raw: &[u8] = buf.gread_with(off, RPMSG_NAME_SIZE)?;
        let mut name = [0u8; RPMSG_NAME_SIZE];
        name.copy_from_slice(raw);
        let addr = buf.gread_with(off, endian)?;
        let flags = buf.gread_with(off, endian)?;
        Ok((Self { name, addr, flags }, *off))
    }
}

impl TryIntoCtx<Endian> for NsMessage {
    type Error = scroll::Error;

    fn try_into_ctx(self, buf: &mut [u8], endian: Endian) -> Result<usize, Self::Error> {
        let off = &mut 0;
        buf.gwrite(&self.name[..], off)?;
        buf.gwrite_with(self.addr, off, endian)?;
        buf.gwrite_with(self.flags, off, endian)?;
        Ok(*off)
    }
}

impl NsMessage {
    /// Builds an announcement, truncating `name` to 32 bytes.
    pub fn new(name: &str, addr: u32, flags: u32) -> Self {
        let mut buf = [0u8; RPMSG_NAME_SIZE];
        let bytes = name.as_bytes();
        let n = bytes.len().min(RPMSG_NAME_SIZE);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self { name: buf, addr, flags }
    }

    /// Service name up to the first NUL, lossily decoded.
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(RPMSG_NAME_SIZE);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// True for a withdrawal. Other flag bits are ignored.
    pub fn is_destroy(&self) -> bool {
        self.flags & RPMSG_NS_DESTROY != 0
    }

    /// Encodes the announcement.
    pub fn encode(&self) -> Result<[u8; RPMSG_NS_MSG_SIZE], WireError> {
        let mut out = [0u8; RPMSG_NS_MSG_SIZE];
        out.pwrite_with(*self, 0, LE)?;
        Ok(out)
    }

    /// Decodes an announcement; the payload must be exactly `RPMSG_NS_MSG_SIZE` bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != RPMSG_NS_MSG_SIZE {
            return Err(WireError::BadLength(buf.len()));
        }
        Ok(buf.pread_with(0, LE)?)
    }
}

/// Flow-control request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FcMessage {
    /// Endpoint whose state changes.
    pub src: u32,
    /// Endpoint that should honour it.
    pub dst: u32,
    /// `RPMSG_EPT_OFF` or `RPMSG_EPT_ON`.
    pub flags: u32,
}

impl<'a> TryFromCtx<'a, Endian> for FcMessage {
    type Error = scroll::Error;

    fn try_from_ctx(buf: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let off = &mut 0;
        let src = buf.gread_with(off, endian)?;
        let dst = buf.gread_with(off, endian)?;
        let flags = buf.gread_with(off, endian)?;
        Ok((Self { src, dst, flags }, *off))
    }
}

impl TryIntoCtx<Endian> for FcMessage {
    type Error = scroll::Error;

    fn try_into_ctx(self, buf: &mut [u8], endian: Endian) -> Result<usize, Self::Error> {
        let off = &mut 0;
        buf.gwrite_with(self.src, off, endian)?;
        buf.gwrite_with(self.dst, off, endian)?;
        buf.gwrite_with(self.flags, off, endian)?;
        Ok(*off)
    }
}

impl FcMessage {
    /// Encodes the request.
    pub fn encode(&self) -> Result<[u8; RPMSG_FC_MSG_SIZE], WireError> {
        let mut out = [0u8; RPMSG_FC_MSG_SIZE];
        out.pwrite_with(*self, 0, LE)?;
        Ok(out)
    }

    /// Decodes a request; the payload must be exactly `RPMSG_FC_MSG_SIZE` bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != RPMSG_FC_MSG_SIZE {
            return Err(WireError::BadLength(buf.len()));
        }
        Ok(buf.pread_with(0, LE)?)
    }
}

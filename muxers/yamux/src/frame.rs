// Copyright 2021 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! The yamux frame header: 12 bytes of version, type, flags, stream id and
//! length, as per the yamux specification.

use bytes::{Buf, BufMut};
use std::ops::BitOr;

pub(crate) const HEADER_LEN: usize = 12;

const PROTO_VERSION: u8 = 0;

/// Largest body of a single data frame we emit. Bigger writes are split.
pub(crate) const MAX_FRAME_BODY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameType {
    Data,
    WindowUpdate,
    Ping,
    GoAway,
}

impl FrameType {
    fn as_u8(self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::WindowUpdate => 1,
            FrameType::Ping => 2,
            FrameType::GoAway => 3,
        }
    }

    fn from_u8(v: u8) -> Option<FrameType> {
        match v {
            0 => Some(FrameType::Data),
            1 => Some(FrameType::WindowUpdate),
            2 => Some(FrameType::Ping),
            3 => Some(FrameType::GoAway),
            _ => None,
        }
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const SYN: Flags = Flags(1);
    pub const ACK: Flags = Flags(2);
    pub const FIN: Flags = Flags(4);
    pub const RST: Flags = Flags(8);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Termination codes carried in the length field of a GoAway frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GoAwayCode {
    Normal,
    ProtocolError,
    InternalError,
}

impl GoAwayCode {
    fn as_u32(self) -> u32 {
        match self {
            GoAwayCode::Normal => 0,
            GoAwayCode::ProtocolError => 1,
            GoAwayCode::InternalError => 2,
        }
    }

    pub fn from_u32(v: u32) -> GoAwayCode {
        match v {
            1 => GoAwayCode::ProtocolError,
            2 => GoAwayCode::InternalError,
            _ => GoAwayCode::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub typ: FrameType,
    pub flags: Flags,
    pub stream_id: u32,
    /// Body length for Data frames, the credit delta for WindowUpdate, the
    /// opaque value for Ping and the termination code for GoAway.
    pub length: u32,
}

impl Header {
    pub fn data(stream_id: u32, len: u32, flags: Flags) -> Header {
        Header { typ: FrameType::Data, flags, stream_id, length: len }
    }

    pub fn window_update(stream_id: u32, credit: u32, flags: Flags) -> Header {
        Header { typ: FrameType::WindowUpdate, flags, stream_id, length: credit }
    }

    pub fn ping(opaque: u32, flags: Flags) -> Header {
        Header { typ: FrameType::Ping, flags, stream_id: 0, length: opaque }
    }

    pub fn go_away(code: GoAwayCode) -> Header {
        Header {
            typ: FrameType::GoAway,
            flags: Flags::NONE,
            stream_id: 0,
            length: code.as_u32(),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let mut w = &mut buf[..];
        w.put_u8(PROTO_VERSION);
        w.put_u8(self.typ.as_u8());
        w.put_u16(self.flags.0);
        w.put_u32(self.stream_id);
        w.put_u32(self.length);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Header, HeaderDecodeError> {
        let mut r = &buf[..];
        let version = r.get_u8();
        if version != PROTO_VERSION {
            return Err(HeaderDecodeError::Version(version));
        }
        let typ = r.get_u8();
        let typ = FrameType::from_u8(typ).ok_or(HeaderDecodeError::Type(typ))?;
        let flags = Flags(r.get_u16());
        let stream_id = r.get_u32();
        let length = r.get_u32();
        Ok(Header { typ, flags, stream_id, length })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderDecodeError {
    Version(u8),
    Type(u8),
}

impl std::fmt::Display for HeaderDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderDecodeError::Version(v) => write!(f, "unknown yamux version {}", v),
            HeaderDecodeError::Type(t) => write!(f, "unknown frame type {}", t),
        }
    }
}

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

//! # Multiselect
//!
//! This crate implements the negotiation half of a connection upgrade: a
//! length-prefixed multi-protocol selection over any duplex byte stream.
//! Two peers that each support a set of protocols use it to converge on a
//! single protocol before speaking it.
//!
//! ## Roles
//!
//! Negotiation is asymmetric. The _dialer_ offers protocols one at a time,
//! in its order of preference; the _listener_ answers each offer with either
//! an echo of the protocol (accepted) or `na` (not available). The first
//! protocol accepted by the listener is the outcome on both sides, which
//! makes the dialer's order authoritative.
//!
//! Use [`dialer_select_proto`] on the side that initiated the connection and
//! [`listener_select_proto`] on the side that accepted it. Both functions
//! borrow the I/O resource and leave it positioned just past the final
//! negotiation message, ready for the selected protocol.
//!
//! This crate deliberately knows nothing about what is being negotiated:
//! security protocols and stream multiplexers go through the exact same
//! exchange.

mod dialer_select;
mod listener_select;
mod protocol;

pub use crate::dialer_select::dialer_select_proto;
pub use crate::listener_select::listener_select_proto;
pub use crate::protocol::{Message, NegotiationError, MAX_MESSAGE_LEN};

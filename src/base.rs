// Copyright (c) 2026 wspp developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A websocket [base] frame and accompanying codec.
//!
//! [base]: https://tools.ietf.org/html/rfc6455#section-5.2

use bytes::{BufMut, BytesMut};
use std::{convert::TryFrom, fmt, io};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum size of a frame header (2 bytes fixed part, 8 bytes extended
/// payload length, 4 bytes masking key).
pub(crate) const MAX_HEADER_SIZE: usize = 14;

// OpCode /////////////////////////////////////////////////////////////////////////////////////////

/// Operation codes defined in [RFC6455](https://tools.ietf.org/html/rfc6455#section-5.2).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum OpCode {
    /// A continuation frame of a fragmented message.
    Continue,
    /// A text data frame.
    Text,
    /// A binary data frame.
    Binary,
    /// A close control frame.
    Close,
    /// A ping control frame.
    Ping,
    /// A pong control frame.
    Pong
}

impl OpCode {
    /// Is this a control opcode?
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpCode::Continue => f.write_str("Continue"),
            OpCode::Text => f.write_str("Text"),
            OpCode::Binary => f.write_str("Binary"),
            OpCode::Close => f.write_str("Close"),
            OpCode::Ping => f.write_str("Ping"),
            OpCode::Pong => f.write_str("Pong")
        }
    }
}

/// Error returned by `OpCode::try_from` if the opcode number is reserved
/// or out of range.
#[derive(Debug)]
pub struct UnknownOpCode(());

impl fmt::Display for UnknownOpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("unknown opcode")
    }
}

impl std::error::Error for UnknownOpCode {}

impl TryFrom<u8> for OpCode {
    type Error = UnknownOpCode;

    fn try_from(val: u8) -> Result<OpCode, Self::Error> {
        match val {
            0 => Ok(OpCode::Continue),
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            _ => Err(UnknownOpCode(()))
        }
    }
}

impl From<OpCode> for u8 {
    fn from(opcode: OpCode) -> u8 {
        match opcode {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10
        }
    }
}

// Mode ///////////////////////////////////////////////////////////////////////////////////////////

/// The role a codec or session plays on the connection.
///
/// The masking rules of RFC6455 depend on it: client-to-server frames
/// must be masked, server-to-client frames must not be.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Client-side of a connection (implies masking of payload data).
    Client,
    /// Server-side of a connection.
    Server
}

impl Mode {
    pub fn is_client(self) -> bool {
        matches!(self, Mode::Client)
    }

    pub fn is_server(self) -> bool {
        !self.is_client()
    }
}

// Frame //////////////////////////////////////////////////////////////////////////////////////////

/// A websocket [base](https://tools.ietf.org/html/rfc6455#section-5.2) frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The `fin` flag.
    fin: bool,
    /// The `rsv1` flag.
    rsv1: bool,
    /// The `rsv2` flag.
    rsv2: bool,
    /// The `rsv3` flag.
    rsv3: bool,
    /// The `mask` flag.
    masked: bool,
    /// The `opcode`.
    opcode: OpCode,
    /// The masking key.
    mask: u32,
    /// The payload data, unmasked.
    payload: BytesMut
}

impl Frame {
    /// Create a new final frame with the given [`OpCode`] and no payload.
    pub fn new(oc: OpCode) -> Self {
        Frame {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            masked: false,
            opcode: oc,
            mask: 0,
            payload: BytesMut::new()
        }
    }

    /// Is the `fin` flag set?
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Set the `fin` flag.
    pub fn set_fin(&mut self, fin: bool) -> &mut Self {
        self.fin = fin;
        self
    }

    /// Is the `rsv1` flag set?
    pub fn is_rsv1(&self) -> bool {
        self.rsv1
    }

    /// Is the `rsv2` flag set?
    pub fn is_rsv2(&self) -> bool {
        self.rsv2
    }

    /// Is the `rsv3` flag set?
    pub fn is_rsv3(&self) -> bool {
        self.rsv3
    }

    /// Is the `masked` flag set?
    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// Set the `masked` flag and the masking key.
    pub fn set_mask(&mut self, mask: u32) -> &mut Self {
        self.masked = true;
        self.mask = mask;
        self
    }

    /// Get the `opcode`.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// The payload data.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Set the payload data.
    pub fn set_payload(&mut self, data: impl Into<BytesMut>) -> &mut Self {
        self.payload = data.into();
        self
    }

    /// Consume the frame and return its payload.
    pub fn into_payload(self) -> BytesMut {
        self.payload
    }
}

// Frame codec ////////////////////////////////////////////////////////////////////////////////////

/// If the payload length byte is 126, the following two bytes represent the
/// actual payload length.
const TWO_EXT: u8 = 126;

/// If the payload length byte is 127, the following eight bytes represent
/// the actual payload length.
const EIGHT_EXT: u8 = 127;

/// Codec for encoding/decoding websocket [base] [`Frame`]s.
///
/// Decoding is incremental: partial input yields `Ok(None)` and the state
/// reached so far is kept until more bytes arrive.
///
/// [base]: https://tools.ietf.org/html/rfc6455#section-5.2
#[derive(Debug)]
pub struct Codec {
    /// Decode state.
    state: Option<DecodeState>,
    /// Client or server end of the connection.
    mode: Mode,
    /// Maximum size of payload data per frame.
    max_data_size: u64,
    /// Bits reserved by a negotiated extension.
    reserved_bits: u8
}

#[derive(Debug)]
enum DecodeState {
    /// Initial decoding state.
    Start,
    /// The first 2 bytes of a new frame have been decoded.
    /// Next is to decode the total frame length.
    Length {
        frame: Frame,
        length_code: u8
    },
    /// The frame length has been decoded.
    /// Next is to read the masking key if present.
    MaskKey {
        frame: Frame,
        length: u64
    },
    /// The frame length and masking key have been decoded.
    /// As the final step, the payload data will be decoded.
    Body {
        frame: Frame,
        length: u64
    }
}

impl Codec {
    /// Create a new base frame codec for the given mode.
    ///
    /// The codec will support decoding payload lengths up to 256 MiB
    /// (use `set_max_data_size` to change this value).
    pub fn new(mode: Mode) -> Self {
        Codec {
            state: Some(DecodeState::Start),
            mode,
            max_data_size: 256 * 1024 * 1024,
            reserved_bits: 0
        }
    }

    /// Get the configured maximum payload length.
    pub fn max_data_size(&self) -> u64 {
        self.max_data_size
    }

    /// Limit the maximum size of payload data to `size` bytes.
    pub fn set_max_data_size(&mut self, size: u64) -> &mut Self {
        self.max_data_size = size;
        self
    }

    /// Add to the reserved bits in use, e.g. because an extension has
    /// been negotiated for this connection.
    pub fn add_reserved_bits(&mut self, bits: (bool, bool, bool)) -> &mut Self {
        let (r1, r2, r3) = bits;
        self.reserved_bits |= (r1 as u8) << 2 | (r2 as u8) << 1 | r3 as u8;
        self
    }

    /// Reset the reserved bits.
    pub fn clear_reserved_bits(&mut self) {
        self.reserved_bits = 0
    }

    /// Apply the masking key to the payload data.
    ///
    /// Since masking is an involution the same operation unmasks.
    pub fn apply_mask(mask: u32, buf: &mut [u8]) {
        let mask_buf = mask.to_be_bytes();
        for (byte, &key) in buf.iter_mut().zip(mask_buf.iter().cycle()) {
            *byte ^= key;
        }
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                Some(DecodeState::Start) => {
                    if buf.len() < 2 {
                        self.state = Some(DecodeState::Start);
                        return Ok(None)
                    }

                    let header_bytes = buf.split_to(2);
                    let first = header_bytes[0];
                    let second = header_bytes[1];

                    let fin = first & 0x80 != 0;
                    let opcode = OpCode::try_from(first & 0xF).map_err(|_| Error::ReservedOpCode)?;
                    if opcode.is_control() && !fin {
                        return Err(Error::FragmentedControl)
                    }

                    let mut frame = Frame::new(opcode);
                    frame.fin = fin;

                    let rsv1 = first & 0x40 != 0;
                    if rsv1 && (self.reserved_bits & 4 == 0) {
                        return Err(Error::InvalidReservedBit(1))
                    }
                    frame.rsv1 = rsv1;

                    let rsv2 = first & 0x20 != 0;
                    if rsv2 && (self.reserved_bits & 2 == 0) {
                        return Err(Error::InvalidReservedBit(2))
                    }
                    frame.rsv2 = rsv2;

                    let rsv3 = first & 0x10 != 0;
                    if rsv3 && (self.reserved_bits & 1 == 0) {
                        return Err(Error::InvalidReservedBit(3))
                    }
                    frame.rsv3 = rsv3;

                    frame.masked = second & 0x80 != 0;
                    if self.mode.is_server() && !frame.masked {
                        return Err(Error::UnmaskedFrame)
                    }
                    if self.mode.is_client() && frame.masked {
                        return Err(Error::MaskedFrame)
                    }

                    self.state = Some(DecodeState::Length { frame, length_code: second & 0x7F })
                }
                Some(DecodeState::Length { frame, length_code }) => {
                    let len = match length_code {
                        TWO_EXT => {
                            if buf.len() < 2 {
                                self.state = Some(DecodeState::Length { frame, length_code });
                                return Ok(None)
                            }
                            let len = u64::from(u16::from_be_bytes([buf[0], buf[1]]));
                            buf.split_to(2);
                            if len < u64::from(TWO_EXT) {
                                return Err(Error::NonMinimalLength)
                            }
                            len
                        }
                        EIGHT_EXT => {
                            if buf.len() < 8 {
                                self.state = Some(DecodeState::Length { frame, length_code });
                                return Ok(None)
                            }
                            let len = u64::from_be_bytes([
                                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7]
                            ]);
                            buf.split_to(8);
                            if len & (1 << 63) != 0 {
                                return Err(Error::InvalidLength(len))
                            }
                            if len <= u64::from(u16::MAX) {
                                return Err(Error::NonMinimalLength)
                            }
                            len
                        }
                        n => u64::from(n)
                    };

                    if len > 125 && frame.opcode().is_control() {
                        return Err(Error::InvalidControlFrameLen)
                    }

                    if len > self.max_data_size {
                        return Err(Error::PayloadTooLarge {
                            actual: len,
                            maximum: self.max_data_size
                        })
                    }

                    self.state = Some(DecodeState::MaskKey { frame, length: len })
                }
                Some(DecodeState::MaskKey { mut frame, length }) => {
                    if !frame.is_masked() {
                        self.state = Some(DecodeState::Body { frame, length });
                        continue
                    }
                    if buf.len() < 4 {
                        self.state = Some(DecodeState::MaskKey { frame, length });
                        return Ok(None)
                    }
                    frame.mask = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    buf.split_to(4);
                    self.state = Some(DecodeState::Body { frame, length })
                }
                Some(DecodeState::Body { frame, length: 0 }) => {
                    self.state = Some(DecodeState::Start);
                    return Ok(Some(frame))
                }
                Some(DecodeState::Body { mut frame, length }) => {
                    if (buf.len() as u64) < length {
                        if (buf.capacity() as u64) < length {
                            buf.reserve(length as usize - buf.len())
                        }
                        self.state = Some(DecodeState::Body { frame, length });
                        return Ok(None)
                    }
                    frame.payload = buf.split_to(length as usize);
                    if frame.is_masked() {
                        Codec::apply_mask(frame.mask, &mut frame.payload)
                    }
                    self.state = Some(DecodeState::Start);
                    return Ok(Some(frame))
                }
                None => return Err(Error::IllegalCodecState)
            }
        }
    }
}

impl Encoder<Frame> for Codec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.opcode().is_control() {
            if !frame.is_fin() {
                return Err(Error::FragmentedControl)
            }
            if frame.payload_len() > 125 {
                return Err(Error::InvalidControlFrameLen)
            }
        }

        buf.reserve(MAX_HEADER_SIZE + frame.payload_len());

        let mut first_byte = 0_u8;
        if frame.is_fin() {
            first_byte |= 0x80
        }
        if frame.is_rsv1() {
            first_byte |= 0x40
        }
        if frame.is_rsv2() {
            first_byte |= 0x20
        }
        if frame.is_rsv3() {
            first_byte |= 0x10
        }
        first_byte |= u8::from(frame.opcode());
        buf.put_u8(first_byte);

        let masked = self.mode.is_client();
        let mut second_byte = 0_u8;
        if masked {
            second_byte |= 0x80
        }

        let len = frame.payload_len();
        if len < usize::from(TWO_EXT) {
            second_byte |= len as u8;
            buf.put_u8(second_byte)
        } else if len <= usize::from(u16::MAX) {
            second_byte |= TWO_EXT;
            buf.put_u8(second_byte);
            buf.extend_from_slice(&(len as u16).to_be_bytes())
        } else {
            second_byte |= EIGHT_EXT;
            buf.put_u8(second_byte);
            buf.extend_from_slice(&(len as u64).to_be_bytes())
        }

        let mask = frame.mask;
        let mut payload = frame.into_payload();
        if masked {
            buf.extend_from_slice(&mask.to_be_bytes());
            Codec::apply_mask(mask, &mut payload)
        }
        buf.extend_from_slice(&payload);

        Ok(())
    }
}

// Codec error type ///////////////////////////////////////////////////////////////////////////////

/// Errors which may occur when encoding or decoding frames.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error has been encountered.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A reserved opcode number has been decoded.
    #[error("reserved opcode")]
    ReservedOpCode,

    /// A fragmented control frame (fin bit not set) has been decoded.
    #[error("fragmented control frame")]
    FragmentedControl,

    /// A control frame with a payload length over 125 bytes.
    #[error("invalid control frame length")]
    InvalidControlFrameLen,

    /// A reserved bit was set without a negotiated extension.
    #[error("invalid reserved bit: {0}")]
    InvalidReservedBit(u8),

    /// A client-to-server frame was not masked.
    #[error("unmasked frame from client")]
    UnmaskedFrame,

    /// A server-to-client frame was masked.
    #[error("masked frame from server")]
    MaskedFrame,

    /// The payload length was not encoded in its minimal form.
    #[error("non-minimal payload length encoding")]
    NonMinimalLength,

    /// A 64-bit payload length with the high bit set.
    #[error("invalid payload length: {0}")]
    InvalidLength(u64),

    /// The payload length of a frame exceeded the configured maximum.
    #[error("payload too large: len = {actual}, maximum = {maximum}")]
    PayloadTooLarge { actual: u64, maximum: u64 },

    /// The codec transitioned into an illegal state.
    /// This happens if the codec is used after it has returned an error.
    #[error("illegal codec state")]
    IllegalCodecState
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

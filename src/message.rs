//! CoAP message model and the RFC 7252 binary codec.
//!
//! Decoding is a pure function of the input buffer: it either yields a complete [`Message`] or
//! a [`DecodeError`] describing the first malformed field.

use bytes::{BufMut, Bytes, BytesMut};
use coap_lite::{CoapOption, MessageClass, MessageType, RequestType};
use thiserror::Error;

use crate::u24::u24;

pub type MessageId = u16;

const VERSION: u8 = 1;
const HEADER_LEN: usize = 4;
const PAYLOAD_MARKER: u8 = 0xff;
pub const MAX_TOKEN_LEN: usize = 8;

/// Largest option value length representable with the 2-byte extended length form.
const MAX_ENCODABLE_OPTION_LEN: usize = 0xffff + 269;

/// A single CoAP message as seen on the wire.
///
/// Options are kept sorted by option number at all times (stable for repeated options), which
/// is what the delta encoding requires.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    /// Raw code byte.  Codes without a [`MessageClass`] variant survive decode and re-encode.
    pub code: u8,
    pub message_id: MessageId,
    pub token: Vec<u8>,
    options: Vec<(u16, Vec<u8>)>,
    pub payload: Vec<u8>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("token length {0} exceeds {MAX_TOKEN_LEN} bytes")]
    TokenTooLong(usize),

    #[error("option {number} value of {len} bytes is outside the allowed range {min}..={max}")]
    InvalidOptionLength {
        number: u16,
        len: usize,
        min: usize,
        max: usize,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer of {0} bytes is shorter than the fixed header")]
    TooShort(usize),

    #[error("unsupported protocol version {0}")]
    InvalidVersion(u8),

    #[error("reserved token length {0}")]
    InvalidTokenLength(u8),

    #[error("token length {declared} exceeds the {remaining} bytes remaining")]
    TruncatedToken { declared: usize, remaining: usize },

    #[error("reserved option delta nibble")]
    InvalidOptionDelta,

    #[error("reserved option length nibble")]
    InvalidOptionLength,

    #[error("option number overflowed 16 bits")]
    OptionNumberOverflow,

    #[error("option header or value runs past the end of the buffer")]
    TruncatedOption,

    #[error("payload marker present with an empty payload")]
    EmptyPayload,
}

impl Message {
    pub fn new(message_type: MessageType, code: MessageClass) -> Self {
        Self {
            message_type,
            code: u8::from(code),
            message_id: 0,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// New confirmable request whose Uri-Path/Uri-Query options are derived from `path`.
    pub fn request(method: RequestType, path: &str) -> Self {
        let mut message = Self::new(MessageType::Confirmable, MessageClass::Request(method));
        message.set_path(path);
        message
    }

    /// Empty Acknowledgement for an inbound Confirmable message.
    pub fn ack_for(message_id: MessageId) -> Self {
        let mut ack = Self::new(MessageType::Acknowledgement, MessageClass::Empty);
        ack.message_id = message_id;
        ack
    }

    /// Empty Reset rejecting an inbound message.
    pub fn reset_for(message_id: MessageId) -> Self {
        let mut reset = Self::new(MessageType::Reset, MessageClass::Empty);
        reset.message_id = message_id;
        reset
    }

    pub fn is_empty(&self) -> bool {
        self.code == 0
    }

    /// Any code in classes 2 through 5, registered or not.
    pub fn is_response(&self) -> bool {
        matches!(self.code >> 5, 2..=5)
    }

    pub fn class(&self) -> MessageClass {
        MessageClass::from(self.code)
    }

    /// Inserts an option after any existing options with the same number.
    pub fn add_option(&mut self, option: CoapOption, value: Vec<u8>) {
        self.add_option_number(u16::from(option), value);
    }

    pub fn add_option_number(&mut self, number: u16, value: Vec<u8>) {
        let index = self.options.partition_point(|(n, _)| *n <= number);
        self.options.insert(index, (number, value));
    }

    pub fn clear_option(&mut self, option: CoapOption) {
        let number = u16::from(option);
        self.options.retain(|(n, _)| *n != number);
    }

    pub fn get_options(&self, option: CoapOption) -> impl Iterator<Item = &[u8]> {
        let number = u16::from(option);
        self.options
            .iter()
            .filter(move |(n, _)| *n == number)
            .map(|(_, value)| value.as_slice())
    }

    pub fn get_first_option(&self, option: CoapOption) -> Option<&[u8]> {
        self.get_options(option).next()
    }

    pub fn options(&self) -> &[(u16, Vec<u8>)] {
        &self.options
    }

    /// Replaces Uri-Path and Uri-Query with the segments of `path` (leading slash optional).
    pub fn set_path(&mut self, path: &str) {
        self.clear_option(CoapOption::UriPath);
        self.clear_option(CoapOption::UriQuery);
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        };
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        for param in query.into_iter().flat_map(|q| q.split('&')).filter(|s| !s.is_empty()) {
            self.add_option(CoapOption::UriQuery, param.as_bytes().to_vec());
        }
    }

    pub fn path(&self) -> String {
        let segments: Vec<_> = self
            .get_options(CoapOption::UriPath)
            .map(String::from_utf8_lossy)
            .collect();
        format!("/{}", segments.join("/"))
    }

    pub fn set_content_format(&mut self, content_format: u16) {
        self.clear_option(CoapOption::ContentFormat);
        self.add_option(CoapOption::ContentFormat, encode_uint(u32::from(content_format)));
    }

    pub fn content_format(&self) -> Option<u16> {
        self.get_first_option(CoapOption::ContentFormat)
            .and_then(|value| u16::try_from(decode_uint(value)?).ok())
    }

    pub fn set_observe(&mut self, sequence: u24) {
        self.clear_option(CoapOption::Observe);
        self.add_option(CoapOption::Observe, encode_uint(u32::from(sequence)));
    }

    /// Observe option value, or `None` if absent or wider than 24 bits.
    pub fn observe(&self) -> Option<u24> {
        self.get_first_option(CoapOption::Observe)
            .and_then(decode_uint)
            .and_then(|value| u24::try_from(value).ok())
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.validate()?;

        let type_bits = message_type_bits(self.message_type);
        buf.put_u8(VERSION << 6 | type_bits << 4 | self.token.len() as u8);
        buf.put_u8(self.code);
        buf.put_u16(self.message_id);
        buf.put_slice(&self.token);

        let mut previous = 0u16;
        for (number, value) in &self.options {
            let delta = usize::from(*number - previous);
            previous = *number;
            let (delta_nibble, delta_ext) = split_extended(delta);
            let (len_nibble, len_ext) = split_extended(value.len());
            buf.put_u8(delta_nibble << 4 | len_nibble);
            put_extended(buf, delta_ext);
            put_extended(buf, len_ext);
            buf.put_slice(value);
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }
        Ok(())
    }

    /// Checks the constraints [`Message::encode`] enforces without producing any bytes.
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(EncodeError::TokenTooLong(self.token.len()));
        }
        for (number, value) in &self.options {
            let (min, max) = option_length_bounds(*number);
            if value.len() < min || value.len() > max {
                return Err(EncodeError::InvalidOptionLength {
                    number: *number,
                    len: value.len(),
                    min,
                    max,
                });
            }
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(buf.len()));
        }
        let version = buf[0] >> 6;
        if version != VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }
        let message_type = message_type_from_bits((buf[0] >> 4) & 0x3);
        let token_len = buf[0] & 0xf;
        if usize::from(token_len) > MAX_TOKEN_LEN {
            return Err(DecodeError::InvalidTokenLength(token_len));
        }
        let code = buf[1];
        let message_id = u16::from_be_bytes([buf[2], buf[3]]);

        let rest = &buf[HEADER_LEN..];
        let token_len = usize::from(token_len);
        if token_len > rest.len() {
            return Err(DecodeError::TruncatedToken {
                declared: token_len,
                remaining: rest.len(),
            });
        }
        let token = rest[..token_len].to_vec();

        let mut cursor = &rest[token_len..];
        let mut options = Vec::new();
        let mut number = 0u16;
        let mut payload = Vec::new();
        while let Some((&first, tail)) = cursor.split_first() {
            cursor = tail;
            if first == PAYLOAD_MARKER {
                if cursor.is_empty() {
                    return Err(DecodeError::EmptyPayload);
                }
                payload = cursor.to_vec();
                break;
            }
            let delta = read_extended(first >> 4, &mut cursor)
                .map_err(|e| e.unwrap_or(DecodeError::InvalidOptionDelta))?;
            let len = read_extended(first & 0xf, &mut cursor)
                .map_err(|e| e.unwrap_or(DecodeError::InvalidOptionLength))?;
            number = u16::try_from(usize::from(number) + delta)
                .map_err(|_| DecodeError::OptionNumberOverflow)?;
            if len > cursor.len() {
                return Err(DecodeError::TruncatedOption);
            }
            let (value, tail) = cursor.split_at(len);
            options.push((number, value.to_vec()));
            cursor = tail;
        }

        Ok(Self {
            message_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }

    fn encoded_len_hint(&self) -> usize {
        let options: usize = self.options.iter().map(|(_, v)| v.len() + 5).sum();
        HEADER_LEN + self.token.len() + options + 1 + self.payload.len()
    }
}

fn message_type_bits(message_type: MessageType) -> u8 {
    match message_type {
        MessageType::Confirmable => 0,
        MessageType::NonConfirmable => 1,
        MessageType::Acknowledgement => 2,
        MessageType::Reset => 3,
    }
}

fn message_type_from_bits(bits: u8) -> MessageType {
    match bits {
        0 => MessageType::Confirmable,
        1 => MessageType::NonConfirmable,
        2 => MessageType::Acknowledgement,
        _ => MessageType::Reset,
    }
}

fn split_extended(value: usize) -> (u8, Option<ExtendedField>) {
    match value {
        0..=12 => (value as u8, None),
        13..=268 => (13, Some(ExtendedField::One((value - 13) as u8))),
        _ => (14, Some(ExtendedField::Two((value - 269) as u16))),
    }
}

enum ExtendedField {
    One(u8),
    Two(u16),
}

fn put_extended(buf: &mut BytesMut, field: Option<ExtendedField>) {
    match field {
        Some(ExtendedField::One(v)) => buf.put_u8(v),
        Some(ExtendedField::Two(v)) => buf.put_u16(v),
        None => {}
    }
}

/// Reads the extended form of a delta/length nibble.  `Err(None)` means the reserved nibble 15
/// was used, which the caller maps to the appropriate field-specific error.
fn read_extended(nibble: u8, cursor: &mut &[u8]) -> Result<usize, Option<DecodeError>> {
    match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 => {
            let (&ext, tail) = cursor
                .split_first()
                .ok_or(Some(DecodeError::TruncatedOption))?;
            *cursor = tail;
            Ok(usize::from(ext) + 13)
        }
        14 => {
            if cursor.len() < 2 {
                return Err(Some(DecodeError::TruncatedOption));
            }
            let ext = u16::from_be_bytes([cursor[0], cursor[1]]);
            *cursor = &cursor[2..];
            Ok(usize::from(ext) + 269)
        }
        _ => Err(None),
    }
}

/// Value length bounds from the option registry of RFC 7252 §5.10, RFC 7641 and RFC 7959.
fn option_length_bounds(number: u16) -> (usize, usize) {
    match number {
        1 => (0, 8),          // If-Match
        3 => (1, 255),        // Uri-Host
        4 => (1, 8),          // ETag
        5 => (0, 0),          // If-None-Match
        6 => (0, 3),          // Observe
        7 => (0, 2),          // Uri-Port
        8 => (0, 255),        // Location-Path
        11 => (0, 255),       // Uri-Path
        12 => (0, 2),         // Content-Format
        14 => (0, 4),         // Max-Age
        15 => (0, 255),       // Uri-Query
        17 => (0, 2),         // Accept
        20 => (0, 255),       // Location-Query
        23 | 27 => (0, 3),    // Block2, Block1
        28 | 60 => (0, 4),    // Size2, Size1
        35 => (1, 1034),      // Proxy-Uri
        39 => (1, 255),       // Proxy-Scheme
        _ => (0, MAX_ENCODABLE_OPTION_LEN),
    }
}

/// Minimal-length big-endian encoding used by uint options.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn decode_uint(value: &[u8]) -> Option<u32> {
    if value.len() > 4 {
        return None;
    }
    Some(value.iter().fold(0u32, |acc, b| acc << 8 | u32::from(*b)))
}

/// Renders a code in the dotted `c.dd` form, e.g. `2.05`.
pub fn code_string(code: u8) -> String {
    format!("{}.{:02}", code >> 5, code & 0x1f)
}

pub fn is_success_code(code: u8) -> bool {
    code >> 5 == 2
}

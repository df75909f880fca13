/// Wire codec for the remote serial protocol
///
/// Checksums, `$...#xx` framing, hex value encoding, run-length
/// compression and register packet packing. Nothing here touches a socket.

use thiserror::Error;

use crate::types::{Endian, RegisterDescriptor, RegisterLayout, RegisterMap};

/// Out-of-band interrupt request
pub const INTERRUPT: u8 = 0x03;
pub const ACK: u8 = b'+';
pub const NACK: u8 = b'-';

const PACKET_START: u8 = b'$';
const PACKET_END: u8 = b'#';
const REPEAT: u8 = b'*';
const ESCAPE: u8 = b'}';
const COUNT_BIAS: u8 = 29;
/// Longest run a single `c*n` escape can describe
const MAX_RUN: usize = 97;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("packet does not start with '$'")]
    MissingStart,
    #[error("packet is missing its '#xx' trailer")]
    MissingTerminator,
    #[error("checksum digits are not hex")]
    BadChecksumDigits,
    #[error("checksum mismatch: packet says {expected:02x}, body sums to {actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("repeat marker without a preceding byte or count")]
    DanglingRepeat,
    #[error("invalid repeat count byte {0:#04x}")]
    InvalidRepeatCount(u8),
    #[error("hex string has odd length")]
    OddHexLength,
    #[error("invalid hex digit")]
    InvalidHex,
}

/// Sum of all bytes modulo 256
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc.wrapping_add(b))
}

/// Frame `body` as `$body#xx`. The body is sent exactly as given.
pub fn build_packet(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.push(PACKET_START);
    frame.extend_from_slice(body);
    frame.push(PACKET_END);
    frame.extend_from_slice(format!("{:02x}", checksum(body)).as_bytes());
    frame
}

/// Validate a complete `$body#xx` frame and return its (still encoded) body
pub fn parse_packet(frame: &[u8]) -> Result<&[u8], FramingError> {
    if frame.first() != Some(&PACKET_START) {
        return Err(FramingError::MissingStart);
    }
    if frame.len() < 4 || frame[frame.len() - 3] != PACKET_END {
        return Err(FramingError::MissingTerminator);
    }

    let body = &frame[1..frame.len() - 3];
    let expected = decode_hex_byte(frame[frame.len() - 2], frame[frame.len() - 1])
        .ok_or(FramingError::BadChecksumDigits)?;
    let actual = checksum(body);
    if expected != actual {
        return Err(FramingError::ChecksumMismatch { expected, actual });
    }

    Ok(body)
}

/// Value of a single ASCII hex digit
pub fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn decode_hex_byte(hi: u8, lo: u8) -> Option<u8> {
    Some(hex_digit(hi)? << 4 | hex_digit(lo)?)
}

/// Lowercase hex, two characters per byte
pub fn encode_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn decode_hex(hex: &[u8]) -> Result<Vec<u8>, FramingError> {
    if hex.len() % 2 != 0 {
        return Err(FramingError::OddHexLength);
    }
    hex.chunks(2)
        .map(|pair| decode_hex_byte(pair[0], pair[1]).ok_or(FramingError::InvalidHex))
        .collect()
}

/// Parse a bare hex number such as an address or length field
pub fn parse_hex_u64(hex: &[u8]) -> Option<u64> {
    if hex.is_empty() || hex.len() > 16 {
        return None;
    }
    hex.iter()
        .try_fold(0u64, |acc, &c| Some(acc << 4 | u64::from(hex_digit(c)?)))
}

/// Hex-encode `value` as a `bits`-wide register in target byte order
pub fn hex_encode_value(value: u128, bits: u32, endian: Endian) -> String {
    let len = ((bits as usize + 7) / 8).min(16);
    let be = value.to_be_bytes();
    let mut bytes = be[16 - len..].to_vec();
    if endian == Endian::Little {
        bytes.reverse();
    }
    encode_hex(&bytes)
}

/// Inverse of [`hex_encode_value`]
pub fn hex_decode_value(hex: &[u8], endian: Endian) -> Result<u128, FramingError> {
    let mut bytes = decode_hex(hex)?;
    if bytes.len() > 16 {
        return Err(FramingError::InvalidHex);
    }
    if endian == Endian::Little {
        bytes.reverse();
    }
    Ok(bytes.iter().fold(0u128, |acc, &b| acc << 8 | u128::from(b)))
}

/// Run-length encode a packet body
pub fn length_encode(input: &[u8]) -> Vec<u8> {
    length_encode_bounded(input, usize::MAX)
}

/// Run-length encode at most `limit` output bytes.
///
/// Encoding stops at a token boundary, so the result is always a valid
/// encoding of some prefix of `input`.
pub fn length_encode_bounded(input: &[u8], limit: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len().min(limit));
    let mut token = Vec::new();
    let mut i = 0;

    while i < input.len() {
        token.clear();
        let c = input[i];

        if c == ESCAPE {
            // An escape pair is indivisible.
            let end = (i + 2).min(input.len());
            token.extend_from_slice(&input[i..end]);
            i = end;
        } else {
            let run = input[i..].iter().take_while(|&&b| b == c).count();
            encode_run(c, run, &mut token);
            i += run;
        }

        if out.len() + token.len() > limit {
            break;
        }
        out.extend_from_slice(&token);
    }

    out
}

fn encode_run(c: u8, len: usize, out: &mut Vec<u8>) {
    if matches!(c, REPEAT | PACKET_START | PACKET_END | ESCAPE) {
        out.extend(std::iter::repeat(c).take(len));
        return;
    }

    let mut remaining = len;
    while remaining > MAX_RUN {
        push_repeat(c, MAX_RUN, out);
        remaining -= MAX_RUN;
    }

    match remaining {
        0 => {}
        1 | 2 => out.extend(std::iter::repeat(c).take(remaining)),
        // A count byte for 7 or 8 would be '#' or '$'.
        7 => {
            out.extend_from_slice(&[c, c]);
            push_repeat(c, 5, out);
        }
        8 => {
            out.extend_from_slice(&[c, c, c]);
            push_repeat(c, 5, out);
        }
        n => push_repeat(c, n, out),
    }
}

fn push_repeat(c: u8, len: usize, out: &mut Vec<u8>) {
    out.push(c);
    out.push(REPEAT);
    out.push((len - 1) as u8 + COUNT_BIAS);
}

/// Expand `c*n` runs back into `c` repeated `n - 29` more times
pub fn length_decode(input: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.iter().copied();

    while let Some(b) = bytes.next() {
        if b != REPEAT {
            out.push(b);
            continue;
        }

        let count = bytes.next().ok_or(FramingError::DanglingRepeat)?;
        let previous = *out.last().ok_or(FramingError::DanglingRepeat)?;
        let extra = count
            .checked_sub(COUNT_BIAS)
            .ok_or(FramingError::InvalidRepeatCount(count))?;
        out.extend(std::iter::repeat(previous).take(extra as usize));
    }

    Ok(out)
}

fn needs_escape(b: u8) -> bool {
    matches!(b, PACKET_START | PACKET_END | ESCAPE | REPEAT)
}

/// Escape raw binary data for transmission (`}` followed by byte ^ 0x20)
pub fn escape_binary(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if needs_escape(b) {
            out.push(ESCAPE);
            out.push(b ^ 0x20);
        } else {
            out.push(b);
        }
    }
    out
}

/// Escaped length of a single raw byte
pub fn escaped_len(b: u8) -> usize {
    if needs_escape(b) {
        2
    } else {
        1
    }
}

pub fn unescape_binary(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter().copied();
    while let Some(b) = bytes.next() {
        if b == ESCAPE {
            if let Some(next) = bytes.next() {
                out.push(next ^ 0x20);
            }
        } else {
            out.push(b);
        }
    }
    out
}

/// Register-aware encoder shared by both session roles.
///
/// Immutable once built; the layout order defines the `g`/`G` byte layout.
#[derive(Debug, Clone)]
pub struct Codec {
    layout: RegisterLayout,
    endian: Endian,
}

impl Codec {
    pub fn new(layout: RegisterLayout, endian: Endian) -> Self {
        Self { layout, endian }
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn encode_register(&self, register: &RegisterDescriptor, value: u128) -> String {
        hex_encode_value(value, register.bits, self.endian)
    }

    pub fn decode_register(&self, hex: &[u8]) -> Result<u128, FramingError> {
        hex_decode_value(hex, self.endian)
    }

    /// Pack values in layout order, stopping at the first register with no value
    pub fn pack_registers(&self, values: &RegisterMap) -> String {
        let mut out = String::with_capacity(self.layout.total_hex_len());
        for register in self.layout.iter() {
            let Some(&value) = values.get(&register.name) else {
                break;
            };
            out.push_str(&self.encode_register(register, value));
        }
        out
    }

    /// Unpack a `g` reply. Registers past the end of `hex` are left out, as
    /// are registers the peer marked unavailable with `x` characters.
    pub fn unpack_registers(&self, hex: &[u8]) -> Result<RegisterMap, FramingError> {
        let mut values = RegisterMap::new();
        let mut offset = 0;

        for register in self.layout.iter() {
            let end = offset + register.hex_len();
            if end > hex.len() {
                break;
            }
            let field = &hex[offset..end];
            offset = end;

            if field.iter().all(|&c| c == b'x' || c == b'X') {
                continue;
            }
            values.insert(register.name.clone(), self.decode_register(field)?);
        }

        Ok(values)
    }
}

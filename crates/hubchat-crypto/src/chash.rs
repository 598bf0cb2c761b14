//! Checksum-interleaved fixed-length hashes ("c-hash").
//!
//! A c-hash is a truncated digest of the input with a 4-byte checksum spread
//! bit by bit across it. The checksum positions come from the decimal digits
//! of pi, so a single mistyped character in a shared address is detected
//! without widening the encoding.
//!
//! Two lengths are supported:
//! - 160 bits: RIPEMD-160 minus its first 4 bytes, plus checksum, base32.
//! - 288 bits: full SHA-256, plus checksum, base64.

use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use data_encoding::BASE32_NOPAD;

use crate::hash::{ripemd160, sha256};

const PI_DIGITS: &str = "14159265358979323846264338327950288419716939937510";

/// Number of checksum bits interleaved into every c-hash.
pub const CHECKSUM_BITS: usize = 32;

/// Digest indices picked out of SHA-256(clean data) to form the checksum.
const CHECKSUM_INDICES: [usize; 4] = [5, 13, 21, 29];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChashError {
    #[error("unsupported c-hash length: {0}")]
    UnsupportedLength(usize),
    #[error("wrong number of checksum bits for length {length}: found {found}")]
    ChecksumBitCount { length: usize, found: usize },
    #[error("bad checksum length: {0} bits")]
    BadChecksumLength(usize),
}

/// Supported c-hash output widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChashLength {
    Bits160,
    Bits288,
}

impl ChashLength {
    pub fn from_bits(bits: usize) -> Result<Self, ChashError> {
        match bits {
            160 => Ok(Self::Bits160),
            288 => Ok(Self::Bits288),
            other => Err(ChashError::UnsupportedLength(other)),
        }
    }

    pub fn bits(self) -> usize {
        match self {
            Self::Bits160 => 160,
            Self::Bits288 => 288,
        }
    }

    /// Extra distance added to every relative offset.
    fn stride(self) -> usize {
        match self {
            Self::Bits160 => 0,
            Self::Bits288 => 4,
        }
    }

    fn table(self) -> &'static OnceLock<Result<[usize; CHECKSUM_BITS], ChashError>> {
        static OFFSETS_160: OnceLock<Result<[usize; CHECKSUM_BITS], ChashError>> = OnceLock::new();
        static OFFSETS_288: OnceLock<Result<[usize; CHECKSUM_BITS], ChashError>> = OnceLock::new();
        match self {
            Self::Bits160 => &OFFSETS_160,
            Self::Bits288 => &OFFSETS_288,
        }
    }
}

/// Walk the digits of pi, skipping zeros, accumulating each digit as a
/// relative offset until the target length is reached.
fn calc_offsets(length: ChashLength) -> Result<[usize; CHECKSUM_BITS], ChashError> {
    let target = length.bits();
    let mut found = Vec::with_capacity(CHECKSUM_BITS);
    let mut offset = 0usize;

    for digit in PI_DIGITS.bytes().map(|b| (b - b'0') as usize) {
        if digit == 0 {
            continue;
        }
        offset += digit + length.stride();
        if offset >= target {
            break;
        }
        found.push(offset);
    }

    let count = found.len();
    found
        .try_into()
        .map_err(|_| ChashError::ChecksumBitCount { length: target, found: count })
}

/// Output bit positions of the checksum bits, computed once per length.
pub fn checksum_offsets(length: ChashLength) -> Result<&'static [usize; CHECKSUM_BITS], ChashError> {
    length
        .table()
        .get_or_init(|| calc_offsets(length))
        .as_ref()
        .map_err(Clone::clone)
}

/// Force both offset tables. Call once at startup to surface a broken table
/// before any address is derived.
pub fn self_check() -> Result<(), ChashError> {
    checksum_offsets(ChashLength::Bits160)?;
    checksum_offsets(ChashLength::Bits288)?;
    Ok(())
}

fn checksum(clean: &[u8]) -> [u8; 4] {
    let full = sha256(clean);
    CHECKSUM_INDICES.map(|i| full[i])
}

fn to_bits(bytes: &[u8]) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1 == 1))
        .collect()
}

fn from_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| chunk.iter().fold(0u8, |acc, &bit| (acc << 1) | bit as u8))
        .collect()
}

/// Splice checksum bits into the clean bit string. Offsets are output
/// positions, so each insertion shifts the remaining clean bits right by one.
fn mix_checksum(clean: &[bool], checksum: &[bool], offsets: &[usize]) -> Result<Vec<bool>, ChashError> {
    if checksum.len() != CHECKSUM_BITS {
        return Err(ChashError::BadChecksumLength(checksum.len()));
    }

    let mut out = Vec::with_capacity(clean.len() + checksum.len());
    let mut start = 0usize;
    for (i, (&offset, &bit)) in offsets.iter().zip(checksum).enumerate() {
        let end = offset - i;
        out.extend_from_slice(&clean[start..end]);
        out.push(bit);
        start = end;
    }
    out.extend_from_slice(&clean[start..]);
    Ok(out)
}

/// Raw c-hash bytes (20 or 36) of `data`.
pub fn chash_bytes(data: &str, length: ChashLength) -> Result<Vec<u8>, ChashError> {
    let offsets = checksum_offsets(length)?;

    let clean: Vec<u8> = match length {
        ChashLength::Bits160 => ripemd160(data.as_bytes())[4..].to_vec(),
        ChashLength::Bits288 => sha256(data.as_bytes()).to_vec(),
    };
    let sum = checksum(&clean);

    let mixed = mix_checksum(&to_bits(&clean), &to_bits(&sum), offsets)?;
    Ok(from_bits(&mixed))
}

/// Encoded c-hash: base32 for 160 bits, base64 for 288 bits.
pub fn chash(data: &str, length: ChashLength) -> Result<String, ChashError> {
    let raw = chash_bytes(data, length)?;
    Ok(match length {
        ChashLength::Bits160 => BASE32_NOPAD.encode(&raw),
        ChashLength::Bits288 => B64.encode(&raw),
    })
}

pub fn chash160(data: &str) -> Result<String, ChashError> {
    chash(data, ChashLength::Bits160)
}

pub fn chash288(data: &str) -> Result<String, ChashError> {
    chash(data, ChashLength::Bits288)
}

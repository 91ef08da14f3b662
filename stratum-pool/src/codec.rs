//! Byte-level encoding helpers for transactions, headers, and addresses.
//!
//! Everything here is a pure function over bytes. Decoders either return a
//! fully populated value or a [`DecodeError`]; they never hand back a
//! partially filled buffer.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from decoding untrusted hex, base58, or key material.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid base58 encoding")]
    Base58,

    #[error("address payload is {0} bytes, expected 25")]
    AddressLength(usize),

    #[error("address checksum mismatch")]
    AddressChecksum,

    #[error("public key is {0} bytes, expected 33 or 65")]
    PubkeyLength(usize),

    #[error("hash is {0} bytes, expected at most 32")]
    HashLength(usize),
}

pub fn pack_u16_le(n: u16) -> [u8; 2] {
    n.to_le_bytes()
}

pub fn pack_u16_be(n: u16) -> [u8; 2] {
    n.to_be_bytes()
}

pub fn pack_u32_le(n: u32) -> [u8; 4] {
    n.to_le_bytes()
}

pub fn pack_u32_be(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

pub fn pack_i32_le(n: i32) -> [u8; 4] {
    n.to_le_bytes()
}

pub fn pack_i32_be(n: i32) -> [u8; 4] {
    n.to_be_bytes()
}

pub fn pack_u64_le(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

pub fn pack_u64_be(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Bitcoin CompactSize encoding.
pub fn var_int(n: u64) -> Vec<u8> {
    if n < 0xfd {
        vec![n as u8]
    } else if n <= 0xffff {
        let mut out = vec![0xfd];
        out.extend_from_slice(&pack_u16_le(n as u16));
        out
    } else if n <= 0xffff_ffff {
        let mut out = vec![0xfe];
        out.extend_from_slice(&pack_u32_le(n as u32));
        out
    } else {
        let mut out = vec![0xff];
        out.extend_from_slice(&pack_u64_le(n));
        out
    }
}

/// Length-prefixed byte string.
pub fn var_string(bytes: &[u8]) -> Vec<u8> {
    let mut out = var_int(bytes.len() as u64);
    out.extend_from_slice(bytes);
    out
}

/// Script number push as used for height and time in the coinbase scriptSig.
///
/// 1 through 16 become the single opcodes `OP_1`..`OP_16`; anything else is
/// a length byte followed by the value in little-endian order.
pub fn serialize_number(n: u64) -> Vec<u8> {
    if (1..=16).contains(&n) {
        return vec![0x50 + n as u8];
    }

    let mut out = vec![1u8];
    let mut n = n;
    while n > 0x7f {
        out.push((n & 0xff) as u8);
        out[0] += 1;
        n >>= 8;
    }
    out.push(n as u8);
    out
}

pub fn reverse_bytes(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// Reverse the order of the eight 4-byte words of a hash, leaving the bytes
/// within each word untouched.
///
/// Stratum presents the previous block hash this way in `mining.notify`.
pub fn reverse_byte_order(hash: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (dst, src) in out.chunks_exact_mut(4).zip(hash.chunks_exact(4).rev()) {
        dst.copy_from_slice(src);
    }
    out
}

/// Decode a hash in display (RPC) hex into internal byte order.
///
/// Short input is zero-extended at the most significant end.
pub fn uint256_from_hash_hex(hash_hex: &str) -> Result<[u8; 32], DecodeError> {
    let bytes = hex::decode(hash_hex)?;
    if bytes.len() > 32 {
        return Err(DecodeError::HashLength(bytes.len()));
    }
    let mut out = [0u8; 32];
    out[..bytes.len()].copy_from_slice(&bytes);
    out.reverse();
    Ok(out)
}

/// Decode hex that must be exactly `N` bytes.
pub fn decode_fixed_hex<const N: usize>(s: &str) -> Result<[u8; N], DecodeError> {
    let mut out = [0u8; N];
    hex::decode_to_slice(s, &mut out)?;
    Ok(out)
}

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

/// Decode and checksum-verify a base58check address.
///
/// Returns the version byte, the 20-byte hash, and the 4-byte checksum.
pub fn decode_address(address: &str) -> Result<[u8; 25], DecodeError> {
    let bytes = bitcoin::base58::decode(address).map_err(|_| DecodeError::Base58)?;
    let payload: [u8; 25] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| DecodeError::AddressLength(bytes.len()))?;

    let checksum = sha256d(&payload[..21]);
    if checksum[..4] != payload[21..] {
        return Err(DecodeError::AddressChecksum);
    }
    Ok(payload)
}

/// Pay-to-pubkey-hash output script for a base58check address.
pub fn address_to_script(address: &str) -> Result<Vec<u8>, DecodeError> {
    let payload = decode_address(address)?;

    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&payload[1..21]);
    script.extend_from_slice(&[0x88, 0xac]);
    Ok(script)
}

/// Pay-to-pubkey output script for a hex-encoded public key.
pub fn pubkey_to_script(pubkey_hex: &str) -> Result<Vec<u8>, DecodeError> {
    let key = hex::decode(pubkey_hex)?;
    if key.len() != 33 && key.len() != 65 {
        return Err(DecodeError::PubkeyLength(key.len()));
    }

    let mut script = Vec::with_capacity(key.len() + 2);
    script.push(key.len() as u8);
    script.extend_from_slice(&key);
    script.push(0xac);
    Ok(script)
}

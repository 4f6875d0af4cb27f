//! Canonical disk serialization for chainstate data.
//!
//! Integers are little-endian fixed width; byte strings and sequences carry
//! a Bitcoin-style compact-size prefix. A chunk written by one node must
//! load bit-for-bit on any other, so nothing here may depend on platform
//! or serializer defaults.

use crate::core::types::{Coin, Hash256, OutPoint};
use anyhow::{bail, Context, Result};
use std::io::{Read, Write};

/// Upper bound on any single length prefix we are willing to decode.
/// A chunk never exceeds 1 MB, so anything larger is corruption.
const MAX_DECODE_LEN: u64 = 8_000_000;

pub fn write_compact_size<W: Write>(writer: &mut W, size: u64) -> Result<()> {
    if size < 253 {
        writer.write_all(&[size as u8])?;
    } else if size <= 0xFFFF {
        writer.write_all(&[253])?;
        writer.write_all(&(size as u16).to_le_bytes())?;
    } else if size <= 0xFFFF_FFFF {
        writer.write_all(&[254])?;
        writer.write_all(&(size as u32).to_le_bytes())?;
    } else {
        writer.write_all(&[255])?;
        writer.write_all(&size.to_le_bytes())?;
    }
    Ok(())
}

pub fn read_compact_size<R: Read>(reader: &mut R) -> Result<u64> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;
    let size = match tag[0] {
        253 => {
            let mut b = [0u8; 2];
            reader.read_exact(&mut b)?;
            u16::from_le_bytes(b) as u64
        }
        254 => {
            let mut b = [0u8; 4];
            reader.read_exact(&mut b)?;
            u32::from_le_bytes(b) as u64
        }
        255 => {
            let mut b = [0u8; 8];
            reader.read_exact(&mut b)?;
            u64::from_le_bytes(b)
        }
        n => n as u64,
    };
    if size > MAX_DECODE_LEN {
        bail!("compact size {} exceeds decode limit", size);
    }
    Ok(size)
}

/// Encoded width of a compact-size prefix for `size`.
pub fn compact_size_len(size: u64) -> usize {
    match size {
        0..=252 => 1,
        253..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

pub fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    reader.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    reader.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

pub fn write_hash<W: Write>(writer: &mut W, hash: &Hash256) -> Result<()> {
    writer.write_all(hash.as_bytes())?;
    Ok(())
}

pub fn read_hash<R: Read>(reader: &mut R) -> Result<Hash256> {
    let mut b = [0u8; 32];
    reader.read_exact(&mut b)?;
    Ok(Hash256(b))
}

pub fn write_outpoint<W: Write>(writer: &mut W, outpoint: &OutPoint) -> Result<()> {
    write_hash(writer, &outpoint.txid)?;
    write_u32(writer, outpoint.vout)
}

pub fn read_outpoint<R: Read>(reader: &mut R) -> Result<OutPoint> {
    let txid = read_hash(reader)?;
    let vout = read_u32(reader)?;
    Ok(OutPoint { txid, vout })
}

pub fn write_coin<W: Write>(writer: &mut W, coin: &Coin) -> Result<()> {
    write_u64(writer, coin.amount)?;
    write_compact_size(writer, coin.script.len() as u64)?;
    writer.write_all(&coin.script)?;
    let code = (coin.height << 1) | (coin.is_coinbase as u32);
    write_u32(writer, code)
}

pub fn read_coin<R: Read>(reader: &mut R) -> Result<Coin> {
    let amount = read_u64(reader)?;
    let script_len = read_compact_size(reader)? as usize;
    let mut script = vec![0u8; script_len];
    reader
        .read_exact(&mut script)
        .context("truncated coin script")?;
    let code = read_u32(reader)?;
    Ok(Coin {
        amount,
        script,
        is_coinbase: code & 1 == 1,
        height: code >> 1,
    })
}

/// Serialized width of one (outpoint, coin) entry.
pub fn coin_entry_len(coin: &Coin) -> usize {
    // outpoint: txid + vout; coin: amount + script prefix + script + code
    32 + 4 + 8 + compact_size_len(coin.script.len() as u64) + coin.script.len() + 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_size_round_trip() {
        for size in [0u64, 1, 252, 253, 0xFFFF, 0x1_0000, 0xFFFF_FFFF] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, size).unwrap();
            assert_eq!(buf.len(), compact_size_len(size));
            let decoded = read_compact_size(&mut buf.as_slice()).unwrap();
            assert_eq!(decoded, size);
        }
    }

    #[test]
    fn compact_size_rejects_oversize() {
        let mut buf = Vec::new();
        write_compact_size(&mut buf, u64::MAX).unwrap();
        assert!(read_compact_size(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn coin_entry_len_matches_encoding() {
        let outpoint = OutPoint::new(Hash256([7u8; 32]), 3);
        let coin = Coin {
            amount: 50_000,
            script: vec![0xAB; 300],
            is_coinbase: true,
            height: 42,
        };
        let mut buf = Vec::new();
        write_outpoint(&mut buf, &outpoint).unwrap();
        write_coin(&mut buf, &coin).unwrap();
        assert_eq!(buf.len(), coin_entry_len(&coin));

        let mut cursor = buf.as_slice();
        assert_eq!(read_outpoint(&mut cursor).unwrap(), outpoint);
        assert_eq!(read_coin(&mut cursor).unwrap(), coin);
    }

    #[test]
    fn coin_code_packs_height_and_coinbase_flag() {
        let coin = Coin {
            amount: 1,
            script: Vec::new(),
            is_coinbase: false,
            height: 123_456,
        };
        let mut buf = Vec::new();
        write_coin(&mut buf, &coin).unwrap();
        let decoded = read_coin(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.height, 123_456);
        assert!(!decoded.is_coinbase);
    }
}

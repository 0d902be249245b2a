//! Utilities used in this crate.
//!
//! This is not part of the public interface of the crate.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::host::Memory;
use crate::{Error, Result};

/// Read a `u64` at `kaddr`, honoring target endianness.
pub fn read_u64(mem: &dyn Memory, kaddr: u64, big_endian: bool) -> Result<u64> {
    let mut buf = [0u8; 8];
    if !mem.read_mem(kaddr, &mut buf) {
        return Err(Error::ReadFailure(format!("u64 at {:#x}", kaddr)));
    }
    Ok(if big_endian {
        BigEndian::read_u64(&buf)
    } else {
        LittleEndian::read_u64(&buf)
    })
}

/// Read a `u32` at `kaddr`, honoring target endianness.
pub fn read_u32(mem: &dyn Memory, kaddr: u64, big_endian: bool) -> Result<u32> {
    let mut buf = [0u8; 4];
    if !mem.read_mem(kaddr, &mut buf) {
        return Err(Error::ReadFailure(format!("u32 at {:#x}", kaddr)));
    }
    Ok(if big_endian {
        BigEndian::read_u32(&buf)
    } else {
        LittleEndian::read_u32(&buf)
    })
}

/// Read a `u8` at `kaddr`.
pub fn read_u8(mem: &dyn Memory, kaddr: u64) -> Result<u8> {
    let mut buf = [0u8; 1];
    if !mem.read_mem(kaddr, &mut buf) {
        return Err(Error::ReadFailure(format!("u8 at {:#x}", kaddr)));
    }
    Ok(buf[0])
}

/// Read a "long"-sized unsigned integer (4 or 8 bytes depending on the
/// target), honoring endianness, widened to `u64`.
pub fn read_long(mem: &dyn Memory, kaddr: u64, long_size: u8, big_endian: bool) -> Result<u64> {
    if long_size == 4 {
        read_u32(mem, kaddr, big_endian).map(u64::from)
    } else {
        read_u64(mem, kaddr, big_endian)
    }
}

/// Print a hexdump of a buffer, for debug logging of raw ring-buffer pages.
#[allow(dead_code)]
pub fn hexdump(buf: &[u8]) -> String {
    let step = 32;
    let lines: Vec<String> = (0..buf.len())
        .step_by(step)
        .map(|i| {
            let bytes: Vec<String> = (i..std::cmp::min(buf.len(), i + step))
                .map(|x| format!("{:02X}", buf[x]))
                .collect();
            format!("{:04x}\t\t{}", i, bytes.join(" "))
        })
        .collect();
    lines.join("\n")
}

/// Escape a string the way the bprintk format table does: `\n`, `\t`, `\\`
/// and `"` are backslash-escaped, everything else is copied verbatim.
pub fn escape_c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_c_string`]. Used by tests to assert the escaping
/// round-trips.
#[allow(dead_code)]
pub fn unescape_c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

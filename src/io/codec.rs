//! Scalar encoding over buffered files.
//!
//! Fixed-width integers (1–8 bytes, little-endian), VInt/VLong variable
//! length integers (7-bit groups, low group first, 0x80 continuation bit)
//! and length-prefixed byte strings. Decoding is total for well-formed
//! streams; a truncated stream surfaces as the buffer layer's I/O error.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{CallunaError, Result};
use crate::io::buffer::BufFile;

impl BufFile {
    /// Write an unsigned integer using `width` bytes (1..=8), little-endian.
    pub fn write_uint(&mut self, value: u64, width: usize) -> Result<()> {
        debug_assert!((1..=8).contains(&width));
        if width < 8 && value >> (width * 8) != 0 {
            return Err(CallunaError::invalid_argument(format!(
                "value {value} does not fit in {width} bytes"
            )));
        }
        let mut bytes = [0u8; 8];
        LittleEndian::write_uint(&mut bytes[..width], value, width);
        self.write_all(&bytes[..width])
    }

    /// Read an unsigned integer of `width` bytes (1..=8), little-endian.
    pub fn read_uint(&mut self, width: usize) -> Result<u64> {
        debug_assert!((1..=8).contains(&width));
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes[..width])?;
        Ok(LittleEndian::read_uint(&bytes[..width], width))
    }

    /// Write a variable-length u64: 7 data bits per byte, low group first,
    /// high bit set on every byte but the last.
    pub fn write_vlong(&mut self, mut value: u64) -> Result<()> {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                self.write_all(&[byte | 0x80])?;
            } else {
                self.write_all(&[byte])?;
                return Ok(());
            }
        }
    }

    /// Read a variable-length u64.
    pub fn read_vlong(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            if shift >= 64 {
                return Err(CallunaError::io("VLong overflow"));
            }
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Write a variable-length u32.
    pub fn write_vint(&mut self, value: u32) -> Result<()> {
        self.write_vlong(u64::from(value))
    }

    /// Read a variable-length u32.
    pub fn read_vint(&mut self) -> Result<u32> {
        let value = self.read_vlong()?;
        u32::try_from(value).map_err(|_| CallunaError::io("VInt overflow"))
    }

    /// Write a VInt length prefix followed by the raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_vint(bytes.len() as u32)?;
        self.write_all(bytes)
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_vint()? as usize;
        let mut out = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| CallunaError::memory("byte string allocation"))?;
        out.resize(len, 0);
        self.read_exact(&mut out)?;
        Ok(out)
    }
}

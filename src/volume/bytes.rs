//! Byte Extraction
//!
//! Bounds-checked reads of fixed-width integers from raw record buffers.
//! Every volume carries one [`ByteOrder`], detected from the magic number at
//! the head of record 1 before anything else is read.

use super::error::{Result, VolumeError};

/// First 16-bit field of the product header
pub const MAGIC: i16 = 27;

/// Byte order of the integers in a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Native order of files written by the instrument
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    /// The opposite order
    pub fn swapped(self) -> Self {
        match self {
            Self::Little => Self::Big,
            Self::Big => Self::Little,
        }
    }

    /// Probe the magic number at the start of record 1.
    ///
    /// The little endian reading is tried first. If it is not 27 the order is
    /// toggled and the field read again; a second miss rejects the input.
    pub fn detect(record: &[u8]) -> Result<Self> {
        let order = Self::default();
        let found = Cursor::new(record, order).i16_at(0)?;
        if found == MAGIC {
            return Ok(order);
        }
        let order = order.swapped();
        if Cursor::new(record, order).i16_at(0)? == MAGIC {
            Ok(order)
        } else {
            Err(VolumeError::BadMagicNumber { found })
        }
    }

    pub fn u16_from(self, b: [u8; 2]) -> u16 {
        match self {
            Self::Little => u16::from_le_bytes(b),
            Self::Big => u16::from_be_bytes(b),
        }
    }

    pub fn u32_from(self, b: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(b),
            Self::Big => u32::from_be_bytes(b),
        }
    }

    pub fn u16_to(self, v: u16) -> [u8; 2] {
        match self {
            Self::Little => v.to_le_bytes(),
            Self::Big => v.to_be_bytes(),
        }
    }
}

/// Read-only cursor over a byte buffer.
///
/// Reads are relative to the cursor's base offset and fail with
/// [`VolumeError::Overrun`] instead of reading past the buffer.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    base: usize,
    order: ByteOrder,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self {
            buf,
            base: 0,
            order,
        }
    }

    /// A cursor whose reads are relative to `base`
    pub fn sub(&self, offset: usize) -> Self {
        Self {
            buf: self.buf,
            base: self.base + offset,
            order: self.order,
        }
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.buf.get(offset..end))
            .ok_or(VolumeError::Overrun {
                offset,
                len,
                size: self.buf.len(),
            })
    }

    fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(offset, N)?);
        Ok(out)
    }

    pub fn u8_at(&self, offset: usize) -> Result<u8> {
        Ok(self.array::<1>(self.base + offset)?[0])
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        Ok(self.order.u16_from(self.array(self.base + offset)?))
    }

    pub fn i16_at(&self, offset: usize) -> Result<i16> {
        Ok(self.u16_at(offset)? as i16)
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        Ok(self.order.u32_from(self.array(self.base + offset)?))
    }

    pub fn i32_at(&self, offset: usize) -> Result<i32> {
        Ok(self.u32_at(offset)? as i32)
    }

    /// Fixed-width character field: cut at the first NUL, right-trimmed
    pub fn text_at(&self, offset: usize, len: usize) -> Result<String> {
        let raw = self.slice(self.base + offset, len)?;
        let raw = raw.split(|&b| b == 0).next().unwrap_or_default();
        Ok(String::from_utf8_lossy(raw).trim_end().to_string())
    }
}

/// Binary angle (16 bit) to radians
pub fn bin2_to_rad(a: u16) -> f64 {
    f64::from(a) * std::f64::consts::TAU / 65536.0
}

/// Binary angle (32 bit) to radians
pub fn bin4_to_rad(a: u32) -> f64 {
    f64::from(a) * std::f64::consts::TAU / 4_294_967_296.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_little_endian_magic() {
        let rec = [27u8, 0, 0, 0];
        assert_eq!(ByteOrder::detect(&rec).unwrap(), ByteOrder::Little);
    }

    #[test]
    fn detects_big_endian_magic() {
        let rec = [0u8, 27, 0, 0];
        assert_eq!(ByteOrder::detect(&rec).unwrap(), ByteOrder::Big);
    }

    #[test]
    fn rejects_bad_magic() {
        let rec = [1u8, 2, 3, 4];
        match ByteOrder::detect(&rec) {
            Err(VolumeError::BadMagicNumber { found }) => assert_eq!(found, 0x0201),
            other => panic!("expected bad magic, got {:?}", other),
        }
    }

    #[test]
    fn positional_reads_honor_order_and_base() {
        let buf = [0u8, 0, 0x01, 0x02, 0x03, 0x04];
        let le = Cursor::new(&buf, ByteOrder::Little).sub(2);
        assert_eq!(le.u16_at(0).unwrap(), 0x0201);
        assert_eq!(le.u32_at(0).unwrap(), 0x0403_0201);

        let be = Cursor::new(&buf, ByteOrder::Big).sub(2);
        assert_eq!(be.u16_at(0).unwrap(), 0x0102);
        assert_eq!(be.i32_at(0).unwrap(), 0x0102_0304);
    }

    #[test]
    fn reads_past_end_are_rejected() {
        let buf = [0u8; 3];
        let c = Cursor::new(&buf, ByteOrder::Little);
        assert!(matches!(c.u32_at(0), Err(VolumeError::Overrun { .. })));
        assert!(matches!(c.u16_at(usize::MAX), Err(VolumeError::Overrun { .. })));
    }

    #[test]
    fn text_fields_are_trimmed_and_cut_at_nul() {
        let buf = b"KTLX    \0junk";
        let c = Cursor::new(buf, ByteOrder::Little);
        assert_eq!(c.text_at(0, buf.len()).unwrap(), "KTLX");
        assert_eq!(c.text_at(0, 2).unwrap(), "KT");
    }

    #[test]
    fn binary_angles() {
        assert_eq!(bin2_to_rad(0), 0.0);
        assert!((bin2_to_rad(16384) - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert!((bin4_to_rad(1 << 31) - std::f64::consts::PI).abs() < 1e-12);
    }
}

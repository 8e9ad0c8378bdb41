//! Record encoding: the writer fields serialize into and the reader trace consumers use.

use crate::{DecodeError, WORD_SIZE};

/// Byte order of integers in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Native,
    Little,
    Big,
}

impl ByteOrder {
    /// Whether integers are stored in the opposite order of the host.
    pub fn is_reversed(self) -> bool {
        match self {
            ByteOrder::Native => false,
            ByteOrder::Little => cfg!(target_endian = "big"),
            ByteOrder::Big => cfg!(target_endian = "little"),
        }
    }
}

/// Padding needed to bring `offset` up to a multiple of `align`, a power of two.
pub const fn align_padding(offset: usize, align: usize) -> usize {
    offset.wrapping_neg() & (align - 1)
}

macro_rules! encode {
    ($order:expr, $v:expr) => {
        match $order {
            ByteOrder::Native => $v.to_ne_bytes(),
            ByteOrder::Little => $v.to_le_bytes(),
            ByteOrder::Big => $v.to_be_bytes(),
        }
    };
}

/// Destination of the bytes of one event record, space for which was reserved beforehand.
pub trait RecordWriter {
    /// Offset of the next byte within the record.
    fn offset(&self) -> usize;

    fn byte_order(&self) -> ByteOrder;

    fn write(&mut self, bytes: &[u8]);

    /// Zero-pads up to a multiple of `align`.
    fn align(&mut self, align: usize) {
        const ZEROES: [u8; 16] = [0; 16];
        let mut pad = align_padding(self.offset(), align);
        while pad > 0 {
            let n = pad.min(ZEROES.len());
            self.write(&ZEROES[..n]);
            pad -= n;
        }
    }

    fn write_u32(&mut self, v: u32) {
        let bytes = encode!(self.byte_order(), v);
        self.write(&bytes);
    }

    fn write_word(&mut self, v: usize) {
        let bytes = encode!(self.byte_order(), v);
        self.write(&bytes);
    }
}

/// Record writer backed by a byte vector.
///
/// Reserve the size reported by the context table before recording and no allocation happens
/// while the fields write.
#[derive(Debug, Clone, Default)]
pub struct RecordBuffer {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl RecordBuffer {
    pub fn new(order: ByteOrder) -> Self {
        Self { buf: Vec::new(), order }
    }

    pub fn with_capacity(order: ByteOrder, capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity), order }
    }

    /// Makes room for `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl RecordWriter for RecordBuffer {
    fn offset(&self) -> usize {
        self.buf.len()
    }

    fn byte_order(&self) -> ByteOrder {
        self.order
    }

    fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Reads back records produced by a [`RecordWriter`].
#[derive(Debug, Clone)]
pub struct RecordReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    order: ByteOrder,
}

macro_rules! decode {
    ($ty:ty, $order:expr, $bytes:expr) => {
        match $order {
            ByteOrder::Native => <$ty>::from_ne_bytes($bytes),
            ByteOrder::Little => <$ty>::from_le_bytes($bytes),
            ByteOrder::Big => <$ty>::from_be_bytes($bytes),
        }
    };
}

impl<'a> RecordReader<'a> {
    pub fn new(bytes: &'a [u8], order: ByteOrder) -> Self {
        Self { bytes, offset: 0, order }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, need: usize) -> Result<&'a [u8], DecodeError> {
        let have = self.remaining();
        if need > have {
            return Err(DecodeError::Truncated { offset: self.offset, need, have });
        }
        let bytes = &self.bytes[self.offset..self.offset + need];
        self.offset += need;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn align(&mut self, align: usize) -> Result<(), DecodeError> {
        self.take(align_padding(self.offset, align)).map(drop)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take_array::<4>()?;
        Ok(decode!(u32, self.order, bytes))
    }

    pub fn read_word(&mut self) -> Result<usize, DecodeError> {
        let bytes = self.take_array::<WORD_SIZE>()?;
        Ok(decode!(usize, self.order, bytes))
    }

    /// Reads one callstack context: its aligned length followed by the aligned addresses.
    pub fn read_callstack(&mut self) -> Result<Vec<usize>, DecodeError> {
        self.align(4)?;
        let len = self.read_u32()? as usize;
        self.align(WORD_SIZE)?;
        // Check the whole sequence is there before sizing the vector from untrusted input.
        let need = len.saturating_mul(WORD_SIZE);
        if need > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                need,
                have: self.remaining(),
            });
        }
        (0..len).map(|_| self.read_word()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding() {
        assert_eq!(align_padding(0, 8), 0);
        assert_eq!(align_padding(4, 8), 4);
        assert_eq!(align_padding(9, 8), 7);
        assert_eq!(align_padding(3, 4), 1);
        assert_eq!(align_padding(5, 1), 0);
    }

    #[test]
    fn writer_byte_order() {
        let mut le = RecordBuffer::new(ByteOrder::Little);
        le.write_u32(0x0102_0304);
        assert_eq!(le.as_bytes(), [4, 3, 2, 1]);

        let mut be = RecordBuffer::new(ByteOrder::Big);
        be.write_u32(0x0102_0304);
        assert_eq!(be.as_bytes(), [1, 2, 3, 4]);

        let mut native = RecordBuffer::new(ByteOrder::Native);
        native.write_word(0x1000);
        assert_eq!(native.as_bytes(), 0x1000usize.to_ne_bytes());
    }

    #[test]
    fn writer_pads_with_zeroes() {
        let mut buf = RecordBuffer::new(ByteOrder::Little);
        buf.write(&[0xff]);
        buf.align(8);
        assert_eq!(buf.as_bytes(), [0xff, 0, 0, 0, 0, 0, 0, 0]);
        buf.align(8);
        assert_eq!(buf.offset(), 8);
    }

    #[test]
    fn reader_rejects_short_sequence() {
        let mut buf = RecordBuffer::new(ByteOrder::Big);
        buf.write_u32(3);
        buf.align(WORD_SIZE);
        buf.write_word(0x1000);

        let err = RecordReader::new(buf.as_bytes(), ByteOrder::Big).read_callstack().unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { need, .. } if need == 3 * WORD_SIZE));
    }

    #[test]
    fn reversed() {
        assert!(!ByteOrder::Native.is_reversed());
        assert_ne!(ByteOrder::Little.is_reversed(), ByteOrder::Big.is_reversed());
    }
}

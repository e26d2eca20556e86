//! Bit-level field extraction.
//!
//! Telemetry payloads pack fields at arbitrary bit widths with no byte
//! alignment, most-significant bit first. [`BitCursor`] walks such a buffer
//! and hands out unsigned or two's-complement signed fields of 1 to 64 bits.

/// A bit-field read ran past the end of the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("bit read out of bounds: {count} bits at bit {position}, buffer has {buffer_bits} bits")]
pub struct BufferExhausted {
    pub position: usize,
    pub count: u32,
    pub buffer_bits: usize,
}

/// Cursor over a byte buffer yielding MSB-first bit fields across byte
/// boundaries.
#[derive(Clone, Debug)]
pub struct BitCursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Number of bits consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of bits left in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len() * 8 - self.position
    }

    /// Reads the next `count` bits (1 to 64) as an unsigned integer and
    /// advances the cursor.
    pub fn read_unsigned(&mut self, count: u32) -> Result<u64, BufferExhausted> {
        debug_assert!((1..=64).contains(&count));

        if self.remaining() < count as usize {
            return Err(BufferExhausted {
                position: self.position,
                count,
                buffer_bits: self.data.len() * 8,
            });
        }

        let mut value = 0;
        for _ in 0..count {
            let byte = self.data[self.position / 8];
            let bit = (byte >> (7 - self.position % 8)) & 1;
            value = (value << 1) | u64::from(bit);
            self.position += 1;
        }

        Ok(value)
    }

    /// Reads the next `count` bits and reinterprets them as a
    /// two's-complement signed integer of that width.
    pub fn read_signed(&mut self, count: u32) -> Result<i64, BufferExhausted> {
        let value = self.read_unsigned(count)?;

        if count < 64 && value >> (count - 1) & 1 != 0 {
            // sign-extend
            Ok((value | !((1 << count) - 1)) as i64)
        }
        else {
            Ok(value as i64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BitCursor;

    #[test]
    fn reads_msb_first_across_byte_boundaries() {
        let mut cursor = BitCursor::new(&[0b1010_1100, 0b0101_0011]);

        assert_eq!(cursor.read_unsigned(4).unwrap(), 0b1010);
        assert_eq!(cursor.read_unsigned(8).unwrap(), 0b1100_0101);
        assert_eq!(cursor.read_unsigned(4).unwrap(), 0b0011);
        assert_eq!(cursor.position(), 16);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn reads_single_bits() {
        let mut cursor = BitCursor::new(&[0b1000_0001]);

        assert_eq!(cursor.read_unsigned(1).unwrap(), 1);
        for _ in 0..6 {
            assert_eq!(cursor.read_unsigned(1).unwrap(), 0);
        }
        assert_eq!(cursor.read_unsigned(1).unwrap(), 1);
    }

    #[test]
    fn reads_wide_fields() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0xff];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(cursor.read_unsigned(64).unwrap(), 0x123456789abcdef0);
        assert_eq!(cursor.read_unsigned(8).unwrap(), 0xff);
    }

    #[test]
    fn sign_extends_negative_values() {
        // 5-bit fields: 10000 = -16, 11111 = -1, 01111 = 15
        let mut cursor = BitCursor::new(&[0b10000_111, 0b11_01111_0]);

        assert_eq!(cursor.read_signed(5).unwrap(), -16);
        assert_eq!(cursor.read_signed(5).unwrap(), -1);
        assert_eq!(cursor.read_signed(5).unwrap(), 15);
    }

    #[test]
    fn fails_when_the_buffer_is_exhausted() {
        let mut cursor = BitCursor::new(&[0xff, 0xff]);

        assert_eq!(cursor.read_unsigned(12).unwrap(), 0xfff);
        let error = cursor.read_unsigned(5).unwrap_err();
        assert_eq!(error.position, 12);
        assert_eq!(error.count, 5);
        assert_eq!(error.buffer_bits, 16);

        // a failed read doesn't advance the cursor
        assert_eq!(cursor.position(), 12);
        assert_eq!(cursor.read_unsigned(4).unwrap(), 0xf);
    }
}

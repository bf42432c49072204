//! Canonical little-endian helpers shared by the wire codecs.
//!
//! Readers return `None` when the slice is shorter than the field; they never
//! panic on short input.

#[inline]
pub fn append_u16_le(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn append_u64_le(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn read_u16_le(data: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = data.get(..2)?.try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

#[inline]
pub fn read_u64_le(data: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_then_read() {
        let mut buf = Vec::new();
        append_u64_le(&mut buf, 0x0102_0304_0506_0708);
        append_u16_le(&mut buf, 0xBEEF);
        assert_eq!(buf[0], 0x08);
        assert_eq!(read_u64_le(&buf), Some(0x0102_0304_0506_0708));
        assert_eq!(read_u16_le(&buf[8..]), Some(0xBEEF));
    }

    #[test]
    fn test_short_input() {
        assert_eq!(read_u64_le(&[1, 2, 3]), None);
        assert_eq!(read_u16_le(&[1]), None);
        assert_eq!(read_u16_le(&[]), None);
    }
}

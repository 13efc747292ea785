//! Wire protocol for the C64 Ultimate data and control streams
//!
//! Video and audio arrive as fixed-size little-endian UDP datagrams;
//! control commands are short binary messages sent over TCP.

pub mod control;
pub mod packet;

pub use control::{ControlCommand, StreamId};
pub use packet::{AudioPacket, VideoHeader, VideoPacket};

/// Read a little-endian u16 at `offset`
#[inline]
pub(crate) fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Signed distance from `from` to `to` in modulo-2^16 arithmetic
///
/// Positive when `to` is ahead of `from`.
#[inline]
pub fn seq_diff(to: u16, from: u16) -> i16 {
    to.wrapping_sub(from) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_diff_wraps() {
        assert_eq!(seq_diff(5, 3), 2);
        assert_eq!(seq_diff(3, 5), -2);
        assert_eq!(seq_diff(0, u16::MAX), 1);
        assert_eq!(seq_diff(u16::MAX, 0), -1);
        assert_eq!(seq_diff(10, 65530), 16);
    }

    #[test]
    fn test_read_u16_le() {
        assert_eq!(read_u16_le(&[0x34, 0x12, 0xFF], 0), 0x1234);
        assert_eq!(read_u16_le(&[0x00, 0xCD, 0xAB], 1), 0xABCD);
    }
}

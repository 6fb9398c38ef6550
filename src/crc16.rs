//! CRC-16-ANSI (poly 0x8005, initial value 0, no final XOR), bit-reversed
//! output, matching the value stored in flash records and modem frames
//! (spec.md section 4.2).
//!
//! Ported from `original_source`'s `gen_crc16()`; the watchdog-tickle
//! requirement for firmware-sized buffers is satisfied by the caller
//! feeding the watchdog between chunks (see `fw_upgrade.rs`), not inside
//! this function, since watchdog access is an excluded MCU HAL concern.

const POLY: u16 = 0xA001; // bit-reversed 0x8005

/// CRC-16-ANSI over a single buffer.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(0, data)
}

/// CRC-16-ANSI over two buffers back to back, without concatenating them.
/// `crc16_2buf(a, b) == crc16([a, b].concat())`.
pub fn crc16_2buf(a: &[u8], b: &[u8]) -> u16 {
    crc16_update(crc16_update(0, a), b)
}

/// Folds `data` into a running CRC started from `seed` (seed 0 for a
/// fresh computation), for callers that read a large region back in
/// fixed-size chunks rather than holding it all in memory at once (see
/// `fw_upgrade.rs`'s post-write verification).
pub(crate) fn crc16_update(seed: u16, data: &[u8]) -> u16 {
    let mut crc = seed;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_is_zero() {
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn two_buf_matches_concatenated() {
        let a = [0x01, 0x02, 0x03];
        let b = [0x04, 0x05, 0x06, 0x07];
        let mut concat = heapless::Vec::<u8, 16>::new();
        concat.extend_from_slice(&a).unwrap();
        concat.extend_from_slice(&b).unwrap();
        assert_eq!(crc16_2buf(&a, &b), crc16(&concat));
    }

    #[test]
    fn known_vector() {
        // CRC-16/ARC of ASCII "123456789" is 0xBB3D (standard check value).
        assert_eq!(crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn single_byte_changes_are_detected() {
        let a = crc16(&[0x00, 0x01, 0x02]);
        let b = crc16(&[0x00, 0x01, 0x03]);
        assert_ne!(a, b);
    }
}

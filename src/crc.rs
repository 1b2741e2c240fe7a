//! CRC16-CCITT (poly 0x1021, init 0x0000), as used to frame every
//! ACK-prefixed response from the console.

use crc::{Crc, CRC_16_XMODEM};

/// `CRC_16_XMODEM` is poly 0x1021, init 0x0000, no refin/refout, no xorout —
/// bit-identical to the CCITT-0 variant the console uses. Confirmed by the
/// check value for `"123456789"`: 0x31C3.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Compute the CRC16-CCITT of `buf`.
pub fn compute(buf: &[u8]) -> u16 {
    CRC16.checksum(buf)
}

/// Verify that `buf` checksums to `expected`.
pub fn verify(buf: &[u8], expected: u16) -> bool {
    compute(buf) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_payload_checksums_to_zero() {
        assert_eq!(compute(&[0x00, 0x00, 0x00, 0x00]), 0x0000);
    }

    #[test]
    fn ascii_check_value() {
        assert_eq!(compute(b"123456789"), 0x31C3);
    }

    #[test]
    fn verify_round_trips() {
        let payload = b"the quick brown fox";
        let crc = compute(payload);
        assert!(verify(payload, crc));
    }

    #[test]
    fn verify_rejects_flipped_bit() {
        let mut payload = b"the quick brown fox".to_vec();
        let crc = compute(&payload);
        payload[3] ^= 0x01;
        assert!(!verify(&payload, crc));
    }

    #[test]
    fn verify_rejects_flipped_crc() {
        let payload = b"the quick brown fox";
        let crc = compute(payload) ^ 0x0001;
        assert!(!verify(payload, crc));
    }

    #[test]
    fn idempotent() {
        let payload = b"repeat me";
        assert_eq!(compute(payload), compute(payload));
    }

    proptest::proptest! {
        #[test]
        fn round_trips_over_arbitrary_payloads(payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let crc = compute(&payload);
            proptest::prop_assert!(verify(&payload, crc));
        }

        #[test]
        fn flipping_a_payload_bit_breaks_verification(
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..256),
            bit in 0u32..8,
        ) {
            let crc = compute(&payload);
            let mut flipped = payload.clone();
            let idx = flipped.len() - 1;
            flipped[idx] ^= 1 << bit;
            proptest::prop_assert!(!verify(&flipped, crc));
        }
    }
}

//! Checksum algorithms used by the transfer wire format

/// Simple 8-bit sum, modulo 256
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// CRC-16/XMODEM
/// Polynomial: 0x1021, Init: 0x0000, RefIn: false, RefOut: false
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;

    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum8() {
        assert_eq!(sum8(&[0x01, 0x02, 0x03]), 0x06);
        assert_eq!(sum8(&[0xFF, 0x01]), 0x00);
        assert_eq!(sum8(&[]), 0x00);
    }

    #[test]
    fn test_crc16_xmodem() {
        // Test vector: "123456789" should give 0x31C3
        let data = b"123456789";
        assert_eq!(crc16_xmodem(data), 0x31C3);
    }

    #[test]
    fn test_crc16_xmodem_padded_block() {
        // "123456789" padded with 0x1A to a full 128-byte block, computed
        // against an independent bit-by-bit reference
        let mut block = b"123456789".to_vec();
        block.resize(128, 0x1A);

        let mut reference: u16 = 0;
        for &byte in &block {
            for bit in (0..8).rev() {
                let input = (byte >> bit) & 1;
                let msb = (reference >> 15) as u8;
                reference <<= 1;
                if input ^ msb != 0 {
                    reference ^= 0x1021;
                }
            }
        }

        assert_eq!(crc16_xmodem(&block), reference);
    }
}

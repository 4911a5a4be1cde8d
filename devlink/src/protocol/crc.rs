//! CRC-8 used by the binary frame trailer.
//!
//! Polynomial 0x07 (x^8 + x^2 + x + 1), MSB first, no reflection, no final
//! XOR. Frames seed the register with [`CRC8_SEED`] instead of zero.

/// CRC-8 generator polynomial.
pub const CRC8_POLY: u8 = 0x07;

/// Initial register value for frame checksums.
pub const CRC8_SEED: u8 = 0x34;

/// Calculate the frame checksum of `data`.
pub fn crc8(data: &[u8]) -> u8 {
    crc8_update(CRC8_SEED, data)
}

/// Continue a CRC-8 computation from `crc` over `data`.
pub fn crc8_update(mut crc: u8, data: &[u8]) -> u8 {
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

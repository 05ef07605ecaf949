//! Integrity: CRC-16/MODBUS over packet payloads, verify on receive.

/// CRC-16/MODBUS initial register value.
pub const CRC16_INIT: u16 = 0xFFFF;

/// CRC-16/MODBUS reflected polynomial (0x8005 bit-reversed).
pub const CRC16_POLY: u16 = 0xA001;

/// Compute CRC-16/MODBUS over `data`. LSB-first, no final xor.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC16_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Verify a payload against the checksum carried in its header.
pub fn verify_payload(payload: &[u8], expected: u16) -> bool {
    crc16_modbus(payload) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modbus_check_value() {
        // Published check value for CRC-16/MODBUS.
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
    }

    #[test]
    fn empty_input_is_init() {
        assert_eq!(crc16_modbus(&[]), CRC16_INIT);
    }

    #[test]
    fn known_frame_vector() {
        // Modbus RTU "read holding registers" request: 01 03 00 00 00 0A -> C5 CD (wire order).
        let crc = crc16_modbus(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(crc.to_le_bytes(), [0xC5, 0xCD]);
    }

    #[test]
    fn verify_rejects_tampered() {
        let payload = b"hello chunk";
        let crc = crc16_modbus(payload);
        assert!(verify_payload(payload, crc));
        assert!(!verify_payload(b"hellp chunk", crc));
    }

    #[test]
    fn deterministic() {
        let data: Vec<u8> = (0..=255u8).collect();
        assert_eq!(crc16_modbus(&data), crc16_modbus(&data));
    }
}

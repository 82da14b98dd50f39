use crate::utils::error::ModbusError;

/// Modbus CRC16: init 0xFFFF, reflected polynomial 0xA001, LSB first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    let poly: u16 = 0xA001;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Appends the CRC of `frame` little-endian, as it travels on the wire.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Checks the trailing two bytes of `frame` against the CRC of the rest.
pub fn verify_crc(frame: &[u8]) -> Result<(), ModbusError> {
    if frame.len() < 3 {
        return Err(ModbusError::MalformedResponse(format!(
            "frame of {} bytes cannot carry a CRC",
            frame.len()
        )));
    }
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let expected = crc16(&frame[..data_len]);

    if received != expected {
        return Err(ModbusError::CrcMismatch { expected, received });
    }
    Ok(())
}

//! Modbus RTU frame construction and response parsing.
//!
//! Every parser in here is total: malformed input yields a typed
//! [`ModbusError`], never a panic and never a value taken from a frame whose
//! CRC did not check out.

use log::debug;

use super::crc::{append_crc, verify_crc};
use super::protocol::{RegisterTable, EXCEPTION_FLAG, FN_WRITE_SINGLE_REGISTER};
use crate::utils::error::ModbusError;

/// unit + function + exception code + CRC
const EXCEPTION_FRAME_LEN: usize = 5;
/// unit + function + address + value + CRC
const WRITE_FRAME_LEN: usize = 8;
/// unit + function + byte count + one register + CRC
const SINGLE_READ_FRAME_LEN: usize = 7;

pub fn build_read_frame(unit: u8, table: RegisterTable, address: u16, quantity: u16) -> Vec<u8> {
    let mut frame = vec![unit, table.function_code()];
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    append_crc(&mut frame);
    frame
}

pub fn build_write_frame(unit: u8, address: u16, value: u16) -> Vec<u8> {
    let mut frame = vec![unit, FN_WRITE_SINGLE_REGISTER];
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Device-side read reply. Used by simulators and tests.
pub fn build_read_response(unit: u8, function: u8, registers: &[u16]) -> Vec<u8> {
    let mut frame = vec![unit, function, (registers.len() * 2) as u8];
    for register in registers {
        frame.extend_from_slice(&register.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

/// Device-side exception reply. Used by simulators and tests.
pub fn build_exception_response(unit: u8, function: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![unit, function | EXCEPTION_FLAG, code];
    append_crc(&mut frame);
    frame
}

/// Strict parse of a one-register read reply that must start at offset 0.
pub fn parse_single_read_response(resp: &[u8], unit: u8, function: u8) -> Result<u16, ModbusError> {
    if resp.len() < EXCEPTION_FRAME_LEN {
        return Err(ModbusError::MalformedResponse(format!(
            "response too short: {} bytes",
            resp.len()
        )));
    }
    if resp[0] != unit {
        return Err(ModbusError::MalformedResponse(format!(
            "unit id mismatch: expected {}, received {}",
            unit, resp[0]
        )));
    }
    if resp[1] == function | EXCEPTION_FLAG {
        return Err(exception_at(resp, function));
    }
    if resp[1] != function {
        return Err(ModbusError::MalformedResponse(format!(
            "unexpected function code: expected {:#04x}, received {:#04x}",
            function, resp[1]
        )));
    }
    if resp.len() < SINGLE_READ_FRAME_LEN {
        return Err(ModbusError::MalformedResponse(format!(
            "response too short for one register: {} bytes",
            resp.len()
        )));
    }
    if resp[2] != 2 {
        return Err(ModbusError::MalformedResponse(format!(
            "byte count {} for a single register read",
            resp[2]
        )));
    }

    verify_crc(&resp[..SINGLE_READ_FRAME_LEN])?;
    Ok(u16::from_be_bytes([resp[3], resp[4]]))
}

/// Parses a multi-register read reply that may be preceded by stale bytes.
pub fn parse_multi_read_response(resp: &[u8], unit: u8, function: u8) -> Result<Vec<u16>, ModbusError> {
    locate(resp, unit, function, |frame| read_payload_at(frame, function))
}

/// Parses the echo of a write-single-register request.
pub fn parse_write_response(resp: &[u8], unit: u8, address: u16, value: u16) -> Result<(), ModbusError> {
    locate(resp, unit, FN_WRITE_SINGLE_REGISTER, |frame| {
        if frame[1] == FN_WRITE_SINGLE_REGISTER | EXCEPTION_FLAG {
            return Err(exception_at(frame, FN_WRITE_SINGLE_REGISTER));
        }
        if frame.len() < WRITE_FRAME_LEN {
            return Err(ModbusError::Truncated {
                declared: WRITE_FRAME_LEN,
                available: frame.len(),
            });
        }
        verify_crc(&frame[..WRITE_FRAME_LEN])?;

        let echoed_address = u16::from_be_bytes([frame[2], frame[3]]);
        let echoed_value = u16::from_be_bytes([frame[4], frame[5]]);
        if echoed_address != address || echoed_value != value {
            return Err(ModbusError::MalformedResponse(format!(
                "write echo mismatch: sent [{}]={:#06x}, echoed [{}]={:#06x}",
                address, value, echoed_address, echoed_value
            )));
        }
        Ok(())
    })
}

/// Offsets where a reply for `function` (or its exception form) could start.
pub fn frame_candidates(data: &[u8], unit: u8, function: u8) -> Vec<usize> {
    data.windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[0] == unit && (pair[1] == function || pair[1] == function | EXCEPTION_FLAG))
        .map(|(index, _)| index)
        .collect()
}

/// True once `data` holds a complete reply frame with a valid CRC. A
/// candidate that has its declared length but fails the CRC is garbage, and
/// the receive keeps waiting for the real frame.
pub fn response_complete(data: &[u8], unit: u8, function: u8) -> bool {
    frame_candidates(data, unit, function).into_iter().any(|start| {
        let frame = &data[start..];
        match expected_frame_len(frame, function) {
            Some(needed) => frame.len() >= needed && verify_crc(&frame[..needed]).is_ok(),
            None => false,
        }
    })
}

fn expected_frame_len(frame: &[u8], function: u8) -> Option<usize> {
    if frame[1] & EXCEPTION_FLAG != 0 {
        return Some(EXCEPTION_FRAME_LEN);
    }
    if function == FN_WRITE_SINGLE_REGISTER {
        return Some(WRITE_FRAME_LEN);
    }
    frame.get(2).map(|&byte_count| 3 + byte_count as usize + 2)
}

/// Tries every candidate start; the first fully valid frame wins.
///
/// A CRC-valid exception is authoritative and returned at once. Otherwise a
/// truncation is preferred over other failures, since more bytes may still
/// complete the frame.
fn locate<T>(
    resp: &[u8],
    unit: u8,
    function: u8,
    parse_at: impl Fn(&[u8]) -> Result<T, ModbusError>,
) -> Result<T, ModbusError> {
    let candidates = frame_candidates(resp, unit, function);
    if candidates.is_empty() {
        return Err(ModbusError::MalformedResponse(format!(
            "no frame for unit {} function {:#04x} in {} bytes",
            unit,
            function,
            resp.len()
        )));
    }

    let mut truncated = None;
    let mut first_error = None;

    for start in candidates {
        match parse_at(&resp[start..]) {
            Ok(value) => {
                if start > 0 {
                    debug!("Skipped {} stale bytes before response frame", start);
                }
                return Ok(value);
            }
            Err(err @ ModbusError::DeviceException { .. }) => return Err(err),
            Err(err @ ModbusError::Truncated { .. }) => {
                truncated.get_or_insert(err);
            }
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    Err(truncated
        .or(first_error)
        .unwrap_or_else(|| ModbusError::MalformedResponse("unparseable response".to_string())))
}

fn read_payload_at(frame: &[u8], function: u8) -> Result<Vec<u16>, ModbusError> {
    if frame[1] == function | EXCEPTION_FLAG {
        return Err(exception_at(frame, function));
    }
    if frame.len() < EXCEPTION_FRAME_LEN {
        return Err(ModbusError::Truncated {
            declared: EXCEPTION_FRAME_LEN,
            available: frame.len(),
        });
    }

    let byte_count = frame[2] as usize;
    let declared = 3 + byte_count + 2;
    if frame.len() < declared {
        return Err(ModbusError::Truncated {
            declared,
            available: frame.len(),
        });
    }

    verify_crc(&frame[..declared])?;

    if byte_count % 2 != 0 {
        return Err(ModbusError::MalformedResponse(format!("odd byte count {}", byte_count)));
    }

    Ok(frame[3..3 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn exception_at(frame: &[u8], function: u8) -> ModbusError {
    if frame.len() < EXCEPTION_FRAME_LEN {
        return ModbusError::Truncated {
            declared: EXCEPTION_FRAME_LEN,
            available: frame.len(),
        };
    }
    match verify_crc(&frame[..EXCEPTION_FRAME_LEN]) {
        Ok(()) => ModbusError::DeviceException {
            function,
            code: frame[2],
        },
        Err(err) => err,
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

pub const FN_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FN_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FN_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const EXCEPTION_FLAG: u8 = 0x80;

/// The firmware drops the socket when asked for more than this many registers.
pub const DEFAULT_MAX_CHUNK: u16 = 10;
/// Protocol ceiling for a single read request.
pub const MAX_READ_QUANTITY: u16 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterTable {
    Holding,
    Input,
}

impl RegisterTable {
    pub fn function_code(self) -> u8 {
        match self {
            RegisterTable::Holding => FN_READ_HOLDING_REGISTERS,
            RegisterTable::Input => FN_READ_INPUT_REGISTERS,
        }
    }
}

impl Default for RegisterTable {
    fn default() -> Self {
        RegisterTable::Input
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ReadOne {
        table: RegisterTable,
        address: u16,
    },
    ReadMany {
        table: RegisterTable,
        address: u16,
        count: u16,
        max_chunk: u16,
    },
    WriteOne {
        address: u16,
        value: u16,
    },
    /// Reads the word, replaces the `mask` bits with `bits` and writes it
    /// back, all inside one worker task.
    WriteBits {
        table: RegisterTable,
        address: u16,
        mask: u16,
        bits: u16,
    },
}

impl Operation {
    pub fn read_one(address: u16) -> Self {
        Operation::ReadOne { table: RegisterTable::Input, address }
    }

    pub fn read_many(address: u16, count: u16) -> Self {
        Operation::ReadMany {
            table: RegisterTable::Input,
            address,
            count,
            max_chunk: DEFAULT_MAX_CHUNK,
        }
    }

    pub fn write_one(address: u16, value: u16) -> Self {
        Operation::WriteOne { address, value }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Operation::WriteOne { .. } | Operation::WriteBits { .. } => TaskKind::Write,
            _ => TaskKind::Read,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ReadOne { table, address } => write!(f, "read {:?}[{}]", table, address),
            Operation::ReadMany { table, address, count, max_chunk } => write!(
                f,
                "read {:?}[{}..{}] in chunks of {}",
                table,
                address,
                *address as u32 + *count as u32,
                max_chunk
            ),
            Operation::WriteOne { address, value } => write!(f, "write [{}] = {:#06x}", address, value),
            Operation::WriteBits { table, address, mask, bits } => write!(
                f,
                "update {:?}[{}] bits {:#06x} to {:#06x}",
                table, address, mask, bits
            ),
        }
    }
}

/// Splits `count` registers starting at `address` into device-sized sub-reads.
pub fn chunk_plan(address: u16, count: u16, max_chunk: u16) -> Vec<(u16, u16)> {
    let max_chunk = max_chunk.clamp(1, MAX_READ_QUANTITY);
    let mut plan = Vec::new();
    let mut current = address;
    let mut remaining = count;

    while remaining > 0 {
        let chunk = remaining.min(max_chunk);
        plan.push((current, chunk));
        current = current.wrapping_add(chunk);
        remaining -= chunk;
    }
    plan
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeValue {
    Register(u16),
    Registers(Vec<u16>),
    Written { address: u16, value: u16 },
}

impl ExchangeValue {
    pub fn registers(&self) -> Vec<u16> {
        match self {
            ExchangeValue::Register(value) => vec![*value],
            ExchangeValue::Registers(values) => values.clone(),
            ExchangeValue::Written { value, .. } => vec![*value],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Read,
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_plan_splits_spectrum_block() {
        let plan = chunk_plan(420, 58, 10);
        assert_eq!(
            plan,
            vec![(420, 10), (430, 10), (440, 10), (450, 10), (460, 10), (470, 8)]
        );
    }

    #[test]
    fn test_chunk_plan_edge_cases() {
        assert!(chunk_plan(10, 0, 10).is_empty());
        assert_eq!(chunk_plan(10, 3, 10), vec![(10, 3)]);
        // zero chunk size is treated as one register per request
        assert_eq!(chunk_plan(5, 2, 0), vec![(5, 1), (6, 1)]);
    }

    #[test]
    fn test_operation_kind() {
        assert_eq!(Operation::write_one(1531, 2300).kind(), TaskKind::Write);
        assert_eq!(Operation::read_one(1511).kind(), TaskKind::Read);
        assert_eq!(Operation::read_many(400, 15).kind(), TaskKind::Read);
        let relay = Operation::WriteBits {
            table: RegisterTable::Input,
            address: 1021,
            mask: 0b10,
            bits: 0b10,
        };
        assert_eq!(relay.kind(), TaskKind::Write);
    }
}

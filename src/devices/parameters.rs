//! Declarative named-parameter table.
//!
//! Each instrument field is a row naming where it lives and how it is
//! encoded. Poll groups read a run of registers on a cadence; every parameter
//! in a group is decoded from that group's register slice.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::modbus::float::{decode_variants, pick_variant, within, WordOrder};
use crate::modbus::protocol::{Operation, RegisterTable};
use crate::storage::CachedValue;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollGroup {
    pub name: String,
    #[serde(default)]
    pub table: RegisterTable,
    pub address: u16,
    pub count: u16,
    /// Overrides the global poll interval.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl PollGroup {
    pub fn new(name: &str, address: u16, count: u16) -> Self {
        Self {
            name: name.to_string(),
            table: RegisterTable::Input,
            address,
            count,
            interval_ms: None,
            enabled: true,
        }
    }

    pub fn on_table(mut self, table: RegisterTable) -> Self {
        self.table = table;
        self
    }

    pub fn contains(&self, address: u16, span: u16) -> bool {
        let start = self.address as u32;
        let end = start + self.count as u32;
        let first = address as u32;
        first >= start && first + span as u32 <= end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Raw 16-bit value.
    Word,
    /// Engineering value = raw / divisor.
    Scaled { divisor: f64 },
    /// One bit of a shared status/control word.
    Bit { bit: u8 },
    /// Two registers; order inferred when not pinned.
    Float {
        #[serde(default)]
        order: Option<WordOrder>,
        min: f32,
        max: f32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub key: String,
    /// Poll group the value is decoded from; `None` for write-only fields.
    #[serde(default)]
    pub group: Option<String>,
    pub address: u16,
    #[serde(default)]
    pub write_address: Option<u16>,
    pub kind: ParameterKind,
    #[serde(default)]
    pub writable: bool,
    /// Accepted engineering range for writes.
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ParameterSpec {
    fn new(key: &str, group: Option<&str>, address: u16, kind: ParameterKind) -> Self {
        Self {
            key: key.to_string(),
            group: group.map(str::to_string),
            address,
            write_address: None,
            kind,
            writable: false,
            min: None,
            max: None,
        }
    }

    fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn register_span(&self) -> u16 {
        match self.kind {
            ParameterKind::Float { .. } => 2,
            _ => 1,
        }
    }

    pub fn target_address(&self) -> u16 {
        self.write_address.unwrap_or(self.address)
    }

    /// Decodes this field from a group's registers starting at `group_start`.
    pub fn decode(&self, group_start: u16, registers: &[u16]) -> Result<CachedValue, ModbusError> {
        let offset = self.address.wrapping_sub(group_start) as usize;
        let span = self.register_span() as usize;
        let words = registers.get(offset..offset + span).ok_or_else(|| {
            ModbusError::Internal(format!(
                "{} at {} is outside the {} registers read from {}",
                self.key,
                self.address,
                registers.len(),
                group_start
            ))
        })?;

        match &self.kind {
            ParameterKind::Word => Ok(CachedValue::Word(words[0])),
            ParameterKind::Scaled { divisor } => Ok(CachedValue::Number(words[0] as f64 / divisor)),
            ParameterKind::Bit { bit } => Ok(CachedValue::Flag(words[0] & (1 << bit) != 0)),
            ParameterKind::Float { order, min, max } => {
                let plausible = within(*min, *max);
                let value = match order {
                    Some(order) => order.decode(words[0], words[1]).filter(|v| plausible(*v)),
                    None => pick_variant(&decode_variants(words[0], words[1]), plausible).map(|(_, v)| v),
                };
                value.map(|v| CachedValue::Number(v as f64)).ok_or_else(|| {
                    ModbusError::MalformedResponse(format!(
                        "{}: no byte order yields a value in [{}, {}] from {:04X} {:04X}",
                        self.key, min, max, words[0], words[1]
                    ))
                })
            }
        }
    }

    /// Turns an engineering value into the write to queue. Bit fields become
    /// a read-modify-write of their word, read back from `table`.
    pub fn write_operation(&self, value: f64, table: RegisterTable) -> Result<Operation, ModbusError> {
        if !self.writable {
            return Err(ModbusError::NotWritable(self.key.clone()));
        }
        let out_of_range = || ModbusError::ValueOutOfRange {
            key: self.key.clone(),
            value,
        };
        if !value.is_finite() {
            return Err(out_of_range());
        }
        if self.min.map_or(false, |min| value < min) || self.max.map_or(false, |max| value > max) {
            return Err(out_of_range());
        }

        let address = self.target_address();
        match &self.kind {
            ParameterKind::Word => Ok(Operation::write_one(address, to_register(value).ok_or_else(out_of_range)?)),
            ParameterKind::Scaled { divisor } => Ok(Operation::write_one(
                address,
                to_register(value * divisor).ok_or_else(out_of_range)?,
            )),
            ParameterKind::Bit { bit } => {
                let mask = 1u16 << bit;
                Ok(Operation::WriteBits {
                    table,
                    address,
                    mask,
                    bits: if value != 0.0 { mask } else { 0 },
                })
            }
            // needs a multi-register write
            ParameterKind::Float { .. } => Err(ModbusError::NotWritable(self.key.clone())),
        }
    }

    /// The cache value a successful write of `value` will produce.
    pub fn written_value(&self, value: f64) -> CachedValue {
        match self.kind {
            ParameterKind::Bit { .. } => CachedValue::Flag(value != 0.0),
            ParameterKind::Word => CachedValue::Word(value.round() as u16),
            _ => CachedValue::Number(value),
        }
    }
}

fn to_register(value: f64) -> Option<u16> {
    let rounded = value.round();
    (0.0..=u16::MAX as f64).contains(&rounded).then_some(rounded as u16)
}

/// Parameters indexed by key.
#[derive(Debug, Clone, Default)]
pub struct ParameterTable {
    specs: Vec<ParameterSpec>,
    index: HashMap<String, usize>,
}

impl ParameterTable {
    pub fn new(specs: Vec<ParameterSpec>) -> Self {
        let index = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.key.clone(), i))
            .collect();
        Self { specs, index }
    }

    pub fn get(&self, key: &str) -> Result<&ParameterSpec, ModbusError> {
        self.index
            .get(key)
            .map(|&i| &self.specs[i])
            .ok_or_else(|| ModbusError::UnknownParameter(key.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.specs.iter()
    }

    pub fn in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a ParameterSpec> + 'a {
        self.specs
            .iter()
            .filter(move |spec| spec.group.as_deref() == Some(group))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Checks parameters against their groups: unique keys, known groups, and
/// every polled field inside its group's register run.
pub fn validate_layout(groups: &[PollGroup], specs: &[ParameterSpec]) -> Result<(), ModbusError> {
    let mut group_names = HashMap::new();
    for group in groups {
        if group.count == 0 {
            return Err(ModbusError::ConfigError(format!("poll group '{}' reads no registers", group.name)));
        }
        if group_names.insert(group.name.as_str(), group).is_some() {
            return Err(ModbusError::ConfigError(format!("duplicate poll group '{}'", group.name)));
        }
    }

    let mut keys = HashMap::new();
    for spec in specs {
        if keys.insert(spec.key.as_str(), ()).is_some() {
            return Err(ModbusError::ConfigError(format!("duplicate parameter '{}'", spec.key)));
        }
        if let ParameterKind::Bit { bit } = spec.kind {
            if bit > 15 {
                return Err(ModbusError::ConfigError(format!("{}: bit {} out of range", spec.key, bit)));
            }
        }
        if let ParameterKind::Scaled { divisor } = spec.kind {
            if divisor == 0.0 || !divisor.is_finite() {
                return Err(ModbusError::ConfigError(format!("{}: invalid divisor", spec.key)));
            }
        }

        match &spec.group {
            Some(name) => {
                let group = group_names.get(name.as_str()).ok_or_else(|| {
                    ModbusError::ConfigError(format!("{} refers to unknown poll group '{}'", spec.key, name))
                })?;
                if !group.contains(spec.address, spec.register_span()) {
                    return Err(ModbusError::ConfigError(format!(
                        "{} at {} lies outside poll group '{}'",
                        spec.key, spec.address, name
                    )));
                }
            }
            None if !spec.writable => {
                return Err(ModbusError::ConfigError(format!(
                    "{} is neither polled nor writable",
                    spec.key
                )));
            }
            None => {}
        }
    }
    Ok(())
}

/// Register map of the polarizer controller.
pub fn instrument_groups() -> Vec<PollGroup> {
    vec![
        PollGroup::new("external_relays", 1020, 1).on_table(RegisterTable::Holding),
        PollGroup::new("relays", 1021, 1),
        PollGroup::new("valves", 1111, 1),
        PollGroup::new("fans", 1131, 1),
        PollGroup::new("chiller", 1511, 1),
        PollGroup::new("seop_cell", 1411, 1),
        PollGroup::new("seop_setpoint", 1421, 1),
        PollGroup::new("magnet_psu", 1341, 1),
        PollGroup::new("laser_psu", 1251, 1),
        PollGroup::new("xenon", 1611, 1),
        PollGroup::new("n2", 1651, 1),
        PollGroup::new("vacuum", 1701, 1),
    ]
}

pub fn instrument_parameters() -> Vec<ParameterSpec> {
    let hundredths = || ParameterKind::Scaled { divisor: 100.0 };
    let mut specs = Vec::new();

    // low byte only; the high byte carries nothing
    for relay in 1..=8u8 {
        specs.push(ParameterSpec::new(
            &format!("external_relay_{}", relay),
            Some("external_relays"),
            1020,
            ParameterKind::Bit { bit: relay - 1 },
        ));
    }
    for relay in 1..=8u8 {
        specs.push(
            ParameterSpec::new(&format!("relay_{}", relay), Some("relays"), 1021, ParameterKind::Bit { bit: relay - 1 })
                .writable(),
        );
    }
    // valves X6..X12 sit on bits 5..11
    for bit in 5..=11u8 {
        specs.push(
            ParameterSpec::new(&format!("valve_x{}", bit + 1), Some("valves"), 1111, ParameterKind::Bit { bit }).writable(),
        );
    }
    for bit in 0..=9u8 {
        specs.push(
            ParameterSpec::new(&format!("fan_{}", bit + 1), Some("fans"), 1131, ParameterKind::Bit { bit }).writable(),
        );
    }
    specs.push(ParameterSpec::new("laser_fan", Some("fans"), 1131, ParameterKind::Bit { bit: 15 }).writable());

    specs.push(ParameterSpec::new("chiller_temperature", Some("chiller"), 1511, hundredths()));
    specs.push(ParameterSpec::new("chiller_setpoint", None, 1531, hundredths()).writable().range(0.0, 40.0));
    specs.push(ParameterSpec::new("seop_cell_temperature", Some("seop_cell"), 1411, hundredths()));
    specs.push(
        ParameterSpec::new("seop_cell_setpoint", Some("seop_setpoint"), 1421, hundredths())
            .writable()
            .range(0.0, 200.0),
    );
    specs.push(ParameterSpec::new("magnet_psu_current", Some("magnet_psu"), 1341, hundredths()));
    specs.push(ParameterSpec::new("magnet_psu_setpoint", None, 1331, hundredths()).writable().range(0.0, 600.0));
    specs.push(ParameterSpec::new("laser_psu_current", Some("laser_psu"), 1251, hundredths()));
    specs.push(ParameterSpec::new("laser_psu_setpoint", None, 1241, hundredths()).writable().range(0.0, 600.0));
    specs.push(ParameterSpec::new("xenon_pressure", Some("xenon"), 1611, hundredths()));
    specs.push(ParameterSpec::new("xenon_setpoint", None, 1621, hundredths()).writable().range(0.0, 600.0));
    specs.push(ParameterSpec::new("n2_pressure", Some("n2"), 1651, hundredths()));
    specs.push(ParameterSpec::new("n2_setpoint", None, 1661, hundredths()).writable().range(0.0, 600.0));
    specs.push(ParameterSpec::new("vacuum_pressure", Some("vacuum"), 1701, hundredths()));

    specs
}

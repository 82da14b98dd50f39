use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;

use crate::storage::{CachedValue, ValueChange};

pub trait ValueFormatter: Send + Sync {
    fn format_change(&self, change: &ValueChange) -> String;
    fn format_snapshot(&self, values: &BTreeMap<String, CachedValue>) -> String;
    fn format_registers(&self, start: u16, registers: &[u16]) -> String;
    fn format_header(&self) -> String;
}

fn display_value(value: &CachedValue) -> String {
    match value {
        CachedValue::Flag(true) => "ON".to_string(),
        CachedValue::Flag(false) => "OFF".to_string(),
        CachedValue::Word(word) => format!("{} ({:#06x})", word, word),
        CachedValue::Number(number) => format!("{:.2}", number),
        CachedValue::Series(series) => format!("[{} samples]", series.len()),
    }
}

pub struct ConsoleFormatter;

impl ValueFormatter for ConsoleFormatter {
    fn format_change(&self, change: &ValueChange) -> String {
        match change {
            ValueChange::Updated {
                key,
                value,
                timestamp,
                ..
            } => format!("{} 🔹 {}: {}", timestamp.format("%H:%M:%S%.3f"), key, display_value(value)),
            ValueChange::Reset { timestamp } => {
                format!("{} 🗑️  All values cleared", timestamp.format("%H:%M:%S%.3f"))
            }
        }
    }

    fn format_snapshot(&self, values: &BTreeMap<String, CachedValue>) -> String {
        let mut output = String::from("📊 Current values:\n");
        output.push_str(&"═".repeat(40));
        output.push('\n');
        for (key, value) in values {
            output.push_str(&format!("{:<24} {}\n", key, display_value(value)));
        }
        output
    }

    fn format_registers(&self, start: u16, registers: &[u16]) -> String {
        let mut output = String::new();
        for (offset, value) in registers.iter().enumerate() {
            output.push_str(&format!(
                "[{}] = {} ({:#06x})\n",
                start as usize + offset,
                value,
                value
            ));
        }
        output
    }

    fn format_header(&self) -> String {
        format!("🚀 RTU link monitor - {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// One JSON document per line.
pub struct JsonFormatter;

impl ValueFormatter for JsonFormatter {
    fn format_change(&self, change: &ValueChange) -> String {
        serde_json::to_string(change).unwrap_or_default()
    }

    fn format_snapshot(&self, values: &BTreeMap<String, CachedValue>) -> String {
        let document = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "values": values,
        });
        serde_json::to_string(&document).unwrap_or_default()
    }

    fn format_registers(&self, start: u16, registers: &[u16]) -> String {
        let document = json!({
            "start": start,
            "registers": registers,
            "hex": hex::encode_upper(registers.iter().flat_map(|r| r.to_be_bytes()).collect::<Vec<u8>>()),
        });
        serde_json::to_string(&document).unwrap_or_default()
    }

    fn format_header(&self) -> String {
        String::new()
    }
}

pub fn formatter_for(name: &str) -> Box<dyn ValueFormatter> {
    match name {
        "json" => Box::new(JsonFormatter),
        _ => Box::new(ConsoleFormatter),
    }
}

use log::debug;
use serde::{Deserialize, Serialize};

use crate::modbus::float::{min_max_relation, FloatBlockDecoder, WordOrder};
use crate::storage::CachedValue;
use crate::utils::error::ModbusError;

/// Status word plus seven floats.
pub const HEADER_REGISTERS: u16 = 15;
pub const SAMPLE_REGISTERS: u16 = 58;

/// Where the IR spectrum block lives and how often to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumLayout {
    pub enabled: bool,
    pub header_address: u16,
    pub samples_address: u16,
    pub sample_count: u16,
    pub interval_ms: u64,
}

impl Default for SpectrumLayout {
    fn default() -> Self {
        Self {
            enabled: true,
            header_address: 400,
            samples_address: 420,
            sample_count: SAMPLE_REGISTERS,
            interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumFrame {
    pub status: u16,
    pub x_min: Option<f32>,
    pub x_max: Option<f32>,
    pub y_min: Option<f32>,
    pub y_max: Option<f32>,
    pub res_freq: Option<f32>,
    pub freq: Option<f32>,
    pub integral: Option<f32>,
    pub samples: Vec<u16>,
    /// Order inferred from the x range, if any.
    pub order: Option<WordOrder>,
}

impl SpectrumFrame {
    pub fn cache_values(&self) -> Vec<(String, CachedValue)> {
        let mut values = vec![("spectrum_status".to_string(), CachedValue::Word(self.status))];
        let floats = [
            ("spectrum_x_min", self.x_min),
            ("spectrum_x_max", self.x_max),
            ("spectrum_y_min", self.y_min),
            ("spectrum_y_max", self.y_max),
            ("spectrum_res_freq", self.res_freq),
            ("spectrum_freq", self.freq),
            ("spectrum_integral", self.integral),
        ];
        for (key, value) in floats {
            if let Some(value) = value {
                values.push((key.to_string(), CachedValue::Number(value as f64)));
            }
        }
        values.push((
            "spectrum_samples".to_string(),
            CachedValue::Series(self.samples.iter().map(|&s| s as f64).collect()),
        ));
        values
    }
}

fn plausible(value: f32) -> bool {
    value == 0.0 || (value.is_normal() && value.abs() <= 1.0e9)
}

/// Decodes spectrum blocks, keeping the inferred float order between reads.
#[derive(Debug, Clone, Default)]
pub struct SpectrumDecoder {
    block: FloatBlockDecoder,
}

impl SpectrumDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the inferred order, e.g. after reconnecting.
    pub fn reset(&mut self) {
        self.block = FloatBlockDecoder::new();
    }

    pub fn decode(&mut self, header: &[u16], samples: &[u16]) -> Result<SpectrumFrame, ModbusError> {
        if header.len() != HEADER_REGISTERS as usize {
            return Err(ModbusError::MalformedResponse(format!(
                "spectrum header has {} registers, expected {}",
                header.len(),
                HEADER_REGISTERS
            )));
        }
        let pair = |index: usize| (header[index], header[index + 1]);

        let order = self.block.establish(pair(1), pair(3), min_max_relation);
        if order.is_none() {
            debug!("Spectrum x range did not resolve a byte order, decoding fields independently");
        }

        let field = |index: usize| {
            let (first, second) = pair(index);
            self.block.decode(first, second, plausible)
        };

        let mut frame = SpectrumFrame {
            status: header[0],
            x_min: field(1),
            x_max: field(3),
            y_min: field(5),
            y_max: field(7),
            res_freq: field(9),
            freq: field(11),
            integral: field(13),
            samples: samples.to_vec(),
            order,
        };

        // the y range is a second known pair; if the shared order split it, re-derive jointly
        if let (Some(low), Some(high)) = (frame.y_min, frame.y_max) {
            if !min_max_relation(low, high) {
                let mut own = FloatBlockDecoder::new();
                if own.establish(pair(5), pair(7), min_max_relation).is_some() {
                    frame.y_min = own.decode(header[5], header[6], plausible);
                    frame.y_max = own.decode(header[7], header[8], plausible);
                }
            }
        }

        Ok(frame)
    }
}

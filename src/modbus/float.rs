//! 32-bit float decoding from register pairs of uncertain byte order.
//!
//! The controller firmware does not use one consistent layout, so every
//! value is decoded under all four orders and the caller picks the plausible
//! one. A block decoder remembers the order that worked for a known field
//! pair and reuses it for the rest of the block.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WordOrder {
    /// Big-endian words, high word first.
    Abcd,
    /// Bytes swapped inside each word.
    Badc,
    /// Words swapped.
    Cdab,
    /// Fully reversed.
    Dcba,
}

impl WordOrder {
    pub const ALL: [WordOrder; 4] = [WordOrder::Abcd, WordOrder::Badc, WordOrder::Cdab, WordOrder::Dcba];

    /// Arranges the two registers into big-endian float bytes under this order.
    pub fn arrange(self, first: u16, second: u16) -> [u8; 4] {
        let [a, b] = first.to_be_bytes();
        let [c, d] = second.to_be_bytes();
        match self {
            WordOrder::Abcd => [a, b, c, d],
            WordOrder::Badc => [b, a, d, c],
            WordOrder::Cdab => [c, d, a, b],
            WordOrder::Dcba => [d, c, b, a],
        }
    }

    pub fn decode(self, first: u16, second: u16) -> Option<f32> {
        let value = f32::from_be_bytes(self.arrange(first, second));
        value.is_finite().then_some(value)
    }

    /// Splits a float into the two registers a device using this order sends.
    pub fn encode(self, value: f32) -> (u16, u16) {
        let [a, b, c, d] = value.to_be_bytes();
        let bytes = match self {
            WordOrder::Abcd => [a, b, c, d],
            WordOrder::Badc => [b, a, d, c],
            WordOrder::Cdab => [c, d, a, b],
            WordOrder::Dcba => [d, c, b, a],
        };
        (
            u16::from_be_bytes([bytes[0], bytes[1]]),
            u16::from_be_bytes([bytes[2], bytes[3]]),
        )
    }
}

impl fmt::Display for WordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WordOrder::Abcd => "ABCD",
            WordOrder::Badc => "BADC",
            WordOrder::Cdab => "CDAB",
            WordOrder::Dcba => "DCBA",
        };
        f.write_str(name)
    }
}

/// The finite interpretations of one register pair.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FloatVariants {
    values: [Option<f32>; 4],
}

impl FloatVariants {
    pub fn get(&self, order: WordOrder) -> Option<f32> {
        self.values[order as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (WordOrder, f32)> + '_ {
        WordOrder::ALL
            .iter()
            .filter_map(move |&order| self.get(order).map(|value| (order, value)))
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

pub fn decode_variants(first: u16, second: u16) -> FloatVariants {
    let mut values = [None; 4];
    for order in WordOrder::ALL {
        values[order as usize] = order.decode(first, second);
    }
    FloatVariants { values }
}

/// First order (in canonical ABCD, BADC, CDAB, DCBA sequence) whose value the
/// predicate accepts.
pub fn pick_variant<P>(variants: &FloatVariants, predicate: P) -> Option<(WordOrder, f32)>
where
    P: Fn(f32) -> bool,
{
    variants.iter().find(|&(_, value)| predicate(value))
}

/// Relation for a (min, max) field pair: both plausible readings, max above
/// min by at most 1e6. Subnormal values never come from a real instrument.
pub fn min_max_relation(min: f32, max: f32) -> bool {
    let plausible = |value: f32| value == 0.0 || value.is_normal();
    let span = max - min;
    plausible(min) && plausible(max) && span > 0.0 && span <= 1.0e6
}

/// Range predicate used by parameter and spectrum decoding.
pub fn within(min: f32, max: f32) -> impl Fn(f32) -> bool {
    move |value| value >= min && value <= max
}

/// Decodes one register block under a shared, inferred byte order.
#[derive(Debug, Clone, Default)]
pub struct FloatBlockDecoder {
    shared: Option<WordOrder>,
}

impl FloatBlockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(order: WordOrder) -> Self {
        Self { shared: Some(order) }
    }

    pub fn shared_order(&self) -> Option<WordOrder> {
        self.shared
    }

    /// Establishes the block order from two fields with a known relationship,
    /// e.g. a (min, max) pair. Both fields must decode under the same order.
    pub fn establish<P>(&mut self, low: (u16, u16), high: (u16, u16), relation: P) -> Option<WordOrder>
    where
        P: Fn(f32, f32) -> bool,
    {
        let current = self.shared;
        let candidates = current
            .into_iter()
            .chain(WordOrder::ALL.into_iter().filter(move |order| Some(*order) != current));

        for order in candidates {
            if let (Some(a), Some(b)) = (order.decode(low.0, low.1), order.decode(high.0, high.1)) {
                if relation(a, b) {
                    self.shared = Some(order);
                    return Some(order);
                }
            }
        }
        None
    }

    /// Decodes a field under the shared order; if that value fails the
    /// predicate the field's own order is derived independently.
    pub fn decode<P>(&self, first: u16, second: u16, predicate: P) -> Option<f32>
    where
        P: Fn(f32) -> bool,
    {
        if let Some(order) = self.shared {
            if let Some(value) = order.decode(first, second).filter(|value| predicate(*value)) {
                return Some(value);
            }
        }
        pick_variant(&decode_variants(first, second), predicate).map(|(_, value)| value)
    }
}

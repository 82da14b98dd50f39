pub mod parameters;
pub mod spectrum;

pub use parameters::{ParameterKind, ParameterSpec, ParameterTable, PollGroup};
pub use spectrum::{SpectrumDecoder, SpectrumFrame, SpectrumLayout};

pub mod settings;

pub use settings::{Config, ConnectionConfig, LivenessConfig, OutputConfig, PollingConfig, TimingConfig};

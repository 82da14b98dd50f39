//! Modbus RTU-over-TCP client engine for instrument controllers.
//!
//! A single I/O worker owns the socket and serializes every exchange; callers
//! enqueue operations and read results from channels. Around it sit a
//! liveness monitor that reconnects silent links, a declarative parameter
//! table, and a write-through value cache.

pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod output;
pub mod services;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use devices::{ParameterSpec, ParameterTable, PollGroup};
pub use modbus::{Connection, ConnectionParams, FramerVariant, Operation, RequestExecutor, WordOrder};
pub use services::{DataService, IoScheduler, SchedulerHandle};
pub use storage::{CachedValue, RegisterCache, ValueChange};
pub use utils::error::ModbusError;

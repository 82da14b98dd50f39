pub mod connection;
pub mod crc;
pub mod executor;
pub mod float;
pub mod frame;
pub mod protocol;

pub use connection::{Connection, ConnectionParams, ConnectionState, FramerVariant, KeepAliveSettings, Transport};
pub use crc::crc16;
pub use executor::{LivenessClock, OperationTimeouts, RequestExecutor, RetryPolicy};
pub use float::{decode_variants, pick_variant, FloatBlockDecoder, FloatVariants, WordOrder};
pub use protocol::{ExchangeValue, Operation, RegisterTable, TaskKind};

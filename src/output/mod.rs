pub mod formatters;

pub use formatters::{formatter_for, ConsoleFormatter, JsonFormatter, ValueFormatter};

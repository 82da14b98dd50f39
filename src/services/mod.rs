pub mod data_service;
pub mod liveness;
pub mod scheduler;

pub use data_service::{DataService, TransportFactory};
pub use liveness::{spawn_supervisor, LivenessMonitor, LivenessSettings, LivenessState};
pub use scheduler::{ConnectionEvent, IoScheduler, PendingTask, ReadOutcome, SchedulerChannels, SchedulerHandle, WriteOutcome};

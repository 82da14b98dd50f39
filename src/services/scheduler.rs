//! Single background worker that owns the transport and serializes every
//! exchange with the device.
//!
//! Callers only enqueue through a [`SchedulerHandle`] and later receive
//! outcomes on channels; they never wait on the socket. Writes and control
//! commands drain before reads, otherwise tasks run in submission order.

use futures_util::FutureExt;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::modbus::connection::{ConnectionState, Transport};
use crate::modbus::executor::{LivenessClock, RequestExecutor};
use crate::modbus::protocol::{ExchangeValue, Operation, TaskKind};
use crate::utils::error::ModbusError;

#[derive(Debug, Clone)]
pub struct PendingTask {
    pub key: String,
    pub kind: TaskKind,
    pub op: Operation,
    pub timeout: Option<Duration>,
    /// Opaque caller data handed back with a write outcome.
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    pub key: String,
    pub result: Result<ExchangeValue, ModbusError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub key: String,
    pub op: Operation,
    pub meta: Option<Value>,
    pub result: Result<ExchangeValue, ModbusError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    ConnectFailed(String),
    Disconnected,
    /// The link died underneath a task.
    Lost(String),
}

enum Command<T> {
    Submit(PendingTask),
    Connect {
        reply: Option<oneshot::Sender<Result<(), ModbusError>>>,
    },
    Disconnect {
        reply: Option<oneshot::Sender<()>>,
    },
    Install {
        transport: T,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

impl<T> Command<T> {
    fn is_priority(&self) -> bool {
        match self {
            Command::Submit(task) => task.kind == TaskKind::Write,
            _ => true,
        }
    }
}

/// Receiving ends of the worker's result delivery.
pub struct SchedulerChannels {
    pub reads: mpsc::UnboundedReceiver<ReadOutcome>,
    pub writes: mpsc::UnboundedReceiver<WriteOutcome>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

pub struct SchedulerHandle<T> {
    commands: mpsc::UnboundedSender<Command<T>>,
    state: watch::Receiver<ConnectionState>,
    liveness: watch::Receiver<LivenessClock>,
}

impl<T> Clone for SchedulerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
            liveness: self.liveness.clone(),
        }
    }
}

impl<T: Transport + 'static> SchedulerHandle<T> {
    fn send(&self, command: Command<T>) -> Result<(), ModbusError> {
        self.commands
            .send(command)
            .map_err(|_| ModbusError::Internal("I/O worker has stopped".to_string()))
    }

    pub fn submit(&self, task: PendingTask) -> Result<(), ModbusError> {
        debug!("Queued {:?} task '{}': {}", task.kind, task.key, task.op);
        self.send(Command::Submit(task))
    }

    pub fn submit_read(&self, key: &str, op: Operation, timeout: Option<Duration>) -> Result<(), ModbusError> {
        self.submit(PendingTask {
            key: key.to_string(),
            kind: TaskKind::Read,
            op,
            timeout,
            meta: None,
        })
    }

    pub fn submit_write(
        &self,
        key: &str,
        op: Operation,
        meta: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<(), ModbusError> {
        self.submit(PendingTask {
            key: key.to_string(),
            kind: TaskKind::Write,
            op,
            timeout,
            meta,
        })
    }

    /// Queues a connect and waits for the worker's acknowledgement.
    pub async fn connect(&self) -> Result<(), ModbusError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Connect { reply: Some(reply) })?;
        done.await
            .map_err(|_| ModbusError::Internal("connect request dropped".to_string()))?
    }

    /// Fire-and-forget connect; the outcome arrives as a `ConnectionEvent`.
    pub fn request_connect(&self) -> Result<(), ModbusError> {
        self.send(Command::Connect { reply: None })
    }

    pub async fn disconnect(&self) -> Result<(), ModbusError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Disconnect { reply: Some(reply) })?;
        done.await
            .map_err(|_| ModbusError::Internal("disconnect request dropped".to_string()))
    }

    /// Disconnects the current transport, waits for that to be acknowledged,
    /// then installs `transport` in its place. The new one starts disconnected.
    pub async fn reconfigure(&self, transport: T) -> Result<(), ModbusError> {
        self.disconnect().await?;
        let (reply, done) = oneshot::channel();
        self.send(Command::Install { transport, reply })?;
        done.await
            .map_err(|_| ModbusError::Internal("reconfigure request dropped".to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Cached state; never touches the socket.
    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn liveness(&self) -> watch::Receiver<LivenessClock> {
        self.liveness.clone()
    }
}

pub struct IoScheduler<T: Transport> {
    executor: RequestExecutor<T>,
    commands: mpsc::UnboundedReceiver<Command<T>>,
    priority: VecDeque<Command<T>>,
    reads: VecDeque<Command<T>>,
    read_results: mpsc::UnboundedSender<ReadOutcome>,
    write_results: mpsc::UnboundedSender<WriteOutcome>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
}

impl<T: Transport + 'static> IoScheduler<T> {
    /// Moves the executor onto a dedicated worker task.
    pub fn spawn(executor: RequestExecutor<T>) -> (SchedulerHandle<T>, SchedulerChannels, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(executor.transport().state());
        let liveness = executor.subscribe_liveness();

        let worker = IoScheduler {
            executor,
            commands: command_rx,
            priority: VecDeque::new(),
            reads: VecDeque::new(),
            read_results: read_tx,
            write_results: write_tx,
            events: event_tx,
            state: state_tx,
        };
        let join = tokio::spawn(worker.run());

        let handle = SchedulerHandle {
            commands: command_tx,
            state: state_rx,
            liveness,
        };
        let channels = SchedulerChannels {
            reads: read_rx,
            writes: write_rx,
            events: event_rx,
        };
        (handle, channels, join)
    }

    async fn run(mut self) {
        info!("⚙️  I/O worker started");
        let mut senders_gone = false;

        loop {
            // Absorb everything already queued so priorities see the full picture.
            loop {
                match self.commands.try_recv() {
                    Ok(command) => self.enqueue(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        senders_gone = true;
                        break;
                    }
                }
            }

            match self.priority.pop_front().or_else(|| self.reads.pop_front()) {
                Some(Command::Shutdown) => break,
                Some(command) => self.execute(command).await,
                None if senders_gone => break,
                None => match self.commands.recv().await {
                    Some(command) => self.enqueue(command),
                    None => break,
                },
            }
        }

        self.executor.disconnect().await;
        self.publish_state();
        info!("⚙️  I/O worker stopped");
    }

    fn enqueue(&mut self, command: Command<T>) {
        if command.is_priority() {
            self.priority.push_back(command);
        } else {
            self.reads.push_back(command);
        }
    }

    async fn execute(&mut self, command: Command<T>) {
        match command {
            Command::Submit(task) => self.run_task(task).await,
            Command::Connect { reply } => {
                let result = self.connect().await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::Install { transport, reply } => {
                self.disconnect().await;
                let _old = self.executor.replace_transport(transport);
                info!("🔧 Installed new connection parameters");
                self.publish_state();
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    async fn run_task(&mut self, task: PendingTask) {
        let was_connected = self.executor.is_connected();

        let result = AssertUnwindSafe(self.executor.run(&task.op, task.timeout))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic_message(panic.as_ref());
                error!("❌ Task '{}' panicked: {}", task.key, reason);
                Err(ModbusError::Internal(format!("task panicked: {}", reason)))
            });

        if was_connected && !self.executor.is_connected() {
            let reason = match &result {
                Err(e) => e.to_string(),
                Ok(_) => "transport closed".to_string(),
            };
            self.publish_state();
            self.emit(ConnectionEvent::Lost(reason));
        }

        match &result {
            Ok(_) => debug!("Task '{}' completed", task.key),
            Err(ModbusError::NotConnected) => debug!("Task '{}' skipped: not connected", task.key),
            Err(e) => warn!("⚠️  Task '{}' ({}) failed: {}", task.key, task.op, e),
        }

        match task.kind {
            TaskKind::Read => {
                let outcome = ReadOutcome { key: task.key, result };
                if self.read_results.send(outcome).is_err() {
                    debug!("Read outcome dropped, no receiver");
                }
            }
            TaskKind::Write => {
                let outcome = WriteOutcome {
                    key: task.key,
                    op: task.op,
                    meta: task.meta,
                    result,
                };
                if self.write_results.send(outcome).is_err() {
                    debug!("Write outcome dropped, no receiver");
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<(), ModbusError> {
        let _ = self.state.send(ConnectionState::Connecting);

        let result = AssertUnwindSafe(self.executor.connect())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic_message(panic.as_ref());
                error!("❌ Connect panicked: {}", reason);
                Err(ModbusError::Internal(format!("connect panicked: {}", reason)))
            });

        self.publish_state();
        match &result {
            Ok(()) => self.emit(ConnectionEvent::Connected),
            Err(e) => self.emit(ConnectionEvent::ConnectFailed(e.to_string())),
        }
        result
    }

    async fn disconnect(&mut self) {
        let was_connected = self.executor.is_connected();
        self.executor.disconnect().await;
        self.publish_state();
        if was_connected {
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    fn publish_state(&self) {
        let state = self.executor.transport().state();
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            debug!("Connection event dropped, no receiver");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

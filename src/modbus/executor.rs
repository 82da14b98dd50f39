use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use super::connection::Transport;
use super::frame::{build_read_frame, build_write_frame, parse_multi_read_response, parse_single_read_response, parse_write_response};
use super::protocol::{chunk_plan, ExchangeValue, Operation, RegisterTable};
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per exchange, including the first.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationTimeouts {
    pub single_read: Duration,
    /// Per chunk.
    pub multi_read: Duration,
    pub write: Duration,
    pub inter_chunk_delay: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            single_read: Duration::from_millis(2000),
            multi_read: Duration::from_millis(500),
            write: Duration::from_millis(2000),
            inter_chunk_delay: Duration::from_millis(10),
        }
    }
}

/// Recency of the last successful exchange, published to the liveness monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LivenessClock {
    pub last_success: Option<Instant>,
    /// Set when a chunked read fails. Single-register successes leave it
    /// alone; only a complete chunked read or a fresh connect clears it.
    pub degraded: bool,
}

/// Runs operations against a transport with the retry-once policy.
pub struct RequestExecutor<T: Transport> {
    transport: T,
    retry: RetryPolicy,
    timeouts: OperationTimeouts,
    liveness: watch::Sender<LivenessClock>,
}

impl<T: Transport> RequestExecutor<T> {
    pub fn new(transport: T, retry: RetryPolicy, timeouts: OperationTimeouts) -> Self {
        let (liveness, _) = watch::channel(LivenessClock::default());
        Self {
            transport,
            retry,
            timeouts,
            liveness,
        }
    }

    pub fn subscribe_liveness(&self) -> watch::Receiver<LivenessClock> {
        self.liveness.subscribe()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Swaps in a new transport, returning the old one. The caller is expected
    /// to have disconnected it first.
    pub fn replace_transport(&mut self, transport: T) -> T {
        std::mem::replace(&mut self.transport, transport)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn connect(&mut self) -> Result<(), ModbusError> {
        self.transport.connect().await?;
        self.record_success();
        self.set_degraded(false);
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
    }

    /// Executes one operation. `timeout` overrides the per-class default.
    pub async fn run(&mut self, op: &Operation, timeout: Option<Duration>) -> Result<ExchangeValue, ModbusError> {
        if !self.transport.is_connected() {
            return Err(ModbusError::NotConnected);
        }
        let unit = self.transport.unit_id();

        match *op {
            Operation::ReadOne { table, address } => {
                let frame = build_read_frame(unit, table, address, 1);
                let function = table.function_code();
                let limit = timeout.unwrap_or(self.timeouts.single_read);
                let value = self
                    .exchange(&frame, limit, |resp| parse_single_read_response(resp, unit, function))
                    .await?;
                Ok(ExchangeValue::Register(value))
            }
            Operation::ReadMany {
                table,
                address,
                count,
                max_chunk,
            } => {
                let limit = timeout.unwrap_or(self.timeouts.multi_read);
                let values = self.read_chunked(unit, table, address, count, max_chunk, limit).await?;
                Ok(ExchangeValue::Registers(values))
            }
            Operation::WriteOne { address, value } => {
                let frame = build_write_frame(unit, address, value);
                let limit = timeout.unwrap_or(self.timeouts.write);
                self.exchange(&frame, limit, |resp| parse_write_response(resp, unit, address, value))
                    .await?;
                Ok(ExchangeValue::Written { address, value })
            }
            Operation::WriteBits {
                table,
                address,
                mask,
                bits,
            } => {
                let function = table.function_code();
                let frame = build_read_frame(unit, table, address, 1);
                let current = self
                    .exchange(&frame, self.timeouts.single_read, |resp| {
                        parse_single_read_response(resp, unit, function)
                    })
                    .await?;

                let value = (current & !mask) | (bits & mask);
                debug!("[{}] {:#06x} -> {:#06x}", address, current, value);
                let frame = build_write_frame(unit, address, value);
                let limit = timeout.unwrap_or(self.timeouts.write);
                self.exchange(&frame, limit, |resp| parse_write_response(resp, unit, address, value))
                    .await?;
                Ok(ExchangeValue::Written { address, value })
            }
        }
    }

    /// All chunks or nothing.
    async fn read_chunked(
        &mut self,
        unit: u8,
        table: RegisterTable,
        address: u16,
        count: u16,
        max_chunk: u16,
        limit: Duration,
    ) -> Result<Vec<u16>, ModbusError> {
        let plan = chunk_plan(address, count, max_chunk);
        let function = table.function_code();
        let mut values = Vec::with_capacity(count as usize);

        for (index, &(start, quantity)) in plan.iter().enumerate() {
            if index > 0 && !self.timeouts.inter_chunk_delay.is_zero() {
                sleep(self.timeouts.inter_chunk_delay).await;
            }

            let frame = build_read_frame(unit, table, start, quantity);
            let result = self
                .exchange(&frame, limit, |resp| {
                    let registers = parse_multi_read_response(resp, unit, function)?;
                    if registers.len() != quantity as usize {
                        return Err(ModbusError::MalformedResponse(format!(
                            "expected {} registers, received {}",
                            quantity,
                            registers.len()
                        )));
                    }
                    Ok(registers)
                })
                .await;

            match result {
                Ok(registers) => values.extend(registers),
                Err(e) => {
                    warn!(
                        "⚠️  Chunk {}/{} ({} registers at {}) failed, dropping read of {}..{}: {}",
                        index + 1,
                        plan.len(),
                        quantity,
                        start,
                        address,
                        address as u32 + count as u32,
                        e
                    );
                    self.set_degraded(true);
                    return Err(e);
                }
            }
        }

        self.set_degraded(false);
        Ok(values)
    }

    async fn exchange<V, P>(&mut self, frame: &[u8], limit: Duration, parse: P) -> Result<V, ModbusError>
    where
        P: Fn(&[u8]) -> Result<V, ModbusError>,
    {
        let mut attempt = 1;
        loop {
            let result = match self.transport.send_and_receive(frame, limit).await {
                Ok(response) => parse(&response),
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!("🔄 Request recovered on attempt {}", attempt);
                    }
                    self.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    warn!(
                        "⚠️  Attempt {} failed ({}), retrying in {:?}",
                        attempt, e, self.retry.delay
                    );
                    sleep(self.retry.delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("Exchange failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    fn record_success(&self) {
        self.liveness.send_modify(|clock| clock.last_success = Some(Instant::now()));
    }

    fn set_degraded(&self, degraded: bool) {
        self.liveness
            .send_if_modified(|clock| std::mem::replace(&mut clock.degraded, degraded) != degraded);
    }
}

/// Scripted transport for unit tests.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::modbus::connection::ConnectionState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    pub type Responder = Box<dyn FnMut(&[u8]) -> Result<Vec<u8>, ModbusError> + Send>;

    pub struct ScriptedTransport {
        pub state: ConnectionState,
        pub unit: u8,
        pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
        pub connects: Arc<AtomicUsize>,
        pub connect_result: Result<(), ModbusError>,
        responder: Responder,
    }

    impl ScriptedTransport {
        pub fn new(responder: Responder) -> Self {
            Self {
                state: ConnectionState::Connected,
                unit: 1,
                sent: Arc::new(Mutex::new(Vec::new())),
                connects: Arc::new(AtomicUsize::new(0)),
                connect_result: Ok(()),
                responder,
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn state(&self) -> ConnectionState {
            self.state
        }

        fn unit_id(&self) -> u8 {
            self.unit
        }

        async fn connect(&mut self) -> Result<(), ModbusError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.connect_result.is_ok() {
                self.state = ConnectionState::Connected;
            }
            self.connect_result.clone()
        }

        async fn disconnect(&mut self) {
            self.state = ConnectionState::Disconnected;
        }

        async fn send_and_receive(&mut self, frame: &[u8], _timeout: Duration) -> Result<Vec<u8>, ModbusError> {
            self.sent.lock().unwrap().push(frame.to_vec());
            let result = (self.responder)(frame);
            if matches!(result, Err(ModbusError::ConnectionClosed(_))) {
                self.state = ConnectionState::Disconnected;
            }
            result
        }
    }

    /// Answers every read with `address + offset` per register and echoes writes.
    pub fn echo_device() -> Responder {
        Box::new(|frame: &[u8]| {
            let function = frame[1];
            if function == crate::modbus::protocol::FN_WRITE_SINGLE_REGISTER {
                return Ok(frame.to_vec());
            }
            let address = u16::from_be_bytes([frame[2], frame[3]]);
            let quantity = u16::from_be_bytes([frame[4], frame[5]]);
            let registers: Vec<u16> = (0..quantity).map(|i| address.wrapping_add(i)).collect();
            Ok(crate::modbus::frame::build_read_response(frame[0], function, &registers))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{echo_device, ScriptedTransport};
    use super::*;
    use crate::modbus::connection::ConnectionState;
    use crate::modbus::frame::{build_exception_response, build_read_response};

    fn executor(transport: ScriptedTransport) -> RequestExecutor<ScriptedTransport> {
        RequestExecutor::new(transport, RetryPolicy::default(), OperationTimeouts::default())
    }

    fn sent_addresses(transport: &ScriptedTransport) -> Vec<(u16, u16)> {
        transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|f| (u16::from_be_bytes([f[2], f[3]]), u16::from_be_bytes([f[4], f[5]])))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_one_first_attempt() {
        let mut exec = executor(ScriptedTransport::new(Box::new(|_: &[u8]| Ok(build_read_response(1, 4, &[2300])))));
        let liveness = exec.subscribe_liveness();

        let value = exec.run(&Operation::read_one(1511), None).await.unwrap();
        assert_eq!(value, ExchangeValue::Register(2300));
        assert_eq!(exec.transport().sent.lock().unwrap().len(), 1);
        assert!(liveness.borrow().last_success.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_once_with_same_frame() {
        let mut calls = 0;
        let transport = ScriptedTransport::new(Box::new(move |_: &[u8]| {
            calls += 1;
            if calls == 1 {
                Err(ModbusError::Timeout)
            } else {
                Ok(build_read_response(1, 4, &[42]))
            }
        }));
        let mut exec = executor(transport);

        let value = exec.run(&Operation::read_one(1021), None).await.unwrap();
        assert_eq!(value, ExchangeValue::Register(42));

        let sent = exec.transport().sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_second_failure() {
        let mut exec = executor(ScriptedTransport::new(Box::new(|_: &[u8]| {
            Err(ModbusError::MalformedResponse("garbage".into()))
        })));

        let err = exec.run(&Operation::read_one(1021), None).await.unwrap_err();
        assert!(matches!(err, ModbusError::MalformedResponse(_)));
        assert_eq!(exec.transport().sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_closed_is_not_retried() {
        let mut exec = executor(ScriptedTransport::new(Box::new(|_: &[u8]| {
            Err(ModbusError::ConnectionClosed("reset".into()))
        })));

        let err = exec.run(&Operation::write_one(1531, 2300), None).await.unwrap_err();
        assert!(matches!(err, ModbusError::ConnectionClosed(_)));
        assert_eq!(exec.transport().sent.lock().unwrap().len(), 1);
        assert!(!exec.is_connected());

        let err = exec.run(&Operation::read_one(1511), None).await.unwrap_err();
        assert_eq!(err, ModbusError::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_exception_is_final() {
        let mut exec = executor(ScriptedTransport::new(Box::new(|_: &[u8]| Ok(build_exception_response(1, 4, 2)))));

        let err = exec.run(&Operation::read_one(9999), None).await.unwrap_err();
        assert_eq!(err, ModbusError::DeviceException { function: 4, code: 2 });
        assert_eq!(exec.transport().sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunked_read_plan() {
        let mut exec = executor(ScriptedTransport::new(echo_device()));

        let value = exec.run(&Operation::read_many(420, 58), None).await.unwrap();
        let expected: Vec<u16> = (420..478).collect();
        assert_eq!(value, ExchangeValue::Registers(expected));
        assert_eq!(
            sent_addresses(exec.transport()),
            vec![(420, 10), (430, 10), (440, 10), (450, 10), (460, 10), (470, 8)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunked_read_is_all_or_nothing() {
        let mut device = echo_device();
        let transport = ScriptedTransport::new(Box::new(move |frame: &[u8]| {
            if u16::from_be_bytes([frame[2], frame[3]]) == 450 {
                Err(ModbusError::Timeout)
            } else {
                device(frame)
            }
        }));
        let mut exec = executor(transport);
        let liveness = exec.subscribe_liveness();

        let err = exec.run(&Operation::read_many(420, 58), None).await.unwrap_err();
        assert_eq!(err, ModbusError::Timeout);
        // three good chunks, then the fourth twice, then nothing
        assert_eq!(
            sent_addresses(exec.transport()),
            vec![(420, 10), (430, 10), (440, 10), (450, 10), (450, 10)]
        );
        assert!(liveness.borrow().degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_survives_single_reads() {
        let mut device = echo_device();
        // two full failures of the block, both attempts each
        let mut block_failures = 4;
        let transport = ScriptedTransport::new(Box::new(move |frame: &[u8]| {
            let quantity = u16::from_be_bytes([frame[4], frame[5]]);
            if quantity > 1 && block_failures > 0 {
                block_failures -= 1;
                return Err(ModbusError::Timeout);
            }
            device(frame)
        }));
        let mut exec = executor(transport);
        let liveness = exec.subscribe_liveness();

        assert_eq!(exec.run(&Operation::read_many(400, 15), None).await, Err(ModbusError::Timeout));
        exec.run(&Operation::read_one(1021), None).await.unwrap();
        assert!(liveness.borrow().degraded);

        exec.connect().await.unwrap();
        assert!(!liveness.borrow().degraded);

        assert_eq!(exec.run(&Operation::read_many(400, 15), None).await, Err(ModbusError::Timeout));
        assert!(liveness.borrow().degraded);
        exec.run(&Operation::read_many(400, 15), None).await.unwrap();
        assert!(!liveness.borrow().degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_bits_reads_fresh_word() {
        let transport = ScriptedTransport::new(Box::new(|frame: &[u8]| {
            if frame[1] == crate::modbus::protocol::FN_WRITE_SINGLE_REGISTER {
                Ok(frame.to_vec())
            } else {
                Ok(build_read_response(1, frame[1], &[0xAB01]))
            }
        }));
        let mut exec = executor(transport);
        let op = Operation::WriteBits {
            table: RegisterTable::Input,
            address: 1021,
            mask: 1 << 2,
            bits: 1 << 2,
        };

        // high byte and the other relays survive
        assert_eq!(
            exec.run(&op, None).await,
            Ok(ExchangeValue::Written { address: 1021, value: 0xAB05 })
        );
        let sent = exec.transport().sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0][1], 0x04);
        assert_eq!(u16::from_be_bytes([sent[1][4], sent[1][5]]), 0xAB05);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_bits_skips_write_when_read_fails() {
        let mut exec = executor(ScriptedTransport::new(Box::new(|frame: &[u8]| {
            Ok(build_exception_response(1, frame[1], 2))
        })));
        let op = Operation::WriteBits {
            table: RegisterTable::Holding,
            address: 1020,
            mask: 1,
            bits: 0,
        };

        assert_eq!(
            exec.run(&op, None).await,
            Err(ModbusError::DeviceException { function: 3, code: 2 })
        );
        assert_eq!(exec.transport().sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_chunk_is_retried() {
        let mut calls = 0;
        let transport = ScriptedTransport::new(Box::new(move |_: &[u8]| {
            calls += 1;
            let registers: Vec<u16> = if calls == 1 { vec![1, 2] } else { vec![1, 2, 3] };
            Ok(build_read_response(1, 4, &registers))
        }));
        let mut exec = executor(transport);

        let value = exec.run(&Operation::read_many(400, 3), None).await.unwrap();
        assert_eq!(value, ExchangeValue::Registers(vec![1, 2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_echo_and_not_connected() {
        let mut transport = ScriptedTransport::new(echo_device());
        transport.state = ConnectionState::Disconnected;
        let mut exec = executor(transport);

        assert_eq!(
            exec.run(&Operation::write_one(1531, 2300), None).await,
            Err(ModbusError::NotConnected)
        );
        assert!(exec.transport().sent.lock().unwrap().is_empty());

        exec.connect().await.unwrap();
        assert_eq!(
            exec.run(&Operation::write_one(1531, 2300), None).await,
            Ok(ExchangeValue::Written { address: 1531, value: 2300 })
        );
    }
}

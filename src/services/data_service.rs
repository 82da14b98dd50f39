use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use super::liveness::{spawn_supervisor, LivenessMonitor};
use super::scheduler::{ConnectionEvent, IoScheduler, ReadOutcome, SchedulerChannels, SchedulerHandle, WriteOutcome};
use crate::config::Config;
use crate::devices::spectrum::HEADER_REGISTERS;
use crate::devices::{ParameterTable, PollGroup, SpectrumDecoder, SpectrumLayout};
use crate::modbus::connection::{Connection, ConnectionParams, ConnectionState, Transport};
use crate::modbus::executor::RequestExecutor;
use crate::modbus::protocol::{ExchangeValue, Operation, RegisterTable};
use crate::output::formatter_for;
use crate::storage::{CachedValue, RegisterCache, ValueChange};
use crate::utils::error::ModbusError;

const SPECTRUM_KEY: &str = "spectrum";
const SPECTRUM_HEADER_KEY: &str = "spectrum.header";
const SPECTRUM_SAMPLES_KEY: &str = "spectrum.samples";

/// Builds a transport for the current connection settings.
pub type TransportFactory<T> = Box<dyn Fn(ConnectionParams) -> T + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn group_operation(group: &PollGroup, max_chunk: u16) -> Operation {
    if group.count == 1 {
        Operation::ReadOne {
            table: group.table,
            address: group.address,
        }
    } else {
        Operation::ReadMany {
            table: group.table,
            address: group.address,
            count: group.count,
            max_chunk,
        }
    }
}

/// Applies read outcomes to the cache.
struct ReadSink {
    cache: Arc<Mutex<RegisterCache>>,
    parameters: Arc<ParameterTable>,
    groups: HashMap<String, PollGroup>,
    spectrum: Arc<Mutex<SpectrumDecoder>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    pending_header: Option<Vec<u16>>,
}

impl ReadSink {
    fn handle(&mut self, outcome: ReadOutcome) {
        match outcome.key.as_str() {
            SPECTRUM_HEADER_KEY => {
                self.pending_header = match outcome.result {
                    Ok(value) => Some(value.registers()),
                    Err(e) => {
                        debug!("Spectrum header read failed: {}", e);
                        None
                    }
                };
            }
            SPECTRUM_SAMPLES_KEY => {
                lock(&self.in_flight).remove(SPECTRUM_KEY);
                match (self.pending_header.take(), outcome.result) {
                    (Some(header), Ok(samples)) => self.apply_spectrum(&header, &samples.registers()),
                    (None, Ok(_)) => debug!("Spectrum samples arrived without a header, dropped"),
                    (_, Err(e)) => debug!("Spectrum samples read failed: {}", e),
                }
            }
            key => {
                lock(&self.in_flight).remove(key);
                let group = match self.groups.get(key) {
                    Some(group) => group,
                    None => {
                        debug!("Ignoring read result for '{}'", key);
                        return;
                    }
                };
                match outcome.result {
                    Ok(value) => self.apply_group(group, &value.registers()),
                    Err(e) => debug!("Poll of '{}' failed: {}", key, e),
                }
            }
        }
    }

    fn apply_group(&self, group: &PollGroup, registers: &[u16]) {
        let now = Instant::now();
        let mut cache = lock(&self.cache);
        cache.record_words(group.address, registers);
        for spec in self.parameters.in_group(&group.name) {
            match spec.decode(group.address, registers) {
                Ok(value) => {
                    cache.apply_polled(&spec.key, value, now);
                }
                Err(e) => debug!("Could not decode '{}': {}", spec.key, e),
            }
        }
    }

    fn apply_spectrum(&self, header: &[u16], samples: &[u16]) {
        let frame = match lock(&self.spectrum).decode(header, samples) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Spectrum block rejected: {}", e);
                return;
            }
        };
        let now = Instant::now();
        let mut cache = lock(&self.cache);
        for (key, value) in frame.cache_values() {
            cache.apply_polled(&key, value, now);
        }
    }
}

/// Owns the I/O worker and wires polling, writes and liveness to the cache.
pub struct DataService<T: Transport + 'static = Connection> {
    config: Config,
    scheduler: SchedulerHandle<T>,
    channels: Option<SchedulerChannels>,
    worker: Option<JoinHandle<()>>,
    cache: Arc<Mutex<RegisterCache>>,
    parameters: Arc<ParameterTable>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    spectrum: Arc<Mutex<SpectrumDecoder>>,
    session: watch::Sender<bool>,
    pollers: Option<watch::Sender<bool>>,
    pollers_active: watch::Receiver<bool>,
    /// Current `host:port`, shared with the event consumer.
    target: Arc<Mutex<String>>,
    factory: TransportFactory<T>,
    tasks: Vec<JoinHandle<()>>,
}

impl DataService<Connection> {
    /// Must be called inside a Tokio runtime; the I/O worker is spawned here.
    pub fn new(config: Config) -> Result<Self, ModbusError> {
        Self::with_transport(config, Box::new(Connection::new))
    }
}

impl<T: Transport + 'static> DataService<T> {
    pub fn with_transport(config: Config, factory: TransportFactory<T>) -> Result<Self, ModbusError> {
        config.validate()?;
        info!("🚀 Initializing Data Service");
        info!(
            "📡 Target {}:{} unit {} via {:?}",
            config.connection.host, config.connection.port, config.connection.unit_id, config.connection.framers
        );
        info!(
            "📋 {} poll groups, {} parameters, spectrum {}",
            config.groups.len(),
            config.parameters.len(),
            if config.spectrum.enabled { "enabled" } else { "disabled" }
        );

        let transport = factory(config.connection_params());
        let executor = RequestExecutor::new(transport, config.retry_policy(), config.operation_timeouts());
        let (scheduler, channels, worker) = IoScheduler::spawn(executor);
        let (session, _) = watch::channel(false);
        let (pollers, pollers_active) = watch::channel(true);

        Ok(Self {
            cache: Arc::new(Mutex::new(RegisterCache::new(config.write_suppression()))),
            parameters: Arc::new(ParameterTable::new(config.parameters.clone())),
            target: Arc::new(Mutex::new(config.connection_params().address())),
            config,
            scheduler,
            channels: Some(channels),
            worker: Some(worker),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            spectrum: Arc::new(Mutex::new(SpectrumDecoder::new())),
            session,
            pollers: Some(pollers),
            pollers_active,
            factory,
            tasks: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ValueChange> {
        lock(&self.cache).subscribe()
    }

    pub fn value(&self, key: &str) -> Option<CachedValue> {
        lock(&self.cache).value(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CachedValue> {
        lock(&self.cache).snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.scheduler.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.scheduler.state()
    }

    /// The `host:port` the link is configured for.
    pub fn target(&self) -> String {
        lock(&self.target).clone()
    }

    /// Spawns the outcome consumers, the poller and the liveness supervisor.
    pub fn start(&mut self) -> Result<(), ModbusError> {
        let channels = self
            .channels
            .take()
            .ok_or_else(|| ModbusError::Internal("data service already started".to_string()))?;
        let pollers = self
            .pollers
            .take()
            .ok_or_else(|| ModbusError::Internal("data service already started".to_string()))?;

        self.tasks.push(self.spawn_read_consumer(channels.reads));
        self.tasks.push(self.spawn_write_consumer(channels.writes));
        self.tasks.push(self.spawn_event_consumer(channels.events));
        self.tasks.push(self.spawn_poller());
        self.tasks.push(spawn_supervisor(
            LivenessMonitor::new(self.config.liveness_settings()),
            self.scheduler.clone(),
            self.session.subscribe(),
            pollers,
        ));
        info!("✅ Data Service started");
        Ok(())
    }

    pub async fn connect(&self) -> Result<(), ModbusError> {
        self.session.send_replace(true);
        lock(&self.spectrum).reset();
        self.scheduler.connect().await
    }

    /// Drops the link and clears every cached value.
    pub async fn disconnect(&self) -> Result<(), ModbusError> {
        self.session.send_replace(false);
        self.scheduler.disconnect().await?;
        self.reset_values();
        info!("🔌 Disconnected from {}", self.config.connection_params().address());
        Ok(())
    }

    /// Swaps connection settings. The old link is closed and acknowledged
    /// before the new transport is installed.
    pub async fn reconfigure(&mut self, host: &str, port: u16, unit_id: u8, reconnect: bool) -> Result<(), ModbusError> {
        let mut updated = self.config.clone();
        updated.connection.host = host.to_string();
        updated.connection.port = port;
        updated.connection.unit_id = unit_id;
        updated.validate()?;

        self.session.send_replace(false);
        let transport = (self.factory)(updated.connection_params());
        self.scheduler.reconfigure(transport).await?;
        *lock(&self.target) = updated.connection_params().address();
        self.config = updated;
        self.reset_values();
        info!("🔧 Reconfigured for {}:{} unit {}", host, port, unit_id);

        if reconnect {
            self.connect().await?;
        }
        Ok(())
    }

    /// Queues a write of a named parameter. The cache shows the requested
    /// value at once; the device confirms it asynchronously. Bit fields are
    /// read and rewritten by the I/O worker, never from cached words.
    pub fn write_parameter(&self, key: &str, value: f64) -> Result<(), ModbusError> {
        let spec = self.parameters.get(key)?;
        let table = spec
            .group
            .as_deref()
            .and_then(|name| self.config.groups.iter().find(|group| group.name == name))
            .map_or(RegisterTable::Input, |group| group.table);
        let op = spec.write_operation(value, table)?;
        if !self.scheduler.is_connected() {
            return Err(ModbusError::NotConnected);
        }

        lock(&self.cache).begin_pending_write(key, spec.written_value(value), Instant::now());
        info!("✏️  Writing {} = {} ({})", key, value, op);
        let submitted = self
            .scheduler
            .submit_write(key, op, Some(json!({ "value": value })), None);
        if submitted.is_err() {
            lock(&self.cache).release_suppression(key);
        }
        submitted
    }

    /// Connects, polls and prints value changes until Ctrl-C.
    pub async fn run(&mut self) -> Result<(), ModbusError> {
        self.start()?;
        let formatter = formatter_for(&self.config.output.format);
        print!("{}", formatter.format_header());

        let mut changes = self.subscribe();
        if let Err(e) = self.connect().await {
            warn!("⚠️  Initial connect failed: {}, retrying", e);
        }

        let mut retry = interval(self.config.liveness_settings().reconnect_cooldown);
        retry.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let liveness = self.scheduler.liveness();
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) => println!("{}", formatter.format_change(&change)),
                    Err(RecvError::Lagged(skipped)) => warn!("⚠️  Output lagged, {} changes skipped", skipped),
                    Err(RecvError::Closed) => break,
                },
                _ = retry.tick() => {
                    // the supervisor takes over once the link has worked at least once
                    let never_connected = liveness.borrow().last_success.is_none();
                    if never_connected && !self.scheduler.is_connected() {
                        debug!("Retrying initial connect");
                        self.scheduler.request_connect()?;
                    }
                }
                _ = &mut shutdown => {
                    info!("🛑 Shutdown requested");
                    break;
                }
            }
        }

        if self.config.output.show_snapshot_on_exit {
            println!("{}", formatter.format_snapshot(&self.snapshot()));
        }
        self.disconnect().await?;
        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.scheduler.shutdown();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("❌ I/O worker ended abnormally: {}", e);
            }
        }
    }

    fn reset_values(&self) {
        lock(&self.in_flight).clear();
        lock(&self.spectrum).reset();
        lock(&self.cache).clear();
    }

    fn spawn_read_consumer(&self, mut reads: mpsc::UnboundedReceiver<ReadOutcome>) -> JoinHandle<()> {
        let mut sink = ReadSink {
            cache: self.cache.clone(),
            parameters: self.parameters.clone(),
            groups: self
                .config
                .groups
                .iter()
                .map(|group| (group.name.clone(), group.clone()))
                .collect(),
            spectrum: self.spectrum.clone(),
            in_flight: self.in_flight.clone(),
            pending_header: None,
        };
        tokio::spawn(async move {
            while let Some(outcome) = reads.recv().await {
                sink.handle(outcome);
            }
        })
    }

    fn spawn_write_consumer(&self, mut writes: mpsc::UnboundedReceiver<WriteOutcome>) -> JoinHandle<()> {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            while let Some(outcome) = writes.recv().await {
                match outcome.result {
                    Ok(ExchangeValue::Written { address, value }) => {
                        info!("✅ Write of '{}' confirmed ({})", outcome.key, outcome.op);
                        lock(&cache).record_words(address, &[value]);
                    }
                    Ok(_) => info!("✅ Write of '{}' confirmed ({})", outcome.key, outcome.op),
                    Err(e) => {
                        warn!("⚠️  Write of '{}' failed: {}", outcome.key, e);
                        lock(&cache).release_suppression(&outcome.key);
                    }
                }
            }
        })
    }

    fn spawn_event_consumer(&self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) -> JoinHandle<()> {
        let spectrum = self.spectrum.clone();
        let target = self.target.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::Connected => {
                        info!("✅ Connected to {}", lock(&target));
                        lock(&spectrum).reset();
                    }
                    ConnectionEvent::ConnectFailed(reason) => error!("❌ Connect failed: {}", reason),
                    ConnectionEvent::Disconnected => debug!("Link closed"),
                    ConnectionEvent::Lost(reason) => warn!("⚠️  Connection lost: {}", reason),
                }
            }
        })
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let in_flight = self.in_flight.clone();
        let pollers_active = self.pollers_active.clone();
        let groups: Vec<PollGroup> = self.config.groups.iter().filter(|g| g.enabled).cloned().collect();
        let spectrum = self.config.spectrum.clone();
        let poll_interval = self.config.poll_interval();
        let max_chunk = self.config.timing.max_chunk;

        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_polled: HashMap<String, Instant> = HashMap::new();

            loop {
                ticker.tick().await;
                if !*pollers_active.borrow() || !scheduler.is_connected() {
                    continue;
                }

                let now = Instant::now();
                let mut due = |name: &str, every: Duration| {
                    let ready = last_polled
                        .get(name)
                        .map_or(true, |at| now.saturating_duration_since(*at) >= every);
                    // skip while the previous read is still queued
                    if ready && lock(&in_flight).insert(name.to_string()) {
                        last_polled.insert(name.to_string(), now);
                        true
                    } else {
                        false
                    }
                };

                let mut submissions = Vec::new();
                for group in &groups {
                    let every = group.interval_ms.map(Duration::from_millis).unwrap_or(poll_interval);
                    if due(&group.name, every) {
                        submissions.push((group.name.clone(), group_operation(group, max_chunk)));
                    }
                }
                if spectrum.enabled && due(SPECTRUM_KEY, Duration::from_millis(spectrum.interval_ms)) {
                    submissions.extend(spectrum_operations(&spectrum, max_chunk));
                }

                for (key, op) in submissions {
                    if let Err(e) = scheduler.submit_read(&key, op, None) {
                        debug!("Poller stopping: {}", e);
                        return;
                    }
                }
            }
        })
    }
}

fn spectrum_operations(layout: &SpectrumLayout, max_chunk: u16) -> Vec<(String, Operation)> {
    let read = |address, count| Operation::ReadMany {
        table: RegisterTable::Input,
        address,
        count,
        max_chunk,
    };
    vec![
        (SPECTRUM_HEADER_KEY.to_string(), read(layout.header_address, HEADER_REGISTERS)),
        (SPECTRUM_SAMPLES_KEY.to_string(), read(layout.samples_address, layout.sample_count)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::executor::mock::{echo_device, Responder, ScriptedTransport};
    use crate::modbus::float::WordOrder;
    use crate::modbus::frame::build_exception_response;
    use crate::modbus::frame::build_read_response;
    use crate::modbus::protocol::FN_WRITE_SINGLE_REGISTER;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.spectrum.enabled = false;
        config
    }

    fn service_with(responder: fn() -> Responder) -> (DataService<ScriptedTransport>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let factory: TransportFactory<ScriptedTransport> = Box::new(move |_params| {
            let mut transport = ScriptedTransport::new(responder());
            transport.state = ConnectionState::Disconnected;
            transport.sent = log.clone();
            transport
        });
        let mut service = DataService::with_transport(test_config(), factory).unwrap();
        service.start().unwrap();
        (service, sent)
    }

    fn rejecting_writes() -> Responder {
        let mut echo = echo_device();
        Box::new(move |frame: &[u8]| {
            if frame[1] == FN_WRITE_SINGLE_REGISTER {
                Ok(build_exception_response(frame[0], FN_WRITE_SINGLE_REGISTER, 4))
            } else {
                echo(frame)
            }
        })
    }

    /// Keeps written registers and reads back zero otherwise. Refuses the
    /// first write it sees.
    fn latching_device_refusing_first_write() -> Responder {
        let mut registers: HashMap<u16, u16> = HashMap::new();
        let mut writes = 0;
        Box::new(move |frame: &[u8]| {
            let address = u16::from_be_bytes([frame[2], frame[3]]);
            let operand = u16::from_be_bytes([frame[4], frame[5]]);
            if frame[1] == FN_WRITE_SINGLE_REGISTER {
                writes += 1;
                if writes == 1 {
                    return Ok(build_exception_response(frame[0], FN_WRITE_SINGLE_REGISTER, 4));
                }
                registers.insert(address, operand);
                return Ok(frame.to_vec());
            }
            let values: Vec<u16> = (0..operand)
                .map(|i| registers.get(&address.wrapping_add(i)).copied().unwrap_or(0))
                .collect();
            Ok(build_read_response(frame[0], frame[1], &values))
        })
    }

    fn written_values(sent: &Mutex<Vec<Vec<u8>>>) -> Vec<u16> {
        sent.lock()
            .unwrap()
            .iter()
            .filter(|frame| frame[1] == FN_WRITE_SINGLE_REGISTER)
            .map(|frame| u16::from_be_bytes([frame[4], frame[5]]))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_decodes_groups_into_cache() {
        let (service, _) = service_with(echo_device);
        service.connect().await.unwrap();
        sleep(Duration::from_millis(350)).await;

        // echo device answers 1021 = 0b11_1111_1101
        assert_eq!(service.value("relay_1"), Some(CachedValue::Flag(true)));
        assert_eq!(service.value("relay_2"), Some(CachedValue::Flag(false)));
        assert_eq!(service.value("chiller_temperature"), Some(CachedValue::Number(15.11)));
        assert_eq!(service.value("chiller_setpoint"), None);
        // 1020 is read from the holding table: 0b11_1111_1100
        assert_eq!(service.value("external_relay_1"), Some(CachedValue::Flag(false)));
        assert_eq!(service.value("external_relay_3"), Some(CachedValue::Flag(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_shows_requested_value_until_suppression_ends() {
        let (service, sent) = service_with(echo_device);
        service.connect().await.unwrap();
        sleep(Duration::from_millis(350)).await;

        service.write_parameter("relay_2", 1.0).unwrap();
        assert_eq!(service.value("relay_2"), Some(CachedValue::Flag(true)));

        sleep(Duration::from_millis(10)).await;
        let write = sent
            .lock()
            .unwrap()
            .iter()
            .find(|frame| frame[1] == FN_WRITE_SINGLE_REGISTER)
            .cloned()
            .unwrap();
        assert_eq!(u16::from_be_bytes([write[2], write[3]]), 1021);
        assert_eq!(u16::from_be_bytes([write[4], write[5]]), 1021 | 0b10);

        // the poll at 600 ms is suppressed
        sleep(Duration::from_millis(340)).await;
        assert_eq!(service.value("relay_2"), Some(CachedValue::Flag(true)));

        // the echo device never latches the bit, so the poll at 900 ms restores it
        sleep(Duration::from_millis(300)).await;
        assert_eq!(service.value("relay_2"), Some(CachedValue::Flag(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_releases_suppression() {
        let (service, _) = service_with(rejecting_writes);
        service.connect().await.unwrap();
        sleep(Duration::from_millis(350)).await;

        service.write_parameter("relay_2", 1.0).unwrap();
        assert_eq!(service.value("relay_2"), Some(CachedValue::Flag(true)));

        // next poll at 600 ms, well inside the 500 ms window opened at 350 ms
        sleep(Duration::from_millis(300)).await;
        assert_eq!(service.value("relay_2"), Some(CachedValue::Flag(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_bit_is_not_carried_into_next_write() {
        let (service, sent) = service_with(latching_device_refusing_first_write);
        service.connect().await.unwrap();
        sleep(Duration::from_millis(350)).await;
        assert_eq!(service.value("relay_2"), Some(CachedValue::Flag(false)));

        // both queued before the device answers the first
        service.write_parameter("relay_2", 1.0).unwrap();
        service.write_parameter("relay_3", 1.0).unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(written_values(&sent), vec![0b010, 0b100]);

        // once the window closes the polls show what the device latched
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(service.value("relay_2"), Some(CachedValue::Flag(false)));
        assert_eq!(service.value("relay_3"), Some(CachedValue::Flag(true)));
        assert_eq!(lock(&service.cache).word(1021), Some(0b100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bit_write_reads_word_in_worker() {
        let (service, sent) = service_with(latching_device_refusing_first_write);
        service.connect().await.unwrap();

        // the read that feeds the write runs right before it in the worker
        service.write_parameter("fan_1", 1.0).unwrap();
        sleep(Duration::from_millis(10)).await;
        let frames = sent.lock().unwrap().clone();
        let write_at = frames
            .iter()
            .position(|frame| frame[1] == FN_WRITE_SINGLE_REGISTER)
            .unwrap();
        let before = &frames[write_at - 1];
        assert_eq!(u16::from_be_bytes([before[2], before[3]]), 1131);
        assert_eq!(written_values(&sent), vec![0b1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_rejections() {
        let (service, _) = service_with(echo_device);

        assert_eq!(service.write_parameter("relay_1", 1.0), Err(ModbusError::NotConnected));
        assert_eq!(
            service.write_parameter("external_relay_1", 1.0),
            Err(ModbusError::NotWritable("external_relay_1".into()))
        );
        assert_eq!(
            service.write_parameter("warp_drive", 1.0),
            Err(ModbusError::UnknownParameter("warp_drive".into()))
        );
        assert_eq!(
            service.write_parameter("chiller_temperature", 20.0),
            Err(ModbusError::NotWritable("chiller_temperature".into()))
        );
        assert_eq!(service.write_parameter("chiller_setpoint", 20.0), Err(ModbusError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_values_and_publishes_reset() {
        let (service, _) = service_with(echo_device);
        service.connect().await.unwrap();
        sleep(Duration::from_millis(350)).await;
        assert!(!service.snapshot().is_empty());

        let mut changes = service.subscribe();
        service.disconnect().await.unwrap();
        assert!(service.snapshot().is_empty());
        assert!(!service.is_connected());
        assert!(matches!(changes.recv().await, Ok(ValueChange::Reset { .. })));

        // no polling while disconnected
        sleep(Duration::from_millis(1000)).await;
        assert!(service.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_installs_fresh_transport() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let factory: TransportFactory<ScriptedTransport> = Box::new(move |params| {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut transport = ScriptedTransport::new(echo_device());
            transport.state = ConnectionState::Disconnected;
            transport.unit = params.unit_id;
            transport
        });
        let mut service = DataService::with_transport(test_config(), factory).unwrap();
        service.start().unwrap();
        service.connect().await.unwrap();

        service.reconfigure("10.0.0.9", 1502, 3, false).await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(service.config().connection.host, "10.0.0.9");
        assert_eq!(service.target(), "10.0.0.9:1502");
        assert_eq!(service.state(), ConnectionState::Disconnected);

        service.reconfigure("10.0.0.9", 1502, 4, true).await.unwrap();
        assert!(service.is_connected());

        assert!(matches!(
            service.reconfigure("10.0.0.9", 1502, 0, false).await,
            Err(ModbusError::ConfigError(_))
        ));
    }

    #[test]
    fn test_spectrum_outcomes_decode_as_one_block() {
        let cache = Arc::new(Mutex::new(RegisterCache::new(Duration::from_millis(500))));
        let in_flight = Arc::new(Mutex::new(HashSet::from([SPECTRUM_KEY.to_string()])));
        let mut sink = ReadSink {
            cache: cache.clone(),
            parameters: Arc::new(ParameterTable::default()),
            groups: HashMap::new(),
            spectrum: Arc::new(Mutex::new(SpectrumDecoder::new())),
            in_flight: in_flight.clone(),
            pending_header: None,
        };

        let mut header = vec![2u16];
        for value in [900.0f32, 1700.0, 0.0, 50.0, 1300.0, 1299.5, 12.0] {
            let (first, second) = WordOrder::Dcba.encode(value);
            header.extend([first, second]);
        }
        sink.handle(ReadOutcome {
            key: SPECTRUM_HEADER_KEY.to_string(),
            result: Ok(ExchangeValue::Registers(header)),
        });
        assert!(lock(&cache).is_empty());

        sink.handle(ReadOutcome {
            key: SPECTRUM_SAMPLES_KEY.to_string(),
            result: Ok(ExchangeValue::Registers(vec![7; 58])),
        });
        let cache = lock(&cache);
        assert_eq!(cache.value("spectrum_status"), Some(&CachedValue::Word(2)));
        assert_eq!(cache.value("spectrum_x_min"), Some(&CachedValue::Number(900.0)));
        assert_eq!(cache.value("spectrum_x_max"), Some(&CachedValue::Number(1700.0)));
        assert!(matches!(cache.value("spectrum_samples"), Some(CachedValue::Series(s)) if s.len() == 58));
        assert!(lock(&in_flight).is_empty());
    }

    #[test]
    fn test_group_operation_uses_single_read_for_one_register() {
        let single = PollGroup::new("relays", 1021, 1);
        assert_eq!(group_operation(&single, 10), Operation::read_one(1021));

        let block = PollGroup::new("block", 400, 15);
        assert_eq!(
            group_operation(&block, 10),
            Operation::ReadMany {
                table: RegisterTable::Input,
                address: 400,
                count: 15,
                max_chunk: 10
            }
        );
    }
}

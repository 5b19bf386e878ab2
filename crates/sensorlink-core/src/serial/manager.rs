//! Connection management
//!
//! Runs the connection lifecycle for one sensor device: open, watch, recover,
//! and move to a better port when one shows up.
//!
//! A single task owns every piece of mutable state. Control calls on
//! [`ConnectionManager`] are messages into that task, and so are open results,
//! reader events and timer firings, which keeps every transition serialized.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use super::{is_known_device, select_best, LineCodec, LinkError, SerialBackend, SerialIo};
use crate::config::{ConfigError, ConnectionConfig};
use crate::decode::{DecodedRecord, FrameDecoder, RecordValidator};
use crate::events::{EventSink, LinkEvent, ReconnectStatus};
use crate::store::PersistenceGateway;

/// Records waiting for the persistence worker; newer ones are dropped past this
const STORE_QUEUE_CAPACITY: usize = 1024;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No port held
    Disconnected,
    /// Open attempt in flight
    Connecting,
    /// Port open and reader attached
    Connected,
    /// Waiting for the reconnection timer
    Reconnecting,
    /// Closing the current port to move to a better one
    SwitchingPorts,
    /// Last attempt failed, or the attempt cap was reached
    Error,
}

impl ConnectionState {
    /// Name used in logs and serialized events
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::SwitchingPorts => "switching_ports",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of the currently held port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortStatus {
    /// Port path
    pub path: String,
    /// Configured baud rate
    pub baud_rate: u32,
    /// Whether the handle is open
    pub is_open: bool,
    /// Whether the port matched a device signature
    pub is_preferred: bool,
}

/// Snapshot returned by [`ConnectionManager::status`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    /// Current state
    pub state: ConnectionState,
    /// Whether a port is open
    pub is_connected: bool,
    /// Held port, if any
    pub port: Option<PortStatus>,
    /// Consecutive reconnection attempts since the last successful open
    pub reconnect_attempts: u32,
    /// Configured attempt cap
    pub max_reconnect_attempts: u32,
    /// Whether auto-reconnection is enabled
    pub auto_reconnect: bool,
    /// Wall-clock time of the last received line
    pub last_data_received: Option<DateTime<Utc>>,
    /// Whether the held port matched a device signature
    pub is_preferred_port: bool,
    /// Path of the held port
    pub current_port_path: Option<String>,
    /// Whether hot-swapping to better ports is enabled
    pub dynamic_port_switching: bool,
}

/// Control messages from [`ConnectionManager`] handles
enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    ForceReconnect,
    Send(String),
    Status(oneshot::Sender<LinkStatus>),
    SetDynamicPortSwitching(bool),
    ScanForBetterPorts(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Events produced by tasks the manager spawned
enum Internal {
    Opened {
        attempt: u64,
        outcome: Result<OpenedPort, LinkError>,
    },
    Line {
        session: u64,
        line: String,
    },
    ReaderClosed {
        session: u64,
        error: Option<String>,
    },
}

/// How the open task picks its port
enum OpenRequest {
    /// Operator-pinned path
    Fixed(String),
    /// Run discovery and take the best candidate
    Discover,
    /// A path that already matched a device signature
    Preferred(String),
}

struct OpenedPort {
    io: Box<dyn SerialIo>,
    path: String,
    preferred: bool,
}

struct PendingOpen {
    attempt: u64,
    task: JoinHandle<()>,
    /// Set when this attempt is the second half of a port switch
    switch: Option<PortSwitch>,
}

struct PortSwitch {
    from: Option<String>,
    to: String,
}

struct ActiveLink {
    session: u64,
    path: String,
    writer: WriteHalf<Box<dyn SerialIo>>,
    reader: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct SessionInfo {
    current_port_path: Option<String>,
    is_preferred_port: bool,
    reconnect_attempts: u32,
    last_data_received_at: Option<DateTime<Utc>>,
}

/// A record that passed validation, on its way to storage
struct PendingRecord {
    table: String,
    record: DecodedRecord,
    port: Option<String>,
}

/// Handle to a running connection manager.
///
/// Cloning the handle is cheap; all clones talk to the same manager task.
/// Outcomes of control calls are reported through the [`EventSink`] given to
/// [`ConnectionManager::spawn`], never returned as errors, except
/// [`LinkError::ManagerClosed`] once the manager has shut down.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionManager {
    /// Validate `config` and start the manager task.
    ///
    /// Must be called from within a Tokio runtime. The manager starts
    /// `Disconnected`; call [`ConnectionManager::connect`] to begin.
    pub fn spawn(
        config: ConnectionConfig,
        backend: Arc<dyn SerialBackend>,
        gateway: Arc<dyn PersistenceGateway>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let decoder = FrameDecoder::new(&config)?;
        let validator = RecordValidator::from_config(&config);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (store_tx, store_rx) = mpsc::channel(STORE_QUEUE_CAPACITY);

        let store_worker = tokio::spawn(persist_records(
            store_rx,
            gateway,
            validator.clone(),
            sink.clone(),
        ));

        let engine = Engine {
            config,
            backend,
            sink,
            decoder,
            validator,
            state: ConnectionState::Disconnected,
            session: SessionInfo::default(),
            intentional: false,
            link: None,
            pending: None,
            next_attempt: 0,
            next_session: 0,
            last_data: Instant::now(),
            reconnect_at: None,
            health: None,
            scan: None,
            internal_tx,
            store_tx: Some(store_tx),
            store_worker: Some(store_worker),
        };
        tokio::spawn(engine.run(command_rx, internal_rx));

        Ok(Self {
            commands: command_tx,
        })
    }

    /// Start connecting. Ignored while an open attempt is already in flight.
    pub fn connect(&self) -> Result<(), LinkError> {
        self.send(Command::Connect)
    }

    /// Close the port and stop all automatic reconnection. The manager stays
    /// usable; a later [`ConnectionManager::connect`] starts a new session.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        self.request(Command::Disconnect).await
    }

    /// Reset the attempt counter, drop the current port and connect afresh
    pub fn force_reconnect(&self) -> Result<(), LinkError> {
        self.send(Command::ForceReconnect)
    }

    /// Write `payload` followed by a newline to the device
    pub fn send_data(&self, payload: impl Into<String>) -> Result<(), LinkError> {
        self.send(Command::Send(payload.into()))
    }

    /// Current state and session details
    pub async fn status(&self) -> Result<LinkStatus, LinkError> {
        self.request(Command::Status).await
    }

    /// Turn hot-swapping to better ports on or off
    pub fn set_dynamic_port_switching(&self, enabled: bool) -> Result<(), LinkError> {
        self.send(Command::SetDynamicPortSwitching(enabled))
    }

    /// Run one scan for a better port now, if dynamic switching is enabled
    pub async fn scan_for_better_ports(&self) -> Result<(), LinkError> {
        self.request(Command::ScanForBetterPorts).await
    }

    /// Disconnect, flush pending records to storage and stop the manager
    pub async fn close(self) -> Result<(), LinkError> {
        self.request(Command::Close).await
    }

    /// Whether the manager task is still running
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), LinkError> {
        self.commands
            .send(command)
            .map_err(|_| LinkError::ManagerClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| LinkError::ManagerClosed)
    }
}

/// State owned by the manager task
struct Engine {
    config: ConnectionConfig,
    backend: Arc<dyn SerialBackend>,
    sink: Arc<dyn EventSink>,
    decoder: FrameDecoder,
    validator: RecordValidator,
    state: ConnectionState,
    session: SessionInfo,
    /// Set by disconnect/close; suppresses automatic reconnection
    intentional: bool,
    link: Option<ActiveLink>,
    pending: Option<PendingOpen>,
    next_attempt: u64,
    next_session: u64,
    last_data: Instant,
    reconnect_at: Option<Instant>,
    health: Option<Interval>,
    scan: Option<Interval>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    store_tx: Option<mpsc::Sender<PendingRecord>>,
    store_worker: Option<JoinHandle<()>>,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All manager handles dropped, shutting down");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event),
                _ = sleep_until(self.reconnect_at) => self.on_reconnect_timer(),
                _ = tick(&mut self.health) => self.on_health_check(),
                _ = tick(&mut self.scan) => self.scan_for_better_port().await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect(done) => {
                self.disconnect("Intentionally disconnected").await;
                let _ = done.send(());
            }
            Command::ForceReconnect => self.force_reconnect().await,
            Command::Send(payload) => self.send_data(payload).await,
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::SetDynamicPortSwitching(enabled) => self.set_dynamic_port_switching(enabled),
            Command::ScanForBetterPorts(done) => {
                if self.config.enable_dynamic_port_switching {
                    self.scan_for_better_port().await;
                } else {
                    info!("Dynamic port switching is disabled");
                }
                let _ = done.send(());
            }
            // Handled by the run loop
            Command::Close(done) => {
                let _ = done.send(());
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Opened { attempt, outcome } => self.on_opened(attempt, outcome),
            Internal::Line { session, line } => self.on_line(session, line),
            Internal::ReaderClosed { session, error } => self.on_reader_closed(session, error),
        }
    }

    fn emit(&self, event: LinkEvent) {
        self.sink.notify(event);
    }

    fn set_state(&mut self, state: ConnectionState, message: impl Into<String>) {
        if self.state == state {
            return;
        }
        let message = message.into();
        if message.is_empty() {
            info!("Serial state changed: {} -> {}", self.state, state);
        } else {
            info!("Serial state changed: {} -> {}: {}", self.state, state, message);
        }
        self.state = state;
        self.emit(LinkEvent::status(state, message));
    }

    fn is_current(&self, session: u64) -> bool {
        self.link.as_ref().is_some_and(|l| l.session == session)
    }

    fn connect(&mut self) {
        if self.pending.is_some() {
            debug!("Connection already in progress...");
            return;
        }
        if let Some(link) = &self.link {
            debug!("Already connected to {}", link.path);
            return;
        }

        self.intentional = false;
        self.cancel_reconnection();
        self.set_state(ConnectionState::Connecting, "Initiating connection...");

        let request = match &self.config.port_path {
            Some(path) => OpenRequest::Fixed(path.clone()),
            None => OpenRequest::Discover,
        };
        self.begin_open(request, None);
    }

    fn begin_open(&mut self, request: OpenRequest, switch: Option<PortSwitch>) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let backend = self.backend.clone();
        let baud_rate = self.config.baud_rate;
        let timeout = self.config.connection_timeout();
        let tx = self.internal_tx.clone();

        let task = tokio::spawn(async move {
            let outcome = open_port(backend.as_ref(), request, baud_rate, timeout).await;
            let _ = tx.send(Internal::Opened { attempt, outcome });
        });

        self.pending = Some(PendingOpen {
            attempt,
            task,
            switch,
        });
    }

    fn abandon_pending_open(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Abandoning open attempt {}", pending.attempt);
            pending.task.abort();
        }
    }

    fn on_opened(&mut self, attempt: u64, outcome: Result<OpenedPort, LinkError>) {
        let Some(pending) = self.pending.take() else {
            debug!("Ignoring result of abandoned open attempt {attempt}");
            return;
        };
        if pending.attempt != attempt {
            debug!("Ignoring result of abandoned open attempt {attempt}");
            self.pending = Some(pending);
            return;
        }

        match outcome {
            Ok(port) => self.on_open_success(port, pending.switch),
            Err(e) => self.on_open_failure(e, pending.switch),
        }
    }

    fn on_open_success(&mut self, port: OpenedPort, switch: Option<PortSwitch>) {
        let OpenedPort {
            io,
            path,
            preferred,
        } = port;
        info!("Port {path} opened successfully.");

        let (reader, writer) = tokio::io::split(io);
        self.next_session += 1;
        let session = self.next_session;
        let reader = tokio::spawn(read_lines(
            reader,
            LineCodec::new(&self.config.line_delimiter),
            session,
            self.internal_tx.clone(),
        ));

        self.link = Some(ActiveLink {
            session,
            path: path.clone(),
            writer,
            reader,
        });
        self.session = SessionInfo {
            current_port_path: Some(path.clone()),
            is_preferred_port: preferred,
            reconnect_attempts: 0,
            last_data_received_at: Some(Utc::now()),
        };
        self.last_data = Instant::now();

        self.set_state(ConnectionState::Connected, format!("Connected to {path}"));

        if let Some(switch) = switch {
            info!("Successfully switched to port: {}", switch.to);
            self.emit(LinkEvent::PortSwitched {
                old_port: switch.from,
                new_port: switch.to,
                timestamp: Utc::now(),
            });
        }

        self.start_health_monitoring();
        if self.config.enable_dynamic_port_switching && !self.config.is_pinned() {
            self.start_port_scanning();
        }
    }

    fn on_open_failure(&mut self, e: LinkError, switch: Option<PortSwitch>) {
        let message = match &switch {
            Some(switch) => format!("Failed to switch to port {}: {e}", switch.to),
            None => format!("Connection failed: {e}"),
        };
        error!("{message}");

        self.set_state(ConnectionState::Error, message.clone());
        self.emit(LinkEvent::error(message));

        if self.config.auto_reconnect && !self.intentional {
            self.schedule_reconnection();
        }
    }

    fn on_line(&mut self, session: u64, line: String) {
        if !self.is_current(session) {
            return;
        }
        self.last_data = Instant::now();
        self.session.last_data_received_at = Some(Utc::now());

        let raw = line.trim();
        if raw.is_empty() {
            debug!("Skipping empty data");
            return;
        }
        debug!("Serial raw: {raw}");

        self.emit(LinkEvent::DataReceived {
            raw: raw.to_string(),
            port: self.session.current_port_path.clone(),
            timestamp: Utc::now(),
        });

        self.process_line(raw);
    }

    fn process_line(&mut self, raw: &str) {
        let record = match self.decoder.decode(raw) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!("Data handling error: {e} (raw: {raw})");
                self.emit(LinkEvent::error(format!("Data Error: {e}")));
                return;
            }
        };

        if let Some(field) = self.validator.first_missing(&record) {
            warn!("Data missing required field '{field}', skipping database insert");
            self.emit(LinkEvent::RecordSkipped {
                missing_field: field.to_string(),
            });
            return;
        }

        let Some(table) = &self.config.target_table else {
            debug!("Database save skipped: no target table");
            return;
        };

        let pending = PendingRecord {
            table: table.clone(),
            record,
            port: self.session.current_port_path.clone(),
        };
        if let Some(store_tx) = &self.store_tx {
            enqueue_record(store_tx, self.sink.as_ref(), pending);
        }
    }

    fn on_reader_closed(&mut self, session: u64, error: Option<String>) {
        if !self.is_current(session) {
            return;
        }
        let Some(link) = self.link.take() else {
            return;
        };
        let path = link.path;
        drop(link.writer);

        if let Some(e) = error {
            error!("Serial error on {path}: {e}");
            self.emit(LinkEvent::error(format!("Port Error: {e}")));
        }
        info!("Port {path} closed.");

        self.stop_health_monitoring();
        self.stop_port_scanning();
        self.session.current_port_path = None;
        self.session.is_preferred_port = false;

        if self.intentional {
            return;
        }

        let lost = LinkError::UnintentionalClose(path.clone());
        self.set_state(ConnectionState::Disconnected, lost.to_string());
        self.emit(LinkEvent::ConnectionLost {
            port: path,
            reconnect_attempts: self.session.reconnect_attempts,
            timestamp: Utc::now(),
        });

        if self.config.auto_reconnect {
            self.schedule_reconnection();
        }
    }

    fn schedule_reconnection(&mut self) {
        let max_attempts = self.config.max_reconnect_attempts;
        let attempts = self.session.reconnect_attempts;

        if attempts >= max_attempts {
            warn!("Max reconnection attempts ({max_attempts}) reached. Stopping auto-reconnection.");
            self.reconnect_at = None;
            self.set_state(
                ConnectionState::Error,
                LinkError::MaxAttemptsExceeded(max_attempts).to_string(),
            );
            self.emit(LinkEvent::Reconnect {
                status: ReconnectStatus::MaxAttemptsReached,
                attempts,
                max_attempts,
                delay_ms: None,
            });
            return;
        }

        let delay = self.config.reconnect_delay();
        self.set_state(
            ConnectionState::Reconnecting,
            format!(
                "Reconnecting in {}s... (Attempt {}/{})",
                delay.as_secs_f64(),
                attempts + 1,
                max_attempts
            ),
        );
        self.emit(LinkEvent::Reconnect {
            status: ReconnectStatus::Scheduled,
            attempts,
            max_attempts,
            delay_ms: Some(self.config.reconnect_delay_ms),
        });

        // Replaces any timer already armed
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn cancel_reconnection(&mut self) {
        if self.reconnect_at.take().is_some() {
            debug!("Reconnection timer cancelled");
        }
    }

    fn on_reconnect_timer(&mut self) {
        self.reconnect_at = None;
        self.session.reconnect_attempts += 1;
        let attempts = self.session.reconnect_attempts;
        let max_attempts = self.config.max_reconnect_attempts;
        info!("Reconnection attempt {attempts}/{max_attempts}");

        self.emit(LinkEvent::Reconnect {
            status: ReconnectStatus::Attempting,
            attempts,
            max_attempts,
            delay_ms: None,
        });
        self.connect();
    }

    async fn force_reconnect(&mut self) {
        info!("Force reconnection requested...");
        self.cancel_reconnection();
        self.session.reconnect_attempts = 0;
        self.intentional = false;

        self.emit(LinkEvent::Reconnect {
            status: ReconnectStatus::ManualReconnectStarted,
            attempts: 0,
            max_attempts: self.config.max_reconnect_attempts,
            delay_ms: None,
        });

        self.abandon_pending_open();
        self.stop_health_monitoring();
        self.stop_port_scanning();
        if self.link.is_some() {
            self.close_link().await;
            self.set_state(ConnectionState::Disconnected, "Manual reconnection");
        }
        self.connect();
    }

    async fn disconnect(&mut self, message: &str) {
        info!("Intentional disconnect requested...");
        self.intentional = true;
        self.cancel_reconnection();
        self.stop_health_monitoring();
        self.stop_port_scanning();
        self.abandon_pending_open();
        self.close_link().await;
        self.session.is_preferred_port = false;
        self.set_state(ConnectionState::Disconnected, message);
    }

    async fn shutdown(&mut self) {
        info!("Connection manager closing...");
        self.disconnect("Connection manager closed").await;

        // Let already accepted records reach storage
        self.store_tx = None;
        if let Some(worker) = self.store_worker.take() {
            let _ = worker.await;
        }
    }

    /// Release the port. Resolves once the reader has let go of its half.
    async fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            let ActiveLink {
                path,
                writer,
                reader,
                ..
            } = link;
            reader.abort();
            let _ = reader.await;
            drop(writer);
            info!("Serial port {path} closed successfully.");
        }
        self.session.current_port_path = None;
    }

    async fn send_data(&mut self, payload: String) {
        if self.link.is_none() {
            warn!("Cannot send data: port not open");
            self.emit(LinkEvent::error(format!(
                "Cannot send data: {}",
                LinkError::NotConnected.to_string().to_lowercase()
            )));
            return;
        }
        let timeout = self.config.connection_timeout();
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let port = link.path.clone();

        let result = time::timeout(timeout, write_line(&mut link.writer, &payload)).await;
        match result {
            Ok(Ok(())) => {
                debug!("Data sent: {payload}");
                self.emit(LinkEvent::DataSent {
                    data: payload,
                    port: Some(port),
                    timestamp: Utc::now(),
                });
            }
            Ok(Err(e)) => {
                error!("Error sending data: {e}");
                self.emit(LinkEvent::error(format!("Send Error: {e}")));
            }
            Err(_) => {
                error!("Error sending data: write timed out");
                self.emit(LinkEvent::error(format!(
                    "Send Error: write timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        }
    }

    fn start_health_monitoring(&mut self) {
        self.health = Some(periodic(self.config.health_check_interval()));
    }

    fn stop_health_monitoring(&mut self) {
        self.health = None;
    }

    fn on_health_check(&mut self) {
        if self.state != ConnectionState::Connected || self.link.is_none() {
            return;
        }
        let silent = self.last_data.elapsed();
        if silent > self.config.data_silence_threshold() {
            warn!(
                "No data received for {}s. Connection may be unstable.",
                silent.as_secs()
            );
            self.emit(LinkEvent::HealthWarning {
                silent_for_ms: silent.as_millis() as u64,
                port: self.session.current_port_path.clone(),
            });
        }
    }

    fn start_port_scanning(&mut self) {
        self.scan = Some(periodic(self.config.port_scan_interval()));
        info!(
            "Port scanning started (interval: {}ms)",
            self.config.port_scan_interval_ms
        );
    }

    fn stop_port_scanning(&mut self) {
        if self.scan.take().is_some() {
            info!("Port scanning stopped");
        }
    }

    fn set_dynamic_port_switching(&mut self, enabled: bool) {
        self.config.enable_dynamic_port_switching = enabled;
        if enabled && self.link.is_some() && !self.config.is_pinned() {
            self.start_port_scanning();
        } else {
            self.stop_port_scanning();
        }
        info!(
            "Dynamic port switching {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    async fn scan_for_better_port(&mut self) {
        if self.session.is_preferred_port
            || self.pending.is_some()
            || self.link.is_none()
            || self.state != ConnectionState::Connected
            || self.config.is_pinned()
        {
            return;
        }

        debug!("Scanning for better device ports...");
        let ports = match self.backend.list_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Error scanning for better ports: {e}");
                return;
            }
        };

        let current = self.session.current_port_path.clone();
        let Some(candidate) = ports
            .into_iter()
            .find(|p| is_known_device(p) && current.as_deref() != Some(p.name.as_str()))
        else {
            return;
        };

        info!(
            "Better port detected: {} (current: {})",
            candidate.name,
            current.as_deref().unwrap_or("none")
        );
        self.emit(LinkEvent::BetterPortDetected {
            current_port: current.clone(),
            new_port: candidate.name.clone(),
            timestamp: Utc::now(),
        });

        self.switch_to_port(current, candidate.name).await;
    }

    async fn switch_to_port(&mut self, from: Option<String>, to: String) {
        info!(
            "Switching from {} to {to}",
            from.as_deref().unwrap_or("none")
        );
        self.set_state(
            ConnectionState::SwitchingPorts,
            format!("Switching to better port: {to}"),
        );

        self.stop_health_monitoring();
        self.close_link().await;

        self.set_state(ConnectionState::Connecting, format!("Connecting to {to}..."));
        self.begin_open(
            OpenRequest::Preferred(to.clone()),
            Some(PortSwitch { from, to }),
        );
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.state,
            is_connected: self.link.is_some(),
            port: self.link.as_ref().map(|link| PortStatus {
                path: link.path.clone(),
                baud_rate: self.config.baud_rate,
                is_open: true,
                is_preferred: self.session.is_preferred_port,
            }),
            reconnect_attempts: self.session.reconnect_attempts,
            max_reconnect_attempts: self.config.max_reconnect_attempts,
            auto_reconnect: self.config.auto_reconnect,
            last_data_received: self.session.last_data_received_at,
            is_preferred_port: self.session.is_preferred_port,
            current_port_path: self.session.current_port_path.clone(),
            dynamic_port_switching: self.config.enable_dynamic_port_switching,
        }
    }
}

/// Resolve the target port and open it within `timeout`
async fn open_port(
    backend: &dyn SerialBackend,
    request: OpenRequest,
    baud_rate: u32,
    timeout: Duration,
) -> Result<OpenedPort, LinkError> {
    let (path, preferred) = match request {
        OpenRequest::Fixed(path) => (path, false),
        OpenRequest::Preferred(path) => (path, true),
        OpenRequest::Discover => {
            debug!("Scanning for device ports...");
            let ports = backend.list_ports().await?;
            debug!(
                "Available ports: {:?}",
                ports.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()
            );

            let selection = select_best(&ports)?;
            if selection.preferred {
                info!("Found potential device port: {}", selection.port.name);
            } else {
                info!("No obvious device ports found, trying first available port...");
            }
            (selection.port.name, selection.preferred)
        }
    };

    info!("Attempting to connect: {path} @ {baud_rate} baud.");
    match time::timeout(timeout, backend.open(&path, baud_rate)).await {
        Ok(Ok(io)) => Ok(OpenedPort {
            io,
            path,
            preferred,
        }),
        Ok(Err(e)) => Err(e),
        // Dropping the open future releases any half-open handle
        Err(_) => Err(LinkError::OpenTimeout(timeout.as_millis() as u64)),
    }
}

/// Forward delimited lines from the port until it closes
async fn read_lines(
    reader: ReadHalf<Box<dyn SerialIo>>,
    codec: LineCodec,
    session: u64,
    tx: mpsc::UnboundedSender<Internal>,
) {
    let mut lines = FramedRead::new(reader, codec);
    let error = loop {
        match lines.next().await {
            Some(Ok(line)) => {
                if tx.send(Internal::Line { session, line }).is_err() {
                    return;
                }
            }
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        }
    };
    let _ = tx.send(Internal::ReaderClosed { session, error });
}

async fn write_line(writer: &mut WriteHalf<Box<dyn SerialIo>>, payload: &str) -> io::Result<()> {
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Queue a record for storage without blocking the reader
fn enqueue_record(
    queue: &mpsc::Sender<PendingRecord>,
    sink: &dyn EventSink,
    pending: PendingRecord,
) {
    match queue.try_send(pending) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(PendingRecord { table, .. })) => {
            warn!("Persistence queue full; record for {table} dropped");
            sink.notify(LinkEvent::StoreFailed {
                table,
                message: "persistence queue full, record dropped".to_string(),
            });
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Persistence worker stopped; record dropped");
        }
    }
}

/// Encrypt configured fields and hand records to storage, in arrival order
async fn persist_records(
    mut records: mpsc::Receiver<PendingRecord>,
    gateway: Arc<dyn PersistenceGateway>,
    validator: RecordValidator,
    sink: Arc<dyn EventSink>,
) {
    let mut warned_no_cipher = false;

    while let Some(PendingRecord {
        table,
        mut record,
        port,
    }) = records.recv().await
    {
        if validator.encrypts() {
            match gateway.cipher() {
                Some(cipher) => {
                    let failures = validator.encrypt_fields(&mut record, |v| cipher.encrypt(v));
                    for failure in failures {
                        error!(
                            "Error encrypting field '{}': {}",
                            failure.field, failure.message
                        );
                        sink.notify(LinkEvent::error(format!(
                            "Encryption Error for {}: {}",
                            failure.field, failure.message
                        )));
                    }
                }
                None if !warned_no_cipher => {
                    warn!("fieldsToEncrypt is set but the store offers no cipher; storing as-is");
                    warned_no_cipher = true;
                }
                None => {}
            }
        }

        match gateway.store(&table, record).await {
            Ok(receipt) => {
                info!("DB insert successful ({table}): ID {}", receipt.insert_id);
                sink.notify(LinkEvent::Stored {
                    table,
                    insert_id: receipt.insert_id,
                    port,
                });
            }
            Err(e) => {
                error!("DB insert error ({table}): {e}");
                sink.notify(LinkEvent::StoreFailed {
                    table,
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Interval whose first tick is one full period from now
fn periodic(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::SwitchingPorts.to_string(), "switching_ports");
        assert_eq!(
            serde_json::to_value(ConnectionState::Reconnecting).unwrap(),
            json!("reconnecting")
        );
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = LinkStatus {
            state: ConnectionState::Connected,
            is_connected: true,
            port: Some(PortStatus {
                path: "/dev/ttyACM0".into(),
                baud_rate: 115200,
                is_open: true,
                is_preferred: true,
            }),
            reconnect_attempts: 0,
            max_reconnect_attempts: 10,
            auto_reconnect: true,
            last_data_received: None,
            is_preferred_port: true,
            current_port_path: Some("/dev/ttyACM0".into()),
            dynamic_port_switching: true,
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "connected");
        assert_eq!(value["isConnected"], true);
        assert_eq!(value["port"]["baudRate"], 115200);
        assert_eq!(value["port"]["isPreferred"], true);
        assert_eq!(value["maxReconnectAttempts"], 10);
        assert_eq!(value["currentPortPath"], "/dev/ttyACM0");
        assert!(value["lastDataReceived"].is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_first_tick_is_one_period_out() {
        let start = Instant::now();
        let mut interval = periodic(Duration::from_secs(10));
        interval.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unarmed_timers_stay_pending() {
        let mut none: Option<Interval> = None;
        let idle = async {
            tokio::select! {
                _ = tick(&mut none) => false,
                _ = sleep_until(None) => false,
                _ = time::sleep(Duration::from_millis(5)) => true,
            }
        };
        assert!(idle.await);
    }

    #[test]
    fn test_full_store_queue_drops_record() {
        let (queue, mut queued) = mpsc::channel(1);
        let (sink, mut events) = crate::events::ChannelSink::new();
        let pending = |temp: i64| PendingRecord {
            table: "sensors_table".into(),
            record: json!({ "temp": temp }).as_object().cloned().unwrap(),
            port: Some("/dev/ttyUSB0".into()),
        };

        enqueue_record(&queue, &sink, pending(1));
        enqueue_record(&queue, &sink, pending(2));

        assert_eq!(
            events.try_recv().unwrap(),
            LinkEvent::StoreFailed {
                table: "sensors_table".into(),
                message: "persistence queue full, record dropped".into(),
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(queued.try_recv().unwrap().record["temp"], 1);
        assert!(queued.try_recv().is_err());
    }

    #[test]
    fn test_closed_store_queue_is_silent() {
        let (queue, queued) = mpsc::channel(1);
        drop(queued);
        let (sink, mut events) = crate::events::ChannelSink::new();
        enqueue_record(
            &queue,
            &sink,
            PendingRecord {
                table: "sensors_table".into(),
                record: DecodedRecord::new(),
                port: None,
            },
        );
        assert!(events.try_recv().is_err());
    }
}

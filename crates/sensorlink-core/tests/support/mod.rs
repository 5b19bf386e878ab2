//! Scripted serial backend and event helpers shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use sensorlink_core::prelude::*;
use sensorlink_core::serial::SerialIo;

/// Generous virtual-time limit for waiting on manager events
const WAIT_LIMIT: Duration = Duration::from_secs(600);

/// What the mock does when asked to open a path
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    /// Hand back one end of an in-memory pipe
    Accept,
    /// Fail immediately
    Fail(String),
    /// Never complete
    Hang,
}

struct MockState {
    ports: Vec<PortInfo>,
    behaviors: HashMap<String, OpenBehavior>,
    opens: Vec<String>,
}

/// Backend with scripted ports and open results
pub struct MockBackend {
    state: Mutex<MockState>,
    devices: mpsc::UnboundedSender<Device>,
}

impl MockBackend {
    pub fn new(ports: Vec<PortInfo>) -> (Arc<Self>, mpsc::UnboundedReceiver<Device>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Self {
            state: Mutex::new(MockState {
                ports,
                behaviors: HashMap::new(),
                opens: Vec::new(),
            }),
            devices: tx,
        };
        (Arc::new(backend), rx)
    }

    pub fn set_ports(&self, ports: Vec<PortInfo>) {
        self.state.lock().unwrap().ports = ports;
    }

    pub fn set_behavior(&self, path: &str, behavior: OpenBehavior) {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .insert(path.to_string(), behavior);
    }

    /// Paths passed to `open`, in call order
    pub fn opens(&self) -> Vec<String> {
        self.state.lock().unwrap().opens.clone()
    }
}

#[async_trait]
impl SerialBackend for MockBackend {
    async fn list_ports(&self) -> Result<Vec<PortInfo>, LinkError> {
        Ok(self.state.lock().unwrap().ports.clone())
    }

    async fn open(&self, path: &str, _baud_rate: u32) -> Result<Box<dyn SerialIo>, LinkError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.opens.push(path.to_string());
            state
                .behaviors
                .get(path)
                .cloned()
                .unwrap_or(OpenBehavior::Accept)
        };

        match behavior {
            OpenBehavior::Accept => {
                let (ours, theirs) = tokio::io::duplex(4096);
                let _ = self.devices.send(Device {
                    path: path.to_string(),
                    stream: theirs,
                });
                Ok(Box::new(ours))
            }
            OpenBehavior::Fail(reason) => Err(LinkError::OpenFailed {
                path: path.to_string(),
                reason,
            }),
            OpenBehavior::Hang => std::future::pending().await,
        }
    }
}

/// The device side of an opened mock port. Dropping it unplugs the device.
pub struct Device {
    pub path: String,
    stream: DuplexStream,
}

impl Device {
    pub async fn send_line(&mut self, line: &str) {
        self.send_raw(format!("{line}\r\n").as_bytes()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next newline-terminated line written by the manager
    pub async fn read_line(&mut self) -> String {
        let mut line = Vec::new();
        loop {
            let byte = self.stream.read_u8().await.unwrap();
            if byte == b'\n' {
                return String::from_utf8(line).unwrap();
            }
            line.push(byte);
        }
    }

    /// Resolves once the manager has released its end
    pub async fn wait_closed(&mut self) {
        let mut buf = [0u8; 64];
        tokio::time::timeout(WAIT_LIMIT, async {
            while self.stream.read(&mut buf).await.unwrap_or(0) > 0 {}
        })
        .await
        .expect("port was never released");
    }
}

/// Collects events from a [`ChannelSink`] and remembers everything seen
pub struct Events {
    rx: mpsc::UnboundedReceiver<LinkEvent>,
    pub seen: Vec<LinkEvent>,
}

impl Events {
    pub async fn wait_for(&mut self, pred: impl Fn(&LinkEvent) -> bool) -> LinkEvent {
        let rx = &mut self.rx;
        let seen = &mut self.seen;
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let event = rx.recv().await.expect("event sink closed");
                seen.push(event.clone());
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Wait for a transition into `state` and return its message
    pub async fn wait_state(&mut self, state: ConnectionState) -> String {
        match self
            .wait_for(|e| matches!(e, LinkEvent::Status { state: s, .. } if *s == state))
            .await
        {
            LinkEvent::Status { message, .. } => message,
            _ => unreachable!(),
        }
    }

    /// Pull in everything already emitted
    pub fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.seen.push(event);
        }
    }

    /// State transitions seen so far, in order
    pub fn states(&self) -> Vec<ConnectionState> {
        self.seen
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Status { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&LinkEvent) -> bool) -> usize {
        self.seen.iter().filter(|e| pred(e)).count()
    }
}

pub struct Harness {
    pub manager: ConnectionManager,
    pub backend: Arc<MockBackend>,
    pub store: Arc<MemoryStore>,
    pub events: Events,
    devices: mpsc::UnboundedReceiver<Device>,
}

impl Harness {
    pub fn new(config: ConnectionConfig, ports: Vec<PortInfo>) -> Self {
        Self::with_store(config, ports, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        config: ConnectionConfig,
        ports: Vec<PortInfo>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let (backend, devices) = MockBackend::new(ports);
        let (sink, rx) = ChannelSink::new();
        let manager =
            ConnectionManager::spawn(config, backend.clone(), store.clone(), Arc::new(sink))
                .expect("config should be valid");

        Self {
            manager,
            backend,
            store,
            events: Events {
                rx,
                seen: Vec::new(),
            },
            devices,
        }
    }

    /// Device end of the next port the manager opens successfully
    pub async fn next_device(&mut self) -> Device {
        tokio::time::timeout(WAIT_LIMIT, self.devices.recv())
            .await
            .expect("no port was opened")
            .expect("backend dropped")
    }

    /// Connect and wait until the link is up
    pub async fn connected(&mut self) -> Device {
        self.manager.connect().unwrap();
        self.events.wait_state(ConnectionState::Connected).await;
        self.next_device().await
    }
}

pub fn ftdi(path: &str) -> PortInfo {
    PortInfo::usb(path, 0x0403, Some("FTDI"))
}

pub fn csv_config() -> ConnectionConfig {
    ConnectionConfig {
        data_type: DataType::Csv,
        field_mapping: vec!["temp".into(), "humidity".into()],
        target_table: Some("sensors_table".into()),
        ..Default::default()
    }
}

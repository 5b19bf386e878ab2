//! Port discovery
//!
//! Enumerates serial ports and picks the one most likely to be the sensor
//! board, based on USB vendor ids and manufacturer strings.

use serde::Serialize;
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;

use super::{LinkError, KNOWN_MANUFACTURERS, KNOWN_VENDOR_IDS};

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// A port known only by its path
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// A USB port with vendor id and manufacturer string
    pub fn usb(name: impl Into<String>, vid: u16, manufacturer: Option<&str>) -> Self {
        Self {
            vid: Some(vid),
            manufacturer: manufacturer.map(str::to_string),
            ..Self::bare(name)
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => Self {
                name: info.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
                serial_number: usb_info.serial_number,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Result of ranking the enumerated ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Chosen port
    pub port: PortInfo,
    /// True when the port matched a device signature rather than being the
    /// first-available fallback
    pub preferred: bool,
}

/// Whether a port carries the signature of a known sensor board or
/// USB-serial bridge
pub fn is_known_device(port: &PortInfo) -> bool {
    let manufacturer = port
        .manufacturer
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();

    KNOWN_MANUFACTURERS
        .iter()
        .any(|needle| manufacturer.contains(needle))
        || port.vid.is_some_and(|vid| KNOWN_VENDOR_IDS.contains(&vid))
}

/// Pick the first recognised port, falling back to the first port listed
pub fn select_best(ports: &[PortInfo]) -> Result<Selection, LinkError> {
    if let Some(port) = ports.iter().find(|p| is_known_device(p)) {
        return Ok(Selection {
            port: port.clone(),
            preferred: true,
        });
    }

    ports
        .first()
        .map(|port| Selection {
            port: port.clone(),
            preferred: false,
        })
        .ok_or(LinkError::NoPortsAvailable)
}

/// Sort key so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List serial ports in a deterministic order.
///
/// On Linux, `/dev/ttyACM*` and `/dev/ttyUSB*` nodes the OS API missed are
/// added without metadata.
pub fn list_ports() -> Result<Vec<PortInfo>, LinkError> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    let available =
        serialport::available_ports().map_err(|e| LinkError::DiscoveryFailed(e.to_string()))?;
    for info in available {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    Ok(ports)
}

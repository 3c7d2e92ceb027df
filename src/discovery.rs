use lazy_static::lazy_static;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use regex::Regex;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

lazy_static! {
    static ref MODEL_PATTERN: Regex = Regex::new(r"^DS1\d\d\dZ").unwrap();
    static ref MANUFACTURER_PATTERN: Regex = Regex::new("^RIGOL TECHNOLOGIES").unwrap();
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("No oscilloscope found on the network")]
    NoDeviceFound,
    #[error("Found {} oscilloscopes, not one: {}", .0.len(), format_candidates(.0))]
    Ambiguous(Vec<DiscoveredDevice>),
}

fn format_candidates(devices: &[DiscoveredDevice]) -> String {
    devices
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// An oscilloscope announced over mDNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub model: String,
    pub address: IpAddr,
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.model, self.address)
    }
}

/// Timing of one scan. Both limits are measured from the start of the
/// scan, not from the first hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    /// Earliest point at which a scan holding at least one match may stop.
    pub early_return: Duration,
    /// Hard limit on the scan, matches found or not.
    pub timeout: Duration,
}

impl Default for ScanWindow {
    fn default() -> Self {
        Self {
            early_return: Duration::from_millis(800),
            timeout: Duration::from_millis(2500),
        }
    }
}

/// A running mDNS daemon. The daemon is shut down when the session is
/// dropped.
pub struct DiscoverySession {
    daemon: ServiceDaemon,
}

impl DiscoverySession {
    /// Service type Rigol instruments announce their SCPI socket under.
    const SERVICE_TYPE: &'static str = "_scpi-raw._tcp.local.";

    pub fn new() -> Result<Self, DiscoveryError> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
        })
    }

    /// Browse for DS1000Z oscilloscopes within `window`.
    ///
    /// Every resolved service is matched on its TXT record: the model
    /// must be a DS1000Z variant and the manufacturer Rigol. Matches are
    /// de-duplicated by address.
    pub fn scan(&self, window: &ScanWindow) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let receiver = self.daemon.browse(Self::SERVICE_TYPE)?;
        let start = Instant::now();
        let mut devices: Vec<DiscoveredDevice> = Vec::new();
        loop {
            let elapsed = start.elapsed();
            let budget = if devices.is_empty() {
                window.timeout
            } else {
                window.early_return
            };
            if elapsed >= budget {
                break;
            }
            match receiver.recv_timeout(budget - elapsed) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    if let Some(device) = match_ds1000z(&info) {
                        if !devices.iter().any(|known| known.address == device.address) {
                            log::debug!("Resolved {device}");
                            devices.push(device);
                        }
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let _ = self.daemon.stop_browse(Self::SERVICE_TYPE);
        Ok(devices)
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        if let Err(error) = self.daemon.shutdown() {
            log::warn!("Could not shut down the mDNS daemon: {error}");
        }
    }
}

fn match_ds1000z(info: &ServiceInfo) -> Option<DiscoveredDevice> {
    let model = info.get_property_val_str("Model")?;
    let manufacturer = info.get_property_val_str("Manufacturer")?;
    if !MODEL_PATTERN.is_match(model) || !MANUFACTURER_PATTERN.is_match(manufacturer) {
        return None;
    }
    let addresses = info.get_addresses();
    let address = addresses
        .iter()
        .find(|candidate| candidate.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()?;
    Some(DiscoveredDevice {
        model: model.to_string(),
        address,
    })
}

/// One-shot scan with a fresh daemon.
pub fn discover(window: &ScanWindow) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
    let session = DiscoverySession::new()?;
    session.scan(window)
}

/// Pick the device a command should talk to when the user named none.
pub fn select_single(
    mut devices: Vec<DiscoveredDevice>,
) -> Result<DiscoveredDevice, DiscoveryError> {
    match devices.len() {
        0 => Err(DiscoveryError::NoDeviceFound),
        1 => Ok(devices.remove(0)),
        _ => Err(DiscoveryError::Ambiguous(devices)),
    }
}

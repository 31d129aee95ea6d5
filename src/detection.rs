//! Instrument auto-detection.
//!
//! Scans serial ports by sending safe identification queries and matching the answers
//! against a table of known vendor strings:
//!
//! | Role       | Query    | Accepted markers               |
//! |------------|----------|--------------------------------|
//! | multimeter | `*IDN?\n`| `OWON`, `XDM`                  |
//! | generator  | `UMO\n`  | `FY6900`, `FY6800`, `FeelTech` |
//!
//! `UMO` is the FeelTech "read model" frame; the generator does not implement `*IDN?`.
//!
//! Each port is opened once per candidate baud rate and retried at most once when the
//! link itself fails. A port whose answers match markers of both roles is ambiguous and
//! gets no role.
//!
//! Do not scan while a sweep or a data log is running: the probes share the ports.

use crate::error::{BenchError, BenchResult};
use crate::transport::{PortOpener, SerialEndpoint, SerialSettings, SystemPortOpener};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Baud rates tried on every port, in order.
pub const CANDIDATE_BAUD_RATES: [u32; 2] = [115_200, 9_600];

/// Read timeout applied to each identification query.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

const MAX_RETRIES: usize = 1;

/// What a detected device is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Multimeter,
    Generator,
}

struct Probe {
    role: DeviceRole,
    command: &'static [u8],
    markers: &'static [&'static str],
}

const PROBES: &[Probe] = &[
    // OWON XDM series: "OWON,XDM1041,<serial>,<fw>"
    Probe {
        role: DeviceRole::Multimeter,
        command: b"*IDN?\n",
        markers: &["OWON", "XDM"],
    },
    // FeelTech FY6900 / FY6800: "FY6900-60M"
    Probe {
        role: DeviceRole::Generator,
        command: b"UMO\n",
        markers: &["FY6900", "FY6800", "FeelTech"],
    },
];

/// Roles whose markers appear in `response`.
fn classify(response: &str) -> Vec<DeviceRole> {
    let upper = response.to_ascii_uppercase();
    PROBES
        .iter()
        .filter(|p| p.markers.iter().any(|m| upper.contains(&m.to_ascii_uppercase())))
        .map(|p| p.role)
        .collect()
}

/// A serial port as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    /// USB manufacturer/product when known, else the port type.
    pub description: String,
}

/// Enumerate the serial ports of this machine.
#[cfg(feature = "instrument_serial")]
pub fn list_ports() -> BenchResult<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        BenchError::transport(
            "<enumeration>",
            std::io::Error::new(std::io::ErrorKind::Other, e.description),
        )
    })?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    let parts: Vec<String> =
                        [usb.manufacturer, usb.product].into_iter().flatten().collect();
                    if parts.is_empty() {
                        format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
                    } else {
                        parts.join(" ")
                    }
                }
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                serialport::SerialPortType::Unknown => String::new(),
            };
            PortInfo {
                name: p.port_name,
                description,
            }
        })
        .collect())
}

/// Enumerate the serial ports of this machine.
#[cfg(not(feature = "instrument_serial"))]
pub fn list_ports() -> BenchResult<Vec<PortInfo>> {
    Err(BenchError::FeatureNotEnabled("instrument_serial".to_string()))
}

/// Outcome of a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionResult {
    pub multimeter_port: Option<String>,
    pub multimeter_baud: Option<u32>,
    pub generator_port: Option<String>,
    pub generator_baud: Option<u32>,
    /// Ports that answered but were not assigned a role, for manual assignment.
    pub others: Vec<String>,
}

impl DetectionResult {
    fn assign(&mut self, role: DeviceRole, port: &str, baud: u32) -> bool {
        let (slot, baud_slot) = match role {
            DeviceRole::Multimeter => (&mut self.multimeter_port, &mut self.multimeter_baud),
            DeviceRole::Generator => (&mut self.generator_port, &mut self.generator_baud),
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(port.to_string());
        *baud_slot = Some(baud);
        true
    }
}

enum PortVerdict {
    Identified(DeviceRole, u32),
    Answered,
    Silent,
}

/// Port scanner.
pub struct Detector {
    opener: Arc<dyn PortOpener>,
    baud_rates: Vec<u32>,
    timeout: Duration,
}

impl Detector {
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            baud_rates: CANDIDATE_BAUD_RATES.to_vec(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Scanner over the real serial ports.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemPortOpener))
    }

    pub fn with_baud_rates(mut self, baud_rates: Vec<u32>) -> Self {
        self.baud_rates = baud_rates;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe `ports` in order. The first port matching a role gets it.
    pub async fn detect(&self, ports: &[String]) -> DetectionResult {
        let mut result = DetectionResult::default();

        for port in ports {
            match self.scan_port(port).await {
                PortVerdict::Identified(role, baud) => {
                    if result.assign(role, port, baud) {
                        info!(port = %port, baud, role = ?role, "Instrument detected");
                    } else {
                        debug!(port = %port, role = ?role, "Role already assigned");
                        result.others.push(port.clone());
                    }
                }
                PortVerdict::Answered => result.others.push(port.clone()),
                PortVerdict::Silent => {}
            }
        }

        result
    }

    async fn scan_port(&self, port: &str) -> PortVerdict {
        let mut answered = false;

        for &baud in &self.baud_rates {
            let responses = match self.probe_with_retry(port, baud).await {
                Ok(responses) => responses,
                Err(BenchError::Busy(reason)) => {
                    warn!(port = %port, %reason, "Skipping port in use");
                    return PortVerdict::Silent;
                }
                Err(e) => {
                    debug!(port = %port, baud, error = %e, "Probe failed");
                    continue;
                }
            };

            let mut roles: Vec<DeviceRole> = Vec::new();
            for response in &responses {
                answered |= !response.is_empty();
                for role in classify(response) {
                    if !roles.contains(&role) {
                        roles.push(role);
                    }
                }
            }

            match roles.as_slice() {
                [role] => return PortVerdict::Identified(*role, baud),
                [] => {}
                _ => {
                    warn!(port = %port, baud, ?responses, "Ambiguous identification");
                    return PortVerdict::Answered;
                }
            }
        }

        if answered {
            PortVerdict::Answered
        } else {
            PortVerdict::Silent
        }
    }

    async fn probe_with_retry(&self, port: &str, baud: u32) -> BenchResult<Vec<String>> {
        let mut attempt = 0;
        loop {
            match self.probe(port, baud).await {
                Err(e) if e.is_transport() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    debug!(port = %port, baud, error = %e, "Retrying probe");
                }
                other => return other,
            }
        }
    }

    /// Open `port` at `baud`, send every identification query and collect the answers.
    async fn probe(&self, port: &str, baud: u32) -> BenchResult<Vec<String>> {
        let settings = SerialSettings::new(port, baud).with_timeout(self.timeout);
        let mut endpoint = SerialEndpoint::new(settings, self.opener.clone());
        endpoint.open().await?;

        let mut responses = Vec::with_capacity(PROBES.len());
        let outcome: BenchResult<()> = async {
            for probe in PROBES {
                endpoint.reset_in_buffer().await?;
                endpoint.write(probe.command).await?;
                // Empty when the device ignores another vendor's query.
                let line = endpoint.read_line().await?;
                responses.push(String::from_utf8_lossy(&line).trim().to_string());
            }
            Ok(())
        }
        .await;

        endpoint.close().await;
        outcome.map(|()| responses)
    }
}

/// Scan every serial port of this machine.
pub async fn detect() -> BenchResult<DetectionResult> {
    let ports: Vec<String> = list_ports()?.into_iter().map(|p| p.name).collect();
    Ok(Detector::system().detect(&ports).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackOpener;

    fn detector(opener: &LoopbackOpener) -> Detector {
        Detector::new(Arc::new(opener.clone())).with_timeout(Duration::from_millis(30))
    }

    #[test]
    fn vendor_table() {
        assert_eq!(classify("OWON,XDM1041,123,V1"), vec![DeviceRole::Multimeter]);
        assert_eq!(classify("fy6900-60m"), vec![DeviceRole::Generator]);
        assert_eq!(
            classify("FeelTech XDM bridge"),
            vec![DeviceRole::Multimeter, DeviceRole::Generator]
        );
        assert!(classify("KEITHLEY,2000").is_empty());
    }

    #[tokio::test]
    async fn finds_multimeter_at_fallback_baud() {
        let opener = LoopbackOpener::new();
        opener.register_line_device("det-dmm", Some(9_600), |cmd| {
            (cmd == "*IDN?").then(|| "OWON,XDM2041,0001,V2\n".to_string())
        });

        let result = detector(&opener).detect(&["det-dmm".to_string()]).await;
        assert_eq!(result.multimeter_port.as_deref(), Some("det-dmm"));
        assert_eq!(result.multimeter_baud, Some(9_600));
        assert_eq!(result.generator_port, None);
    }

    #[tokio::test]
    async fn ambiguous_answer_gets_no_role() {
        let opener = LoopbackOpener::new();
        opener.register_line_device("det-amb", None, |_| Some("FeelTech OWON\n".into()));
        opener.register_line_device("det-other", None, |_| Some("RIGOL DP832\n".into()));
        opener.register_silent("det-silent");

        let ports = ["det-amb", "det-other", "det-silent"].map(String::from);
        let result = detector(&opener).detect(&ports).await;
        assert_eq!(result.multimeter_port, None);
        assert_eq!(result.generator_port, None);
        assert_eq!(result.others, vec!["det-amb".to_string(), "det-other".to_string()]);
    }

    #[tokio::test]
    async fn unavailable_port_retried_once_per_baud() {
        let opener = LoopbackOpener::new();
        opener.mark_unavailable("det-gone");

        let result = detector(&opener).detect(&["det-gone".to_string()]).await;
        assert_eq!(result, DetectionResult::default());
        assert_eq!(opener.open_attempts("det-gone", 115_200), 2);
        assert_eq!(opener.open_attempts("det-gone", 9_600), 2);
    }

    #[tokio::test]
    async fn first_match_wins() {
        let opener = LoopbackOpener::new();
        for port in ["det-gen-a", "det-gen-b"] {
            opener.register_line_device(port, Some(115_200), |cmd| {
                Some(if cmd == "UMO" { "FY6800-30M\n" } else { "\n" }.to_string())
            });
        }

        let ports = ["det-gen-a", "det-gen-b"].map(String::from);
        let result = detector(&opener).detect(&ports).await;
        assert_eq!(result.generator_port.as_deref(), Some("det-gen-a"));
        assert_eq!(result.generator_baud, Some(115_200));
        assert_eq!(result.others, vec!["det-gen-b".to_string()]);
    }
}

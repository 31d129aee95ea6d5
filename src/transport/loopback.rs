//! In-process serial devices for tests and simulation.
//!
//! [`LoopbackOpener`] implements [`PortOpener`] over `tokio::io::duplex`. Each registered
//! port name is backed by a responder closure: every `\n`-terminated command written by
//! the host is handed to the closure, and whatever it returns is written back. A device
//! can be pinned to one baud rate; opened at any other rate it answers with line noise,
//! the way a real UART would.

use super::{DynSerial, PortOpener, SerialSettings};
use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::trace;

/// Maps one received command (terminator stripped) to the bytes sent back.
pub type Responder = Arc<dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync>;

const LINE_NOISE: &[u8] = b"\xfe\x00\xff\x80";

#[derive(Clone)]
struct LoopbackDevice {
    baud_rate: Option<u32>,
    responder: Responder,
}

#[derive(Default)]
struct Registry {
    devices: HashMap<String, LoopbackDevice>,
    unavailable: HashSet<String>,
    open_attempts: HashMap<(String, u32), usize>,
}

/// Opener backed by simulated devices.
#[derive(Clone, Default)]
pub struct LoopbackOpener {
    registry: Arc<Mutex<Registry>>,
}

impl LoopbackOpener {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_registry<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut registry)
    }

    /// Register a device answering with raw bytes.
    ///
    /// `baud_rate = None` answers at every rate.
    pub fn register_device<F>(&self, port_name: &str, baud_rate: Option<u32>, responder: F)
    where
        F: Fn(&str) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let device = LoopbackDevice {
            baud_rate,
            responder: Arc::new(responder),
        };
        self.with_registry(|r| r.devices.insert(port_name.to_string(), device));
    }

    /// Register a device answering with text.
    pub fn register_line_device<F>(&self, port_name: &str, baud_rate: Option<u32>, responder: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.register_device(port_name, baud_rate, move |line| {
            responder(line).map(String::into_bytes)
        });
    }

    /// Register a port that opens but never answers.
    pub fn register_silent(&self, port_name: &str) {
        self.register_device(port_name, None, |_| None);
    }

    /// Make every open of `port_name` fail with an I/O error.
    pub fn mark_unavailable(&self, port_name: &str) {
        self.with_registry(|r| r.unavailable.insert(port_name.to_string()));
    }

    /// Registered port names, sorted.
    pub fn port_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.with_registry(|r| {
            r.devices
                .keys()
                .chain(r.unavailable.iter())
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        });
        names.sort();
        names
    }

    /// How many times `port_name` was opened at `baud_rate`.
    pub fn open_attempts(&self, port_name: &str, baud_rate: u32) -> usize {
        self.with_registry(|r| {
            r.open_attempts
                .get(&(port_name.to_string(), baud_rate))
                .copied()
                .unwrap_or(0)
        })
    }
}

#[async_trait]
impl PortOpener for LoopbackOpener {
    async fn open(&self, settings: &SerialSettings) -> BenchResult<DynSerial> {
        let port_name = settings.port_name.clone();
        let baud_rate = settings.baud_rate;

        let device = self.with_registry(|r| {
            *r.open_attempts
                .entry((port_name.clone(), baud_rate))
                .or_insert(0) += 1;
            if r.unavailable.contains(&port_name) {
                None
            } else {
                r.devices.get(&port_name).cloned()
            }
        });

        let device = device.ok_or_else(|| {
            BenchError::transport(
                &port_name,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such loopback device"),
            )
        })?;

        let (host, device_side) = tokio::io::duplex(64 * 1024);
        let in_tune = device.baud_rate.map_or(true, |b| b == baud_rate);
        tokio::spawn(run_device(port_name, host, device.responder, in_tune));

        Ok(Box::new(device_side))
    }
}

async fn run_device(
    port_name: String,
    host: tokio::io::DuplexStream,
    responder: Responder,
    in_tune: bool,
) {
    let (reader, mut writer) = tokio::io::split(host);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let reply = if in_tune {
            let text = String::from_utf8_lossy(&line);
            let command = text.trim_end_matches(['\r', '\n']);
            trace!(port = %port_name, command, "Loopback device received command");
            responder(command)
        } else {
            Some(LINE_NOISE.to_vec())
        };

        if let Some(bytes) = reply {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SerialEndpoint;
    use std::time::Duration;

    #[tokio::test]
    async fn wrong_baud_answers_with_noise() {
        let opener = LoopbackOpener::new();
        opener.register_line_device("lb-baud", Some(115_200), |_| Some("OK\n".into()));

        let settings = SerialSettings::new("lb-baud", 9600).with_timeout(Duration::from_millis(50));
        let mut ep = SerialEndpoint::new(settings, Arc::new(opener.clone()));
        ep.open().await.unwrap();
        ep.write(b"*IDN?\n").await.unwrap();
        let reply = ep.read_line().await.unwrap();
        assert_eq!(reply, LINE_NOISE);
        assert_eq!(opener.open_attempts("lb-baud", 9600), 1);
        assert_eq!(opener.open_attempts("lb-baud", 115_200), 0);
    }

    #[tokio::test]
    async fn unavailable_port_fails_to_open() {
        let opener = LoopbackOpener::new();
        opener.mark_unavailable("lb-gone");
        let mut ep = SerialEndpoint::new(SerialSettings::new("lb-gone", 9600), Arc::new(opener));
        let err = ep.open().await.unwrap_err();
        assert!(err.is_transport());
        assert!(!ep.is_open());
    }

    #[test]
    fn port_names_are_sorted_and_unique() {
        let opener = LoopbackOpener::new();
        opener.register_silent("b");
        opener.register_silent("a");
        opener.mark_unavailable("a");
        assert_eq!(opener.port_names(), vec!["a".to_string(), "b".to_string()]);
    }
}

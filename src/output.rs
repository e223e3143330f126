//! Output destinations for the print and syslog sinks
//!
//! Developed by GoCortex.io

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixDatagram;
use tracing::{debug, info, warn};

use crate::log_file::LogFile;

pub const SYSLOG_SOCKET: &str = "/dev/log";

/// In-memory record capture, shared between the sink and whoever inspects it.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog(Arc<Mutex<Vec<String>>>);

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.into());
    }

    pub fn records(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Destination of the print sink.
pub enum OutputTarget {
    Stdout,
    Stderr,
    File(LogFile),
    Memory(MemoryLog),
}

impl OutputTarget {
    pub async fn file(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(OutputTarget::File(LogFile::open(path).await?))
    }

    pub async fn write_record(&mut self, record: &str) -> Result<()> {
        match self {
            OutputTarget::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(record.as_bytes()).await.context("Failed to write to stdout")?;
                out.flush().await.context("Failed to flush stdout")?;
            }
            OutputTarget::Stderr => {
                let mut out = tokio::io::stderr();
                out.write_all(record.as_bytes()).await.context("Failed to write to stderr")?;
                out.flush().await.context("Failed to flush stderr")?;
            }
            OutputTarget::File(file) => {
                file.write_str(record).await?;
                file.flush().await?;
            }
            OutputTarget::Memory(log) => log.push(record),
        }
        Ok(())
    }

    /// Reopen file destinations; a no-op for the others.
    pub async fn reopen(&mut self) -> Result<()> {
        if let OutputTarget::File(file) = self {
            file.reopen().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        match self {
            OutputTarget::Stdout => tokio::io::stdout().flush().await?,
            OutputTarget::Stderr => tokio::io::stderr().flush().await?,
            OutputTarget::File(file) => file.flush().await?,
            OutputTarget::Memory(_) => {}
        }
        Ok(())
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::Stdout => f.write_str("stdout"),
            OutputTarget::Stderr => f.write_str("stderr"),
            OutputTarget::File(file) => write!(f, "file {}", file.path().display()),
            OutputTarget::Memory(_) => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Facility {
    Daemon,
    #[default]
    Local0,
    Local1,
    Local2,
    Local3,
    Local4,
    Local5,
    Local6,
    Local7,
}

impl Facility {
    pub fn code(self) -> u8 {
        match self {
            Facility::Daemon => 3,
            Facility::Local0 => 16,
            Facility::Local1 => 17,
            Facility::Local2 => 18,
            Facility::Local3 => 19,
            Facility::Local4 => 20,
            Facility::Local5 => 21,
            Facility::Local6 => 22,
            Facility::Local7 => 23,
        }
    }
}

impl std::str::FromStr for Facility {
    type Err = anyhow::Error;

    /// Accepts `d`/`daemon`, a digit `0`-`7`, or `local0`-`local7`.
    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_ascii_lowercase();
        let local = lowered.strip_prefix("local").unwrap_or(&lowered);
        match local {
            "d" | "daemon" => Ok(Facility::Daemon),
            "0" => Ok(Facility::Local0),
            "1" => Ok(Facility::Local1),
            "2" => Ok(Facility::Local2),
            "3" => Ok(Facility::Local3),
            "4" => Ok(Facility::Local4),
            "5" => Ok(Facility::Local5),
            "6" => Ok(Facility::Local6),
            "7" => Ok(Facility::Local7),
            _ => anyhow::bail!("Unknown syslog facility '{}', expected d or 0-7", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn code(self) -> u8 {
        match self {
            Severity::Error => 3,
            Severity::Warning => 4,
            Severity::Info => 6,
        }
    }
}

/// Destination of the syslog sink.
pub enum SyslogTarget {
    Socket {
        socket: UnixDatagram,
        facility: Facility,
    },
    /// No syslog daemon reachable; records are routed through tracing.
    Tracing,
    Memory(MemoryLog),
}

impl SyslogTarget {
    /// Connect to the local syslog socket, falling back to tracing output.
    pub fn connect(facility: Facility) -> Self {
        let connected = UnixDatagram::unbound().and_then(|socket| {
            socket.connect(SYSLOG_SOCKET)?;
            Ok(socket)
        });
        match connected {
            Ok(socket) => {
                debug!("Connected to syslog at {}", SYSLOG_SOCKET);
                SyslogTarget::Socket { socket, facility }
            }
            Err(e) => {
                warn!(
                    "Syslog socket {} unavailable ({}), syslog records go to the diagnostic log",
                    SYSLOG_SOCKET, e
                );
                SyslogTarget::Tracing
            }
        }
    }

    pub fn set_facility(&mut self, new_facility: Facility) {
        if let SyslogTarget::Socket { facility, .. } = self {
            *facility = new_facility;
        }
    }

    pub async fn send(&mut self, severity: Severity, message: &str) {
        match self {
            SyslogTarget::Socket { socket, facility } => {
                let datagram = rfc3164(*facility, severity, message);
                if let Err(e) = socket.send(datagram.as_bytes()).await {
                    warn!("Failed to send syslog record: {}", e);
                    log_record(severity, message);
                }
            }
            SyslogTarget::Tracing => log_record(severity, message),
            SyslogTarget::Memory(log) => log.push(message),
        }
    }
}

fn log_record(severity: Severity, message: &str) {
    match severity {
        Severity::Info => info!(target: "trapmux::syslog", "{}", message),
        Severity::Warning | Severity::Error => warn!(target: "trapmux::syslog", "{}", message),
    }
}

fn rfc3164(facility: Facility, severity: Severity, message: &str) -> String {
    let priority = u16::from(facility.code()) * 8 + u16::from(severity.code());
    format!(
        "<{}>{} trapmux[{}]: {}",
        priority,
        Local::now().format("%b %e %H:%M:%S"),
        std::process::id(),
        message.trim_end_matches('\n')
    )
}

/// The sinks' destinations, owned by the dispatcher.
pub struct Outputs {
    pub print: OutputTarget,
    pub syslog: SyslogTarget,
    /// Decoded alarm records; always stdout outside tests.
    pub events: OutputTarget,
}

/// Handles onto the records captured by `Outputs::memory`.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutputs {
    pub print: MemoryLog,
    pub syslog: MemoryLog,
    pub events: MemoryLog,
}

impl Outputs {
    pub fn new(print: OutputTarget, syslog: SyslogTarget) -> Self {
        Self {
            print,
            syslog,
            events: OutputTarget::Stdout,
        }
    }

    /// Capture every sink in memory.
    pub fn memory() -> (Self, MemoryOutputs) {
        let capture = MemoryOutputs::default();
        let outputs = Self {
            print: OutputTarget::Memory(capture.print.clone()),
            syslog: SyslogTarget::Memory(capture.syslog.clone()),
            events: OutputTarget::Memory(capture.events.clone()),
        };
        (outputs, capture)
    }
}

//! trapmux Library
//!
//! An SNMP trap and inform receiver. Messages are decoded by a transport
//! session, normalized to the SNMPv2 binding layout and routed to the print,
//! syslog and event-decode sinks and to external handler commands. Informs
//! are acknowledged once each.
//!
//! Developed by GoCortex.io

pub mod buffer;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod event_decode;
pub mod event_loop;
pub mod format;
pub mod handler;
pub mod inform;
pub mod log_file;
pub mod normalize;
pub mod output;
pub mod reconfig;
pub mod render;
pub mod transport;
pub mod trap;

pub use config::{Config, DaemonConfig};
pub use dispatch::Dispatcher;
pub use event_loop::ControlFlags;
pub use transport::{TcpSession, TransportSession, UdpSession};
pub use trap::TrapEvent;

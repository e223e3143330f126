//! Textual renderings of variable bindings
//!
//! Two renderings exist: the full form used by the print and syslog sinks
//! (`<oid> = <Type>: <value>`) and the quick form fed to external handlers
//! (`<oid> <value>`).
//!
//! Developed by GoCortex.io

use async_snmp::{Value, VarBind};
use std::fmt;

/// Full and quick renderings for values and bindings.
pub trait SnmpText {
    fn write_full(&self, out: &mut impl fmt::Write) -> fmt::Result;

    fn write_quick(&self, out: &mut impl fmt::Write) -> fmt::Result;

    fn full(&self) -> String {
        let mut text = String::new();
        // Writing into a String cannot fail
        let _ = self.write_full(&mut text);
        text
    }

    fn quick(&self) -> String {
        let mut text = String::new();
        let _ = self.write_quick(&mut text);
        text
    }
}

/// Type label used by the full rendering.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Integer(_) => "INTEGER",
        Value::OctetString(data) if is_printable(data) => "STRING",
        Value::OctetString(_) => "Hex-STRING",
        Value::Null => "NULL",
        Value::ObjectIdentifier(_) => "OID",
        Value::IpAddress(_) => "IpAddress",
        Value::Counter32(_) => "Counter32",
        Value::Gauge32(_) => "Gauge32",
        Value::TimeTicks(_) => "Timeticks",
        Value::Opaque(_) => "OPAQUE",
        Value::Counter64(_) => "Counter64",
        Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView => "",
        _ => "Wrong Type",
    }
}

impl SnmpText for Value {
    fn write_full(&self, out: &mut impl fmt::Write) -> fmt::Result {
        match self {
            Value::Null => out.write_str("NULL"),
            Value::NoSuchObject => out.write_str("No Such Object available on this agent at this OID"),
            Value::NoSuchInstance => out.write_str("No Such Instance currently exists at this OID"),
            Value::EndOfMibView => {
                out.write_str("No more variables left in this MIB View (It is past the end of the MIB tree)")
            }
            Value::TimeTicks(ticks) => {
                write!(out, "Timeticks: ({}) {}", ticks, uptime_string(*ticks))
            }
            other => {
                write!(out, "{}: ", type_name(other))?;
                other.write_quick(out)
            }
        }
    }

    fn write_quick(&self, out: &mut impl fmt::Write) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(out, "{}", v),
            Value::OctetString(data) => {
                if is_printable(data) {
                    write!(out, "\"{}\"", String::from_utf8_lossy(data))
                } else {
                    write_hex(out, data)
                }
            }
            Value::Null => out.write_str("NULL"),
            Value::ObjectIdentifier(oid) => write!(out, "{}", oid),
            Value::IpAddress(a) => write!(out, "{}.{}.{}.{}", a[0], a[1], a[2], a[3]),
            Value::Counter32(v) | Value::Gauge32(v) => write!(out, "{}", v),
            Value::TimeTicks(ticks) => out.write_str(&quick_uptime_string(*ticks)),
            Value::Opaque(data) => write_hex(out, data),
            Value::Counter64(v) => write!(out, "{}", v),
            Value::NoSuchObject => out.write_str("noSuchObject"),
            Value::NoSuchInstance => out.write_str("noSuchInstance"),
            Value::EndOfMibView => out.write_str("endOfMibView"),
            Value::Unknown { tag, data } => {
                write!(out, "tag 0x{:02X} ", tag)?;
                write_hex(out, data)
            }
            other => write!(out, "{}", other),
        }
    }
}

impl SnmpText for VarBind {
    fn write_full(&self, out: &mut impl fmt::Write) -> fmt::Result {
        write!(out, "{} = ", self.oid)?;
        self.value.write_full(out)
    }

    fn write_quick(&self, out: &mut impl fmt::Write) -> fmt::Result {
        write!(out, "{} ", self.oid)?;
        self.value.write_quick(out)
    }
}

fn is_printable(data: &[u8]) -> bool {
    std::str::from_utf8(data)
        .map(|s| s.chars().all(|c| !c.is_control() || c == '\n' || c == '\r' || c == '\t'))
        .unwrap_or(false)
}

fn write_hex(out: &mut impl fmt::Write, data: &[u8]) -> fmt::Result {
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.write_char(' ')?;
        }
        write!(out, "{:02X}", byte)?;
    }
    Ok(())
}

/// Render time ticks (hundredths of a second) as `D day(s), H:MM:SS.hh`.
pub fn uptime_string(ticks: u32) -> String {
    let centis = ticks % 100;
    let total_secs = ticks / 100;
    let days = total_secs / 86_400;
    let hours = (total_secs / 3600) % 24;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;

    match days {
        0 => format!("{}:{:02}:{:02}.{:02}", hours, minutes, seconds, centis),
        1 => format!("1 day, {}:{:02}:{:02}.{:02}", hours, minutes, seconds, centis),
        n => format!("{} days, {}:{:02}:{:02}.{:02}", n, hours, minutes, seconds, centis),
    }
}

/// Compact uptime used by the quick rendering: `D:H:MM:SS.hh`.
pub fn quick_uptime_string(ticks: u32) -> String {
    let centis = ticks % 100;
    let total_secs = ticks / 100;
    format!(
        "{}:{}:{:02}:{:02}.{:02}",
        total_secs / 86_400,
        (total_secs / 3600) % 24,
        (total_secs / 60) % 60,
        total_secs % 60,
        centis
    )
}

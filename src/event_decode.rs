//! Threshold-alarm decoding for the event sink
//!
//! Interprets the bindings of a CMU-style RMON alarm notification:
//! sysUpTime, the alarm class OID, a destination variable whose instance
//! carries an IPv4 address, then sample type, value and threshold.
//!
//! Developed by GoCortex.io

use async_snmp::VarBind;
use std::fmt;
use tracing::warn;

use crate::codec::well_known;
use crate::render::SnmpText;

/// Arc offset of the destination address inside the third binding's OID.
const DEST_ADDR_OFFSET: usize = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmEvent {
    /// 1 rising, 2 falling, 3 unavailable, 0 unrecognised.
    pub class: u8,
    pub dest_ip: u32,
    pub sample_type: i32,
    pub value: i32,
    pub threshold: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AlarmDecodeError {
    #[error("alarm needs 6 variable bindings, got {0}")]
    TooFewBindings(usize),
    #[error("destination OID has {0} sub-identifiers, need at least 26")]
    ShortDestination(usize),
    #[error("binding {0} is not an INTEGER")]
    NotInteger(usize),
}

/// Classify an alarm by comparing the whole class OID against each known alarm.
fn classify(binding: &VarBind) -> u8 {
    let Some(oid) = binding.value.as_oid() else {
        return 0;
    };
    if *oid == well_known::rising_alarm() {
        1
    } else if *oid == well_known::falling_alarm() {
        2
    } else if *oid == well_known::unavailable_alarm() {
        3
    } else {
        0
    }
}

pub fn decode_alarm(variables: &[VarBind]) -> Result<AlarmEvent, AlarmDecodeError> {
    if variables.len() < 6 {
        return Err(AlarmDecodeError::TooFewBindings(variables.len()));
    }

    let class = classify(&variables[1]);
    if class == 0 {
        warn!("Unknown alarm event {}", variables[1].value.quick());
    }

    let dest = variables[2].oid.arcs();
    if dest.len() < DEST_ADDR_OFFSET + 4 {
        return Err(AlarmDecodeError::ShortDestination(dest.len()));
    }
    let dest_ip = dest[DEST_ADDR_OFFSET..DEST_ADDR_OFFSET + 4]
        .iter()
        .fold(0u32, |acc, &arc| (acc << 8) | (arc & 0xFF));

    let integer = |index: usize| {
        variables[index]
            .value
            .as_i32()
            .ok_or(AlarmDecodeError::NotInteger(index))
    };

    Ok(AlarmEvent {
        class,
        dest_ip,
        sample_type: integer(3)?,
        value: integer(4)?,
        threshold: integer(5)?,
    })
}

impl fmt::Display for AlarmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: 0x{:02X} {} {} {}",
            self.class, self.dest_ip, self.sample_type, self.value, self.threshold
        )
    }
}

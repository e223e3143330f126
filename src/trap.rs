//! Canonical trap event model
//!
//! Every decoded trap, notification or inform is lifted into a `TrapEvent`
//! before it is normalized and dispatched.
//!
//! Developed by GoCortex.io

use async_snmp::{GenericTrap, Oid, PduType, Value, VarBind, Version};
use bytes::Bytes;
use chrono::{DateTime, Local};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use uuid::Uuid;

use crate::codec::{well_known, Message, PduBody};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapClass {
    LegacyTrap,
    Notification,
    Inform,
}

impl TrapClass {
    pub fn is_legacy(self) -> bool {
        self == TrapClass::LegacyTrap
    }
}

/// Text for a generic-trap kind; values outside RFC 1157 have no kind.
pub fn generic_description(kind: Option<GenericTrap>) -> &'static str {
    match kind {
        Some(GenericTrap::ColdStart) => "Cold Start",
        Some(GenericTrap::WarmStart) => "Warm Start",
        Some(GenericTrap::LinkDown) => "Link Down",
        Some(GenericTrap::LinkUp) => "Link Up",
        Some(GenericTrap::AuthenticationFailure) => "Authentication Failure",
        Some(GenericTrap::EgpNeighborLoss) => "EGP Neighbor Loss",
        Some(GenericTrap::EnterpriseSpecific) => "Enterprise Specific",
        None => "Unknown Type",
    }
}

/// Fields only a v1 Trap-PDU carries.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyTrap {
    pub enterprise: Oid,
    pub agent_addr: Ipv4Addr,
    /// generic-trap exactly as received
    pub generic: i32,
    pub specific: i32,
}

impl LegacyTrap {
    pub fn generic_kind(&self) -> Option<GenericTrap> {
        GenericTrap::from_i32(self.generic)
    }

    pub fn description(&self) -> &'static str {
        generic_description(self.generic_kind())
    }
}

#[derive(Debug, Clone)]
pub struct TrapEvent {
    pub id: Uuid,
    pub received_at: DateTime<Local>,
    pub class: TrapClass,
    pub version: Version,
    pub source: SocketAddr,
    /// Name of the transport source, once resolved.
    pub resolved_host: Option<String>,
    /// Name of the v1 agent-addr, once resolved.
    pub agent_host: Option<String>,
    pub community: Bytes,
    pub sys_uptime: u32,
    pub request_id: i32,
    pub legacy: Option<LegacyTrap>,
    pub variables: Vec<VarBind>,
}

impl TrapEvent {
    /// Lift a decoded message into an event.
    ///
    /// Returns `None` for PDU types the receiver does not act on
    /// (requests, responses, reports).
    pub fn from_message(message: Message, source: SocketAddr, received_at: DateTime<Local>) -> Option<Self> {
        let Message {
            version,
            community,
            body,
        } = message;

        let (class, sys_uptime, request_id, legacy, variables) = match body {
            PduBody::TrapV1(trap) => {
                let legacy = LegacyTrap {
                    enterprise: trap.enterprise,
                    agent_addr: Ipv4Addr::from(trap.agent_addr),
                    generic: trap.generic_trap,
                    specific: trap.specific_trap,
                };
                (TrapClass::LegacyTrap, trap.time_stamp, 0, Some(legacy), trap.varbinds)
            }
            PduBody::Standard(pdu) => {
                let class = match pdu.pdu_type {
                    PduType::TrapV2 => TrapClass::Notification,
                    PduType::InformRequest => TrapClass::Inform,
                    _ => return None,
                };
                let uptime = pdu
                    .varbinds
                    .iter()
                    .find(|vb| vb.oid == well_known::sys_uptime())
                    .and_then(|vb| match vb.value {
                        Value::TimeTicks(ticks) => Some(ticks),
                        _ => None,
                    })
                    .unwrap_or(0);
                (class, uptime, pdu.request_id, None, pdu.varbinds)
            }
        };

        Some(Self {
            id: Uuid::new_v4(),
            received_at,
            class,
            version,
            source,
            resolved_host: None,
            agent_host: None,
            community,
            sys_uptime,
            request_id,
            legacy,
            variables,
        })
    }

    pub fn source_ip(&self) -> IpAddr {
        self.source.ip()
    }

    /// Address the trap claims to originate from: the v1 agent-addr field,
    /// or the transport source for v2 notifications.
    pub fn agent_ip(&self) -> IpAddr {
        match &self.legacy {
            Some(legacy) => IpAddr::V4(legacy.agent_addr),
            None => self.source.ip(),
        }
    }

    /// Resolved host name, or the numeric source address.
    pub fn host_or_ip(&self) -> String {
        self.resolved_host
            .clone()
            .unwrap_or_else(|| self.source.ip().to_string())
    }

    /// Resolved agent name, or the numeric agent address.
    pub fn agent_host_or_ip(&self) -> String {
        self.agent_host
            .clone()
            .unwrap_or_else(|| self.agent_ip().to_string())
    }

    pub fn is_auth_failure(&self) -> bool {
        self.legacy
            .as_ref()
            .is_some_and(|legacy| legacy.generic_kind() == Some(GenericTrap::AuthenticationFailure))
    }

    pub fn community_str(&self) -> String {
        String::from_utf8_lossy(&self.community).into_owned()
    }
}

//! Version-independent view of a trap's variable bindings
//!
//! v1 traps are rewritten into the SNMPv2 binding layout (RFC 3584 3.1):
//! sysUpTime.0, snmpTrapOID.0, the original bindings, then snmpTrapAddress.0,
//! snmpTrapCommunity.0 and snmpTrapEnterprise.0. Notifications and informs
//! already carry that layout and pass through untouched.
//!
//! Developed by GoCortex.io

use async_snmp::{GenericTrap, Oid, Value, VarBind};
use std::borrow::Cow;

use crate::codec::well_known;
use crate::trap::{LegacyTrap, TrapEvent};

/// Normalized bindings plus the OID that identifies the trap.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<'a> {
    pub bindings: Cow<'a, [VarBind]>,
    pub trap_oid: Option<Oid>,
}

pub fn normalize(event: &TrapEvent) -> Normalized<'_> {
    match &event.legacy {
        Some(legacy) => {
            let trap_oid = legacy_trap_oid(legacy);
            let mut bindings = Vec::with_capacity(event.variables.len() + 5);

            bindings.push(VarBind::new(
                well_known::sys_uptime(),
                Value::TimeTicks(event.sys_uptime),
            ));
            // A generic-trap outside RFC 1157 has no identity; the binding
            // still holds its place so the layout stays fixed
            bindings.push(match &trap_oid {
                Some(oid) => VarBind::new(well_known::snmp_trap_oid(), Value::ObjectIdentifier(oid.clone())),
                None => VarBind::null(well_known::snmp_trap_oid()),
            });
            bindings.extend(event.variables.iter().cloned());
            bindings.push(VarBind::new(
                well_known::snmp_trap_address(),
                Value::IpAddress(legacy.agent_addr.octets()),
            ));
            bindings.push(VarBind::new(
                well_known::snmp_trap_community(),
                Value::OctetString(event.community.clone()),
            ));
            bindings.push(VarBind::new(
                well_known::snmp_trap_enterprise(),
                Value::ObjectIdentifier(legacy.enterprise.clone()),
            ));

            Normalized {
                bindings: Cow::Owned(bindings),
                trap_oid,
            }
        }
        None => Normalized {
            bindings: Cow::Borrowed(&event.variables),
            trap_oid: notification_trap_oid(&event.variables),
        },
    }
}

/// snmpTrapOID value for a v1 trap.
///
/// Generic traps map to `snmpTraps.(generic + 1)`. Enterprise-specific traps
/// map to `enterprise.0.specific`, without doubling a trailing zero. A
/// generic-trap value outside 0..=6, or a negative specific-trap, yields
/// `None`.
pub fn legacy_trap_oid(legacy: &LegacyTrap) -> Option<Oid> {
    match legacy.generic_kind()? {
        GenericTrap::EnterpriseSpecific => {
            let specific = u32::try_from(legacy.specific).ok()?;
            let mut arcs = legacy.enterprise.arcs().to_vec();
            if arcs.last() != Some(&0) {
                arcs.push(0);
            }
            arcs.push(specific);
            Some(Oid::new(arcs))
        }
        generic => {
            let arc = u32::try_from(generic.as_i32()).ok()?.checked_add(1)?;
            Some(well_known::snmp_traps().child(arc))
        }
    }
}

/// Value of the first snmpTrapOID.0 binding, when it holds an OID.
pub fn notification_trap_oid(variables: &[VarBind]) -> Option<Oid> {
    let trap_oid = well_known::snmp_trap_oid();
    variables
        .iter()
        .find(|vb| vb.oid == trap_oid)
        .and_then(|vb| vb.value.as_oid())
        .cloned()
}

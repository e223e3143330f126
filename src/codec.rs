//! Community message framing over async-snmp
//!
//! async-snmp owns the BER codec and the PDU, OID and value types. This
//! module only pairs them into the v1/v2c envelope the receiver sees:
//! `SEQUENCE { version INTEGER, community OCTET STRING, pdu PDU }`, where
//! the PDU may be the v1 Trap-PDU that `CommunityMessage` does not carry.
//!
//! Developed by GoCortex.io

use async_snmp::ber::{self, tag, Decoder, EncodeBuf};
use async_snmp::{Pdu, PduType, TrapV1Pdu, VarBind, Version};
use bytes::Bytes;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported SNMP version {0}")]
    UnsupportedVersion(i32),
    #[error("unknown PDU type 0x{0:02X}")]
    UnknownPduType(u8),
    #[error("unexpected tag 0x{actual:02X}, expected 0x{expected:02X}")]
    UnexpectedTag { expected: u8, actual: u8 },
    #[error("message ends before the PDU")]
    MissingPdu,
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl DecodeError {
    fn malformed(e: impl fmt::Display) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum PduBody {
    TrapV1(TrapV1Pdu),
    Standard(Pdu),
}

impl PduBody {
    pub fn pdu_type(&self) -> PduType {
        match self {
            PduBody::TrapV1(_) => PduType::TrapV1,
            PduBody::Standard(pdu) => pdu.pdu_type,
        }
    }

    pub fn varbinds(&self) -> &[VarBind] {
        match self {
            PduBody::TrapV1(trap) => &trap.varbinds,
            PduBody::Standard(pdu) => &pdu.varbinds,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub version: Version,
    pub community: Bytes,
    pub body: PduBody,
}

impl Message {
    pub fn new(version: Version, community: impl Into<Bytes>, body: PduBody) -> Self {
        Self {
            version,
            community: community.into(),
            body,
        }
    }

    pub fn pdu_type(&self) -> PduType {
        self.body.pdu_type()
    }

    pub fn decode(data: Bytes) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(data);
        let mut seq = decoder.read_sequence().map_err(DecodeError::malformed)?;

        let version_num = seq.read_integer().map_err(DecodeError::malformed)?;
        let version = match Version::from_i32(version_num) {
            Some(v @ (Version::V1 | Version::V2c)) => v,
            _ => return Err(DecodeError::UnsupportedVersion(version_num)),
        };
        let community = seq.read_octet_string().map_err(DecodeError::malformed)?;

        let pdu_tag = seq.peek_tag().ok_or(DecodeError::MissingPdu)?;
        let body = match PduType::from_tag(pdu_tag) {
            Some(PduType::TrapV1) => PduBody::TrapV1(TrapV1Pdu::decode(&mut seq).map_err(DecodeError::malformed)?),
            Some(_) => PduBody::Standard(Pdu::decode(&mut seq).map_err(DecodeError::malformed)?),
            None => return Err(DecodeError::UnknownPduType(pdu_tag)),
        };

        Ok(Self {
            version,
            community,
            body,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = EncodeBuf::new();
        buf.push_sequence(|buf| {
            match &self.body {
                PduBody::TrapV1(trap) => trap.encode(buf),
                PduBody::Standard(pdu) => pdu.encode(buf),
            }
            buf.push_octet_string(&self.community);
            buf.push_integer(self.version.as_i32());
        });
        buf.finish()
    }
}

/// Total size of the message whose first bytes are in `header`.
///
/// Returns `Ok(None)` until the tag and every length octet are present.
/// Used to frame messages on stream transports.
pub fn message_length(header: &[u8]) -> Result<Option<usize>, DecodeError> {
    let Some(&first) = header.first() else {
        return Ok(None);
    };
    if first != tag::universal::SEQUENCE {
        return Err(DecodeError::UnexpectedTag {
            expected: tag::universal::SEQUENCE,
            actual: first,
        });
    }
    let Some(&len_byte) = header.get(1) else {
        return Ok(None);
    };
    let long_octets = if len_byte & 0x80 == 0 { 0 } else { usize::from(len_byte & 0x7F) };
    if long_octets <= 4 && header.len() < 2 + long_octets {
        return Ok(None);
    }

    let (len, consumed) = ber::decode_length(&header[1..], 1, None).map_err(DecodeError::malformed)?;
    Ok(Some(1 + consumed + len))
}

/// Well-known OIDs used when normalizing and dispatching traps.
pub mod well_known {
    use async_snmp::{oid, Oid};

    /// sysUpTime.0
    pub fn sys_uptime() -> Oid {
        oid!(1, 3, 6, 1, 2, 1, 1, 3, 0)
    }

    /// snmpTrapOID.0
    pub fn snmp_trap_oid() -> Oid {
        oid!(1, 3, 6, 1, 6, 3, 1, 1, 4, 1, 0)
    }

    /// snmpTrapEnterprise.0
    pub fn snmp_trap_enterprise() -> Oid {
        oid!(1, 3, 6, 1, 6, 3, 1, 1, 4, 3, 0)
    }

    /// snmpTrapAddress.0 (RFC 3584)
    pub fn snmp_trap_address() -> Oid {
        oid!(1, 3, 6, 1, 6, 3, 18, 1, 3, 0)
    }

    /// snmpTrapCommunity.0 (RFC 3584)
    pub fn snmp_trap_community() -> Oid {
        oid!(1, 3, 6, 1, 6, 3, 18, 1, 4, 0)
    }

    /// snmpTraps, the parent of the generic trap OIDs
    pub fn snmp_traps() -> Oid {
        oid!(1, 3, 6, 1, 6, 3, 1, 1, 5)
    }

    pub fn rising_alarm() -> Oid {
        oid!(1, 3, 6, 1, 6, 3, 2, 1, 1, 3, 1)
    }

    pub fn falling_alarm() -> Oid {
        oid!(1, 3, 6, 1, 6, 3, 2, 1, 1, 3, 2)
    }

    pub fn unavailable_alarm() -> Oid {
        oid!(1, 3, 6, 1, 6, 3, 2, 1, 1, 3, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_snmp::{Oid, Value};

    // v1 Trap-PDU from 10.0.0.1, enterprise 1.3.6.1.4.1.9, enterpriseSpecific/7,
    // uptime 1234, one binding sysName.0 = "r1"
    const V1_TRAP: [u8; 57] = [
        0x30, 0x37, 0x02, 0x01, 0x00, 0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', 0xA4,
        0x2A, 0x06, 0x06, 0x2B, 0x06, 0x01, 0x04, 0x01, 0x09, 0x40, 0x04, 0x0A, 0x00, 0x00,
        0x01, 0x02, 0x01, 0x06, 0x02, 0x01, 0x07, 0x43, 0x02, 0x04, 0xD2, 0x30, 0x10, 0x30,
        0x0E, 0x06, 0x08, 0x2B, 0x06, 0x01, 0x02, 0x01, 0x01, 0x05, 0x00, 0x04, 0x02, 0x72,
        0x31,
    ];

    #[test]
    fn test_decode_v1_trap() {
        let msg = Message::decode(Bytes::from_static(&V1_TRAP)).unwrap();
        assert_eq!(msg.version, Version::V1);
        assert_eq!(&msg.community[..], b"public");

        let PduBody::TrapV1(trap) = &msg.body else {
            panic!("expected a v1 trap, got {:?}", msg.body);
        };
        assert_eq!(trap.enterprise, Oid::parse("1.3.6.1.4.1.9").unwrap());
        assert_eq!(trap.agent_addr, [10, 0, 0, 1]);
        assert_eq!(trap.generic_trap, 6);
        assert_eq!(trap.specific_trap, 7);
        assert_eq!(trap.time_stamp, 1234);
        assert_eq!(
            trap.varbinds,
            vec![VarBind::new(
                Oid::parse("1.3.6.1.2.1.1.5.0").unwrap(),
                Value::OctetString(Bytes::from_static(b"r1"))
            )]
        );
    }

    #[test]
    fn test_v1_trap_encodes_to_wire_bytes() {
        let msg = Message::decode(Bytes::from_static(&V1_TRAP)).unwrap();
        assert_eq!(&msg.encode()[..], &V1_TRAP[..]);
    }

    #[test]
    fn test_inform_keeps_request_id() {
        let msg = Message::new(
            Version::V2c,
            Bytes::from_static(b"private"),
            PduBody::Standard(Pdu {
                pdu_type: PduType::InformRequest,
                request_id: -559038737,
                error_status: 0,
                error_index: 0,
                varbinds: vec![VarBind::new(well_known::sys_uptime(), Value::TimeTicks(u32::MAX))],
            }),
        );
        let decoded = Message::decode(msg.encode()).unwrap();
        assert_eq!(decoded.pdu_type(), PduType::InformRequest);
        let PduBody::Standard(pdu) = &decoded.body else {
            panic!("expected a standard PDU");
        };
        assert_eq!(pdu.request_id, -559038737);
        assert_eq!(decoded.body.varbinds(), msg.body.varbinds());
    }

    #[test]
    fn test_rejects_v3() {
        let mut data = V1_TRAP;
        data[4] = 3;
        assert_eq!(
            Message::decode(Bytes::copy_from_slice(&data)).unwrap_err(),
            DecodeError::UnsupportedVersion(3)
        );
    }

    #[test]
    fn test_rejects_unknown_pdu_tag() {
        let mut data = V1_TRAP;
        data[13] = 0xAF;
        assert_eq!(
            Message::decode(Bytes::copy_from_slice(&data)).unwrap_err(),
            DecodeError::UnknownPduType(0xAF)
        );
    }

    #[test]
    fn test_truncated_message() {
        let err = Message::decode(Bytes::copy_from_slice(&V1_TRAP[..40])).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn test_message_length_framing() {
        assert_eq!(message_length(&[]), Ok(None));
        assert_eq!(message_length(&V1_TRAP[..1]), Ok(None));
        assert_eq!(message_length(&V1_TRAP[..2]), Ok(Some(57)));
        assert_eq!(message_length(&[0x30, 0x82, 0x01]), Ok(None));
        assert_eq!(message_length(&[0x30, 0x82, 0x01, 0x00]), Ok(Some(260)));
        assert_eq!(
            message_length(&[0x02, 0x01]),
            Err(DecodeError::UnexpectedTag {
                expected: 0x30,
                actual: 0x02
            })
        );
        assert!(matches!(message_length(&[0x30, 0x80]), Err(DecodeError::Malformed(_))));
    }
}

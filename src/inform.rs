//! Inform acknowledgement
//!
//! Every inform gets exactly one Response back to its sender: same request
//! id, same bindings, error status and index cleared. A failed send is
//! logged and never retried.
//!
//! Developed by GoCortex.io

use async_snmp::{Pdu, PduType};
use tracing::{debug, error};

use crate::codec::{Message, PduBody};
use crate::transport::{Peer, TransportSession};
use crate::trap::TrapEvent;

pub fn build_response(event: &TrapEvent) -> Message {
    Message::new(
        event.version,
        event.community.clone(),
        PduBody::Standard(Pdu {
            pdu_type: PduType::Response,
            request_id: event.request_id,
            error_status: 0,
            error_index: 0,
            varbinds: event.variables.clone(),
        }),
    )
}

/// Send the acknowledgement for `event` to `peer`. Returns whether it went out.
pub async fn acknowledge<S: TransportSession>(session: &mut S, event: &TrapEvent, peer: &Peer) -> bool {
    let response = build_response(event);
    match session.send(&response, peer).await {
        Ok(()) => {
            debug!(
                "Acknowledged inform {} (request id {}) from {}",
                event.id,
                event.request_id,
                peer.addr()
            );
            true
        }
        Err(e) => {
            error!("Couldn't respond to inform from {}: {}", peer.addr(), e);
            false
        }
    }
}
